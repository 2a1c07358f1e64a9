//! Perturbed variants of a face crop.
//!
//! A batch always starts with the untouched crop, followed by variants drawn
//! round-robin from four families: horizontal flip, small-angle rotation,
//! brightness/contrast shift and Gaussian pixel noise. Rotation replicates
//! edge pixels so no black borders leak into the embedder.

use image::imageops::{self, colorops};
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;

const DETERMINISTIC_ROTATION_DEG: f32 = 8.0;
const DETERMINISTIC_BRIGHTNESS: i32 = 25;
const FAMILY_COUNT: usize = 4;

/// One perturbation applied to a variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    Identity,
    FlipHorizontal,
    Rotate { degrees: f32 },
    Photometric { brightness: i32, contrast: f32 },
    GaussianNoise { sigma: f32 },
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => write!(f, "identity"),
            Self::FlipHorizontal => write!(f, "flip"),
            Self::Rotate { degrees } => write!(f, "rotate({degrees:+.1})"),
            Self::Photometric { brightness, contrast } => {
                write!(f, "photometric({brightness:+},{contrast:+.2})")
            }
            Self::GaussianNoise { sigma } => write!(f, "noise({sigma:.1})"),
        }
    }
}

/// An augmented copy of the face crop plus its provenance.
#[derive(Debug, Clone)]
pub struct Variant {
    pub image: RgbImage,
    pub transforms: Vec<Transform>,
}

impl Variant {
    /// Provenance label, e.g. `"flip+rotate(-4.2)"`.
    pub fn label(&self) -> String {
        self.transforms
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("+")
    }
}

/// Perturbation magnitudes for the randomized batch.
#[derive(Debug, Clone)]
pub struct AugmentConfig {
    pub max_rotation_deg: f32,
    /// Additive luma shift bound, in 8-bit levels.
    pub max_brightness: i32,
    /// Contrast change bound, in percent (image::imageops::contrast units).
    pub max_contrast: f32,
    pub max_noise_sigma: f32,
    /// Probability that a non-flip variant is additionally mirrored.
    pub flip_probability: f64,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            max_rotation_deg: 10.0,
            max_brightness: 30,
            max_contrast: 20.0,
            max_noise_sigma: 8.0,
            flip_probability: 0.5,
        }
    }
}

/// Randomized variant generator.
///
/// With a seed the batch is reproducible; without one it draws from OS entropy.
pub struct Augmenter {
    config: AugmentConfig,
    rng: StdRng,
}

impl Augmenter {
    pub fn new(config: AugmentConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    /// Produce exactly `count.max(1)` variants; the first is always the
    /// unmodified crop.
    pub fn generate(&mut self, crop: &RgbImage, count: usize) -> Vec<Variant> {
        let count = count.max(1);
        let mut batch = Vec::with_capacity(count);
        batch.push(Variant {
            image: crop.clone(),
            transforms: vec![Transform::Identity],
        });
        for i in 1..count {
            batch.push(self.variant(crop, (i - 1) % FAMILY_COUNT));
        }
        batch
    }

    fn variant(&mut self, crop: &RgbImage, family: usize) -> Variant {
        let c = &self.config;
        let transform = match family {
            0 => Transform::FlipHorizontal,
            1 => Transform::Rotate {
                degrees: self.rng.gen_range(-c.max_rotation_deg..=c.max_rotation_deg),
            },
            2 => Transform::Photometric {
                brightness: self.rng.gen_range(-c.max_brightness..=c.max_brightness),
                contrast: self.rng.gen_range(-c.max_contrast..=c.max_contrast),
            },
            _ => Transform::GaussianNoise {
                sigma: self.rng.gen_range(1.0..=c.max_noise_sigma.max(1.0)),
            },
        };

        let mut transforms = Vec::with_capacity(2);
        let base = if transform != Transform::FlipHorizontal
            && self.rng.gen_bool(self.config.flip_probability)
        {
            transforms.push(Transform::FlipHorizontal);
            imageops::flip_horizontal(crop)
        } else {
            crop.clone()
        };

        let noise_seed = self.rng.gen::<u64>();
        transforms.push(transform);
        Variant {
            image: apply(&base, transform, noise_seed),
            transforms,
        }
    }
}

/// Fixed six-variant batch used by the deterministic strategy.
pub fn deterministic_batch(crop: &RgbImage) -> Vec<Variant> {
    [
        Transform::Identity,
        Transform::FlipHorizontal,
        Transform::Rotate { degrees: DETERMINISTIC_ROTATION_DEG },
        Transform::Rotate { degrees: -DETERMINISTIC_ROTATION_DEG },
        Transform::Photometric { brightness: DETERMINISTIC_BRIGHTNESS, contrast: 0.0 },
        Transform::Photometric { brightness: -DETERMINISTIC_BRIGHTNESS, contrast: 0.0 },
    ]
    .into_iter()
    .map(|t| Variant {
        image: apply(crop, t, 0),
        transforms: vec![t],
    })
    .collect()
}

/// Apply a single transform. `noise_seed` is only read by `GaussianNoise`.
pub fn apply(image: &RgbImage, transform: Transform, noise_seed: u64) -> RgbImage {
    match transform {
        Transform::Identity => image.clone(),
        Transform::FlipHorizontal => imageops::flip_horizontal(image),
        Transform::Rotate { degrees } => rotate_replicate(image, degrees),
        Transform::Photometric { brightness, contrast } => {
            let shifted = colorops::brighten(image, brightness);
            if contrast.abs() > f32::EPSILON {
                colorops::contrast(&shifted, contrast)
            } else {
                shifted
            }
        }
        Transform::GaussianNoise { sigma } => {
            imageproc::noise::gaussian_noise(image, 0.0, sigma as f64, noise_seed)
        }
    }
}

/// Rotate about the image center.
///
/// Inverse-maps every output pixel into the source and samples bilinearly,
/// clamping coordinates to the border so edges are replicated.
fn rotate_replicate(image: &RgbImage, degrees: f32) -> RgbImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return image.clone();
    }

    let (sin, cos) = degrees.to_radians().sin_cos();
    let cx = (w as f32 - 1.0) / 2.0;
    let cy = (h as f32 - 1.0) / 2.0;
    let max_x = (w - 1) as f32;
    let max_y = (h - 1) as f32;

    RgbImage::from_fn(w, h, |ox, oy| {
        let u = ox as f32 - cx;
        let v = oy as f32 - cy;
        let sx = (cos * u + sin * v + cx).clamp(0.0, max_x);
        let sy = (-sin * u + cos * v + cy).clamp(0.0, max_y);

        let x0 = sx.floor() as u32;
        let y0 = sy.floor() as u32;
        let x1 = (x0 + 1).min(w - 1);
        let y1 = (y0 + 1).min(h - 1);
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let tl = image.get_pixel(x0, y0);
        let tr = image.get_pixel(x1, y0);
        let bl = image.get_pixel(x0, y1);
        let br = image.get_pixel(x1, y1);

        let mut out = [0u8; 3];
        for c in 0..3 {
            let val = tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
                + tr[c] as f32 * fx * (1.0 - fy)
                + bl[c] as f32 * (1.0 - fx) * fy
                + br[c] as f32 * fx * fy;
            out[c] = val.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(out)
    })
}

//! Brightness and sharpness heuristics for face crops.
//!
//! Brightness is the mean luma. Sharpness is the variance of the
//! Laplacian-filtered luma: flat or blurred crops carry little
//! high-frequency energy and score low.

use crate::types::QualityMetrics;
use image::{GrayImage, RgbImage};
use imageproc::filter::laplacian_filter;

/// Score one image. An empty image scores zero on both axes.
pub fn score(image: &RgbImage) -> QualityMetrics {
    let gray = image::imageops::grayscale(image);
    QualityMetrics {
        brightness: mean_luma(&gray),
        sharpness: laplacian_variance(&gray),
    }
}

fn mean_luma(gray: &GrayImage) -> f32 {
    let n = gray.as_raw().len();
    if n == 0 {
        return 0.0;
    }
    let sum: u64 = gray.as_raw().iter().map(|&p| p as u64).sum();
    (sum as f64 / n as f64) as f32
}

fn laplacian_variance(gray: &GrayImage) -> f32 {
    if gray.width() == 0 || gray.height() == 0 {
        return 0.0;
    }
    let lap = laplacian_filter(gray);
    let n = lap.as_raw().len() as f64;
    let mean = lap.as_raw().iter().map(|&v| v as f64).sum::<f64>() / n;
    let variance = lap
        .as_raw()
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    variance.max(0.0) as f32
}

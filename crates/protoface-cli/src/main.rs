use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use image::imageops::{self, FilterType};
use protoface_core::aggregate::{quality_weights, uniform_weights};
use protoface_core::augment::{deterministic_batch, AugmentConfig, Augmenter};
use protoface_core::crop::{crop_face, select_face};
use protoface_core::recognizer::ARCFACE_INPUT_SIZE;
use protoface_core::{quality, Detector, EnrollConfig, FaceDetector, Strategy};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.protoface.Enroll1",
    default_service = "org.protoface.Enroll1",
    default_path = "/org/protoface/Enroll1"
)]
trait Enroll1 {
    fn enroll(&self, subject: &str, image: &[u8]) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "protoface", about = "protoface enrollment CLI")]
struct Cli {
    /// Talk to the daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a subject from one photo
    Enroll {
        /// Subject identifier the prototype is stored under
        #[arg(short, long)]
        subject: String,
        /// Path to a JPEG or PNG photo
        image: PathBuf,
    },
    /// Show daemon status
    Status,
    /// Generate augmentation variants locally and print their quality weights
    Inspect {
        /// Path to a JPEG or PNG photo
        image: PathBuf,
        /// Number of variants for the statistical strategy
        #[arg(short, long, default_value_t = 25)]
        count: usize,
        /// Fixed augmentation seed
        #[arg(long)]
        seed: Option<u64>,
        /// statistical or deterministic
        #[arg(long, default_value = "statistical")]
        strategy: Strategy,
        /// Directory holding the detector model; without it the whole photo is used as the face
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
}

async fn connect(session: bool) -> Result<Enroll1Proxy<'static>> {
    let conn = if session {
        zbus::Connection::session().await?
    } else {
        zbus::Connection::system().await?
    };
    Enroll1Proxy::new(&conn)
        .await
        .context("protofaced is not reachable on the bus")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { subject, image } => {
            let bytes = std::fs::read(&image).with_context(|| format!("reading {}", image.display()))?;
            let proxy = connect(cli.session).await?;
            let reply = proxy.enroll(&subject, &bytes).await?;
            print_json(&reply)?;
        }
        Commands::Status => {
            let proxy = connect(cli.session).await?;
            print_json(&proxy.status().await?)?;
        }
        Commands::Inspect {
            image,
            count,
            seed,
            strategy,
            model_dir,
        } => {
            let report = inspect(&image, count, seed, strategy, model_dir)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Run the pre-embedding half of enrollment and report per-variant quality.
fn inspect(
    path: &Path,
    count: usize,
    seed: Option<u64>,
    strategy: Strategy,
    model_dir: Option<PathBuf>,
) -> Result<serde_json::Value> {
    let photo = image::open(path)
        .with_context(|| format!("decoding {}", path.display()))?
        .to_rgb8();
    let defaults = EnrollConfig::default();

    let (face, confidence) = match model_dir {
        Some(dir) => {
            let model = dir.join(protoface_core::DETECTOR_MODEL_FILE);
            let mut detector =
                FaceDetector::load(&model.to_string_lossy())?.with_score_threshold(defaults.min_confidence);
            let detections = detector.detect(&photo)?;
            let best = select_face(&detections, defaults.min_confidence)
                .with_context(|| format!("no face at confidence >= {}", defaults.min_confidence))?;
            (crop_face(&photo, best, defaults.crop_margin)?, Some(best.confidence))
        }
        None => (photo, None),
    };

    let variants = match strategy {
        Strategy::Statistical => Augmenter::new(AugmentConfig::default(), seed).generate(&face, count),
        Strategy::Deterministic => deterministic_batch(&face),
    };

    let metrics: Vec<_> = variants
        .iter()
        .map(|v| {
            let input = imageops::resize(&v.image, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle);
            quality::score(&input)
        })
        .collect();
    let weights = match strategy {
        Strategy::Statistical => quality_weights(&metrics),
        Strategy::Deterministic => uniform_weights(metrics.len()),
    };

    let rows: Vec<_> = variants
        .iter()
        .zip(metrics.iter().zip(weights.iter()))
        .map(|(v, (m, w))| {
            serde_json::json!({
                "transforms": v.label(),
                "brightness": m.brightness,
                "sharpness": m.sharpness,
                "weight": w,
            })
        })
        .collect();

    Ok(serde_json::json!({
        "image": path.display().to_string(),
        "face": { "width": face.width(), "height": face.height(), "confidence": confidence },
        "strategy": strategy,
        "variants": rows,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_photo(name: &str) -> PathBuf {
        let img = image::RgbImage::from_fn(80, 80, |x, y| image::Rgb([(x * 3) as u8, (y * 3) as u8, 90]));
        let path = std::env::temp_dir().join(format!("protoface-{}-{name}.png", std::process::id()));
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_inspect_statistical_weights_sum_to_one() {
        let path = write_photo("stat");
        let report = inspect(&path, 10, Some(3), Strategy::Statistical, None).unwrap();
        std::fs::remove_file(&path).ok();

        let variants = report["variants"].as_array().unwrap();
        assert_eq!(variants.len(), 10);
        assert_eq!(variants[0]["transforms"], "identity");
        let total: f64 = variants.iter().map(|v| v["weight"].as_f64().unwrap()).sum();
        assert!((total - 1.0).abs() < 1e-4, "weights sum to {total}");
    }

    #[test]
    fn test_inspect_deterministic_uniform() {
        let path = write_photo("det");
        let report = inspect(&path, 25, None, Strategy::Deterministic, None).unwrap();
        std::fs::remove_file(&path).ok();

        let variants = report["variants"].as_array().unwrap();
        assert_eq!(variants.len(), 6);
        for v in variants {
            assert!((v["weight"].as_f64().unwrap() - 1.0 / 6.0).abs() < 1e-5);
        }
        assert_eq!(report["strategy"], "deterministic");
    }
}

//! protoface-core — Enrollment prototype synthesis.
//!
//! Turns a single face photo into one quality-weighted, outlier-filtered,
//! unit-length identity vector. SCRFD detection and ArcFace embedding run via
//! ONNX Runtime; both sit behind traits so any backend can be injected.

pub mod aggregate;
pub mod augment;
pub mod consistency;
pub mod crop;
pub mod detector;
pub mod enroll;
pub mod quality;
pub mod recognizer;
pub mod types;

pub use detector::FaceDetector;
pub use enroll::{
    Detector, EmbedError, Embedder, EnrollConfig, EnrollError, EnrollOutcome, Enroller, Stage,
    StoreError, VectorStore,
};
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, Embedding, EnrollmentRecord, QualityMetrics, Strategy};

/// SCRFD detection model file name.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// System-wide model directory used when none is configured.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/protoface/models")
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in source-image pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Euclidean norm of the vector.
    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }
}

/// Euclidean norm, accumulated in f64 so long vectors stay precise.
pub fn l2_norm(values: &[f32]) -> f32 {
    values
        .iter()
        .map(|&v| (v as f64) * (v as f64))
        .sum::<f64>()
        .sqrt() as f32
}

/// Scale `values` to unit length.
///
/// Returns `None` for a zero, empty, or non-finite vector: such a vector has
/// no direction and cannot represent an identity.
pub fn l2_normalize(values: &[f32]) -> Option<Vec<f32>> {
    if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let norm = l2_norm(values);
    if !norm.is_finite() || norm <= f32::EPSILON {
        return None;
    }
    Some(values.iter().map(|v| v / norm).collect())
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Image-quality heuristics for one variant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Mean luma, 0.0–255.0.
    pub brightness: f32,
    /// Variance of the Laplacian-filtered luma.
    pub sharpness: f32,
}

/// Which synthesis path produced a prototype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Randomized batch, consistency filtering, quality-weighted merge.
    #[default]
    Statistical,
    /// Fixed six-variant batch, no filtering, uniform weights.
    Deterministic,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "statistical" => Ok(Self::Statistical),
            "deterministic" => Ok(Self::Deterministic),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Statistical => "statistical",
            Self::Deterministic => "deterministic",
        })
    }
}

/// Metadata published alongside a prototype embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub subject_id: String,
    pub enrolled_at: DateTime<Utc>,
    pub model_version: Option<String>,
    pub strategy: Strategy,
    pub variants_generated: usize,
    pub variants_kept: usize,
    pub detection_confidence: f32,
}

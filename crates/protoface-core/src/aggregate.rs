//! Quality-weighted merge of retained embeddings into one prototype.
//!
//! Brightness and sharpness are each rescaled against their own 5th–95th
//! percentile band, averaged into a per-variant weight, and the weights are
//! normalized to sum to one. The prototype is the L2-normalized weighted sum.

use crate::types::{l2_normalize, QualityMetrics};
use thiserror::Error;

const LOW_PERCENTILE: f32 = 5.0;
const HIGH_PERCENTILE: f32 = 95.0;
const BRIGHTNESS_WEIGHT: f32 = 0.5;
const SHARPNESS_WEIGHT: f32 = 0.5;
const MIN_WEIGHT_SUM: f32 = 1e-9;

#[derive(Error, Debug, PartialEq)]
pub enum AggregateError {
    #[error("no vectors to aggregate")]
    Empty,
    #[error("{vectors} vectors but {weights} weights")]
    LengthMismatch { vectors: usize, weights: usize },
    #[error("weighted sum has zero or non-finite norm")]
    Degenerate,
}

/// Per-variant weights from brightness and sharpness.
///
/// Always non-negative and summing to one for a non-empty input.
pub fn quality_weights(metrics: &[QualityMetrics]) -> Vec<f32> {
    let brightness: Vec<f32> = metrics.iter().map(|m| m.brightness).collect();
    let sharpness: Vec<f32> = metrics.iter().map(|m| m.sharpness).collect();
    let nb = percentile_normalize(&brightness);
    let ns = percentile_normalize(&sharpness);

    let raw: Vec<f32> = nb
        .iter()
        .zip(ns.iter())
        .map(|(b, s)| BRIGHTNESS_WEIGHT * b + SHARPNESS_WEIGHT * s)
        .collect();
    normalize_weights(raw)
}

/// Equal weights, used by the deterministic strategy.
pub fn uniform_weights(n: usize) -> Vec<f32> {
    vec![1.0 / n.max(1) as f32; n]
}

/// Weighted sum of `vectors`, L2-normalized.
pub fn weighted_prototype(vectors: &[Vec<f32>], weights: &[f32]) -> Result<Vec<f32>, AggregateError> {
    if vectors.is_empty() {
        return Err(AggregateError::Empty);
    }
    if vectors.len() != weights.len() {
        return Err(AggregateError::LengthMismatch {
            vectors: vectors.len(),
            weights: weights.len(),
        });
    }

    let dim = vectors[0].len();
    let mut sum = vec![0.0f32; dim];
    for (v, &w) in vectors.iter().zip(weights.iter()) {
        for (acc, x) in sum.iter_mut().zip(v.iter()) {
            *acc += w * x;
        }
    }

    l2_normalize(&sum).ok_or(AggregateError::Degenerate)
}

/// Rescale into [0, 1] against the p5–p95 band. A flat signal maps to all ones.
fn percentile_normalize(values: &[f32]) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    let lo = percentile(&sorted, LOW_PERCENTILE);
    let hi = percentile(&sorted, HIGH_PERCENTILE);

    if hi <= lo {
        return vec![1.0; values.len()];
    }
    let span = hi - lo;
    values
        .iter()
        .map(|&x| ((x - lo) / span).clamp(0.0, 1.0))
        .collect()
}

/// Linear-interpolated percentile over ascending `sorted` values.
fn percentile(sorted: &[f32], p: f32) -> f32 {
    let last = sorted.len() - 1;
    let rank = (p / 100.0).clamp(0.0, 1.0) * last as f32;
    let below = rank.floor() as usize;
    let above = (below + 1).min(last);
    let frac = rank - below as f32;
    sorted[below] + (sorted[above] - sorted[below]) * frac
}

fn normalize_weights(mut weights: Vec<f32>) -> Vec<f32> {
    let sum: f32 = weights.iter().sum();
    if sum.is_nan() || sum <= MIN_WEIGHT_SUM {
        return uniform_weights(weights.len());
    }
    weights.iter_mut().for_each(|w| *w /= sum);
    weights
}

//! Outlier rejection against the batch centroid.
//!
//! Each unit vector is scored by cosine similarity to the normalized batch
//! mean. Vectors scoring below `max(mean - k·stddev, hard_floor)` are
//! rejected. If that rejects everything, the `min_keep` most similar vectors
//! survive instead, so a non-empty batch never filters down to nothing.

use crate::types::{dot, l2_normalize};

/// Below this cosine similarity a variant is never treated as the same identity.
pub const HARD_FLOOR: f32 = 0.55;
/// Survivors kept when the threshold rejects the whole batch.
pub const MIN_KEEP: usize = 5;
const SIGMA_MULTIPLIER: f32 = 2.0;

#[derive(Debug, Clone)]
pub struct ConsistencyConfig {
    pub sigma_multiplier: f32,
    pub hard_floor: f32,
    pub min_keep: usize,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            sigma_multiplier: SIGMA_MULTIPLIER,
            hard_floor: HARD_FLOOR,
            min_keep: MIN_KEEP,
        }
    }
}

/// Filter decision for one batch.
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    /// Indices into the input batch, ascending.
    pub kept: Vec<usize>,
    /// Similarity of every input vector to the batch centroid.
    pub similarities: Vec<f32>,
    pub threshold: f32,
    /// True when the threshold rejected everything and the top-`min_keep`
    /// fallback decided the keep-set.
    pub used_fallback: bool,
}

/// Run the consistency filter over L2-normalized vectors of equal length.
///
/// An empty batch yields an empty outcome; any non-empty batch keeps at least
/// one vector.
pub fn filter(vectors: &[Vec<f32>], config: &ConsistencyConfig) -> FilterOutcome {
    if vectors.is_empty() {
        return FilterOutcome {
            kept: Vec::new(),
            similarities: Vec::new(),
            threshold: config.hard_floor,
            used_fallback: false,
        };
    }

    let similarities = match centroid(vectors) {
        Some(c0) => vectors.iter().map(|v| dot(v, &c0)).collect::<Vec<_>>(),
        // Vectors cancel out exactly: no central tendency to agree with.
        None => vec![0.0; vectors.len()],
    };

    let n = similarities.len() as f32;
    let mu = similarities.iter().sum::<f32>() / n;
    let sigma = (similarities.iter().map(|s| (s - mu).powi(2)).sum::<f32>() / n).sqrt();
    let threshold = (mu - config.sigma_multiplier * sigma).max(config.hard_floor);

    let kept: Vec<usize> = similarities
        .iter()
        .enumerate()
        .filter(|(_, s)| **s >= threshold)
        .map(|(i, _)| i)
        .collect();

    if !kept.is_empty() {
        tracing::debug!(
            batch = vectors.len(),
            kept = kept.len(),
            mu,
            sigma,
            threshold,
            "consistency filter applied"
        );
        return FilterOutcome { kept, similarities, threshold, used_fallback: false };
    }

    let kept = top_k(&similarities, config.min_keep.max(1));
    tracing::warn!(
        batch = vectors.len(),
        kept = kept.len(),
        mu,
        threshold,
        "all variants below consistency threshold; keeping most similar"
    );
    FilterOutcome { kept, similarities, threshold, used_fallback: true }
}

/// L2-normalized mean of the batch.
fn centroid(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let dim = vectors.first()?.len();
    let mut sum = vec![0.0f32; dim];
    for v in vectors {
        for (acc, x) in sum.iter_mut().zip(v.iter()) {
            *acc += x;
        }
    }
    let n = vectors.len() as f32;
    sum.iter_mut().for_each(|x| *x /= n);
    l2_normalize(&sum)
}

/// Indices of the `k` highest similarities, returned ascending.
fn top_k(similarities: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..similarities.len()).collect();
    order.sort_by(|&a, &b| similarities[b].total_cmp(&similarities[a]));
    order.truncate(k);
    order.sort_unstable();
    order
}

//! Enrollment orchestration.
//!
//! Turns one photo into one prototype embedding:
//! decode → detect → crop → augment → embed → filter → aggregate → publish.
//! Every stage either hands its output to the next or aborts the whole
//! enrollment with an [`EnrollError`]; nothing is retried and nothing is
//! persisted unless the final publish succeeds.

use crate::aggregate::{quality_weights, uniform_weights, weighted_prototype, AggregateError};
use crate::augment::{deterministic_batch, AugmentConfig, Augmenter, Variant};
use crate::consistency::{self, ConsistencyConfig};
use crate::crop::{crop_face, select_face, CropError};
use crate::detector::DetectorError;
use crate::quality;
use crate::recognizer::{ARCFACE_EMBEDDING_DIM, ARCFACE_INPUT_SIZE};
use crate::types::{l2_normalize, BoundingBox, Embedding, EnrollmentRecord, QualityMetrics, Strategy};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::fmt;
use thiserror::Error;

/// Finds faces in a decoded image.
pub trait Detector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Maps a square face image to a fixed-length vector.
pub trait Embedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, EmbedError>;

    fn model_version(&self) -> Option<&str> {
        None
    }
}

/// Persists prototypes keyed by id.
pub trait VectorStore {
    fn upsert(&mut self, id: &str, vector: &[f32], payload: &EnrollmentRecord) -> Result<(), StoreError>;
}

impl<T: Detector + ?Sized> Detector for &mut T {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        (**self).detect(image)
    }
}

impl<T: Embedder + ?Sized> Embedder for &mut T {
    fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, EmbedError> {
        (**self).embed(face)
    }

    fn model_version(&self) -> Option<&str> {
        (**self).model_version()
    }
}

impl<T: VectorStore + ?Sized> VectorStore for &mut T {
    fn upsert(&mut self, id: &str, vector: &[f32], payload: &EnrollmentRecord) -> Result<(), StoreError> {
        (**self).upsert(id, vector, payload)
    }
}

/// Why a single variant produced no usable vector.
#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("embedder failed: {0}")]
    Failed(String),
    #[error("expected {expected}-dim vector, got {actual}")]
    WrongDimension { expected: usize, actual: usize },
    #[error("vector has zero or non-finite norm")]
    InvalidVector,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("vector store timed out")]
    Timeout,
    #[error("vector store rejected the record: {0}")]
    Rejected(String),
    #[error("vector store unavailable: {0}")]
    Unavailable(String),
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decoding,
    Detecting,
    Cropping,
    Augmenting,
    Embedding,
    Filtering,
    Aggregating,
    Publishing,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Decoding => "decoding",
            Self::Detecting => "detecting",
            Self::Cropping => "cropping",
            Self::Augmenting => "augmenting",
            Self::Embedding => "embedding",
            Self::Filtering => "filtering",
            Self::Aggregating => "aggregating",
            Self::Publishing => "publishing",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Terminal failure of one enrollment attempt.
#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("image does not decode: {0}")]
    Decode(#[from] image::ImageError),
    #[error("face detection failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("no face detected with confidence >= {min_confidence}")]
    NoFaceDetected { min_confidence: f32 },
    #[error("invalid face crop: {0}")]
    InvalidCrop(#[from] CropError),
    #[error("none of {attempted} variants produced a valid embedding")]
    NoValidEmbeddings { attempted: usize },
    #[error("prototype aggregation failed: {0}")]
    DegenerateAggregate(#[from] AggregateError),
    #[error("publishing prototype failed: {0}")]
    Publish(#[from] StoreError),
    #[error("enrollment abandoned by its caller before publishing")]
    Cancelled,
}

impl EnrollError {
    /// The stage at which the enrollment aborted.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Decode(_) => Stage::Decoding,
            Self::Detector(_) | Self::NoFaceDetected { .. } => Stage::Detecting,
            Self::InvalidCrop(_) => Stage::Cropping,
            Self::NoValidEmbeddings { .. } => Stage::Embedding,
            Self::DegenerateAggregate(_) => Stage::Aggregating,
            Self::Publish(_) | Self::Cancelled => Stage::Publishing,
        }
    }

    /// Stable machine-readable reason, safe to hand across process boundaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode_error",
            Self::Detector(_) => "detector_error",
            Self::NoFaceDetected { .. } => "no_face_detected",
            Self::InvalidCrop(_) => "invalid_crop",
            Self::NoValidEmbeddings { .. } => "no_valid_embeddings",
            Self::DegenerateAggregate(_) => "degenerate_aggregate",
            Self::Publish(_) => "publish_failure",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Tunables for one [`Enroller`].
#[derive(Debug, Clone)]
pub struct EnrollConfig {
    pub strategy: Strategy,
    /// Variants per batch for the statistical strategy.
    pub augment_count: usize,
    /// Minimum detector confidence for a face to be enrolled.
    pub min_confidence: f32,
    /// Fraction of the box size added on every side before cropping.
    pub crop_margin: f32,
    pub embedding_dim: usize,
    /// Side of the square image handed to the embedder.
    pub embed_input_size: u32,
    /// Fixed augmentation seed; `None` draws from OS entropy per enrollment.
    pub seed: Option<u64>,
    pub augment: AugmentConfig,
    pub consistency: ConsistencyConfig,
}

impl Default for EnrollConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Statistical,
            augment_count: 25,
            min_confidence: 0.4,
            crop_margin: 0.1,
            embedding_dim: ARCFACE_EMBEDDING_DIM,
            embed_input_size: ARCFACE_INPUT_SIZE,
            seed: None,
            augment: AugmentConfig::default(),
            consistency: ConsistencyConfig::default(),
        }
    }
}

/// Result of a completed enrollment.
#[derive(Debug, Clone)]
pub struct EnrollOutcome {
    pub subject_id: String,
    /// Unit-length prototype, already published.
    pub prototype: Embedding,
    pub variants_generated: usize,
    pub variants_embedded: usize,
    pub variants_kept: usize,
    pub used_fallback: bool,
    pub detection_confidence: f32,
}

/// Runs enrollments against injected collaborators.
///
/// Holds no per-request state: two calls with identical input and a fixed
/// seed produce identical prototypes.
pub struct Enroller<D, E, S> {
    detector: D,
    embedder: E,
    store: S,
    config: EnrollConfig,
}

impl<D: Detector, E: Embedder, S: VectorStore> Enroller<D, E, S> {
    pub fn new(detector: D, embedder: E, store: S, config: EnrollConfig) -> Self {
        Self { detector, embedder, store, config }
    }

    pub fn config(&self) -> &EnrollConfig {
        &self.config
    }

    /// Enroll `subject_id` from encoded image bytes.
    pub fn enroll(&mut self, subject_id: &str, image_bytes: &[u8]) -> Result<EnrollOutcome, EnrollError> {
        self.enroll_while(subject_id, image_bytes, || true)
    }

    /// Like [`Enroller::enroll`], but asks `still_wanted` right before
    /// publishing. A `false` answer aborts with [`EnrollError::Cancelled`]
    /// and the store is never touched.
    pub fn enroll_while(
        &mut self,
        subject_id: &str,
        image_bytes: &[u8],
        still_wanted: impl FnMut() -> bool,
    ) -> Result<EnrollOutcome, EnrollError> {
        let result = self.run(subject_id, image_bytes, still_wanted);
        match &result {
            Ok(outcome) => tracing::info!(
                subject = subject_id,
                stage = %Stage::Done,
                generated = outcome.variants_generated,
                embedded = outcome.variants_embedded,
                kept = outcome.variants_kept,
                fallback = outcome.used_fallback,
                "enrollment published"
            ),
            Err(e) => tracing::warn!(
                subject = subject_id,
                stage = %e.stage(),
                reason = e.kind(),
                error = %e,
                "enrollment aborted"
            ),
        }
        result
    }

    fn run(
        &mut self,
        subject_id: &str,
        image_bytes: &[u8],
        mut still_wanted: impl FnMut() -> bool,
    ) -> Result<EnrollOutcome, EnrollError> {
        let cfg = &self.config;

        trace_stage(subject_id, Stage::Decoding);
        let image = image::load_from_memory(image_bytes)?.to_rgb8();

        trace_stage(subject_id, Stage::Detecting);
        let detections = self.detector.detect(&image)?;
        let face = select_face(&detections, cfg.min_confidence)
            .cloned()
            .ok_or(EnrollError::NoFaceDetected { min_confidence: cfg.min_confidence })?;
        tracing::debug!(
            subject = subject_id,
            detections = detections.len(),
            confidence = face.confidence,
            "face selected"
        );

        trace_stage(subject_id, Stage::Cropping);
        let crop = crop_face(&image, &face, cfg.crop_margin)?;

        trace_stage(subject_id, Stage::Augmenting);
        let variants = match cfg.strategy {
            Strategy::Statistical => {
                Augmenter::new(cfg.augment.clone(), cfg.seed).generate(&crop, cfg.augment_count)
            }
            Strategy::Deterministic => deterministic_batch(&crop),
        };

        trace_stage(subject_id, Stage::Embedding);
        let (vectors, metrics) = self.embed_batch(subject_id, &variants);
        if vectors.is_empty() {
            return Err(EnrollError::NoValidEmbeddings { attempted: variants.len() });
        }

        let cfg = &self.config;
        trace_stage(subject_id, Stage::Filtering);
        let (kept, used_fallback) = match cfg.strategy {
            Strategy::Statistical => {
                let outcome = consistency::filter(&vectors, &cfg.consistency);
                (outcome.kept, outcome.used_fallback)
            }
            Strategy::Deterministic => ((0..vectors.len()).collect(), false),
        };

        trace_stage(subject_id, Stage::Aggregating);
        let kept_vectors: Vec<Vec<f32>> = kept.iter().map(|&i| vectors[i].clone()).collect();
        let weights = match cfg.strategy {
            Strategy::Statistical => {
                let kept_metrics: Vec<QualityMetrics> = kept.iter().map(|&i| metrics[i]).collect();
                quality_weights(&kept_metrics)
            }
            Strategy::Deterministic => uniform_weights(kept.len()),
        };
        let prototype = weighted_prototype(&kept_vectors, &weights)?;

        trace_stage(subject_id, Stage::Publishing);
        if !still_wanted() {
            return Err(EnrollError::Cancelled);
        }
        let model_version = self.embedder.model_version().map(str::to_string);
        let record = EnrollmentRecord {
            subject_id: subject_id.to_string(),
            enrolled_at: chrono::Utc::now(),
            model_version: model_version.clone(),
            strategy: cfg.strategy,
            variants_generated: variants.len(),
            variants_kept: kept.len(),
            detection_confidence: face.confidence,
        };
        self.store.upsert(subject_id, &prototype, &record)?;

        Ok(EnrollOutcome {
            subject_id: subject_id.to_string(),
            prototype: Embedding { values: prototype, model_version },
            variants_generated: variants.len(),
            variants_embedded: vectors.len(),
            variants_kept: kept.len(),
            used_fallback,
            detection_confidence: face.confidence,
        })
    }

    /// Embed every variant once, dropping those without a valid vector.
    /// Returns unit vectors and the quality of the matching embedder inputs.
    fn embed_batch(&mut self, subject_id: &str, variants: &[Variant]) -> (Vec<Vec<f32>>, Vec<QualityMetrics>) {
        let size = self.config.embed_input_size;
        let mut vectors = Vec::with_capacity(variants.len());
        let mut metrics = Vec::with_capacity(variants.len());

        for (i, variant) in variants.iter().enumerate() {
            let input = imageops::resize(&variant.image, size, size, FilterType::Triangle);
            match self.embed_one(&input) {
                Ok(v) => {
                    vectors.push(v);
                    metrics.push(quality::score(&input));
                }
                Err(e) => tracing::debug!(
                    subject = subject_id,
                    variant = i,
                    label = %variant.label(),
                    error = %e,
                    "variant dropped"
                ),
            }
        }

        (vectors, metrics)
    }

    fn embed_one(&mut self, face: &RgbImage) -> Result<Vec<f32>, EmbedError> {
        let raw = self.embedder.embed(face)?;
        if raw.len() != self.config.embedding_dim {
            return Err(EmbedError::WrongDimension {
                expected: self.config.embedding_dim,
                actual: raw.len(),
            });
        }
        l2_normalize(&raw).ok_or(EmbedError::InvalidVector)
    }
}

fn trace_stage(subject_id: &str, stage: Stage) {
    tracing::trace!(subject = subject_id, %stage, "enroll stage");
}

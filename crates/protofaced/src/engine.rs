use crate::config::Config;
use crate::store::SqliteStore;
use protoface_core::{EnrollError, EnrollOutcome, Enroller, FaceDetector, FaceRecognizer, StoreError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] protoface_core::detector::DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] protoface_core::recognizer::RecognizerError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        subject_id: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<EnrollOutcome, EnrollError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Queue an enrollment and wait for its result.
    pub async fn enroll(&self, subject_id: String, image: Vec<u8>) -> Result<EnrollOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                subject_id,
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads both ONNX models and opens the store up front, failing fast if any
/// is unavailable. Requests are served one at a time, so enrollments never
/// overlap and two enrollments of the same subject cannot race at the store.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let detector_path = config.detector_model_path();
    let detector =
        FaceDetector::load(&detector_path)?.with_score_threshold(config.enroll.min_confidence);
    tracing::info!(
        path = %detector_path,
        score_threshold = config.enroll.min_confidence,
        "SCRFD detector loaded"
    );

    let recognizer_path = config.recognizer_model_path();
    let recognizer = FaceRecognizer::load(&recognizer_path)?;
    tracing::info!(path = %recognizer_path, "ArcFace recognizer loaded");

    let store = SqliteStore::open(&config.db_path)?;
    tracing::info!(path = %config.db_path.display(), "prototype store opened");

    let enroller = Enroller::new(detector, recognizer, store, config.enroll.clone());
    spawn_with(enroller)
}

/// Run an already-assembled enroller on the engine thread.
pub fn spawn_with<D, E, S>(mut enroller: Enroller<D, E, S>) -> Result<EngineHandle, EngineError>
where
    D: protoface_core::Detector + Send + 'static,
    E: protoface_core::Embedder + Send + 'static,
    S: protoface_core::VectorStore + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("protoface-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll {
                        subject_id,
                        image,
                        reply,
                    } => {
                        if reply.is_closed() {
                            tracing::info!(subject = %subject_id, "caller gone before start, skipping");
                            continue;
                        }
                        let result = enroller.enroll_while(&subject_id, &image, || !reply.is_closed());
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

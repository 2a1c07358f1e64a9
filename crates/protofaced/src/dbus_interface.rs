use crate::engine::{EngineError, EngineHandle};
use protoface_core::EnrollOutcome;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use zbus::interface;

/// D-Bus interface for the protoface enrollment daemon.
///
/// Bus name: org.protoface.Enroll1
/// Object path: /org/protoface/Enroll1
pub struct EnrollService {
    engine: EngineHandle,
    timeout: Duration,
    info: ServiceInfo,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Static facts reported by `Status`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub model_dir: String,
    pub db_path: String,
    pub strategy: String,
    pub augment_count: usize,
}

/// JSON body returned by a successful `Enroll`.
#[derive(Debug, Serialize)]
struct EnrollReply<'a> {
    subject_id: &'a str,
    model_version: Option<&'a str>,
    dimension: usize,
    variants_generated: usize,
    variants_embedded: usize,
    variants_kept: usize,
    used_fallback: bool,
    detection_confidence: f32,
}

impl<'a> From<&'a EnrollOutcome> for EnrollReply<'a> {
    fn from(o: &'a EnrollOutcome) -> Self {
        Self {
            subject_id: &o.subject_id,
            model_version: o.prototype.model_version.as_deref(),
            dimension: o.prototype.values.len(),
            variants_generated: o.variants_generated,
            variants_embedded: o.variants_embedded,
            variants_kept: o.variants_kept,
            used_fallback: o.used_fallback,
            detection_confidence: o.detection_confidence,
        }
    }
}

impl EnrollService {
    pub fn new(engine: EngineHandle, timeout: Duration, info: ServiceInfo) -> Self {
        Self {
            engine,
            timeout,
            info,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    async fn run_enroll(&self, subject: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        if subject.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("subject id must not be empty".into()));
        }

        let result = tokio::time::timeout(self.timeout, self.engine.enroll(subject.to_string(), image)).await;
        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                return Err(to_fdo(e));
            }
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(subject, timeout = ?self.timeout, "enrollment timed out");
                return Err(zbus::fdo::Error::Failed(format!(
                    "timeout: enrollment exceeded {:?}",
                    self.timeout
                )));
            }
        };

        self.completed.fetch_add(1, Ordering::Relaxed);
        serde_json::to_string(&EnrollReply::from(&outcome))
            .map_err(|e| zbus::fdo::Error::Failed(format!("serialize: {e}")))
    }
}

#[interface(name = "org.protoface.Enroll1")]
impl EnrollService {
    /// Build and store the prototype for `subject` from one encoded photo.
    async fn enroll(&self, subject: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(subject, bytes = image.len(), "enroll requested");
        self.run_enroll(subject, image).await
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "model_dir": self.info.model_dir,
            "db_path": self.info.db_path,
            "strategy": self.info.strategy,
            "augment_count": self.info.augment_count,
            "enrollments_completed": self.completed.load(Ordering::Relaxed),
            "enrollments_failed": self.failed.load(Ordering::Relaxed),
        })
        .to_string())
    }
}

/// Error strings carry the stable `kind` prefix so clients can branch on it.
fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::Enroll(e) => zbus::fdo::Error::Failed(format!("{}: {e}", e.kind())),
        EngineError::ChannelClosed => zbus::fdo::Error::Failed("engine_unavailable: engine thread exited".into()),
        other => zbus::fdo::Error::Failed(format!("internal: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_with;
    use crate::store::SqliteStore;
    use protoface_core::detector::DetectorError;
    use protoface_core::{BoundingBox, Detector, EmbedError, Embedder, EnrollConfig, Enroller};
    use protoface_core::{EnrollmentRecord, StoreError, VectorStore};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    struct WholeImage;

    impl Detector for WholeImage {
        fn detect(&mut self, image: &image::RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(vec![BoundingBox {
                x: 8.0,
                y: 8.0,
                width: image.width() as f32 - 16.0,
                height: image.height() as f32 - 16.0,
                confidence: 0.9,
            }])
        }
    }

    struct Constant;

    impl Embedder for Constant {
        fn embed(&mut self, _face: &image::RgbImage) -> Result<Vec<f32>, EmbedError> {
            let mut v = vec![0.0; 512];
            v[0] = 3.0;
            v[1] = 4.0;
            Ok(v)
        }
    }

    fn photo() -> Vec<u8> {
        let img = image::RgbImage::from_fn(96, 96, |x, y| image::Rgb([(x * 2) as u8, (y * 2) as u8, 128]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    /// Sleeps per variant so one enrollment outlasts a short caller timeout.
    struct Slow;

    impl Embedder for Slow {
        fn embed(&mut self, face: &image::RgbImage) -> Result<Vec<f32>, EmbedError> {
            std::thread::sleep(Duration::from_millis(20));
            Constant.embed(face)
        }
    }

    #[derive(Clone, Default)]
    struct Published(Arc<Mutex<Vec<String>>>);

    impl VectorStore for Published {
        fn upsert(&mut self, id: &str, _v: &[f32], _p: &EnrollmentRecord) -> Result<(), StoreError> {
            self.0.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    fn info() -> ServiceInfo {
        ServiceInfo {
            model_dir: "/models".into(),
            db_path: ":memory:".into(),
            strategy: "statistical".into(),
            augment_count: 25,
        }
    }

    fn seeded() -> EnrollConfig {
        EnrollConfig {
            seed: Some(1),
            ..EnrollConfig::default()
        }
    }

    fn service() -> EnrollService {
        let store = SqliteStore::open_in_memory().unwrap();
        let engine = spawn_with(Enroller::new(WholeImage, Constant, store, seeded())).unwrap();
        EnrollService::new(engine, Duration::from_secs(30), info())
    }

    fn slow_service(timeout: Duration, store: Published) -> EnrollService {
        let engine = spawn_with(Enroller::new(WholeImage, Slow, store, seeded())).unwrap();
        EnrollService::new(engine, timeout, info())
    }

    #[tokio::test]
    async fn test_enroll_reply_json() {
        let svc = service();
        let reply = svc.run_enroll("emp-7", photo()).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(json["subject_id"], "emp-7");
        assert_eq!(json["dimension"], 512);
        assert_eq!(json["variants_generated"], 25);
        assert_eq!(json["variants_kept"], 25);
        assert_eq!(json["used_fallback"], false);
    }

    #[tokio::test]
    async fn test_enroll_failure_carries_kind() {
        let svc = service();
        let err = svc.run_enroll("emp-7", b"not an image".to_vec()).await.unwrap_err();
        match err {
            zbus::fdo::Error::Failed(msg) => assert!(msg.starts_with("decode_error:"), "got {msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_subject_rejected() {
        let svc = service();
        let err = svc.run_enroll("  ", photo()).await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));
    }

    #[tokio::test]
    async fn test_timed_out_enrollment_is_not_published() {
        let store = Published::default();
        let svc = slow_service(Duration::from_millis(50), store.clone());

        let err = svc.run_enroll("emp-x", photo()).await.unwrap_err();
        match err {
            zbus::fdo::Error::Failed(msg) => assert_eq!(msg, "timeout: enrollment exceeded 50ms"),
            other => panic!("unexpected error: {other:?}"),
        }

        // The engine serves requests in order, so this one finishes after the
        // abandoned one has been fully wound down.
        svc.engine.enroll("emp-y".into(), photo()).await.unwrap();
        assert_eq!(*store.0.lock().unwrap(), vec!["emp-y".to_string()]);
    }

    #[tokio::test]
    async fn test_queued_request_skipped_after_caller_gives_up() {
        let store = Published::default();
        let svc = slow_service(Duration::from_millis(50), store.clone());

        let first = {
            let engine = svc.engine.clone();
            tokio::spawn(async move { engine.enroll("emp-a".into(), photo()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Waits behind emp-a and times out while still queued.
        assert!(svc.run_enroll("emp-b", photo()).await.is_err());

        first.await.unwrap().unwrap();
        svc.engine.enroll("emp-c".into(), photo()).await.unwrap();
        assert_eq!(
            *store.0.lock().unwrap(),
            vec!["emp-a".to_string(), "emp-c".to_string()]
        );
    }

    #[tokio::test]
    async fn test_status_counts() {
        let svc = service();
        svc.run_enroll("emp-1", photo()).await.unwrap();
        let _ = svc.run_enroll("emp-2", Vec::new()).await;

        let status: serde_json::Value = serde_json::from_str(&svc.status().await.unwrap()).unwrap();
        assert_eq!(status["enrollments_completed"], 1);
        assert_eq!(status["enrollments_failed"], 1);
        assert_eq!(status["strategy"], "statistical");
    }
}

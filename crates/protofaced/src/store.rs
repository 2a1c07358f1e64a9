//! SQLite-backed prototype store.
//!
//! One row per id; publishing the same id again replaces the vector and
//! payload in a single statement, so a failed write leaves the previous
//! prototype untouched.

use protoface_core::{EnrollmentRecord, StoreError, VectorStore};
use rusqlite::{params, Connection};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS prototypes (
    id          TEXT PRIMARY KEY,
    subject_id  TEXT NOT NULL,
    vector      BLOB NOT NULL,
    dim         INTEGER NOT NULL,
    payload     TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);";

pub struct SqliteStore {
    conn: Connection,
}

/// A stored prototype as read back from the table.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct StoredPrototype {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: EnrollmentRecord,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(unavailable)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(unavailable)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn count(&self) -> Result<usize, StoreError> {
        self.conn
            .query_row("SELECT COUNT(*) FROM prototypes", [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
            .map_err(unavailable)
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Result<Option<StoredPrototype>, StoreError> {
        use rusqlite::OptionalExtension;

        let row = self
            .conn
            .query_row(
                "SELECT vector, payload FROM prototypes WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(unavailable)?;

        let Some((blob, payload)) = row else {
            return Ok(None);
        };
        let payload: EnrollmentRecord = serde_json::from_str(&payload)
            .map_err(|e| StoreError::Unavailable(format!("corrupt payload for {id}: {e}")))?;

        Ok(Some(StoredPrototype {
            id: id.to_string(),
            vector: decode_vector(&blob),
            payload,
        }))
    }
}

impl VectorStore for SqliteStore {
    fn upsert(&mut self, id: &str, vector: &[f32], payload: &EnrollmentRecord) -> Result<(), StoreError> {
        if vector.is_empty() {
            return Err(StoreError::Rejected("empty vector".into()));
        }
        let payload_json =
            serde_json::to_string(payload).map_err(|e| StoreError::Rejected(e.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO prototypes (id, subject_id, vector, dim, payload, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    subject_id = excluded.subject_id,
                    vector = excluded.vector,
                    dim = excluded.dim,
                    payload = excluded.payload,
                    updated_at = excluded.updated_at",
                params![
                    id,
                    payload.subject_id,
                    encode_vector(vector),
                    vector.len() as i64,
                    payload_json,
                    payload.enrolled_at.to_rfc3339(),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::DatabaseBusy
                        || err.code == rusqlite::ErrorCode::DatabaseLocked =>
                {
                    StoreError::Timeout
                }
                other => StoreError::Unavailable(other.to_string()),
            })?;

        tracing::debug!(id, dim = vector.len(), "prototype stored");
        Ok(())
    }
}

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Little-endian f32 packing.
fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[cfg(test)]
fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use protoface_core::Strategy;

    fn record(subject: &str, kept: usize) -> EnrollmentRecord {
        EnrollmentRecord {
            subject_id: subject.into(),
            enrolled_at: Utc::now(),
            model_version: Some("w600k_r50".into()),
            strategy: Strategy::Statistical,
            variants_generated: 25,
            variants_kept: kept,
            detection_confidence: 0.88,
        }
    }

    #[test]
    fn test_upsert_then_get() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.upsert("emp-1", &[0.6, 0.8], &record("emp-1", 24)).unwrap();

        let stored = store.get("emp-1").unwrap().unwrap();
        assert_eq!(stored.vector, vec![0.6, 0.8]);
        assert_eq!(stored.payload.subject_id, "emp-1");
        assert_eq!(stored.payload.variants_kept, 24);
    }

    #[test]
    fn test_reenroll_replaces_prototype() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.upsert("emp-1", &[1.0, 0.0], &record("emp-1", 20)).unwrap();
        store.upsert("emp-1", &[0.0, 1.0], &record("emp-1", 25)).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        let stored = store.get("emp-1").unwrap().unwrap();
        assert_eq!(stored.vector, vec![0.0, 1.0]);
        assert_eq!(stored.payload.variants_kept, 25);
    }

    #[test]
    fn test_missing_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get("nobody").unwrap().is_none());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_empty_vector_rejected() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let err = store.upsert("emp-1", &[], &record("emp-1", 0)).unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_vector_blob_roundtrip_exact() {
        let v = [0.1f32, -2.5, f32::MIN_POSITIVE, 1e30];
        assert_eq!(decode_vector(&encode_vector(&v)), v.to_vec());
    }
}

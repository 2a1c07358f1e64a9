use protoface_core::consistency::ConsistencyConfig;
use protoface_core::{EnrollConfig, Strategy};
use std::path::PathBuf;

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    System,
    Session,
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite prototype store.
    pub db_path: PathBuf,
    /// Caller-level timeout around one whole enrollment.
    pub enroll_timeout_secs: u64,
    pub bus: Bus,
    pub enroll: EnrollConfig,
}

impl Config {
    /// Load configuration from `PROTOFACE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = get("PROTOFACE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(protoface_core::default_model_dir);

        let data_dir = get("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("protoface");

        let db_path = get("PROTOFACE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("prototypes.db"));

        let defaults = EnrollConfig::default();
        let consistency = ConsistencyConfig {
            hard_floor: parse_or(&get, "PROTOFACE_HARD_FLOOR", defaults.consistency.hard_floor),
            min_keep: parse_or(&get, "PROTOFACE_MIN_KEEP", defaults.consistency.min_keep),
            ..defaults.consistency.clone()
        };

        let enroll = EnrollConfig {
            strategy: parse_or(&get, "PROTOFACE_STRATEGY", Strategy::Statistical),
            augment_count: parse_or(&get, "PROTOFACE_AUGMENT_COUNT", defaults.augment_count),
            min_confidence: parse_or(&get, "PROTOFACE_MIN_CONFIDENCE", defaults.min_confidence),
            crop_margin: parse_or(&get, "PROTOFACE_CROP_MARGIN", defaults.crop_margin),
            embedding_dim: parse_or(&get, "PROTOFACE_EMBEDDING_DIM", defaults.embedding_dim),
            seed: get("PROTOFACE_SEED").and_then(|v| v.parse().ok()),
            consistency,
            ..defaults
        };

        Self {
            model_dir,
            db_path,
            enroll_timeout_secs: parse_or(&get, "PROTOFACE_ENROLL_TIMEOUT_SECS", 30),
            bus: match get("PROTOFACE_BUS").as_deref() {
                Some("session") => Bus::Session,
                _ => Bus::System,
            },
            enroll,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(protoface_core::DETECTOR_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> String {
        self.model_dir
            .join(protoface_core::RECOGNIZER_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

fn parse_or<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("HOME", "/home/ada")]);
        assert_eq!(config.db_path, PathBuf::from("/home/ada/.local/share/protoface/prototypes.db"));
        assert_eq!(config.enroll.augment_count, 25);
        assert_eq!(config.enroll.strategy, Strategy::Statistical);
        assert!((config.enroll.min_confidence - 0.4).abs() < 1e-6);
        assert!((config.enroll.consistency.hard_floor - 0.55).abs() < 1e-6);
        assert_eq!(config.enroll.consistency.min_keep, 5);
        assert_eq!(config.enroll.seed, None);
        assert_eq!(config.bus, Bus::System);
        assert_eq!(config.enroll_timeout_secs, 30);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("PROTOFACE_MODEL_DIR", "/opt/models"),
            ("PROTOFACE_AUGMENT_COUNT", "12"),
            ("PROTOFACE_STRATEGY", "deterministic"),
            ("PROTOFACE_SEED", "99"),
            ("PROTOFACE_MIN_KEEP", "3"),
            ("PROTOFACE_BUS", "session"),
        ]);
        assert_eq!(config.detector_model_path(), "/opt/models/det_10g.onnx");
        assert_eq!(config.recognizer_model_path(), "/opt/models/w600k_r50.onnx");
        assert_eq!(config.enroll.augment_count, 12);
        assert_eq!(config.enroll.strategy, Strategy::Deterministic);
        assert_eq!(config.enroll.seed, Some(99));
        assert_eq!(config.enroll.consistency.min_keep, 3);
        assert_eq!(config.bus, Bus::Session);
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let config = config_from(&[
            ("PROTOFACE_AUGMENT_COUNT", "lots"),
            ("PROTOFACE_MIN_CONFIDENCE", "high"),
        ]);
        assert_eq!(config.enroll.augment_count, 25);
        assert!((config.enroll.min_confidence - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_explicit_db_path_wins() {
        let config = config_from(&[("PROTOFACE_DB_PATH", "/var/lib/protoface/p.db")]);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/protoface/p.db"));
    }
}

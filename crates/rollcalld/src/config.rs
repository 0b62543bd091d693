use rollcall_core::DistanceMetric;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    BadValue { key: &'static str, value: String },
    #[error("{0}")]
    Invalid(String),
}

/// Daemon configuration.
///
/// Resolved from an optional TOML file (`ROLLCALL_CONFIG`), then
/// `ROLLCALL_*` environment variables, then built-in defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite embedding database.
    pub db_path: PathBuf,
    /// Directory holding per-session result logs.
    pub sessions_dir: PathBuf,
    /// Embedding model name, recorded in metadata and stats.
    pub model_name: String,
    /// Dimensionality every stored embedding must have.
    pub embedding_dim: usize,
    pub distance_metric: DistanceMetric,
    /// Maximum distance at which a match is accepted, in [0, 1].
    pub confidence_threshold: f32,
    /// Recognitions per second across all callers (0 = unlimited).
    pub fps_limit: f64,
    /// Load all stored embeddings at startup.
    pub cache_preload: bool,
    pub min_detection_confidence: f32,
    /// Fraction of face width/height added on each side before embedding.
    pub crop_padding: f32,
}

/// On-disk TOML shape; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    sessions_dir: Option<PathBuf>,
    model_name: Option<String>,
    embedding_dim: Option<usize>,
    distance_metric: Option<String>,
    confidence_threshold: Option<f32>,
    fps_limit: Option<f64>,
    cache_preload: Option<bool>,
    min_detection_confidence: Option<f32>,
    crop_padding: Option<f32>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

impl Config {
    /// Load configuration from `ROLLCALL_CONFIG` and `ROLLCALL_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => FileConfig::read(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = rollcall_core::default_data_dir();

        let metric_name = env("ROLLCALL_DISTANCE_METRIC")
            .or(file.distance_metric)
            .unwrap_or_else(|| "cosine".to_string());
        let distance_metric = metric_name.parse().map_err(|_| ConfigError::BadValue {
            key: "distance_metric",
            value: metric_name.clone(),
        })?;

        let config = Self {
            model_dir: env("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(rollcall_core::default_model_dir),
            db_path: env("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(|| data_dir.join("embeddings.db")),
            sessions_dir: env("ROLLCALL_SESSIONS_DIR")
                .map(PathBuf::from)
                .or(file.sessions_dir)
                .unwrap_or_else(|| data_dir.join("sessions")),
            model_name: env("ROLLCALL_MODEL_NAME")
                .or(file.model_name)
                .unwrap_or_else(|| "arcface_w600k_r50".to_string()),
            embedding_dim: parse_env(&env, "ROLLCALL_EMBEDDING_DIM", "embedding_dim")?
                .or(file.embedding_dim)
                .unwrap_or(512),
            distance_metric,
            confidence_threshold: parse_env(&env, "ROLLCALL_CONFIDENCE_THRESHOLD", "confidence_threshold")?
                .or(file.confidence_threshold)
                .unwrap_or(0.6),
            fps_limit: parse_env(&env, "ROLLCALL_FPS_LIMIT", "fps_limit")?
                .or(file.fps_limit)
                .unwrap_or(1.0),
            cache_preload: env("ROLLCALL_CACHE_PRELOAD")
                .map(|v| !matches!(v.trim(), "0" | "false" | "no" | "off"))
                .or(file.cache_preload)
                .unwrap_or(true),
            min_detection_confidence: parse_env(&env, "ROLLCALL_MIN_DETECTION_CONFIDENCE", "min_detection_confidence")?
                .or(file.min_detection_confidence)
                .unwrap_or(0.5),
            crop_padding: parse_env(&env, "ROLLCALL_CROP_PADDING", "crop_padding")?
                .or(file.crop_padding)
                .unwrap_or(0.1),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold must be between 0.0 and 1.0, got {}",
                self.confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.min_detection_confidence) {
            return Err(ConfigError::Invalid(format!(
                "min_detection_confidence must be between 0.0 and 1.0, got {}",
                self.min_detection_confidence
            )));
        }
        if !self.fps_limit.is_finite() || self.fps_limit < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "fps_limit must be a finite value >= 0, got {}",
                self.fps_limit
            )));
        }
        if self.embedding_dim == 0 {
            return Err(ConfigError::Invalid("embedding_dim must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.crop_padding) {
            return Err(ConfigError::Invalid(format!(
                "crop_padding must be in [0.0, 1.0), got {}",
                self.crop_padding
            )));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }
}

fn parse_env<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    var: &str,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::BadValue { key, value: raw }),
    }
}

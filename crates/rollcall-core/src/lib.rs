//! rollcall-core: embedding cache and nearest-match recognition engine.
//!
//! Keeps one face embedding per enrolled student, matches freshly extracted
//! embeddings against all of them, and records per-session recognition
//! results. Face detection (SCRFD) and embedding (ArcFace) run via ONNX
//! Runtime behind the [`Detector`] and [`Embedder`] traits.

pub mod detector;
pub mod distance;
pub mod ledger;
pub mod matcher;
pub mod pipeline;
pub mod rate_limit;
pub mod recognizer;
pub mod store;
pub mod types;

pub use detector::ScrfdDetector;
pub use distance::DistanceMetric;
pub use ledger::SessionLedger;
pub use matcher::{LinearScanResolver, MatchResolver};
pub use pipeline::{Detector, Embedder, Recognizer, RecognizerSettings};
pub use rate_limit::RateLimiter;
pub use recognizer::ArcFaceEmbedder;
pub use store::{EmbeddingStore, SqliteRecordStore};
pub use types::{Embedding, EmbeddingMetadata, FaceDetection, FaceRegion, MatchCandidate};

use std::path::PathBuf;

/// Default directory for ONNX model files: `$XDG_DATA_HOME/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}

/// Default data directory: `$XDG_DATA_HOME/rollcall` (or `~/.local/share/rollcall`).
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

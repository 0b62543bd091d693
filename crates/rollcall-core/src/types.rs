use chrono::{DateTime, Utc};
use ndarray::{Array, Dimension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Axis-aligned face region in pixel coordinates of the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    /// Expand the region by `padding` (fraction of width/height) on every side,
    /// clamped to an `image_width` × `image_height` image.
    ///
    /// Returns `None` when nothing of the region lies inside the image.
    pub fn padded(&self, padding: f32, image_width: u32, image_height: u32) -> Option<FaceRegion> {
        let pad_w = (self.width as f32 * padding) as i64;
        let pad_h = (self.height as f32 * padding) as i64;

        let x1 = (self.x as i64 - pad_w).max(0);
        let y1 = (self.y as i64 - pad_h).max(0);
        let x2 = (self.x as i64 + self.width as i64 + pad_w).min(image_width as i64);
        let y2 = (self.y as i64 + self.height as i64 + pad_h).min(image_height as i64);

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        Some(FaceRegion {
            x: x1 as u32,
            y: y1 as u32,
            width: (x2 - x1) as u32,
            height: (y2 - y1) as u32,
        })
    }
}

/// A face found by the detector. Transient: only persisted inside a
/// [`RecognitionResult`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub region: FaceRegion,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
}

/// Face embedding vector (512-dimensional for ArcFace and Facenet512).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// Flattens model output of any shape (e.g. `[1, 512]`) in logical order.
impl<D: Dimension> From<Array<f32, D>> for Embedding {
    fn from(array: Array<f32, D>) -> Self {
        Self {
            values: array.iter().copied().collect(),
        }
    }
}

/// Advisory metadata stored alongside each embedding.
///
/// Not consulted for matching; a record with missing or unreadable metadata
/// still participates in recognition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingMetadata {
    pub created_at: DateTime<Utc>,
    /// Model that produced the embedding (e.g. "arcface_w600k_r50").
    pub model: String,
    pub detection_confidence: Option<f32>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EmbeddingMetadata {
    pub fn new(model: impl Into<String>, detection_confidence: Option<f32>) -> Self {
        Self {
            created_at: Utc::now(),
            model: model.into(),
            detection_confidence,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// One identity's persisted embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub identity: String,
    pub embedding: Embedding,
    pub metadata: Option<EmbeddingMetadata>,
}

/// All cached embeddings, keyed by identity.
///
/// Ordered so that gallery traversal (and therefore tie-breaking between
/// equidistant identities) is lexicographic and stable across reloads.
pub type Gallery = BTreeMap<String, Embedding>;

/// Outcome of matching one query embedding against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    /// Matched identity, `None` when the best distance exceeded the threshold.
    pub identity: Option<String>,
    /// Best distance found, even on rejection. `+inf` for an empty gallery.
    pub distance: f32,
    /// `1 - distance` on a match, `0.0` otherwise. Not a probability.
    pub confidence: f32,
}

impl MatchCandidate {
    pub fn matched(identity: impl Into<String>, distance: f32) -> Self {
        Self {
            identity: Some(identity.into()),
            distance,
            confidence: 1.0 - distance,
        }
    }

    pub fn rejected(distance: f32) -> Self {
        Self {
            identity: None,
            distance,
            confidence: 0.0,
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }
}

/// A detected face that matched an enrolled identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedFace {
    pub identity: String,
    pub confidence: f32,
    pub distance: f32,
    pub region: FaceRegion,
    pub detection_confidence: f32,
}

/// Aggregate result of one recognition call. Immutable once written to a
/// session ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub session_id: String,
    pub recognized: Vec<RecognizedFace>,
    pub total_faces_detected: usize,
    pub total_recognized: usize,
    pub processing_time_secs: f64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn region(x: u32, y: u32, w: u32, h: u32) -> FaceRegion {
        FaceRegion { x, y, width: w, height: h }
    }

    #[test]
    fn test_padded_region_inside_image() {
        let r = region(100, 100, 50, 40).padded(0.1, 640, 480).unwrap();
        assert_eq!(r, region(95, 96, 60, 48));
    }

    #[test]
    fn test_padded_region_clamped_to_bounds() {
        let r = region(0, 0, 100, 100).padded(0.2, 110, 90).unwrap();
        assert_eq!(r, region(0, 0, 110, 90));
    }

    #[test]
    fn test_padded_region_outside_image() {
        assert!(region(700, 500, 20, 20).padded(0.1, 640, 480).is_none());
    }

    #[test]
    fn test_embedding_from_2d_array_flattens() {
        let arr = Array2::from_shape_vec((1, 4), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let emb = Embedding::from(arr);
        assert_eq!(emb.values, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(emb.dim(), 4);
    }

    #[test]
    fn test_match_candidate_confidence() {
        let m = MatchCandidate::matched("S1", 0.25);
        assert!(m.is_match());
        assert!((m.confidence - 0.75).abs() < 1e-6);

        let r = MatchCandidate::rejected(0.8);
        assert!(!r.is_match());
        assert_eq!(r.confidence, 0.0);
        assert!((r.distance - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_metadata_roundtrips_without_extra_field() {
        let json = r#"{"created_at":"2024-01-01T12:00:00Z","model":"arcface","detection_confidence":0.9}"#;
        let meta: EmbeddingMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.model, "arcface");
        assert!(meta.extra.is_empty());
    }
}

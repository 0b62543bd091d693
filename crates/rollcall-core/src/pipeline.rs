//! Recognition pipeline: rate limit → detect → crop → embed → match → persist.

use crate::detector::DetectorError;
use crate::ledger::{self, LedgerError, SessionLedger};
use crate::matcher::MatchResolver;
use crate::rate_limit::RateLimiter;
use crate::recognizer::EmbedderError;
use crate::store::{EmbeddingStore, StoreError, StoreStats};
use crate::types::{
    Embedding, EmbeddingMetadata, FaceDetection, RecognitionResult, RecognizedFace,
};
use chrono::Utc;
use image::DynamicImage;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Face detector collaborator. An image without faces is an empty list, not
/// an error.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceDetection>, DetectorError>;
}

/// Embedding model collaborator: face crop → fixed-length vector.
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn embed(&self, face: &DynamicImage) -> Result<Embedding, EmbedderError>;
}

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("invalid session id: {0:?} (expected a UUID)")]
    InvalidSessionId(String),
}

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error("no face detected in the image")]
    NoFace,
    #[error("multiple faces detected ({0}); registration needs exactly one")]
    MultipleFaces(usize),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct RecognizerSettings {
    /// Maximum distance at which a match is accepted.
    pub threshold: f32,
    /// Detections below this confidence are ignored.
    pub min_detection_confidence: f32,
    /// Fraction of the face size added on each side before cropping.
    pub crop_padding: f32,
}

impl Default for RecognizerSettings {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            min_detection_confidence: 0.5,
            crop_padding: 0.1,
        }
    }
}

/// Outcome of a recognition call. An image without faces is a successful
/// recognition with nothing recognized.
#[derive(Debug, Clone, Serialize)]
pub struct Recognition {
    #[serde(flatten)]
    pub result: RecognitionResult,
    /// Whether the result was written to the session ledger.
    pub persisted: bool,
}

/// Outcome of a successful registration.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub identity: String,
    pub detection_confidence: f32,
    pub dimension: usize,
    /// False when the embedding is cached in memory only.
    pub persisted: bool,
    pub processing_time_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecognizerStats {
    #[serde(flatten)]
    pub store: StoreStats,
    pub detector: String,
    pub threshold: f32,
    pub min_detection_confidence: f32,
    pub fps_limit: f64,
}

/// Per-request orchestration over shared detector, embedder, cache and ledger.
///
/// Safe to share across worker threads. The only intentional blocking point
/// is the rate limiter; model calls happen without any cache lock held.
pub struct Recognizer {
    detector: Box<dyn Detector>,
    embedder: Box<dyn Embedder>,
    resolver: Box<dyn MatchResolver>,
    store: Arc<EmbeddingStore>,
    ledger: Arc<SessionLedger>,
    limiter: Arc<RateLimiter>,
    settings: RecognizerSettings,
}

impl Recognizer {
    pub fn new(
        detector: Box<dyn Detector>,
        embedder: Box<dyn Embedder>,
        resolver: Box<dyn MatchResolver>,
        store: Arc<EmbeddingStore>,
        ledger: Arc<SessionLedger>,
        limiter: Arc<RateLimiter>,
        settings: RecognizerSettings,
    ) -> Self {
        Self {
            detector,
            embedder,
            resolver,
            store,
            ledger,
            limiter,
            settings,
        }
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    pub fn settings(&self) -> &RecognizerSettings {
        &self.settings
    }

    /// Detect faces above the configured confidence floor.
    pub fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceDetection>, DetectorError> {
        let min = self.settings.min_detection_confidence;
        let faces: Vec<FaceDetection> = self
            .detector
            .detect(image)?
            .into_iter()
            .filter(|f| f.confidence >= min)
            .collect();
        tracing::debug!(count = faces.len(), min_confidence = min, "faces detected");
        Ok(faces)
    }

    /// Identify every face in `image` against the cached embeddings.
    ///
    /// Without `session_id` a new session is started. Faces whose embedding
    /// fails are skipped. With `save_results` the result is appended to the
    /// session ledger; a ledger failure is logged and reported through
    /// [`Recognition::persisted`].
    pub fn recognize(
        &self,
        image: &DynamicImage,
        session_id: Option<&str>,
        save_results: bool,
    ) -> Result<Recognition, RecognitionError> {
        let start = Instant::now();

        let session_id = match session_id {
            Some(id) => ledger::canonical_session_id(id)
                .map_err(|_| RecognitionError::InvalidSessionId(id.to_string()))?,
            None => ledger::new_session_id(),
        };

        self.limiter.acquire();
        tracing::info!(session_id = %session_id, "recognizing faces");

        let faces = match self.detect(image) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "face detection failed; treating as no faces");
                Vec::new()
            }
        };

        if faces.is_empty() {
            tracing::info!(session_id = %session_id, "no faces detected");
            return Ok(Recognition {
                result: RecognitionResult {
                    session_id,
                    recognized: Vec::new(),
                    total_faces_detected: 0,
                    total_recognized: 0,
                    processing_time_secs: start.elapsed().as_secs_f64(),
                    timestamp: Utc::now(),
                },
                persisted: false,
            });
        }

        let mut embedded_faces = Vec::with_capacity(faces.len());
        let mut embeddings = Vec::with_capacity(faces.len());
        for (i, face) in faces.iter().enumerate() {
            match self.embed_face(image, face) {
                Ok(embedding) => {
                    embedded_faces.push(*face);
                    embeddings.push(embedding);
                }
                Err(e) => {
                    tracing::warn!(face = i, region = ?face.region, error = %e, "skipping face: embedding failed");
                }
            }
        }

        let threshold = self.settings.threshold;
        let matches = self
            .store
            .with_gallery(|gallery| self.resolver.batch_find_matches(&embeddings, gallery, threshold));

        let recognized: Vec<RecognizedFace> = embedded_faces
            .iter()
            .zip(matches)
            .filter_map(|(face, m)| {
                let identity = m.identity?;
                Some(RecognizedFace {
                    identity,
                    confidence: m.confidence,
                    distance: m.distance,
                    region: face.region,
                    detection_confidence: face.confidence,
                })
            })
            .collect();

        let result = RecognitionResult {
            session_id,
            total_faces_detected: faces.len(),
            total_recognized: recognized.len(),
            recognized,
            processing_time_secs: start.elapsed().as_secs_f64(),
            timestamp: Utc::now(),
        };

        let persisted = save_results && self.persist(&result);

        tracing::info!(
            session_id = %result.session_id,
            recognized = result.total_recognized,
            faces = result.total_faces_detected,
            secs = result.processing_time_secs,
            "recognition complete"
        );

        Ok(Recognition { result, persisted })
    }

    /// Enroll `identity` from an image containing exactly one face.
    ///
    /// Replaces any existing embedding for the identity. A failed durable
    /// write still leaves the identity enrolled in memory.
    pub fn register(&self, image: &DynamicImage, identity: &str) -> Result<Registration, RegistrationError> {
        let start = Instant::now();
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(RegistrationError::EmptyIdentity);
        }

        tracing::info!(identity, "registering");

        let faces = self.detect(image)?;
        let face = match faces.as_slice() {
            [] => return Err(RegistrationError::NoFace),
            [face] => *face,
            many => return Err(RegistrationError::MultipleFaces(many.len())),
        };

        let embedding = self.embed_face(image, &face)?;
        let dimension = embedding.dim();
        let metadata = EmbeddingMetadata::new(self.embedder.model_name(), Some(face.confidence))
            .with_extra("detector", self.detector.name());

        let persisted = match self.store.set(identity, embedding, metadata, true) {
            Ok(()) => true,
            Err(e) if e.is_persistence() => false,
            Err(e) => return Err(e.into()),
        };

        let processing_time_secs = start.elapsed().as_secs_f64();
        tracing::info!(identity, persisted, secs = processing_time_secs, "registered");

        Ok(Registration {
            identity: identity.to_string(),
            detection_confidence: face.confidence,
            dimension,
            persisted,
            processing_time_secs,
        })
    }

    pub fn session_results(&self, session_id: &str) -> Result<Option<Vec<RecognitionResult>>, LedgerError> {
        self.ledger.read(session_id)
    }

    pub fn stats(&self) -> RecognizerStats {
        RecognizerStats {
            store: self.store.stats(),
            detector: self.detector.name().to_string(),
            threshold: self.settings.threshold,
            min_detection_confidence: self.settings.min_detection_confidence,
            fps_limit: self.limiter.fps_limit(),
        }
    }

    fn embed_face(&self, image: &DynamicImage, face: &FaceDetection) -> Result<Embedding, EmbedderError> {
        let region = face
            .region
            .padded(self.settings.crop_padding, image.width(), image.height())
            .ok_or(EmbedderError::EmptyCrop)?;
        let crop = image.crop_imm(region.x, region.y, region.width, region.height);
        self.embedder.embed(&crop)
    }

    fn persist(&self, result: &RecognitionResult) -> bool {
        match self.ledger.append(&result.session_id, result) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(session_id = %result.session_id, error = %e, "failed to save session results");
                false
            }
        }
    }
}

//! ArcFace face embedder via ONNX Runtime.
//!
//! Extracts L2-normalized embeddings from face crops using the w600k_r50
//! ArcFace model. Crops are resized to 112×112 RGB.

use crate::pipeline::Embedder;
use crate::types::Embedding;
use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // NOT 128.0: ArcFace uses symmetric normalization

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}; download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("empty face crop")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based embedder.
pub struct ArcFaceEmbedder {
    session: Mutex<Session>,
    model_name: String,
    dimension: usize,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model. Every embedding it produces must have
    /// `dimension` values; anything else is reported as an inference failure.
    pub fn load(model_path: &Path, model_name: &str, dimension: usize) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            model = model_name,
            dimension,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session: Mutex::new(session),
            model_name: model_name.to_string(),
            dimension,
        })
    }

    /// Resize a face crop and convert it into a 1×3×112×112 normalized RGB tensor.
    fn preprocess(face: &DynamicImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let rgb = image::imageops::resize(&face.to_rgb8(), size, size, FilterType::Triangle);

        let side = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }
        tensor
    }
}

impl Embedder for ArcFaceEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn embed(&self, face: &DynamicImage) -> Result<Embedding, EmbedderError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(EmbedderError::EmptyCrop);
        }

        let input = Self::preprocess(face);

        let raw: Vec<f32> = {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;
            data.to_vec()
        };

        if raw.len() != self.dimension {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {}-dim embedding, got {}",
                self.dimension,
                raw.len()
            )));
        }

        Ok(Embedding::new(l2_normalize(raw)))
    }
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

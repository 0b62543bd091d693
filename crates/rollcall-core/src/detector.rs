//! SCRFD face detector via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing.
//! Input images are letterboxed to 640×640 RGB; detections are mapped back to
//! pixel coordinates of the original image.

use crate::pipeline::Detector;
use crate::types::{FaceDetection, FaceRegion};
use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy)]
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// Decoded box in original image space, before clamping.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

/// SCRFD-based face detector.
///
/// The ONNX session needs exclusive access per inference, so concurrent
/// callers are serialized on an internal lock.
pub struct ScrfdDetector {
    session: Mutex<Session>,
    score_threshold: f32,
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model. Anchors scoring at or below
    /// `score_threshold` are discarded during decoding.
    pub fn load(model_path: &Path, score_threshold: f32) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            score_threshold,
            stride_indices,
        })
    }

    fn run(&self, image: &DynamicImage) -> Result<Vec<FaceDetection>, DetectorError> {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = preprocess(image);

        let mut candidates = Vec::new();
        {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

            for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
                let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

                let (_, scores) = outputs[score_idx]
                    .try_extract_tensor::<f32>()
                    .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
                let (_, bboxes) = outputs[bbox_idx]
                    .try_extract_tensor::<f32>()
                    .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

                candidates.extend(decode_stride(scores, bboxes, stride, &letterbox, self.score_threshold));
            }
        }

        let mut faces: Vec<FaceDetection> = nms(candidates, SCRFD_NMS_THRESHOLD)
            .into_iter()
            .filter_map(|c| to_detection(&c, width, height))
            .collect();
        faces.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(faces)
    }
}

impl Detector for ScrfdDetector {
    fn name(&self) -> &str {
        "scrfd"
    }

    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceDetection>, DetectorError> {
        self.run(image)
    }
}

/// Letterbox an image into a 1×3×640×640 normalized RGB tensor.
///
/// Padding is filled with the mean, which normalizes to 0.0.
fn preprocess(image: &DynamicImage) -> (Array4<f32>, LetterboxInfo) {
    let size = SCRFD_INPUT_SIZE as f32;
    let scale = (size / image.width() as f32).min(size / image.height() as f32);

    let new_w = ((image.width() as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((image.height() as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let pad_x = (SCRFD_INPUT_SIZE - new_w) as f32 / 2.0;
    let pad_y = (SCRFD_INPUT_SIZE - new_h) as f32 / 2.0;

    let resized = image::imageops::resize(&image.to_rgb8(), new_w, new_h, FilterType::Triangle);

    let side = SCRFD_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    let (off_x, off_y) = (pad_x.floor() as usize, pad_y.floor() as usize);

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (off_x + x as usize, off_y + y as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Discover output tensor ordering by name.
///
/// Named exports ("score_8", "bbox_16", ...) are mapped by name; anything else
/// falls back to the standard positional ordering:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(v) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [v[0], v[1], v[2]]
        }
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode detections for a single stride level into original image space.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Candidate> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut out = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let Some(off) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid) as f32 * s;
        let anchor_y = (cell / grid) as f32 * s;

        let unmap_x = |v: f32| (v - letterbox.pad_x) / letterbox.scale;
        let unmap_y = |v: f32| (v - letterbox.pad_y) / letterbox.scale;

        out.push(Candidate {
            x1: unmap_x(anchor_x - off[0] * s),
            y1: unmap_y(anchor_y - off[1] * s),
            x2: unmap_x(anchor_x + off[2] * s),
            y2: unmap_y(anchor_y + off[3] * s),
            score,
        });
    }
    out
}

/// Clamp a candidate to the image and convert to integer pixel coordinates.
fn to_detection(c: &Candidate, width: u32, height: u32) -> Option<FaceDetection> {
    let x1 = c.x1.round().clamp(0.0, width as f32) as u32;
    let y1 = c.y1.round().clamp(0.0, height as f32) as u32;
    let x2 = c.x2.round().clamp(0.0, width as f32) as u32;
    let y2 = c.y2.round().clamp(0.0, height as f32) as u32;

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    Some(FaceDetection {
        region: FaceRegion {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        },
        confidence: c.score.clamp(0.0, 1.0),
    })
}

/// Non-Maximum Suppression: keep the highest-scoring box of each overlapping group.
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<Candidate> = Vec::new();
    for c in candidates {
        if keep.iter().all(|k| iou(k, &c) <= iou_threshold) {
            keep.push(c);
        }
    }
    keep
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = inter_w * inter_h;

    let area = |c: &Candidate| (c.x2 - c.x1).max(0.0) * (c.y2 - c.y1).max(0.0);
    let union = area(a) + area(b) - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn cand(x: f32, y: f32, w: f32, h: f32, score: f32) -> Candidate {
        Candidate { x1: x, y1: y, x2: x + w, y2: y + h, score }
    }

    #[test]
    fn test_iou_identical() {
        let a = cand(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = cand(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = cand(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let result = nms(
            vec![
                cand(5.0, 5.0, 100.0, 100.0, 0.8),
                cand(0.0, 0.0, 100.0, 100.0, 0.9),
                cand(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(result.len(), 2);
        assert!((result[0].score - 0.9).abs() < 1e-6);
        assert!((result[1].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_to_detection_clamps_to_image() {
        let d = to_detection(&cand(-10.0, 20.4, 100.0, 500.0, 0.93), 64, 480).unwrap();
        assert_eq!(d.region, FaceRegion { x: 0, y: 20, width: 64, height: 460 });
        assert!((d.confidence - 0.93).abs() < 1e-6);
    }

    #[test]
    fn test_to_detection_outside_image() {
        assert!(to_detection(&cand(700.0, 10.0, 50.0, 50.0, 0.9), 640, 480).is_none());
    }

    #[test]
    fn test_decode_stride_maps_back_through_letterbox() {
        // One anchor at grid cell (1, 2) of stride 32 with offsets of one stride.
        let stride = 32;
        let grid = SCRFD_INPUT_SIZE as usize / stride;
        let cell = 2 * grid + 1;
        let idx = cell * SCRFD_ANCHORS_PER_CELL;

        let mut scores = vec![0.0f32; grid * grid * SCRFD_ANCHORS_PER_CELL];
        scores[idx] = 0.9;
        let mut bboxes = vec![0.0f32; scores.len() * 4];
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let letterbox = LetterboxInfo { scale: 2.0, pad_x: 0.0, pad_y: 80.0 };
        let out = decode_stride(&scores, &bboxes, stride, &letterbox, 0.5);

        assert_eq!(out.len(), 1);
        let c = out[0];
        // anchor (32, 64) ± 32 in letterbox space
        assert!((c.x1 - 0.0).abs() < 1e-4);
        assert!((c.x2 - 32.0).abs() < 1e-4);
        assert!((c.y1 - (32.0 - 80.0) / 2.0).abs() < 1e-4);
        assert!((c.y2 - (96.0 - 80.0) / 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_stride_respects_threshold() {
        let stride = 32;
        let n = (SCRFD_INPUT_SIZE as usize / stride).pow(2) * SCRFD_ANCHORS_PER_CELL;
        let scores = vec![0.5f32; n];
        let bboxes = vec![1.0f32; n * 4];
        let letterbox = LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        assert!(decode_stride(&scores, &bboxes, stride, &letterbox, 0.5).is_empty());
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        assert_eq!(discover_output_indices(&names), [(2, 0), (5, 3), (8, 6)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_preprocess_letterbox() {
        // 320×160 scales by 2 to 640×320 with 160 rows of padding top and bottom.
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(320, 160, Rgb([255, 0, 127])));
        let (tensor, lb) = preprocess(&img);

        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 160.0);

        // Padding normalizes to zero.
        assert_eq!(tensor[[0, 0, 10, 10]], 0.0);
        // Content keeps channel order.
        let r = tensor[[0, 0, 320, 320]];
        let g = tensor[[0, 1, 320, 320]];
        assert!((r - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-5);
        assert!((g - (0.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-5);
    }
}

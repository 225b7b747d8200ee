//! The production [`FaceDetector`]: InsightFace SCRFD on ONNX Runtime.
//!
//! Frames are letterboxed to 640×640, the three stride heads (8/16/32) are
//! decoded as anchor-centred edge distances, and overlapping boxes are
//! merged with greedy NMS.

use crate::locator::{FaceDetector, LocateError};
use crate::normalizer::resize_bilinear;
use crate::types::{unpack_argb, Bitmap, BoundingBox, FaceCandidate};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download det_10g.onnx from insightface)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<DetectorError> for LocateError {
    fn from(e: DetectorError) -> Self {
        LocateError::Detector(e.to_string())
    }
}

/// How a frame was fitted into the square detector input.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// Detection in source frame coordinates, before integer rounding.
#[derive(Debug, Clone, Copy)]
struct Detection {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

impl Detection {
    fn to_candidate(self) -> FaceCandidate {
        let x = self.x1.round();
        let y = self.y1.round();
        FaceCandidate {
            bbox: BoundingBox {
                x: x as i32,
                y: y as i32,
                width: (self.x2.round() - x).max(0.0) as u32,
                height: (self.y2.round() - y).max(0.0) as u32,
            },
            confidence: self.score,
        }
    }
}

/// SCRFD session plus its output layout.
pub struct ScrfdDetector {
    session: Session,
    input_size: usize,
    /// Per-stride output indices [(score, bbox)] for strides [8, 16, 32].
    /// Discovered by name at load time; falls back to positional ordering.
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load `det_10g.onnx` (or any SCRFD export with 6 or 9 outputs).
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        // With or without the landmark head: 3 strides × score/bbox(/kps).
        if num_outputs < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs 6 outputs (3 strides × score/bbox), got {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_size: SCRFD_INPUT_SIZE,
            stride_indices,
        })
    }

    /// Detect faces in a color bitmap, returning candidates sorted by confidence.
    pub fn detect_faces(&mut self, bitmap: &Bitmap) -> Result<Vec<FaceCandidate>, DetectorError> {
        if bitmap.is_empty() {
            return Ok(Vec::new());
        }

        let (input, letterbox) = self.preprocess(bitmap);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| {
                    DetectorError::InferenceFailed(format!("scores stride {stride}: {e}"))
                })?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| {
                    DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
                })?;

            all_detections.extend(decode_stride(
                scores,
                bboxes,
                stride,
                self.input_size,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        let kept = nms(all_detections, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = kept.len(), "SCRFD detections after NMS");

        Ok(kept.into_iter().map(Detection::to_candidate).collect())
    }

    /// Letterbox the bitmap into a 640×640 NCHW RGB tensor.
    fn preprocess(&self, bitmap: &Bitmap) -> (Array4<f32>, LetterboxInfo) {
        let width = bitmap.width() as usize;
        let height = bitmap.height() as usize;
        let size = self.input_size;

        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).clamp(1, size);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, size);
        let pad_x = (size - new_w) as f32 / 2.0;
        let pad_y = (size - new_h) as f32 / 2.0;

        let resized = resize_bilinear(bitmap, new_w, new_h);
        let pixels = resized.pixels();

        let pad_x_start = pad_x.floor() as usize;
        let pad_y_start = pad_y.floor() as usize;

        // Padding stays at 0.0, which is SCRFD_MEAN after normalization.
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for y in 0..new_h {
            for x in 0..new_w {
                let [_, r, g, b] = unpack_argb(pixels[y * new_w + x]);
                let (ty, tx) = (y + pad_y_start, x + pad_x_start);
                tensor[[0, 0, ty, tx]] = (r as f32 - SCRFD_MEAN) / SCRFD_STD;
                tensor[[0, 1, ty, tx]] = (g as f32 - SCRFD_MEAN) / SCRFD_STD;
                tensor[[0, 2, ty, tx]] = (b as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, LetterboxInfo { scale, pad_x, pad_y })
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, bitmap: &Bitmap) -> Result<Vec<FaceCandidate>, LocateError> {
        Ok(self.detect_faces(bitmap)?)
    }
}

/// Map each stride to its (score, bbox) output slots.
///
/// Exports with `score_8`/`bbox_8`-style names are mapped by name; anything
/// else gets the stock export order, scores in 0..3 and boxes in 3..6.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let slot = |head: &str, stride: usize| {
        let wanted = format!("{head}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((slot("score", stride)?, slot("bbox", stride)?)))
        .collect();

    match named {
        Some(found) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [found[0], found[1], found[2]]
        }
        None => {
            tracing::info!(
                ?names,
                "SCRFD: unrecognized output names, scores at [0-2] and bboxes at [3-5]"
            );
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Detection> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid * stride) as f32;
        let anchor_cy = (anchor_idx / grid * stride) as f32;

        // Distances to the box edges: [left, top, right, bottom] * stride
        let off = idx * 4;
        let Some(d) = bboxes.get(off..off + 4) else {
            continue;
        };
        let s = stride as f32;

        detections.push(Detection {
            x1: (anchor_cx - d[0] * s - letterbox.pad_x) / letterbox.scale,
            y1: (anchor_cy - d[1] * s - letterbox.pad_y) / letterbox.scale,
            x2: (anchor_cx + d[2] * s - letterbox.pad_x) / letterbox.scale,
            y2: (anchor_cy + d[3] * s - letterbox.pad_y) / letterbox.scale,
            score,
        });
    }

    detections
}

/// Greedy non-maximum suppression, highest score first.
fn nms(mut pending: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    pending.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Detection> = Vec::with_capacity(pending.len());
    for candidate in pending {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

impl Detection {
    fn area(&self) -> f32 {
        (self.x2 - self.x1) * (self.y2 - self.y1)
    }

    fn iou(&self, other: &Detection) -> f32 {
        let overlap_w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let overlap_h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let overlap = overlap_w * overlap_h;
        let union = self.area() + other.area() - overlap;
        if union <= 0.0 {
            return 0.0;
        }
        overlap / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, w: f32, h: f32, score: f32) -> Detection {
        Detection {
            x1: x,
            y1: y,
            x2: x + w,
            y2: y + h,
            score,
        }
    }

    #[test]
    fn test_iou() {
        let a = det(0.0, 0.0, 20.0, 20.0, 1.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);

        // Overlap 10x20 = 200, union 400 + 400 - 200 = 600.
        let b = det(10.0, 0.0, 20.0, 20.0, 1.0);
        assert!((a.iou(&b) - 200.0 / 600.0).abs() < 1e-6);

        let far = det(100.0, 100.0, 5.0, 5.0, 1.0);
        assert_eq!(a.iou(&far), 0.0);
    }

    #[test]
    fn test_nms_keeps_best_of_each_cluster() {
        // Input order is deliberately not score order.
        let kept = nms(
            vec![
                det(3.0, 3.0, 60.0, 60.0, 0.6),
                det(300.0, 10.0, 40.0, 40.0, 0.7),
                det(0.0, 0.0, 60.0, 60.0, 0.95),
            ],
            SCRFD_NMS_THRESHOLD,
        );
        let scores: Vec<f32> = kept.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![0.95, 0.7]);
        assert!(nms(Vec::new(), SCRFD_NMS_THRESHOLD).is_empty());
    }

    #[test]
    fn test_decode_stride_maps_back_through_letterbox() {
        // A 320x240 frame letterboxed into 640x640: scale 2, pad_y 80.
        let letterbox = LetterboxInfo { scale: 2.0, pad_x: 0.0, pad_y: 80.0 };
        let stride = 32;
        let grid = 640 / stride;
        let mut scores = vec![0.0f32; grid * grid * SCRFD_ANCHORS_PER_CELL];
        let mut bboxes = vec![0.0f32; scores.len() * 4];

        // Anchor at cell (x=5, y=6) → centre (160, 192) in letterboxed space.
        let idx = (6 * grid + 5) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let dets = decode_stride(&scores, &bboxes, stride, 640, &letterbox, 0.5);
        assert_eq!(dets.len(), 1);
        let c = dets[0].to_candidate();
        // Letterboxed box (128,160)-(192,224) → frame (64,40)-(96,72).
        assert_eq!(c.bbox, BoundingBox::new(64, 40, 32, 32));
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [8, 16, 32]
            .iter()
            .flat_map(|s| [format!("bbox_{s}"), format!("score_{s}"), format!("kps_{s}")])
            .collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(1, 0), (4, 3), (7, 6)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_candidate_never_negative_size() {
        let c = det(10.0, 10.0, -4.0, 5.0, 0.8).to_candidate();
        assert_eq!(c.bbox.width, 0);
        assert_eq!(c.bbox.height, 5);
    }
}

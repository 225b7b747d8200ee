use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Spatial height of the tensor fed to the embedding network.
pub const TENSOR_HEIGHT: usize = 160;
/// Spatial width of the tensor fed to the embedding network.
pub const TENSOR_WIDTH: usize = 160;
/// Color channels per tensor element (R, G, B).
pub const TENSOR_CHANNELS: usize = 3;
/// Total number of values in a [`NormalizedTensor`].
pub const TENSOR_LEN: usize = TENSOR_HEIGHT * TENSOR_WIDTH * TENSOR_CHANNELS;
/// Length of every [`EmbeddingVector`] (FaceNet 128-d).
pub const EMBEDDING_DIM: usize = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("bitmap buffer holds {actual} pixels, expected {expected}")]
pub struct BitmapSizeError {
    pub expected: usize,
    pub actual: usize,
}

/// A decoded image: `width * height` packed `0xAARRGGBB` pixels, row-major.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Vec<u32>,
}

impl Bitmap {
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<u32>) -> Result<Self, BitmapSizeError> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(BitmapSizeError {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Wrap a buffer the caller built with exactly `width * height` pixels.
    pub(crate) fn from_filled_buffer(width: u32, height: u32, pixels: Vec<u32>) -> Self {
        debug_assert_eq!(pixels.len(), width as usize * height as usize);
        Self {
            width,
            height,
            pixels,
        }
    }

    /// A bitmap where every pixel has the same packed value.
    pub fn filled(width: u32, height: u32, argb: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![argb; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    /// Packed pixel at (x, y). Panics when out of bounds, like slice indexing.
    pub fn pixel(&self, x: u32, y: u32) -> u32 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// Pack 8-bit channels into a `0xAARRGGBB` pixel.
pub fn pack_argb(a: u8, r: u8, g: u8, b: u8) -> u32 {
    (a as u32) << 24 | (r as u32) << 16 | (g as u32) << 8 | b as u32
}

/// Split a `0xAARRGGBB` pixel into `[a, r, g, b]`.
pub fn unpack_argb(pixel: u32) -> [u8; 4] {
    [
        (pixel >> 24 & 0xFF) as u8,
        (pixel >> 16 & 0xFF) as u8,
        (pixel >> 8 & 0xFF) as u8,
        (pixel & 0xFF) as u8,
    ]
}

/// Rectangular region in pixel coordinates.
///
/// Detector output may extend past the frame edges, so the origin is signed.
/// Use [`BoundingBox::clamp_to`] before addressing pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersect with a `width × height` frame.
    ///
    /// The returned box satisfies `0 <= x, y` and `x + width <= frame_width`,
    /// `y + height <= frame_height`. Returns `None` when nothing overlaps.
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<BoundingBox> {
        let x0 = (self.x as i64).clamp(0, frame_width as i64);
        let y0 = (self.y as i64).clamp(0, frame_height as i64);
        let x1 = (self.x as i64 + self.width as i64).clamp(0, frame_width as i64);
        let y1 = (self.y as i64 + self.height as i64).clamp(0, frame_height as i64);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some(BoundingBox {
            x: x0 as i32,
            y: y0 as i32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

/// One face reported by a detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceCandidate {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("tensor shape {actual:?} is not [{TENSOR_HEIGHT}, {TENSOR_WIDTH}, {TENSOR_CHANNELS}]")]
pub struct TensorShapeError {
    pub actual: Vec<usize>,
}

/// Prewhitened face crop in HWC layout, ready for the embedding network.
#[derive(Debug, Clone)]
pub struct NormalizedTensor {
    data: Array3<f32>,
    /// Mean of the raw channel values before whitening.
    pub mean: f32,
    /// Standard deviation actually divided by (after flooring).
    pub std: f32,
}

impl NormalizedTensor {
    pub fn new(data: Array3<f32>, mean: f32, std: f32) -> Result<Self, TensorShapeError> {
        if data.shape() != [TENSOR_HEIGHT, TENSOR_WIDTH, TENSOR_CHANNELS] {
            return Err(TensorShapeError {
                actual: data.shape().to_vec(),
            });
        }
        Ok(Self { data, mean, std })
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("embedding has {actual} values, expected {EMBEDDING_DIM}")]
pub struct EmbeddingLengthError {
    pub actual: usize,
}

/// Fixed-length biometric signature of one capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct EmbeddingVector(Vec<f32>);

impl EmbeddingVector {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Cosine similarity in [-1, 1]. Zero vectors compare as 0.
    pub fn similarity(&self, other: &EmbeddingVector) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.0.iter().zip(other.0.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    pub fn euclidean_distance(&self, other: &EmbeddingVector) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    pub fn distance(&self, other: &EmbeddingVector, metric: DistanceMetric) -> f32 {
        match metric {
            DistanceMetric::Euclidean => self.euclidean_distance(other),
            DistanceMetric::Cosine => 1.0 - self.similarity(other),
        }
    }
}

impl TryFrom<Vec<f32>> for EmbeddingVector {
    type Error = EmbeddingLengthError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        if values.len() != EMBEDDING_DIM {
            return Err(EmbeddingLengthError {
                actual: values.len(),
            });
        }
        Ok(Self(values))
    }
}

impl From<EmbeddingVector> for Vec<f32> {
    fn from(v: EmbeddingVector) -> Self {
        v.0
    }
}

/// Distance used to compare a probe against enrolled templates. Lower is closer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// L2 distance; FaceNet embeddings are unit length, so this lies in [0, 2].
    #[default]
    Euclidean,
    /// `1 - cosine_similarity`, in [0, 2].
    Cosine,
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Euclidean => f.write_str("euclidean"),
            DistanceMetric::Cosine => f.write_str("cosine"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            "cosine" => Ok(DistanceMetric::Cosine),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

/// A stored reference embedding for an authorized identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledTemplate {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub embedding: EmbeddingVector,
}

/// Verdict of one authentication attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthResult {
    pub matched: bool,
    /// Minimum distance across the gallery.
    pub score: f32,
    pub metric: DistanceMetric,
    /// Closest template, reported whether or not it matched.
    pub template_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding_with(head: &[f32]) -> EmbeddingVector {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[..head.len()].copy_from_slice(head);
        EmbeddingVector::try_from(values).unwrap()
    }

    #[test]
    fn test_embedding_rejects_wrong_length() {
        let err = EmbeddingVector::try_from(vec![0.0; 512]).unwrap_err();
        assert_eq!(err.actual, 512);
    }

    #[test]
    fn test_embedding_deserialize_validates_length() {
        let short = serde_json::to_string(&vec![0.5f32; 3]).unwrap();
        assert!(serde_json::from_str::<EmbeddingVector>(&short).is_err());

        let full = serde_json::to_string(&vec![0.5f32; EMBEDDING_DIM]).unwrap();
        let v: EmbeddingVector = serde_json::from_str(&full).unwrap();
        assert_eq!(v.len(), EMBEDDING_DIM);
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = embedding_with(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = embedding_with(&[1.0, 0.0]);
        let b = embedding_with(&[0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
        assert!((a.distance(&b, DistanceMetric::Cosine) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = embedding_with(&[]);
        let b = embedding_with(&[1.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = embedding_with(&[3.0, 0.0]);
        let b = embedding_with(&[0.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_clamp_inside_is_identity() {
        let b = BoundingBox::new(10, 10, 100, 100);
        assert_eq!(b.clamp_to(200, 200), Some(b));
    }

    #[test]
    fn test_clamp_overhanging_box() {
        let b = BoundingBox::new(-20, 150, 100, 100);
        let c = b.clamp_to(200, 200).unwrap();
        assert_eq!(c, BoundingBox::new(0, 150, 80, 50));
        assert!(c.x as u32 + c.width <= 200 && c.y as u32 + c.height <= 200);
    }

    #[test]
    fn test_clamp_disjoint_box() {
        assert_eq!(BoundingBox::new(300, 300, 10, 10).clamp_to(200, 200), None);
        assert_eq!(BoundingBox::new(5, 5, 0, 10).clamp_to(200, 200), None);
    }

    #[test]
    fn test_pack_unpack_channels() {
        let p = pack_argb(0xFF, 0x12, 0x34, 0x56);
        assert_eq!(p, 0xFF12_3456);
        assert_eq!(unpack_argb(p), [0xFF, 0x12, 0x34, 0x56]);
    }

    #[test]
    fn test_bitmap_size_mismatch() {
        let err = Bitmap::from_pixels(4, 4, vec![0; 15]).unwrap_err();
        assert_eq!(err.expected, 16);
    }

    #[test]
    fn test_tensor_shape_checked() {
        let bad = Array3::<f32>::zeros((10, 10, 3));
        assert!(NormalizedTensor::new(bad, 0.0, 1.0).is_err());
        let good = Array3::<f32>::zeros((TENSOR_HEIGHT, TENSOR_WIDTH, TENSOR_CHANNELS));
        assert!(NormalizedTensor::new(good, 0.0, 1.0).is_ok());
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!("Cosine".parse::<DistanceMetric>(), Ok(DistanceMetric::Cosine));
        assert_eq!("l2".parse::<DistanceMetric>(), Ok(DistanceMetric::Euclidean));
        assert!("manhattan".parse::<DistanceMetric>().is_err());
    }
}

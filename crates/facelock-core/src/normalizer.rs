//! Face crop → prewhitened 160×160×3 tensor.
//!
//! Crops the selected face (clamped to the frame), resizes it with bilinear
//! interpolation, splits the packed pixels into R/G/B values and whitens them
//! with a single scalar mean and standard deviation over the whole crop, the
//! way the FaceNet reference pipeline does.

use crate::types::{
    pack_argb, unpack_argb, Bitmap, BoundingBox, NormalizedTensor, TensorShapeError,
    TENSOR_CHANNELS, TENSOR_HEIGHT, TENSOR_LEN, TENSOR_WIDTH,
};
use ndarray::Array3;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("face region {0:?} lies outside the {1}x{2} frame")]
    OutsideFrame(BoundingBox, u32, u32),
    #[error("empty crop")]
    EmptyCrop,
    #[error("non-finite value after whitening (mean={mean}, std={std})")]
    NonFinite { mean: f32, std: f32 },
    #[error(transparent)]
    Shape(#[from] TensorShapeError),
}

/// Scalar statistics used for whitening.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WhiteningStats {
    pub mean: f32,
    /// Standard deviation after flooring at `1/sqrt(n)`.
    pub std: f32,
}

/// Lower bound for the whitening divisor over `n` values.
pub fn std_floor(n: usize) -> f32 {
    1.0 / (n as f32).sqrt()
}

/// Copy the region `bbox ∩ frame` out of `bitmap`.
pub fn crop(bitmap: &Bitmap, bbox: &BoundingBox) -> Result<Bitmap, NormalizeError> {
    let region = bbox
        .clamp_to(bitmap.width(), bitmap.height())
        .ok_or(NormalizeError::OutsideFrame(*bbox, bitmap.width(), bitmap.height()))?;

    if region != *bbox {
        tracing::debug!(requested = ?bbox, clamped = ?region, "face box clamped to frame");
    }

    let x0 = region.x as usize;
    let y0 = region.y as usize;
    let w = region.width as usize;
    let h = region.height as usize;
    let stride = bitmap.width() as usize;
    let src = bitmap.pixels();

    let mut pixels = Vec::with_capacity(w * h);
    for y in y0..y0 + h {
        let row = y * stride;
        pixels.extend_from_slice(&src[row + x0..row + x0 + w]);
    }

    Ok(Bitmap::from_filled_buffer(region.width, region.height, pixels))
}

/// Resize with bilinear interpolation, each of the four channels independently.
pub fn resize_bilinear(bitmap: &Bitmap, new_w: usize, new_h: usize) -> Bitmap {
    let width = bitmap.width() as usize;
    let height = bitmap.height() as usize;
    let frame = bitmap.pixels();

    if width == new_w && height == new_h {
        return bitmap.clone();
    }
    if width == 0 || height == 0 {
        return Bitmap::filled(new_w as u32, new_h as u32, 0);
    }

    let scale_x = width as f32 / new_w as f32;
    let scale_y = height as f32 / new_h as f32;

    let mut resized = Vec::with_capacity(new_w * new_h);
    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = unpack_argb(frame[y0 * width + x0]);
            let tr = unpack_argb(frame[y0 * width + x1]);
            let bl = unpack_argb(frame[y1 * width + x0]);
            let br = unpack_argb(frame[y1 * width + x1]);

            let mut out = [0u8; 4];
            for c in 0..4 {
                let val = tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
                    + tr[c] as f32 * fx * (1.0 - fy)
                    + bl[c] as f32 * (1.0 - fx) * fy
                    + br[c] as f32 * fx * fy;
                out[c] = val.round().clamp(0.0, 255.0) as u8;
            }
            resized.push(pack_argb(out[0], out[1], out[2], out[3]));
        }
    }

    Bitmap::from_filled_buffer(new_w as u32, new_h as u32, resized)
}

/// Split packed pixels into interleaved `[r, g, b, r, g, b, ...]` values.
///
/// Alpha is dropped.
pub fn extract_channels(bitmap: &Bitmap) -> Vec<f32> {
    let mut values = Vec::with_capacity(bitmap.pixels().len() * TENSOR_CHANNELS);
    for &p in bitmap.pixels() {
        values.push(((p >> 16) & 0xFF) as f32);
        values.push(((p >> 8) & 0xFF) as f32);
        values.push((p & 0xFF) as f32);
    }
    values
}

/// Whiten in place: `(v - mean) / max(std, 1/sqrt(n))`.
pub fn prewhiten(values: &mut [f32]) -> Result<WhiteningStats, NormalizeError> {
    if values.is_empty() {
        return Err(NormalizeError::EmptyCrop);
    }

    let n = values.len();
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let variance = values
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / n as f64;

    let mean = mean as f32;
    let std = (variance.sqrt() as f32).max(std_floor(n));

    for v in values.iter_mut() {
        *v = (*v - mean) / std;
    }

    if !mean.is_finite() || !std.is_finite() || values.iter().any(|v| !v.is_finite()) {
        return Err(NormalizeError::NonFinite { mean, std });
    }

    Ok(WhiteningStats { mean, std })
}

/// Produce the network input tensor for the face at `bbox`.
pub fn normalize_face(
    bitmap: &Bitmap,
    bbox: &BoundingBox,
) -> Result<NormalizedTensor, NormalizeError> {
    let face = crop(bitmap, bbox)?;
    let resized = resize_bilinear(&face, TENSOR_WIDTH, TENSOR_HEIGHT);

    let mut values = extract_channels(&resized);
    if values.len() != TENSOR_LEN {
        return Err(TensorShapeError {
            actual: vec![resized.height() as usize, resized.width() as usize, TENSOR_CHANNELS],
        }
        .into());
    }
    let stats = prewhiten(&mut values)?;

    tracing::trace!(
        crop_w = face.width(),
        crop_h = face.height(),
        mean = stats.mean,
        std = stats.std,
        "normalized face"
    );

    let data = Array3::from_shape_vec((TENSOR_HEIGHT, TENSOR_WIDTH, TENSOR_CHANNELS), values)
        .map_err(|_| TensorShapeError {
            actual: vec![TENSOR_LEN],
        })?;
    Ok(NormalizedTensor::new(data, stats.mean, stats.std)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    /// Bitmap whose red channel encodes x and green encodes y.
    fn gradient(width: u32, height: u32) -> Bitmap {
        let pixels = (0..height)
            .flat_map(|y| (0..width).map(move |x| pack_argb(0xFF, x as u8, y as u8, 0x80)))
            .collect();
        Bitmap::from_pixels(width, height, pixels).unwrap()
    }

    fn mean(values: &[f32]) -> f64 {
        values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64
    }

    #[test]
    fn test_crop_exact_region() {
        let bitmap = gradient(200, 200);
        let face = crop(&bitmap, &BoundingBox::new(10, 10, 100, 100)).unwrap();
        assert_eq!((face.width(), face.height()), (100, 100));
        assert_eq!(face.pixel(0, 0), bitmap.pixel(10, 10));
        assert_eq!(face.pixel(99, 99), bitmap.pixel(109, 109));
    }

    #[test]
    fn test_crop_clamps_overhang() {
        let bitmap = gradient(50, 40);
        let face = crop(&bitmap, &BoundingBox::new(30, -5, 100, 20)).unwrap();
        assert_eq!((face.width(), face.height()), (20, 15));
        assert_eq!(face.pixel(0, 0), bitmap.pixel(30, 0));
    }

    #[test]
    fn test_crop_outside_frame() {
        let bitmap = gradient(50, 40);
        let err = crop(&bitmap, &BoundingBox::new(60, 0, 10, 10)).unwrap_err();
        assert!(matches!(err, NormalizeError::OutsideFrame(..)));
    }

    #[test]
    fn test_resize_uniform_stays_uniform() {
        let bitmap = Bitmap::filled(37, 52, 0xFF80_4020);
        let resized = resize_bilinear(&bitmap, 160, 160);
        assert!(resized.pixels().iter().all(|&p| p == 0xFF80_4020));
    }

    #[test]
    fn test_extract_channels_standard_shifts() {
        let bitmap = Bitmap::from_pixels(1, 1, vec![0x7F12_3456]).unwrap();
        assert_eq!(extract_channels(&bitmap), vec![0x12 as f32, 0x34 as f32, 0x56 as f32]);
    }

    #[test]
    fn test_output_shape_independent_of_crop_size() {
        let bitmap = gradient(200, 200);
        for bbox in [
            BoundingBox::new(0, 0, 100, 100),
            BoundingBox::new(5, 7, 37, 52),
            BoundingBox::new(150, 150, 300, 300),
        ] {
            let tensor = normalize_face(&bitmap, &bbox).unwrap();
            assert_eq!(tensor.shape(), &[160, 160, 3]);
        }
    }

    #[test]
    fn test_whitened_mean_near_zero() {
        let bitmap = gradient(120, 90);
        let tensor = normalize_face(&bitmap, &BoundingBox::new(0, 0, 120, 90)).unwrap();
        let values = tensor.data().as_slice().unwrap();
        assert!(mean(values).abs() < 1e-4);
        assert!(values.iter().all(|v| v.is_finite()));
        assert!(tensor.std >= std_floor(TENSOR_LEN));
    }

    #[test]
    fn test_flat_image_uses_std_floor() {
        // Zero variance: the floor keeps the division finite.
        let bitmap = Bitmap::filled(64, 64, 0xFF64_6464);
        let tensor = normalize_face(&bitmap, &BoundingBox::new(0, 0, 64, 64)).unwrap();
        assert_eq!(tensor.std, std_floor(TENSOR_LEN));
        assert!((tensor.mean - 100.0).abs() < 1e-4);
        assert!(tensor.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_prewhiten_random_inputs() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let n = rng.gen_range(3..5000);
            let mut values: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0..255.0)).collect();
            let stats = prewhiten(&mut values).unwrap();

            assert!(stats.std >= std_floor(n));
            assert!(mean(&values).abs() < 1e-3);
            assert!(values.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_prewhiten_rejects_nan() {
        let mut values = vec![1.0, f32::NAN, 3.0];
        assert!(matches!(prewhiten(&mut values), Err(NormalizeError::NonFinite { .. })));
    }

    #[test]
    fn test_prewhiten_empty() {
        assert_eq!(prewhiten(&mut []), Err(NormalizeError::EmptyCrop));
    }
}

//! Offline template preparation: images in, CSV embeddings out.

use anyhow::{bail, Context, Result};
use facelock_core::{
    decode, normalize_face, BoundingBox, EmbeddingEngine, EmbeddingVector, EncodedFrame,
    FaceDetector, FaceLocator, FrameFormat,
};
use std::path::Path;

/// Embed one image file. With a locator the primary face is used; without
/// one the image is taken to be a face crop already.
pub fn embed_image(
    path: &Path,
    locator: Option<&mut FaceLocator<Box<dyn FaceDetector>>>,
    engine: &EmbeddingEngine,
) -> Result<EmbeddingVector> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let Some(format) = FrameFormat::sniff(&data) else {
        bail!("{}: not a JPEG or PNG image", path.display());
    };
    let bitmap = decode(&EncodedFrame::new(data, format, 0, 0, 0))
        .with_context(|| format!("decoding {}", path.display()))?;

    let bbox = match locator {
        Some(locator) => {
            locator
                .locate(&bitmap)
                .with_context(|| format!("locating face in {}", path.display()))?
                .bbox
        }
        None => BoundingBox::new(0, 0, bitmap.width(), bitmap.height()),
    };

    let tensor = normalize_face(&bitmap, &bbox)
        .with_context(|| format!("normalizing {}", path.display()))?;
    let embedding = engine
        .embed(&tensor)
        .with_context(|| format!("embedding {}", path.display()))?;
    tracing::debug!(path = %path.display(), ?bbox, "embedded image");
    Ok(embedding)
}

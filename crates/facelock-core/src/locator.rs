//! Primary-face selection over a pluggable detection capability.

use crate::types::{Bitmap, FaceCandidate};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LocateError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("detector failed: {0}")]
    Detector(String),
}

/// Anything that can find faces in a bitmap.
///
/// Implementations may hold inference state, hence `&mut self`.
pub trait FaceDetector: Send {
    fn detect(&mut self, bitmap: &Bitmap) -> Result<Vec<FaceCandidate>, LocateError>;
}

/// Pick the candidate with the largest box area.
///
/// Among exact ties the first one in detector order wins; callers should not
/// depend on which.
pub fn select_primary(candidates: &[FaceCandidate]) -> Option<&FaceCandidate> {
    let mut best: Option<&FaceCandidate> = None;
    for candidate in candidates {
        match best {
            Some(b) if candidate.bbox.area() <= b.bbox.area() => {}
            _ => best = Some(candidate),
        }
    }
    best
}

/// Runs a detector and reduces its output to the user in front of the camera.
pub struct FaceLocator<D> {
    detector: D,
}

impl<D: FaceDetector> FaceLocator<D> {
    pub fn new(detector: D) -> Self {
        Self { detector }
    }

    pub fn locate(&mut self, bitmap: &Bitmap) -> Result<FaceCandidate, LocateError> {
        let candidates = self.detector.detect(bitmap)?;
        let primary = select_primary(&candidates)
            .copied()
            .ok_or(LocateError::NoFaceDetected)?;

        tracing::debug!(
            candidates = candidates.len(),
            bbox = ?primary.bbox,
            confidence = primary.confidence,
            "primary face selected"
        );
        Ok(primary)
    }

    pub fn detector_mut(&mut self) -> &mut D {
        &mut self.detector
    }
}

impl<D: FaceDetector + ?Sized> FaceDetector for Box<D> {
    fn detect(&mut self, bitmap: &Bitmap) -> Result<Vec<FaceCandidate>, LocateError> {
        (**self).detect(bitmap)
    }
}

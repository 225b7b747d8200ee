//! Encoded camera frames and their decoding into packed-pixel bitmaps.

use crate::types::{pack_argb, Bitmap, BitmapSizeError};
use image::ImageFormat;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("malformed {format:?} data: {source}")]
    Malformed {
        format: FrameFormat,
        #[source]
        source: image::ImageError,
    },
    #[error(transparent)]
    Size(#[from] BitmapSizeError),
}

/// Compression format of an [`EncodedFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// JPEG, including Motion-JPEG buffers from UVC cameras.
    Jpeg,
    Png,
}

impl FrameFormat {
    fn image_format(self) -> ImageFormat {
        match self {
            FrameFormat::Jpeg => ImageFormat::Jpeg,
            FrameFormat::Png => ImageFormat::Png,
        }
    }

    /// Guess the format from leading magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        match image::guess_format(bytes).ok()? {
            ImageFormat::Jpeg => Some(FrameFormat::Jpeg),
            ImageFormat::Png => Some(FrameFormat::Png),
            _ => None,
        }
    }
}

/// One still capture as delivered by the camera. Immutable once built.
#[derive(Clone)]
pub struct EncodedFrame {
    data: Vec<u8>,
    format: FrameFormat,
    /// Resolution the capture target was configured for.
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
}

impl EncodedFrame {
    pub fn new(data: Vec<u8>, format: FrameFormat, width: u32, height: u32, sequence: u32) -> Self {
        Self {
            data,
            format,
            width,
            height,
            sequence,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }
}

impl std::fmt::Debug for EncodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedFrame")
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Decode a compressed frame into a packed `0xAARRGGBB` bitmap.
///
/// No retry: on failure the caller has to request a fresh frame.
pub fn decode(frame: &EncodedFrame) -> Result<Bitmap, DecodeError> {
    if frame.data.is_empty() {
        return Err(DecodeError::Empty);
    }

    let image = image::load_from_memory_with_format(&frame.data, frame.format.image_format())
        .map_err(|source| DecodeError::Malformed {
            format: frame.format,
            source,
        })?
        .into_rgba8();

    let (width, height) = image.dimensions();
    let pixels = image
        .pixels()
        .map(|p| pack_argb(p[3], p[0], p[1], p[2]))
        .collect();

    tracing::debug!(width, height, sequence = frame.sequence, "decoded frame");

    Ok(Bitmap::from_pixels(width, height, pixels)?)
}

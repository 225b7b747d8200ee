//! Motion-JPEG buffer cleanup.
//!
//! UVC drivers hand back mmap buffers that are often larger than the JPEG
//! they carry, padded with zeros or stale bytes from an earlier frame.

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("buffer does not start with a JPEG SOI marker")]
    MissingSoi,
    #[error("buffer has no JPEG EOI marker")]
    MissingEoi,
}

/// Slice `buf` down to the JPEG stream it holds, ending at the last EOI.
pub fn trim_jpeg(buf: &[u8]) -> Result<&[u8], FrameError> {
    if !buf.starts_with(&SOI) {
        return Err(FrameError::MissingSoi);
    }
    let end = buf
        .windows(2)
        .rposition(|w| w == EOI)
        .ok_or(FrameError::MissingEoi)?;
    Ok(&buf[..end + EOI.len()])
}

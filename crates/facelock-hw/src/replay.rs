//! Camera backend that replays a still image from disk.
//!
//! Stands in for hardware on machines without a webcam and in tests: it
//! presents a single front-facing camera whose only output size is the
//! image's own resolution.

use crate::capture::{
    CameraBackend, CameraCharacteristics, CameraError, CameraEvent, CaptureTarget, EventSink,
    LensFacing, Permission, Size,
};
use facelock_core::{decode, EncodedFrame, FrameFormat};
use std::path::Path;

pub const REPLAY_CAMERA_ID: &str = "replay";

pub struct ReplayBackend {
    data: Vec<u8>,
    format: FrameFormat,
    size: Size,
    opened: bool,
    configured: bool,
    sequence: u32,
}

impl ReplayBackend {
    pub fn new(data: Vec<u8>) -> Result<Self, CameraError> {
        let format = FrameFormat::sniff(&data).ok_or_else(|| {
            CameraError::DeviceUnavailable("replay image is neither JPEG nor PNG".into())
        })?;
        let probe = EncodedFrame::new(data, format, 0, 0, 0);
        let bitmap = decode(&probe)
            .map_err(|e| CameraError::DeviceUnavailable(format!("replay image: {e}")))?;

        Ok(Self {
            data: probe.data().to_vec(),
            format,
            size: Size {
                width: bitmap.width(),
                height: bitmap.height(),
            },
            opened: false,
            configured: false,
            sequence: 0,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, CameraError> {
        let data = std::fs::read(path)
            .map_err(|e| CameraError::DeviceUnavailable(format!("{}: {e}", path.display())))?;
        tracing::info!(
            path = %path.display(),
            bytes = data.len(),
            "replaying still image as camera"
        );
        Self::new(data)
    }

    pub fn size(&self) -> Size {
        self.size
    }
}

impl CameraBackend for ReplayBackend {
    fn permission(&mut self) -> Permission {
        Permission::Granted
    }

    fn camera_ids(&mut self) -> Result<Vec<String>, CameraError> {
        Ok(vec![REPLAY_CAMERA_ID.to_string()])
    }

    fn characteristics(&mut self, id: &str) -> Result<CameraCharacteristics, CameraError> {
        if id != REPLAY_CAMERA_ID {
            return Err(CameraError::DeviceUnavailable(id.to_string()));
        }
        Ok(CameraCharacteristics {
            id: id.to_string(),
            name: "still image replay".into(),
            lens_facing: LensFacing::Front,
            output_sizes: vec![self.size],
        })
    }

    fn open(&mut self, id: &str, events: EventSink) -> Result<(), CameraError> {
        if id != REPLAY_CAMERA_ID {
            return Err(CameraError::DeviceUnavailable(id.to_string()));
        }
        self.opened = true;
        events.post(CameraEvent::Opened);
        Ok(())
    }

    fn configure(&mut self, target: CaptureTarget, events: EventSink) -> Result<(), CameraError> {
        if !self.opened {
            return Err(CameraError::DeviceError("configure before open".into()));
        }
        if target.size != self.size {
            events.post(CameraEvent::ConfigFailed(format!(
                "replay image is {}x{}, target asked for {}x{}",
                self.size.width, self.size.height, target.size.width, target.size.height
            )));
            return Ok(());
        }
        self.configured = true;
        events.post(CameraEvent::Configured);
        Ok(())
    }

    fn capture(&mut self, events: EventSink) -> Result<(), CameraError> {
        if !self.configured {
            return Err(CameraError::DeviceError("capture before configure".into()));
        }
        self.sequence = self.sequence.wrapping_add(1);
        events.post(CameraEvent::Captured(EncodedFrame::new(
            self.data.clone(),
            self.format,
            self.size.width,
            self.size.height,
            self.sequence,
        )));
        Ok(())
    }

    fn close(&mut self) {
        self.opened = false;
        self.configured = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureSession, CaptureState};
    use std::io::Cursor;
    use std::time::Duration;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([40, 80, 120, 255]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_session_over_replay() {
        let mut backend = ReplayBackend::new(png(64, 48)).unwrap();
        let mut session = CaptureSession::new(&mut backend, Duration::from_millis(50));

        session.open().unwrap();
        assert_eq!(session.target().unwrap().size, Size { width: 64, height: 48 });

        let first = session.capture().unwrap();
        let second = session.capture_and_close().unwrap();
        assert_eq!(first.format(), FrameFormat::Png);
        assert_eq!((second.width, second.height), (64, 48));
        assert_eq!(second.sequence, first.sequence + 1);
        assert_eq!(session.state(), CaptureState::Closed);

        let bitmap = decode(&second).unwrap();
        assert_eq!((bitmap.width(), bitmap.height()), (64, 48));
    }

    #[test]
    fn test_rejects_non_image() {
        assert!(matches!(
            ReplayBackend::new(b"not an image".to_vec()),
            Err(CameraError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(ReplayBackend::from_file(Path::new("/nonexistent/face.jpg")).is_err());
    }
}

//! V4L2 camera backend via the `v4l` crate.
//!
//! Speaks the [`CameraBackend`] protocol over UVC devices streaming
//! Motion-JPEG. Commands complete on the calling thread and post their
//! outcome to the session queue before returning.

use crate::capture::{
    CameraBackend, CameraCharacteristics, CameraError, CameraEvent, CaptureTarget, EventSink,
    LensFacing, Permission, Size,
};
use crate::frame;
use facelock_core::{EncodedFrame, FrameFormat};
use serde::Serialize;
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const MJPG: &[u8; 4] = b"MJPG";
const MAX_DEVICES: u32 = 16;

/// Info about a discovered V4L2 capture device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// List V4L2 nodes that support video capture.
pub fn list_devices() -> Vec<DeviceInfo> {
    let mut devices = Vec::new();

    for path in device_nodes() {
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            continue;
        }
        devices.push(DeviceInfo {
            path,
            name: caps.card.clone(),
            driver: caps.driver.clone(),
            bus: caps.bus.clone(),
        });
    }

    devices
}

fn device_nodes() -> impl Iterator<Item = String> {
    (0..MAX_DEVICES)
        .map(|i| format!("/dev/video{i}"))
        .filter(|p| Path::new(p).exists())
}

/// Sizes the device offers for MJPG. Stepwise ranges contribute their maximum.
fn mjpeg_sizes(device: &Device) -> Result<Vec<Size>, CameraError> {
    let sizes = device
        .enum_framesizes(FourCC::new(MJPG))
        .map_err(|e| CameraError::DeviceError(format!("enumerating frame sizes: {e}")))?;

    Ok(sizes
        .into_iter()
        .map(|fs| match fs.size {
            FrameSizeEnum::Discrete(d) => Size {
                width: d.width,
                height: d.height,
            },
            FrameSizeEnum::Stepwise(s) => Size {
                width: s.max_width,
                height: s.max_height,
            },
        })
        .collect())
}

struct OpenDevice {
    path: String,
    device: Device,
    configured: Option<Size>,
}

/// UVC webcams over V4L2.
pub struct V4l2Backend {
    /// Device nodes treated as user-facing; empty means every capture device.
    front_devices: Vec<String>,
    /// Frames discarded after stream-on while auto exposure settles.
    warmup_frames: u32,
    open: Option<OpenDevice>,
}

impl V4l2Backend {
    pub fn new(front_devices: Vec<String>, warmup_frames: u32) -> Self {
        Self {
            front_devices,
            warmup_frames,
            open: None,
        }
    }

    fn lens_facing(&self, path: &str) -> LensFacing {
        if self.front_devices.is_empty() || self.front_devices.iter().any(|d| d == path) {
            LensFacing::Front
        } else {
            LensFacing::External
        }
    }

    fn grab(&self, dev: &OpenDevice, size: Size) -> Result<EncodedFrame, CameraError> {
        let mut stream = MmapStream::with_buffers(&dev.device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::DeviceError(format!("failed to create mmap stream: {e}")))?;

        for _ in 0..self.warmup_frames {
            stream
                .next()
                .map_err(|e| CameraError::DeviceError(format!("failed to dequeue buffer: {e}")))?;
        }

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::DeviceError(format!("failed to dequeue buffer: {e}")))?;

        let used = (meta.bytesused as usize).min(buf.len());
        let jpeg = frame::trim_jpeg(&buf[..used])
            .map_err(|e| CameraError::DeviceError(format!("bad MJPG buffer: {e}")))?;

        Ok(EncodedFrame::new(
            jpeg.to_vec(),
            FrameFormat::Jpeg,
            size.width,
            size.height,
            meta.sequence,
        ))
    }
}

impl CameraBackend for V4l2Backend {
    /// Denied only when device nodes exist and none can be opened read-write.
    fn permission(&mut self) -> Permission {
        let mut any = false;
        for path in device_nodes() {
            any = true;
            if std::fs::OpenOptions::new().read(true).write(true).open(&path).is_ok() {
                return Permission::Granted;
            }
        }
        if any {
            Permission::Denied
        } else {
            Permission::Granted
        }
    }

    fn camera_ids(&mut self) -> Result<Vec<String>, CameraError> {
        let ids: Vec<String> = list_devices().into_iter().map(|d| d.path).collect();
        tracing::debug!(?ids, "enumerated V4L2 capture devices");
        Ok(ids)
    }

    fn characteristics(&mut self, id: &str) -> Result<CameraCharacteristics, CameraError> {
        let device = Device::with_path(id)
            .map_err(|e| CameraError::DeviceUnavailable(format!("{id}: {e}")))?;
        let caps = device
            .query_caps()
            .map_err(|e| CameraError::DeviceError(format!("{id}: query capabilities: {e}")))?;

        Ok(CameraCharacteristics {
            id: id.to_string(),
            name: caps.card,
            lens_facing: self.lens_facing(id),
            output_sizes: mjpeg_sizes(&device)?,
        })
    }

    fn open(&mut self, id: &str, events: EventSink) -> Result<(), CameraError> {
        let device = Device::with_path(id).map_err(|e| {
            if e.kind() == std::io::ErrorKind::ResourceBusy {
                CameraError::DeviceError(format!("{id}: device busy"))
            } else {
                CameraError::DeviceUnavailable(format!("{id}: {e}"))
            }
        })?;

        tracing::info!(device = id, "opened camera");
        self.open = Some(OpenDevice {
            path: id.to_string(),
            device,
            configured: None,
        });
        events.post(CameraEvent::Opened);
        Ok(())
    }

    fn configure(&mut self, target: CaptureTarget, events: EventSink) -> Result<(), CameraError> {
        let Some(dev) = self.open.as_mut() else {
            return Err(CameraError::DeviceError("configure before open".into()));
        };

        let mut fmt = match dev.device.format() {
            Ok(f) => f,
            Err(e) => {
                events.post(CameraEvent::ConfigFailed(format!("failed to get format: {e}")));
                return Ok(());
            }
        };
        fmt.fourcc = FourCC::new(MJPG);
        fmt.width = target.size.width;
        fmt.height = target.size.height;

        match dev.device.set_format(&fmt) {
            Ok(negotiated) if negotiated.fourcc == FourCC::new(MJPG) => {
                tracing::info!(
                    width = negotiated.width,
                    height = negotiated.height,
                    fourcc = ?negotiated.fourcc,
                    "negotiated format"
                );
                dev.configured = Some(Size {
                    width: negotiated.width,
                    height: negotiated.height,
                });
                events.post(CameraEvent::Configured);
            }
            Ok(negotiated) => events.post(CameraEvent::ConfigFailed(format!(
                "driver negotiated {:?} instead of MJPG",
                negotiated.fourcc
            ))),
            Err(e) => events.post(CameraEvent::ConfigFailed(format!("failed to set format: {e}"))),
        }
        Ok(())
    }

    fn capture(&mut self, events: EventSink) -> Result<(), CameraError> {
        let Some(dev) = self.open.as_ref() else {
            return Err(CameraError::DeviceError("capture before open".into()));
        };
        let Some(size) = dev.configured else {
            return Err(CameraError::DeviceError("capture before configure".into()));
        };

        match self.grab(dev, size) {
            Ok(frame) => events.post(CameraEvent::Captured(frame)),
            Err(_) if !Path::new(&dev.path).exists() => events.post(CameraEvent::Disconnected),
            Err(CameraError::DeviceError(msg)) => events.post(CameraEvent::DeviceError(msg)),
            Err(e) => events.post(CameraEvent::DeviceError(e.to_string())),
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(dev) = self.open.take() {
            tracing::debug!(device = %dev.path, "closed camera");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lens_facing_defaults_to_front() {
        let backend = V4l2Backend::new(Vec::new(), 0);
        assert_eq!(backend.lens_facing("/dev/video4"), LensFacing::Front);
    }

    #[test]
    fn test_lens_facing_respects_configured_devices() {
        let backend = V4l2Backend::new(vec!["/dev/video2".into()], 0);
        assert_eq!(backend.lens_facing("/dev/video2"), LensFacing::Front);
        assert_eq!(backend.lens_facing("/dev/video0"), LensFacing::External);
    }

    #[test]
    fn test_commands_before_open_fail() {
        let (tx, _rx) = std::sync::mpsc::channel();
        let sink = crate::capture::tests::sink(tx);
        let mut backend = V4l2Backend::new(Vec::new(), 0);
        assert!(backend.capture(sink.clone()).is_err());
        let target = CaptureTarget {
            size: Size { width: 640, height: 480 },
            format: FrameFormat::Jpeg,
        };
        assert!(backend.configure(target, sink).is_err());
        backend.close();
    }
}

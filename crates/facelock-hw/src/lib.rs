//! facelock-hw: camera access for the face-unlock pipeline.
//!
//! A capture session state machine over pluggable backends: V4L2 webcams
//! streaming Motion-JPEG, or a still image replayed from disk.

pub mod camera;
pub mod capture;
pub mod frame;
pub mod replay;

pub use camera::{list_devices, DeviceInfo, V4l2Backend};
pub use capture::{
    CameraBackend, CameraCharacteristics, CameraError, CameraEvent, CaptureSession, CaptureState,
    CaptureTarget, EventSink, LensFacing, Permission, Size,
};
pub use replay::ReplayBackend;

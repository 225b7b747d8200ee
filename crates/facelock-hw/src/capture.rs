//! Capture protocol as an explicit state machine.
//!
//! A [`CaptureSession`] drives a [`CameraBackend`] through
//! open → configure → capture. Backends answer each command by posting a
//! [`CameraEvent`] into the session's queue; the session consumes the queue on
//! the calling thread. Device and capture-target resources are released on
//! every exit path, including errors and `Drop`.

use facelock_core::{EncodedFrame, FrameFormat};
use serde::Serialize;
use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("no usable camera: {0}")]
    DeviceUnavailable(String),
    #[error("session configuration failed: {0}")]
    ConfigurationFailed(String),
    #[error("device error: {0}")]
    DeviceError(String),
    #[error("camera disconnected")]
    Disconnected,
    #[error("timed out waiting for camera while {0}")]
    Timeout(CaptureState),
    #[error("cannot {op} while {state}")]
    InvalidState { op: &'static str, state: CaptureState },
}

/// Lifecycle of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CaptureState {
    Closed,
    Opening,
    Opened,
    ConfiguringSession,
    Ready,
    Capturing,
    Error,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaptureState::Closed => "closed",
            CaptureState::Opening => "opening",
            CaptureState::Opened => "opened",
            CaptureState::ConfiguringSession => "configuring",
            CaptureState::Ready => "ready",
            CaptureState::Capturing => "capturing",
            CaptureState::Error => "in error",
        };
        f.write_str(s)
    }
}

/// Which way a camera points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LensFacing {
    /// Towards the user.
    Front,
    Back,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Static description of one camera.
#[derive(Debug, Clone, Serialize)]
pub struct CameraCharacteristics {
    pub id: String,
    pub name: String,
    pub lens_facing: LensFacing,
    /// Resolutions available for the encoded (JPEG) output.
    pub output_sizes: Vec<Size>,
}

/// Largest output resolution by area; first one wins on ties.
pub fn max_area_size(sizes: &[Size]) -> Option<Size> {
    sizes.iter().copied().fold(None, |best, s| match best {
        Some(b) if s.area() <= b.area() => Some(b),
        _ => Some(s),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
}

/// Buffer the capture request writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTarget {
    pub size: Size,
    pub format: FrameFormat,
}

/// Asynchronous outcome of a backend command.
#[derive(Debug)]
pub enum CameraEvent {
    Opened,
    Configured,
    ConfigFailed(String),
    Captured(EncodedFrame),
    Disconnected,
    DeviceError(String),
}

/// Handle backends use to post events to the owning session.
#[derive(Clone)]
pub struct EventSink(Sender<CameraEvent>);

impl EventSink {
    pub fn post(&self, event: CameraEvent) {
        if let Err(e) = self.0.send(event) {
            tracing::trace!(event = ?e.0, "camera event dropped, session gone");
        }
    }
}

/// A camera stack that speaks the open/configure/capture protocol.
///
/// Commands may fail synchronously; otherwise their outcome arrives as a
/// [`CameraEvent`] on the sink, possibly from another thread. `close` must be
/// idempotent.
pub trait CameraBackend: Send {
    fn permission(&mut self) -> Permission;
    fn camera_ids(&mut self) -> Result<Vec<String>, CameraError>;
    fn characteristics(&mut self, id: &str) -> Result<CameraCharacteristics, CameraError>;
    fn open(&mut self, id: &str, events: EventSink) -> Result<(), CameraError>;
    fn configure(&mut self, target: CaptureTarget, events: EventSink) -> Result<(), CameraError>;
    fn capture(&mut self, events: EventSink) -> Result<(), CameraError>;
    fn close(&mut self);
}

/// One exclusive use of a camera backend.
pub struct CaptureSession<'a, B: CameraBackend + ?Sized> {
    backend: &'a mut B,
    state: CaptureState,
    tx: Sender<CameraEvent>,
    rx: Receiver<CameraEvent>,
    camera_id: Option<String>,
    target: Option<CaptureTarget>,
    device_held: bool,
    timeout: Duration,
}

impl<'a, B: CameraBackend + ?Sized> CaptureSession<'a, B> {
    pub fn new(backend: &'a mut B, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            backend,
            state: CaptureState::Closed,
            tx,
            rx,
            camera_id: None,
            target: None,
            device_held: false,
            timeout,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn camera_id(&self) -> Option<&str> {
        self.camera_id.as_deref()
    }

    pub fn target(&self) -> Option<CaptureTarget> {
        self.target
    }

    fn sink(&self) -> EventSink {
        EventSink(self.tx.clone())
    }

    fn transition(&mut self, next: CaptureState) {
        tracing::debug!(from = %self.state, to = %next, "capture session");
        self.state = next;
    }

    fn expect_state(&self, op: &'static str, expected: CaptureState) -> Result<(), CameraError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CameraError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    /// Release everything and enter `Error`.
    fn fail(&mut self, err: CameraError) -> CameraError {
        tracing::warn!(state = %self.state, error = %err, "capture session failed");
        self.release();
        self.transition(CaptureState::Error);
        err
    }

    fn release(&mut self) {
        if self.device_held {
            self.backend.close();
            self.device_held = false;
        }
        self.target = None;
        while self.rx.try_recv().is_ok() {}
    }

    fn next_event(&mut self) -> Result<CameraEvent, CameraError> {
        match self.rx.recv_timeout(self.timeout) {
            Ok(event) => Ok(event),
            // Unreachable while we hold a sender, but treat it like a timeout.
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                Err(CameraError::Timeout(self.state))
            }
        }
    }

    /// Surface device errors that arrived while nothing was waiting.
    fn check_pending_errors(&mut self) -> Result<(), CameraError> {
        while let Ok(event) = self.rx.try_recv() {
            match event {
                CameraEvent::Disconnected => return Err(CameraError::Disconnected),
                CameraEvent::DeviceError(msg) => return Err(CameraError::DeviceError(msg)),
                other => tracing::debug!(event = ?other, "discarding stale camera event"),
            }
        }
        Ok(())
    }

    fn resolve_front_camera(&mut self) -> Result<CameraCharacteristics, CameraError> {
        for id in self.backend.camera_ids()? {
            let chars = match self.backend.characteristics(&id) {
                Ok(c) => c,
                Err(e) => {
                    tracing::debug!(camera = %id, error = %e, "skipping camera");
                    continue;
                }
            };
            if chars.lens_facing == LensFacing::Front {
                return Ok(chars);
            }
        }
        Err(CameraError::DeviceUnavailable("no front-facing camera".into()))
    }

    /// Run the open and configure handshake, ending in `Ready`.
    ///
    /// Permission and front-camera problems leave the session `Closed`; any
    /// failure after that leaves it in `Error` with resources released.
    pub fn open(&mut self) -> Result<(), CameraError> {
        self.expect_state("open", CaptureState::Closed)?;

        if self.backend.permission() != Permission::Granted {
            return Err(CameraError::PermissionDenied);
        }
        let chars = self.resolve_front_camera()?;

        self.transition(CaptureState::Opening);
        self.camera_id = Some(chars.id.clone());
        // Held from here on: close() may be needed even if open never completes.
        self.device_held = true;
        let events = self.sink();
        if let Err(e) = self.backend.open(&chars.id, events) {
            return Err(self.fail(e));
        }

        loop {
            match self.next_event() {
                Ok(CameraEvent::Opened) => break,
                Ok(CameraEvent::Disconnected) => return Err(self.fail(CameraError::Disconnected)),
                Ok(CameraEvent::DeviceError(msg)) => {
                    return Err(self.fail(CameraError::DeviceError(msg)))
                }
                Ok(other) => tracing::debug!(event = ?other, "ignoring event while opening"),
                Err(e) => return Err(self.fail(e)),
            }
        }
        self.transition(CaptureState::Opened);

        let Some(size) = max_area_size(&chars.output_sizes) else {
            return Err(self.fail(CameraError::ConfigurationFailed(
                "camera reports no JPEG output sizes".into(),
            )));
        };
        let target = CaptureTarget {
            size,
            format: FrameFormat::Jpeg,
        };
        self.target = Some(target);
        tracing::info!(
            camera = %chars.id,
            width = size.width,
            height = size.height,
            "capture target created"
        );

        self.transition(CaptureState::ConfiguringSession);
        let events = self.sink();
        if let Err(e) = self.backend.configure(target, events) {
            return Err(self.fail(e));
        }

        loop {
            match self.next_event() {
                Ok(CameraEvent::Configured) => break,
                Ok(CameraEvent::ConfigFailed(msg)) => {
                    return Err(self.fail(CameraError::ConfigurationFailed(msg)))
                }
                Ok(CameraEvent::Disconnected) => return Err(self.fail(CameraError::Disconnected)),
                Ok(CameraEvent::DeviceError(msg)) => {
                    return Err(self.fail(CameraError::DeviceError(msg)))
                }
                Ok(other) => tracing::debug!(event = ?other, "ignoring event while configuring"),
                Err(e) => return Err(self.fail(e)),
            }
        }
        self.transition(CaptureState::Ready);
        Ok(())
    }

    /// Issue one still-capture request. Only valid in `Ready`; returns there
    /// on success.
    pub fn capture(&mut self) -> Result<EncodedFrame, CameraError> {
        self.expect_state("capture", CaptureState::Ready)?;
        if let Err(e) = self.check_pending_errors() {
            return Err(self.fail(e));
        }

        self.transition(CaptureState::Capturing);
        let events = self.sink();
        if let Err(e) = self.backend.capture(events) {
            return Err(self.fail(e));
        }

        loop {
            match self.next_event() {
                Ok(CameraEvent::Captured(frame)) => {
                    tracing::debug!(?frame, "frame captured");
                    self.transition(CaptureState::Ready);
                    return Ok(frame);
                }
                Ok(CameraEvent::Disconnected) => return Err(self.fail(CameraError::Disconnected)),
                Ok(CameraEvent::DeviceError(msg)) => {
                    return Err(self.fail(CameraError::DeviceError(msg)))
                }
                Ok(other) => tracing::debug!(event = ?other, "ignoring event while capturing"),
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    /// Capture one frame, then tear the session down to `Closed` whatever the
    /// outcome.
    pub fn capture_and_close(&mut self) -> Result<EncodedFrame, CameraError> {
        let result = self.capture();
        self.close();
        result
    }

    /// Release device and capture target; valid from any state.
    pub fn close(&mut self) {
        self.release();
        if self.state != CaptureState::Closed {
            self.transition(CaptureState::Closed);
        }
    }
}

impl<B: CameraBackend + ?Sized> Drop for CaptureSession<'_, B> {
    fn drop(&mut self) {
        self.close();
    }
}

//! Authentication attempts: capture → decode → locate → normalize → embed →
//! decide, run on a dedicated worker thread per attempt.

use facelock_core::{
    decide, decode, normalize_face, templates, AuthResult, DecisionError, DecisionPolicy,
    DecodeError, EmbeddingEngine, EmbeddingModel, EngineError, EnrolledTemplate, FaceDetector,
    FaceLocator, LocateError, NormalizeError, OnnxEmbedder,
};
use facelock_hw::{CameraBackend, CameraError, CaptureSession};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("camera session configuration failed: {0}")]
    ConfigurationFailed(String),
    #[error("camera error: {0}")]
    DeviceError(String),
    #[error("timed out waiting for camera while {0}")]
    Timeout(String),
    #[error("frame decode failed: {0}")]
    DecodeFailure(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("face normalization failed: {0}")]
    NormalizationFailure(String),
    #[error("face recognition engine unavailable")]
    EngineUnavailable,
    #[error("inference failed: {0}")]
    InferenceFailure(String),
    #[error("no enrolled templates")]
    NoEnrolledTemplates,
    #[error("an authentication attempt is already running")]
    Busy,
    #[error("authentication attempt cancelled")]
    Cancelled,
    #[error("attempt worker failed: {0}")]
    Worker(String),
}

impl From<CameraError> for AuthError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::PermissionDenied => AuthError::PermissionDenied,
            CameraError::DeviceUnavailable(msg) => AuthError::DeviceUnavailable(msg),
            CameraError::ConfigurationFailed(msg) => AuthError::ConfigurationFailed(msg),
            CameraError::DeviceError(msg) => AuthError::DeviceError(msg),
            CameraError::Timeout(state) => AuthError::Timeout(state.to_string()),
            e @ (CameraError::Disconnected | CameraError::InvalidState { .. }) => {
                AuthError::DeviceError(e.to_string())
            }
        }
    }
}

impl From<DecodeError> for AuthError {
    fn from(e: DecodeError) -> Self {
        AuthError::DecodeFailure(e.to_string())
    }
}

impl From<LocateError> for AuthError {
    fn from(e: LocateError) -> Self {
        match e {
            LocateError::NoFaceDetected => AuthError::NoFaceDetected,
            LocateError::Detector(msg) => {
                AuthError::InferenceFailure(format!("face detection: {msg}"))
            }
        }
    }
}

impl From<NormalizeError> for AuthError {
    fn from(e: NormalizeError) -> Self {
        AuthError::NormalizationFailure(e.to_string())
    }
}

impl From<EngineError> for AuthError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Unavailable
            | EngineError::ModelNotFound(_)
            | EngineError::MissingTensor(_) => AuthError::EngineUnavailable,
            EngineError::InferenceFailed(msg) => AuthError::InferenceFailure(msg),
            EngineError::Ort(e) => AuthError::InferenceFailure(e.to_string()),
        }
    }
}

impl From<DecisionError> for AuthError {
    fn from(e: DecisionError) -> Self {
        match e {
            DecisionError::NoEnrolledTemplates => AuthError::NoEnrolledTemplates,
        }
    }
}

/// Outcome of the most recent attempt, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub id: String,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AuthResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub engine_available: bool,
    pub busy: bool,
    pub templates: usize,
    pub attempts: u64,
    pub last_attempt: Option<AttemptRecord>,
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the active attempt however it ends.
struct ActiveGuard<'a>(&'a Mutex<Option<u64>>);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *lock(self.0) = None;
    }
}

/// Owns the pipeline stages and serializes attempts over them.
pub struct AuthEngine {
    camera: Mutex<Box<dyn CameraBackend>>,
    locator: Mutex<FaceLocator<Box<dyn FaceDetector>>>,
    embedder: Arc<EmbeddingEngine>,
    gallery: RwLock<Vec<EnrolledTemplate>>,
    policy: DecisionPolicy,
    capture_timeout: Duration,
    /// Generation of the attempt in flight; `cancel` reads it under this lock.
    active: Mutex<Option<u64>>,
    /// Bumped by every new attempt and by `cancel`.
    generation: AtomicU64,
    attempts: AtomicU64,
    last_attempt: Mutex<Option<AttemptRecord>>,
}

impl AuthEngine {
    pub fn new(
        camera: Box<dyn CameraBackend>,
        detector: Box<dyn FaceDetector>,
        embedder: Arc<EmbeddingEngine>,
        gallery: Vec<EnrolledTemplate>,
        policy: DecisionPolicy,
        capture_timeout: Duration,
    ) -> Self {
        Self {
            camera: Mutex::new(camera),
            locator: Mutex::new(FaceLocator::new(detector)),
            embedder,
            gallery: RwLock::new(gallery),
            policy,
            capture_timeout,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            last_attempt: Mutex::new(None),
        }
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Claim the attempt slot and its generation in one step.
    fn begin(&self) -> Result<(ActiveGuard<'_>, u64), AuthError> {
        let mut active = lock(&self.active);
        if active.is_some() {
            return Err(AuthError::Busy);
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *active = Some(generation);
        Ok((ActiveGuard(&self.active), generation))
    }

    /// Run one attempt to completion on a dedicated worker thread.
    ///
    /// Fails fast with [`AuthError::Busy`] if another attempt is in flight.
    pub fn authenticate(&self) -> Result<AuthResult, AuthError> {
        let (_active, generation) = self.begin()?;
        let id = Uuid::new_v4().to_string();
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        tracing::info!(attempt = %id, "authentication attempt started");

        let outcome = std::thread::scope(|scope| {
            let worker = std::thread::Builder::new()
                .name("facelock-attempt".into())
                .spawn_scoped(scope, || self.run_attempt(generation))
                .map_err(|e| AuthError::Worker(format!("failed to spawn worker: {e}")))?;
            worker
                .join()
                .map_err(|_| AuthError::Worker("worker panicked".into()))?
        });

        let outcome = match outcome {
            Ok(_) if !self.is_current(generation) => Err(AuthError::Cancelled),
            other => other,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(result) => tracing::info!(
                attempt = %id,
                matched = result.matched,
                score = result.score,
                elapsed_ms,
                "authentication attempt finished"
            ),
            Err(e) => tracing::warn!(
                attempt = %id,
                error = %e,
                elapsed_ms,
                "authentication attempt failed"
            ),
        }

        *lock(&self.last_attempt) = Some(AttemptRecord {
            id,
            elapsed_ms,
            result: outcome.as_ref().ok().cloned(),
            error: outcome.as_ref().err().map(|e| e.to_string()),
        });
        outcome
    }

    /// Supersede the running attempt. Returns false if none was running.
    pub fn cancel(&self) -> bool {
        let active = lock(&self.active);
        let Some(generation) = *active else {
            return false;
        };
        if self
            .generation
            .compare_exchange(generation, generation + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::info!("authentication attempt cancelled");
        }
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn ensure_current(&self, generation: u64) -> Result<(), AuthError> {
        if self.is_current(generation) {
            Ok(())
        } else {
            Err(AuthError::Cancelled)
        }
    }

    fn run_attempt(&self, generation: u64) -> Result<AuthResult, AuthError> {
        // A disabled engine disables the whole pipeline, camera included.
        if !self.embedder.is_available() {
            return Err(AuthError::EngineUnavailable);
        }

        let frame = {
            let mut camera = lock(&self.camera);
            let mut session = CaptureSession::new(&mut **camera, self.capture_timeout);
            session.open()?;
            session.capture_and_close()?
        };
        self.ensure_current(generation)?;

        let bitmap = decode(&frame)?;
        let face = lock(&self.locator).locate(&bitmap)?;
        let tensor = normalize_face(&bitmap, &face.bbox)?;
        // A superseded attempt never reaches the engine.
        self.ensure_current(generation)?;

        let embedding = self.embedder.embed(&tensor)?;
        let gallery = self.gallery.read().unwrap_or_else(PoisonError::into_inner);
        Ok(decide(&embedding, &gallery, &self.policy)?)
    }

    /// Swap in a freshly loaded embedding network.
    pub fn reload_model(&self, model: Box<dyn EmbeddingModel>) {
        self.embedder.reload(model);
    }

    pub fn replace_gallery(&self, templates: Vec<EnrolledTemplate>) {
        let count = templates.len();
        *self.gallery.write().unwrap_or_else(PoisonError::into_inner) = templates;
        tracing::info!(count, "enrolled templates replaced");
    }

    /// Reload the embedding model and the gallery from disk. Each half is
    /// installed if it loads, whatever happens to the other; the error lists
    /// every half that failed.
    pub fn reload_from(
        &self,
        model_path: &str,
        intra_threads: usize,
        templates_path: &Path,
    ) -> Result<(), String> {
        let mut failures = Vec::new();
        match OnnxEmbedder::load(model_path, intra_threads) {
            Ok(model) => self.reload_model(Box::new(model)),
            Err(e) => failures.push(format!("embedding model: {e}")),
        }
        match templates::load(templates_path) {
            Ok(gallery) => self.replace_gallery(gallery),
            Err(e) => failures.push(format!("templates: {e}")),
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            engine_available: self.embedder.is_available(),
            busy: self.is_busy(),
            templates: self.gallery.read().unwrap_or_else(PoisonError::into_inner).len(),
            attempts: self.attempts.load(Ordering::Relaxed),
            last_attempt: lock(&self.last_attempt).clone(),
        }
    }
}

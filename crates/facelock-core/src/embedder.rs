//! FaceNet embedding engine via ONNX Runtime.
//!
//! Maps a prewhitened 160×160×3 face tensor to a 128-dimensional embedding.
//! The network is exported from the FaceNet Inception-ResNet graph with
//! `phase_train` frozen to false, exposing exactly two tensors:
//! `input` (N×160×160×3) and `embeddings` (N×128).

use crate::types::{EmbeddingVector, NormalizedTensor, EMBEDDING_DIM};
use ndarray::Axis;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub const INPUT_TENSOR: &str = "input";
pub const OUTPUT_TENSOR: &str = "embeddings";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("embedding engine unavailable")]
    Unavailable,
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("model is missing tensor {0:?}")]
    MissingTensor(&'static str),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A loaded embedding network. Not reentrant.
pub trait EmbeddingModel: Send {
    /// Raw network output for one face; the engine validates its length.
    fn embed(&mut self, input: &NormalizedTensor) -> Result<Vec<f32>, EngineError>;
}

/// FaceNet exported to ONNX.
pub struct OnnxEmbedder {
    session: Session,
}

impl OnnxEmbedder {
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, EngineError> {
        if !Path::new(model_path).exists() {
            return Err(EngineError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let inputs: Vec<String> = session.inputs().iter().map(|i| i.name().to_string()).collect();
        let outputs: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(path = model_path, ?inputs, ?outputs, "loaded FaceNet model");

        if !inputs.iter().any(|n| n == INPUT_TENSOR) {
            return Err(EngineError::MissingTensor(INPUT_TENSOR));
        }
        if !outputs.iter().any(|n| n == OUTPUT_TENSOR) {
            return Err(EngineError::MissingTensor(OUTPUT_TENSOR));
        }

        Ok(Self { session })
    }
}

impl EmbeddingModel for OnnxEmbedder {
    fn embed(&mut self, input: &NormalizedTensor) -> Result<Vec<f32>, EngineError> {
        // HWC → NHWC with a batch of one.
        let batch = input.data().view().insert_axis(Axis(0));

        let outputs = self
            .session
            .run(ort::inputs![INPUT_TENSOR => TensorRef::from_array_view(batch)?])?;

        let (_, raw) = outputs[OUTPUT_TENSOR]
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::InferenceFailed(format!("embedding extraction: {e}")))?;

        Ok(raw.to_vec())
    }
}

/// Process-wide owner of the embedding network.
///
/// Every call takes the internal lock, so concurrent callers are serialized.
/// After [`shutdown`](Self::shutdown), or when loading failed, calls return
/// [`EngineError::Unavailable`] until [`reload`](Self::reload).
pub struct EmbeddingEngine {
    model: Mutex<Option<Box<dyn EmbeddingModel>>>,
}

impl EmbeddingEngine {
    pub fn new(model: Box<dyn EmbeddingModel>) -> Self {
        Self {
            model: Mutex::new(Some(model)),
        }
    }

    /// An engine with nothing loaded.
    pub fn unavailable() -> Self {
        Self {
            model: Mutex::new(None),
        }
    }

    /// Load the ONNX model; on failure log it and start disabled.
    pub fn load_onnx(model_path: &str, intra_threads: usize) -> Self {
        match OnnxEmbedder::load(model_path, intra_threads) {
            Ok(m) => Self::new(Box::new(m)),
            Err(e) => {
                tracing::error!(
                    path = model_path,
                    error = %e,
                    "could not load face recognition engine"
                );
                Self::unavailable()
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn EmbeddingModel>>> {
        // A panic inside a model call leaves no partial state we rely on.
        self.model.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_available(&self) -> bool {
        self.lock().is_some()
    }

    pub fn embed(&self, tensor: &NormalizedTensor) -> Result<EmbeddingVector, EngineError> {
        let mut guard = self.lock();
        let model = guard.as_mut().ok_or(EngineError::Unavailable)?;

        let raw = model.embed(tensor)?;
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::InferenceFailed("non-finite embedding value".into()));
        }

        let embedding = EmbeddingVector::try_from(raw).map_err(|e| {
            EngineError::InferenceFailed(format!("expected {EMBEDDING_DIM}-dim embedding: {e}"))
        })?;

        tracing::trace!(values = ?embedding.as_slice(), "embedding computed");
        Ok(embedding)
    }

    /// Replace the loaded network, re-enabling a disabled engine.
    pub fn reload(&self, model: Box<dyn EmbeddingModel>) {
        let previous = self.lock().replace(model);
        tracing::info!(replaced = previous.is_some(), "embedding engine reloaded");
    }

    /// Release the network. Returns false if nothing was loaded.
    pub fn shutdown(&self) -> bool {
        let released = self.lock().take().is_some();
        if released {
            tracing::info!("embedding engine closed");
        }
        released
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{TENSOR_CHANNELS, TENSOR_HEIGHT, TENSOR_WIDTH};
    use ndarray::Array3;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Deterministic stand-in network: 128 fixed strided sums of the input.
    pub(crate) struct ProjectionModel;

    impl EmbeddingModel for ProjectionModel {
        fn embed(&mut self, input: &NormalizedTensor) -> Result<Vec<f32>, EngineError> {
            let flat: Vec<f32> = input.data().iter().copied().collect();
            let mut out = vec![0.0f32; EMBEDDING_DIM];
            for (i, v) in flat.iter().enumerate() {
                out[i % EMBEDDING_DIM] += v * (1.0 + (i % 7) as f32);
            }
            let norm = out.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                out.iter_mut().for_each(|x| *x /= norm);
            }
            Ok(out)
        }
    }

    struct FixedOutput(Vec<f32>);

    impl EmbeddingModel for FixedOutput {
        fn embed(&mut self, _input: &NormalizedTensor) -> Result<Vec<f32>, EngineError> {
            Ok(self.0.clone())
        }
    }

    /// Fails the test if two calls ever overlap.
    struct ReentrancyProbe {
        busy: Arc<AtomicBool>,
    }

    impl EmbeddingModel for ReentrancyProbe {
        fn embed(&mut self, _input: &NormalizedTensor) -> Result<Vec<f32>, EngineError> {
            assert!(!self.busy.swap(true, Ordering::SeqCst), "concurrent engine call");
            std::thread::sleep(std::time::Duration::from_millis(2));
            self.busy.store(false, Ordering::SeqCst);
            Ok(vec![0.0; EMBEDDING_DIM])
        }
    }

    fn ramp_tensor() -> NormalizedTensor {
        let shape = (TENSOR_HEIGHT, TENSOR_WIDTH, TENSOR_CHANNELS);
        let data = Array3::from_shape_fn(shape, |(y, x, c)| {
            ((y * 7 + x * 3 + c) % 17) as f32 / 8.0 - 1.0
        });
        NormalizedTensor::new(data, 0.0, 1.0).unwrap()
    }

    #[test]
    fn test_embedding_is_deterministic() {
        let engine = EmbeddingEngine::new(Box::new(ProjectionModel));
        let tensor = ramp_tensor();
        let a = engine.embed(&tensor).unwrap();
        let b = engine.embed(&tensor).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM);
    }

    #[test]
    fn test_wrong_output_length_is_inference_failure() {
        let engine = EmbeddingEngine::new(Box::new(FixedOutput(vec![0.1; 512])));
        assert!(matches!(engine.embed(&ramp_tensor()), Err(EngineError::InferenceFailed(_))));
    }

    #[test]
    fn test_nan_output_is_inference_failure() {
        let mut out = vec![0.0; EMBEDDING_DIM];
        out[3] = f32::NAN;
        let engine = EmbeddingEngine::new(Box::new(FixedOutput(out)));
        assert!(matches!(engine.embed(&ramp_tensor()), Err(EngineError::InferenceFailed(_))));
    }

    #[test]
    fn test_shutdown_then_unavailable() {
        let engine = EmbeddingEngine::new(Box::new(ProjectionModel));
        assert!(engine.shutdown());
        assert!(!engine.shutdown());
        assert!(!engine.is_available());
        assert!(matches!(engine.embed(&ramp_tensor()), Err(EngineError::Unavailable)));

        engine.reload(Box::new(ProjectionModel));
        assert!(engine.embed(&ramp_tensor()).is_ok());
    }

    #[test]
    fn test_missing_model_file_disables_engine() {
        let engine = EmbeddingEngine::load_onnx("/nonexistent/facenet.onnx", 1);
        assert!(!engine.is_available());
        assert!(matches!(
            OnnxEmbedder::load("/nonexistent/facenet.onnx", 1),
            Err(EngineError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_calls_are_serialized() {
        let engine = Arc::new(EmbeddingEngine::new(Box::new(ReentrancyProbe {
            busy: Arc::new(AtomicBool::new(false)),
        })));
        let tensor = Arc::new(ramp_tensor());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let tensor = Arc::clone(&tensor);
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        engine.embed(&tensor).unwrap();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }
}

//! facelock-core: the frame-to-verdict half of the face-unlock pipeline.
//!
//! Decodes a captured frame, picks the largest detected face (SCRFD via ONNX
//! Runtime), prewhitens it into a 160×160×3 tensor, embeds it with FaceNet
//! and compares the embedding against enrolled templates.

pub mod decision;
pub mod decoder;
pub mod embedder;
pub mod locator;
pub mod normalizer;
pub mod scrfd;
pub mod templates;
pub mod types;

pub use decision::{decide, DecisionError, DecisionPolicy};
pub use decoder::{decode, DecodeError, EncodedFrame, FrameFormat};
pub use embedder::{EmbeddingEngine, EmbeddingModel, EngineError, OnnxEmbedder};
pub use locator::{select_primary, FaceDetector, FaceLocator, LocateError};
pub use normalizer::{normalize_face, NormalizeError};
pub use scrfd::{DetectorError, ScrfdDetector};
pub use types::{
    AuthResult, Bitmap, BoundingBox, DistanceMetric, EmbeddingVector, EnrolledTemplate,
    FaceCandidate, NormalizedTensor, EMBEDDING_DIM,
};

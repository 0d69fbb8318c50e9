//! Core decision components for the rollcall attendance verifier.
//!
//! Everything in this crate is pure computation: no camera, no storage, no
//! clock. The service crate (`rollcalld`) wires these pieces to SQLite and a
//! face-analysis backend.

pub mod embedding;
pub mod extractor;
pub mod index;
pub mod liveness;

pub use embedding::{Embedding, EmbeddingError, SubjectKey, SubjectKeyError, EMBEDDING_DIM};
pub use extractor::{BoundingBox, DetectedFace, ExtractorError, FaceExtractor};
pub use index::{confidence_from_similarity, Candidate, IdentityIndex, IndexError};
pub use liveness::{
    FlashAnalyzer, LivenessConfig, LivenessError, LivenessMetrics, LivenessVerdict,
};

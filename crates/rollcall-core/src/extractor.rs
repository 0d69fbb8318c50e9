//! Seam for the external face-analysis capability.
//!
//! Detection and embedding extraction are consumed, not implemented: given an
//! image, a backend returns zero or more detected faces with normalized
//! embeddings. The verification pipeline is written against this trait so the
//! inference stack can live out-of-process, on other hardware, or in tests as
//! a stub.

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

use crate::embedding::Embedding;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("face analysis backend failed: {0}")]
    Backend(String),
}

/// Detection bounding box in pixel coordinates.
#[derive(Debug, Clone, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One detected face: location, detector confidence, embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub embedding: Embedding,
}

/// Opaque face detection + embedding extraction capability.
pub trait FaceExtractor: Send + Sync {
    /// Detect faces in a frame and return their embeddings.
    ///
    /// An empty result is a normal outcome (nobody in frame), not an error.
    fn extract(&self, frame: &RgbImage) -> Result<Vec<DetectedFace>, ExtractorError>;
}

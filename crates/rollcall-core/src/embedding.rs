use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimension of the face embedding vectors produced by the analysis backend.
pub const EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("invalid embedding dimension: {0} (expected 512)")]
    InvalidDim(usize),
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidValue,
    #[error("embedding has zero norm")]
    ZeroNorm,
}

#[derive(Error, Debug)]
pub enum SubjectKeyError {
    #[error("subject key must not be empty")]
    Empty,
}

/// Opaque, stable identifier of an enrolled subject.
///
/// The key is canonicalized once at construction (whitespace trimmed,
/// non-empty). The index and the ledger only ever see this form, so a key
/// never has to be re-interpreted at lookup time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectKey(String);

impl SubjectKey {
    pub fn new(raw: impl Into<String>) -> Result<Self, SubjectKeyError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SubjectKeyError::Empty);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A 512-dimensional face embedding.
///
/// Values are validated (dimension, finiteness) on every construction path.
/// [`Embedding::normalized`] additionally scales to unit norm, which makes
/// cosine similarity a plain dot product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Wrap an already-normalized vector, validating dimension and values.
    pub fn new(values: Vec<f32>) -> Result<Self, EmbeddingError> {
        validate(&values)?;
        Ok(Self { values })
    }

    /// Validate and scale a raw backend vector to unit norm.
    pub fn normalized(values: Vec<f32>) -> Result<Self, EmbeddingError> {
        validate(&values)?;
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return Err(EmbeddingError::ZeroNorm);
        }
        Ok(Self {
            values: values.into_iter().map(|v| v / norm).collect(),
        })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dot(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }
}

fn validate(values: &[f32]) -> Result<(), EmbeddingError> {
    if values.len() != EMBEDDING_DIM {
        return Err(EmbeddingError::InvalidDim(values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(EmbeddingError::InvalidValue);
    }
    Ok(())
}

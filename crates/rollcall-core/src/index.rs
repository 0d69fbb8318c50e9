//! Incremental nearest-neighbor index over enrolled face embeddings.
//!
//! A flat cosine-similarity index: embeddings are unit-norm, so similarity is
//! the dot product and higher is always better. The comparison direction is
//! uniform across the whole system — `match_subject` accepts only when
//! `similarity >= threshold`.

use serde::Serialize;
use thiserror::Error;

use crate::embedding::{Embedding, SubjectKey};

#[derive(Error, Debug)]
pub enum IndexError {
    /// The vector and key collections disagree in length. Stored entries can
    /// no longer be attributed reliably; queries must fail rather than guess.
    #[error("index desync: {vectors} vectors vs {keys} subject keys")]
    Desync { vectors: usize, keys: usize },
}

/// Top-1 query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub subject_key: SubjectKey,
    pub similarity: f32,
}

/// Append-only flat index: the k-th vector always belongs to the k-th key.
///
/// Entries are never deduplicated or merged — multiple entries per subject
/// (re-enrollment, multiple angles) are expected and improve recall.
#[derive(Debug, Clone, Default)]
pub struct IdentityIndex {
    vectors: Vec<Embedding>,
    keys: Vec<SubjectKey>,
}

impl IdentityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted parallel collections, e.g. on startup.
    pub fn from_parts(
        vectors: Vec<Embedding>,
        keys: Vec<SubjectKey>,
    ) -> Result<Self, IndexError> {
        if vectors.len() != keys.len() {
            return Err(IndexError::Desync {
                vectors: vectors.len(),
                keys: keys.len(),
            });
        }
        Ok(Self { vectors, keys })
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn insert(&mut self, embedding: Embedding, subject_key: SubjectKey) {
        self.vectors.push(embedding);
        self.keys.push(subject_key);
    }

    /// Single closest entry by cosine similarity; `None` on an empty index.
    ///
    /// Ties keep the earliest-inserted entry.
    pub fn query_nearest(&self, probe: &Embedding) -> Result<Option<Candidate>, IndexError> {
        self.check_consistency()?;

        let mut best: Option<(usize, f32)> = None;
        for (i, stored) in self.vectors.iter().enumerate() {
            let similarity = probe.dot(stored);
            let better = match best {
                None => true,
                Some((_, s)) => similarity > s,
            };
            if better {
                best = Some((i, similarity));
            }
        }

        Ok(best.map(|(i, similarity)| Candidate {
            subject_key: self.keys[i].clone(),
            similarity,
        }))
    }

    /// Threshold-gated match. "Nearest" is not "same identity": a candidate
    /// below the threshold yields `None` even though a neighbor exists.
    pub fn match_subject(
        &self,
        probe: &Embedding,
        threshold: f32,
    ) -> Result<Option<Candidate>, IndexError> {
        Ok(self
            .query_nearest(probe)?
            .filter(|c| c.similarity >= threshold))
    }

    fn check_consistency(&self) -> Result<(), IndexError> {
        if self.vectors.len() != self.keys.len() {
            return Err(IndexError::Desync {
                vectors: self.vectors.len(),
                keys: self.keys.len(),
            });
        }
        Ok(())
    }
}

/// Bounded display confidence in (0, 1] from a similarity score.
///
/// Monotonic heuristic over the cosine distance `1 - similarity` — useful
/// for logs and UIs, carries no statistical calibration guarantee.
pub fn confidence_from_similarity(similarity: f32) -> f32 {
    let distance = (1.0 - similarity).max(0.0);
    1.0 / (1.0 + distance)
}

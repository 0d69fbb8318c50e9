use std::sync::Arc;

use chrono::Local;
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

use rollcall_core::{
    confidence_from_similarity, DetectedFace, ExtractorError, FaceExtractor, FlashAnalyzer,
    IdentityIndex, IndexError, LivenessError, LivenessMetrics, SubjectKey,
};

use crate::config::Config;
use crate::store::{AttendanceStore, MarkOutcome, StoreError, Subject};

/// Faults that abort an attempt without producing a classified outcome:
/// malformed input, backend failure, or a storage/index fault. Spoof,
/// no-match, and duplicate results are *not* errors — they are regular
/// [`AttendanceOutcome::Rejected`] values.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    Input(#[from] LivenessError),
    #[error("undecodable frame: {0}")]
    Decode(#[from] image::ImageError),
    #[error("face analysis failed: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("identity index fault: {0}")]
    Index(#[from] IndexError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("no face detected in reference image")]
    NoFaceInReference,
}

/// Classification of a rejection, alongside the human-readable reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    Spoof,
    NoFace,
    NotRecognized,
    /// The index matched a key with no roster record — an index/roster
    /// desync, logged distinctly from an ordinary no-match.
    SubjectMissing,
    Duplicate,
}

/// Final outcome of one attendance attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttendanceOutcome {
    Accepted {
        subject_key: SubjectKey,
        display_name: String,
        confidence: f32,
        recorded_at: String,
    },
    Rejected {
        kind: RejectionKind,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        liveness: Option<LivenessMetrics>,
        #[serde(skip_serializing_if = "Option::is_none")]
        similarity: Option<f32>,
    },
}

impl AttendanceOutcome {
    fn rejected(kind: RejectionKind, reason: impl Into<String>) -> Self {
        Self::Rejected {
            kind,
            reason: reason.into(),
            liveness: None,
            similarity: None,
        }
    }
}

/// Enrollment metadata; the reference image itself is passed separately.
pub struct Enrollment<'a> {
    pub key: SubjectKey,
    pub display_name: &'a str,
    pub group_label: Option<&'a str>,
    pub reference_image_path: Option<&'a str>,
}

/// The attendance verification pipeline.
///
/// Linear with short-circuit: liveness → embedding extraction → identity
/// match → roster lookup → duplicate check → ledger write. Every stage can
/// reject; each attempt is stateless and independent. The index and the
/// store are shared across concurrent attempts — the index behind an
/// `RwLock`, the ledger behind the store's single-writer connection and its
/// unique (subject, day) key.
pub struct Pipeline {
    analyzer: FlashAnalyzer,
    extractor: Arc<dyn FaceExtractor>,
    index: RwLock<IdentityIndex>,
    store: AttendanceStore,
    match_threshold: f32,
}

impl Pipeline {
    /// Build the pipeline, rebuilding the in-memory index from the store.
    pub async fn new(
        config: &Config,
        extractor: Arc<dyn FaceExtractor>,
        store: AttendanceStore,
    ) -> Result<Self, PipelineError> {
        let index = store.load_index().await?;
        tracing::info!(entries = index.len(), "identity index loaded");
        Ok(Self {
            analyzer: FlashAnalyzer::new(config.liveness.clone()),
            extractor,
            index: RwLock::new(index),
            store,
            match_threshold: config.match_threshold,
        })
    }

    /// Run one attendance attempt over encoded before/after frame batches.
    pub async fn attend(
        &self,
        before_frames: &[Vec<u8>],
        after_frames: &[Vec<u8>],
    ) -> Result<AttendanceOutcome, PipelineError> {
        let before = decode_frames(before_frames)?;
        let after = decode_frames(after_frames)?;

        // Liveness gates everything else.
        let verdict = self.analyzer.analyze(&before, &after)?;
        if !verdict.is_live {
            let detail = verdict
                .reason
                .unwrap_or_else(|| "liveness check failed".to_string());
            tracing::warn!(reason = %detail, "attempt rejected: spoof");
            return Ok(AttendanceOutcome::Rejected {
                kind: RejectionKind::Spoof,
                reason: format!("spoof: {detail}"),
                liveness: Some(verdict.metrics),
                similarity: None,
            });
        }

        // Recognize from the last after-flash frame.
        let Some(probe_frame) = after.last() else {
            return Err(PipelineError::Input(LivenessError::EmptyBatch("after")));
        };
        let Some(face) = best_face(self.extractor.extract(probe_frame)?) else {
            tracing::warn!("attempt rejected: no face in probe frame");
            return Ok(AttendanceOutcome::rejected(
                RejectionKind::NoFace,
                "no face detected",
            ));
        };

        let candidate = {
            let index = self.index.read().await;
            match index.match_subject(&face.embedding, self.match_threshold)? {
                Some(candidate) => candidate,
                None => {
                    let nearest = index.query_nearest(&face.embedding)?;
                    let similarity = nearest.map(|c| c.similarity);
                    tracing::info!(?similarity, "attempt rejected: not recognized");
                    return Ok(AttendanceOutcome::Rejected {
                        kind: RejectionKind::NotRecognized,
                        reason: "not recognized".to_string(),
                        liveness: None,
                        similarity,
                    });
                }
            }
        };

        let Some(subject) = self.store.get_subject(&candidate.subject_key).await? else {
            tracing::error!(
                subject_key = %candidate.subject_key,
                "matched key has no roster record — index/roster desync"
            );
            return Ok(AttendanceOutcome::Rejected {
                kind: RejectionKind::SubjectMissing,
                reason: "subject record missing".to_string(),
                liveness: None,
                similarity: Some(candidate.similarity),
            });
        };

        let confidence = confidence_from_similarity(candidate.similarity);
        let now = Local::now();

        if self
            .store
            .has_marked_today(&subject.key, now.date_naive())
            .await?
        {
            tracing::info!(subject_key = %subject.key, "attempt rejected: already marked today");
            return Ok(AttendanceOutcome::rejected(
                RejectionKind::Duplicate,
                "already marked today",
            ));
        }

        match self.store.mark(&subject.key, confidence, now).await? {
            // Lost a same-day race after the check; the ledger write is the
            // authority.
            MarkOutcome::Duplicate => Ok(AttendanceOutcome::rejected(
                RejectionKind::Duplicate,
                "already marked today",
            )),
            MarkOutcome::Recorded(event) => {
                tracing::info!(
                    subject_key = %subject.key,
                    similarity = candidate.similarity,
                    confidence,
                    "attendance recorded"
                );
                Ok(AttendanceOutcome::Accepted {
                    subject_key: subject.key,
                    display_name: subject.display_name,
                    confidence,
                    recorded_at: event.recorded_at,
                })
            }
        }
    }

    /// Enroll a subject from a reference image: roster row, persisted index
    /// entry, and in-memory index update.
    pub async fn enroll(
        &self,
        request: Enrollment<'_>,
        image: &[u8],
    ) -> Result<Subject, PipelineError> {
        let frame = image::load_from_memory(image)?.to_rgb8();
        let face = best_face(self.extractor.extract(&frame)?)
            .ok_or(PipelineError::NoFaceInReference)?;

        let subject = self
            .store
            .insert_subject(
                &request.key,
                request.display_name,
                request.group_label,
                request.reference_image_path,
            )
            .await?;
        self.store
            .append_index_entry(&subject.key, &face.embedding)
            .await?;
        self.index
            .write()
            .await
            .insert(face.embedding, subject.key.clone());

        tracing::info!(subject_key = %subject.key, "subject enrolled");
        Ok(subject)
    }

    /// Remove a subject and its index entries, then rebuild the in-memory
    /// index from the store so both views stay a consistent pair.
    pub async fn retract(&self, key: &SubjectKey) -> Result<bool, PipelineError> {
        let removed = self.store.remove_subject(key).await?;
        if removed {
            let rebuilt = self.store.load_index().await?;
            *self.index.write().await = rebuilt;
            tracing::info!(subject_key = %key, "subject retracted");
        }
        Ok(removed)
    }

    /// Administrative full reset: clear the roster, the index, and the
    /// ledger atomically, then drop the in-memory index.
    pub async fn reset(&self) -> Result<(), PipelineError> {
        self.store.reset_all().await?;
        *self.index.write().await = IdentityIndex::new();
        tracing::warn!("system reset: roster, index, and ledger cleared");
        Ok(())
    }
}

fn decode_frames(frames: &[Vec<u8>]) -> Result<Vec<RgbImage>, PipelineError> {
    frames
        .iter()
        .map(|bytes| Ok(image::load_from_memory(bytes)?.to_rgb8()))
        .collect()
}

/// Highest-confidence detection wins, as in enrollment capture.
fn best_face(faces: Vec<DetectedFace>) -> Option<DetectedFace> {
    faces
        .into_iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use narrate_core::provider::Transcriber;
use narrate_core::{ChunkStatus, ProviderError};
use narrate_store::{
    ArtifactRepo, ChunkRepo, ChunkRow, Database, TranscriptRepo, TransitionFields,
};

use crate::error::EngineError;
use crate::scoring::score_transcript;

#[derive(Clone, Debug)]
pub struct VerifierConfig {
    /// When off, synthesized chunks are accepted unscored.
    pub enabled: bool,
    pub threshold: f64,
    pub case_sensitive: bool,
    pub concurrency: usize,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.85,
            case_sensitive: true,
            concurrency: 3,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct VerificationReport {
    pub verified: usize,
    /// Verified, but scored under the threshold.
    pub low_score: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

#[derive(Debug)]
enum Outcome {
    Verified { score: Option<f64> },
    Failed,
    Skipped,
    Cancelled,
}

pub struct Verifier {
    chunks: ChunkRepo,
    artifacts: ArtifactRepo,
    transcripts: TranscriptRepo,
    transcriber: Arc<dyn Transcriber>,
    config: VerifierConfig,
}

impl Verifier {
    pub fn new(db: Database, transcriber: Arc<dyn Transcriber>, config: VerifierConfig) -> Self {
        Self {
            chunks: ChunkRepo::new(db.clone()),
            artifacts: ArtifactRepo::new(db.clone()),
            transcripts: TranscriptRepo::new(db),
            transcriber,
            config,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.config.threshold
    }

    /// Verify every `synthesized` chunk in `chunks`, up to `concurrency` at once.
    #[instrument(skip_all, fields(chunks = chunks.len()))]
    pub async fn verify_all(
        &self,
        chunks: Vec<ChunkRow>,
        cancel: &CancellationToken,
    ) -> Result<VerificationReport, EngineError> {
        let outcomes: Vec<Result<Outcome, EngineError>> = stream::iter(chunks)
            .map(|chunk| async move {
                if cancel.is_cancelled() {
                    return Ok(Outcome::Cancelled);
                }
                self.verify(&chunk).await
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut report = VerificationReport::default();
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(Outcome::Verified { score }) => {
                    report.verified += 1;
                    if score.is_some_and(|s| s < self.config.threshold) {
                        report.low_score += 1;
                    }
                }
                Ok(Outcome::Failed) => report.failed += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Ok(Outcome::Cancelled) => report.cancelled += 1,
                Err(e) => {
                    report.failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(
            verified = report.verified,
            low_score = report.low_score,
            failed = report.failed,
            skipped = report.skipped,
            "verification finished"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    #[instrument(skip_all, fields(chunk_id = %chunk.id, sequence = chunk.sequence))]
    async fn verify(&self, chunk: &ChunkRow) -> Result<Outcome, EngineError> {
        if chunk.status != ChunkStatus::Synthesized {
            return Ok(Outcome::Skipped);
        }

        if !self.config.enabled {
            let accepted = self.move_chunk(
                chunk,
                ChunkStatus::Synthesized,
                ChunkStatus::Verified,
                TransitionFields::none().clear_score(),
            )?;
            return Ok(if accepted {
                Outcome::Verified { score: None }
            } else {
                Outcome::Skipped
            });
        }

        let claimed = match self.chunks.transition(
            &chunk.id,
            &[ChunkStatus::Synthesized],
            ChunkStatus::Verifying,
            TransitionFields::none(),
        ) {
            Ok(row) => row,
            Err(e) if e.is_stale() => {
                debug!(error = %e, "chunk no longer synthesized, skipping");
                return Ok(Outcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        let Some(artifact_id) = claimed.artifact_id.clone() else {
            return self.fail(&claimed, "synthesized chunk has no artifact".into());
        };
        let artifact = self.artifacts.get(&artifact_id)?;
        let audio = match tokio::fs::read(&artifact.path).await {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(&claimed, format!("cannot read {}: {e}", artifact.path)),
        };

        let transcript = match self.transcriber.transcribe(&audio).await {
            Ok(t) => t,
            Err(ProviderError::Cancelled) => {
                self.move_chunk(
                    &claimed,
                    ChunkStatus::Verifying,
                    ChunkStatus::Synthesized,
                    TransitionFields::none(),
                )?;
                return Ok(Outcome::Cancelled);
            }
            Err(e) => {
                return self.fail(
                    &claimed,
                    format!("transcription by {} failed: {e}", self.transcriber.name()),
                )
            }
        };

        let heard = if transcript.text.is_empty() {
            transcript
                .words
                .iter()
                .map(|w| w.word.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        } else {
            transcript.text.clone()
        };
        let report = score_transcript(&claimed.text, &heard, self.config.case_sensitive);

        self.transcripts.save(
            &artifact.id,
            self.transcriber.name(),
            &transcript,
            Some(report.score),
            Some(report.word_error_rate),
            &report.missing,
            &report.extra,
        )?;

        let moved = self.move_chunk(
            &claimed,
            ChunkStatus::Verifying,
            ChunkStatus::Verified,
            TransitionFields::none().score(report.score).clear_error(),
        )?;
        if !moved {
            return Ok(Outcome::Skipped);
        }

        if report.score < self.config.threshold {
            warn!(
                score = report.score,
                threshold = self.config.threshold,
                missing = report.missing.len(),
                extra = report.extra.len(),
                "chunk verified below threshold"
            );
        } else {
            info!(score = report.score, "chunk verified");
        }
        Ok(Outcome::Verified {
            score: Some(report.score),
        })
    }

    fn fail(&self, chunk: &ChunkRow, message: String) -> Result<Outcome, EngineError> {
        warn!(error = %message, "chunk verification failed");
        let moved = self.move_chunk(
            chunk,
            ChunkStatus::Verifying,
            ChunkStatus::Failed,
            TransitionFields::none().error(message),
        )?;
        Ok(if moved { Outcome::Failed } else { Outcome::Skipped })
    }

    /// CAS helper; false when an operator override changed the chunk first.
    fn move_chunk(
        &self,
        chunk: &ChunkRow,
        from: ChunkStatus,
        to: ChunkStatus,
        fields: TransitionFields,
    ) -> Result<bool, EngineError> {
        match self.chunks.transition(&chunk.id, &[from], to, fields) {
            Ok(_) => Ok(true),
            Err(e) if e.is_stale() => {
                warn!(error = %e, target = %to, "chunk changed during verification");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

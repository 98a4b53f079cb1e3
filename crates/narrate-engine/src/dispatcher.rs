//! Synthesis dispatch: claim pending/failed chunks, synthesize them on a
//! bounded worker pool, persist artifacts, and record the outcome.
//!
//! Ownership of a chunk is the `{pending, failed} → synthesizing` transition
//! in the store; a worker that loses that race skips the chunk. There is no
//! other coordination between workers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use narrate_core::audio::{inspect_wav, WavInfo};
use narrate_core::provider::{SpeechSynthesizer, VoiceConfig};
use narrate_core::{ChunkStatus, ProviderError};
use narrate_store::{
    ArtifactRepo, ArtifactRow, ChapterRow, ChunkRepo, ChunkRow, Database, NewArtifact,
    TransitionFields,
};

use crate::error::EngineError;
use crate::files;

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Maximum chunks synthesized at once.
    pub concurrency: usize,
    pub voice: VoiceConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            voice: VoiceConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DispatchReport {
    pub synthesized: usize,
    pub failed: usize,
    /// Not dispatchable, or claimed by someone else first.
    pub skipped: usize,
    /// Left untouched because the job was cancelled.
    pub cancelled: usize,
    /// Of `synthesized`, how many came from the fallback provider.
    pub fallback_used: usize,
}

#[derive(Debug)]
enum Outcome {
    Synthesized { fallback: bool },
    Failed,
    Skipped,
    Cancelled,
}

struct Rendered {
    bytes: Bytes,
    info: WavInfo,
    provider: String,
    fallback: bool,
}

enum Attempt {
    Done(Rendered),
    Cancelled,
    Failed(String),
}

struct Shared {
    chunks: ChunkRepo,
    artifacts: ArtifactRepo,
    primary: Arc<dyn SpeechSynthesizer>,
    fallback: Option<Arc<dyn SpeechSynthesizer>>,
    config: DispatchConfig,
}

#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// `primary` is expected to carry its own retry policy; `fallback` is
    /// called at most once per chunk.
    pub fn new(
        db: Database,
        primary: Arc<dyn SpeechSynthesizer>,
        fallback: Option<Arc<dyn SpeechSynthesizer>>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                chunks: ChunkRepo::new(db.clone()),
                artifacts: ArtifactRepo::new(db),
                primary,
                fallback,
                config,
            }),
        }
    }

    /// Synthesize every dispatchable chunk in `chunks`. Chunks in any other
    /// state are skipped, so re-running on a finished chapter is a no-op.
    ///
    /// Cancellation stops new claims; calls already in flight complete.
    #[instrument(skip_all, fields(chapter_id = %chapter.id, chunks = chunks.len()))]
    pub async fn dispatch(
        &self,
        chapter: &ChapterRow,
        chunks: Vec<ChunkRow>,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, EngineError> {
        let mut report = DispatchReport::default();
        let permits = Arc::new(Semaphore::new(self.shared.config.concurrency.max(1)));
        let chapter_dir = PathBuf::from(&chapter.output_dir);
        let mut workers = JoinSet::new();

        let mut queue = chunks.into_iter();
        for chunk in queue.by_ref() {
            if !ChunkStatus::DISPATCHABLE.contains(&chunk.status) {
                report.skipped += 1;
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled += 1;
                    break;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let shared = self.shared.clone();
            let dir = chapter_dir.clone();
            let token = cancel.clone();
            workers.spawn(async move {
                let outcome = run_chunk(&shared, chunk, &dir, &token).await;
                drop(permit);
                outcome
            });
        }
        report.cancelled += queue
            .filter(|c| ChunkStatus::DISPATCHABLE.contains(&c.status))
            .count();

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(Outcome::Synthesized { fallback })) => {
                    report.synthesized += 1;
                    if fallback {
                        report.fallback_used += 1;
                    }
                }
                Ok(Ok(Outcome::Failed)) => report.failed += 1,
                Ok(Ok(Outcome::Skipped)) => report.skipped += 1,
                Ok(Ok(Outcome::Cancelled)) => report.cancelled += 1,
                Ok(Err(e)) => {
                    error!(error = %e, "dispatch worker failed");
                    report.failed += 1;
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "dispatch worker panicked");
                    report.failed += 1;
                }
            }
        }

        info!(
            synthesized = report.synthesized,
            failed = report.failed,
            skipped = report.skipped,
            cancelled = report.cancelled,
            fallback_used = report.fallback_used,
            "dispatch finished"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

#[instrument(skip_all, fields(chunk_id = %chunk.id, sequence = chunk.sequence))]
async fn run_chunk(
    shared: &Shared,
    chunk: ChunkRow,
    chapter_dir: &Path,
    cancel: &CancellationToken,
) -> Result<Outcome, EngineError> {
    if cancel.is_cancelled() {
        return Ok(Outcome::Cancelled);
    }

    let claimed = match shared.chunks.transition(
        &chunk.id,
        &ChunkStatus::DISPATCHABLE,
        ChunkStatus::Synthesizing,
        TransitionFields::none(),
    ) {
        Ok(row) => row,
        Err(e) if e.is_stale() => {
            debug!(error = %e, "chunk claimed elsewhere, skipping");
            return Ok(Outcome::Skipped);
        }
        Err(e) => return Err(e.into()),
    };

    let rendered = match synthesize(shared, &claimed.text).await {
        Attempt::Done(rendered) => rendered,
        Attempt::Cancelled => {
            settle(shared, &claimed, ChunkStatus::Pending, TransitionFields::none())?;
            return Ok(Outcome::Cancelled);
        }
        Attempt::Failed(message) => {
            warn!(error = %message, "chunk synthesis failed");
            let fields = TransitionFields::none().error(message);
            return settle(shared, &claimed, ChunkStatus::Failed, fields)
                .map(|won| if won { Outcome::Failed } else { Outcome::Skipped });
        }
    };

    let fallback = rendered.fallback;
    let artifact = match persist(shared, &claimed, chapter_dir, rendered).await {
        Ok(artifact) => artifact,
        Err(EngineError::Io(e)) => {
            let fields = TransitionFields::none().error(format!("could not write artifact: {e}"));
            return settle(shared, &claimed, ChunkStatus::Failed, fields)
                .map(|won| if won { Outcome::Failed } else { Outcome::Skipped });
        }
        Err(e) => return Err(e),
    };

    let fields = TransitionFields::none()
        .artifact(artifact.id.clone())
        .clear_score()
        .clear_error();
    if settle(shared, &claimed, ChunkStatus::Synthesized, fields)? {
        info!(artifact_id = %artifact.id, version = artifact.version, fallback, "chunk synthesized");
        Ok(Outcome::Synthesized { fallback })
    } else {
        Ok(Outcome::Skipped)
    }
}

/// Move a claimed chunk out of `synthesizing`. Returns false when an operator
/// override (exclude/reprocess) got there first.
fn settle(
    shared: &Shared,
    chunk: &ChunkRow,
    to: ChunkStatus,
    fields: TransitionFields,
) -> Result<bool, EngineError> {
    match shared
        .chunks
        .transition(&chunk.id, &[ChunkStatus::Synthesizing], to, fields)
    {
        Ok(_) => Ok(true),
        Err(e) if e.is_stale() => {
            warn!(error = %e, target = %to, "chunk changed while synthesizing");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

async fn synthesize(shared: &Shared, text: &str) -> Attempt {
    let voice = &shared.config.voice;
    let primary_err = match call(shared.primary.as_ref(), text, voice).await {
        Ok((bytes, info)) => {
            return Attempt::Done(Rendered {
                bytes,
                info,
                provider: shared.primary.name().to_string(),
                fallback: false,
            })
        }
        Err(ProviderError::Cancelled) => return Attempt::Cancelled,
        Err(e) => e,
    };

    let Some(fallback) = &shared.fallback else {
        return Attempt::Failed(format!("{}: {primary_err}", shared.primary.name()));
    };

    warn!(
        primary = shared.primary.name(),
        fallback = fallback.name(),
        error = %primary_err,
        kind = primary_err.error_kind(),
        "primary provider failed, trying fallback"
    );
    match call(fallback.as_ref(), text, voice).await {
        Ok((bytes, info)) => Attempt::Done(Rendered {
            bytes,
            info,
            provider: fallback.name().to_string(),
            fallback: true,
        }),
        Err(ProviderError::Cancelled) => Attempt::Cancelled,
        Err(e) => Attempt::Failed(format!(
            "{}: {primary_err}; fallback {}: {e}",
            shared.primary.name(),
            fallback.name()
        )),
    }
}

/// One provider call. The WAV header is read for the artifact record;
/// providers behind a `ReliableProvider` have already had bad audio retried.
async fn call(
    provider: &dyn SpeechSynthesizer,
    text: &str,
    voice: &VoiceConfig,
) -> Result<(Bytes, WavInfo), ProviderError> {
    let bytes = provider.synthesize(text, voice).await?;
    let info = inspect_wav(&bytes).map_err(|e| ProviderError::InvalidAudio(e.to_string()))?;
    Ok((bytes, info))
}

async fn persist(
    shared: &Shared,
    chunk: &ChunkRow,
    chapter_dir: &Path,
    rendered: Rendered,
) -> Result<ArtifactRow, EngineError> {
    let version = shared.artifacts.next_version(&chunk.id)?;
    let path = files::chunk_dir(chapter_dir).join(files::chunk_artifact_name(
        chunk.sequence,
        version,
        Utc::now(),
    ));
    files::write_new(&path, &rendered.bytes).await?;

    let artifact = shared.artifacts.record(NewArtifact {
        chunk_id: chunk.id.clone(),
        version,
        path: path.to_string_lossy().into_owned(),
        duration_secs: rendered.info.duration_secs(),
        sample_rate: rendered.info.sample_rate,
        channels: rendered.info.channels,
        bits_per_sample: rendered.info.bits_per_sample,
        byte_size: rendered.bytes.len() as u64,
        checksum: files::sha256_hex(&rendered.bytes),
        provider: rendered.provider,
    })?;
    Ok(artifact)
}

//! Chapter-level operations over the store, providers and pipeline stages.
//!
//! One job runs per chapter at a time. A job owns a cancellation token that
//! [`ChapterService::cancel`] trips; the entry is removed when the job's
//! guard drops, whether the job finished, failed or was cancelled.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use secrecy::SecretString;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use narrate_core::ids::{ArtifactId, ChapterId, ChunkId, ProjectId};
use narrate_core::provider::{SpeechSynthesizer, Transcriber};
use narrate_core::ChunkStatus;
use narrate_providers::{
    HttpEndpoint, HttpSynthesizer, HttpTranscriber, RateLimiter, ReliableConfig, ReliableProvider,
};
use narrate_settings::{EndpointSettings, NarrateSettings, SynthesisSettings};
use narrate_store::{
    ArtifactRepo, ArtifactRow, ChapterAudioRepo, ChapterAudioRow, ChapterRepo, ChapterRow,
    ChunkRepo, ChunkRow, Database, ProjectRepo, ProjectRow,
};

use crate::dispatcher::{DispatchConfig, DispatchReport, Dispatcher};
use crate::error::EngineError;
use crate::segmenter::segment;
use crate::stitcher::{StitchConfig, Stitcher};
use crate::sync::{SyncBuilder, SyncConfig, SyncData};
use crate::verifier::{VerificationReport, Verifier, VerifierConfig};

/// The speech services a chapter is processed with.
#[derive(Clone)]
pub struct Providers {
    pub primary: Arc<dyn SpeechSynthesizer>,
    /// Called once per chunk after the primary gives up.
    pub fallback: Option<Arc<dyn SpeechSynthesizer>>,
    pub transcriber: Arc<dyn Transcriber>,
}

impl Providers {
    /// HTTP providers from settings, each wrapped in the retry policy with
    /// its own rate limiter. The fallback gets no retries of its own.
    pub fn http(settings: &NarrateSettings) -> Result<Self, EngineError> {
        let synthesis = &settings.synthesis;
        let policy = reliable_config(synthesis);

        let primary = HttpSynthesizer::new(endpoint(&synthesis.primary))?;
        let primary = ReliableProvider::new(primary, policy.clone()).with_rate_limit(limiter(synthesis));

        let fallback = match &synthesis.fallback {
            Some(settings) => {
                let inner = HttpSynthesizer::new(endpoint(settings))?;
                let once = ReliableConfig {
                    max_retries: 0,
                    ..policy.clone()
                };
                let fallback = ReliableProvider::new(inner, once).with_rate_limit(limiter(synthesis));
                Some(Arc::new(fallback) as Arc<dyn SpeechSynthesizer>)
            }
            None => None,
        };

        let transcriber = HttpTranscriber::new(endpoint(&settings.verification.transcriber))?;
        let transcriber = ReliableProvider::new(transcriber, policy).with_rate_limit(limiter(synthesis));

        Ok(Self {
            primary: Arc::new(primary),
            fallback,
            transcriber: Arc::new(transcriber),
        })
    }
}

fn reliable_config(s: &SynthesisSettings) -> ReliableConfig {
    ReliableConfig {
        max_retries: s.max_retries,
        base_delay: Duration::from_millis(s.base_delay_ms),
        max_delay: Duration::from_millis(s.max_delay_ms),
        jitter_factor: s.jitter_factor,
        call_timeout: Duration::from_millis(s.call_timeout_ms),
        circuit_breaker_threshold: s.circuit_breaker_threshold,
        circuit_breaker_cooldown: Duration::from_millis(s.circuit_breaker_cooldown_ms),
    }
}

fn limiter(s: &SynthesisSettings) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::per_minute(s.requests_per_minute))
}

fn endpoint(settings: &EndpointSettings) -> HttpEndpoint {
    let endpoint = HttpEndpoint::new(&settings.name, &settings.url);
    let Some(var) = settings.api_key_env.as_deref() else {
        return endpoint;
    };
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => endpoint.with_api_key(SecretString::from(key)),
        _ => {
            warn!(endpoint = %settings.name, env = var, "API key variable not set");
            endpoint
        }
    }
}

/// A chunk that needs an operator's attention.
#[derive(Clone, Debug, Serialize)]
pub struct FlaggedChunk {
    pub chunk_id: ChunkId,
    pub sequence: u32,
    pub status: ChunkStatus,
    pub score: Option<f64>,
    pub reason: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProcessReport {
    pub chapter_id: ChapterId,
    pub total: usize,
    /// Chunks found mid-flight from an earlier run and reset.
    pub recovered: usize,
    pub dispatch: DispatchReport,
    pub verification: VerificationReport,
    pub complete: bool,
    pub flagged: Vec<FlaggedChunk>,
    /// The version produced by this run, if it stitched.
    pub stitched: Option<ChapterAudioRow>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChapterStatus {
    pub chapter_id: ChapterId,
    pub total: usize,
    pub counts: BTreeMap<&'static str, usize>,
    pub average_score: Option<f64>,
    pub flagged: Vec<FlaggedChunk>,
    pub complete: bool,
    pub active_version: Option<u32>,
    /// The active version no longer reflects the chunks' current artifacts.
    pub stitch_outdated: bool,
    pub running: bool,
}

/// Registration of a running job; removed on drop.
struct JobGuard {
    jobs: Arc<DashMap<ChapterId, CancellationToken>>,
    chapter_id: ChapterId,
    token: CancellationToken,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.jobs.remove(&self.chapter_id);
    }
}

pub struct ChapterService {
    projects: ProjectRepo,
    chapters: ChapterRepo,
    chunks: ChunkRepo,
    artifacts: ArtifactRepo,
    audio: ChapterAudioRepo,
    dispatcher: Dispatcher,
    verifier: Verifier,
    stitcher: Stitcher,
    sync: SyncBuilder,
    settings: NarrateSettings,
    jobs: Arc<DashMap<ChapterId, CancellationToken>>,
}

impl ChapterService {
    pub fn new(db: Database, providers: Providers, settings: NarrateSettings) -> Self {
        let dispatcher = Dispatcher::new(
            db.clone(),
            providers.primary,
            providers.fallback,
            DispatchConfig {
                concurrency: settings.synthesis.concurrency,
                voice: settings.voice.clone(),
            },
        );
        let verifier = Verifier::new(
            db.clone(),
            providers.transcriber,
            VerifierConfig {
                enabled: settings.verification.enabled,
                threshold: settings.verification.threshold,
                case_sensitive: settings.verification.case_sensitive,
                concurrency: settings.synthesis.concurrency,
            },
        );
        let stitcher = Stitcher::new(
            db.clone(),
            StitchConfig {
                fade_ms: settings.stitching.fade_ms,
                normalize: settings.stitching.normalize,
                target_peak_dbfs: settings.stitching.target_peak_dbfs,
            },
        );
        let sync = SyncBuilder::new(
            db.clone(),
            SyncConfig {
                lookahead: settings.sync.lookahead,
                similarity: settings.sync.similarity,
                min_match_ratio: settings.sync.min_match_ratio,
            },
        );

        Self {
            projects: ProjectRepo::new(db.clone()),
            chapters: ChapterRepo::new(db.clone()),
            chunks: ChunkRepo::new(db.clone()),
            artifacts: ArtifactRepo::new(db.clone()),
            audio: ChapterAudioRepo::new(db),
            dispatcher,
            verifier,
            stitcher,
            sync,
            settings,
            jobs: Arc::new(DashMap::new()),
        }
    }

    // ── Projects & chapters ──

    pub fn create_project(
        &self,
        title: &str,
        author: Option<&str>,
    ) -> Result<ProjectRow, EngineError> {
        Ok(self.projects.create(title, author)?)
    }

    pub fn projects(&self) -> Result<Vec<ProjectRow>, EngineError> {
        Ok(self.projects.list()?)
    }

    /// Register a chapter. Its audio is written under
    /// `<output dir>/<project id>/chapter_<seq>/`.
    pub fn add_chapter(
        &self,
        project_id: &ProjectId,
        sequence: u32,
        title: &str,
        text: &str,
    ) -> Result<ChapterRow, EngineError> {
        let dir: PathBuf = self
            .settings
            .storage
            .output_dir
            .join(project_id.as_str())
            .join(format!("chapter_{sequence:03}"));
        let chapter = self.chapters.create(
            project_id,
            sequence,
            title,
            text,
            &dir.to_string_lossy(),
        )?;
        info!(chapter_id = %chapter.id, sequence, chars = text.len(), "chapter added");
        Ok(chapter)
    }

    pub fn chapters(&self, project_id: &ProjectId) -> Result<Vec<ChapterRow>, EngineError> {
        Ok(self.chapters.list(project_id)?)
    }

    pub fn chapter(&self, chapter_id: &ChapterId) -> Result<ChapterRow, EngineError> {
        self.chapters
            .get(chapter_id)
            .map_err(|e| EngineError::chapter_lookup(chapter_id, e))
    }

    pub fn chunks(&self, chapter_id: &ChapterId) -> Result<Vec<ChunkRow>, EngineError> {
        self.chapter(chapter_id)?;
        Ok(self.chunks.list(chapter_id)?)
    }

    // ── Jobs ──

    fn begin(&self, chapter_id: &ChapterId) -> Result<JobGuard, EngineError> {
        match self.jobs.entry(chapter_id.clone()) {
            Entry::Occupied(_) => Err(EngineError::JobAlreadyRunning(chapter_id.clone())),
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                Ok(JobGuard {
                    jobs: self.jobs.clone(),
                    chapter_id: chapter_id.clone(),
                    token,
                })
            }
        }
    }

    /// Trip the running job's token. Returns whether a job was running.
    pub fn cancel(&self, chapter_id: &ChapterId) -> bool {
        match self.jobs.get(chapter_id) {
            Some(token) => {
                token.cancel();
                info!(%chapter_id, "job cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, chapter_id: &ChapterId) -> bool {
        self.jobs.contains_key(chapter_id)
    }

    // ── Pipeline ──

    /// Bring a chapter as far as it will go: segment it if needed, synthesize
    /// and verify outstanding chunks, and stitch once every chunk is verified
    /// or excluded. Safe to re-run; finished chunks are left alone and an
    /// up-to-date stitch is not repeated.
    #[instrument(skip(self), fields(chapter_id = %chapter_id))]
    pub async fn process_chapter(
        &self,
        chapter_id: &ChapterId,
    ) -> Result<ProcessReport, EngineError> {
        let chapter = self.chapter(chapter_id)?;
        let job = self.begin(chapter_id)?;

        let recovered = self.chunks.reset_in_flight(chapter_id)?;
        let segments = segment(&chapter.text, self.settings.segmenter.max_chars);
        let chunks = self.chunks.ensure_chunks(chapter_id, &segments)?;
        info!(chunks = chunks.len(), recovered, "processing chapter");

        let (dispatch, verification) = self.run(&chapter, chunks, &job.token).await?;

        let summary = self.chunks.summary(chapter_id)?;
        let complete = summary.is_complete();
        let stitched = if complete
            && !job.token.is_cancelled()
            && summary.count(ChunkStatus::Verified) > 0
            && self.needs_stitch(chapter_id)?
        {
            Some(self.stitcher.stitch(&chapter, &[]).await?)
        } else {
            None
        };

        Ok(ProcessReport {
            chapter_id: chapter_id.clone(),
            total: summary.total,
            recovered,
            dispatch,
            verification,
            complete,
            flagged: self.flagged(chapter_id)?,
            stitched,
        })
    }

    /// Re-synthesize and re-verify one chunk. Other chunks and the current
    /// stitch are untouched; see [`ChapterStatus::stitch_outdated`].
    #[instrument(skip(self), fields(chunk_id = %chunk_id))]
    pub async fn reprocess_chunk(
        &self,
        chunk_id: &ChunkId,
        reason: &str,
    ) -> Result<ChunkRow, EngineError> {
        let chunk = self.chunks.get(chunk_id)?;
        let chapter = self.chapter(&chunk.chapter_id)?;
        let job = self.begin(&chapter.id)?;

        let chunk = self.chunks.mark_reprocess(chunk_id, reason)?;
        self.run(&chapter, vec![chunk], &job.token).await?;
        Ok(self.chunks.get(chunk_id)?)
    }

    /// Reprocess every failed or low-scoring chunk of a chapter.
    #[instrument(skip(self), fields(chapter_id = %chapter_id))]
    pub async fn reprocess_flagged(
        &self,
        chapter_id: &ChapterId,
    ) -> Result<ProcessReport, EngineError> {
        let chapter = self.chapter(chapter_id)?;
        let job = self.begin(chapter_id)?;

        let recovered = self.chunks.reset_in_flight(chapter_id)?;
        let flagged = self.flagged(chapter_id)?;
        let mut batch = Vec::with_capacity(flagged.len());
        for f in &flagged {
            batch.push(self.chunks.mark_reprocess(&f.chunk_id, &f.reason)?);
        }
        info!(flagged = batch.len(), "reprocessing flagged chunks");

        let (dispatch, verification) = self.run(&chapter, batch, &job.token).await?;
        let summary = self.chunks.summary(chapter_id)?;
        Ok(ProcessReport {
            chapter_id: chapter_id.clone(),
            total: summary.total,
            recovered,
            dispatch,
            verification,
            complete: summary.is_complete(),
            flagged: self.flagged(chapter_id)?,
            stitched: None,
        })
    }

    async fn run(
        &self,
        chapter: &ChapterRow,
        chunks: Vec<ChunkRow>,
        cancel: &CancellationToken,
    ) -> Result<(DispatchReport, VerificationReport), EngineError> {
        let ids: HashSet<ChunkId> = chunks.iter().map(|c| c.id.clone()).collect();
        let dispatch = self.dispatcher.dispatch(chapter, chunks, cancel).await?;

        let synthesized: Vec<ChunkRow> = self
            .chunks
            .list_with_status(&chapter.id, &[ChunkStatus::Synthesized])?
            .into_iter()
            .filter(|c| ids.contains(&c.id))
            .collect();
        let verification = self.verifier.verify_all(synthesized, cancel).await?;
        Ok((dispatch, verification))
    }

    pub fn exclude_chunk(&self, chunk_id: &ChunkId) -> Result<ChunkRow, EngineError> {
        Ok(self.chunks.mark_excluded(chunk_id)?)
    }

    /// Stitch a new version now, leaving out `exclude` in addition to chunks
    /// already excluded.
    #[instrument(skip(self, exclude), fields(chapter_id = %chapter_id))]
    pub async fn restitch(
        &self,
        chapter_id: &ChapterId,
        exclude: &[ChunkId],
    ) -> Result<ChapterAudioRow, EngineError> {
        let chapter = self.chapter(chapter_id)?;
        let _job = self.begin(chapter_id)?;
        self.stitcher.stitch(&chapter, exclude).await
    }

    // ── Queries ──

    pub fn chapter_status(&self, chapter_id: &ChapterId) -> Result<ChapterStatus, EngineError> {
        self.chapter(chapter_id)?;
        let summary = self.chunks.summary(chapter_id)?;
        let active = self.audio.active(chapter_id)?;
        let stitch_outdated = match &active {
            Some(audio) => self.is_outdated(chapter_id, audio)?,
            None => false,
        };

        Ok(ChapterStatus {
            chapter_id: chapter_id.clone(),
            total: summary.total,
            counts: summary
                .by_status
                .iter()
                .map(|(status, n)| (status.as_str(), *n))
                .collect(),
            average_score: summary.average_score,
            flagged: self.flagged(chapter_id)?,
            complete: summary.is_complete(),
            active_version: active.map(|a| a.version),
            stitch_outdated,
            running: self.is_running(chapter_id),
        })
    }

    pub fn sync_data(&self, chapter_id: &ChapterId) -> Result<SyncData, EngineError> {
        let chapter = self.chapter(chapter_id)?;
        let audio = self
            .audio
            .active(chapter_id)?
            .ok_or_else(|| EngineError::NotStitched(chapter_id.clone()))?;
        self.sync.build(&chapter, &audio)
    }

    pub fn artifact_history(&self, chunk_id: &ChunkId) -> Result<Vec<ArtifactRow>, EngineError> {
        self.chunks.get(chunk_id)?;
        Ok(self.artifacts.history(chunk_id)?)
    }

    pub fn chapter_audio_versions(
        &self,
        chapter_id: &ChapterId,
    ) -> Result<Vec<ChapterAudioRow>, EngineError> {
        self.chapter(chapter_id)?;
        Ok(self.audio.versions(chapter_id)?)
    }

    fn flagged(&self, chapter_id: &ChapterId) -> Result<Vec<FlaggedChunk>, EngineError> {
        let threshold = self.verifier.threshold();
        Ok(self
            .chunks
            .flagged(chapter_id, threshold)?
            .into_iter()
            .map(|c| {
                let reason = match (c.status, c.score) {
                    (ChunkStatus::Failed, _) => c
                        .error
                        .clone()
                        .unwrap_or_else(|| "synthesis failed".into()),
                    (_, Some(score)) => format!("score {score:.2} below {threshold:.2}"),
                    _ => "needs attention".into(),
                };
                FlaggedChunk {
                    chunk_id: c.id,
                    sequence: c.sequence,
                    status: c.status,
                    score: c.score,
                    reason,
                }
            })
            .collect())
    }

    fn needs_stitch(&self, chapter_id: &ChapterId) -> Result<bool, EngineError> {
        match self.audio.active(chapter_id)? {
            Some(audio) => self.is_outdated(chapter_id, &audio),
            None => Ok(true),
        }
    }

    /// Whether the verified, non-excluded chunks and their artifacts differ
    /// from what `audio` was stitched from.
    fn is_outdated(
        &self,
        chapter_id: &ChapterId,
        audio: &ChapterAudioRow,
    ) -> Result<bool, EngineError> {
        let stitched: HashMap<&ChunkId, &ArtifactId> = audio
            .boundaries
            .iter()
            .map(|b| (&b.chunk_id, &b.artifact_id))
            .collect();
        let current: Vec<ChunkRow> = self
            .chunks
            .list(chapter_id)?
            .into_iter()
            .filter(|c| c.status != ChunkStatus::Excluded && !audio.excluded_chunks.contains(&c.id))
            .collect();

        if current.len() != stitched.len() {
            return Ok(true);
        }
        Ok(current.iter().any(|c| {
            c.status != ChunkStatus::Verified
                || c.artifact_id.as_ref() != stitched.get(&c.id).copied()
        }))
    }
}

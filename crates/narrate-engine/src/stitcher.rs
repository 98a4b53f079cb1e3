//! Ordered assembly of verified chunk artifacts into one chapter file.
//!
//! Chunks are butted end to end with short fades at each seam; nothing is
//! overlapped, so the stitched duration is the sum of the chunk durations and
//! each boundary is just a running sample offset.

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use tracing::{debug, info, instrument};

use narrate_core::audio::{decode_wav, encode_wav, frames_to_secs, PcmAudio};
use narrate_core::ids::{ArtifactId, ChunkId};
use narrate_core::{ChunkBoundary, ChunkStatus};
use narrate_store::{
    ArtifactRepo, ChapterAudioRepo, ChapterAudioRow, ChapterRow, ChunkRepo, Database,
    NewChapterAudio,
};

use crate::error::{BlockingChunk, EngineError};
use crate::files;

#[derive(Clone, Debug)]
pub struct StitchConfig {
    /// Fade length at each seam, clamped to half the chunk.
    pub fade_ms: u32,
    pub normalize: bool,
    pub target_peak_dbfs: f32,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            fade_ms: 50,
            normalize: true,
            target_peak_dbfs: -1.0,
        }
    }
}

/// A chunk artifact queued for assembly.
struct Clip {
    chunk_id: ChunkId,
    sequence: u32,
    artifact_id: ArtifactId,
    wav: Vec<u8>,
}

struct Assembled {
    wav: Vec<u8>,
    sample_rate: u32,
    channels: u16,
    duration_secs: f64,
    boundaries: Vec<ChunkBoundary>,
}

pub struct Stitcher {
    chunks: ChunkRepo,
    artifacts: ArtifactRepo,
    audio: ChapterAudioRepo,
    config: StitchConfig,
}

impl Stitcher {
    pub fn new(db: Database, config: StitchConfig) -> Self {
        Self {
            chunks: ChunkRepo::new(db.clone()),
            artifacts: ArtifactRepo::new(db.clone()),
            audio: ChapterAudioRepo::new(db),
            config,
        }
    }

    /// Stitch every chunk of `chapter` that is neither `excluded` nor listed
    /// in `exclude`, recording the result as the chapter's new active version.
    ///
    /// Every included chunk must be `verified` with an artifact.
    #[instrument(skip_all, fields(chapter_id = %chapter.id, excluded = exclude.len()))]
    pub async fn stitch(
        &self,
        chapter: &ChapterRow,
        exclude: &[ChunkId],
    ) -> Result<ChapterAudioRow, EngineError> {
        let requested: HashSet<&ChunkId> = exclude.iter().collect();
        let mut included = Vec::new();
        let mut excluded = Vec::new();
        let mut blocking = Vec::new();

        for chunk in self.chunks.list(&chapter.id)? {
            if chunk.status == ChunkStatus::Excluded || requested.contains(&chunk.id) {
                excluded.push(chunk.id);
                continue;
            }
            match (chunk.status, chunk.artifact_id) {
                (ChunkStatus::Verified, Some(artifact_id)) => {
                    included.push((chunk.id, chunk.sequence, artifact_id));
                }
                _ => blocking.push(BlockingChunk {
                    chunk_id: chunk.id,
                    sequence: chunk.sequence,
                    status: chunk.status,
                }),
            }
        }

        if !blocking.is_empty() {
            return Err(EngineError::IncompleteChapter {
                chapter_id: chapter.id.clone(),
                blocking,
            });
        }
        if included.is_empty() {
            return Err(EngineError::NothingToStitch(chapter.id.clone()));
        }

        let mut clips = Vec::with_capacity(included.len());
        for (chunk_id, sequence, artifact_id) in included {
            let artifact = self.artifacts.get(&artifact_id)?;
            let wav = tokio::fs::read(&artifact.path).await?;
            debug!(sequence, version = artifact.version, "loaded chunk artifact");
            clips.push(Clip {
                chunk_id,
                sequence,
                artifact_id,
                wav,
            });
        }
        let included_chunks: Vec<ChunkId> = clips.iter().map(|c| c.chunk_id.clone()).collect();

        let config = self.config.clone();
        let assembled = tokio::task::spawn_blocking(move || assemble(clips, &config))
            .await
            .map_err(|e| EngineError::Internal(format!("stitch task failed: {e}")))??;

        let version = self.audio.next_version(&chapter.id)?;
        let path = Path::new(&chapter.output_dir).join(files::chapter_audio_name(
            chapter.sequence,
            version,
            Utc::now(),
        ));
        files::write_new(&path, &assembled.wav).await?;

        let row = self.audio.record_version(NewChapterAudio {
            chapter_id: chapter.id.clone(),
            version,
            path: path.to_string_lossy().into_owned(),
            duration_secs: assembled.duration_secs,
            sample_rate: assembled.sample_rate,
            channels: assembled.channels,
            byte_size: assembled.wav.len() as u64,
            checksum: files::sha256_hex(&assembled.wav),
            included_chunks,
            excluded_chunks: excluded,
            boundaries: assembled.boundaries,
        })?;

        info!(
            version = row.version,
            chunks = row.included_chunks.len(),
            duration_secs = row.duration_secs,
            path = %row.path,
            "chapter stitched"
        );
        Ok(row)
    }
}

fn assemble(clips: Vec<Clip>, config: &StitchConfig) -> Result<Assembled, EngineError> {
    let last = clips.len().saturating_sub(1);
    let mut output: Option<PcmAudio> = None;
    let mut boundaries = Vec::with_capacity(clips.len());
    let mut offset = 0usize;

    for (i, clip) in clips.into_iter().enumerate() {
        let mut pcm = decode_wav(&clip.wav)?;
        // The first clip fixes the chapter's format; a fallback provider may
        // have rendered others at a different rate or channel count.
        if let Some(out) = &output {
            if out.same_format(&pcm).is_err() {
                debug!(
                    sequence = clip.sequence,
                    from_rate = pcm.sample_rate,
                    to_rate = out.sample_rate,
                    "converting clip to chapter format"
                );
                pcm = pcm.conform(out.sample_rate, out.channels)?;
            }
        }
        if i > 0 {
            pcm.fade_in(config.fade_ms);
        }
        if i < last {
            pcm.fade_out(config.fade_ms);
        }

        let frames = pcm.frames();
        boundaries.push(ChunkBoundary {
            chunk_id: clip.chunk_id,
            sequence: clip.sequence,
            artifact_id: clip.artifact_id,
            start: frames_to_secs(offset, pcm.sample_rate),
            end: frames_to_secs(offset + frames, pcm.sample_rate),
        });
        offset += frames;

        match output.as_mut() {
            Some(out) => out.append(&pcm)?,
            None => output = Some(pcm),
        }
    }

    let mut output =
        output.ok_or_else(|| EngineError::Internal("no clips to assemble".into()))?;
    if config.normalize {
        output.normalize_peak(config.target_peak_dbfs);
    }

    Ok(Assembled {
        wav: encode_wav(&output)?,
        sample_rate: output.sample_rate,
        channels: output.channels,
        duration_secs: output.duration_secs(),
        boundaries,
    })
}

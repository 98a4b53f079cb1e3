//! Word timings for a stitched chapter.
//!
//! Each chunk's transcript is shifted onto the chapter timeline by its
//! boundary and then matched against the chapter words inside the chunk's
//! span. Matching is a greedy left-to-right scan with a bounded look-ahead;
//! transcribed words that find no partner are dropped.

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use narrate_core::ids::{ChapterId, ChunkId};
use narrate_core::{ChunkBoundary, TextSpan, TranscribedWord, WordTiming};
use narrate_store::{ChapterAudioRow, ChapterRow, ChunkRepo, Database, TranscriptRepo};

use crate::error::EngineError;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Source words scanned past the cursor for each transcribed word.
    pub lookahead: usize,
    /// Minimum positional character similarity for a match.
    pub similarity: f64,
    /// Chunks matching fewer of their transcribed words are misaligned.
    pub min_match_ratio: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lookahead: 4,
            similarity: 0.8,
            min_match_ratio: 0.5,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SyncData {
    pub chapter_id: ChapterId,
    pub audio_path: String,
    pub audio_version: u32,
    pub duration_secs: f64,
    pub text: String,
    pub words: Vec<WordTiming>,
    pub boundaries: Vec<ChunkBoundary>,
    /// Chunks whose transcript could not be aligned; they contribute no words.
    pub misaligned_chunks: Vec<ChunkId>,
}

impl SyncData {
    /// The last word starting at or before `t`.
    pub fn word_at(&self, t: f64) -> Option<&WordTiming> {
        let idx = self.words.partition_point(|w| w.start <= t);
        idx.checked_sub(1).map(|i| &self.words[i])
    }

    pub fn chunk_at(&self, t: f64) -> Option<&ChunkBoundary> {
        self.boundaries.iter().find(|b| t >= b.start && t < b.end)
    }
}

/// A chapter word and its lookup key.
struct SourceWord {
    span: TextSpan,
    key: String,
}

pub struct SyncBuilder {
    chunks: ChunkRepo,
    transcripts: TranscriptRepo,
    config: SyncConfig,
}

impl SyncBuilder {
    pub fn new(db: Database, config: SyncConfig) -> Self {
        Self {
            chunks: ChunkRepo::new(db.clone()),
            transcripts: TranscriptRepo::new(db),
            config,
        }
    }

    #[instrument(skip_all, fields(chapter_id = %chapter.id, version = audio.version))]
    pub fn build(
        &self,
        chapter: &ChapterRow,
        audio: &ChapterAudioRow,
    ) -> Result<SyncData, EngineError> {
        let mut words = Vec::new();
        let mut misaligned = Vec::new();
        let mut transcribed_chunks = 0usize;
        let mut floor = 0.0f64;

        for boundary in &audio.boundaries {
            let Some(transcript) = self.transcripts.find(&boundary.artifact_id)? else {
                debug!(sequence = boundary.sequence, "no transcript for stitched artifact");
                continue;
            };
            let heard = transcript
                .transcript
                .words
                .iter()
                .filter(|w| !fold(&w.word).is_empty())
                .count();
            if heard == 0 {
                continue;
            }
            transcribed_chunks += 1;

            let chunk = self.chunks.get(&boundary.chunk_id)?;
            let source = source_words(&chapter.text, chunk.span);
            let aligned = self.align(&source, &transcript.transcript.words, boundary, floor);

            let ratio = aligned.len() as f64 / heard as f64;
            if aligned.is_empty() || ratio < self.config.min_match_ratio {
                warn!(
                    sequence = boundary.sequence,
                    matched = aligned.len(),
                    heard,
                    "chunk transcript does not align with its text"
                );
                misaligned.push(boundary.chunk_id.clone());
                continue;
            }

            if let Some(last) = aligned.last() {
                floor = last.end;
            }
            words.extend(aligned);
        }

        if transcribed_chunks > 0 && misaligned.len() == transcribed_chunks {
            return Err(EngineError::AlignmentMismatch {
                chapter_id: chapter.id.clone(),
                chunks: misaligned,
            });
        }

        info!(
            words = words.len(),
            misaligned = misaligned.len(),
            "sync data built"
        );
        Ok(SyncData {
            chapter_id: chapter.id.clone(),
            audio_path: audio.path.clone(),
            audio_version: audio.version,
            duration_secs: audio.duration_secs,
            text: chapter.text.clone(),
            words,
            boundaries: audio.boundaries.clone(),
            misaligned_chunks: misaligned,
        })
    }

    /// Match transcribed words to source words. Times are shifted by the
    /// boundary start, clamped to the boundary, and never run backwards
    /// past `floor`.
    fn align(
        &self,
        source: &[SourceWord],
        heard: &[TranscribedWord],
        boundary: &ChunkBoundary,
        floor: f64,
    ) -> Vec<WordTiming> {
        let mut out = Vec::new();
        let mut cursor = 0usize;
        let mut last_end = floor.max(boundary.start);

        for word in heard {
            if cursor >= source.len() {
                break;
            }
            let key = fold(&word.word);
            if key.is_empty() {
                continue;
            }
            let window_end = (cursor + self.config.lookahead + 1).min(source.len());
            let Some(hit) = (cursor..window_end)
                .find(|&j| similarity(&source[j].key, &key) >= self.config.similarity)
            else {
                continue;
            };

            let start = (boundary.start + word.start)
                .clamp(boundary.start, boundary.end)
                .max(last_end);
            let end = (boundary.start + word.end)
                .clamp(boundary.start, boundary.end)
                .max(start);
            out.push(WordTiming {
                word: word.word.clone(),
                span: source[hit].span,
                start,
                end,
                confidence: word.confidence,
                chunk_id: boundary.chunk_id.clone(),
            });
            cursor = hit + 1;
            last_end = end;
        }
        out
    }
}

/// Whitespace-separated words of `text` inside `span`, with absolute byte spans.
fn source_words(text: &str, span: TextSpan) -> Vec<SourceWord> {
    let Some(slice) = text.get(span.start..span.end) else {
        return Vec::new();
    };
    let mut words = Vec::new();
    let mut start = None;
    for (i, c) in slice.char_indices().chain(std::iter::once((slice.len(), ' '))) {
        match (c.is_whitespace(), start) {
            (false, None) => start = Some(i),
            (true, Some(s)) => {
                let token = &slice[s..i];
                let key = fold(token);
                if !key.is_empty() {
                    words.push(SourceWord {
                        span: TextSpan::new(span.start + s, span.start + i),
                        key,
                    });
                }
                start = None;
            }
            _ => {}
        }
    }
    words
}

fn fold(word: &str) -> String {
    word.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Fraction of aligned character positions that agree.
fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    let same = a.iter().zip(&b).filter(|(x, y)| x == y).count();
    same as f64 / longest as f64
}

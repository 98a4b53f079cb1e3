use serde::{Deserialize, Serialize};

use crate::ids::{ArtifactId, ChunkId};

/// Processing state of a chunk. Transitions are compare-and-set in the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Synthesizing,
    Synthesized,
    Verifying,
    Verified,
    Failed,
    Excluded,
}

impl ChunkStatus {
    pub const ALL: [ChunkStatus; 7] = [
        Self::Pending,
        Self::Synthesizing,
        Self::Synthesized,
        Self::Verifying,
        Self::Verified,
        Self::Failed,
        Self::Excluded,
    ];

    /// Statuses the dispatcher may claim.
    pub const DISPATCHABLE: [ChunkStatus; 2] = [Self::Pending, Self::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synthesizing => "synthesizing",
            Self::Synthesized => "synthesized",
            Self::Verifying => "verifying",
            Self::Verified => "verified",
            Self::Failed => "failed",
            Self::Excluded => "excluded",
        }
    }

    /// No further pipeline work is needed for this chunk.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Verified | Self::Excluded)
    }
}

impl std::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChunkStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown chunk status: {s}"))
    }
}

/// Half-open byte range `[start, end)` into chapter text, always on char boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
}

impl TextSpan {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end, "span start {start} > end {end}");
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, other: &TextSpan) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    pub fn slice<'a>(&self, text: &'a str) -> &'a str {
        &text[self.start..self.end]
    }
}

/// One output unit of the segmenter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub span: TextSpan,
    pub text: String,
}

/// A word recognised by a transcriber, timed relative to the audio it came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscribedWord {
    pub word: String,
    pub start: f64,
    pub end: f64,
    pub confidence: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub words: Vec<TranscribedWord>,
}

/// A chunk's time range inside a stitched chapter track.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkBoundary {
    pub chunk_id: ChunkId,
    pub sequence: u32,
    pub artifact_id: ArtifactId,
    pub start: f64,
    pub end: f64,
}

impl ChunkBoundary {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// A chapter word's time range inside the stitched chapter track.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub span: TextSpan,
    pub start: f64,
    pub end: f64,
    pub confidence: f64,
    pub chunk_id: ChunkId,
}

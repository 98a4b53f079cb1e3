use narrate_core::audio::AudioError;
use narrate_core::ids::{ChapterId, ChunkId};
use narrate_core::{ChunkStatus, ProviderError};
use narrate_store::StoreError;
use serde::Serialize;

/// A chunk standing between a chapter and a stitch.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BlockingChunk {
    pub chunk_id: ChunkId,
    pub sequence: u32,
    pub status: ChunkStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("chapter {chapter_id} has {} chunk(s) not ready to stitch", .blocking.len())]
    IncompleteChapter {
        chapter_id: ChapterId,
        blocking: Vec<BlockingChunk>,
    },

    #[error("no transcript of chapter {chapter_id} aligns with its text ({} chunk(s) tried)", .chunks.len())]
    AlignmentMismatch {
        chapter_id: ChapterId,
        chunks: Vec<ChunkId>,
    },

    #[error("chapter {0} has no chunks to stitch")]
    NothingToStitch(ChapterId),

    #[error("chapter not found: {0}")]
    ChapterNotFound(ChapterId),

    #[error("a job is already running for chapter {0}")]
    JobAlreadyRunning(ChapterId),

    #[error("no stitched audio for chapter {0}")]
    NotStitched(ChapterId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Map a store `NotFound` on a chapter lookup to [`EngineError::ChapterNotFound`].
    pub(crate) fn chapter_lookup(chapter_id: &ChapterId, err: StoreError) -> Self {
        if err.is_not_found() {
            Self::ChapterNotFound(chapter_id.clone())
        } else {
            Self::Store(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_chapter_message_counts_blockers() {
        let err = EngineError::IncompleteChapter {
            chapter_id: ChapterId::from_raw("chap_1"),
            blocking: vec![
                BlockingChunk {
                    chunk_id: ChunkId::from_raw("chunk_a"),
                    sequence: 0,
                    status: ChunkStatus::Failed,
                },
                BlockingChunk {
                    chunk_id: ChunkId::from_raw("chunk_b"),
                    sequence: 2,
                    status: ChunkStatus::Pending,
                },
            ],
        };
        assert_eq!(err.to_string(), "chapter chap_1 has 2 chunk(s) not ready to stitch");
    }

    #[test]
    fn chapter_lookup_maps_not_found() {
        let id = ChapterId::from_raw("chap_x");
        let err = EngineError::chapter_lookup(&id, StoreError::NotFound("chapter".into()));
        assert!(matches!(err, EngineError::ChapterNotFound(_)));
        let err = EngineError::chapter_lookup(&id, StoreError::Database("locked".into()));
        assert!(matches!(err, EngineError::Store(_)));
    }
}

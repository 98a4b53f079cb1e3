pub mod artifacts;
pub mod chapter_audio;
pub mod chapters;
pub mod chunks;
pub mod database;
pub mod error;
pub mod projects;
pub mod row_helpers;
pub mod schema;
pub mod transcripts;

pub use artifacts::{ArtifactRepo, ArtifactRow, NewArtifact};
pub use chapter_audio::{ChapterAudioRepo, ChapterAudioRow, NewChapterAudio};
pub use chapters::{ChapterRepo, ChapterRow};
pub use chunks::{ChunkRepo, ChunkRow, ChunkSummary, FieldUpdate, TransitionFields};
pub use database::Database;
pub use error::StoreError;
pub use projects::{ProjectRepo, ProjectRow};
pub use transcripts::{TranscriptRepo, TranscriptRow};

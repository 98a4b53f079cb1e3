pub mod audio;
pub mod errors;
pub mod ids;
pub mod provider;
pub mod types;

pub use errors::ProviderError;
pub use types::{ChunkBoundary, ChunkStatus, Segment, TextSpan, Transcript, TranscribedWord, WordTiming};

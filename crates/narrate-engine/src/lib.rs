//! # narrate-engine
//!
//! Turns chapter text into a stitched, timed chapter track:
//! segment → dispatch synthesis → verify → stitch → derive sync data.
//! All progress lives in the chunk store, so every stage can be re-run.

pub mod chapters;
pub mod dispatcher;
pub mod error;
pub mod files;
pub mod scoring;
pub mod segmenter;
pub mod service;
pub mod stitcher;
pub mod sync;
pub mod verifier;

#[cfg(test)]
mod testkit;

pub use chapters::{detect_chapters, ChapterDetector, DetectedChapter};
pub use dispatcher::{DispatchConfig, DispatchReport, Dispatcher};
pub use error::{BlockingChunk, EngineError};
pub use scoring::{score_transcript, ScoreReport};
pub use segmenter::segment;
pub use service::{ChapterService, ChapterStatus, FlaggedChunk, ProcessReport, Providers};
pub use stitcher::{StitchConfig, Stitcher};
pub use sync::{SyncBuilder, SyncConfig, SyncData};
pub use verifier::{VerificationReport, Verifier, VerifierConfig};

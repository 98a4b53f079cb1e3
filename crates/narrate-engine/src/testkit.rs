//! Shared fixtures for the engine's unit tests.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use narrate_providers::MockStudio;
use narrate_store::{ChapterAudioRow, ChapterRepo, ChapterRow, ChunkRepo, Database, ProjectRepo};

use crate::dispatcher::{DispatchConfig, Dispatcher};
use crate::segmenter::segment;
use crate::stitcher::{StitchConfig, Stitcher};
use crate::verifier::{Verifier, VerifierConfig};

pub(crate) const THREE_CHUNKS: &str = "Alpha one. Beta two. Gamma three.";

pub(crate) struct Fixture {
    pub db: Database,
    pub chapter: ChapterRow,
    pub studio: MockStudio,
    pub dir: tempfile::TempDir,
}

impl Fixture {
    pub fn chunks(&self) -> ChunkRepo {
        ChunkRepo::new(self.db.clone())
    }

    /// Verify every synthesized chunk against this fixture's studio.
    pub async fn verify(&self) {
        Verifier::new(
            self.db.clone(),
            Arc::new(self.studio.transcriber()),
            VerifierConfig::default(),
        )
        .verify_all(
            self.chunks().list(&self.chapter.id).unwrap(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    }

    pub async fn stitch(&self) -> ChapterAudioRow {
        Stitcher::new(self.db.clone(), StitchConfig::default())
            .stitch(&self.chapter, &[])
            .await
            .unwrap()
    }
}

/// A chapter with pending chunks, split at 12 characters.
pub(crate) fn pending(text: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::in_memory().unwrap();
    let project = ProjectRepo::new(db.clone()).create("Book", None).unwrap();
    let chapter = ChapterRepo::new(db.clone())
        .create(&project.id, 1, "One", text, dir.path().to_str().unwrap())
        .unwrap();
    ChunkRepo::new(db.clone())
        .create_chunks(&chapter.id, &segment(text, 12))
        .unwrap();
    Fixture {
        db,
        chapter,
        studio: MockStudio::default(),
        dir,
    }
}

/// Dispatch every chunk with the default mock studio.
pub(crate) async fn synthesized(text: &str) -> Fixture {
    let f = pending(text);
    Dispatcher::new(
        f.db.clone(),
        Arc::new(f.studio.synthesizer("primary")),
        None,
        DispatchConfig::default(),
    )
    .dispatch(
        &f.chapter,
        f.chunks().list(&f.chapter.id).unwrap(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    f
}

/// Dispatch and verify every chunk with the default mock studio.
pub(crate) async fn verified(text: &str) -> Fixture {
    let f = synthesized(text).await;
    f.verify().await;
    f
}

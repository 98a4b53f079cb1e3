//! End-to-end chapter scenarios against the in-process mock studio.

use std::sync::Arc;
use std::time::Duration;

use narrate_core::{ChunkStatus, ProviderError};
use narrate_engine::{ChapterService, Providers};
use narrate_providers::{MockStudio, MockSynthesizer, ReliableConfig, ReliableProvider};
use narrate_settings::NarrateSettings;
use narrate_store::{ChapterRow, ChunkRepo, Database, TransitionFields};

const TEXT: &str = "Alpha one. Beta two. Gamma three.";

struct Book {
    service: ChapterService,
    db: Database,
    studio: MockStudio,
    chapter: ChapterRow,
    _dir: tempfile::TempDir,
}

fn fast_retries(max_retries: u32) -> ReliableConfig {
    ReliableConfig {
        max_retries,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter_factor: 0.0,
        call_timeout: Duration::from_secs(5),
        ..ReliableConfig::default()
    }
}

/// Chunk "Beta two." fails twice on the primary, which retries once, so
/// only the fallback can render it.
fn book() -> Book {
    book_with_fallback(|studio| studio.synthesizer("backup"))
}

fn book_with_fallback(fallback: impl FnOnce(&MockStudio) -> MockSynthesizer) -> Book {
    let dir = tempfile::tempdir().unwrap();
    let studio = MockStudio::default();
    let primary = studio
        .synthesizer("primary")
        .fail_on("Beta", vec![ProviderError::Overloaded, ProviderError::Overloaded]);
    let fallback = fallback(&studio);

    let mut settings = NarrateSettings::default();
    settings.storage.output_dir = dir.path().to_path_buf();
    settings.segmenter.max_chars = 12;

    let db = Database::in_memory().unwrap();
    let service = ChapterService::new(
        db.clone(),
        Providers {
            primary: Arc::new(ReliableProvider::new(primary, fast_retries(1))),
            fallback: Some(Arc::new(ReliableProvider::new(fallback, fast_retries(0)))),
            transcriber: Arc::new(studio.transcriber()),
        },
        settings,
    );
    let project = service.create_project("Book", None).unwrap();
    let chapter = service.add_chapter(&project.id, 1, "One", TEXT).unwrap();
    Book {
        service,
        db,
        studio,
        chapter,
        _dir: dir,
    }
}

#[tokio::test]
async fn fallback_rescues_chunk_and_chapter_stitches_in_order() {
    let b = book();
    let report = b.service.process_chapter(&b.chapter.id).await.unwrap();

    assert_eq!(report.dispatch.synthesized, 3);
    assert_eq!(report.dispatch.fallback_used, 1);
    assert!(report.complete);
    let audio = report.stitched.unwrap();

    let chunks = b.service.chunks(&b.chapter.id).unwrap();
    assert!(chunks.iter().all(|c| c.status == ChunkStatus::Verified));
    let beta = &chunks[1];
    let history = b.service.artifact_history(&beta.id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].provider, "backup");

    let order: Vec<_> = audio.boundaries.iter().map(|bd| bd.chunk_id.clone()).collect();
    let expected: Vec<_> = chunks.iter().map(|c| c.id.clone()).collect();
    assert_eq!(order, expected);

    let total: f64 = chunks.iter().map(|c| b.studio.expected_duration(&c.text)).sum();
    assert!((audio.duration_secs - total).abs() < 1e-3);
    assert!(std::path::Path::new(&audio.path).exists());
}

#[tokio::test]
async fn fallback_rendering_at_another_rate_still_stitches() {
    let b = book_with_fallback(|studio| studio.synthesizer("backup").with_sample_rate(22_050));
    let report = b.service.process_chapter(&b.chapter.id).await.unwrap();

    assert!(report.complete);
    assert_eq!(report.dispatch.fallback_used, 1);
    let audio = report.stitched.unwrap();
    assert_eq!(audio.sample_rate, 16_000);

    let chunks = b.service.chunks(&b.chapter.id).unwrap();
    let beta = b.service.artifact_history(&chunks[1].id).unwrap();
    assert_eq!(beta[0].sample_rate, 22_050);

    let total: f64 = chunks.iter().map(|c| b.studio.expected_duration(&c.text)).sum();
    assert!((audio.duration_secs - total).abs() < 1e-3);
    assert!((audio.boundaries[1].duration() - b.studio.expected_duration(&chunks[1].text)).abs() < 1e-3);

    let status = b.service.chapter_status(&b.chapter.id).unwrap();
    assert_eq!(status.active_version, Some(1));
    assert_eq!(b.service.sync_data(&b.chapter.id).unwrap().words.len(), 6);
}

#[tokio::test]
async fn reprocessing_one_chunk_leaves_neighbours_intact() {
    let b = book();
    let first = b
        .service
        .process_chapter(&b.chapter.id)
        .await
        .unwrap()
        .stitched
        .unwrap();
    let before = b.service.chunks(&b.chapter.id).unwrap();

    b.service.reprocess_chunk(&before[1].id, "mispronounced").await.unwrap();
    let after = b.service.chunks(&b.chapter.id).unwrap();

    assert_eq!(after[0].artifact_id, before[0].artifact_id);
    assert_eq!(after[2].artifact_id, before[2].artifact_id);
    assert_ne!(after[1].artifact_id, before[1].artifact_id);
    assert_eq!(after[1].status, ChunkStatus::Verified);
    for chunk in [&after[0], &after[2]] {
        assert_eq!(b.service.artifact_history(&chunk.id).unwrap().len(), 1);
    }

    let second = b.service.restitch(&b.chapter.id, &[]).await.unwrap();
    assert_eq!(second.version, 2);
    assert_eq!(second.boundaries[1].artifact_id, after[1].artifact_id.clone().unwrap());
    assert_eq!(second.boundaries[0].artifact_id, first.boundaries[0].artifact_id);

    let versions = b.service.chapter_audio_versions(&b.chapter.id).unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions.iter().filter(|v| v.active).count(), 1);
    assert!(std::path::Path::new(&first.path).exists());
}

#[tokio::test]
async fn excluding_a_chunk_removes_it_from_the_chapter() {
    let b = book();
    b.service.process_chapter(&b.chapter.id).await.unwrap();
    let chunks = b.service.chunks(&b.chapter.id).unwrap();

    b.service.exclude_chunk(&chunks[1].id).unwrap();
    let status = b.service.chapter_status(&b.chapter.id).unwrap();
    assert!(status.complete);
    assert!(status.stitch_outdated);

    let audio = b.service.restitch(&b.chapter.id, &[]).await.unwrap();
    let expected = b.studio.expected_duration(&chunks[0].text)
        + b.studio.expected_duration(&chunks[2].text);
    assert!((audio.duration_secs - expected).abs() < 1e-3);
    assert!(audio.boundaries.iter().all(|bd| bd.chunk_id != chunks[1].id));
    assert_eq!(audio.excluded_chunks, [chunks[1].id.clone()]);

    let sync = b.service.sync_data(&b.chapter.id).unwrap();
    assert_eq!(sync.words.len(), 4);
}

#[tokio::test]
async fn word_timings_follow_the_text_and_the_clock() {
    let b = book();
    b.service.process_chapter(&b.chapter.id).await.unwrap();
    let sync = b.service.sync_data(&b.chapter.id).unwrap();

    assert_eq!(sync.words.len(), 6);
    for pair in sync.words.windows(2) {
        assert!(pair[0].start <= pair[1].start);
        assert!(pair[0].span.end <= pair[1].span.start);
    }
    let last = sync.words.last().unwrap();
    assert_eq!(last.span.slice(&sync.text), "three.");
    assert!(last.end <= sync.duration_secs);

    let mid = (last.start + last.end) / 2.0;
    assert_eq!(sync.word_at(mid).unwrap().span, last.span);
    assert_eq!(sync.chunk_at(mid).unwrap().sequence, 2);
}

#[tokio::test]
async fn interrupted_run_is_recovered() {
    let b = book();
    let chunks = ChunkRepo::new(b.db.clone());
    let segments = narrate_engine::segment(TEXT, 12);
    let rows = chunks.ensure_chunks(&b.chapter.id, &segments).unwrap();
    // A previous process died holding this claim.
    chunks
        .transition(
            &rows[0].id,
            &[ChunkStatus::Pending],
            ChunkStatus::Synthesizing,
            TransitionFields::none(),
        )
        .unwrap();

    let report = b.service.process_chapter(&b.chapter.id).await.unwrap();
    assert_eq!(report.recovered, 1);
    assert!(report.complete);
    assert_eq!(chunks.get(&rows[0].id).unwrap().attempts, 2);
}

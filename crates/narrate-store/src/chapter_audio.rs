use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use narrate_core::ids::{ChapterAudioId, ChapterId, ChunkId};
use narrate_core::ChunkBoundary;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// One stitched rendition of a chapter. Older versions stay on disk and in
/// the table; only the newest is active.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChapterAudioRow {
    pub id: ChapterAudioId,
    pub chapter_id: ChapterId,
    pub version: u32,
    pub path: String,
    pub duration_secs: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub byte_size: u64,
    pub checksum: String,
    pub included_chunks: Vec<ChunkId>,
    pub excluded_chunks: Vec<ChunkId>,
    pub boundaries: Vec<ChunkBoundary>,
    pub active: bool,
    pub created_at: String,
}

#[derive(Clone, Debug)]
pub struct NewChapterAudio {
    pub chapter_id: ChapterId,
    pub version: u32,
    pub path: String,
    pub duration_secs: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub byte_size: u64,
    pub checksum: String,
    pub included_chunks: Vec<ChunkId>,
    pub excluded_chunks: Vec<ChunkId>,
    pub boundaries: Vec<ChunkBoundary>,
}

const COLUMNS: &str = "id, chapter_id, version, path, duration_secs, sample_rate, channels, \
                       byte_size, checksum, included_chunks, excluded_chunks, boundaries, active, created_at";

pub struct ChapterAudioRepo {
    db: Database,
}

impl ChapterAudioRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(chapter_id = %chapter_id))]
    pub fn next_version(&self, chapter_id: &ChapterId) -> Result<u32, StoreError> {
        self.db.with_conn(|conn| {
            let max: i64 = conn.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM chapter_audio WHERE chapter_id = ?1",
                [chapter_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(max as u32 + 1)
        })
    }

    /// Insert a new version as the active one, deactivating its predecessor
    /// in the same transaction.
    #[instrument(skip(self, new), fields(chapter_id = %new.chapter_id, version = new.version))]
    pub fn record_version(&self, new: NewChapterAudio) -> Result<ChapterAudioRow, StoreError> {
        let id = ChapterAudioId::new();
        let now = Utc::now().to_rfc3339();
        let included_json = serde_json::to_string(&new.included_chunks)?;
        let excluded_json = serde_json::to_string(&new.excluded_chunks)?;
        let boundaries_json = serde_json::to_string(&new.boundaries)?;

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "UPDATE chapter_audio SET active = 0 WHERE chapter_id = ?1 AND active = 1",
                [new.chapter_id.as_str()],
            )?;
            tx.execute(
                "INSERT INTO chapter_audio (id, chapter_id, version, path, duration_secs, sample_rate, channels,
                                            byte_size, checksum, included_chunks, excluded_chunks, boundaries,
                                            active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 1, ?13)",
                rusqlite::params![
                    id.as_str(),
                    new.chapter_id.as_str(),
                    new.version,
                    new.path,
                    new.duration_secs,
                    new.sample_rate,
                    new.channels,
                    new.byte_size as i64,
                    new.checksum,
                    included_json,
                    excluded_json,
                    boundaries_json,
                    now,
                ],
            )?;
            tx.commit()?;
            info!(chapter_audio_id = %id, duration = new.duration_secs, "chapter audio version recorded");

            Ok(ChapterAudioRow {
                id,
                chapter_id: new.chapter_id,
                version: new.version,
                path: new.path,
                duration_secs: new.duration_secs,
                sample_rate: new.sample_rate,
                channels: new.channels,
                byte_size: new.byte_size,
                checksum: new.checksum,
                included_chunks: new.included_chunks,
                excluded_chunks: new.excluded_chunks,
                boundaries: new.boundaries,
                active: true,
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(chapter_id = %chapter_id))]
    pub fn active(&self, chapter_id: &ChapterId) -> Result<Option<ChapterAudioRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM chapter_audio WHERE chapter_id = ?1 AND active = 1"
            ))?;
            let mut rows = stmt.query([chapter_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_chapter_audio(row).map(Some),
                None => Ok(None),
            }
        })
    }

    /// All versions, oldest first.
    #[instrument(skip(self), fields(chapter_id = %chapter_id))]
    pub fn versions(&self, chapter_id: &ChapterId) -> Result<Vec<ChapterAudioRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM chapter_audio WHERE chapter_id = ?1 ORDER BY version"
            ))?;
            let mut rows = stmt.query([chapter_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_chapter_audio(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_chapter_audio(row: &rusqlite::Row<'_>) -> Result<ChapterAudioRow, StoreError> {
    let included_raw: String = row_helpers::get(row, 9, "chapter_audio", "included_chunks")?;
    let excluded_raw: String = row_helpers::get(row, 10, "chapter_audio", "excluded_chunks")?;
    let boundaries_raw: String = row_helpers::get(row, 11, "chapter_audio", "boundaries")?;
    let byte_size: i64 = row_helpers::get(row, 7, "chapter_audio", "byte_size")?;
    let active: i64 = row_helpers::get(row, 12, "chapter_audio", "active")?;

    Ok(ChapterAudioRow {
        id: ChapterAudioId::from_raw(row_helpers::get::<String>(row, 0, "chapter_audio", "id")?),
        chapter_id: ChapterId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "chapter_audio",
            "chapter_id",
        )?),
        version: row_helpers::get_u32(row, 2, "chapter_audio", "version")?,
        path: row_helpers::get(row, 3, "chapter_audio", "path")?,
        duration_secs: row_helpers::get(row, 4, "chapter_audio", "duration_secs")?,
        sample_rate: row_helpers::get_u32(row, 5, "chapter_audio", "sample_rate")?,
        channels: row_helpers::get_u32(row, 6, "chapter_audio", "channels")? as u16,
        byte_size: byte_size.max(0) as u64,
        checksum: row_helpers::get(row, 8, "chapter_audio", "checksum")?,
        included_chunks: row_helpers::parse_json(&included_raw, "chapter_audio", "included_chunks")?,
        excluded_chunks: row_helpers::parse_json(&excluded_raw, "chapter_audio", "excluded_chunks")?,
        boundaries: row_helpers::parse_json(&boundaries_raw, "chapter_audio", "boundaries")?,
        active: active != 0,
        created_at: row_helpers::get(row, 13, "chapter_audio", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chapters::ChapterRepo;
    use crate::projects::ProjectRepo;
    use narrate_core::ids::ArtifactId;

    fn setup() -> (Database, ChapterId) {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).create("Book", None).unwrap();
        let chapter = ChapterRepo::new(db.clone())
            .create(&project.id, 1, "One", "text", "/tmp")
            .unwrap();
        (db, chapter.id)
    }

    fn new_version(chapter_id: &ChapterId, version: u32) -> NewChapterAudio {
        let chunk = ChunkId::from_raw("chunk_a");
        NewChapterAudio {
            chapter_id: chapter_id.clone(),
            version,
            path: format!("/tmp/chapter_001_v{version:03}.wav"),
            duration_secs: 2.0,
            sample_rate: 24_000,
            channels: 1,
            byte_size: 96_044,
            checksum: format!("sum{version}"),
            included_chunks: vec![chunk.clone()],
            excluded_chunks: vec![ChunkId::from_raw("chunk_b")],
            boundaries: vec![ChunkBoundary {
                chunk_id: chunk,
                sequence: 0,
                artifact_id: ArtifactId::from_raw("art_a"),
                start: 0.0,
                end: 2.0,
            }],
        }
    }

    #[test]
    fn record_and_fetch_active() {
        let (db, chapter_id) = setup();
        let repo = ChapterAudioRepo::new(db);
        assert!(repo.active(&chapter_id).unwrap().is_none());
        assert_eq!(repo.next_version(&chapter_id).unwrap(), 1);

        repo.record_version(new_version(&chapter_id, 1)).unwrap();
        let active = repo.active(&chapter_id).unwrap().unwrap();
        assert_eq!(active.version, 1);
        assert_eq!(active.boundaries.len(), 1);
        assert_eq!(active.excluded_chunks, vec![ChunkId::from_raw("chunk_b")]);
    }

    #[test]
    fn new_version_deactivates_previous() {
        let (db, chapter_id) = setup();
        let repo = ChapterAudioRepo::new(db);
        repo.record_version(new_version(&chapter_id, 1)).unwrap();
        repo.record_version(new_version(&chapter_id, 2)).unwrap();

        let versions = repo.versions(&chapter_id).unwrap();
        assert_eq!(versions.len(), 2);
        assert!(!versions[0].active);
        assert!(versions[1].active);
        assert_eq!(repo.active(&chapter_id).unwrap().unwrap().checksum, "sum2");
        assert_eq!(repo.next_version(&chapter_id).unwrap(), 3);
    }
}

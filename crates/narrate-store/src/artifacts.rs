use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use narrate_core::ids::{ArtifactId, ChunkId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// An immutable synthesized audio file for one chunk. Never deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactRow {
    pub id: ArtifactId,
    pub chunk_id: ChunkId,
    pub version: u32,
    pub path: String,
    pub duration_secs: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub byte_size: u64,
    pub checksum: String,
    pub provider: String,
    pub created_at: String,
}

#[derive(Clone, Debug)]
pub struct NewArtifact {
    pub chunk_id: ChunkId,
    pub version: u32,
    pub path: String,
    pub duration_secs: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub byte_size: u64,
    pub checksum: String,
    pub provider: String,
}

const COLUMNS: &str = "id, chunk_id, version, path, duration_secs, sample_rate, channels, \
                       bits_per_sample, byte_size, checksum, provider, created_at";

pub struct ArtifactRepo {
    db: Database,
}

impl ArtifactRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Version number the next artifact of this chunk should carry.
    #[instrument(skip(self), fields(chunk_id = %chunk_id))]
    pub fn next_version(&self, chunk_id: &ChunkId) -> Result<u32, StoreError> {
        self.db.with_conn(|conn| {
            let max: i64 = conn.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM audio_artifacts WHERE chunk_id = ?1",
                [chunk_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(max as u32 + 1)
        })
    }

    /// Record a new artifact. Versions are unique per chunk.
    #[instrument(skip(self, new), fields(chunk_id = %new.chunk_id, version = new.version))]
    pub fn record(&self, new: NewArtifact) -> Result<ArtifactRow, StoreError> {
        let id = ArtifactId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audio_artifacts (id, chunk_id, version, path, duration_secs, sample_rate,
                                              channels, bits_per_sample, byte_size, checksum, provider, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    id.as_str(),
                    new.chunk_id.as_str(),
                    new.version,
                    new.path,
                    new.duration_secs,
                    new.sample_rate,
                    new.channels,
                    new.bits_per_sample,
                    new.byte_size as i64,
                    new.checksum,
                    new.provider,
                    now,
                ],
            )?;
            info!(artifact_id = %id, path = %new.path, "artifact recorded");

            Ok(ArtifactRow {
                id,
                chunk_id: new.chunk_id,
                version: new.version,
                path: new.path,
                duration_secs: new.duration_secs,
                sample_rate: new.sample_rate,
                channels: new.channels,
                bits_per_sample: new.bits_per_sample,
                byte_size: new.byte_size,
                checksum: new.checksum,
                provider: new.provider,
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(artifact_id = %id))]
    pub fn get(&self, id: &ArtifactId) -> Result<ArtifactRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM audio_artifacts WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_artifact(row),
                None => Err(StoreError::NotFound(format!("artifact {id}"))),
            }
        })
    }

    /// Every artifact ever produced for a chunk, oldest version first.
    #[instrument(skip(self), fields(chunk_id = %chunk_id))]
    pub fn history(&self, chunk_id: &ChunkId) -> Result<Vec<ArtifactRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM audio_artifacts WHERE chunk_id = ?1 ORDER BY version"
            ))?;
            let mut rows = stmt.query([chunk_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_artifact(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(chunk_id = %chunk_id))]
    pub fn latest(&self, chunk_id: &ChunkId) -> Result<Option<ArtifactRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM audio_artifacts WHERE chunk_id = ?1
                 ORDER BY version DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query([chunk_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_artifact(row).map(Some),
                None => Ok(None),
            }
        })
    }
}

fn row_to_artifact(row: &rusqlite::Row<'_>) -> Result<ArtifactRow, StoreError> {
    let byte_size: i64 = row_helpers::get(row, 8, "audio_artifacts", "byte_size")?;
    let channels = row_helpers::get_u32(row, 6, "audio_artifacts", "channels")?;
    let bits = row_helpers::get_u32(row, 7, "audio_artifacts", "bits_per_sample")?;

    Ok(ArtifactRow {
        id: ArtifactId::from_raw(row_helpers::get::<String>(row, 0, "audio_artifacts", "id")?),
        chunk_id: ChunkId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "audio_artifacts",
            "chunk_id",
        )?),
        version: row_helpers::get_u32(row, 2, "audio_artifacts", "version")?,
        path: row_helpers::get(row, 3, "audio_artifacts", "path")?,
        duration_secs: row_helpers::get(row, 4, "audio_artifacts", "duration_secs")?,
        sample_rate: row_helpers::get_u32(row, 5, "audio_artifacts", "sample_rate")?,
        channels: channels as u16,
        bits_per_sample: bits as u16,
        byte_size: byte_size.max(0) as u64,
        checksum: row_helpers::get(row, 9, "audio_artifacts", "checksum")?,
        provider: row_helpers::get(row, 10, "audio_artifacts", "provider")?,
        created_at: row_helpers::get(row, 11, "audio_artifacts", "created_at")?,
    })
}

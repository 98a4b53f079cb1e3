use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use narrate_core::ids::{ChapterId, ProjectId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChapterRow {
    pub id: ChapterId,
    pub project_id: ProjectId,
    pub sequence: u32,
    pub title: String,
    pub text: String,
    pub output_dir: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct ChapterRepo {
    db: Database,
}

const COLUMNS: &str =
    "id, project_id, sequence, title, text, output_dir, created_at, updated_at";

impl ChapterRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a chapter. Sequence numbers are unique per project.
    #[instrument(skip(self, text), fields(project_id = %project_id, sequence, text_len = text.len()))]
    pub fn create(
        &self,
        project_id: &ProjectId,
        sequence: u32,
        title: &str,
        text: &str,
        output_dir: &str,
    ) -> Result<ChapterRow, StoreError> {
        let id = ChapterId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chapters (id, project_id, sequence, title, text, output_dir, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                rusqlite::params![
                    id.as_str(),
                    project_id.as_str(),
                    sequence,
                    title,
                    text,
                    output_dir,
                    now,
                ],
            )
            .map_err(|e| match StoreError::from(e) {
                StoreError::Conflict(_) => StoreError::Conflict(format!(
                    "chapter {sequence} already exists in project {project_id}"
                )),
                other => other,
            })?;

            Ok(ChapterRow {
                id,
                project_id: project_id.clone(),
                sequence,
                title: title.to_string(),
                text: text.to_string(),
                output_dir: output_dir.to_string(),
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(chapter_id = %id))]
    pub fn get(&self, id: &ChapterId) -> Result<ChapterRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM chapters WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_chapter(row),
                None => Err(StoreError::NotFound(format!("chapter {id}"))),
            }
        })
    }

    /// Chapters of a project in sequence order.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub fn list(&self, project_id: &ProjectId) -> Result<Vec<ChapterRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM chapters WHERE project_id = ?1 ORDER BY sequence"
            ))?;
            let mut rows = stmt.query([project_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_chapter(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(project_id = %project_id, sequence))]
    pub fn find_by_sequence(
        &self,
        project_id: &ProjectId,
        sequence: u32,
    ) -> Result<Option<ChapterRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM chapters WHERE project_id = ?1 AND sequence = ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![project_id.as_str(), sequence])?;
            rows.next()?.map(row_to_chapter).transpose()
        })
    }
}

fn row_to_chapter(row: &rusqlite::Row<'_>) -> Result<ChapterRow, StoreError> {
    Ok(ChapterRow {
        id: ChapterId::from_raw(row_helpers::get::<String>(row, 0, "chapters", "id")?),
        project_id: ProjectId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "chapters",
            "project_id",
        )?),
        sequence: row_helpers::get_u32(row, 2, "chapters", "sequence")?,
        title: row_helpers::get(row, 3, "chapters", "title")?,
        text: row_helpers::get(row, 4, "chapters", "text")?,
        output_dir: row_helpers::get(row, 5, "chapters", "output_dir")?,
        created_at: row_helpers::get(row, 6, "chapters", "created_at")?,
        updated_at: row_helpers::get(row, 7, "chapters", "updated_at")?,
    })
}

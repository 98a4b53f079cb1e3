use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use narrate_core::ids::ProjectId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectRow {
    pub id: ProjectId,
    pub title: String,
    pub source: Option<String>,
    pub created_at: String,
}

pub struct ProjectRepo {
    db: Database,
}

impl ProjectRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(title))]
    pub fn create(&self, title: &str, source: Option<&str>) -> Result<ProjectRow, StoreError> {
        let id = ProjectId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO projects (id, title, source, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.as_str(), title, source, now],
            )?;

            Ok(ProjectRow {
                id,
                title: title.to_string(),
                source: source.map(str::to_string),
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(project_id = %id))]
    pub fn get(&self, id: &ProjectId) -> Result<ProjectRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, title, source, created_at FROM projects WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_project(row),
                None => Err(StoreError::NotFound(format!("project {id}"))),
            }
        })
    }

    /// All projects, oldest first.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<ProjectRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, source, created_at FROM projects ORDER BY created_at, id",
            )?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_project(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_project(row: &rusqlite::Row<'_>) -> Result<ProjectRow, StoreError> {
    Ok(ProjectRow {
        id: ProjectId::from_raw(row_helpers::get::<String>(row, 0, "projects", "id")?),
        title: row_helpers::get(row, 1, "projects", "title")?,
        source: row_helpers::get_opt(row, 2, "projects", "source")?,
        created_at: row_helpers::get(row, 3, "projects", "created_at")?,
    })
}

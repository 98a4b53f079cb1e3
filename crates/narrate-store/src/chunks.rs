use std::collections::HashMap;

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use narrate_core::ids::{ArtifactId, ChapterId, ChunkId};
use narrate_core::{ChunkStatus, Segment, TextSpan};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRow {
    pub id: ChunkId,
    pub chapter_id: ChapterId,
    pub sequence: u32,
    pub span: TextSpan,
    pub text: String,
    pub status: ChunkStatus,
    pub score: Option<f64>,
    pub artifact_id: Option<ArtifactId>,
    pub error: Option<String>,
    pub reprocess_reason: Option<String>,
    pub attempts: u32,
    pub created_at: String,
    pub updated_at: String,
}

impl ChunkRow {
    /// Failed outright, or verified with a score under `threshold`.
    pub fn needs_attention(&self, threshold: f64) -> bool {
        match self.status {
            ChunkStatus::Failed => true,
            ChunkStatus::Excluded => false,
            _ => self.score.is_some_and(|s| s < threshold),
        }
    }
}

/// How a transition treats an optional column.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum FieldUpdate<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T> FieldUpdate<T> {
    fn column_value(&self, to_value: impl Fn(&T) -> Value) -> Option<Value> {
        match self {
            Self::Keep => None,
            Self::Set(v) => Some(to_value(v)),
            Self::Clear => Some(Value::Null),
        }
    }
}

/// Column changes applied together with a status transition.
#[derive(Clone, Debug, Default)]
pub struct TransitionFields {
    pub artifact: FieldUpdate<ArtifactId>,
    pub score: FieldUpdate<f64>,
    pub error: FieldUpdate<String>,
}

impl TransitionFields {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn artifact(mut self, id: ArtifactId) -> Self {
        self.artifact = FieldUpdate::Set(id);
        self
    }

    pub fn score(mut self, score: f64) -> Self {
        self.score = FieldUpdate::Set(score);
        self
    }

    pub fn clear_score(mut self) -> Self {
        self.score = FieldUpdate::Clear;
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = FieldUpdate::Set(message.into());
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = FieldUpdate::Clear;
        self
    }
}

/// Per-status counts for one chapter.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub total: usize,
    pub by_status: HashMap<ChunkStatus, usize>,
    pub average_score: Option<f64>,
}

impl ChunkSummary {
    pub fn count(&self, status: ChunkStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    /// Every chunk is verified or excluded.
    pub fn is_complete(&self) -> bool {
        self.by_status
            .iter()
            .filter(|(status, _)| status.is_settled())
            .map(|(_, n)| n)
            .sum::<usize>()
            == self.total
    }
}

const COLUMNS: &str = "id, chapter_id, sequence, span_start, span_end, text, status, score, \
                       artifact_id, error, reprocess_reason, attempts, created_at, updated_at";

pub struct ChunkRepo {
    db: Database,
}

impl ChunkRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist one `pending` chunk per segment, in order, atomically.
    /// Fails with `DuplicateChapter` if the chapter already has chunks.
    #[instrument(skip(self, segments), fields(chapter_id = %chapter_id, count = segments.len()))]
    pub fn create_chunks(
        &self,
        chapter_id: &ChapterId,
        segments: &[Segment],
    ) -> Result<Vec<ChunkRow>, StoreError> {
        self.db.with_conn(|conn| {
            if count_for_chapter(conn, chapter_id)? > 0 {
                return Err(StoreError::DuplicateChapter(chapter_id.clone()));
            }
            insert_segments(conn, chapter_id, segments)
        })
    }

    /// Idempotent form of [`create_chunks`](Self::create_chunks): existing rows
    /// are returned untouched.
    #[instrument(skip(self, segments), fields(chapter_id = %chapter_id, count = segments.len()))]
    pub fn ensure_chunks(
        &self,
        chapter_id: &ChapterId,
        segments: &[Segment],
    ) -> Result<Vec<ChunkRow>, StoreError> {
        self.db.with_conn(|conn| {
            if count_for_chapter(conn, chapter_id)? > 0 {
                debug!("chunks already exist, reusing");
                return select_chapter(conn, chapter_id, None);
            }
            insert_segments(conn, chapter_id, segments)
        })
    }

    #[instrument(skip(self), fields(chunk_id = %id))]
    pub fn get(&self, id: &ChunkId) -> Result<ChunkRow, StoreError> {
        self.db.with_conn(|conn| select_one(conn, id))
    }

    /// All chunks of a chapter, sorted by sequence.
    #[instrument(skip(self), fields(chapter_id = %chapter_id))]
    pub fn list(&self, chapter_id: &ChapterId) -> Result<Vec<ChunkRow>, StoreError> {
        self.db.with_conn(|conn| select_chapter(conn, chapter_id, None))
    }

    #[instrument(skip(self), fields(chapter_id = %chapter_id))]
    pub fn list_with_status(
        &self,
        chapter_id: &ChapterId,
        statuses: &[ChunkStatus],
    ) -> Result<Vec<ChunkRow>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        self.db
            .with_conn(|conn| select_chapter(conn, chapter_id, Some(statuses)))
    }

    /// Compare-and-set: move to `to` only if the current status is in `from`.
    ///
    /// A single conditional UPDATE; a concurrent claimant loses with
    /// `StaleTransition`. Entering `synthesizing` bumps the attempt counter.
    #[instrument(skip(self, changes), fields(chunk_id = %id))]
    pub fn transition(
        &self,
        id: &ChunkId,
        from: &[ChunkStatus],
        to: ChunkStatus,
        changes: TransitionFields,
    ) -> Result<ChunkRow, StoreError> {
        if from.is_empty() {
            return Err(StoreError::Conflict(format!(
                "transition of {id} with empty source set"
            )));
        }

        let now = Utc::now().to_rfc3339();
        let mut sets = vec!["status = ?".to_string(), "updated_at = ?".to_string()];
        let mut params: Vec<Value> = vec![Value::Text(to.as_str().into()), Value::Text(now)];

        let updates = [
            (
                "artifact_id",
                changes
                    .artifact
                    .column_value(|a| Value::Text(a.as_str().into())),
            ),
            ("score", changes.score.column_value(|s| Value::Real(*s))),
            ("error", changes.error.column_value(|e| Value::Text(e.clone()))),
        ];
        for (column, value) in updates {
            if let Some(value) = value {
                sets.push(format!("{column} = ?"));
                params.push(value);
            }
        }
        if to == ChunkStatus::Synthesizing {
            sets.push("attempts = attempts + 1".into());
        }

        params.push(Value::Text(id.as_str().into()));
        let placeholders = vec!["?"; from.len()].join(", ");
        params.extend(from.iter().map(|s| Value::Text(s.as_str().into())));

        let sql = format!(
            "UPDATE chunks SET {} WHERE id = ? AND status IN ({placeholders})",
            sets.join(", ")
        );

        self.db.with_conn(|conn| {
            let changed = conn.execute(&sql, rusqlite::params_from_iter(params))?;
            if changed == 0 {
                let actual = current_status(conn, id)?;
                debug!(%actual, "transition lost");
                return Err(StoreError::StaleTransition {
                    chunk_id: id.clone(),
                    expected: from.to_vec(),
                    actual,
                });
            }
            select_one(conn, id)
        })
    }

    /// Operator override: remove the chunk from stitching regardless of state.
    #[instrument(skip(self), fields(chunk_id = %id))]
    pub fn mark_excluded(&self, id: &ChunkId) -> Result<ChunkRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE chunks SET status = 'excluded', updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("chunk {id}")));
            }
            info!("chunk excluded");
            select_one(conn, id)
        })
    }

    /// Operator override: send the chunk back to `pending`.
    /// Score and error are cleared; the artifact pointer is kept so history
    /// stays reachable until a new artifact replaces it.
    #[instrument(skip(self), fields(chunk_id = %id, reason))]
    pub fn mark_reprocess(&self, id: &ChunkId, reason: &str) -> Result<ChunkRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE chunks SET status = 'pending', score = NULL, error = NULL,
                        reprocess_reason = ?1, updated_at = ?2
                 WHERE id = ?3",
                rusqlite::params![reason, now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("chunk {id}")));
            }
            info!("chunk marked for reprocessing");
            select_one(conn, id)
        })
    }

    /// Crash recovery for chunks left mid-flight by a dead process:
    /// `synthesizing` goes back to `pending`, `verifying` back to `synthesized`.
    /// Returns the number of chunks reset.
    #[instrument(skip(self), fields(chapter_id = %chapter_id))]
    pub fn reset_in_flight(&self, chapter_id: &ChapterId) -> Result<usize, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let synth = tx.execute(
                "UPDATE chunks SET status = 'pending', updated_at = ?1
                 WHERE chapter_id = ?2 AND status = 'synthesizing'",
                rusqlite::params![now, chapter_id.as_str()],
            )?;
            let verify = tx.execute(
                "UPDATE chunks SET status = 'synthesized', updated_at = ?1
                 WHERE chapter_id = ?2 AND status = 'verifying'",
                rusqlite::params![now, chapter_id.as_str()],
            )?;
            tx.commit()?;
            if synth + verify > 0 {
                info!(synthesizing = synth, verifying = verify, "reset in-flight chunks");
            }
            Ok(synth + verify)
        })
    }

    #[instrument(skip(self), fields(chapter_id = %chapter_id))]
    pub fn summary(&self, chapter_id: &ChapterId) -> Result<ChunkSummary, StoreError> {
        self.db.with_conn(|conn| {
            let mut summary = ChunkSummary::default();
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM chunks WHERE chapter_id = ?1 GROUP BY status",
            )?;
            let mut rows = stmt.query([chapter_id.as_str()])?;
            while let Some(row) = rows.next()? {
                let raw: String = row_helpers::get(row, 0, "chunks", "status")?;
                let status: ChunkStatus = row_helpers::parse_enum(&raw, "chunks", "status")?;
                let count: i64 = row_helpers::get(row, 1, "chunks", "count")?;
                let count = count as usize;
                summary.total += count;
                summary.by_status.insert(status, count);
            }

            summary.average_score = conn.query_row(
                "SELECT AVG(score) FROM chunks
                 WHERE chapter_id = ?1 AND score IS NOT NULL AND status != 'excluded'",
                [chapter_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(summary)
        })
    }

    /// Chunks needing attention: `failed`, or scored under `threshold`.
    /// Excluded chunks are never flagged.
    #[instrument(skip(self), fields(chapter_id = %chapter_id, threshold))]
    pub fn flagged(
        &self,
        chapter_id: &ChapterId,
        threshold: f64,
    ) -> Result<Vec<ChunkRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM chunks
                 WHERE chapter_id = ?1 AND status != 'excluded'
                   AND (status = 'failed' OR (score IS NOT NULL AND score < ?2))
                 ORDER BY sequence"
            ))?;
            let mut rows = stmt.query(rusqlite::params![chapter_id.as_str(), threshold])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_chunk(row)?);
            }
            Ok(results)
        })
    }
}

fn count_for_chapter(
    conn: &rusqlite::Connection,
    chapter_id: &ChapterId,
) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM chunks WHERE chapter_id = ?1",
        [chapter_id.as_str()],
        |row| row.get(0),
    )?)
}

fn insert_segments(
    conn: &rusqlite::Connection,
    chapter_id: &ChapterId,
    segments: &[Segment],
) -> Result<Vec<ChunkRow>, StoreError> {
    let now = Utc::now().to_rfc3339();
    let tx = conn.unchecked_transaction()?;
    let mut created = Vec::with_capacity(segments.len());
    {
        let mut stmt = tx.prepare(
            "INSERT INTO chunks (id, chapter_id, sequence, span_start, span_end, text, status,
                                 attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?7)",
        )?;
        for (sequence, segment) in segments.iter().enumerate() {
            let id = ChunkId::new();
            let sequence = sequence as u32;
            stmt.execute(rusqlite::params![
                id.as_str(),
                chapter_id.as_str(),
                sequence,
                segment.span.start as i64,
                segment.span.end as i64,
                segment.text,
                now,
            ])?;
            created.push(ChunkRow {
                id,
                chapter_id: chapter_id.clone(),
                sequence,
                span: segment.span,
                text: segment.text.clone(),
                status: ChunkStatus::Pending,
                score: None,
                artifact_id: None,
                error: None,
                reprocess_reason: None,
                attempts: 0,
                created_at: now.clone(),
                updated_at: now.clone(),
            });
        }
    }
    tx.commit()?;
    info!(count = created.len(), "chunks created");
    Ok(created)
}

fn select_one(conn: &rusqlite::Connection, id: &ChunkId) -> Result<ChunkRow, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM chunks WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_chunk(row),
        None => Err(StoreError::NotFound(format!("chunk {id}"))),
    }
}

fn select_chapter(
    conn: &rusqlite::Connection,
    chapter_id: &ChapterId,
    statuses: Option<&[ChunkStatus]>,
) -> Result<Vec<ChunkRow>, StoreError> {
    let mut params = vec![Value::Text(chapter_id.as_str().into())];
    let filter = match statuses {
        Some(statuses) => {
            params.extend(statuses.iter().map(|s| Value::Text(s.as_str().into())));
            format!(" AND status IN ({})", vec!["?"; statuses.len()].join(", "))
        }
        None => String::new(),
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM chunks WHERE chapter_id = ?{filter} ORDER BY sequence"
    ))?;
    let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(row_to_chunk(row)?);
    }
    Ok(results)
}

fn current_status(conn: &rusqlite::Connection, id: &ChunkId) -> Result<ChunkStatus, StoreError> {
    let raw: Option<String> = conn
        .query_row("SELECT status FROM chunks WHERE id = ?1", [id.as_str()], |row| {
            row.get(0)
        })
        .optional()?;
    match raw {
        Some(raw) => row_helpers::parse_enum(&raw, "chunks", "status"),
        None => Err(StoreError::NotFound(format!("chunk {id}"))),
    }
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> Result<ChunkRow, StoreError> {
    let status_str: String = row_helpers::get(row, 6, "chunks", "status")?;
    let start: i64 = row_helpers::get(row, 3, "chunks", "span_start")?;
    let end: i64 = row_helpers::get(row, 4, "chunks", "span_end")?;
    if start < 0 || end < start {
        return Err(StoreError::CorruptRow {
            table: "chunks",
            column: "span_start",
            detail: format!("invalid span {start}..{end}"),
        });
    }

    Ok(ChunkRow {
        id: ChunkId::from_raw(row_helpers::get::<String>(row, 0, "chunks", "id")?),
        chapter_id: ChapterId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "chunks",
            "chapter_id",
        )?),
        sequence: row_helpers::get_u32(row, 2, "chunks", "sequence")?,
        span: TextSpan::new(start as usize, end as usize),
        text: row_helpers::get(row, 5, "chunks", "text")?,
        status: row_helpers::parse_enum(&status_str, "chunks", "status")?,
        score: row_helpers::get_opt(row, 7, "chunks", "score")?,
        artifact_id: row_helpers::get_opt::<String>(row, 8, "chunks", "artifact_id")?
            .map(ArtifactId::from_raw),
        error: row_helpers::get_opt(row, 9, "chunks", "error")?,
        reprocess_reason: row_helpers::get_opt(row, 10, "chunks", "reprocess_reason")?,
        attempts: row_helpers::get_u32(row, 11, "chunks", "attempts")?,
        created_at: row_helpers::get(row, 12, "chunks", "created_at")?,
        updated_at: row_helpers::get(row, 13, "chunks", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::chapters::ChapterRepo;
    use crate::projects::ProjectRepo;

    fn setup() -> (Database, ChapterId) {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).create("Book", None).unwrap();
        let chapter = ChapterRepo::new(db.clone())
            .create(&project.id, 1, "One", "Alpha. Beta. Gamma.", "/tmp")
            .unwrap();
        (db, chapter.id)
    }

    fn segments() -> Vec<Segment> {
        vec![
            Segment { span: TextSpan::new(0, 7), text: "Alpha. ".into() },
            Segment { span: TextSpan::new(7, 13), text: "Beta. ".into() },
            Segment { span: TextSpan::new(13, 19), text: "Gamma.".into() },
        ]
    }

    #[test]
    fn create_chunks_in_order() {
        let (db, chapter_id) = setup();
        let repo = ChunkRepo::new(db);
        let created = repo.create_chunks(&chapter_id, &segments()).unwrap();
        assert_eq!(created.len(), 3);

        let listed = repo.list(&chapter_id).unwrap();
        let seqs: Vec<u32> = listed.iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(listed.iter().all(|c| c.status == ChunkStatus::Pending));
        assert_eq!(listed[1].span, TextSpan::new(7, 13));
        assert_eq!(listed[2].text, "Gamma.");
    }

    #[test]
    fn create_chunks_twice_is_duplicate() {
        let (db, chapter_id) = setup();
        let repo = ChunkRepo::new(db);
        repo.create_chunks(&chapter_id, &segments()).unwrap();
        let err = repo.create_chunks(&chapter_id, &segments()).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateChapter(id) if id == chapter_id));
        assert_eq!(repo.list(&chapter_id).unwrap().len(), 3);
    }

    #[test]
    fn ensure_chunks_reuses_existing_rows() {
        let (db, chapter_id) = setup();
        let repo = ChunkRepo::new(db);
        let first = repo.ensure_chunks(&chapter_id, &segments()).unwrap();
        let second = repo.ensure_chunks(&chapter_id, &segments()[..1]).unwrap();
        assert_eq!(second.len(), 3);
        assert_eq!(first[0].id, second[0].id);
    }

    #[test]
    fn empty_segment_list_creates_nothing() {
        let (db, chapter_id) = setup();
        let repo = ChunkRepo::new(db);
        assert!(repo.create_chunks(&chapter_id, &[]).unwrap().is_empty());
        assert!(repo.list(&chapter_id).unwrap().is_empty());
    }

    #[test]
    fn transition_applies_fields() {
        let (db, chapter_id) = setup();
        let repo = ChunkRepo::new(db);
        let chunk = repo.create_chunks(&chapter_id, &segments()).unwrap().remove(0);

        let claimed = repo
            .transition(
                &chunk.id,
                &ChunkStatus::DISPATCHABLE,
                ChunkStatus::Synthesizing,
                TransitionFields::none(),
            )
            .unwrap();
        assert_eq!(claimed.status, ChunkStatus::Synthesizing);
        assert_eq!(claimed.attempts, 1);

        let artifact = ArtifactId::from_raw("art_1");
        let done = repo
            .transition(
                &chunk.id,
                &[ChunkStatus::Synthesizing],
                ChunkStatus::Synthesized,
                TransitionFields::none().artifact(artifact.clone()).error("stale"),
            )
            .unwrap();
        assert_eq!(done.artifact_id, Some(artifact.clone()));
        assert_eq!(done.error.as_deref(), Some("stale"));

        let cleared = repo
            .transition(
                &chunk.id,
                &[ChunkStatus::Synthesized],
                ChunkStatus::Verified,
                TransitionFields::none().score(0.93).clear_error(),
            )
            .unwrap();
        assert_eq!(cleared.artifact_id, Some(artifact));
        assert_eq!(cleared.score, Some(0.93));
        assert!(cleared.error.is_none());
    }

    #[test]
    fn transition_outside_from_is_stale() {
        let (db, chapter_id) = setup();
        let repo = ChunkRepo::new(db);
        let chunk = repo.create_chunks(&chapter_id, &segments()).unwrap().remove(0);

        let err = repo
            .transition(
                &chunk.id,
                &[ChunkStatus::Synthesized],
                ChunkStatus::Verifying,
                TransitionFields::none(),
            )
            .unwrap_err();
        match err {
            StoreError::StaleTransition { actual, expected, .. } => {
                assert_eq!(actual, ChunkStatus::Pending);
                assert_eq!(expected, vec![ChunkStatus::Synthesized]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(repo.get(&chunk.id).unwrap().status, ChunkStatus::Pending);
    }

    #[test]
    fn transition_missing_chunk_is_not_found() {
        let (db, _) = setup();
        let repo = ChunkRepo::new(db);
        let err = repo
            .transition(
                &ChunkId::from_raw("chunk_missing"),
                &[ChunkStatus::Pending],
                ChunkStatus::Synthesizing,
                TransitionFields::none(),
            )
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let (db, chapter_id) = setup();
        let repo = Arc::new(ChunkRepo::new(db));
        let chunk = repo.create_chunks(&chapter_id, &segments()).unwrap().remove(0);
        let wins = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let repo = repo.clone();
                let wins = wins.clone();
                let id = chunk.id.clone();
                std::thread::spawn(move || {
                    match repo.transition(
                        &id,
                        &ChunkStatus::DISPATCHABLE,
                        ChunkStatus::Synthesizing,
                        TransitionFields::none(),
                    ) {
                        Ok(_) => {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => assert!(e.is_stale(), "unexpected error: {e}"),
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        let row = repo.get(&chunk.id).unwrap();
        assert_eq!(row.status, ChunkStatus::Synthesizing);
        assert_eq!(row.attempts, 1);
    }

    #[test]
    fn concurrent_random_transitions_never_escape_from_set() {
        let (db, chapter_id) = setup();
        let repo = Arc::new(ChunkRepo::new(db));
        let chunk = repo.create_chunks(&chapter_id, &segments()).unwrap().remove(0);

        // Each thread hammers one lifecycle edge. A loss must report a
        // status outside the edge's source set.
        let edges: Vec<(Vec<ChunkStatus>, ChunkStatus)> = vec![
            (ChunkStatus::DISPATCHABLE.to_vec(), ChunkStatus::Synthesizing),
            (vec![ChunkStatus::Synthesizing], ChunkStatus::Synthesized),
            (vec![ChunkStatus::Synthesizing], ChunkStatus::Failed),
            (vec![ChunkStatus::Synthesized], ChunkStatus::Verifying),
            (vec![ChunkStatus::Verifying], ChunkStatus::Verified),
            (vec![ChunkStatus::Verifying], ChunkStatus::Failed),
            (vec![ChunkStatus::Verified], ChunkStatus::Pending),
        ];

        let handles: Vec<_> = edges
            .into_iter()
            .map(|(from, to)| {
                let repo = repo.clone();
                let id = chunk.id.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        match repo.transition(&id, &from, to, TransitionFields::none()) {
                            Ok(row) => assert_eq!(row.status, to),
                            Err(StoreError::StaleTransition { actual, .. }) => {
                                assert!(!from.contains(&actual), "lost with {actual} in {from:?}");
                            }
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let row = repo.get(&chunk.id).unwrap();
        assert!(ChunkStatus::ALL.contains(&row.status));
    }

    #[test]
    fn list_with_status_filters() {
        let (db, chapter_id) = setup();
        let repo = ChunkRepo::new(db);
        let chunks = repo.create_chunks(&chapter_id, &segments()).unwrap();
        repo.transition(
            &chunks[1].id,
            &[ChunkStatus::Pending],
            ChunkStatus::Failed,
            TransitionFields::none().error("boom"),
        )
        .unwrap();

        let failed = repo.list_with_status(&chapter_id, &[ChunkStatus::Failed]).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].sequence, 1);

        let dispatchable = repo
            .list_with_status(&chapter_id, &ChunkStatus::DISPATCHABLE)
            .unwrap();
        assert_eq!(dispatchable.len(), 3);
        assert!(repo.list_with_status(&chapter_id, &[]).unwrap().is_empty());
    }

    #[test]
    fn mark_reprocess_keeps_artifact_and_records_reason() {
        let (db, chapter_id) = setup();
        let repo = ChunkRepo::new(db);
        let chunk = repo.create_chunks(&chapter_id, &segments()).unwrap().remove(0);
        repo.transition(
            &chunk.id,
            &[ChunkStatus::Pending],
            ChunkStatus::Verified,
            TransitionFields::none()
                .artifact(ArtifactId::from_raw("art_x"))
                .score(0.5),
        )
        .unwrap();

        let row = repo.mark_reprocess(&chunk.id, "mispronounced name").unwrap();
        assert_eq!(row.status, ChunkStatus::Pending);
        assert!(row.score.is_none());
        assert_eq!(row.artifact_id.as_ref().map(|a| a.as_str()), Some("art_x"));
        assert_eq!(row.reprocess_reason.as_deref(), Some("mispronounced name"));
    }

    #[test]
    fn mark_excluded_from_any_state() {
        let (db, chapter_id) = setup();
        let repo = ChunkRepo::new(db);
        let chunk = repo.create_chunks(&chapter_id, &segments()).unwrap().remove(0);
        repo.transition(
            &chunk.id,
            &[ChunkStatus::Pending],
            ChunkStatus::Synthesizing,
            TransitionFields::none(),
        )
        .unwrap();
        let row = repo.mark_excluded(&chunk.id).unwrap();
        assert_eq!(row.status, ChunkStatus::Excluded);

        // The in-flight worker's completion now loses.
        let err = repo
            .transition(
                &chunk.id,
                &[ChunkStatus::Synthesizing],
                ChunkStatus::Synthesized,
                TransitionFields::none(),
            )
            .unwrap_err();
        assert!(err.is_stale());
    }

    #[test]
    fn overrides_on_missing_chunk_are_not_found() {
        let (db, _) = setup();
        let repo = ChunkRepo::new(db);
        let id = ChunkId::from_raw("chunk_missing");
        assert!(repo.mark_excluded(&id).unwrap_err().is_not_found());
        assert!(repo.mark_reprocess(&id, "x").unwrap_err().is_not_found());
    }

    #[test]
    fn reset_in_flight_recovers() {
        let (db, chapter_id) = setup();
        let repo = ChunkRepo::new(db);
        let chunks = repo.create_chunks(&chapter_id, &segments()).unwrap();
        repo.transition(&chunks[0].id, &[ChunkStatus::Pending], ChunkStatus::Synthesizing, TransitionFields::none())
            .unwrap();
        repo.transition(&chunks[1].id, &[ChunkStatus::Pending], ChunkStatus::Verifying, TransitionFields::none())
            .unwrap();

        assert_eq!(repo.reset_in_flight(&chapter_id).unwrap(), 2);
        let rows = repo.list(&chapter_id).unwrap();
        assert_eq!(rows[0].status, ChunkStatus::Pending);
        assert_eq!(rows[1].status, ChunkStatus::Synthesized);
        assert_eq!(rows[2].status, ChunkStatus::Pending);
        assert_eq!(repo.reset_in_flight(&chapter_id).unwrap(), 0);
    }

    #[test]
    fn summary_and_flagged() {
        let (db, chapter_id) = setup();
        let repo = ChunkRepo::new(db);
        let chunks = repo.create_chunks(&chapter_id, &segments()).unwrap();
        repo.transition(&chunks[0].id, &[ChunkStatus::Pending], ChunkStatus::Verified, TransitionFields::none().score(0.9))
            .unwrap();
        repo.transition(&chunks[1].id, &[ChunkStatus::Pending], ChunkStatus::Verified, TransitionFields::none().score(0.5))
            .unwrap();
        repo.transition(&chunks[2].id, &[ChunkStatus::Pending], ChunkStatus::Failed, TransitionFields::none().error("auth"))
            .unwrap();

        let summary = repo.summary(&chapter_id).unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.count(ChunkStatus::Verified), 2);
        assert_eq!(summary.count(ChunkStatus::Failed), 1);
        assert_eq!(summary.count(ChunkStatus::Pending), 0);
        assert!((summary.average_score.unwrap() - 0.7).abs() < 1e-9);
        assert!(!summary.is_complete());

        let flagged = repo.flagged(&chapter_id, 0.85).unwrap();
        let seqs: Vec<u32> = flagged.iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert!(flagged.iter().all(|c| c.needs_attention(0.85)));

        repo.mark_excluded(&chunks[1].id).unwrap();
        let flagged = repo.flagged(&chapter_id, 0.85).unwrap();
        assert_eq!(flagged.len(), 1);

        repo.mark_excluded(&chunks[2].id).unwrap();
        assert!(repo.summary(&chapter_id).unwrap().is_complete());
    }

    #[test]
    fn summary_of_empty_chapter_is_complete() {
        let (db, chapter_id) = setup();
        let repo = ChunkRepo::new(db);
        let summary = repo.summary(&chapter_id).unwrap();
        assert_eq!(summary.total, 0);
        assert!(summary.average_score.is_none());
        assert!(summary.is_complete());
    }

    #[test]
    fn corrupt_status_is_reported() {
        let (db, chapter_id) = setup();
        let repo = ChunkRepo::new(db.clone());
        let chunk = repo.create_chunks(&chapter_id, &segments()).unwrap().remove(0);
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE chunks SET status = 'done' WHERE id = ?1",
                [chunk.id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();
        assert!(matches!(
            repo.get(&chunk.id),
            Err(StoreError::CorruptRow { table: "chunks", column: "status", .. })
        ));
    }
}

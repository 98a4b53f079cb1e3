use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use narrate_core::ids::ArtifactId;
use narrate_core::{TranscribedWord, Transcript};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Verification result for one artifact. Word times are relative to that artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscriptRow {
    pub artifact_id: ArtifactId,
    pub transcript: Transcript,
    pub score: Option<f64>,
    pub word_error_rate: Option<f64>,
    pub missing_words: Vec<String>,
    pub extra_words: Vec<String>,
    pub provider: String,
    pub created_at: String,
}

pub struct TranscriptRepo {
    db: Database,
}

impl TranscriptRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store the transcript of an artifact, replacing any earlier one.
    #[instrument(skip_all, fields(artifact_id = %artifact_id, words = transcript.words.len()))]
    #[allow(clippy::too_many_arguments)]
    pub fn save(
        &self,
        artifact_id: &ArtifactId,
        provider: &str,
        transcript: &Transcript,
        score: Option<f64>,
        word_error_rate: Option<f64>,
        missing_words: &[String],
        extra_words: &[String],
    ) -> Result<TranscriptRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        let words_json = serde_json::to_string(&transcript.words)?;
        let missing_json = serde_json::to_string(missing_words)?;
        let extra_json = serde_json::to_string(extra_words)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO transcripts
                    (artifact_id, text, words, score, word_error_rate, missing_words, extra_words, provider, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    artifact_id.as_str(),
                    transcript.text,
                    words_json,
                    score,
                    word_error_rate,
                    missing_json,
                    extra_json,
                    provider,
                    now,
                ],
            )?;

            Ok(TranscriptRow {
                artifact_id: artifact_id.clone(),
                transcript: transcript.clone(),
                score,
                word_error_rate,
                missing_words: missing_words.to_vec(),
                extra_words: extra_words.to_vec(),
                provider: provider.to_string(),
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(artifact_id = %artifact_id))]
    pub fn get(&self, artifact_id: &ArtifactId) -> Result<TranscriptRow, StoreError> {
        self.find(artifact_id)?
            .ok_or_else(|| StoreError::NotFound(format!("transcript for {artifact_id}")))
    }

    #[instrument(skip(self), fields(artifact_id = %artifact_id))]
    pub fn find(&self, artifact_id: &ArtifactId) -> Result<Option<TranscriptRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT artifact_id, text, words, score, word_error_rate, missing_words,
                        extra_words, provider, created_at
                 FROM transcripts WHERE artifact_id = ?1",
            )?;
            let mut rows = stmt.query([artifact_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_transcript(row).map(Some),
                None => Ok(None),
            }
        })
    }
}

fn row_to_transcript(row: &rusqlite::Row<'_>) -> Result<TranscriptRow, StoreError> {
    let words_raw: String = row_helpers::get(row, 2, "transcripts", "words")?;
    let missing_raw: String = row_helpers::get(row, 5, "transcripts", "missing_words")?;
    let extra_raw: String = row_helpers::get(row, 6, "transcripts", "extra_words")?;
    let words: Vec<TranscribedWord> = row_helpers::parse_json(&words_raw, "transcripts", "words")?;

    Ok(TranscriptRow {
        artifact_id: ArtifactId::from_raw(row_helpers::get::<String>(
            row,
            0,
            "transcripts",
            "artifact_id",
        )?),
        transcript: Transcript {
            text: row_helpers::get(row, 1, "transcripts", "text")?,
            words,
        },
        score: row_helpers::get_opt(row, 3, "transcripts", "score")?,
        word_error_rate: row_helpers::get_opt(row, 4, "transcripts", "word_error_rate")?,
        missing_words: row_helpers::parse_json(&missing_raw, "transcripts", "missing_words")?,
        extra_words: row_helpers::parse_json(&extra_raw, "transcripts", "extra_words")?,
        provider: row_helpers::get(row, 7, "transcripts", "provider")?,
        created_at: row_helpers::get(row, 8, "transcripts", "created_at")?,
    })
}

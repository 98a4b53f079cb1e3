/// SQL DDL for the chunk store.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    source TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chapters (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    sequence INTEGER NOT NULL,
    title TEXT NOT NULL,
    text TEXT NOT NULL,
    output_dir TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (project_id, sequence)
);

CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    chapter_id TEXT NOT NULL REFERENCES chapters(id),
    sequence INTEGER NOT NULL,
    span_start INTEGER NOT NULL,
    span_end INTEGER NOT NULL,
    text TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    score REAL,
    artifact_id TEXT,
    error TEXT,
    reprocess_reason TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (chapter_id, sequence)
);

CREATE TABLE IF NOT EXISTS audio_artifacts (
    id TEXT PRIMARY KEY,
    chunk_id TEXT NOT NULL REFERENCES chunks(id),
    version INTEGER NOT NULL,
    path TEXT NOT NULL,
    duration_secs REAL NOT NULL,
    sample_rate INTEGER NOT NULL,
    channels INTEGER NOT NULL,
    bits_per_sample INTEGER NOT NULL,
    byte_size INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    provider TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (chunk_id, version)
);

CREATE TABLE IF NOT EXISTS transcripts (
    artifact_id TEXT PRIMARY KEY REFERENCES audio_artifacts(id),
    text TEXT NOT NULL,
    words TEXT NOT NULL,
    score REAL,
    word_error_rate REAL,
    missing_words TEXT NOT NULL,
    extra_words TEXT NOT NULL,
    provider TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chapter_audio (
    id TEXT PRIMARY KEY,
    chapter_id TEXT NOT NULL REFERENCES chapters(id),
    version INTEGER NOT NULL,
    path TEXT NOT NULL,
    duration_secs REAL NOT NULL,
    sample_rate INTEGER NOT NULL,
    channels INTEGER NOT NULL,
    byte_size INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    included_chunks TEXT NOT NULL,
    excluded_chunks TEXT NOT NULL,
    boundaries TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE (chapter_id, version)
);

CREATE INDEX IF NOT EXISTS idx_chapters_project ON chapters(project_id);
CREATE INDEX IF NOT EXISTS idx_chunks_chapter_seq ON chunks(chapter_id, sequence);
CREATE INDEX IF NOT EXISTS idx_chunks_status ON chunks(chapter_id, status);
CREATE INDEX IF NOT EXISTS idx_artifacts_chunk ON audio_artifacts(chunk_id, version);
CREATE INDEX IF NOT EXISTS idx_chapter_audio_chapter ON chapter_audio(chapter_id, version);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

/// Every mutation is durable before the call returns.
pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = FULL;
"#;

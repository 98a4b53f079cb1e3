//! On-disk layout of artifacts. Files are written once and never replaced.
//!
//! ```text
//! <chapter output dir>/
//!   chunks/chunk_0003_v002_20261018T101500123Z.wav
//!   chapter_007_v001_20261018T102000456Z.wav
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

const STAMP: &str = "%Y%m%dT%H%M%S%3fZ";

pub fn chunk_dir(chapter_dir: &Path) -> PathBuf {
    chapter_dir.join("chunks")
}

pub fn chunk_artifact_name(sequence: u32, version: u32, at: DateTime<Utc>) -> String {
    format!("chunk_{sequence:04}_v{version:03}_{}.wav", at.format(STAMP))
}

pub fn chapter_audio_name(sequence: u32, version: u32, at: DateTime<Utc>) -> String {
    format!("chapter_{sequence:03}_v{version:03}_{}.wav", at.format(STAMP))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Create `path` (and its parent directories) and write `bytes` durably.
/// Fails with `AlreadyExists` rather than overwrite.
pub async fn write_new(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

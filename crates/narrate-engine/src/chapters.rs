//! Chapter heading detection for imported manuscripts.

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::error::EngineError;

/// `Chapter 3: Title`, `CHAPTER 3`, `Ch. 3 - Title`, `Part 2 — Title`.
const HEADING_PATTERN: &str = r"(?i)^(?:chapter\s+|ch\.\s*|part\s+)(\d+)\s*[.:\-–—]?\s*(.*)$";

/// Longer lines are prose that happens to start with "Chapter 3 …".
const MAX_HEADING_CHARS: usize = 120;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectedChapter {
    pub number: u32,
    pub title: String,
    pub text: String,
}

pub struct ChapterDetector {
    heading: Regex,
}

impl ChapterDetector {
    pub fn new() -> Result<Self, EngineError> {
        let heading = Regex::new(HEADING_PATTERN)
            .map_err(|e| EngineError::Internal(format!("heading pattern: {e}")))?;
        Ok(Self { heading })
    }

    fn heading(&self, line: &str) -> Option<(u32, String)> {
        if line.chars().count() > MAX_HEADING_CHARS {
            return None;
        }
        let caps = self.heading.captures(line)?;
        let number = caps.get(1)?.as_str().parse().ok()?;
        let title = caps.get(2).map_or("", |m| m.as_str()).trim();
        let title = if title.is_empty() {
            format!("Chapter {number}")
        } else {
            title.to_string()
        };
        Some((number, title))
    }

    /// Split `text` at heading lines. Text before the first heading is
    /// dropped; text without any heading becomes a single "Chapter 1".
    pub fn detect(&self, text: &str) -> Vec<DetectedChapter> {
        let mut chapters = Vec::new();
        let mut current: Option<(u32, String, usize)> = None;
        let mut offset = 0;

        for line in text.split_inclusive('\n') {
            let line_start = offset;
            offset += line.len();

            let Some((number, title)) = self.heading(line.trim()) else {
                continue;
            };
            match current.take() {
                Some((n, t, body_start)) => chapters.push(DetectedChapter {
                    number: n,
                    title: t,
                    text: text[body_start..line_start].trim().to_string(),
                }),
                None if !text[..line_start].trim().is_empty() => {
                    debug!(bytes = line_start, "dropping text before first heading");
                }
                None => {}
            }
            current = Some((number, title, offset));
        }

        match current {
            Some((number, title, body_start)) => chapters.push(DetectedChapter {
                number,
                title,
                text: text[body_start..].trim().to_string(),
            }),
            None if !text.trim().is_empty() => chapters.push(DetectedChapter {
                number: 1,
                title: "Chapter 1".into(),
                text: text.trim().to_string(),
            }),
            None => {}
        }
        chapters
    }
}

/// One-shot form of [`ChapterDetector::detect`].
pub fn detect_chapters(text: &str) -> Result<Vec<DetectedChapter>, EngineError> {
    Ok(ChapterDetector::new()?.detect(text))
}

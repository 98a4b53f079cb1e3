//! Word-level comparison of a transcript against the text it was read from.
//!
//! Words are compared after normalisation: punctuation separates words
//! (apostrophes are dropped so "don't" matches "dont"), and case is folded
//! only when asked. Spelling variants are not folded.

use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScoreReport {
    /// `2·LCS / (|source| + |transcript|)`, in `0.0..=1.0`.
    pub score: f64,
    /// Word edit distance over source length.
    pub word_error_rate: f64,
    /// Source words absent from the longest common subsequence.
    pub missing: Vec<String>,
    /// Transcript words absent from the longest common subsequence.
    pub extra: Vec<String>,
}

pub fn normalize_words(text: &str, case_sensitive: bool) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() {
            if case_sensitive {
                current.push(c);
            } else {
                current.extend(c.to_lowercase());
            }
        } else if c == '\'' || c == '’' {
            continue;
        } else if !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

pub fn score_transcript(source: &str, transcript: &str, case_sensitive: bool) -> ScoreReport {
    let src = normalize_words(source, case_sensitive);
    let heard = normalize_words(transcript, case_sensitive);

    let (matched, missing, extra) = lcs_diff(&src, &heard);
    let total = src.len() + heard.len();
    let score = if total == 0 {
        1.0
    } else {
        2.0 * matched as f64 / total as f64
    };
    let word_error_rate = edit_distance(&src, &heard) as f64 / src.len().max(1) as f64;

    ScoreReport {
        score,
        word_error_rate,
        missing,
        extra,
    }
}

/// LCS length plus the words of each side left out of it, in order.
fn lcs_diff(a: &[String], b: &[String]) -> (usize, Vec<String>, Vec<String>) {
    let (n, m) = (a.len(), b.len());
    let width = m + 1;
    // table[i * width + j] = LCS of a[i..] and b[j..]
    let mut table = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * width + j] = if a[i] == b[j] {
                table[(i + 1) * width + j + 1] + 1
            } else {
                table[(i + 1) * width + j].max(table[i * width + j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    let mut missing = Vec::new();
    let mut extra = Vec::new();
    while i < n && j < m {
        if a[i] == b[j] {
            i += 1;
            j += 1;
        } else if table[(i + 1) * width + j] >= table[i * width + j + 1] {
            missing.push(a[i].clone());
            i += 1;
        } else {
            extra.push(b[j].clone());
            j += 1;
        }
    }
    missing.extend(a[i..].iter().cloned());
    extra.extend(b[j..].iter().cloned());

    (table[0] as usize, missing, extra)
}

fn edit_distance(a: &[String], b: &[String]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0; b.len() + 1];
    for (i, wa) in a.iter().enumerate() {
        row[0] = i + 1;
        for (j, wb) in b.iter().enumerate() {
            let substitute = prev[j] + usize::from(wa != wb);
            row[j + 1] = substitute.min(prev[j + 1] + 1).min(row[j] + 1);
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_scores_one() {
        let report = score_transcript("Hello, world!", "hello world", false);
        assert!((report.score - 1.0).abs() < f64::EPSILON);
        assert_eq!(report.word_error_rate, 0.0);
        assert!(report.missing.is_empty());
        assert!(report.extra.is_empty());
    }

    #[test]
    fn case_matters_by_default() {
        let report = score_transcript("Hello world", "hello world", true);
        assert!((report.score - 0.5).abs() < 1e-9);
        assert_eq!(report.missing, ["Hello"]);
        assert_eq!(report.extra, ["hello"]);
    }

    #[test]
    fn spelling_variants_are_not_folded() {
        let report = score_transcript("the colour red", "the color red", false);
        assert!(report.score < 1.0);
        assert_eq!(report.missing, ["colour"]);
        assert_eq!(report.extra, ["color"]);
    }

    #[test]
    fn dropped_and_added_words() {
        let report = score_transcript("one two three four", "one three four five", false);
        // LCS = one three four
        assert!((report.score - 0.75).abs() < 1e-9);
        assert_eq!(report.missing, ["two"]);
        assert_eq!(report.extra, ["five"]);
        assert!((report.word_error_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn apostrophes_and_hyphens() {
        assert_eq!(normalize_words("Don't well-known", false), ["dont", "well", "known"]);
        assert_eq!(normalize_words("it’s", true), ["its"]);
    }

    #[test]
    fn empty_sides() {
        assert_eq!(score_transcript("", "", false).score, 1.0);
        let silent = score_transcript("words here", "", false);
        assert_eq!(silent.score, 0.0);
        assert_eq!(silent.word_error_rate, 1.0);
        assert_eq!(silent.missing.len(), 2);
        assert_eq!(score_transcript("", "noise", false).score, 0.0);
    }
}

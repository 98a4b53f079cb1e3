//! Sentence-aware chunking of chapter text.
//!
//! Spans returned by [`segment`] tile the input exactly: no gaps, no
//! overlaps, every boundary on a char boundary. Whitespace after a sentence
//! belongs to that sentence. The size limit is counted in characters of the
//! trimmed chunk text, which is what gets spoken.

use narrate_core::{Segment, TextSpan};

const TERMINALS: &[char] = &['.', '!', '?', '…'];
const CLOSERS: &[char] = &['"', '\'', '”', '’', ')', ']', '}', '»'];

/// Split `text` into chunks of at most `max_chars` characters, breaking at
/// sentence ends where possible. Empty and whitespace-only text yield no
/// segments. A `max_chars` of zero is treated as one.
pub fn segment(text: &str, max_chars: usize) -> Vec<Segment> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let max_chars = max_chars.max(1);

    let mut out = Vec::new();
    let mut start = 0;
    let mut end = 0;

    for sentence_end in sentence_ends(text) {
        if spoken_len(&text[start..sentence_end]) <= max_chars {
            end = sentence_end;
            continue;
        }
        if end > start {
            push(&mut out, text, start, end);
            start = end;
        }
        start = force_split(&mut out, text, start, sentence_end, max_chars);
        end = sentence_end;
    }
    if end > start {
        push(&mut out, text, start, end);
    }
    out
}

fn push(out: &mut Vec<Segment>, text: &str, start: usize, end: usize) {
    let span = TextSpan::new(start, end);
    out.push(Segment {
        span,
        text: span.slice(text).trim().to_string(),
    });
}

fn spoken_len(s: &str) -> usize {
    s.trim().chars().count()
}

/// Byte offsets where sentences end, the last always being `text.len()`.
fn sentence_ends(text: &str) -> Vec<usize> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let n = chars.len();
    let mut ends = Vec::new();
    let mut i = 0;

    while i < n {
        if !TERMINALS.contains(&chars[i].1) {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j < n && TERMINALS.contains(&chars[j].1) {
            j += 1;
        }
        while j < n && CLOSERS.contains(&chars[j].1) {
            j += 1;
        }
        if j < n && chars[j].1.is_whitespace() {
            while j < n && chars[j].1.is_whitespace() {
                j += 1;
            }
            if j < n {
                ends.push(chars[j].0);
            }
        }
        i = j;
    }

    ends.push(text.len());
    ends
}

/// Emit pieces of `[start, end)` until the remainder fits, returning where
/// the remainder starts. Cuts go after the last whitespace run inside the
/// limit; a run of unbroken text is cut hard at the limit.
fn force_split(
    out: &mut Vec<Segment>,
    text: &str,
    mut start: usize,
    end: usize,
    max_chars: usize,
) -> usize {
    while spoken_len(&text[start..end]) > max_chars {
        let piece = &text[start..end];
        let lead = piece.len() - piece.trim_start().len();
        let limit = piece[lead..]
            .char_indices()
            .nth(max_chars)
            .map_or(piece.len(), |(i, _)| lead + i);

        let soft = piece[lead..limit]
            .char_indices()
            .rev()
            .find(|(i, c)| *i > 0 && c.is_whitespace())
            .map(|(i, _)| {
                let after = lead + i;
                after + (piece[after..].len() - piece[after..].trim_start().len())
            });

        let cut = start + soft.unwrap_or(limit);
        push(out, text, start, cut);
        start = cut;
    }
    start
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_tiles(text: &str, segments: &[Segment]) {
        let mut pos = 0;
        for seg in segments {
            assert_eq!(seg.span.start, pos, "gap or overlap at {pos}");
            assert!(seg.span.end > seg.span.start);
            assert!(text.is_char_boundary(seg.span.end));
            assert_eq!(seg.text, seg.span.slice(text).trim());
            pos = seg.span.end;
        }
        assert_eq!(pos, text.len());
    }

    #[test]
    fn empty_and_blank_text_yield_nothing() {
        assert!(segment("", 100).is_empty());
        assert!(segment("  \n\t ", 100).is_empty());
    }

    #[test]
    fn short_text_is_one_segment() {
        let text = "One sentence. Two sentences.";
        let segs = segment(text, 100);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].text, text);
        assert_tiles(text, &segs);
    }

    #[test]
    fn greedy_packing_at_sentence_ends() {
        let text = "Alpha beta. Gamma delta. Epsilon zeta.";
        let segs = segment(text, 25);
        let texts: Vec<&str> = segs.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, ["Alpha beta. Gamma delta.", "Epsilon zeta."]);
        assert_tiles(text, &segs);
    }

    #[test]
    fn trailing_whitespace_belongs_to_previous_sentence() {
        let text = "First one.   Second one.";
        let segs = segment(text, 12);
        assert_eq!(segs[0].span, TextSpan::new(0, 13));
        assert_eq!(segs[1].text, "Second one.");
    }

    #[test]
    fn closing_quotes_stay_with_sentence() {
        let text = "He said \"stop.\" Then he left.";
        let segs = segment(text, 16);
        assert_eq!(segs[0].text, "He said \"stop.\"");
        assert_eq!(segs[1].text, "Then he left.");
    }

    #[test]
    fn decimals_do_not_end_sentences() {
        let text = "Pi is 3.14 roughly. Yes.";
        let segs = segment(text, 20);
        assert_eq!(segs[0].text, "Pi is 3.14 roughly.");
    }

    #[test]
    fn long_sentence_splits_at_whitespace() {
        let text = "aaaa bbbb cccc dddd eeee";
        let segs = segment(text, 10);
        let texts: Vec<&str> = segs.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, ["aaaa bbbb", "cccc dddd", "eeee"]);
        assert_tiles(text, &segs);
    }

    #[test]
    fn unbroken_run_is_hard_split_on_char_boundary() {
        let text = "ééééééééééé";
        let segs = segment(text, 4);
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].text.chars().count(), 4);
        assert_tiles(text, &segs);
    }

    #[test]
    fn every_chunk_respects_limit() {
        let text = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. \
                    Sed do eiusmod tempor incididunt ut labore et dolore magna aliqua! \
                    Ut enim ad minim veniam? Quis nostrud exercitation ullamco laboris… \
                    Nisi ut aliquip ex ea commodo consequat.";
        for max in [1, 7, 20, 45, 80, 500] {
            let segs = segment(text, max);
            assert_tiles(text, &segs);
            for seg in &segs {
                assert!(seg.text.chars().count() <= max, "max {max}: {:?}", seg.text);
                assert!(!seg.text.is_empty());
            }
        }
    }

    #[test]
    fn leading_whitespace_is_covered() {
        let text = "\n\n  Opening line. Next.";
        let segs = segment(text, 14);
        assert_tiles(text, &segs);
        assert_eq!(segs[0].text, "Opening line.");
    }

    #[test]
    fn deterministic() {
        let text = "One. Two three. Four five six. Seven.";
        assert_eq!(segment(text, 12), segment(text, 12));
    }
}

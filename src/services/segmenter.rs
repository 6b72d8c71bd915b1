//! Splits an ordered script into bounded synthesis units.
//!
//! A single greedy pass accumulates lines until one of three things forces a
//! new segment: a chapter marker, a speaker that would exceed the per-call
//! speaker ceiling, or a line that would push the payload past the byte
//! ceiling. A lone line is never split, even if it alone exceeds a limit.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;

use crate::services::script::DialogueLine;

/// Bytes added per line for the `": "` between label and text.
pub const LINE_SEPARATOR_OVERHEAD: usize = 2;

static CHAPTER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // A numeral word must end at a boundary so "Part in which" stays prose
        r"(?i)^(chapter|part|section)\s+(\d+|[ivxlcdm]+\b)",
        r"(?i)^(chapter|part|section)\s+\w+:",
        r"^#{1,3}\s+",
        r"^(\*{3,}|-{3,}|={3,})$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

/// Returns the marker title when `text` opens a new chapter.
pub fn is_chapter_marker(text: &str) -> Option<String> {
    let text = text.trim();
    CHAPTER_PATTERNS
        .iter()
        .any(|re| re.is_match(text))
        .then(|| text.to_string())
}

/// Serialized size of a line: label, separator and text, UTF-8.
pub fn line_size(line: &DialogueLine) -> usize {
    line.speaker.len() + line.text.len() + LINE_SEPARATOR_OVERHEAD
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub index: usize,
    pub lines: Vec<DialogueLine>,
    /// Distinct speakers in first-appearance order.
    pub speakers: Vec<String>,
    pub is_chapter_start: bool,
    pub chapter_title: Option<String>,
}

impl Segment {
    /// Sum of line sizes as counted against the byte ceiling.
    pub fn serialized_size(&self) -> usize {
        self.lines.iter().map(line_size).sum()
    }

    /// Text bytes only, without speaker labels.
    pub fn text_size(&self) -> usize {
        self.lines.iter().map(|l| l.text.len()).sum()
    }

    pub fn is_single_speaker(&self) -> bool {
        self.speakers.len() == 1
    }
}

#[derive(Default)]
struct Pending {
    lines: Vec<DialogueLine>,
    speakers: Vec<String>,
    bytes: usize,
    chapter_title: Option<String>,
}

impl Pending {
    fn has_speaker(&self, speaker: &str) -> bool {
        self.speakers.iter().any(|s| s == speaker)
    }

    fn into_segment(self, index: usize) -> Segment {
        Segment {
            index,
            lines: self.lines,
            speakers: self.speakers,
            is_chapter_start: self.chapter_title.is_some(),
            chapter_title: self.chapter_title,
        }
    }
}

/// Partitions `lines` into segments. Pure and total; empty input gives no segments.
///
/// `max_bytes` and `max_speakers` are expected to be positive; callers validate
/// configuration before segmenting (see `SynthesisAdapter::chunk_limits`).
pub fn segment(lines: &[DialogueLine], max_bytes: usize, max_speakers: usize) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = Pending::default();

    for line in lines {
        let size = line_size(line);
        let chapter = is_chapter_marker(&line.text);
        let buffered = !current.lines.is_empty();

        let needs_flush = buffered
            && (chapter.is_some()
                || (!current.has_speaker(&line.speaker) && current.speakers.len() >= max_speakers)
                || current.bytes + size > max_bytes);

        if needs_flush {
            let done = std::mem::take(&mut current);
            segments.push(done.into_segment(segments.len()));
        }

        if current.lines.is_empty() {
            current.chapter_title = chapter;
        }
        if !current.has_speaker(&line.speaker) {
            current.speakers.push(line.speaker.clone());
        }
        current.bytes += size;
        current.lines.push(line.clone());
    }

    if !current.lines.is_empty() {
        segments.push(current.into_segment(segments.len()));
    }

    segments
}

/// Estimated spoken duration in seconds.
pub fn estimate_duration(segments: &[Segment], words_per_minute: u32) -> f64 {
    if words_per_minute == 0 {
        return 0.0;
    }
    let words: usize = segments
        .iter()
        .flat_map(|s| s.lines.iter())
        .map(|l| l.text.split_whitespace().count())
        .sum();
    words as f64 / words_per_minute as f64 * 60.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkStats {
    pub chunks: usize,
    pub lines: usize,
    pub speakers: usize,
    pub speaker_names: Vec<String>,
    pub total_bytes: usize,
    pub estimated_duration_secs: f64,
}

pub fn chunk_stats(segments: &[Segment]) -> ChunkStats {
    let names: BTreeSet<&str> = segments
        .iter()
        .flat_map(|s| s.speakers.iter().map(String::as_str))
        .collect();

    ChunkStats {
        chunks: segments.len(),
        lines: segments.iter().map(|s| s.lines.len()).sum(),
        speakers: names.len(),
        speaker_names: names.into_iter().map(str::to_string).collect(),
        total_bytes: segments.iter().map(Segment::text_size).sum(),
        estimated_duration_secs: estimate_duration(segments, 150),
    }
}

pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.0} seconds", seconds)
    } else if seconds < 3600.0 {
        format!("{:.1} minutes", seconds / 60.0)
    } else {
        format!("{:.1} hours", seconds / 3600.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(speaker: &str, text: &str) -> DialogueLine {
        DialogueLine::new(speaker, text)
    }

    fn assert_invariants(segments: &[Segment], max_bytes: usize, max_speakers: usize) {
        for (i, seg) in segments.iter().enumerate() {
            assert_eq!(seg.index, i, "indices must be contiguous");
            assert!(!seg.lines.is_empty(), "segment {} is empty", i);
            assert!(!seg.speakers.is_empty());
            assert!(seg.speakers.len() <= max_speakers, "segment {} has too many speakers", i);
            if seg.lines.len() > 1 {
                assert!(seg.serialized_size() <= max_bytes, "segment {} is oversized", i);
            }
            let first_is_marker = is_chapter_marker(&seg.lines[0].text).is_some();
            assert_eq!(seg.is_chapter_start, first_is_marker);
        }
    }

    #[test]
    fn test_chapter_markers() {
        for text in [
            "Chapter 1",
            "Chapter IV",
            "CHAPTER 12: The Return",
            "Chapter 12th",
            "Part 3b",
            "part 2",
            "Section 3",
            "Part One: Beginnings",
            "# Introduction",
            "## Chapter One",
            "### Deep",
            "---",
            "***",
            "=====",
            "   Chapter 7   ",
        ] {
            assert!(is_chapter_marker(text).is_some(), "{:?} should be a marker", text);
        }
        for text in [
            "Hello, how are you?",
            "#### Too deep",
            "#hashtag",
            "--",
            "-*-",
            "Chapters are fun",
            "Part in which nothing happens",
            "Section mixed feelings",
        ] {
            assert!(is_chapter_marker(text).is_none(), "{:?} should not be a marker", text);
        }
        assert_eq!(is_chapter_marker("  Chapter 2 "), Some("Chapter 2".to_string()));
    }

    #[test]
    fn test_empty_input() {
        assert!(segment(&[], 100, 2).is_empty());
    }

    #[test]
    fn test_single_segment_when_under_limits() {
        let lines = vec![line("Alice", "Hello"), line("Bob", "Hi")];
        let segments = segment(&lines, 1000, 2);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].lines.len(), 2);
        assert_eq!(segments[0].speakers, vec!["Alice", "Bob"]);
        assert!(!segments[0].is_chapter_start);
    }

    #[test]
    fn test_split_by_size() {
        let lines = vec![
            line("A", &"x".repeat(100)),
            line("A", &"y".repeat(100)),
            line("A", &"z".repeat(100)),
        ];
        // each line weighs 103 bytes, so no two fit under 150
        let segments = segment(&lines, 150, 1);
        assert_eq!(segments.len(), 3);
        assert_invariants(&segments, 150, 1);

        // with room for two lines the third spills over
        let segments = segment(&lines, 210, 1);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].lines.len(), 2);
        assert_eq!(segments[0].serialized_size(), 206);
        assert_invariants(&segments, 210, 1);
    }

    #[test]
    fn test_oversized_single_line_is_kept_whole() {
        let lines = vec![
            line("A", "short"),
            line("A", &"w".repeat(500)),
            line("A", "tail"),
        ];
        let segments = segment(&lines, 100, 2);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[1].lines.len(), 1);
        assert_eq!(segments[1].lines[0].text.len(), 500);
        assert_invariants(&segments, 100, 2);
    }

    #[test]
    fn test_split_by_speakers() {
        let lines = vec![line("Alice", "Hello"), line("Bob", "Hi"), line("Carol", "Hey")];
        let segments = segment(&lines, 10_000, 2);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].speakers, vec!["Alice", "Bob"]);
        assert_eq!(segments[1].speakers, vec!["Carol"]);
    }

    #[test]
    fn test_returning_speaker_does_not_split() {
        let lines = vec![
            line("Alice", "1"),
            line("Bob", "2"),
            line("Alice", "3"),
            line("Bob", "4"),
        ];
        assert_eq!(segment(&lines, 10_000, 2).len(), 1);
    }

    #[test]
    fn test_chapter_starts_new_segment() {
        let lines = vec![
            line("Narrator", "Once upon a time..."),
            line("Narrator", "Chapter 2"),
            line("Narrator", "The story continues..."),
        ];
        let segments = segment(&lines, 10_000, 2);
        assert_eq!(segments.len(), 2);
        assert!(!segments[0].is_chapter_start);
        assert!(segments[1].is_chapter_start);
        assert_eq!(segments[1].chapter_title.as_deref(), Some("Chapter 2"));
        assert_eq!(segments[1].lines.len(), 2);
    }

    #[test]
    fn test_leading_chapter_marker_flags_first_segment() {
        let lines = vec![line("Narrator", "# Prologue"), line("Narrator", "It begins.")];
        let segments = segment(&lines, 10_000, 2);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].is_chapter_start);
    }

    #[test]
    fn test_chapter_flag_comes_from_own_first_line() {
        // The speaker flush happens on Carol's line, which is not a marker,
        // so the second segment must not inherit anything from the first.
        let lines = vec![
            line("Alice", "Chapter 1"),
            line("Bob", "Hello"),
            line("Carol", "Hi"),
        ];
        let segments = segment(&lines, 10_000, 2);
        assert_eq!(segments.len(), 2);
        assert!(segments[0].is_chapter_start);
        assert!(!segments[1].is_chapter_start);
        assert!(segments[1].chapter_title.is_none());
    }

    #[test]
    fn test_invariants_on_mixed_script() {
        let mut lines = Vec::new();
        let speakers = ["Narrator", "Alice", "Bob", "Carol"];
        for i in 0..200 {
            let speaker = speakers[(i * 7 + i / 3) % speakers.len()];
            let text = match i % 37 {
                0 => format!("Chapter {}", i / 37 + 1),
                5 => "***".to_string(),
                _ => "word ".repeat(1 + (i * 13) % 40),
            };
            lines.push(line(speaker, text.trim()));
        }
        for (max_bytes, max_speakers) in [(50, 1), (300, 2), (1000, 3), (3500, 2)] {
            let segments = segment(&lines, max_bytes, max_speakers);
            assert_invariants(&segments, max_bytes, max_speakers);
            let flattened: Vec<_> = segments.iter().flat_map(|s| s.lines.clone()).collect();
            assert_eq!(flattened, lines, "order must be preserved");
        }
    }

    #[test]
    fn test_segmentation_is_deterministic() {
        let lines: Vec<_> = (0..50)
            .map(|i| line(if i % 3 == 0 { "A" } else { "B" }, &"t".repeat(i * 5 + 1)))
            .collect();
        assert_eq!(segment(&lines, 200, 2), segment(&lines, 200, 2));
    }

    #[test]
    fn test_segment_sizes() {
        let seg = Segment {
            index: 0,
            lines: vec![line("Alice", "Hello"), line("Bob", "Hi there")],
            speakers: vec!["Alice".into(), "Bob".into()],
            is_chapter_start: false,
            chapter_title: None,
        };
        assert_eq!(seg.text_size(), 13);
        assert_eq!(seg.serialized_size(), 5 + 5 + 2 + 3 + 8 + 2);
    }

    #[test]
    fn test_multibyte_text_counts_bytes() {
        let l = line("A", "héllo");
        assert_eq!(line_size(&l), 1 + 6 + 2);
    }

    #[test]
    fn test_estimate_duration_and_stats() {
        let lines = vec![line("Alice", &"word ".repeat(150))];
        let segments = segment(&lines, 10_000, 2);
        let secs = estimate_duration(&segments, 150);
        assert!((secs - 60.0).abs() < 1e-9);

        let lines = vec![
            line("Alice", "Hello"),
            line("Bob", "Hi there"),
            line("Alice", "How are you?"),
        ];
        let stats = chunk_stats(&segment(&lines, 10_000, 2));
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.lines, 3);
        assert_eq!(stats.speakers, 2);
        assert_eq!(stats.speaker_names, vec!["Alice", "Bob"]);
        assert_eq!(stats.total_bytes, 25);

        assert_eq!(chunk_stats(&[]).chunks, 0);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42.0), "42 seconds");
        assert_eq!(format_duration(90.0), "1.5 minutes");
        assert_eq!(format_duration(5400.0), "1.5 hours");
    }
}

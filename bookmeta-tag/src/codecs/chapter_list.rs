//! Chapter list text format
//!
//! One chapter per line, `HH:MM:SS.mmm <name>`. The per-line format cannot
//! carry the end of the last chapter, so the builder adds a
//! `# total-length HH:MM:SS.mmm` comment whenever that chapter has a length.
//!
//! ```text
//! # total-length 00:10:00.000
//! 00:00:00.000 Intro
//! 00:05:00.000 Chapter 1
//! ```

use crate::record::Chapter;
use bookmeta_common::timecode::{format_timecode, parse_timecode};
use std::time::Duration;
use tracing::debug;

/// Comment keyword carrying the end of the last chapter
const TOTAL_LENGTH_MARKER: &str = "total-length";

/// Conventional companion file suffix (`<basename>.chapters.txt`)
pub const COMPANION_SUFFIX: &str = "chapters.txt";

/// Render chapters as a chapter list document
pub fn build(chapters: &[Chapter]) -> String {
    let mut lines = Vec::with_capacity(chapters.len() + 1);

    if let Some(last) = chapters.last() {
        if !last.length().is_zero() {
            lines.push(format!("# {} {}", TOTAL_LENGTH_MARKER, format_timecode(last.end())));
        }
    }

    for chapter in chapters {
        lines.push(format!("{} {}", format_timecode(chapter.start()), chapter.name));
    }

    let mut document = lines.join("\n");
    if !document.is_empty() {
        document.push('\n');
    }
    document
}

/// Parse a chapter list document
///
/// Lines whose first token is not a timecode are skipped. Each chapter runs
/// until the next one starts; the last one is extended to the total-length
/// comment only when that lies beyond its start.
pub fn parse(text: &str) -> Vec<Chapter> {
    let mut chapters: Vec<Chapter> = Vec::new();
    let mut total_length: Option<Duration> = None;

    for (line_no, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(comment) = line.strip_prefix('#') {
            if let Some(value) = comment.trim().strip_prefix(TOTAL_LENGTH_MARKER) {
                match parse_timecode(value) {
                    Some(total) => total_length = Some(total),
                    None => debug!(line = line_no + 1, "Ignoring malformed total-length comment"),
                }
            }
            continue;
        }

        let (token, name) = match line.split_once(char::is_whitespace) {
            Some((token, name)) => (token, name.trim()),
            None => (line, ""),
        };

        match parse_timecode(token) {
            Some(start) => chapters.push(Chapter::new(start, Duration::ZERO, name)),
            None => debug!(line = line_no + 1, content = line, "Skipping chapter line without timecode"),
        }
    }

    for i in 1..chapters.len() {
        let next_start = chapters[i].start();
        let current = &mut chapters[i - 1];
        current.set_end(next_start);
    }

    if let (Some(last), Some(total)) = (chapters.last_mut(), total_length) {
        if total > last.end() {
            last.set_end(total);
        }
    }

    chapters
}

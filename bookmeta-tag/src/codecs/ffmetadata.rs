//! ffmpeg metadata dump format (`;FFMETADATA1`)
//!
//! Global `key=value` lines followed by `[CHAPTER]` sections. The characters
//! `=`, `;`, `#`, `\` and newline are escaped with a leading backslash.
//! ffmpeg reads this document as an import map (`-i ffmetadata.txt -map_metadata 1`).

use crate::record::{Chapter, FieldValue, MetadataRecord};
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

/// Document header
pub const HEADER: &str = ";FFMETADATA1";

/// ffmetadata key → record field, in output order
///
/// `track` and `disc` are handled separately because they combine two fields (`n/m`).
const KEY_TABLE: &[(&str, &str)] = &[
    ("title", "title"),
    ("sort_name", "sort_title"),
    ("album", "album"),
    ("sort_album", "sort_album"),
    ("artist", "artist"),
    ("sort_artist", "sort_artist"),
    ("album_artist", "album_artist"),
    ("sort_album_artist", "sort_album_artist"),
    ("composer", "writer"),
    ("genre", "genre"),
    ("publisher", "publisher"),
    ("show", "series"),
    ("episode_id", "series_part"),
    ("date", "year"),
    ("purchase_date", "purchase_date"),
    ("description", "description"),
    ("synopsis", "long_description"),
    ("comment", "comment"),
    ("copyright", "copyright"),
    ("encoded_by", "encoded_by"),
    ("encoder", "encoder"),
    ("lyrics", "lyrics"),
    ("media_type", "media_type"),
];

/// Escape a key or value
///
/// Every special character gets its own backslash, one character at a time.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '=' | ';' | '#' | '\\' | '\n') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Reverse of `escape`; a trailing lone backslash is dropped
pub fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Milliseconds rounded to the nearest whole millisecond
fn rounded_millis(duration: Duration) -> u128 {
    (duration.as_micros() + 500) / 1000
}

fn number_pair(number: Option<u32>, total: Option<u32>) -> Option<String> {
    match (number, total) {
        (Some(n), Some(t)) => Some(format!("{}/{}", n, t)),
        (Some(n), None) => Some(n.to_string()),
        _ => None,
    }
}

/// Render a record as an ffmetadata document
pub fn build(record: &MetadataRecord) -> String {
    let mut lines = vec![HEADER.to_string()];

    let mut push = |key: &str, value: &str| {
        if !value.trim().is_empty() {
            lines.push(format!("{}={}", escape(key), escape(value)));
        }
    };

    for (key, field) in KEY_TABLE {
        if let Some(value) = record.get(field).and_then(FieldValue::into_text) {
            push(key, &value);
        }
    }
    if let Some(track) = number_pair(record.track, record.tracks) {
        push("track", &track);
    }
    if let Some(disc) = number_pair(record.disk, record.disks) {
        push("disc", &disc);
    }

    let reserved: HashSet<&str> = KEY_TABLE
        .iter()
        .map(|(k, _)| *k)
        .chain(["track", "disc"])
        .collect();
    for (key, value) in &record.extra_properties {
        if !reserved.contains(key.as_str()) {
            push(key, value);
        }
    }

    for chapter in &record.chapters {
        lines.push("[CHAPTER]".to_string());
        lines.push("TIMEBASE=1/1000".to_string());
        lines.push(format!("START={}", rounded_millis(chapter.start())));
        lines.push(format!("END={}", rounded_millis(chapter.end())));
        lines.push(format!("title={}", escape(&chapter.name)));
    }

    let mut document = lines.join("\n");
    document.push('\n');
    document
}

// ============================================================================
// Parsing
// ============================================================================

/// Chapter section being collected
struct ChapterScan {
    timebase: (u64, u64),
    start: Option<u64>,
    end: Option<u64>,
    title: String,
}

impl ChapterScan {
    fn new() -> Self {
        Self {
            timebase: (1, 1000),
            start: None,
            end: None,
            title: String::new(),
        }
    }

    /// `None` when the tick count does not fit a duration
    fn to_duration(&self, ticks: u64) -> Option<Duration> {
        let (num, den) = self.timebase;
        let nanos = (ticks as u128)
            .checked_mul(num as u128)?
            .checked_mul(1_000_000_000)?
            / den.max(1) as u128;
        u64::try_from(nanos).ok().map(Duration::from_nanos)
    }

    fn finish(self) -> Option<Chapter> {
        let Some(start) = self.to_duration(self.start?) else {
            debug!(title = %self.title, "Dropping chapter with out-of-range START");
            return None;
        };
        let mut chapter = Chapter::new(start, Duration::ZERO, self.title.clone());
        if let Some(end) = self.end {
            let Some(end) = self.to_duration(end) else {
                debug!(title = %self.title, "Dropping chapter with out-of-range END");
                return None;
            };
            chapter.set_end(end);
        }
        Some(chapter)
    }
}

enum Section {
    Global,
    Chapter(ChapterScan),
    Other,
}

/// Split into logical lines; an escaped newline continues the line
fn logical_lines(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '\n' => lines.push(std::mem::take(&mut current)),
            '\r' => {}
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Position of the first `=` not preceded by an escaping backslash
fn split_unescaped(line: &str) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            '=' if !escaped => return Some((&line[..i], &line[i + 1..])),
            _ => escaped = false,
        }
    }
    None
}

fn parse_timebase(value: &str) -> Option<(u64, u64)> {
    let (num, den) = value.trim().split_once('/')?;
    let num = num.trim().parse().ok()?;
    let den: u64 = den.trim().parse().ok()?;
    (den > 0).then_some((num, den))
}

fn parse_number_pair(value: &str) -> (Option<u32>, Option<u32>) {
    let mut parts = value.splitn(2, '/');
    let number = parts.next().and_then(|n| n.trim().parse().ok());
    let total = parts.next().and_then(|t| t.trim().parse().ok());
    (number, total)
}

/// Parse an ffmetadata document
///
/// Unknown global keys become extra properties, `[STREAM]` sections are
/// ignored and malformed lines are skipped.
pub fn parse(text: &str) -> MetadataRecord {
    let mut record = MetadataRecord::default();
    let mut section = Section::Global;

    for line in logical_lines(text) {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
            continue;
        }

        if trimmed.starts_with('[') {
            if let Section::Chapter(scan) = std::mem::replace(&mut section, Section::Other) {
                record.chapters.extend(scan.finish());
            }
            if trimmed.trim_end().eq_ignore_ascii_case("[CHAPTER]") {
                section = Section::Chapter(ChapterScan::new());
            }
            continue;
        }

        let Some((raw_key, raw_value)) = split_unescaped(&line) else {
            debug!(line = %line, "Skipping ffmetadata line without '='");
            continue;
        };
        let key = unescape(raw_key.trim());
        let value = unescape(raw_value);

        match &mut section {
            Section::Global => apply_global(&mut record, &key, value),
            Section::Chapter(scan) => match key.to_ascii_uppercase().as_str() {
                "TIMEBASE" => match parse_timebase(&value) {
                    Some(tb) => scan.timebase = tb,
                    None => debug!(value = %value, "Ignoring malformed TIMEBASE"),
                },
                "START" => scan.start = value.trim().parse().ok(),
                "END" => scan.end = value.trim().parse().ok(),
                "TITLE" => scan.title = value,
                _ => {}
            },
            Section::Other => {}
        }
    }

    if let Section::Chapter(scan) = section {
        record.chapters.extend(scan.finish());
    }

    record
}

fn apply_global(record: &mut MetadataRecord, key: &str, value: String) {
    let lower = key.to_ascii_lowercase();
    match lower.as_str() {
        "track" => {
            let (n, t) = parse_number_pair(&value);
            record.track = n;
            record.tracks = t.or(record.tracks);
        }
        "disc" => {
            let (n, t) = parse_number_pair(&value);
            record.disk = n;
            record.disks = t.or(record.disks);
        }
        _ => match KEY_TABLE.iter().find(|(k, _)| *k == lower) {
            Some((_, field)) => {
                record.set(field, Some(FieldValue::Text(value)));
            }
            None => {
                record.extra_properties.insert(key.to_string(), value);
            }
        },
    }
}

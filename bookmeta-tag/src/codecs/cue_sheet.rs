//! Cue sheet reader and writer
//!
//! Supports the subset used for audiobooks: top-level and per-track
//! `PERFORMER`/`TITLE`/`SONGWRITER` lines, `REM` properties (`GENRE`, `DATE`,
//! `COMMENT`, ...), `TRACK nn AUDIO` headers and `INDEX 00`/`INDEX 01` entries
//! in `mm:ss:ff` notation (75 frames per second).
//!
//! # Pre-gaps
//! `INDEX 00` marks where the previous track's audio ends. A pre-gap longer
//! than `MAX_PREGAP` is treated as an authoring artifact: the previous chapter
//! is extended to the new start instead of ending at `INDEX 00`.

use crate::record::{Chapter, FieldValue, MetadataRecord};
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::time::Duration;
use tracing::debug;

/// Longest pre-gap kept as a real silence between chapters
pub const MAX_PREGAP: Duration = Duration::from_secs(4);

/// Cue frames per second
const FRAMES_PER_SECOND: u64 = 75;

/// Property keyword → record field, matched case-insensitively with an optional `REM ` prefix
const PROPERTY_PREFIXES: &[(&str, &str)] = &[
    ("PERFORMER", "artist"),
    ("TITLE", "title"),
    ("SONGWRITER", "writer"),
    ("COMPOSER", "writer"),
    ("GENRE", "genre"),
    ("DATE", "year"),
    ("COMMENT", "comment"),
    ("COPYRIGHT", "copyright"),
];

/// Parse a cue sheet into a record with chapters
pub fn parse(text: &str) -> MetadataRecord {
    let mut record = MetadataRecord::default();
    let mut chapters: BTreeMap<u32, Chapter> = BTreeMap::new();
    let mut lines = text.lines().map(str::trim).peekable();

    while let Some(line) = lines.next() {
        if let Some(number) = track_number(line) {
            let track = scan_track(number, &mut lines);
            close_track(track, &mut chapters);
            continue;
        }

        if let Some((field, value)) = parse_property(line) {
            record.set(field, Some(FieldValue::Text(value)));
        }
    }

    record.chapters = chapters.into_values().collect();
    record
}

/// Properties collected between two track headers
#[derive(Debug, Default)]
struct TrackScan {
    number: u32,
    properties: MetadataRecord,
    pregap: Option<Duration>,
    start: Option<Duration>,
}

/// Consume lines up to (not including) the next track header
fn scan_track<'a, I>(number: u32, lines: &mut Peekable<I>) -> TrackScan
where
    I: Iterator<Item = &'a str>,
{
    let mut track = TrackScan {
        number,
        ..Default::default()
    };

    while let Some(line) = lines.peek() {
        if track_number(line).is_some() {
            break;
        }
        let line = lines.next().unwrap_or_default();

        if let Some((index, time)) = parse_index(line) {
            match index {
                0 => track.pregap = Some(time),
                1 => track.start = Some(time),
                _ => {}
            }
        } else if let Some((field, value)) = parse_property(line) {
            track.properties.set(field, Some(FieldValue::Text(value)));
        }
    }

    track
}

/// Turn a finished track into a chapter and settle the previous chapter's end
fn close_track(track: TrackScan, chapters: &mut BTreeMap<u32, Chapter>) {
    let Some(start) = track.start else {
        debug!(track = track.number, "Skipping cue track without INDEX 01");
        return;
    };

    if let Some(previous) = track
        .number
        .checked_sub(1)
        .and_then(|n| chapters.get_mut(&n))
    {
        let end = match track.pregap {
            Some(pregap)
                if pregap >= previous.start()
                    && pregap <= start
                    && start - pregap <= MAX_PREGAP =>
            {
                pregap
            }
            _ => start,
        };
        previous.set_end(end);
    }

    let name = track
        .properties
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| format!("Track {:02}", track.number));

    let mut chapter = Chapter::new(start, Duration::ZERO, name);
    if !track.properties.is_empty() {
        chapter.tag = Some(Box::new(track.properties));
    }
    chapters.insert(track.number, chapter);
}

/// `TRACK 01 AUDIO` → 1
fn track_number(line: &str) -> Option<u32> {
    let mut tokens = line.split_whitespace();
    let keyword = tokens.next()?;
    if !keyword.eq_ignore_ascii_case("TRACK") {
        return None;
    }
    tokens.next()?.parse().ok()
}

/// `INDEX 01 05:30:12` → (1, 5m30s + 12 frames)
fn parse_index(line: &str) -> Option<(u32, Duration)> {
    let mut tokens = line.split_whitespace();
    if !tokens.next()?.eq_ignore_ascii_case("INDEX") {
        return None;
    }
    let index = tokens.next()?.parse().ok()?;
    let time = parse_cue_time(tokens.next()?)?;
    Some((index, time))
}

/// Match a property line against the prefix table
fn parse_property(line: &str) -> Option<(&'static str, String)> {
    let mut rest = line.trim();
    if starts_with_keyword(rest, "REM") {
        rest = rest[3..].trim_start();
    }

    PROPERTY_PREFIXES.iter().find_map(|(keyword, field)| {
        if starts_with_keyword(rest, keyword) {
            let value = unquote(rest[keyword.len()..].trim());
            Some((*field, value.to_string()))
        } else {
            None
        }
    })
}

/// Case-insensitive keyword match followed by whitespace or end of line
fn starts_with_keyword(line: &str, keyword: &str) -> bool {
    line.len() >= keyword.len()
        && line.is_char_boundary(keyword.len())
        && line[..keyword.len()].eq_ignore_ascii_case(keyword)
        && line[keyword.len()..]
            .chars()
            .next()
            .map_or(true, char::is_whitespace)
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// `mm:ss:ff` → duration (frames rounded to milliseconds)
pub fn parse_cue_time(value: &str) -> Option<Duration> {
    let mut parts = value.split(':');
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: u64 = parts.next()?.parse().ok()?;
    let frames: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || seconds >= 60 || frames >= FRAMES_PER_SECOND {
        return None;
    }
    let millis = minutes
        .checked_mul(60_000)?
        .checked_add(seconds * 1000 + (frames * 1000 + FRAMES_PER_SECOND / 2) / FRAMES_PER_SECOND)?;
    Some(Duration::from_millis(millis))
}

/// Duration → `mm:ss:ff`
pub fn format_cue_time(duration: Duration) -> String {
    let millis = duration.as_millis() as u64;
    let minutes = millis / 60_000;
    let seconds = (millis % 60_000) / 1000;
    let frames = (millis % 1000) * FRAMES_PER_SECOND / 1000;
    format!("{:02}:{:02}:{:02}", minutes, seconds, frames)
}

/// Render a cue sheet for `audio_file` from the record's chapters
pub fn build(record: &MetadataRecord, audio_file: &str) -> String {
    let mut out = String::new();
    if let Some(genre) = &record.genre {
        out.push_str(&format!("REM GENRE {}\n", quote(genre)));
    }
    if let Some(year) = &record.year {
        out.push_str(&format!("REM DATE {}\n", year));
    }
    if let Some(artist) = &record.artist {
        out.push_str(&format!("PERFORMER {}\n", quote(artist)));
    }
    if let Some(title) = &record.title {
        out.push_str(&format!("TITLE {}\n", quote(title)));
    }
    out.push_str(&format!("FILE {} {}\n", quote(audio_file), file_type(audio_file)));

    for (i, chapter) in record.chapters.iter().enumerate() {
        out.push_str(&format!("  TRACK {:02} AUDIO\n", i + 1));
        out.push_str(&format!("    TITLE {}\n", quote(&chapter.name)));
        if let Some(performer) = chapter.tag.as_ref().and_then(|t| t.artist.as_ref()) {
            out.push_str(&format!("    PERFORMER {}\n", quote(performer)));
        }
        out.push_str(&format!("    INDEX 01 {}\n", format_cue_time(chapter.start())));
    }
    out
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "'"))
}

fn file_type(audio_file: &str) -> &'static str {
    if audio_file.to_ascii_lowercase().ends_with(".mp3") {
        "MP3"
    } else {
        "WAVE"
    }
}

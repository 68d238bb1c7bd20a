//! Canonical metadata record
//!
//! `MetadataRecord` holds every tag field the backends understand, free-form
//! extra properties, removal markers and the chapter list. Scalar fields are
//! enumerated through a static descriptor table (`fields()`), which is the
//! single source of truth for generic merging, removal and display.
//!
//! # Merge strategies
//! - `merge_missing`: fill empty fields from another record (transient members untouched)
//! - `merge_overwrite`: adopt every non-empty differing value from another record

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Cover and Chapter
// ============================================================================

/// Cover art reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cover {
    /// Image file on disk
    File(PathBuf),
    /// Cover lives inside the audio stream, there is no external file
    Embedded,
}

impl fmt::Display for Cover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cover::File(path) => write!(f, "{}", path.display()),
            Cover::Embedded => write!(f, "<embedded>"),
        }
    }
}

/// Chapter marker
///
/// The end is always derived from `start + length`. Moving the start keeps
/// the length; setting the end recomputes the length.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Chapter {
    start: Duration,
    length: Duration,
    /// Display name
    pub name: String,
    /// Per-chapter properties (e.g. cue sheet track performer)
    pub tag: Option<Box<MetadataRecord>>,
}

impl Chapter {
    pub fn new(start: Duration, length: Duration, name: impl Into<String>) -> Self {
        Self {
            start,
            length,
            name: name.into(),
            tag: None,
        }
    }

    pub fn start(&self) -> Duration {
        self.start
    }

    pub fn length(&self) -> Duration {
        self.length
    }

    pub fn end(&self) -> Duration {
        self.start + self.length
    }

    pub fn set_start(&mut self, start: Duration) {
        self.start = start;
    }

    pub fn set_length(&mut self, length: Duration) {
        self.length = length;
    }

    /// Set the end; an end before the start yields a zero length
    pub fn set_end(&mut self, end: Duration) {
        self.length = end.saturating_sub(self.start);
    }
}

// ============================================================================
// Field values and descriptors
// ============================================================================

/// Generic view of a field value used by merges and audit output
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(u32),
    Cover(Cover),
    Chapters(Vec<Chapter>),
    Names(BTreeSet<String>),
}

impl FieldValue {
    /// Whitespace-only text, empty lists and empty name sets count as empty
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Number(_) | FieldValue::Cover(_) => false,
            FieldValue::Chapters(c) => c.is_empty(),
            FieldValue::Names(n) => n.is_empty(),
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn into_number(self) -> Option<u32> {
        match self {
            FieldValue::Number(n) => Some(n),
            FieldValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn into_cover(self) -> Option<Cover> {
        match self {
            FieldValue::Cover(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Cover(c) => write!(f, "{}", c),
            FieldValue::Chapters(c) => write!(f, "{} chapters", c.len()),
            FieldValue::Names(n) => {
                write!(f, "{}", n.iter().cloned().collect::<Vec<_>>().join(", "))
            }
        }
    }
}

fn is_empty_value(value: &Option<FieldValue>) -> bool {
    value.as_ref().map_or(true, FieldValue::is_empty)
}

/// Static description of one scalar field
pub struct FieldDescriptor {
    /// Field name (snake_case, also used as removal marker)
    pub name: &'static str,
    /// Included in human-readable enumerations
    pub displayable: bool,
    pub get: fn(&MetadataRecord) -> Option<FieldValue>,
    pub set: fn(&mut MetadataRecord, Option<FieldValue>),
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("displayable", &self.displayable)
            .finish()
    }
}

macro_rules! text_field {
    ($field:ident, $displayable:expr) => {
        FieldDescriptor {
            name: stringify!($field),
            displayable: $displayable,
            get: |r| r.$field.clone().map(FieldValue::Text),
            set: |r, v| r.$field = v.and_then(FieldValue::into_text),
        }
    };
}

macro_rules! number_field {
    ($field:ident) => {
        FieldDescriptor {
            name: stringify!($field),
            displayable: true,
            get: |r| r.$field.map(FieldValue::Number),
            set: |r, v| r.$field = v.and_then(FieldValue::into_number),
        }
    };
}

/// Every scalar field of `MetadataRecord`
///
/// Chapters, extra properties and removal markers are transient for merging
/// and are deliberately absent. `series` and `series_part` take part in merges
/// but are hidden from display enumerations.
static FIELDS: &[FieldDescriptor] = &[
    text_field!(title, true),
    text_field!(sort_title, true),
    text_field!(album, true),
    text_field!(sort_album, true),
    text_field!(artist, true),
    text_field!(sort_artist, true),
    text_field!(album_artist, true),
    text_field!(sort_album_artist, true),
    text_field!(writer, true),
    text_field!(genre, true),
    text_field!(publisher, true),
    text_field!(series, false),
    text_field!(series_part, false),
    text_field!(description, true),
    text_field!(long_description, true),
    text_field!(comment, true),
    text_field!(copyright, true),
    text_field!(encoded_by, true),
    text_field!(encoder, true),
    text_field!(lyrics, true),
    text_field!(year, true),
    text_field!(purchase_date, true),
    number_field!(track),
    number_field!(tracks),
    number_field!(disk),
    number_field!(disks),
    number_field!(media_type),
    FieldDescriptor {
        name: "cover",
        displayable: true,
        get: |r| r.cover.clone().map(FieldValue::Cover),
        set: |r, v| r.cover = v.and_then(FieldValue::into_cover),
    },
];

/// Scalar field table
pub fn fields() -> &'static [FieldDescriptor] {
    FIELDS
}

/// Look up a scalar field by name
pub fn field_descriptor(name: &str) -> Option<&'static FieldDescriptor> {
    FIELDS.iter().find(|f| f.name == name)
}

// ============================================================================
// Change tracking
// ============================================================================

/// Before/after pair of a changed field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub before: Option<FieldValue>,
    pub after: Option<FieldValue>,
}

/// Changed fields keyed by name, for audit logging
pub type FieldChanges = BTreeMap<String, FieldChange>;

// ============================================================================
// MetadataRecord
// ============================================================================

/// Canonical metadata of one audio file
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetadataRecord {
    pub title: Option<String>,
    pub sort_title: Option<String>,
    pub album: Option<String>,
    pub sort_album: Option<String>,
    pub artist: Option<String>,
    pub sort_artist: Option<String>,
    pub album_artist: Option<String>,
    pub sort_album_artist: Option<String>,
    pub writer: Option<String>,
    pub genre: Option<String>,
    pub publisher: Option<String>,
    pub series: Option<String>,
    pub series_part: Option<String>,
    pub description: Option<String>,
    pub long_description: Option<String>,
    pub comment: Option<String>,
    pub copyright: Option<String>,
    pub encoded_by: Option<String>,
    pub encoder: Option<String>,
    pub lyrics: Option<String>,
    pub year: Option<String>,
    pub purchase_date: Option<String>,
    pub track: Option<u32>,
    pub tracks: Option<u32>,
    pub disk: Option<u32>,
    pub disks: Option<u32>,
    /// iTunes media kind (2 = audiobook)
    pub media_type: Option<u32>,
    pub cover: Option<Cover>,

    /// Free-form properties (catalog ids etc.)
    pub extra_properties: BTreeMap<String, String>,
    /// Field names to strip from the file on write
    pub remove_properties: BTreeSet<String>,
    /// Chapters ordered by start
    pub chapters: Vec<Chapter>,
}

impl MetadataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generic field read
    pub fn get(&self, name: &str) -> Option<FieldValue> {
        field_descriptor(name).and_then(|f| (f.get)(self))
    }

    /// Generic field write; returns false for unknown names
    pub fn set(&mut self, name: &str, value: Option<FieldValue>) -> bool {
        match field_descriptor(name) {
            Some(f) => {
                (f.set)(self, value);
                true
            }
            None => false,
        }
    }

    /// True only if the cover is an actual image file
    pub fn has_cover_file(&self) -> bool {
        matches!(self.cover, Some(Cover::File(_)))
    }

    /// True when no field, property or chapter carries data
    pub fn is_empty(&self) -> bool {
        FIELDS.iter().all(|f| is_empty_value(&(f.get)(self)))
            && self.extra_properties.is_empty()
            && self.chapters.is_empty()
    }

    /// Fill empty fields from `other`
    ///
    /// Only scalar fields are considered; chapters, extra properties and
    /// removal markers are left alone.
    pub fn merge_missing(&mut self, other: &MetadataRecord) -> FieldChanges {
        let mut changes = FieldChanges::new();
        for field in FIELDS {
            let before = (field.get)(self);
            let theirs = (field.get)(other);
            if is_empty_value(&before) && !is_empty_value(&theirs) && before != theirs {
                (field.set)(self, theirs.clone());
                changes.insert(
                    field.name.to_string(),
                    FieldChange {
                        before,
                        after: theirs,
                    },
                );
            }
        }
        changes
    }

    /// Adopt every non-empty value of `other` that differs from ours
    ///
    /// Chapters are replaced as a whole, extra properties are adopted per key
    /// and removal markers are unioned. Empty values of `other` never win.
    pub fn merge_overwrite(&mut self, other: &MetadataRecord) -> FieldChanges {
        let mut changes = FieldChanges::new();
        for field in FIELDS {
            let before = (field.get)(self);
            let theirs = (field.get)(other);
            if !is_empty_value(&theirs) && before != theirs {
                (field.set)(self, theirs.clone());
                changes.insert(
                    field.name.to_string(),
                    FieldChange {
                        before,
                        after: theirs,
                    },
                );
            }
        }

        if !other.chapters.is_empty() && self.chapters != other.chapters {
            let before = FieldValue::Chapters(std::mem::take(&mut self.chapters));
            self.chapters = other.chapters.clone();
            changes.insert(
                "chapters".to_string(),
                FieldChange {
                    before: Some(before).filter(|v| !v.is_empty()),
                    after: Some(FieldValue::Chapters(self.chapters.clone())),
                },
            );
        }

        for (key, value) in &other.extra_properties {
            if value.trim().is_empty() {
                continue;
            }
            let before = self.extra_properties.get(key).cloned();
            if before.as_deref() != Some(value.as_str()) {
                self.extra_properties.insert(key.clone(), value.clone());
                changes.insert(
                    format!("extra_properties.{}", key),
                    FieldChange {
                        before: before.map(FieldValue::Text),
                        after: Some(FieldValue::Text(value.clone())),
                    },
                );
            }
        }

        if !other.remove_properties.is_subset(&self.remove_properties) {
            let before = self.remove_properties.clone();
            self.remove_properties.extend(other.remove_properties.iter().cloned());
            changes.insert(
                "remove_properties".to_string(),
                FieldChange {
                    before: Some(FieldValue::Names(before)).filter(|v| !v.is_empty()),
                    after: Some(FieldValue::Names(self.remove_properties.clone())),
                },
            );
        }

        changes
    }

    /// Clear every field named in `remove_properties`
    ///
    /// The marker set itself is kept so writers can strip the tags from the file.
    pub fn apply_removals(&mut self) {
        let names: Vec<String> = self.remove_properties.iter().cloned().collect();
        for name in names {
            if name == "chapters" {
                self.chapters.clear();
            } else if !self.set(&name, None) {
                self.extra_properties.remove(&name);
            }
        }
    }

    /// Populated displayable fields in table order
    pub fn display_fields(&self) -> Vec<(&'static str, FieldValue)> {
        FIELDS
            .iter()
            .filter(|f| f.displayable)
            .filter_map(|f| (f.get)(self).filter(|v| !v.is_empty()).map(|v| (f.name, v)))
            .collect()
    }

    /// `"<series> <part>"`, or just the series when there is no part
    pub fn series_label(&self) -> Option<String> {
        let series = self.series.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        match self.series_part.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(part) => Some(format!("{} {}", series, part)),
            None => Some(series.to_string()),
        }
    }

    /// Rewrite sort names as `<series> <part> - <name>` so players that only
    /// sort by title keep series order
    pub fn apply_series_sort_names(&mut self) {
        let Some(label) = self.series_label() else {
            return;
        };
        if let Some(title) = self.title.as_deref().filter(|t| !t.trim().is_empty()) {
            self.sort_title = Some(format!("{} - {}", label, title));
        }
        if let Some(album) = self
            .album
            .as_deref()
            .or(self.title.as_deref())
            .filter(|a| !a.trim().is_empty())
        {
            self.sort_album = Some(format!("{} - {}", label, album));
        }
    }

    /// Total length implied by the chapter list
    pub fn chapters_end(&self) -> Option<Duration> {
        self.chapters.last().map(Chapter::end)
    }
}

impl fmt::Display for MetadataRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.display_fields() {
            writeln!(f, "{:<18}: {}", name, value)?;
        }
        if let Some(series) = self.series_label() {
            writeln!(f, "{:<18}: {}", "series", series)?;
        }
        for (key, value) in &self.extra_properties {
            writeln!(f, "{:<18}: {}", key, value)?;
        }
        if !self.chapters.is_empty() {
            writeln!(f, "{:<18}: {}", "chapters", self.chapters.len())?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetadataRecord {
        MetadataRecord {
            title: Some("The Way of Kings".to_string()),
            artist: Some("Brandon Sanderson".to_string()),
            series: Some("Stormlight Archive".to_string()),
            series_part: Some("1".to_string()),
            track: Some(1),
            cover: Some(Cover::File(PathBuf::from("cover.jpg"))),
            chapters: vec![Chapter::new(Duration::ZERO, Duration::from_secs(60), "Prelude")],
            ..Default::default()
        }
    }

    #[test]
    fn test_chapter_end_is_derived() {
        let mut chapter = Chapter::new(Duration::from_secs(10), Duration::from_secs(5), "x");
        assert_eq!(chapter.end(), Duration::from_secs(15));

        chapter.set_start(Duration::from_secs(20));
        assert_eq!(chapter.end(), Duration::from_secs(25), "Moving start keeps length");

        chapter.set_end(Duration::from_secs(30));
        assert_eq!(chapter.length(), Duration::from_secs(10));

        chapter.set_end(Duration::from_secs(1));
        assert_eq!(chapter.length(), Duration::ZERO, "End before start clamps length");
    }

    #[test]
    fn test_field_table_names_are_unique() {
        let mut names: Vec<_> = fields().iter().map(|f| f.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), fields().len());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let a = sample();
        let mut missing = a.clone();
        let mut overwrite = a.clone();
        assert!(missing.merge_missing(&a).is_empty());
        assert!(overwrite.merge_overwrite(&a).is_empty());
        assert_eq!(missing, a);
        assert_eq!(overwrite, a);
    }

    #[test]
    fn test_merge_missing_keeps_existing_values() {
        let mut record = sample();
        let other = MetadataRecord {
            title: Some("Other".to_string()),
            album: Some("Stormlight 1".to_string()),
            genre: Some("   ".to_string()),
            chapters: vec![],
            ..Default::default()
        };

        let changes = record.merge_missing(&other);

        assert_eq!(record.title.as_deref(), Some("The Way of Kings"));
        assert_eq!(record.album.as_deref(), Some("Stormlight 1"));
        assert_eq!(record.genre, None, "Blank values are never adopted");
        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes["album"].after,
            Some(FieldValue::Text("Stormlight 1".to_string()))
        );
    }

    #[test]
    fn test_merge_missing_ignores_transient_members() {
        let mut record = MetadataRecord::default();
        let mut other = sample();
        other.extra_properties.insert("asin".to_string(), "B003P2WO5E".to_string());

        record.merge_missing(&other);

        assert!(record.chapters.is_empty());
        assert!(record.extra_properties.is_empty());
        assert_eq!(record.series.as_deref(), Some("Stormlight Archive"), "Series merges");
    }

    #[test]
    fn test_merge_missing_fills_whitespace_field() {
        let mut record = MetadataRecord {
            title: Some("  ".to_string()),
            ..Default::default()
        };
        let other = MetadataRecord {
            title: Some("Real".to_string()),
            ..Default::default()
        };
        record.merge_missing(&other);
        assert_eq!(record.title.as_deref(), Some("Real"));
    }

    #[test]
    fn test_merge_overwrite_never_adopts_empty() {
        let mut record = sample();
        let other = MetadataRecord {
            title: Some(String::new()),
            artist: Some("Michael Kramer".to_string()),
            ..Default::default()
        };

        let changes = record.merge_overwrite(&other);

        assert_eq!(record.title.as_deref(), Some("The Way of Kings"));
        assert_eq!(record.artist.as_deref(), Some("Michael Kramer"));
        assert_eq!(record.chapters.len(), 1, "Empty chapter list never replaces");
        assert_eq!(changes.keys().collect::<Vec<_>>(), vec!["artist"]);
    }

    #[test]
    fn test_merge_overwrite_transient_members() {
        let mut record = sample();
        let mut other = MetadataRecord::default();
        other.chapters = vec![
            Chapter::new(Duration::ZERO, Duration::from_secs(5), "A"),
            Chapter::new(Duration::from_secs(5), Duration::from_secs(5), "B"),
        ];
        other.extra_properties.insert("audible_id".to_string(), "123".to_string());
        other.remove_properties.insert("comment".to_string());

        let changes = record.merge_overwrite(&other);

        assert_eq!(record.chapters.len(), 2);
        assert_eq!(record.extra_properties["audible_id"], "123");
        assert!(record.remove_properties.contains("comment"));
        assert!(changes.contains_key("chapters"));
        assert!(changes.contains_key("extra_properties.audible_id"));
        assert!(changes.contains_key("remove_properties"));
    }

    #[test]
    fn test_has_cover_file() {
        let mut record = MetadataRecord::default();
        assert!(!record.has_cover_file());
        record.cover = Some(Cover::Embedded);
        assert!(!record.has_cover_file());
        record.cover = Some(Cover::File(PathBuf::from("/tmp/cover.jpg")));
        assert!(record.has_cover_file());
    }

    #[test]
    fn test_display_fields_hide_series() {
        let record = sample();
        let names: Vec<_> = record.display_fields().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"title"));
        assert!(!names.contains(&"series"));
        assert!(!names.contains(&"series_part"));
    }

    #[test]
    fn test_apply_removals() {
        let mut record = sample();
        record.extra_properties.insert("asin".to_string(), "X".to_string());
        record.remove_properties =
            ["title", "asin", "chapters"].iter().map(|s| s.to_string()).collect();

        record.apply_removals();

        assert_eq!(record.title, None);
        assert!(record.extra_properties.is_empty());
        assert!(record.chapters.is_empty());
        assert_eq!(record.remove_properties.len(), 3, "Markers are kept for writers");
    }

    #[test]
    fn test_series_sort_names() {
        let mut record = sample();
        record.apply_series_sort_names();
        assert_eq!(
            record.sort_title.as_deref(),
            Some("Stormlight Archive 1 - The Way of Kings")
        );
        assert_eq!(
            record.sort_album.as_deref(),
            Some("Stormlight Archive 1 - The Way of Kings")
        );
    }

    #[test]
    fn test_generic_get_set() {
        let mut record = MetadataRecord::default();
        assert!(record.set("track", Some(FieldValue::Text("7".to_string()))));
        assert_eq!(record.track, Some(7));
        assert!(!record.set("no_such_field", None));
        assert_eq!(record.get("track"), Some(FieldValue::Number(7)));
    }
}

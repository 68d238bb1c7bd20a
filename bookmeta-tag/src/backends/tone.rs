//! tone backend
//!
//! `tone dump --format json` is the fastest way to get an exact duration
//! and the complete tag set of an mp4 file. When installed, tone is the
//! only writer for the mp4 family.

use super::{Backend, DurationProbe, TagAccess, Tool};
use crate::codecs::chapter_list;
use crate::error::{TagError, TagResult};
use crate::options::TagFlags;
use crate::record::{Chapter, Cover, FieldValue, MetadataRecord};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// record field → tone `--meta-*` option
const META_OPTIONS: &[(&str, &str)] = &[
    ("title", "--meta-title"),
    ("sort_title", "--meta-sort-title"),
    ("album", "--meta-album"),
    ("sort_album", "--meta-sort-album"),
    ("artist", "--meta-artist"),
    ("sort_artist", "--meta-sort-artist"),
    ("album_artist", "--meta-album-artist"),
    ("sort_album_artist", "--meta-sort-album-artist"),
    ("writer", "--meta-composer"),
    ("genre", "--meta-genre"),
    ("publisher", "--meta-publisher"),
    ("series", "--meta-movement-name"),
    ("series_part", "--meta-part"),
    ("description", "--meta-description"),
    ("long_description", "--meta-long-description"),
    ("comment", "--meta-comment"),
    ("copyright", "--meta-copyright"),
    ("encoded_by", "--meta-encoded-by"),
    ("encoder", "--meta-encoder-settings"),
    ("lyrics", "--meta-lyrics"),
    ("year", "--meta-recording-date"),
    ("purchase_date", "--meta-purchase-date"),
    ("track", "--meta-track-number"),
    ("tracks", "--meta-track-total"),
    ("disk", "--meta-disc-number"),
    ("disks", "--meta-disc-total"),
    ("media_type", "--meta-itunes-media-type"),
];

/// Top level of `tone dump --format json`
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ToneDump {
    pub audio: ToneAudio,
    pub meta: ToneMeta,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ToneAudio {
    /// Milliseconds
    pub duration: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ToneMeta {
    pub title: Option<String>,
    pub sort_title: Option<String>,
    pub album: Option<String>,
    pub sort_album: Option<String>,
    pub artist: Option<String>,
    pub sort_artist: Option<String>,
    pub album_artist: Option<String>,
    pub sort_album_artist: Option<String>,
    pub composer: Option<String>,
    pub genre: Option<String>,
    pub publisher: Option<String>,
    pub movement_name: Option<String>,
    pub part: Option<String>,
    pub description: Option<String>,
    pub long_description: Option<String>,
    pub comment: Option<String>,
    pub copyright: Option<String>,
    pub encoded_by: Option<String>,
    pub encoder_settings: Option<String>,
    pub lyrics: Option<String>,
    pub recording_date: Option<String>,
    pub purchase_date: Option<String>,
    pub track_number: Option<u32>,
    pub track_total: Option<u32>,
    pub disc_number: Option<u32>,
    pub disc_total: Option<u32>,
    pub itunes_media_type: Option<u32>,
    pub chapters: Vec<ToneChapter>,
    pub embedded_pictures: Vec<serde_json::Value>,
    pub additional_fields: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ToneChapter {
    /// Milliseconds
    pub start: u64,
    /// Milliseconds
    pub length: u64,
    pub title: String,
}

impl ToneDump {
    pub fn duration(&self) -> Option<Duration> {
        self.audio
            .duration
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .map(|ms| Duration::from_secs_f64(ms / 1000.0))
    }

    pub fn into_record(self) -> MetadataRecord {
        let meta = self.meta;
        let mut record = MetadataRecord {
            title: meta.title,
            sort_title: meta.sort_title,
            album: meta.album,
            sort_album: meta.sort_album,
            artist: meta.artist,
            sort_artist: meta.sort_artist,
            album_artist: meta.album_artist,
            sort_album_artist: meta.sort_album_artist,
            writer: meta.composer,
            genre: meta.genre,
            publisher: meta.publisher,
            series: meta.movement_name,
            series_part: meta.part,
            description: meta.description,
            long_description: meta.long_description,
            comment: meta.comment,
            copyright: meta.copyright,
            encoded_by: meta.encoded_by,
            encoder: meta.encoder_settings,
            lyrics: meta.lyrics,
            year: meta.recording_date,
            purchase_date: meta.purchase_date,
            track: meta.track_number,
            tracks: meta.track_total,
            disk: meta.disc_number,
            disks: meta.disc_total,
            media_type: meta.itunes_media_type,
            cover: (!meta.embedded_pictures.is_empty()).then_some(Cover::Embedded),
            ..Default::default()
        };

        record.chapters = meta
            .chapters
            .into_iter()
            .map(|c| Chapter::new(Duration::from_millis(c.start), Duration::from_millis(c.length), c.title))
            .collect();

        for (key, value) in meta.additional_fields {
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => continue,
                other => other.to_string(),
            };
            record.extra_properties.insert(key, text);
        }
        record
    }
}

/// tone backend
#[derive(Debug)]
pub struct ToneBackend {
    tone: Tool,
}

impl ToneBackend {
    pub fn new(tone: impl Into<String>) -> Self {
        Self { tone: Tool::new(tone) }
    }

    async fn dump(&self, file: &Path) -> TagResult<ToneDump> {
        if !file.exists() {
            return Err(TagError::SourceMissing(file.to_path_buf()));
        }
        let stdout = self
            .tone
            .run_stdout([
                OsString::from("dump"),
                file.as_os_str().to_os_string(),
                OsString::from("--format"),
                OsString::from("json"),
            ])
            .await?;
        serde_json::from_str(&stdout)
            .map_err(|e| TagError::Parse(format!("Invalid tone dump for {}: {}", file.display(), e)))
    }

    /// `tone tag` arguments for the populated fields of `record`
    ///
    /// Chapters and cover are passed as files and are appended by the caller.
    pub fn tag_args(record: &MetadataRecord) -> Vec<OsString> {
        let mut args = Vec::new();
        for (field, option) in META_OPTIONS {
            let value = record.get(field).and_then(FieldValue::into_text);
            if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
                args.push(OsString::from(format!("{}={}", option, value)));
            }
        }
        for (key, value) in &record.extra_properties {
            if !value.trim().is_empty() {
                args.push(OsString::from(format!("--meta-additional-field={}={}", key, value)));
            }
        }
        for name in &record.remove_properties {
            args.push(OsString::from(format!("--meta-remove-property={}", name)));
        }
        args
    }
}

#[async_trait]
impl Backend for ToneBackend {
    fn name(&self) -> &'static str {
        "tone"
    }

    async fn is_active(&self) -> bool {
        self.tone.is_available().await
    }

    fn duration_probe(&self) -> Option<&dyn DurationProbe> {
        Some(self)
    }

    fn tag_access(&self) -> Option<&dyn TagAccess> {
        Some(self)
    }
}

#[async_trait]
impl DurationProbe for ToneBackend {
    async fn estimate_duration(&self, file: &Path) -> TagResult<Option<Duration>> {
        Ok(self.dump(file).await?.duration())
    }

    async fn inspect_exact_duration(&self, file: &Path) -> TagResult<Option<Duration>> {
        self.estimate_duration(file).await
    }
}

#[async_trait]
impl TagAccess for ToneBackend {
    async fn read_tag(&self, file: &Path) -> TagResult<MetadataRecord> {
        let record = self.dump(file).await?.into_record();
        debug!(file = %file.display(), chapters = record.chapters.len(), "Read tags with tone");
        Ok(record)
    }

    async fn write_tag(&self, file: &Path, record: &MetadataRecord, flags: &TagFlags) -> TagResult<()> {
        if !file.exists() {
            return Err(TagError::SourceMissing(file.to_path_buf()));
        }

        let mut args = vec![OsString::from("tag"), file.as_os_str().to_os_string()];
        args.extend(Self::tag_args(record));

        let chapters_file = if record.chapters.is_empty() {
            None
        } else {
            let mut temp = tempfile::Builder::new()
                .prefix("bookmeta-chapters-")
                .suffix(".txt")
                .tempfile()?;
            temp.write_all(chapter_list::build(&record.chapters).as_bytes())?;
            let path = temp.into_temp_path();
            let mut option = OsString::from("--meta-chapters-file=");
            option.push(&*path);
            args.push(option);
            Some(path)
        };

        if let Some(Cover::File(cover)) = &record.cover {
            let mut option = OsString::from("--meta-cover-file=");
            option.push(cover);
            args.push(option);
        }

        self.tone.run(args).await?;

        if let (true, Some(path)) = (flags.debug, chapters_file) {
            if let Ok(kept) = path.keep() {
                debug!(file = %kept.display(), "Keeping chapters file");
            }
        }

        info!(file = %file.display(), "Wrote tags with tone");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"{
        "audio": { "bitrate": 64, "duration": 3723500.0 },
        "meta": {
            "title": "Mort",
            "artist": "Terry Pratchett",
            "movementName": "Discworld",
            "part": "4",
            "trackNumber": 1,
            "itunesMediaType": 2,
            "embeddedPictures": [{ "code": 3 }],
            "chapters": [
                { "start": 0, "length": 60000, "title": "One" },
                { "start": 60000, "length": 3663500, "title": "Two" }
            ],
            "additionalFields": { "asin": "B00X", "rating": 5, "empty": null }
        }
    }"#;

    #[test]
    fn test_dump_into_record() {
        let dump: ToneDump = serde_json::from_str(DUMP).unwrap();
        assert_eq!(dump.duration(), Some(Duration::from_millis(3_723_500)));

        let record = dump.into_record();
        assert_eq!(record.title.as_deref(), Some("Mort"));
        assert_eq!(record.series.as_deref(), Some("Discworld"));
        assert_eq!(record.series_part.as_deref(), Some("4"));
        assert_eq!(record.media_type, Some(2));
        assert_eq!(record.cover, Some(Cover::Embedded));
        assert_eq!(record.chapters.len(), 2);
        assert_eq!(record.chapters[1].end(), Duration::from_millis(3_723_500));
        assert_eq!(record.extra_properties["asin"], "B00X");
        assert_eq!(record.extra_properties["rating"], "5");
        assert!(!record.extra_properties.contains_key("empty"));
    }

    #[test]
    fn test_empty_dump() {
        let dump: ToneDump = serde_json::from_str("{}").unwrap();
        assert_eq!(dump.duration(), None);
        assert!(dump.into_record().is_empty());
    }

    #[test]
    fn test_tag_args() {
        let mut record = MetadataRecord {
            title: Some("Mort".to_string()),
            series: Some("Discworld".to_string()),
            track: Some(4),
            ..Default::default()
        };
        record.remove_properties.insert("comment".to_string());

        let args: Vec<String> = ToneBackend::tag_args(&record)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "--meta-title=Mort",
                "--meta-movement-name=Discworld",
                "--meta-track-number=4",
                "--meta-remove-property=comment",
            ]
        );
    }
}

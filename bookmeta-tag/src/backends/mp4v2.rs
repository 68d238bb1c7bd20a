//! mp4v2 command-line tools backend (mp4info, mp4tags, mp4chaps, mp4art)
//!
//! Edits mp4 atoms in place without remuxing, so it is preferred over ffmpeg
//! for the mp4 family. Chapters travel through the chapter list companion
//! file that `mp4chaps -i` imports.

use super::{Backend, ChapterAccess, CoverAccess, DurationProbe, TagAccess, Tool};
use crate::codecs::chapter_list;
use crate::error::{TagError, TagResult};
use crate::options::TagFlags;
use crate::record::{Chapter, Cover, FieldValue, MetadataRecord};
use async_trait::async_trait;
use bookmeta_common::timecode::parse_timecode;
use once_cell::sync::Lazy;
use regex::Regex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

static TRACK_DURATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*\d+\s+audio\s+.*?([0-9]+(?:\.[0-9]+)?)\s+secs").expect("valid regex"));
static CHAPTER_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*Chapter\s+#\d+\s+-\s+([0-9:.]+)\s+-\s+(.*?)\s*$").expect("valid regex")
});
static NUMBER_OF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)(?:\s+of\s+(\d+))?").expect("valid regex"));

/// mp4info label → record field
const INFO_LABELS: &[(&str, &str)] = &[
    ("Name", "title"),
    ("Sort Name", "sort_title"),
    ("Album", "album"),
    ("Sort Album", "sort_album"),
    ("Artist", "artist"),
    ("Sort Artist", "sort_artist"),
    ("Album Artist", "album_artist"),
    ("Sort Album Artist", "sort_album_artist"),
    ("Composer", "writer"),
    ("Genre", "genre"),
    ("Release Date", "year"),
    ("Comments", "comment"),
    ("Copyright", "copyright"),
    ("Encoded by", "encoded_by"),
    ("Encoded with", "encoder"),
    ("Lyrics", "lyrics"),
    ("Short Description", "description"),
    ("Long Description", "long_description"),
    ("TV Show", "series"),
    ("TV Episode Number", "series_part"),
    ("Purchase Date", "purchase_date"),
];

/// record field → (mp4tags option, removal letter)
const TAG_OPTIONS: &[(&str, &str, char)] = &[
    ("title", "-song", 's'),
    ("album", "-album", 'A'),
    ("artist", "-artist", 'a'),
    ("album_artist", "-albumartist", 'R'),
    ("writer", "-writer", 'w'),
    ("genre", "-genre", 'g'),
    ("year", "-year", 'y'),
    ("comment", "-comment", 'c'),
    ("copyright", "-copyright", 'C'),
    ("encoded_by", "-encodedby", 'e'),
    ("encoder", "-tool", 'E'),
    ("lyrics", "-lyrics", 'L'),
    ("description", "-description", 'm'),
    ("long_description", "-longdesc", 'l'),
    ("series", "-show", 'S'),
    ("series_part", "-episodeid", 'o'),
    ("track", "-track", 't'),
    ("tracks", "-tracks", 'T'),
    ("disk", "-disk", 'd'),
    ("disks", "-disks", 'D'),
    ("sort_title", "-sortname", 'f'),
    ("sort_artist", "-sortartist", 'F'),
    ("sort_album", "-sortalbum", 'B'),
    ("sort_album_artist", "-sortalbumartist", 'b'),
];

/// mp4v2 backend
#[derive(Debug)]
pub struct Mp4v2Backend {
    mp4info: Tool,
    mp4tags: Tool,
    mp4chaps: Tool,
    mp4art: Tool,
}

impl Mp4v2Backend {
    pub fn new(
        mp4info: impl Into<String>,
        mp4tags: impl Into<String>,
        mp4chaps: impl Into<String>,
        mp4art: impl Into<String>,
    ) -> Self {
        Self {
            mp4info: Tool::new(mp4info),
            mp4tags: Tool::new(mp4tags),
            mp4chaps: Tool::new(mp4chaps),
            mp4art: Tool::new(mp4art),
        }
    }

    /// mp4tags arguments for every populated field plus the removal list
    pub fn tag_args(record: &MetadataRecord) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        let mut removals = String::new();

        for (field, option, letter) in TAG_OPTIONS {
            if record.remove_properties.contains(*field) {
                removals.push(*letter);
                continue;
            }
            let value = record.get(field).and_then(|v| v.into_text());
            if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
                args.push(OsString::from(*option));
                args.push(OsString::from(value));
            }
        }

        if record.media_type == Some(2) {
            args.push("-type".into());
            args.push("audiobook".into());
        }

        if !removals.is_empty() {
            args.push("-remove".into());
            args.push(removals.into());
        }
        args
    }

    async fn info(&self, file: &Path) -> TagResult<String> {
        if !file.exists() {
            return Err(TagError::SourceMissing(file.to_path_buf()));
        }
        self.mp4info.run_stdout([file.as_os_str()]).await
    }

    async fn write_chapter_companion(&self, file: &Path, chapters: &[Chapter], flags: &TagFlags) -> TagResult<()> {
        let companion = chapters_companion(file);
        let reuse = flags.use_existing_files && companion.exists();

        let previous = if reuse {
            info!(file = %companion.display(), "Reusing existing chapters file");
            None
        } else {
            let previous = tokio::fs::read(&companion).await.ok();
            tokio::fs::write(&companion, chapter_list::build(chapters)).await?;
            Some(previous)
        };

        let removed = self.mp4chaps.run([OsString::from("-r"), file.as_os_str().to_os_string()]).await;
        let imported = match removed {
            Ok(_) => self.mp4chaps.run([OsString::from("-i"), file.as_os_str().to_os_string()]).await,
            Err(e) => Err(e),
        };

        // restore whatever companion file was there before
        match previous {
            Some(Some(bytes)) => tokio::fs::write(&companion, bytes).await?,
            Some(None) if !flags.debug => {
                let _ = tokio::fs::remove_file(&companion).await;
            }
            _ => {}
        }

        imported.map(|_| ())
    }
}

/// `<dir>/<stem>.chapters.txt`, the file mp4chaps imports and exports
pub fn chapters_companion(file: &Path) -> PathBuf {
    let stem = file.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    file.with_file_name(format!("{}.{}", stem, chapter_list::COMPANION_SUFFIX))
}

/// Parse `mp4info` output into a record
pub fn parse_info(text: &str) -> MetadataRecord {
    let mut record = MetadataRecord::default();

    for line in text.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let label = label.trim();
        let value = value.trim();
        if value.is_empty() {
            continue;
        }

        match label {
            "Track" => {
                if let Some((n, t)) = parse_number_of(value) {
                    record.track = Some(n);
                    record.tracks = t;
                }
            }
            "Disk" => {
                if let Some((n, t)) = parse_number_of(value) {
                    record.disk = Some(n);
                    record.disks = t;
                }
            }
            "Media Type" => {
                record.media_type = match value {
                    "Audio Book" | "Audiobook" => Some(2),
                    other => other.parse().ok(),
                };
            }
            "Cover Art pieces" => {
                if value.parse::<u32>().map_or(false, |n| n > 0) {
                    record.cover = Some(Cover::Embedded);
                }
            }
            _ => {
                if let Some((_, field)) = INFO_LABELS.iter().find(|(l, _)| *l == label) {
                    record.set(field, Some(FieldValue::Text(value.to_string())));
                }
            }
        }
    }
    record
}

fn parse_number_of(value: &str) -> Option<(u32, Option<u32>)> {
    let caps = NUMBER_OF.captures(value)?;
    let number = caps[1].parse().ok()?;
    let total = caps.get(2).and_then(|m| m.as_str().parse().ok());
    Some((number, total))
}

/// Longest audio track duration reported by mp4info
pub fn parse_info_duration(text: &str) -> Option<Duration> {
    TRACK_DURATION
        .captures_iter(text)
        .filter_map(|caps| caps[1].parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .max()
}

/// Parse `mp4chaps -l` output (`Chapter #001 - 00:00:00.000 - Title`)
pub fn parse_chapter_listing(text: &str) -> Vec<Chapter> {
    let mut chapters: Vec<Chapter> = text
        .lines()
        .filter_map(|line| {
            let caps = CHAPTER_LINE.captures(line)?;
            let start = parse_timecode(&caps[1])?;
            Some(Chapter::new(start, Duration::ZERO, &caps[2]))
        })
        .collect();

    for i in 1..chapters.len() {
        let next_start = chapters[i].start();
        chapters[i - 1].set_end(next_start);
    }
    chapters
}

#[async_trait]
impl Backend for Mp4v2Backend {
    fn name(&self) -> &'static str {
        "mp4v2"
    }

    async fn is_active(&self) -> bool {
        self.mp4info.is_available().await
            && self.mp4tags.is_available().await
            && self.mp4chaps.is_available().await
            && self.mp4art.is_available().await
    }

    fn duration_probe(&self) -> Option<&dyn DurationProbe> {
        Some(self)
    }

    fn tag_access(&self) -> Option<&dyn TagAccess> {
        Some(self)
    }

    fn cover_access(&self) -> Option<&dyn CoverAccess> {
        Some(self)
    }

    fn chapter_access(&self) -> Option<&dyn ChapterAccess> {
        Some(self)
    }
}

#[async_trait]
impl DurationProbe for Mp4v2Backend {
    async fn estimate_duration(&self, file: &Path) -> TagResult<Option<Duration>> {
        Ok(parse_info_duration(&self.info(file).await?))
    }

    async fn inspect_exact_duration(&self, file: &Path) -> TagResult<Option<Duration>> {
        // mp4info reads the sample tables, which is already exact
        self.estimate_duration(file).await
    }
}

#[async_trait]
impl TagAccess for Mp4v2Backend {
    async fn read_tag(&self, file: &Path) -> TagResult<MetadataRecord> {
        let mut record = parse_info(&self.info(file).await?);
        record.chapters = self.read_chapters(file).await?;
        debug!(file = %file.display(), chapters = record.chapters.len(), "Read tags with mp4info");
        Ok(record)
    }

    async fn write_tag(&self, file: &Path, record: &MetadataRecord, flags: &TagFlags) -> TagResult<()> {
        if !file.exists() {
            return Err(TagError::SourceMissing(file.to_path_buf()));
        }

        let mut args = Self::tag_args(record);
        if !args.is_empty() {
            args.push(file.as_os_str().to_os_string());
            self.mp4tags.run(args).await?;
        }

        if !record.chapters.is_empty() {
            self.write_chapter_companion(file, &record.chapters, flags).await?;
        } else if record.remove_properties.contains("chapters") {
            self.mp4chaps.run([OsString::from("-r"), file.as_os_str().to_os_string()]).await?;
        }

        let cover = match &record.cover {
            Some(Cover::File(path)) => Some(path.clone()),
            _ if flags.use_existing_files => file
                .parent()
                .map(|dir| dir.join("cover.jpg"))
                .filter(|candidate| candidate.exists()),
            _ => None,
        };
        if let Some(cover) = cover {
            self.import_cover(file, &cover).await?;
        } else if record.remove_properties.contains("cover") {
            self.mp4art.run([OsString::from("--remove"), file.as_os_str().to_os_string()]).await?;
        }

        info!(file = %file.display(), "Wrote tags with mp4v2");
        Ok(())
    }
}

#[async_trait]
impl CoverAccess for Mp4v2Backend {
    async fn export_cover(&self, file: &Path, destination: &Path) -> TagResult<()> {
        self.mp4art
            .run([
                OsString::from("--extract"),
                OsString::from("--art-index"),
                OsString::from("0"),
                file.as_os_str().to_os_string(),
            ])
            .await?;

        // mp4art names the output <stem>.art[0].<ext> next to the audio file
        let stem = file.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        for ext in ["jpg", "png", "bmp", "gif"] {
            let extracted = file.with_file_name(format!("{}.art[0].{}", stem, ext));
            if extracted.exists() {
                tokio::fs::rename(&extracted, destination).await?;
                return Ok(());
            }
        }

        warn!(file = %file.display(), "mp4art reported success but wrote no image");
        Err(TagError::Parse(format!("No cover extracted from {}", file.display())))
    }

    async fn import_cover(&self, file: &Path, cover: &Path) -> TagResult<()> {
        if !cover.exists() {
            return Err(TagError::SourceMissing(cover.to_path_buf()));
        }
        self.mp4art.run([OsString::from("--remove"), file.as_os_str().to_os_string()]).await?;
        self.mp4art
            .run([
                OsString::from("--add"),
                cover.as_os_str().to_os_string(),
                file.as_os_str().to_os_string(),
            ])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChapterAccess for Mp4v2Backend {
    async fn read_chapters(&self, file: &Path) -> TagResult<Vec<Chapter>> {
        let listing = self
            .mp4chaps
            .run_stdout([OsString::from("-l"), file.as_os_str().to_os_string()])
            .await?;
        Ok(parse_chapter_listing(&listing))
    }

    async fn write_chapters(&self, file: &Path, chapters: &[Chapter]) -> TagResult<()> {
        if chapters.is_empty() {
            self.mp4chaps.run([OsString::from("-r"), file.as_os_str().to_os_string()]).await?;
            return Ok(());
        }
        self.write_chapter_companion(file, chapters, &TagFlags::default()).await
    }
}

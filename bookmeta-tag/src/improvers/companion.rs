//! Improvers reading companion files next to the audio file

use super::{log_changes, ImproveContext, Improver};
use crate::codecs::{chapter_list, cue_sheet, ffmetadata};
use crate::dispatcher::{DESCRIPTION_FILE_NAME, FFMETADATA_FILE_NAME};
use crate::error::TagResult;
use crate::record::{Cover, MetadataRecord};
use crate::text::{decode_description, decode_lossy};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Cover image names, in order of preference
pub const COVER_CANDIDATES: &[&str] = &["cover.jpg", "cover.png", "folder.jpg"];

/// Read a companion file, `None` when it does not exist
async fn read_companion(path: &Path) -> TagResult<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// First existing path among `candidates`
fn first_existing(candidates: impl IntoIterator<Item = PathBuf>) -> Option<PathBuf> {
    candidates.into_iter().find(|p| p.is_file())
}

// ============================================================================
// ffmetadata.txt
// ============================================================================

/// Fills empty fields from `ffmetadata.txt` next to the input
#[derive(Debug, Default)]
pub struct FfmetadataImprover;

#[async_trait]
impl Improver for FfmetadataImprover {
    fn name(&self) -> &'static str {
        "ffmetadata"
    }

    async fn improve(&self, record: &mut MetadataRecord, ctx: &mut ImproveContext) -> TagResult<()> {
        let path = ctx.input_dir().join(FFMETADATA_FILE_NAME);
        let Some(bytes) = read_companion(&path).await? else {
            debug!(file = %path.display(), "No ffmetadata file");
            return Ok(());
        };

        let parsed = ffmetadata::parse(&decode_lossy(&bytes));
        log_changes(self.name(), &record.merge_missing(&parsed));

        if record.chapters.is_empty() && !parsed.chapters.is_empty() {
            info!(count = parsed.chapters.len(), "Adopting chapters from ffmetadata");
            record.chapters = parsed.chapters;
        }
        Ok(())
    }
}

// ============================================================================
// Chapter list
// ============================================================================

/// Replaces chapters with `<basename>.chapters.txt` (or `chapters.txt`)
#[derive(Debug, Default)]
pub struct ChapterListImprover;

#[async_trait]
impl Improver for ChapterListImprover {
    fn name(&self) -> &'static str {
        "chapters"
    }

    async fn improve(&self, record: &mut MetadataRecord, ctx: &mut ImproveContext) -> TagResult<()> {
        let dir = ctx.input_dir();
        let candidates = [
            dir.join(format!("{}.{}", ctx.input_stem(), chapter_list::COMPANION_SUFFIX)),
            dir.join(chapter_list::COMPANION_SUFFIX),
        ];
        let Some(path) = first_existing(candidates) else {
            debug!(dir = %dir.display(), "No chapters file");
            return Ok(());
        };

        let bytes = tokio::fs::read(&path).await?;
        let chapters = chapter_list::parse(&decode_lossy(&bytes));
        if chapters.is_empty() {
            warn!(file = %path.display(), "Chapters file contains no chapters");
            return Ok(());
        }

        info!(file = %path.display(), count = chapters.len(), "Replacing chapters");
        record.chapters = chapters;
        Ok(())
    }
}

// ============================================================================
// Cue sheet
// ============================================================================

/// Fills empty fields and replaces chapters from a cue sheet
///
/// Looks for `<basename>.cue` first, then the only `*.cue` in the directory.
/// Several unrelated cue sheets are ambiguous and are ignored.
#[derive(Debug, Default)]
pub struct CueSheetImprover;

impl CueSheetImprover {
    async fn find_cue(ctx: &ImproveContext) -> TagResult<Option<PathBuf>> {
        let dir = ctx.input_dir();
        let named = dir.join(format!("{}.cue", ctx.input_stem()));
        if named.is_file() {
            return Ok(Some(named));
        }

        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_cue = path
                .extension()
                .and_then(|e| e.to_str())
                .map_or(false, |e| e.eq_ignore_ascii_case("cue"));
            if is_cue && path.is_file() {
                found.push(path);
            }
        }

        match found.len() {
            1 => Ok(found.pop()),
            0 => Ok(None),
            n => {
                warn!(dir = %dir.display(), count = n, "Several cue sheets found, ignoring all");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Improver for CueSheetImprover {
    fn name(&self) -> &'static str {
        "cue"
    }

    async fn improve(&self, record: &mut MetadataRecord, ctx: &mut ImproveContext) -> TagResult<()> {
        let Some(path) = Self::find_cue(ctx).await? else {
            debug!(file = %ctx.input.display(), "No cue sheet");
            return Ok(());
        };

        let bytes = tokio::fs::read(&path).await?;
        let parsed = cue_sheet::parse(&decode_lossy(&bytes));
        log_changes(self.name(), &record.merge_missing(&parsed));

        if !parsed.chapters.is_empty() {
            info!(file = %path.display(), count = parsed.chapters.len(), "Replacing chapters from cue sheet");
            record.chapters = parsed.chapters;
        }
        Ok(())
    }
}

// ============================================================================
// description.txt
// ============================================================================

/// Sets the description from `description.txt` when the record has none
#[derive(Debug, Default)]
pub struct DescriptionImprover;

#[async_trait]
impl Improver for DescriptionImprover {
    fn name(&self) -> &'static str {
        "description"
    }

    async fn improve(&self, record: &mut MetadataRecord, ctx: &mut ImproveContext) -> TagResult<()> {
        let path = ctx.input_dir().join(DESCRIPTION_FILE_NAME);
        let Some(bytes) = read_companion(&path).await? else {
            debug!(file = %path.display(), "No description file");
            return Ok(());
        };

        let Some(description) = decode_description(&bytes) else {
            warn!(file = %path.display(), "Skipping description with unknown encoding");
            return Ok(());
        };

        let source = MetadataRecord {
            description: Some(description),
            ..Default::default()
        };
        log_changes(self.name(), &record.merge_missing(&source));
        Ok(())
    }
}

// ============================================================================
// Cover image
// ============================================================================

/// Uses a cover image next to the input when the record has no cover file
#[derive(Debug, Default)]
pub struct CoverImprover;

#[async_trait]
impl Improver for CoverImprover {
    fn name(&self) -> &'static str {
        "cover"
    }

    async fn improve(&self, record: &mut MetadataRecord, ctx: &mut ImproveContext) -> TagResult<()> {
        if record.has_cover_file() {
            debug!("Record already references a cover file");
            return Ok(());
        }

        let dir = ctx.input_dir();
        let Some(path) = first_existing(COVER_CANDIDATES.iter().map(|name| dir.join(name))) else {
            debug!(dir = %dir.display(), "No cover image");
            return Ok(());
        };

        info!(file = %path.display(), replaces_embedded = record.cover.is_some(), "Using cover image");
        record.cover = Some(Cover::File(path));
        Ok(())
    }
}

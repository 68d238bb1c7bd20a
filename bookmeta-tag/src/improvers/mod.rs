//! Metadata improvers and the pipeline that runs them
//!
//! An improver pulls data from exactly one source (a companion file, the
//! embedded tags, user overrides, the audio itself) and merges it into the
//! record. A missing source is logged and skipped; only faults raised by the
//! tools or the file system propagate.
//!
//! # Pipeline order
//! Improvers run strictly in insertion order, each awaited before the next.
//! With a debug directory configured, the record is snapshotted after every
//! stage as `NN-<name>.ffmetadata.txt`, `NN-<name>.chapters.txt` and
//! `NN-<name>.silences.txt` whenever the content changed.

mod chapters;
mod companion;
mod embedded;
mod overrides;

pub use chapters::{ChapterLengthImprover, SilenceSnapImprover};
pub use companion::{
    ChapterListImprover, CoverImprover, CueSheetImprover, DescriptionImprover, FfmetadataImprover,
};
pub use embedded::EmbeddedTagImprover;
pub use overrides::OverrideImprover;

use crate::backends::Silence;
use crate::codecs::{chapter_list, ffmetadata};
use crate::error::TagResult;
use crate::record::{FieldChanges, MetadataRecord};
use async_trait::async_trait;
use bookmeta_common::timecode::format_timecode;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Per-run state shared by all improvers
#[derive(Debug, Clone)]
pub struct ImproveContext {
    /// Audio file being tagged
    pub input: PathBuf,
    /// Last silence detection result, set by silence-aware improvers
    pub silences: Option<Vec<Silence>>,
}

impl ImproveContext {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            silences: None,
        }
    }

    /// Directory containing the input file
    pub fn input_dir(&self) -> PathBuf {
        self.input
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Input file name without extension
    pub fn input_stem(&self) -> String {
        self.input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A single enrichment stage
#[async_trait]
pub trait Improver: Send + Sync {
    /// Stage name, used for logging and snapshot file names
    fn name(&self) -> &'static str;

    async fn improve(&self, record: &mut MetadataRecord, ctx: &mut ImproveContext) -> TagResult<()>;
}

/// Log the fields a merge changed
pub(crate) fn log_changes(improver: &str, changes: &FieldChanges) {
    if changes.is_empty() {
        debug!(improver, "No fields changed");
        return;
    }
    for (field, change) in changes {
        debug!(
            improver,
            field = %field,
            before = ?change.before.as_ref().map(ToString::to_string),
            after = ?change.after.as_ref().map(ToString::to_string),
            "Field changed"
        );
    }
    info!(improver, count = changes.len(), "Improved fields");
}

/// Ordered list of improvers
#[derive(Default)]
pub struct Pipeline {
    improvers: Vec<Box<dyn Improver>>,
    debug_dir: Option<PathBuf>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, improver: impl Improver + 'static) -> Self {
        self.improvers.push(Box::new(improver));
        self
    }

    /// Write per-stage snapshots into `dir`
    pub fn with_debug_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.debug_dir = Some(dir.into());
        self
    }

    pub fn len(&self) -> usize {
        self.improvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.improvers.is_empty()
    }

    /// Stage names in execution order
    pub fn names(&self) -> Vec<&'static str> {
        self.improvers.iter().map(|i| i.name()).collect()
    }

    /// Run every improver in order
    pub async fn run(&self, record: &mut MetadataRecord, ctx: &mut ImproveContext) -> TagResult<()> {
        let mut snapshots = SnapshotWriter::new(self.debug_dir.clone());

        for (index, improver) in self.improvers.iter().enumerate() {
            let before = record.chapters.len();
            debug!(improver = improver.name(), "Running improver");

            improver.improve(record, ctx).await?;

            let after = record.chapters.len();
            if before != after {
                info!(
                    improver = improver.name(),
                    before,
                    after,
                    "Chapter count changed"
                );
            }

            snapshots.write(index + 1, improver.name(), record, ctx).await?;
        }
        Ok(())
    }
}

/// Snapshot kinds and their renderers
const SNAPSHOT_KINDS: &[(&str, fn(&MetadataRecord, &ImproveContext) -> String)] = &[
    ("ffmetadata", |record, _| ffmetadata::build(record)),
    ("chapters", |record, _| chapter_list::build(&record.chapters)),
    ("silences", |_, ctx| render_silences(ctx.silences.as_deref().unwrap_or_default())),
];

fn render_silences(silences: &[Silence]) -> String {
    silences
        .iter()
        .map(|s| format!("{} {}\n", format_timecode(s.start), format_timecode(s.end)))
        .collect()
}

/// Writes stage snapshots, skipping content identical to the previous one
struct SnapshotWriter {
    dir: Option<PathBuf>,
    last: HashMap<&'static str, String>,
}

impl SnapshotWriter {
    fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            last: HashMap::new(),
        }
    }

    async fn write(
        &mut self,
        stage: usize,
        name: &str,
        record: &MetadataRecord,
        ctx: &ImproveContext,
    ) -> TagResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir).await?;

        for (kind, render) in SNAPSHOT_KINDS {
            let content = render(record, ctx);
            let unchanged = self.last.get(kind).map_or(content.is_empty(), |last| *last == content);
            if unchanged {
                continue;
            }
            let path = dir.join(format!("{:02}-{}.{}.txt", stage, name, kind));
            tokio::fs::write(&path, &content).await?;
            debug!(file = %path.display(), "Wrote snapshot");
            self.last.insert(*kind, content);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Improver for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn improve(&self, record: &mut MetadataRecord, _ctx: &mut ImproveContext) -> TagResult<()> {
            self.log.lock().unwrap().push(self.name);
            if self.name == "titler" {
                record.title = Some("Titled".to_string());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pipeline_runs_in_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ["a", "b", "titler", "c"]
            .into_iter()
            .fold(Pipeline::new(), |p, name| {
                p.add(Recorder {
                    name,
                    log: log.clone(),
                })
            });

        let mut record = MetadataRecord::default();
        let mut ctx = ImproveContext::new("/tmp/book.m4b");
        pipeline.run(&mut record, &mut ctx).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "titler", "c"]);
        assert_eq!(record.title.as_deref(), Some("Titled"));
        assert_eq!(pipeline.names(), vec!["a", "b", "titler", "c"]);
    }

    #[tokio::test]
    async fn test_snapshots_only_written_on_change() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new()
            .add(Recorder { name: "titler", log: log.clone() })
            .add(Recorder { name: "noop", log: log.clone() })
            .with_debug_dir(dir.path());

        let mut record = MetadataRecord::default();
        let mut ctx = ImproveContext::new("/tmp/book.m4b");
        ctx.silences = Some(vec![Silence::new(Duration::from_secs(1), Duration::from_secs(2))]);
        pipeline.run(&mut record, &mut ctx).await.unwrap();

        assert!(dir.path().join("01-titler.ffmetadata.txt").exists());
        assert!(dir.path().join("01-titler.silences.txt").exists());
        assert!(!dir.path().join("01-titler.chapters.txt").exists(), "Empty content is not written");
        assert!(!dir.path().join("02-noop.ffmetadata.txt").exists(), "Unchanged content is not rewritten");

        let silences = std::fs::read_to_string(dir.path().join("01-titler.silences.txt")).unwrap();
        assert_eq!(silences, "00:00:01.000 00:00:02.000\n");
    }

    #[test]
    fn test_context_paths() {
        let ctx = ImproveContext::new("/books/mort/mort.m4b");
        assert_eq!(ctx.input_dir(), PathBuf::from("/books/mort"));
        assert_eq!(ctx.input_stem(), "mort");
        assert_eq!(ImproveContext::new("mort.m4b").input_dir(), PathBuf::from("."));
    }
}

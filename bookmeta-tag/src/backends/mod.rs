//! Tool backends
//!
//! Every backend wraps one or more external command-line tools and exposes
//! the operations it can perform through capability traits. The dispatcher
//! asks a backend for a capability (`tag_access()`, `duration_probe()`, ...)
//! and skips it when the answer is `None`.
//!
//! Backends:
//! - **ffmpeg** - ffmpeg/ffprobe, handles every container (catch-all transcoder)
//! - **mp4v2** - mp4info/mp4tags/mp4chaps/mp4art, mp4 family only
//! - **tone** - fast duration probing and mp4 tag writing
//! - **fdkaac** - high quality AAC encoder (conversion only)

pub mod fdkaac;
pub mod ffmpeg;
pub mod mp4v2;
pub mod tone;

use crate::error::{TagError, TagResult};
use crate::options::{ConversionOptions, TagFlags};
use crate::record::{Chapter, MetadataRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tempfile::TempPath;
use tokio::process::{Child, Command};
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub use fdkaac::FdkaacBackend;
pub use ffmpeg::FfmpegBackend;
pub use mp4v2::Mp4v2Backend;
pub use tone::ToneBackend;

// ============================================================================
// Capability traits
// ============================================================================

/// A tool backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Whether the backend's tools are installed and usable
    async fn is_active(&self) -> bool;

    fn duration_probe(&self) -> Option<&dyn DurationProbe> {
        None
    }

    fn tag_access(&self) -> Option<&dyn TagAccess> {
        None
    }

    fn cover_access(&self) -> Option<&dyn CoverAccess> {
        None
    }

    fn chapter_access(&self) -> Option<&dyn ChapterAccess> {
        None
    }

    fn silence_detection(&self) -> Option<&dyn SilenceDetection> {
        None
    }

    fn file_converter(&self) -> Option<&dyn FileConverter> {
        None
    }
}

/// Duration measurement
#[async_trait]
pub trait DurationProbe: Send + Sync {
    /// Duration from container headers (fast, may be imprecise)
    async fn estimate_duration(&self, file: &Path) -> TagResult<Option<Duration>>;

    /// Duration measured by reading the stream (slow, exact)
    async fn inspect_exact_duration(&self, file: &Path) -> TagResult<Option<Duration>>;
}

/// Tag reading and writing
#[async_trait]
pub trait TagAccess: Send + Sync {
    async fn read_tag(&self, file: &Path) -> TagResult<MetadataRecord>;

    /// Write every populated field of `record`; fields named in
    /// `remove_properties` are stripped from the file
    async fn write_tag(&self, file: &Path, record: &MetadataRecord, flags: &TagFlags) -> TagResult<()>;
}

/// Embedded cover art
#[async_trait]
pub trait CoverAccess: Send + Sync {
    /// Extract the embedded cover into `destination`
    async fn export_cover(&self, file: &Path, destination: &Path) -> TagResult<()>;

    /// Embed the image at `cover`, replacing any existing cover
    async fn import_cover(&self, file: &Path, cover: &Path) -> TagResult<()>;
}

/// Chapter markers
#[async_trait]
pub trait ChapterAccess: Send + Sync {
    async fn read_chapters(&self, file: &Path) -> TagResult<Vec<Chapter>>;

    /// Replace all chapters of `file`
    async fn write_chapters(&self, file: &Path, chapters: &[Chapter]) -> TagResult<()>;
}

/// Silence detection
#[async_trait]
pub trait SilenceDetection: Send + Sync {
    /// Silences of at least `min_length`, ordered by start
    async fn detect_silences(&self, file: &Path, min_length: Duration) -> TagResult<Vec<Silence>>;
}

/// Audio conversion
#[async_trait]
pub trait FileConverter: Send + Sync {
    /// Whether this converter can honour `options`
    async fn supports_conversion(&self, options: &ConversionOptions) -> bool;

    /// Start the conversion; the returned job must be awaited to finish it
    async fn convert_file(&self, options: &ConversionOptions) -> TagResult<ConversionJob>;
}

// ============================================================================
// Shared types
// ============================================================================

/// Silent region of an audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Silence {
    pub start: Duration,
    pub end: Duration,
}

impl Silence {
    pub fn new(start: Duration, end: Duration) -> Self {
        Self { start, end }
    }

    pub fn length(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }

    /// Midpoint of the region
    pub fn middle(&self) -> Duration {
        self.start + self.length() / 2
    }
}

/// Running conversion
///
/// Holds the child process, the staged output file and any intermediate
/// files. Dropping the job without `wait` deletes every temp file.
#[derive(Debug)]
pub struct ConversionJob {
    tool: String,
    child: Child,
    output: TempPath,
    destination: PathBuf,
    intermediates: Vec<TempPath>,
    keep_temp_files: bool,
}

impl ConversionJob {
    pub fn new(tool: impl Into<String>, child: Child, output: TempPath, destination: PathBuf) -> Self {
        Self {
            tool: tool.into(),
            child,
            output,
            destination,
            intermediates: Vec::new(),
            keep_temp_files: false,
        }
    }

    /// Attach an intermediate file that lives as long as the job
    pub fn with_intermediate(mut self, path: TempPath) -> Self {
        self.intermediates.push(path);
        self
    }

    /// Keep intermediate files after completion (debug mode)
    pub fn keep_temp_files(mut self, keep: bool) -> Self {
        self.keep_temp_files = keep;
        self
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Wait for the process and move the finished file into place
    pub async fn wait(self) -> TagResult<PathBuf> {
        let ConversionJob {
            tool,
            child,
            output,
            destination,
            intermediates,
            keep_temp_files,
        } = self;

        let result = child.wait_with_output().await?;
        if !result.status.success() {
            return Err(tool_failed(&tool, &result));
        }

        output
            .persist(&destination)
            .map_err(|e| TagError::Io(e.error))?;

        if keep_temp_files {
            for path in intermediates {
                match path.keep() {
                    Ok(kept) => debug!(file = %kept.display(), "Keeping intermediate file"),
                    Err(e) => debug!(error = %e, "Could not keep intermediate file"),
                }
            }
        }

        info!(tool = %tool, destination = %destination.display(), "Conversion finished");
        Ok(destination)
    }
}

// ============================================================================
// Process helpers
// ============================================================================

/// External executable with a cached availability check
#[derive(Debug)]
pub struct Tool {
    program: String,
    available: OnceCell<bool>,
}

impl Tool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            available: OnceCell::new(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Check that the executable exists; the result is cached
    pub async fn is_available(&self) -> bool {
        *self
            .available
            .get_or_init(|| async {
                let available = if Path::new(&self.program).components().count() > 1 {
                    Path::new(&self.program).is_file()
                } else {
                    Command::new("which")
                        .arg(&self.program)
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .status()
                        .await
                        .map(|status| status.success())
                        .unwrap_or(false)
                };
                debug!(command = %self.program, available, "Tool availability check");
                available
            })
            .await
    }

    /// Command preconfigured for this tool
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.kill_on_drop(true);
        command
    }

    /// Run to completion, capturing stdout and stderr
    ///
    /// A non-zero exit status becomes `TagError::ToolFailed`.
    pub async fn run<I, S>(&self, args: I) -> TagResult<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = self.command();
        command.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        debug!(command = ?command.as_std(), "Running tool");

        let output = command.output().await.map_err(|e| {
            std::io::Error::new(e.kind(), format!("Failed to execute {}: {}", self.program, e))
        })?;

        if !output.status.success() {
            return Err(tool_failed(&self.program, &output));
        }
        Ok(output)
    }

    /// Run and return stdout as text
    pub async fn run_stdout<I, S>(&self, args: I) -> TagResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run(args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn tool_failed(tool: &str, output: &Output) -> TagError {
    TagError::ToolFailed {
        tool: tool.to_string(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

/// Temp file next to `target`, so a later rename stays on one filesystem
pub(crate) fn sibling_temp_path(target: &Path, suffix: &str) -> TagResult<TempPath> {
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file = tempfile::Builder::new()
        .prefix(".bookmeta-")
        .suffix(suffix)
        .tempfile_in(dir)?;
    Ok(file.into_temp_path())
}

/// `.ext` of `path` including the dot, or an empty string
pub(crate) fn dotted_extension(path: &Path) -> String {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default()
}

/// Whole seconds with millisecond precision, as tools expect on the command line
pub(crate) fn seconds_arg(duration: Duration) -> String {
    format!("{:.3}", duration.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_geometry() {
        let silence = Silence::new(Duration::from_secs(10), Duration::from_secs(14));
        assert_eq!(silence.length(), Duration::from_secs(4));
        assert_eq!(silence.middle(), Duration::from_secs(12));

        let inverted = Silence::new(Duration::from_secs(5), Duration::from_secs(3));
        assert_eq!(inverted.length(), Duration::ZERO);
    }

    #[test]
    fn test_argument_helpers() {
        assert_eq!(seconds_arg(Duration::from_millis(1500)), "1.500");
        assert_eq!(dotted_extension(Path::new("/a/book.m4b")), ".m4b");
        assert_eq!(dotted_extension(Path::new("/a/book")), "");
    }

    #[tokio::test]
    async fn test_missing_tool_is_inactive() {
        let tool = Tool::new("/nonexistent/dir/bookmeta-no-such-tool");
        assert!(!tool.is_available().await);
    }

    #[tokio::test]
    async fn test_temp_path_is_sibling() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("out.m4b");
        let temp = sibling_temp_path(&target, ".m4b").unwrap();
        assert_eq!(temp.parent(), Some(dir.path()));
        assert!(temp.to_string_lossy().ends_with(".m4b"));
    }
}

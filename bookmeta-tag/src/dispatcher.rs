//! Backend dispatcher
//!
//! Routes every tool operation to the best installed backend. Roles:
//! - **alternate** (tone): fastest duration source; exclusive mp4 tag writer when active
//! - **mp4** (mp4v2): mp4 family reads and writes without remuxing
//! - **transcoder** (ffmpeg): required catch-all for every container
//! - **converters**: tried in order for conversions, the transcoder is always last
//!
//! A candidate is skipped only when it is inactive or lacks the capability.
//! Failing calls are never retried on the next candidate.

use crate::backends::{
    dotted_extension, sibling_temp_path, Backend, ConversionJob, FdkaacBackend, FfmpegBackend,
    Mp4v2Backend, Silence, ToneBackend,
};
use crate::cache::ResultCache;
use crate::codecs::{chapter_list, ffmetadata};
use crate::error::{TagError, TagResult};
use crate::options::{ConversionOptions, ExportOptions, TagFlags};
use crate::quality::resolve_quality;
use crate::record::{Cover, MetadataRecord};
use crate::text::{decode_lossy, normalize_descriptions};
use bookmeta_common::config::TomlConfig;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default export file names
pub const COVER_FILE_NAME: &str = "cover.jpg";
pub const DESCRIPTION_FILE_NAME: &str = "description.txt";
pub const FFMETADATA_FILE_NAME: &str = "ffmetadata.txt";

/// Extensions handled by the mp4 family tools
const MP4_EXTENSIONS: &[&str] = &["m4b", "m4a", "mp4", "m4r", "m4p", "aac"];

/// Other recognized audio extensions
const OTHER_EXTENSIONS: &[&str] = &["mp3", "ogg", "oga", "opus", "flac", "wav", "wma"];

/// Container family of an audio file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Mp4Family,
    Other,
}

/// Container family by extension (case-insensitive); `None` for unknown files
pub fn detect_container_format(path: &Path) -> Option<ContainerFormat> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if MP4_EXTENSIONS.contains(&ext.as_str()) {
        Some(ContainerFormat::Mp4Family)
    } else if OTHER_EXTENSIONS.contains(&ext.as_str()) {
        Some(ContainerFormat::Other)
    } else {
        None
    }
}

/// Kind of companion file an export produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Cover,
    Chapters,
    Description,
    Ffmetadata,
}

impl ExportKind {
    /// Default file name for an input file
    pub fn default_file_name(&self, input: &Path) -> String {
        match self {
            ExportKind::Cover => COVER_FILE_NAME.to_string(),
            ExportKind::Chapters => {
                let stem = input.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
                format!("{}.{}", stem, chapter_list::COMPANION_SUFFIX)
            }
            ExportKind::Description => DESCRIPTION_FILE_NAME.to_string(),
            ExportKind::Ffmetadata => FFMETADATA_FILE_NAME.to_string(),
        }
    }
}

/// Destination of an export: explicit file, else `<dir>/<prefix><default name>`
pub fn export_destination(input: &Path, kind: ExportKind, options: &ExportOptions) -> PathBuf {
    if let Some(destination) = &options.destination {
        return destination.clone();
    }
    let dir = options
        .directory
        .clone()
        .or_else(|| input.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    let name = format!(
        "{}{}",
        options.prefix.as_deref().unwrap_or_default(),
        kind.default_file_name(input)
    );
    dir.join(name)
}

/// Backend dispatcher
pub struct BackendDispatcher {
    alternate: Option<Arc<dyn Backend>>,
    mp4: Option<Arc<dyn Backend>>,
    transcoder: Arc<dyn Backend>,
    converters: Vec<Arc<dyn Backend>>,
    cache: Option<ResultCache>,
    default_bitrate_kbps: u32,
}

impl BackendDispatcher {
    /// Dispatcher with only the required transcoder
    pub fn new(transcoder: Arc<dyn Backend>) -> Self {
        Self {
            alternate: None,
            mp4: None,
            transcoder,
            converters: Vec::new(),
            cache: None,
            default_bitrate_kbps: 64,
        }
    }

    pub fn with_alternate(mut self, backend: Arc<dyn Backend>) -> Self {
        self.alternate = Some(backend);
        self
    }

    pub fn with_mp4(mut self, backend: Arc<dyn Backend>) -> Self {
        self.mp4 = Some(backend);
        self
    }

    /// Add a converter; converters are asked in insertion order before the transcoder
    pub fn with_converter(mut self, backend: Arc<dyn Backend>) -> Self {
        self.converters.push(backend);
        self
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_default_bitrate(mut self, kbps: u32) -> Self {
        self.default_bitrate_kbps = kbps;
        self
    }

    /// Wire up the real tool backends from configuration
    pub fn from_config(config: &TomlConfig) -> Self {
        let tools = &config.tools;
        let transcoder: Arc<dyn Backend> = Arc::new(FfmpegBackend::new(&tools.ffmpeg, &tools.ffprobe));

        let mut dispatcher = Self::new(transcoder)
            .with_mp4(Arc::new(Mp4v2Backend::new(
                &tools.mp4info,
                &tools.mp4tags,
                &tools.mp4chaps,
                &tools.mp4art,
            )))
            .with_converter(Arc::new(FdkaacBackend::new(&tools.fdkaac, &tools.ffmpeg)))
            .with_default_bitrate(config.quality.default_bitrate_kbps);

        if tools.prefer_tone {
            dispatcher = dispatcher.with_alternate(Arc::new(ToneBackend::new(&tools.tone)));
        }
        if let Some(cache) = ResultCache::from_config(&config.cache) {
            dispatcher = dispatcher.with_cache(cache);
        }
        dispatcher
    }

    async fn active(backend: &Option<Arc<dyn Backend>>) -> Option<&Arc<dyn Backend>> {
        match backend {
            Some(b) if b.is_active().await => Some(b),
            Some(b) => {
                debug!(backend = b.name(), "Backend inactive, skipping");
                None
            }
            None => None,
        }
    }

    /// Mp4 backend for mp4 family files when active, else the transcoder
    async fn container_backend(&self, file: &Path) -> TagResult<&Arc<dyn Backend>> {
        if detect_container_format(file) == Some(ContainerFormat::Mp4Family) {
            if let Some(mp4) = Self::active(&self.mp4).await {
                return Ok(mp4);
            }
        }
        if self.transcoder.is_active().await {
            Ok(&self.transcoder)
        } else {
            Err(TagError::NoBackend(format!("{}", file.display())))
        }
    }

    // ========================================================================
    // Duration
    // ========================================================================

    async fn duration_candidates(&self, file: &Path) -> Vec<&Arc<dyn Backend>> {
        let mut candidates = Vec::new();
        if let Some(alternate) = Self::active(&self.alternate).await {
            candidates.push(alternate);
        }
        if detect_container_format(file) == Some(ContainerFormat::Mp4Family) {
            if let Some(mp4) = Self::active(&self.mp4).await {
                candidates.push(mp4);
            }
        }
        if self.transcoder.is_active().await {
            candidates.push(&self.transcoder);
        }
        candidates
    }

    /// Duration from container headers; `Ok(None)` when no backend can tell
    pub async fn estimate_duration(&self, file: &Path) -> TagResult<Option<Duration>> {
        for backend in self.duration_candidates(file).await {
            let Some(probe) = backend.duration_probe() else {
                continue;
            };
            if let Some(duration) = probe.estimate_duration(file).await? {
                debug!(backend = backend.name(), ?duration, "Estimated duration");
                return Ok(Some(duration));
            }
        }
        Ok(None)
    }

    /// Exact duration; `Ok(None)` when no backend can tell
    pub async fn inspect_exact_duration(&self, file: &Path) -> TagResult<Option<Duration>> {
        for backend in self.duration_candidates(file).await {
            let Some(probe) = backend.duration_probe() else {
                continue;
            };
            if let Some(duration) = probe.inspect_exact_duration(file).await? {
                debug!(backend = backend.name(), ?duration, "Measured exact duration");
                return Ok(Some(duration));
            }
        }
        Ok(None)
    }

    // ========================================================================
    // Tags
    // ========================================================================

    pub async fn read_tag(&self, file: &Path) -> TagResult<MetadataRecord> {
        if !file.exists() {
            return Err(TagError::SourceMissing(file.to_path_buf()));
        }
        let backend = self.container_backend(file).await?;
        let access = backend.tag_access().ok_or(TagError::Unsupported {
            backend: backend.name(),
            operation: "read_tag",
        })?;
        debug!(backend = backend.name(), file = %file.display(), "Reading tags");
        access.read_tag(file).await
    }

    /// Persist `record` with the best backend for the container
    ///
    /// Sort-name adjustment and removal markers apply to every path.
    /// Description normalization applies to mp4 writes not handled by the
    /// alternate backend.
    pub async fn write_tag(&self, file: &Path, record: &MetadataRecord, flags: &TagFlags) -> TagResult<()> {
        if !file.exists() {
            return Err(TagError::SourceMissing(file.to_path_buf()));
        }

        let mut record = record.clone();
        if flags.adjust_for_constrained_players {
            record.apply_series_sort_names();
        }
        record.apply_removals();

        let is_mp4 = detect_container_format(file) == Some(ContainerFormat::Mp4Family);
        if is_mp4 {
            if let Some(alternate) = Self::active(&self.alternate).await {
                if let Some(access) = alternate.tag_access() {
                    info!(backend = alternate.name(), file = %file.display(), "Writing tags");
                    return access.write_tag(file, &record, flags).await;
                }
            }
            normalize_descriptions(&mut record, flags);
        }

        let backend = self.container_backend(file).await?;
        let access = backend.tag_access().ok_or(TagError::Unsupported {
            backend: backend.name(),
            operation: "write_tag",
        })?;
        info!(backend = backend.name(), file = %file.display(), "Writing tags");
        access.write_tag(file, &record, flags).await
    }

    // ========================================================================
    // Conversion
    // ========================================================================

    /// Start a conversion with the first converter that supports it
    pub async fn convert_file(&self, options: &ConversionOptions) -> TagResult<ConversionJob> {
        if !options.source.exists() {
            return Err(TagError::SourceMissing(options.source.clone()));
        }
        if options.destination.exists() && !options.force {
            return Err(TagError::DestinationExists(options.destination.clone()));
        }

        let mut options = options.clone();
        resolve_quality(&mut options, self.default_bitrate_kbps);

        for backend in self.converters.iter().chain(std::iter::once(&self.transcoder)) {
            let Some(converter) = backend.file_converter() else {
                continue;
            };
            if !backend.is_active().await {
                debug!(backend = backend.name(), "Converter inactive, skipping");
                continue;
            }
            if converter.supports_conversion(&options).await {
                info!(backend = backend.name(), "Selected converter");
                return converter.convert_file(&options).await;
            }
        }
        Err(TagError::NoBackend(format!("conversion to {}", options.format)))
    }

    // ========================================================================
    // Exports and imports
    // ========================================================================

    fn prepare_destination(input: &Path, kind: ExportKind, options: &ExportOptions) -> TagResult<PathBuf> {
        if !input.exists() {
            return Err(TagError::SourceMissing(input.to_path_buf()));
        }
        let destination = export_destination(input, kind, options);
        if destination.exists() && !options.force {
            return Err(TagError::DestinationExists(destination));
        }
        if let Some(dir) = destination.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        Ok(destination)
    }

    async fn write_export(destination: &Path, content: String) -> TagResult<()> {
        let destination = destination.to_path_buf();
        tokio::task::spawn_blocking(move || -> TagResult<()> {
            let dir = destination
                .parent()
                .filter(|d| !d.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let mut temp = tempfile::NamedTempFile::new_in(dir)?;
            temp.write_all(content.as_bytes())?;
            temp.persist(&destination).map_err(|e| TagError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| TagError::Io(std::io::Error::other(format!("Export task failed: {}", e))))?
    }

    /// Extract the cover image next to the input (default `cover.jpg`)
    pub async fn export_cover(&self, file: &Path, options: &ExportOptions) -> TagResult<PathBuf> {
        let destination = Self::prepare_destination(file, ExportKind::Cover, options)?;
        let backend = self.container_backend(file).await?;
        let access = backend.cover_access().ok_or(TagError::Unsupported {
            backend: backend.name(),
            operation: "export_cover",
        })?;

        let suffix = dotted_extension(&destination);
        let temp = sibling_temp_path(&destination, &suffix)?;
        access.export_cover(file, &temp).await?;
        temp.persist(&destination).map_err(|e| TagError::Io(e.error))?;

        info!(file = %destination.display(), "Exported cover");
        Ok(destination)
    }

    /// Write the chapters as a chapter list (default `<basename>.chapters.txt`)
    pub async fn export_chapters(&self, file: &Path, options: &ExportOptions) -> TagResult<PathBuf> {
        let destination = Self::prepare_destination(file, ExportKind::Chapters, options)?;
        let backend = self.container_backend(file).await?;
        let chapters = match backend.chapter_access() {
            Some(access) => access.read_chapters(file).await?,
            None => self.read_tag(file).await?.chapters,
        };
        if chapters.is_empty() {
            warn!(file = %file.display(), "No chapters to export");
        }

        Self::write_export(&destination, chapter_list::build(&chapters)).await?;
        info!(file = %destination.display(), chapters = chapters.len(), "Exported chapters");
        Ok(destination)
    }

    /// Write the description (long form preferred) to `description.txt`
    pub async fn export_description(&self, file: &Path, options: &ExportOptions) -> TagResult<PathBuf> {
        let destination = Self::prepare_destination(file, ExportKind::Description, options)?;
        let record = self.read_tag(file).await?;
        let description = record
            .long_description
            .filter(|d| !d.trim().is_empty())
            .or(record.description)
            .unwrap_or_default();

        Self::write_export(&destination, description).await?;
        info!(file = %destination.display(), "Exported description");
        Ok(destination)
    }

    /// Dump all tags and chapters as an ffmetadata document
    pub async fn export_ffmetadata(&self, file: &Path, options: &ExportOptions) -> TagResult<PathBuf> {
        let destination = Self::prepare_destination(file, ExportKind::Ffmetadata, options)?;
        let record = self.read_tag(file).await?;

        Self::write_export(&destination, ffmetadata::build(&record)).await?;
        info!(file = %destination.display(), "Exported ffmetadata");
        Ok(destination)
    }

    /// Replace the chapters of `file` with those of a chapter list file
    ///
    /// An empty list clears the chapters only with `force`; otherwise the
    /// file is left alone. The container backend's chapter capability is
    /// used when it has one, except for mp4 files owned by the alternate.
    pub async fn import_chapters(&self, file: &Path, chapters_file: &Path, flags: &TagFlags) -> TagResult<()> {
        if !file.exists() {
            return Err(TagError::SourceMissing(file.to_path_buf()));
        }
        if !chapters_file.exists() {
            return Err(TagError::SourceMissing(chapters_file.to_path_buf()));
        }
        let bytes = tokio::fs::read(chapters_file).await?;
        let chapters = chapter_list::parse(&decode_lossy(&bytes));
        if chapters.is_empty() && !flags.force {
            warn!(
                file = %chapters_file.display(),
                "Chapters file contains no chapters, not clearing without force"
            );
            return Ok(());
        }
        info!(file = %file.display(), chapters = chapters.len(), "Importing chapters");

        let alternate_owns_file = detect_container_format(file) == Some(ContainerFormat::Mp4Family)
            && Self::active(&self.alternate).await.is_some();
        if !alternate_owns_file {
            let backend = self.container_backend(file).await?;
            if let Some(access) = backend.chapter_access() {
                debug!(backend = backend.name(), "Writing chapters");
                return access.write_chapters(file, &chapters).await;
            }
        }

        let mut record = MetadataRecord {
            chapters,
            ..Default::default()
        };
        if record.chapters.is_empty() {
            record.remove_properties.insert("chapters".to_string());
        }
        self.write_tag(file, &record, flags).await
    }

    /// Embed an image file as cover
    pub async fn import_cover(&self, file: &Path, cover: &Path, flags: &TagFlags) -> TagResult<()> {
        if !cover.exists() {
            return Err(TagError::SourceMissing(cover.to_path_buf()));
        }
        let record = MetadataRecord {
            cover: Some(Cover::File(cover.to_path_buf())),
            ..Default::default()
        };
        self.write_tag(file, &record, flags).await
    }

    // ========================================================================
    // Silences
    // ========================================================================

    /// Silences of at least `min_length`, cached by file content
    pub async fn detect_silences(&self, file: &Path, min_length: Duration) -> TagResult<Vec<Silence>> {
        if !file.exists() {
            return Err(TagError::SourceMissing(file.to_path_buf()));
        }
        if !self.transcoder.is_active().await {
            return Err(TagError::NoBackend("silence detection".to_string()));
        }
        let detector = self.transcoder.silence_detection().ok_or(TagError::Unsupported {
            backend: self.transcoder.name(),
            operation: "detect_silences",
        })?;

        let key = match &self.cache {
            Some(_) => {
                let params = format!("silences:{}", min_length.as_millis());
                Some(ResultCache::content_key(file, &params).await?)
            }
            None => None,
        };

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(silences) = cache.get::<Vec<Silence>>(key).await? {
                debug!(file = %file.display(), count = silences.len(), "Using cached silences");
                return Ok(silences);
            }
        }

        let silences = detector.detect_silences(file, min_length).await?;

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Err(e) = cache.put(key, &silences).await {
                warn!(error = %e, "Could not cache silences");
            }
        }
        Ok(silences)
    }
}

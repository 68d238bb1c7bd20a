//! Dispatcher routing tests with in-process backends

use async_trait::async_trait;
use bookmeta_tag::backends::{
    Backend, ChapterAccess, ConversionJob, DurationProbe, FileConverter, Silence, SilenceDetection,
    TagAccess,
};
use bookmeta_tag::cache::ResultCache;
use bookmeta_tag::options::{ConversionOptions, ExportOptions, TagFlags};
use bookmeta_tag::{BackendDispatcher, Chapter, MetadataRecord, TagError, TagResult};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

type CallLog = Arc<Mutex<Vec<String>>>;

/// Backend double that records every call as `<name>:<operation>`
struct FakeBackend {
    name: &'static str,
    active: bool,
    duration: Option<Duration>,
    tags: MetadataRecord,
    converts: bool,
    chapters: bool,
    log: CallLog,
    written: Arc<Mutex<Vec<MetadataRecord>>>,
}

impl FakeBackend {
    fn new(name: &'static str, log: &CallLog) -> Self {
        Self {
            name,
            active: true,
            duration: None,
            tags: MetadataRecord::default(),
            converts: false,
            chapters: false,
            log: log.clone(),
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    fn with_duration(mut self, secs: u64) -> Self {
        self.duration = Some(Duration::from_secs(secs));
        self
    }

    fn with_tags(mut self, tags: MetadataRecord) -> Self {
        self.tags = tags;
        self
    }

    fn converting(mut self) -> Self {
        self.converts = true;
        self
    }

    fn with_chapter_access(mut self) -> Self {
        self.chapters = true;
        self
    }

    fn record(&self, operation: &str) {
        self.log.lock().unwrap().push(format!("{}:{}", self.name, operation));
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn is_active(&self) -> bool {
        self.active
    }

    fn duration_probe(&self) -> Option<&dyn DurationProbe> {
        Some(self)
    }

    fn tag_access(&self) -> Option<&dyn TagAccess> {
        Some(self)
    }

    fn chapter_access(&self) -> Option<&dyn ChapterAccess> {
        if self.chapters {
            Some(self)
        } else {
            None
        }
    }

    fn silence_detection(&self) -> Option<&dyn SilenceDetection> {
        Some(self)
    }

    fn file_converter(&self) -> Option<&dyn FileConverter> {
        if self.converts {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl DurationProbe for FakeBackend {
    async fn estimate_duration(&self, _file: &Path) -> TagResult<Option<Duration>> {
        self.record("estimate");
        Ok(self.duration)
    }

    async fn inspect_exact_duration(&self, _file: &Path) -> TagResult<Option<Duration>> {
        self.record("exact");
        Ok(self.duration)
    }
}

#[async_trait]
impl TagAccess for FakeBackend {
    async fn read_tag(&self, _file: &Path) -> TagResult<MetadataRecord> {
        self.record("read");
        Ok(self.tags.clone())
    }

    async fn write_tag(&self, _file: &Path, record: &MetadataRecord, _flags: &TagFlags) -> TagResult<()> {
        self.record("write");
        self.written.lock().unwrap().push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl ChapterAccess for FakeBackend {
    async fn read_chapters(&self, _file: &Path) -> TagResult<Vec<Chapter>> {
        self.record("read_chapters");
        Ok(self.tags.chapters.clone())
    }

    async fn write_chapters(&self, _file: &Path, chapters: &[Chapter]) -> TagResult<()> {
        self.record("write_chapters");
        self.written.lock().unwrap().push(MetadataRecord {
            chapters: chapters.to_vec(),
            ..Default::default()
        });
        Ok(())
    }
}

#[async_trait]
impl SilenceDetection for FakeBackend {
    async fn detect_silences(&self, _file: &Path, _min_length: Duration) -> TagResult<Vec<Silence>> {
        self.record("silences");
        Ok(vec![Silence::new(Duration::from_secs(60), Duration::from_secs(62))])
    }
}

#[async_trait]
impl FileConverter for FakeBackend {
    async fn supports_conversion(&self, options: &ConversionOptions) -> bool {
        self.record("supports");
        options.format == "m4b"
    }

    async fn convert_file(&self, _options: &ConversionOptions) -> TagResult<ConversionJob> {
        self.record("convert");
        Err(TagError::Unsupported {
            backend: self.name,
            operation: "convert_file",
        })
    }
}

fn audio_file(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, b"not really audio").unwrap();
    path
}

fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[tokio::test]
async fn test_inactive_mp4_backend_falls_through_to_transcoder() {
    let dir = TempDir::new().unwrap();
    let file = audio_file(&dir, "book.m4b");
    let log = CallLog::default();

    let dispatcher = BackendDispatcher::new(Arc::new(FakeBackend::new("ffmpeg", &log)))
        .with_mp4(Arc::new(FakeBackend::new("mp4v2", &log).inactive()));

    dispatcher.read_tag(&file).await.unwrap();
    assert_eq!(calls(&log), vec!["ffmpeg:read"]);
}

#[tokio::test]
async fn test_mp4_backend_only_handles_mp4_family() {
    let dir = TempDir::new().unwrap();
    let m4b = audio_file(&dir, "book.M4B");
    let mp3 = audio_file(&dir, "book.mp3");
    let log = CallLog::default();

    let dispatcher = BackendDispatcher::new(Arc::new(FakeBackend::new("ffmpeg", &log)))
        .with_mp4(Arc::new(FakeBackend::new("mp4v2", &log)));

    dispatcher.read_tag(&m4b).await.unwrap();
    dispatcher.read_tag(&mp3).await.unwrap();
    assert_eq!(calls(&log), vec!["mp4v2:read", "ffmpeg:read"]);
}

#[tokio::test]
async fn test_alternate_is_exclusive_mp4_writer() {
    let dir = TempDir::new().unwrap();
    let m4b = audio_file(&dir, "book.m4b");
    let mp3 = audio_file(&dir, "book.mp3");
    let log = CallLog::default();

    let tone = Arc::new(FakeBackend::new("tone", &log));
    let written = tone.written.clone();
    let dispatcher = BackendDispatcher::new(Arc::new(FakeBackend::new("ffmpeg", &log)))
        .with_mp4(Arc::new(FakeBackend::new("mp4v2", &log)))
        .with_alternate(tone);

    let mut record = MetadataRecord {
        title: Some("Mort".to_string()),
        genre: Some("Fantasy".to_string()),
        description: Some("x".repeat(300)),
        ..Default::default()
    };
    record.remove_properties.insert("genre".to_string());

    dispatcher.write_tag(&m4b, &record, &TagFlags::default()).await.unwrap();
    dispatcher.write_tag(&mp3, &record, &TagFlags::default()).await.unwrap();

    assert_eq!(calls(&log), vec!["tone:write", "ffmpeg:write"]);

    let written = written.lock().unwrap();
    assert_eq!(written[0].genre, None, "Removals apply before writing");
    assert!(written[0].remove_properties.contains("genre"));
    assert_eq!(
        written[0].description.as_deref().map(str::len),
        Some(300),
        "Alternate writer receives the untruncated description"
    );
}

#[tokio::test]
async fn test_mp4_write_normalizes_descriptions() {
    let dir = TempDir::new().unwrap();
    let m4b = audio_file(&dir, "book.m4b");
    let log = CallLog::default();

    let mp4 = Arc::new(FakeBackend::new("mp4v2", &log));
    let written = mp4.written.clone();
    let dispatcher = BackendDispatcher::new(Arc::new(FakeBackend::new("ffmpeg", &log)))
        .with_mp4(mp4)
        .with_alternate(Arc::new(FakeBackend::new("tone", &log).inactive()));

    let long = "word ".repeat(100);
    let record = MetadataRecord {
        title: Some("Mort".to_string()),
        series: Some("Discworld".to_string()),
        series_part: Some("4".to_string()),
        description: Some(long.clone()),
        ..Default::default()
    };
    let flags = TagFlags {
        adjust_for_constrained_players: true,
        ..Default::default()
    };
    dispatcher.write_tag(&m4b, &record, &flags).await.unwrap();

    let written = written.lock().unwrap();
    let description = written[0].description.as_deref().unwrap();
    assert!(description.chars().count() <= 255);
    assert!(description.ends_with("..."));
    assert_eq!(written[0].long_description.as_deref(), Some(long.as_str()));
    assert_eq!(written[0].sort_title.as_deref(), Some("Discworld 4 - Mort"));
}

#[tokio::test]
async fn test_duration_candidate_order() {
    let dir = TempDir::new().unwrap();
    let file = audio_file(&dir, "book.m4b");
    let log = CallLog::default();

    let dispatcher = BackendDispatcher::new(Arc::new(FakeBackend::new("ffmpeg", &log).with_duration(30)))
        .with_mp4(Arc::new(FakeBackend::new("mp4v2", &log).with_duration(20)))
        .with_alternate(Arc::new(FakeBackend::new("tone", &log)));

    let duration = dispatcher.estimate_duration(&file).await.unwrap();
    assert_eq!(duration, Some(Duration::from_secs(20)));
    assert_eq!(calls(&log), vec!["tone:estimate", "mp4v2:estimate"]);
}

#[tokio::test]
async fn test_duration_falls_through_inactive_mp4_to_transcoder() {
    let dir = TempDir::new().unwrap();
    let file = audio_file(&dir, "book.m4b");
    let log = CallLog::default();

    let dispatcher = BackendDispatcher::new(Arc::new(FakeBackend::new("ffmpeg", &log).with_duration(30)))
        .with_mp4(Arc::new(FakeBackend::new("mp4v2", &log).with_duration(20).inactive()));

    let duration = dispatcher.estimate_duration(&file).await.unwrap();
    assert_eq!(duration, Some(Duration::from_secs(30)));
    assert_eq!(calls(&log), vec!["ffmpeg:estimate"]);
}

#[tokio::test]
async fn test_duration_none_when_nobody_knows() {
    let dir = TempDir::new().unwrap();
    let file = audio_file(&dir, "book.mp3");
    let log = CallLog::default();

    let dispatcher = BackendDispatcher::new(Arc::new(FakeBackend::new("ffmpeg", &log)))
        .with_mp4(Arc::new(FakeBackend::new("mp4v2", &log).with_duration(5)));

    assert_eq!(dispatcher.inspect_exact_duration(&file).await.unwrap(), None);
    assert_eq!(calls(&log), vec!["ffmpeg:exact"], "mp4 backend is skipped for mp3");
}

#[tokio::test]
async fn test_no_backend_when_transcoder_inactive() {
    let dir = TempDir::new().unwrap();
    let file = audio_file(&dir, "book.mp3");
    let log = CallLog::default();

    let dispatcher = BackendDispatcher::new(Arc::new(FakeBackend::new("ffmpeg", &log).inactive()));

    let err = dispatcher.read_tag(&file).await.unwrap_err();
    assert!(matches!(err, TagError::NoBackend(_)));
}

#[tokio::test]
async fn test_missing_source_is_reported() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let dispatcher = BackendDispatcher::new(Arc::new(FakeBackend::new("ffmpeg", &log)));

    let err = dispatcher
        .read_tag(&dir.path().join("missing.m4b"))
        .await
        .unwrap_err();
    assert!(matches!(err, TagError::SourceMissing(_)));
    assert!(calls(&log).is_empty());
}

#[tokio::test]
async fn test_convert_selects_first_supporting_converter() {
    let dir = TempDir::new().unwrap();
    let source = audio_file(&dir, "book.mp3");
    let log = CallLog::default();

    let dispatcher = BackendDispatcher::new(Arc::new(FakeBackend::new("ffmpeg", &log).converting()))
        .with_converter(Arc::new(FakeBackend::new("fdkaac", &log).converting().inactive()))
        .with_converter(Arc::new(FakeBackend::new("other", &log).converting()));

    let options = ConversionOptions {
        source,
        destination: dir.path().join("book.m4b"),
        format: "m4b".to_string(),
        ..Default::default()
    };
    let err = dispatcher.convert_file(&options).await.unwrap_err();

    assert!(matches!(err, TagError::Unsupported { backend: "other", .. }));
    assert_eq!(calls(&log), vec!["other:supports", "other:convert"]);
}

#[tokio::test]
async fn test_convert_refuses_existing_destination() {
    let dir = TempDir::new().unwrap();
    let source = audio_file(&dir, "book.mp3");
    let destination = audio_file(&dir, "book.m4b");
    let log = CallLog::default();
    let dispatcher = BackendDispatcher::new(Arc::new(FakeBackend::new("ffmpeg", &log).converting()));

    let mut options = ConversionOptions {
        source,
        destination,
        format: "m4b".to_string(),
        ..Default::default()
    };
    let err = dispatcher.convert_file(&options).await.unwrap_err();
    assert!(matches!(err, TagError::DestinationExists(_)));
    assert!(calls(&log).is_empty());

    options.force = true;
    options.format = "ogg".to_string();
    let err = dispatcher.convert_file(&options).await.unwrap_err();
    assert!(matches!(err, TagError::NoBackend(_)), "No converter supports ogg");
}

#[tokio::test]
async fn test_silences_are_cached_by_content() {
    let dir = TempDir::new().unwrap();
    let file = audio_file(&dir, "book.m4b");
    let log = CallLog::default();

    let dispatcher = BackendDispatcher::new(Arc::new(FakeBackend::new("ffmpeg", &log)))
        .with_cache(ResultCache::new(dir.path().join("cache"), Duration::from_secs(3600)));

    let first = dispatcher.detect_silences(&file, Duration::from_secs(2)).await.unwrap();
    let second = dispatcher.detect_silences(&file, Duration::from_secs(2)).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(calls(&log), vec!["ffmpeg:silences"]);

    dispatcher.detect_silences(&file, Duration::from_secs(3)).await.unwrap();
    assert_eq!(calls(&log).len(), 2, "Different parameters miss the cache");
}

#[tokio::test]
async fn test_export_description_honours_force() {
    let dir = TempDir::new().unwrap();
    let file = audio_file(&dir, "book.mp3");
    let log = CallLog::default();

    let tags = MetadataRecord {
        description: Some("Short".to_string()),
        long_description: Some("The long story".to_string()),
        ..Default::default()
    };
    let dispatcher = BackendDispatcher::new(Arc::new(FakeBackend::new("ffmpeg", &log).with_tags(tags)));

    let mut options = ExportOptions {
        prefix: Some("mort-".to_string()),
        ..Default::default()
    };
    let path = dispatcher.export_description(&file, &options).await.unwrap();
    assert_eq!(path, dir.path().join("mort-description.txt"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "The long story");

    let err = dispatcher.export_description(&file, &options).await.unwrap_err();
    assert!(matches!(err, TagError::DestinationExists(_)));

    options.force = true;
    dispatcher.export_description(&file, &options).await.unwrap();
}

#[tokio::test]
async fn test_export_chapters_falls_back_to_tags() {
    let dir = TempDir::new().unwrap();
    let file = audio_file(&dir, "book.mp3");
    let log = CallLog::default();

    let tags = MetadataRecord {
        chapters: vec![
            Chapter::new(Duration::ZERO, Duration::from_secs(90), "Opening"),
            Chapter::new(Duration::from_secs(90), Duration::from_secs(30), "Close"),
        ],
        ..Default::default()
    };
    let dispatcher = BackendDispatcher::new(Arc::new(FakeBackend::new("ffmpeg", &log).with_tags(tags)));

    let out = dir.path().join("out");
    let options = ExportOptions {
        directory: Some(out.clone()),
        ..Default::default()
    };
    let path = dispatcher.export_chapters(&file, &options).await.unwrap();
    assert_eq!(path.parent(), Some(out.as_path()));

    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(bookmeta_tag::codecs::chapter_list::parse(&text).len(), 2);
}

#[tokio::test]
async fn test_import_chapters_uses_chapter_capability() {
    let dir = TempDir::new().unwrap();
    let file = audio_file(&dir, "book.mp3");
    let list = dir.path().join("book.chapters.txt");
    std::fs::write(&list, "00:00:00.000 One\n00:05:00.000 Two\n").unwrap();
    let log = CallLog::default();

    let ffmpeg = Arc::new(FakeBackend::new("ffmpeg", &log).with_chapter_access());
    let written = ffmpeg.written.clone();
    let dispatcher = BackendDispatcher::new(ffmpeg);

    dispatcher.import_chapters(&file, &list, &TagFlags::default()).await.unwrap();

    assert_eq!(calls(&log), vec!["ffmpeg:write_chapters"]);
    let written = written.lock().unwrap();
    assert_eq!(written[0].chapters.len(), 2);
    assert_eq!(written[0].chapters[1].start(), Duration::from_secs(300));
}

#[tokio::test]
async fn test_import_chapters_goes_through_alternate_writer() {
    let dir = TempDir::new().unwrap();
    let file = audio_file(&dir, "book.m4b");
    let list = dir.path().join("book.chapters.txt");
    std::fs::write(&list, "00:00:00.000 One\n").unwrap();
    let log = CallLog::default();

    let dispatcher = BackendDispatcher::new(Arc::new(FakeBackend::new("ffmpeg", &log).with_chapter_access()))
        .with_mp4(Arc::new(FakeBackend::new("mp4v2", &log).with_chapter_access()))
        .with_alternate(Arc::new(FakeBackend::new("tone", &log)));

    dispatcher.import_chapters(&file, &list, &TagFlags::default()).await.unwrap();
    assert_eq!(calls(&log), vec!["tone:write"]);
}

#[tokio::test]
async fn test_empty_chapter_import_clears_only_with_force() {
    let dir = TempDir::new().unwrap();
    let file = audio_file(&dir, "book.mp3");
    let list = dir.path().join("book.chapters.txt");
    std::fs::write(&list, "# nothing here\n").unwrap();
    let log = CallLog::default();

    let dispatcher = BackendDispatcher::new(Arc::new(FakeBackend::new("ffmpeg", &log).with_chapter_access()));

    dispatcher.import_chapters(&file, &list, &TagFlags::default()).await.unwrap();
    assert!(calls(&log).is_empty(), "Empty list leaves the file alone");

    let forced = TagFlags {
        force: true,
        ..Default::default()
    };
    dispatcher.import_chapters(&file, &list, &forced).await.unwrap();
    assert_eq!(calls(&log), vec!["ffmpeg:write_chapters"]);
}

#[tokio::test]
async fn test_import_chapters_reads_latin1_lists() {
    let dir = TempDir::new().unwrap();
    let file = audio_file(&dir, "book.mp3");
    let list = dir.path().join("book.chapters.txt");
    std::fs::write(&list, b"00:00:00.000 Caf\xE9\n").unwrap();
    let log = CallLog::default();

    let ffmpeg = Arc::new(FakeBackend::new("ffmpeg", &log).with_chapter_access());
    let written = ffmpeg.written.clone();
    let dispatcher = BackendDispatcher::new(ffmpeg);

    dispatcher.import_chapters(&file, &list, &TagFlags::default()).await.unwrap();
    assert_eq!(written.lock().unwrap()[0].chapters[0].name, "Caf\u{FFFD}");
}

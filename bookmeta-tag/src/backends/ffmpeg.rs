//! ffmpeg / ffprobe backend
//!
//! Handles every container ffmpeg can mux, which makes it the catch-all
//! transcoder of the dispatcher. Tags are read as an ffmetadata dump and
//! written by remuxing with a temporary ffmetadata import map.

use super::{
    dotted_extension, seconds_arg, sibling_temp_path, Backend, ChapterAccess, ConversionJob,
    CoverAccess, DurationProbe, FileConverter, Silence, SilenceDetection, TagAccess, Tool,
};
use crate::codecs::ffmetadata;
use crate::error::{TagError, TagResult};
use crate::options::{ConversionOptions, TagFlags};
use crate::quality::percent_to_value;
use crate::record::{Chapter, Cover, MetadataRecord};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::ffi::OsStr;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info};

/// Noise floor below which audio counts as silent
const SILENCE_NOISE_DB: i32 = -30;

static SILENCE_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"silence_start:\s*(-?[0-9]+(?:\.[0-9]+)?)").expect("valid regex"));
static SILENCE_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"silence_end:\s*(-?[0-9]+(?:\.[0-9]+)?)").expect("valid regex"));
static PROGRESS_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"time=([0-9]+):([0-9]{2}):([0-9]{2}(?:\.[0-9]+)?)").expect("valid regex"));

/// ffmpeg-based backend
#[derive(Debug)]
pub struct FfmpegBackend {
    ffmpeg: Tool,
    ffprobe: Tool,
}

impl FfmpegBackend {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: Tool::new(ffmpeg),
            ffprobe: Tool::new(ffprobe),
        }
    }

    /// Build the encoder arguments for a conversion
    pub fn encoder_args(options: &ConversionOptions) -> Vec<String> {
        let mut args = Vec::new();
        let codec = options
            .codec
            .clone()
            .unwrap_or_else(|| default_codec(&options.format).to_string());

        args.extend(["-c:a".to_string(), codec.clone()]);

        if let Some(profile) = &options.profile {
            args.extend(["-profile:a".to_string(), profile.clone()]);
        }

        if options.is_vbr() {
            match codec.as_str() {
                "libmp3lame" => args.extend([
                    "-q:a".to_string(),
                    percent_to_value(options.vbr_quality, 9.0, 0.0, 0).to_string(),
                ]),
                "libfdk_aac" => args.extend([
                    "-vbr".to_string(),
                    percent_to_value(options.vbr_quality, 1.0, 5.0, 0).to_string(),
                ]),
                _ => args.extend([
                    "-q:a".to_string(),
                    percent_to_value(options.vbr_quality, 0.1, 2.0, 1).to_string(),
                ]),
            }
        } else if let Some(kbps) = options.bitrate_kbps {
            args.extend(["-b:a".to_string(), format!("{}k", kbps)]);
        }

        if let Some(rate) = options.sample_rate {
            args.extend(["-ar".to_string(), rate.to_string()]);
        }
        if let Some(channels) = options.channels {
            args.extend(["-ac".to_string(), channels.to_string()]);
        }
        args
    }

    async fn probe_format_duration(&self, file: &Path) -> TagResult<Option<Duration>> {
        let stdout = self
            .ffprobe
            .run_stdout([
                OsStr::new("-v"),
                OsStr::new("error"),
                OsStr::new("-show_entries"),
                OsStr::new("format=duration"),
                OsStr::new("-of"),
                OsStr::new("default=noprint_wrappers=1:nokey=1"),
                file.as_os_str(),
            ])
            .await?;
        Ok(parse_seconds(stdout.trim()))
    }
}

/// Default encoder for a target container
pub fn default_codec(format: &str) -> &'static str {
    match format.to_ascii_lowercase().as_str() {
        "mp3" => "libmp3lame",
        "ogg" | "oga" => "libvorbis",
        "opus" => "libopus",
        "flac" => "flac",
        "wav" => "pcm_s16le",
        _ => "aac",
    }
}

/// ffmpeg muxer name for a target container
pub fn muxer(format: &str) -> String {
    match format.to_ascii_lowercase().as_str() {
        "m4b" | "m4a" | "mp4" | "m4r" | "m4p" => "ipod".to_string(),
        "oga" => "ogg".to_string(),
        other => other.to_string(),
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let secs: f64 = value.parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

/// Silences reported by the `silencedetect` filter on stderr
///
/// A trailing `silence_start` without matching end runs to the end of the
/// stream and is dropped, since its length is unknown.
pub fn parse_silences(stderr: &str) -> Vec<Silence> {
    let mut silences = Vec::new();
    let mut pending: Option<Duration> = None;

    for line in stderr.lines() {
        if let Some(caps) = SILENCE_START.captures(line) {
            let start = caps[1].parse::<f64>().unwrap_or(0.0).max(0.0);
            pending = Some(Duration::from_secs_f64(start));
        } else if let Some(caps) = SILENCE_END.captures(line) {
            let end = caps[1].parse::<f64>().unwrap_or(0.0).max(0.0);
            if let Some(start) = pending.take() {
                silences.push(Silence::new(start, Duration::from_secs_f64(end)));
            }
        }
    }
    silences
}

/// Last `time=HH:MM:SS.xx` progress value on stderr
pub fn parse_progress_time(stderr: &str) -> Option<Duration> {
    let caps = PROGRESS_TIME.captures_iter(stderr).last()?;
    let hours: u64 = caps[1].parse().ok()?;
    let minutes: u64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    Some(Duration::from_secs(hours * 3600 + minutes * 60) + Duration::from_secs_f64(seconds))
}

#[async_trait]
impl Backend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn is_active(&self) -> bool {
        self.ffmpeg.is_available().await && self.ffprobe.is_available().await
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

    fn silence_detection(&self) -> Option<&dyn SilenceDetection> {
        Some(self)
    }

    fn file_converter(&self) -> Option<&dyn FileConverter> {
        Some(self)
    }
}

#[async_trait]
impl DurationProbe for FfmpegBackend {
    async fn estimate_duration(&self, file: &Path) -> TagResult<Option<Duration>> {
        self.probe_format_duration(file).await
    }

    async fn inspect_exact_duration(&self, file: &Path) -> TagResult<Option<Duration>> {
        let output = self
            .ffmpeg
            .run([
                OsStr::new("-hide_banner"),
                OsStr::new("-i"),
                file.as_os_str(),
                OsStr::new("-vn"),
                OsStr::new("-f"),
                OsStr::new("null"),
                OsStr::new("-"),
            ])
            .await?;
        Ok(parse_progress_time(&String::from_utf8_lossy(&output.stderr)))
    }
}

#[async_trait]
impl TagAccess for FfmpegBackend {
    async fn read_tag(&self, file: &Path) -> TagResult<MetadataRecord> {
        if !file.exists() {
            return Err(TagError::SourceMissing(file.to_path_buf()));
        }
        let output = self
            .ffmpeg
            .run([
                OsStr::new("-hide_banner"),
                OsStr::new("-i"),
                file.as_os_str(),
                OsStr::new("-f"),
                OsStr::new("ffmetadata"),
                OsStr::new("-"),
            ])
            .await?;

        let mut record = ffmetadata::parse(&String::from_utf8_lossy(&output.stdout));
        if String::from_utf8_lossy(&output.stderr).contains("(attached pic)") {
            record.cover = Some(Cover::Embedded);
        }
        debug!(file = %file.display(), chapters = record.chapters.len(), "Read tags with ffmpeg");
        Ok(record)
    }

    async fn write_tag(&self, file: &Path, record: &MetadataRecord, flags: &TagFlags) -> TagResult<()> {
        if !file.exists() {
            return Err(TagError::SourceMissing(file.to_path_buf()));
        }

        // ffmpeg rewrites the whole container, so unchanged tags must be carried over
        let mut merged = self.read_tag(file).await?;
        merged.merge_overwrite(record);
        merged.apply_removals();

        let mut import_map = tempfile::Builder::new()
            .prefix("bookmeta-ffmetadata-")
            .suffix(".txt")
            .tempfile()?;
        import_map.write_all(ffmetadata::build(&merged).as_bytes())?;
        let import_map = import_map.into_temp_path();

        let staged = sibling_temp_path(file, &dotted_extension(file))?;
        let cover_file = match &merged.cover {
            Some(Cover::File(path)) if path.exists() => Some(path.clone()),
            _ => None,
        };

        let mut command = self.ffmpeg.command();
        command.args(["-hide_banner", "-y", "-i"]).arg(file).arg("-i").arg(&*import_map);
        if let Some(cover) = &cover_file {
            command.arg("-i").arg(cover);
        }
        command.args(["-map", "0:a", "-map_metadata", "1", "-map_chapters", "1"]);
        match &cover_file {
            Some(_) => {
                command.args(["-map", "2:v", "-disposition:v:0", "attached_pic"]);
            }
            None if matches!(merged.cover, Some(Cover::Embedded)) => {
                command.args(["-map", "0:v?"]);
            }
            None => {}
        }
        command
            .args(["-c", "copy", "-f"])
            .arg(muxer(dotted_extension(file).trim_start_matches('.')))
            .arg(&*staged)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!(command = ?command.as_std(), "Remuxing with new metadata");
        let output = command.output().await?;
        if !output.status.success() {
            return Err(TagError::ToolFailed {
                tool: self.ffmpeg.program().to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        staged.persist(file).map_err(|e| TagError::Io(e.error))?;
        if flags.debug {
            if let Ok(kept) = import_map.keep() {
                debug!(file = %kept.display(), "Keeping ffmetadata import map");
            }
        }

        info!(file = %file.display(), "Wrote tags with ffmpeg");
        Ok(())
    }
}

#[async_trait]
impl CoverAccess for FfmpegBackend {
    async fn export_cover(&self, file: &Path, destination: &Path) -> TagResult<()> {
        self.ffmpeg
            .run([
                OsStr::new("-hide_banner"),
                OsStr::new("-y"),
                OsStr::new("-i"),
                file.as_os_str(),
                OsStr::new("-an"),
                OsStr::new("-map"),
                OsStr::new("0:v:0"),
                OsStr::new("-c:v"),
                OsStr::new("copy"),
                OsStr::new("-f"),
                OsStr::new("image2"),
                destination.as_os_str(),
            ])
            .await?;
        Ok(())
    }

    async fn import_cover(&self, file: &Path, cover: &Path) -> TagResult<()> {
        let record = MetadataRecord {
            cover: Some(Cover::File(cover.to_path_buf())),
            ..Default::default()
        };
        self.write_tag(file, &record, &TagFlags::default()).await
    }
}

#[async_trait]
impl ChapterAccess for FfmpegBackend {
    async fn read_chapters(&self, file: &Path) -> TagResult<Vec<Chapter>> {
        Ok(self.read_tag(file).await?.chapters)
    }

    async fn write_chapters(&self, file: &Path, chapters: &[Chapter]) -> TagResult<()> {
        let mut record = MetadataRecord::default();
        record.chapters = chapters.to_vec();
        if chapters.is_empty() {
            record.remove_properties.insert("chapters".to_string());
        }
        self.write_tag(file, &record, &TagFlags::default()).await
    }
}

#[async_trait]
impl SilenceDetection for FfmpegBackend {
    async fn detect_silences(&self, file: &Path, min_length: Duration) -> TagResult<Vec<Silence>> {
        let filter = format!(
            "silencedetect=noise={}dB:d={}",
            SILENCE_NOISE_DB,
            seconds_arg(min_length)
        );
        let output = self
            .ffmpeg
            .run([
                OsStr::new("-hide_banner"),
                OsStr::new("-nostats"),
                OsStr::new("-i"),
                file.as_os_str(),
                OsStr::new("-vn"),
                OsStr::new("-af"),
                OsStr::new(&filter),
                OsStr::new("-f"),
                OsStr::new("null"),
                OsStr::new("-"),
            ])
            .await?;

        let silences = parse_silences(&String::from_utf8_lossy(&output.stderr));
        debug!(file = %file.display(), count = silences.len(), "Detected silences");
        Ok(silences)
    }
}

#[async_trait]
impl FileConverter for FfmpegBackend {
    async fn supports_conversion(&self, _options: &ConversionOptions) -> bool {
        true
    }

    async fn convert_file(&self, options: &ConversionOptions) -> TagResult<ConversionJob> {
        if !options.source.exists() {
            return Err(TagError::SourceMissing(options.source.clone()));
        }

        let staged = sibling_temp_path(&options.destination, &format!(".{}", options.format))?;

        let mut command = self.ffmpeg.command();
        command.args(["-hide_banner", "-nostats", "-y"]);
        if let Some(start) = options.trim_start {
            command.arg("-ss").arg(seconds_arg(start));
        }
        command.arg("-i").arg(&options.source);
        if let Some(length) = options.trim_length {
            command.arg("-t").arg(seconds_arg(length));
        }
        command
            .args(["-vn", "-map_metadata", "0"])
            .args(Self::encoder_args(options))
            .arg("-f")
            .arg(muxer(&options.format))
            .arg(&*staged)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        info!(
            source = %options.source.display(),
            destination = %options.destination.display(),
            "Converting with ffmpeg"
        );
        let child = command.spawn()?;

        Ok(ConversionJob::new(self.ffmpeg.program(), child, staged, options.destination.clone())
            .keep_temp_files(options.debug))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_silences() {
        let stderr = "\
[silencedetect @ 0x1] silence_start: 12.5
[silencedetect @ 0x1] silence_end: 15.25 | silence_duration: 2.75
size=N/A time=00:01:00.00 bitrate=N/A
[silencedetect @ 0x1] silence_start: -0.01
[silencedetect @ 0x1] silence_end: 2 | silence_duration: 2.01
[silencedetect @ 0x1] silence_start: 58";
        let silences = parse_silences(stderr);

        assert_eq!(silences.len(), 2, "Unterminated silence is dropped");
        assert_eq!(silences[0].start, Duration::from_millis(12_500));
        assert_eq!(silences[0].end, Duration::from_millis(15_250));
        assert_eq!(silences[1].start, Duration::ZERO, "Negative starts clamp to zero");
    }

    #[test]
    fn test_parse_progress_time_takes_last() {
        let stderr = "size=1 time=00:00:10.00 bitrate=x\nsize=2 time=01:02:03.50 bitrate=x\n";
        assert_eq!(
            parse_progress_time(stderr),
            Some(Duration::from_millis(3_723_500))
        );
        assert_eq!(parse_progress_time("no progress"), None);
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds("2090.921000"), Some(Duration::from_secs_f64(2090.921)));
        assert_eq!(parse_seconds("N/A"), None);
    }

    #[test]
    fn test_encoder_args_cbr() {
        let options = ConversionOptions {
            format: "m4b".to_string(),
            bitrate_kbps: Some(64),
            sample_rate: Some(22050),
            channels: Some(1),
            ..Default::default()
        };
        assert_eq!(
            FfmpegBackend::encoder_args(&options),
            vec!["-c:a", "aac", "-b:a", "64k", "-ar", "22050", "-ac", "1"]
        );
    }

    #[test]
    fn test_encoder_args_vbr_scales_per_codec() {
        let mp3 = ConversionOptions {
            format: "mp3".to_string(),
            vbr_quality: 100.0,
            ..Default::default()
        };
        assert_eq!(FfmpegBackend::encoder_args(&mp3), vec!["-c:a", "libmp3lame", "-q:a", "0"]);

        let fdk = ConversionOptions {
            format: "m4b".to_string(),
            codec: Some("libfdk_aac".to_string()),
            vbr_quality: 50.0,
            ..Default::default()
        };
        assert_eq!(FfmpegBackend::encoder_args(&fdk), vec!["-c:a", "libfdk_aac", "-vbr", "3"]);
    }

    #[test]
    fn test_muxer_names() {
        assert_eq!(muxer("m4b"), "ipod");
        assert_eq!(muxer("MP3"), "mp3");
        assert_eq!(muxer("oga"), "ogg");
    }
}

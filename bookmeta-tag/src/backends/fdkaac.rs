//! fdkaac converter
//!
//! fdkaac only reads WAV, so conversion runs in two steps: ffmpeg stages
//! the (trimmed, resampled) source as a temporary WAV, then fdkaac encodes
//! it. Preferred over ffmpeg's native AAC encoder for the HE profiles.

use super::{seconds_arg, sibling_temp_path, Backend, ConversionJob, FileConverter, Tool};
use crate::error::{TagError, TagResult};
use crate::options::ConversionOptions;
use crate::quality::percent_to_value;
use async_trait::async_trait;
use std::ffi::OsString;
use std::process::Stdio;
use tracing::info;

/// Containers fdkaac can write
const MP4_FORMATS: &[&str] = &["m4b", "m4a", "mp4"];

/// Profiles that trigger fdkaac when no codec is named
const HE_PROFILES: &[&str] = &["aac_he", "aac_he_v2"];

/// fdkaac-based converter
#[derive(Debug)]
pub struct FdkaacBackend {
    fdkaac: Tool,
    ffmpeg: Tool,
}

impl FdkaacBackend {
    pub fn new(fdkaac: impl Into<String>, ffmpeg: impl Into<String>) -> Self {
        Self {
            fdkaac: Tool::new(fdkaac),
            ffmpeg: Tool::new(ffmpeg),
        }
    }

    /// fdkaac audio object type for an ffmpeg-style profile name
    pub fn profile_number(profile: Option<&str>) -> u32 {
        match profile.map(str::to_ascii_lowercase).as_deref() {
            Some("aac_he") => 5,
            Some("aac_he_v2") => 29,
            _ => 2,
        }
    }

    /// Whether `options` ask for an fdkaac encode: an mp4 container, the
    /// fdkaac codec or an HE profile, and a target bitrate
    ///
    /// VBR requests carry no bitrate after quality resolution and are left
    /// to the transcoder.
    pub fn accepts(options: &ConversionOptions) -> bool {
        let format_ok = MP4_FORMATS.iter().any(|f| options.format.eq_ignore_ascii_case(f));
        let wanted = match options.codec.as_deref() {
            Some(codec) => codec.eq_ignore_ascii_case("libfdk_aac") || codec.eq_ignore_ascii_case("fdkaac"),
            None => options.has_profile(HE_PROFILES),
        };
        format_ok && wanted && options.bitrate_kbps.is_some()
    }

    /// Encoder arguments; input and output are appended by the caller
    pub fn encoder_args(options: &ConversionOptions) -> Vec<String> {
        let mut args = vec![
            "--silent".to_string(),
            "-p".to_string(),
            Self::profile_number(options.profile.as_deref()).to_string(),
        ];
        if options.is_vbr() {
            args.push("-m".to_string());
            args.push(percent_to_value(options.vbr_quality, 1.0, 5.0, 0).to_string());
        } else if let Some(kbps) = options.bitrate_kbps {
            args.push("-b".to_string());
            args.push((kbps * 1000).to_string());
        }
        args
    }
}

#[async_trait]
impl Backend for FdkaacBackend {
    fn name(&self) -> &'static str {
        "fdkaac"
    }

    async fn is_active(&self) -> bool {
        self.fdkaac.is_available().await && self.ffmpeg.is_available().await
    }

    fn file_converter(&self) -> Option<&dyn FileConverter> {
        Some(self)
    }
}

#[async_trait]
impl FileConverter for FdkaacBackend {
    async fn supports_conversion(&self, options: &ConversionOptions) -> bool {
        Self::accepts(options) && self.is_active().await
    }

    async fn convert_file(&self, options: &ConversionOptions) -> TagResult<ConversionJob> {
        if !options.source.exists() {
            return Err(TagError::SourceMissing(options.source.clone()));
        }

        let wav = match &options.temp_dir {
            Some(dir) => tempfile::Builder::new().prefix("bookmeta-").suffix(".wav").tempfile_in(dir)?,
            None => tempfile::Builder::new().prefix("bookmeta-").suffix(".wav").tempfile()?,
        }
        .into_temp_path();

        let mut stage: Vec<OsString> = vec!["-hide_banner".into(), "-nostats".into(), "-y".into()];
        if let Some(start) = options.trim_start {
            stage.push("-ss".into());
            stage.push(seconds_arg(start).into());
        }
        stage.push("-i".into());
        stage.push(options.source.as_os_str().to_os_string());
        if let Some(length) = options.trim_length {
            stage.push("-t".into());
            stage.push(seconds_arg(length).into());
        }
        stage.push("-vn".into());
        if let Some(rate) = options.sample_rate {
            stage.push("-ar".into());
            stage.push(rate.to_string().into());
        }
        if let Some(channels) = options.channels {
            stage.push("-ac".into());
            stage.push(channels.to_string().into());
        }
        stage.push("-f".into());
        stage.push("wav".into());
        stage.push(wav.as_os_str().to_os_string());

        info!(source = %options.source.display(), "Staging WAV for fdkaac");
        self.ffmpeg.run(stage).await?;

        let staged = sibling_temp_path(&options.destination, &format!(".{}", options.format))?;
        let mut command = self.fdkaac.command();
        command
            .args(Self::encoder_args(options))
            .arg("-o")
            .arg(&*staged)
            .arg(&*wav)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        info!(destination = %options.destination.display(), "Encoding with fdkaac");
        let child = command.spawn()?;

        Ok(
            ConversionJob::new(self.fdkaac.program(), child, staged, options.destination.clone())
                .with_intermediate(wav)
                .keep_temp_files(options.debug),
        )
    }
}

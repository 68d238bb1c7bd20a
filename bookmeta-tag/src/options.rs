//! Operation options shared by the dispatcher and backends

use std::path::PathBuf;

/// Behaviour switches for tag writes and exports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagFlags {
    /// Let an empty chapter import clear the existing chapters
    pub force: bool,
    /// Keep temporary files (import maps, staged audio) for inspection
    pub debug: bool,
    /// Derive series-ordered sort names for players that only sort by title
    pub adjust_for_constrained_players: bool,
    /// Reuse existing companion files (`<basename>.chapters.txt`, cover) instead of regenerating them
    pub use_existing_files: bool,
    /// Prefix the long description with `"<series> <part>"`
    pub prepend_series_to_long_description: bool,
}

/// Where and how to export a companion file
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Explicit destination file; overrides directory and prefix
    pub destination: Option<PathBuf>,
    /// Directory for the default file name (defaults to the input's directory)
    pub directory: Option<PathBuf>,
    /// Distinguishing prefix when exporting many books into one directory
    pub prefix: Option<String>,
    pub force: bool,
}

/// Audio conversion request
#[derive(Debug, Clone, Default)]
pub struct ConversionOptions {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Target container extension (`m4b`, `mp3`, ...)
    pub format: String,
    /// Requested encoder (`aac`, `libfdk_aac`, `libmp3lame`)
    pub codec: Option<String>,
    /// Encoder profile (`aac_low`, `aac_he`, `aac_he_v2`)
    pub profile: Option<String>,
    pub bitrate_kbps: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
    /// VBR quality in percent; zero or below means constant bitrate
    pub vbr_quality: f64,
    /// Start offset of the excerpt to convert
    pub trim_start: Option<std::time::Duration>,
    /// Length of the excerpt to convert
    pub trim_length: Option<std::time::Duration>,
    pub force: bool,
    pub debug: bool,
    /// Staging directory for intermediate files
    pub temp_dir: Option<PathBuf>,
}

impl ConversionOptions {
    pub fn is_vbr(&self) -> bool {
        self.vbr_quality > 0.0
    }

    /// Case-insensitive profile check
    pub fn has_profile(&self, profiles: &[&str]) -> bool {
        self.profile
            .as_deref()
            .map_or(false, |p| profiles.iter().any(|candidate| p.eq_ignore_ascii_case(candidate)))
    }
}

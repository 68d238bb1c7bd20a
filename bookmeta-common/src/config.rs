//! Configuration loading and resolution
//!
//! Configuration file resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`BOOKMETA_CONFIG`)
//! 3. User config file (`~/.config/bookmeta/config.toml`)
//! 4. Compiled defaults (fallback)
//!
//! A missing config file is never fatal: defaults are used and a warning is logged.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "BOOKMETA_CONFIG";

/// Configuration loaded from TOML file
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct TomlConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// External tool locations
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Result cache for expensive tool runs
    #[serde(default)]
    pub cache: CacheConfig,

    /// Encoding quality defaults
    #[serde(default)]
    pub quality: QualityConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Executable names or paths for every backend tool
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub mp4info: String,
    pub mp4tags: String,
    pub mp4chaps: String,
    pub mp4art: String,
    pub tone: String,
    pub fdkaac: String,
    /// Use tone for durations and mp4 tag writes when installed
    pub prefer_tone: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            mp4info: "mp4info".to_string(),
            mp4tags: "mp4tags".to_string(),
            mp4chaps: "mp4chaps".to_string(),
            mp4art: "mp4art".to_string(),
            tone: "tone".to_string(),
            fdkaac: "fdkaac".to_string(),
            prefer_tone: true,
        }
    }
}

/// Result cache configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory (OS cache dir when unset)
    pub dir: Option<PathBuf>,
    /// Entry lifetime in seconds
    pub ttl_seconds: u64,
    /// Disable the cache entirely
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            ttl_seconds: 7 * 24 * 3600,
            enabled: true,
        }
    }
}

impl CacheConfig {
    /// Cache directory, falling back to `<os cache dir>/bookmeta`
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .map(|d| d.join("bookmeta"))
                .unwrap_or_else(|| std::env::temp_dir().join("bookmeta-cache"))
        })
    }
}

/// Encoding quality defaults
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct QualityConfig {
    /// Target bitrate (kbps) when neither bitrate nor sample rate is requested
    pub default_bitrate_kbps: u32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            default_bitrate_kbps: 64,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolve which config file to read, if any
///
/// Returns `None` when no candidate exists; callers then use defaults.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: User config file
    default_config_path().filter(|p| p.exists())
}

/// Platform config file location (`<config dir>/bookmeta/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("bookmeta").join("config.toml"))
}

/// Load configuration following the resolution priority
///
/// An explicitly named file (CLI or env) that cannot be read or parsed is an error.
/// An absent default file yields compiled defaults.
pub fn load_config(cli_arg: Option<&Path>) -> Result<TomlConfig> {
    match resolve_config_path(cli_arg) {
        Some(path) => {
            let config = read_toml_config(&path)?;
            info!("Loaded configuration from {}", path.display());
            Ok(config)
        }
        None => {
            warn!("No config file found, using built-in defaults");
            Ok(TomlConfig::default())
        }
    }
}

/// Read and parse a TOML config file
pub fn read_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;
    let config = toml::from_str(&content)?;
    Ok(config)
}

/// Write configuration atomically (temp file in the same directory, then rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(content.as_bytes())?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TomlConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.tools.ffmpeg, "ffmpeg");
        assert!(config.tools.prefer_tone);
        assert_eq!(config.quality.default_bitrate_kbps, 64);
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: TomlConfig = toml::from_str(
            r#"
            [tools]
            ffmpeg = "/opt/ffmpeg/bin/ffmpeg"
            prefer_tone = false
            "#,
        )
        .unwrap();

        assert_eq!(config.tools.ffmpeg, "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(config.tools.ffprobe, "ffprobe");
        assert!(!config.tools.prefer_tone);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_cli_argument_wins() {
        let path = PathBuf::from("/tmp/explicit.toml");
        assert_eq!(resolve_config_path(Some(&path)), Some(path));
    }
}

//! Configuration resolution and persistence tests
//!
//! Tests that manipulate BOOKMETA_CONFIG are marked with #[serial]
//! so they never race each other.

use bookmeta_common::config::{
    load_config, read_toml_config, resolve_config_path, write_toml_config, TomlConfig,
    CONFIG_ENV_VAR,
};
use serial_test::serial;
use std::env;
use tempfile::TempDir;

#[test]
#[serial]
fn test_env_var_used_when_no_cli_argument() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("from-env.toml");
    std::fs::write(&path, "[logging]\nlevel = \"debug\"\n").unwrap();

    env::set_var(CONFIG_ENV_VAR, &path);
    let resolved = resolve_config_path(None);
    let config = load_config(None).unwrap();
    env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(resolved, Some(path));
    assert_eq!(config.logging.level, "debug");
}

#[test]
#[serial]
fn test_cli_argument_beats_env_var() {
    let dir = TempDir::new().unwrap();
    let cli = dir.path().join("cli.toml");
    let from_env = dir.path().join("env.toml");
    std::fs::write(&cli, "[quality]\ndefault_bitrate_kbps = 96\n").unwrap();
    std::fs::write(&from_env, "[quality]\ndefault_bitrate_kbps = 32\n").unwrap();

    env::set_var(CONFIG_ENV_VAR, &from_env);
    let config = load_config(Some(&cli)).unwrap();
    env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(config.quality.default_bitrate_kbps, 96);
}

#[test]
#[serial]
fn test_explicit_missing_file_is_an_error() {
    env::remove_var(CONFIG_ENV_VAR);
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope.toml");
    assert!(load_config(Some(&missing)).is_err());
}

#[test]
fn test_malformed_toml_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[tools\nffmpeg = ").unwrap();
    assert!(read_toml_config(&path).is_err());
}

#[test]
fn test_write_then_read_preserves_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut config = TomlConfig::default();
    config.tools.tone = "/usr/local/bin/tone".to_string();
    config.cache.ttl_seconds = 60;

    write_toml_config(&config, &path).unwrap();
    let loaded = read_toml_config(&path).unwrap();

    assert_eq!(loaded, config);
    // no temp files left behind next to the config
    let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
    assert_eq!(entries, 1);
}

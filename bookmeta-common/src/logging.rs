//! Logging bootstrap
//!
//! Installs a `tracing` fmt subscriber. `RUST_LOG` overrides the configured level.

use crate::{Error, Result};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
///
/// # Arguments
/// * `level` - Default filter directive (e.g. "info", "bookmeta_tag=debug")
pub fn init(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::Config(format!("Invalid log level '{}': {}", level, e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to install subscriber: {}", e)))
}

//! # bookmeta common library
//!
//! Shared code for the bookmeta crates:
//! - Error type
//! - Configuration loading (TOML)
//! - Logging bootstrap
//! - Timecode parsing and formatting

pub mod config;
pub mod error;
pub mod logging;
pub mod timecode;

pub use error::{Error, Result};

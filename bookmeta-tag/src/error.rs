//! Error types for bookmeta-tag
//!
//! Only precondition failures and "no backend remains" surface as errors.
//! Absent companion data, inactive tools, malformed lines and undetectable
//! text encodings are logged and degrade gracefully instead.

use std::path::PathBuf;
use thiserror::Error;

/// Tagging error type
#[derive(Debug, Error)]
pub enum TagError {
    /// Export target exists and force was not given
    #[error("Destination already exists: {} (use force to overwrite)", .0.display())]
    DestinationExists(PathBuf),

    /// Input file or directory does not exist
    #[error("Source not found: {}", .0.display())]
    SourceMissing(PathBuf),

    /// No installed backend can perform the operation
    #[error("No backend available for {0}")]
    NoBackend(String),

    /// Backend does not implement the requested operation
    #[error("{backend} does not support {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// External tool exited unsuccessfully
    #[error("{tool} failed ({status}): {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    /// Tool output or document could not be interpreted
    #[error("Parse error: {0}")]
    Parse(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Cache entry could not be (de)serialized
    #[error("Cache error: {0}")]
    Cache(#[from] serde_json::Error),

    /// bookmeta-common error
    #[error("Common error: {0}")]
    Common(#[from] bookmeta_common::Error),
}

/// Result type for tagging operations
pub type TagResult<T> = Result<T, TagError>;

//! Custom error types for the backup engine.
//!
//! Only session-level failures travel through this type to the caller.
//! Per-entry failures are recorded in the run report instead.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source root does not exist: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("Destination unreachable: {0}")]
    DestinationUnreachable(String),

    #[error("Failed to list destination: {0}")]
    DestinationListing(String),

    #[error("Unsupported compression format: {0}")]
    UnsupportedFormat(String),

    #[error("State directory error: {0}")]
    State(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Operation timed out after {0}s")]
    Timeout(u64),

    #[error("Remote command failed (exit {status}): {output}")]
    RemoteCommand { status: i32, output: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;

//! Error types for packrat.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by storage backends, tagged with a kind code.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage unreachable: {0}")]
    Unreachable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Copied object '{0}' not found after copy, source kept")]
    CopyNotVerified(String),

    #[error("Batch of {0} objects exceeds the backend delete limit")]
    BatchTooLarge(usize),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(err.to_string()),
            _ => StorageError::Transport(err.to_string()),
        }
    }
}

/// Crate-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not a file or directory: {0}")]
    InvalidSource(PathBuf),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Restore error: {0}")]
    Restore(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

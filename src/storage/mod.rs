//! Storage backends and the inventory model built on top of them.
//!
//! A backend is one place archives can live. The two implementations are a
//! local filesystem directory and an S3-compatible bucket; both speak the
//! same synchronous [`StorageBackend`] contract, so the orchestrator never
//! cares which one it is talking to.

mod local;
mod s3;

pub use local::LocalStorage;
pub use s3::{S3Config, S3Storage};

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::DateTime;
use chrono_tz::Tz;

use crate::error::StorageError;
use crate::naming::ParsedName;

/// Which backend holds a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Local,
    Aws,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Local => f.write_str("local"),
            StorageKind::Aws => f.write_str("aws"),
        }
    }
}

/// One addressable archive in a storage location.
///
/// Immutable except through rename; delete destroys it.
#[derive(Debug, Clone)]
pub struct Backup {
    pub kind: StorageKind,
    /// Filename for local backups, bare object key for the object store.
    pub name: String,
    /// Absolute path, for local backups only.
    pub path: Option<PathBuf>,
    /// The fields parsed out of the filename.
    pub parsed: ParsedName,
    /// The filename timestamp interpreted in the configured zone.
    pub timestamp: DateTime<Tz>,
}

/// One storage root plus the backups it currently holds, sorted ascending by
/// timestamp. Every backup in a location shares its kind and root.
#[derive(Debug, Clone)]
pub struct StorageLocation {
    pub kind: StorageKind,
    pub root: String,
    pub backups: Vec<Backup>,
}

/// Uniform contract over the places archives can live.
///
/// All operations are synchronous; whatever blocking a backend needs happens
/// inside the call. Errors surface as [`StorageError`] kinds.
pub trait StorageBackend {
    fn kind(&self) -> StorageKind;

    /// Root identifier for diagnostics: a directory path or bucket/prefix.
    fn root(&self) -> String;

    /// Identifiers of stored archives whose filename matches `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    fn exists(&self, id: &str) -> Result<bool, StorageError>;

    /// Publish a staged archive under `id`. The staged file is left in place.
    fn put(&self, local_path: &Path, id: &str) -> Result<(), StorageError>;

    /// Materialize `id` at `local_path`, returning the path to read from.
    /// A local backend may return the stored file directly.
    fn get(&self, id: &str, local_path: &Path) -> Result<PathBuf, StorageError>;

    fn rename(&self, old_id: &str, new_id: &str) -> Result<(), StorageError>;

    fn delete(&self, id: &str) -> Result<(), StorageError>;

    /// Batch removal. An empty batch is a no-op success.
    fn delete_many(&self, ids: &[String]) -> Result<(), StorageError>;
}

//! Local filesystem storage backend.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{StorageBackend, StorageKind};
use crate::error::StorageError;
use crate::naming::BACKUP_EXTENSION;

/// Stores archives in a directory on the local filesystem.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create a backend over `root`, creating the directory if it is missing.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        if !root.exists() {
            fs::create_dir_all(&root).map_err(|e| {
                StorageError::Transport(format!("failed to create {}: {e}", root.display()))
            })?;
            info!("Created storage directory: {}", root.display());
        }
        Ok(Self { root })
    }

    fn object_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }
}

impl StorageBackend for LocalStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    fn root(&self) -> String {
        self.root.display().to_string()
    }

    /// Non-recursive walk of the root matching `*<prefix>*.tgz`.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let suffix = format!(".{BACKUP_EXTENSION}");
        let mut ids = Vec::new();
        for dir_entry in fs::read_dir(&self.root)? {
            let dir_entry = dir_entry?;
            if !dir_entry.path().is_file() {
                continue;
            }
            let Some(file_name) = dir_entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if file_name.contains(prefix) && file_name.ends_with(&suffix) {
                ids.push(file_name);
            }
        }
        Ok(ids)
    }

    fn exists(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.object_path(id).exists())
    }

    /// A copy, not a rename: the scratch artifact stays available for the
    /// remaining storage locations.
    fn put(&self, local_path: &Path, id: &str) -> Result<(), StorageError> {
        let target = self.object_path(id);
        fs::copy(local_path, &target)?;
        info!("Created: {}", target.display());
        Ok(())
    }

    fn get(&self, id: &str, _local_path: &Path) -> Result<PathBuf, StorageError> {
        let stored = self.object_path(id);
        if !stored.exists() {
            return Err(StorageError::NotFound(stored.display().to_string()));
        }
        Ok(stored)
    }

    fn rename(&self, old_id: &str, new_id: &str) -> Result<(), StorageError> {
        let from = self.object_path(old_id);
        let to = self.object_path(new_id);
        fs::rename(&from, &to)?;
        debug!("Rename: {} -> {}", from.display(), to.display());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), StorageError> {
        let path = self.object_path(id);
        if !path.exists() {
            return Err(StorageError::NotFound(path.display().to_string()));
        }
        fs::remove_file(&path)?;
        info!("Delete: {}", path.display());
        Ok(())
    }

    fn delete_many(&self, ids: &[String]) -> Result<(), StorageError> {
        for id in ids {
            self.delete(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalStorage) {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().join("backups")).unwrap();
        (dir, storage)
    }

    fn stage_file(dir: &TempDir, content: &[u8]) -> PathBuf {
        let staged = dir.path().join("staged.tgz");
        fs::write(&staged, content).unwrap();
        staged
    }

    #[test]
    fn test_new_creates_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("fresh");
        assert!(!root.exists());

        let _storage = LocalStorage::new(&root).unwrap();
        assert!(root.exists());
    }

    #[test]
    fn test_put_then_list_and_exists() {
        let (dir, storage) = setup();
        let staged = stage_file(&dir, b"archive bytes");

        storage.put(&staged, "foo-20240102T030405.tgz").unwrap();

        assert!(storage.exists("foo-20240102T030405.tgz").unwrap());
        assert_eq!(storage.list("foo").unwrap(), vec!["foo-20240102T030405.tgz"]);
        // The staged artifact is copied, not moved.
        assert!(staged.exists());
    }

    #[test]
    fn test_list_filters_prefix_and_extension() {
        let (dir, storage) = setup();
        let staged = stage_file(&dir, b"x");

        storage.put(&staged, "foo-20240102T030405.tgz").unwrap();
        storage.put(&staged, "bar-20240102T030405.tgz").unwrap();
        fs::write(dir.path().join("backups/foo-notes.txt"), "x").unwrap();

        let ids = storage.list("foo").unwrap();
        assert_eq!(ids, vec!["foo-20240102T030405.tgz"]);
    }

    #[test]
    fn test_get_short_circuits_to_stored_path() {
        let (dir, storage) = setup();
        let staged = stage_file(&dir, b"payload");
        storage.put(&staged, "foo-20240102T030405.tgz").unwrap();

        let elsewhere = dir.path().join("unused.tgz");
        let path = storage.get("foo-20240102T030405.tgz", &elsewhere).unwrap();

        assert_eq!(path, dir.path().join("backups/foo-20240102T030405.tgz"));
        assert_eq!(fs::read(path).unwrap(), b"payload");
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (dir, storage) = setup();
        let result = storage.get("ghost.tgz", &dir.path().join("out.tgz"));
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_rename_moves_within_root() {
        let (dir, storage) = setup();
        let staged = stage_file(&dir, b"x");
        storage.put(&staged, "foo-20240102T030405.tgz").unwrap();

        storage
            .rename("foo-20240102T030405.tgz", "foo-20240102T030405-daily.tgz")
            .unwrap();

        assert!(!storage.exists("foo-20240102T030405.tgz").unwrap());
        assert!(storage.exists("foo-20240102T030405-daily.tgz").unwrap());
    }

    #[test]
    fn test_delete_and_delete_many() {
        let (dir, storage) = setup();
        let staged = stage_file(&dir, b"x");
        storage.put(&staged, "foo-20240101T000000.tgz").unwrap();
        storage.put(&staged, "foo-20240102T000000.tgz").unwrap();

        storage.delete("foo-20240101T000000.tgz").unwrap();
        assert_eq!(storage.list("foo").unwrap().len(), 1);

        storage
            .delete_many(&["foo-20240102T000000.tgz".to_string()])
            .unwrap();
        assert!(storage.list("foo").unwrap().is_empty());

        // Empty batch is a no-op success.
        storage.delete_many(&[]).unwrap();
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let (_dir, storage) = setup();
        let result = storage.delete("ghost.tgz");
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }
}

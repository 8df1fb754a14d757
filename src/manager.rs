//! Backup orchestration: create, list, prune, rename, restore.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use fs_extra::remove_items;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::archive;
use crate::config::{Config, StorageType};
use crate::error::{Error, Result};
use crate::helpers;
use crate::naming;
use crate::retention::{self, backups_by_time_unit, RetentionPolicy};
use crate::storage::{
    Backup, LocalStorage, S3Storage, StorageBackend, StorageKind, StorageLocation,
};

/// A pending rename computed for one backup.
struct FileForRename {
    backup: Backup,
    new_name: String,
    do_rename: bool,
}

/// Orchestrates the backup lifecycle across the configured storage locations.
///
/// The inventory of each location is cached for the manager's lifetime and
/// rebuilt after any mutating operation. The scratch directory is claimed at
/// construction and released on drop.
pub struct BackupManager {
    config: Config,
    backends: Vec<Box<dyn StorageBackend>>,
    locations: Vec<StorageLocation>,
    rebuild_locations: bool,
    scratch: TempDir,
}

impl BackupManager {
    /// Wire up one backend per configured storage location.
    ///
    /// An unreachable object store fails construction and with it the run.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let mut backends: Vec<Box<dyn StorageBackend>> = Vec::new();
        if matches!(config.storage_type, StorageType::Local | StorageType::All) {
            for root in &config.storage_paths {
                backends.push(Box::new(LocalStorage::new(root)?));
            }
        }
        if matches!(config.storage_type, StorageType::Aws | StorageType::All) {
            backends.push(Box::new(S3Storage::new(config.s3_config()?)?));
        }

        let scratch = TempDir::new()?;
        debug!("Scratch directory: {}", scratch.path().display());

        Ok(Self {
            config,
            backends,
            locations: Vec::new(),
            rebuild_locations: true,
            scratch,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The current inventory of every configured location.
    pub fn storage_locations(&mut self) -> Result<&[StorageLocation]> {
        self.refresh_locations()?;
        Ok(&self.locations)
    }

    fn refresh_locations(&mut self) -> Result<()> {
        if !self.rebuild_locations {
            return Ok(());
        }

        let mut locations = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            let root = backend.root();
            let mut backups = Vec::new();
            for id in backend.list(&self.config.name)? {
                match backup_from_id(backend.kind(), &root, &self.config, id) {
                    Some(backup) => backups.push(backup),
                    None => continue,
                }
            }
            backups.sort_by_key(|backup| backup.timestamp);
            locations.push(StorageLocation {
                kind: backend.kind(),
                root,
                backups,
            });
        }

        self.locations = locations;
        self.rebuild_locations = false;
        Ok(())
    }

    /// Stage one archive and publish it to every configured location.
    ///
    /// Publication failures are per-location: a failing location is logged
    /// and skipped, and the remaining locations still proceed.
    ///
    /// # Returns
    ///
    /// * `Result<Vec<Backup>>` - The backups that were actually created, one
    ///   per location that accepted the archive.
    pub fn create_backup(&mut self) -> Result<Vec<Backup>> {
        let options = self.config.archive_options();
        let staged = archive::create_archive(&self.config.sources, &options, self.scratch.path())?;

        let now = Utc::now().with_timezone(&self.config.tz).naive_local();
        let mut created = Vec::new();

        for backend in &self.backends {
            let mut backup_name = naming::generate(&self.config.name, &now, None, None);
            match backend.exists(&backup_name) {
                Ok(true) => {
                    backup_name = naming::generate(
                        &self.config.name,
                        &now,
                        None,
                        Some(&naming::new_uid()),
                    );
                }
                Ok(false) => {}
                Err(err) => {
                    warn!("Skip storage location {}: {err}", backend.root());
                    continue;
                }
            }

            if let Err(err) = backend.put(&staged, &backup_name) {
                warn!(
                    "Failed to publish {backup_name} to {}: {err}",
                    backend.root()
                );
                continue;
            }

            if let Some(backup) =
                backup_from_id(backend.kind(), &backend.root(), &self.config, backup_name)
            {
                created.push(backup);
            }
            self.rebuild_locations = true;
        }

        Ok(created)
    }

    /// Every backup across every configured location.
    pub fn list_backups(&mut self) -> Result<Vec<Backup>> {
        Ok(self
            .storage_locations()?
            .iter()
            .flat_map(|location| location.backups.iter().cloned())
            .collect())
    }

    /// The most recent backup anywhere, or `None` when nothing exists.
    pub fn get_latest_backup(&mut self) -> Result<Option<Backup>> {
        Ok(self
            .list_backups()?
            .into_iter()
            .max_by_key(|backup| backup.timestamp))
    }

    /// Evaluate the retention policy and delete the victims.
    ///
    /// Local victims are removed one by one; object-store victims go in a
    /// single batch call. Per-item failures are logged and do not abort the
    /// rest.
    pub fn prune_backups(&mut self) -> Result<Vec<Backup>> {
        let policy = self.config.retention_policy();
        if matches!(policy, RetentionPolicy::KeepAll) {
            info!("Will not delete backups because no retention policy is set");
            return Ok(Vec::new());
        }

        self.refresh_locations()?;
        let plans: Vec<(usize, Vec<Backup>)> = self
            .locations
            .iter()
            .enumerate()
            .map(|(index, location)| (index, retention::select_victims(location, &policy)))
            .filter(|(_, victims)| !victims.is_empty())
            .collect();

        let mut all_victims = Vec::new();
        for (index, victims) in plans {
            let backend = &self.backends[index];
            match backend.kind() {
                StorageKind::Local => {
                    for backup in &victims {
                        if let Err(err) = backend.delete(&backup.name) {
                            warn!("Failed to delete {}: {err}", backup.name);
                        }
                    }
                }
                StorageKind::Aws => {
                    let ids: Vec<String> =
                        victims.iter().map(|backup| backup.name.clone()).collect();
                    if let Err(err) = backend.delete_many(&ids) {
                        warn!("Failed to delete {} objects: {err}", ids.len());
                    }
                }
            }
            all_victims.extend(victims);
        }

        if !all_victims.is_empty() {
            self.rebuild_locations = true;
        }
        info!("Pruned {} backups", all_victims.len());
        Ok(all_victims)
    }

    /// Reshape every backup's name to the current labeling policy.
    ///
    /// With time-unit labeling on, each backup's name is rewritten to carry
    /// its computed retention class; with labeling off, class labels and
    /// uids are stripped. Pending targets that collide within one location
    /// all receive fresh uids. Returns the number of renames performed.
    pub fn rename_backups(&mut self) -> Result<usize> {
        self.refresh_locations()?;

        let plans: Vec<(usize, Vec<FileForRename>)> = self
            .locations
            .iter()
            .enumerate()
            .map(|(index, location)| {
                let mut files = if self.config.label_time_units {
                    rename_with_labels(location)
                } else {
                    rename_no_labels(location)
                };
                resolve_collisions(&mut files);
                (index, files)
            })
            .collect();

        let mut rename_count = 0usize;
        for (index, files) in plans {
            let backend = &self.backends[index];
            for file in files {
                if !file.do_rename {
                    continue;
                }
                match backend.rename(&file.backup.name, &file.new_name) {
                    Ok(()) => {
                        debug!("Rename: {} -> {}", file.backup.name, file.new_name);
                        rename_count += 1;
                    }
                    Err(err) => {
                        warn!(
                            "Failed to rename {} -> {}: {err}",
                            file.backup.name, file.new_name
                        );
                    }
                }
            }
        }

        if rename_count > 0 {
            self.rebuild_locations = true;
            info!("Renamed {rename_count} backups");
        } else {
            info!("No backups to rename");
        }
        Ok(rename_count)
    }

    /// Restore the most recent backup into `destination`.
    ///
    /// # Arguments
    ///
    /// * `destination` - The directory to extract into; falls back to the
    ///   configured restore path when `None`.
    /// * `clean_before_restore` - Empty the destination file by file before
    ///   extracting, without removing the destination itself.
    ///
    /// # Returns
    ///
    /// * `Result<bool>` - `Ok(false)` for non-fatal failures (missing
    ///   destination, empty inventory, extraction errors), which are logged;
    ///   `Err` only for storage transport failures.
    pub fn restore_backup(
        &mut self,
        destination: Option<&Path>,
        clean_before_restore: bool,
    ) -> Result<bool> {
        let destination = match destination
            .map(Path::to_path_buf)
            .or_else(|| self.config.restore_path.clone())
        {
            Some(destination) => destination,
            None => {
                error!("No destination provided and no restore path configured");
                return Ok(false);
            }
        };

        if !destination.exists() {
            error!("Restore destination does not exist: {}", destination.display());
            return Ok(false);
        }
        if !destination.is_dir() {
            error!(
                "Restore destination is not a directory: {}",
                destination.display()
            );
            return Ok(false);
        }

        if clean_before_restore || self.config.clean_before_restore {
            clean_directory(&destination)?;
            info!("Cleaned all files in backup destination before restore");
        }

        let latest = match self.get_latest_backup()? {
            Some(latest) => latest,
            None => {
                error!("No backup found to restore");
                return Ok(false);
            }
        };
        debug!("Restoring backup: {}", latest.name);

        let archive_path = match latest.kind {
            StorageKind::Local => match latest.path.clone() {
                Some(path) => path,
                None => {
                    error!("Backup has no local path: {}", latest.name);
                    return Ok(false);
                }
            },
            StorageKind::Aws => {
                let Some(backend) = self
                    .backends
                    .iter()
                    .find(|backend| backend.kind() == StorageKind::Aws)
                else {
                    error!("No object-store backend configured");
                    return Ok(false);
                };
                if !backend.exists(&latest.name)? {
                    error!("Backup file does not exist in object store: {}", latest.name);
                    return Ok(false);
                }
                let download = self
                    .scratch
                    .path()
                    .join(format!("{}.{}", naming::new_uid(), naming::BACKUP_EXTENSION));
                backend.get(&latest.name, &download)?
            }
        };

        if let Err(err) = archive::extract_archive(&archive_path, &destination) {
            error!("Failed to restore backup {}: {err}", archive_path.display());
            return Ok(false);
        }

        if let (Some(uid), Some(gid)) = (self.config.chown_uid, self.config.chown_gid) {
            helpers::chown_files(&destination, uid, gid);
        }

        info!("Restored backup to {}", destination.display());
        Ok(true)
    }
}

/// Materialize backup metadata from a listed identifier.
///
/// Unparseable names, names belonging to a different backup identity, and
/// timestamps that do not exist in the configured zone are skipped.
fn backup_from_id(
    kind: StorageKind,
    root: &str,
    config: &Config,
    id: String,
) -> Option<Backup> {
    let parsed = naming::parse(&id)?;
    if parsed.name != config.name {
        debug!("Ignore foreign backup: {id}");
        return None;
    }
    let Some(timestamp) = config.tz.from_local_datetime(&parsed.timestamp).earliest() else {
        warn!("Skip backup with nonexistent local time: {id}");
        return None;
    };
    let path = match kind {
        StorageKind::Local => Some(Path::new(root).join(&id)),
        StorageKind::Aws => None,
    };
    Some(Backup {
        kind,
        name: id,
        path,
        parsed,
        timestamp,
    })
}

/// Pending renames that attach each backup's computed retention class.
///
/// Backups whose current label already equals their class are untouched.
fn rename_with_labels(location: &StorageLocation) -> Vec<FileForRename> {
    let mut files = Vec::new();
    for (bucket, backups) in backups_by_time_unit(&location.backups) {
        for backup in backups {
            if backup.parsed.bucket == Some(bucket) {
                files.push(FileForRename {
                    new_name: backup.name.clone(),
                    do_rename: false,
                    backup,
                });
                continue;
            }
            let new_name = naming::generate(
                &backup.parsed.name,
                &backup.parsed.timestamp,
                Some(bucket),
                None,
            );
            files.push(FileForRename {
                do_rename: new_name != backup.name,
                new_name,
                backup,
            });
        }
    }
    files
}

/// Pending renames that strip class labels and uids.
fn rename_no_labels(location: &StorageLocation) -> Vec<FileForRename> {
    location
        .backups
        .iter()
        .map(|backup| {
            let new_name =
                naming::generate(&backup.parsed.name, &backup.parsed.timestamp, None, None);
            FileForRename {
                do_rename: new_name != backup.name,
                new_name,
                backup: backup.clone(),
            }
        })
        .collect()
}

/// Give every pending target that collides within its location a fresh uid.
fn resolve_collisions(files: &mut [FileForRename]) {
    let mut target_counts: HashMap<String, usize> = HashMap::new();
    for file in files.iter() {
        *target_counts.entry(file.new_name.clone()).or_insert(0) += 1;
    }

    for file in files.iter_mut() {
        if !file.do_rename {
            continue;
        }
        if target_counts.get(&file.new_name).copied().unwrap_or(0) > 1 {
            if let Some(parsed) = naming::parse(&file.new_name) {
                file.new_name = naming::generate(
                    &parsed.name,
                    &parsed.timestamp,
                    parsed.bucket,
                    Some(&naming::new_uid()),
                );
            }
        }
    }
}

/// Empty a directory file by file without removing the directory itself.
fn clean_directory(dir: &Path) -> Result<()> {
    let contents: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    remove_items(&contents).map_err(|e| Error::Restore(e.to_string()))?;
    Ok(())
}

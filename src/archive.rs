//! Archive construction and extraction.
//!
//! Builds one gzip-compressed tar of the configured sources in the scratch
//! directory, applying the include/exclude filters, and unpacks archives
//! with a data-only filter on restore.

use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};

use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use tar::{Archive, Builder, EntryType};
use tracing::{trace, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::naming;

/// Basenames excluded from every archive regardless of configured filters.
pub const ALWAYS_EXCLUDE_FILENAMES: [&str; 6] = [
    ".DS_Store",
    "Thumbs.db",
    ".Spotlight-V100",
    ".Trashes",
    "desktop.ini",
    "@eaDir",
];

/// Options consumed by the archive builder.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Gzip level, 1-9.
    pub compression_level: u32,
    /// Omit the source directory basename from archive paths.
    pub strip_source_paths: bool,
    pub include_regex: Option<Regex>,
    pub exclude_regex: Option<Regex>,
}

/// A file staged for addition to an archive. Never persisted.
struct ArchiveEntry {
    full_path: PathBuf,
    relative_path: PathBuf,
}

/// Decide whether a candidate file is admitted to the archive.
///
/// Order: the always-exclude basenames, then the include regex, then the
/// exclude regex, both applied to the full path string.
pub fn include_file(path: &Path, include: Option<&Regex>, exclude: Option<&Regex>) -> bool {
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if ALWAYS_EXCLUDE_FILENAMES.contains(&name) {
            trace!("Excluded file: {name}");
            return false;
        }
    }

    let path_str = path.to_string_lossy();
    if let Some(re) = include {
        if !re.is_match(&path_str) {
            trace!("Exclude by include regex: {path_str}");
            return false;
        }
    }
    if let Some(re) = exclude {
        if re.is_match(&path_str) {
            trace!("Exclude by exclude regex: {path_str}");
            return false;
        }
    }

    true
}

/// Enumerate the files each source contributes and the archive-relative path
/// each one lands at.
fn collect_entries(sources: &[PathBuf], options: &ArchiveOptions) -> Result<Vec<ArchiveEntry>> {
    let include = options.include_regex.as_ref();
    let exclude = options.exclude_regex.as_ref();
    let mut entries = Vec::new();

    for source in sources {
        if source.is_symlink() {
            warn!("Skip backup of symlink: {}", source.display());
            continue;
        }

        if source.is_dir() {
            let base = source
                .file_name()
                .map(PathBuf::from)
                .ok_or_else(|| Error::InvalidSource(source.clone()))?;

            for entry in WalkDir::new(source).follow_links(false) {
                let entry = entry.map_err(|e| Error::Archive(e.to_string()))?;
                if entry.path_is_symlink() {
                    warn!("Skip backup of symlink: {}", entry.path().display());
                    continue;
                }
                if !entry.file_type().is_file() {
                    continue;
                }
                if !include_file(entry.path(), include, exclude) {
                    continue;
                }

                let rel = entry
                    .path()
                    .strip_prefix(source)
                    .map_err(|e| Error::Archive(e.to_string()))?;
                let relative_path = if options.strip_source_paths {
                    rel.to_path_buf()
                } else {
                    base.join(rel)
                };
                entries.push(ArchiveEntry {
                    full_path: entry.path().to_path_buf(),
                    relative_path,
                });
            }
        } else if source.is_file() {
            if include_file(source, include, exclude) {
                let basename = source
                    .file_name()
                    .map(PathBuf::from)
                    .ok_or_else(|| Error::InvalidSource(source.clone()))?;
                entries.push(ArchiveEntry {
                    full_path: source.clone(),
                    relative_path: basename,
                });
            }
        } else {
            return Err(Error::InvalidSource(source.clone()));
        }
    }

    Ok(entries)
}

/// Build one compressed tar of the sources inside `scratch_dir`.
///
/// Returns the staged artifact path. Any I/O or tar failure aborts the build
/// and the partial artifact is removed.
pub fn create_archive(
    sources: &[PathBuf],
    options: &ArchiveOptions,
    scratch_dir: &Path,
) -> Result<PathBuf> {
    let entries = collect_entries(sources, options)?;
    let artifact = scratch_dir.join(format!("{}.{}", naming::new_uid(), naming::BACKUP_EXTENSION));
    trace!("Temp tarfile: {}", artifact.display());

    match write_archive(&entries, options.compression_level, &artifact) {
        Ok(()) => Ok(artifact),
        Err(err) => {
            let _ = std::fs::remove_file(&artifact);
            Err(err)
        }
    }
}

fn write_archive(entries: &[ArchiveEntry], level: u32, artifact: &Path) -> Result<()> {
    let file = File::create(artifact).map_err(|e| Error::Archive(e.to_string()))?;
    let encoder = GzEncoder::new(file, Compression::new(level));
    let mut builder = Builder::new(encoder);

    for entry in entries {
        trace!("Add to tar: {}", entry.relative_path.display());
        builder
            .append_path_with_name(&entry.full_path, &entry.relative_path)
            .map_err(|e| {
                Error::Archive(format!("failed to add {}: {e}", entry.full_path.display()))
            })?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::Archive(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| Error::Archive(e.to_string()))?;
    Ok(())
}

/// Extract an archive into `destination`, admitting only plain data entries.
///
/// Absolute and parent-relative entry paths abort the extraction; device,
/// fifo and character entries are skipped with a warning.
pub fn extract_archive(archive_path: &Path, destination: &Path) -> Result<()> {
    let file = File::open(archive_path).map_err(|e| Error::Archive(e.to_string()))?;
    let decoder = GzDecoder::new(BufReader::new(file));
    let mut archive = Archive::new(decoder);

    for entry in archive.entries().map_err(|e| Error::Archive(e.to_string()))? {
        let mut entry = entry.map_err(|e| Error::Archive(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| Error::Archive(e.to_string()))?
            .into_owned();

        if path.is_absolute() || path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(Error::Archive(format!(
                "unsafe path in archive: {}",
                path.display()
            )));
        }
        match entry.header().entry_type() {
            EntryType::Block | EntryType::Char | EntryType::Fifo => {
                warn!("Skip special entry in archive: {}", path.display());
                continue;
            }
            _ => {}
        }

        entry
            .unpack_in(destination)
            .map_err(|e| Error::Archive(format!("failed to unpack {}: {e}", path.display())))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn options() -> ArchiveOptions {
        ArchiveOptions {
            compression_level: 9,
            strip_source_paths: false,
            include_regex: None,
            exclude_regex: None,
        }
    }

    fn archive_paths(artifact: &Path) -> Vec<String> {
        let file = File::open(artifact).unwrap();
        let decoder = GzDecoder::new(BufReader::new(file));
        let mut archive = Archive::new(decoder);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_single_file_source_uses_basename() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("a.txt");
        fs::write(&source, "hello\n").unwrap();

        let artifact = create_archive(&[source], &options(), dir.path()).unwrap();
        assert_eq!(archive_paths(&artifact), vec!["a.txt"]);
    }

    #[test]
    fn test_directory_source_keeps_basename_prefix() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("x.txt"), "x").unwrap();
        fs::write(source.join("sub/y.txt"), "y").unwrap();

        let artifact = create_archive(&[source], &options(), dir.path()).unwrap();
        let mut paths = archive_paths(&artifact);
        paths.sort();
        assert_eq!(paths, vec!["src/sub/y.txt", "src/x.txt"]);
    }

    #[test]
    fn test_strip_source_paths_drops_prefix() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("x.txt"), "x").unwrap();
        fs::write(source.join("sub/y.txt"), "y").unwrap();

        let opts = ArchiveOptions {
            strip_source_paths: true,
            ..options()
        };
        let artifact = create_archive(&[source], &opts, dir.path()).unwrap();
        let mut paths = archive_paths(&artifact);
        paths.sort();
        assert_eq!(paths, vec!["sub/y.txt", "x.txt"]);
    }

    #[test]
    fn test_invalid_source_fails_the_run() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");

        let result = create_archive(&[missing.clone()], &options(), dir.path());
        match result {
            Err(Error::InvalidSource(path)) => assert_eq!(path, missing),
            other => panic!("expected InvalidSource, got {other:?}"),
        }
    }

    #[test]
    fn test_symlinks_are_skipped() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("real.txt"), "data").unwrap();
        std::os::unix::fs::symlink(source.join("real.txt"), source.join("link.txt")).unwrap();

        let artifact = create_archive(&[source], &options(), dir.path()).unwrap();
        assert_eq!(archive_paths(&artifact), vec!["src/real.txt"]);
    }

    #[test]
    fn test_always_excluded_basenames_dropped() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join(".DS_Store"), "junk").unwrap();
        fs::write(source.join("Thumbs.db"), "junk").unwrap();
        fs::write(source.join("keep.txt"), "data").unwrap();

        let artifact = create_archive(&[source], &options(), dir.path()).unwrap();
        assert_eq!(archive_paths(&artifact), vec!["src/keep.txt"]);
    }

    #[test]
    fn test_include_filter_runs_before_exclude() {
        let include = Regex::new(r"\.txt$").unwrap();
        let exclude = Regex::new(r"skip").unwrap();

        assert!(include_file(Path::new("/src/a.txt"), Some(&include), Some(&exclude)));
        assert!(!include_file(Path::new("/src/a.log"), Some(&include), Some(&exclude)));
        assert!(!include_file(Path::new("/src/skip.txt"), Some(&include), Some(&exclude)));
        assert!(!include_file(Path::new("/src/.DS_Store"), None, None));
        assert!(include_file(Path::new("/src/a.bin"), None, None));
    }

    #[test]
    fn test_compression_level_is_honored() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("data.bin");
        fs::write(&source, vec![0u8; 64 * 1024]).unwrap();

        let fast = ArchiveOptions {
            compression_level: 1,
            ..options()
        };
        let best = ArchiveOptions {
            compression_level: 9,
            ..options()
        };
        let fast_artifact = create_archive(&[source.clone()], &fast, dir.path()).unwrap();
        let best_artifact = create_archive(&[source], &best, dir.path()).unwrap();

        let fast_size = fs::metadata(&fast_artifact).unwrap().len();
        let best_size = fs::metadata(&best_artifact).unwrap().len();
        assert!(best_size <= fast_size);
    }

    #[test]
    fn test_extract_round_trip() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("x.txt"), "alpha").unwrap();
        fs::write(source.join("sub/y.txt"), "beta").unwrap();

        let artifact = create_archive(&[source], &options(), dir.path()).unwrap();

        let dest = dir.path().join("restored");
        fs::create_dir_all(&dest).unwrap();
        extract_archive(&artifact, &dest).unwrap();

        assert_eq!(fs::read_to_string(dest.join("src/x.txt")).unwrap(), "alpha");
        assert_eq!(fs::read_to_string(dest.join("src/sub/y.txt")).unwrap(), "beta");
    }

    #[test]
    fn test_extract_rejects_parent_relative_paths() {
        let dir = TempDir::new().unwrap();

        // Hand-build an archive carrying a parent-relative entry.
        let artifact = dir.path().join("evil.tgz");
        let file = File::create(&artifact).unwrap();
        let encoder = GzEncoder::new(file, Compression::new(9));
        let mut builder = Builder::new(encoder);
        let data = b"pwned";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "../escape.txt", &data[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest = dir.path().join("restored");
        fs::create_dir_all(&dest).unwrap();
        let result = extract_archive(&artifact, &dest);
        assert!(matches!(result, Err(Error::Archive(_))));
        assert!(!dir.path().join("escape.txt").exists());
    }
}

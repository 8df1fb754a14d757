//! Host-facing helpers.

use std::os::unix::fs::chown;
use std::path::Path;

use tracing::{info, trace, warn};
use walkdir::WalkDir;

/// Recursively reassign ownership of everything under `directory`.
///
/// The directory itself is left untouched. No-op with a warning when not
/// running as root. Stops at the first failed chown rather than warn once
/// per file in an unwritable subtree.
pub fn chown_files(directory: &Path, uid: u32, gid: u32) {
    if !nix::unistd::geteuid().is_root() {
        warn!("Not running as root, skip chown operations");
        return;
    }

    for entry in WalkDir::new(directory).into_iter().filter_map(|e| e.ok()) {
        if entry.path() == directory {
            continue;
        }
        if let Err(err) = chown(entry.path(), Some(uid), Some(gid)) {
            warn!("Failed to chown {}: {err}", entry.path().display());
            break;
        }
        trace!("chown: {}", entry.path().display());
    }

    info!("chown all restored files to '{uid}:{gid}'");
}

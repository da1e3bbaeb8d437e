//! Quarantine for unreadable cache files.
//!
//! A cache file that cannot be opened (permissions) or decoded end to end
//! is moved to `<dir>/quarantine/<name>.<N>` and replaced with an empty
//! file. `N` is one past the highest numeric suffix already present, so
//! repeated failures never overwrite earlier evidence.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use super::{create_dir, open_cache_file, QUARANTINE_DIR};
use crate::error::{ChanCacherError, ChanCacherResult};

/// Move `cache_path` into the quarantine directory next to it and open a
/// fresh, empty file in its place.
pub fn quarantine_cache(cache_path: &Path) -> ChanCacherResult<File> {
    let cache_dir = cache_path.parent().unwrap_or_else(|| Path::new("."));
    let quarantine_dir = cache_dir.join(QUARANTINE_DIR);

    create_dir(&quarantine_dir).map_err(|source| {
        error!(quarantine_dir = %quarantine_dir.display(), error = %source, "failed to create quarantine dir");
        ChanCacherError::Quarantine {
            path: cache_path.to_path_buf(),
            source,
        }
    })?;

    let name = cache_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let existing = list_quarantined(&quarantine_dir, &name).map_err(|source| {
        error!(quarantine_dir = %quarantine_dir.display(), error = %source, "could not read quarantine directory");
        ChanCacherError::Quarantine {
            path: cache_path.to_path_buf(),
            source,
        }
    })?;
    let target = next_quarantine_name(&quarantine_dir.join(&name), &existing);

    warn!(cache = %cache_path.display(), quarantine_file = %target.display(), "moving cache to quarantine");
    fs::rename(cache_path, &target).map_err(|source| {
        error!(cache = %cache_path.display(), quarantine_file = %target.display(), error = %source, "failed to quarantine cache");
        ChanCacherError::Quarantine {
            path: cache_path.to_path_buf(),
            source,
        }
    })?;

    open_cache_file(cache_path).map_err(|source| {
        error!(cache = %cache_path.display(), error = %source, "failed to open new cache file");
        ChanCacherError::io(cache_path, source)
    })
}

/// Paths in `quarantine_dir` that look like `<name>.<anything>`.
pub fn list_quarantined(quarantine_dir: &Path, name: &str) -> std::io::Result<Vec<PathBuf>> {
    if !quarantine_dir.exists() {
        return Ok(Vec::new());
    }
    let prefix = format!("{}.", name);
    let mut matches = Vec::new();
    for entry in fs::read_dir(quarantine_dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches)
}

/// Pick the next free quarantine path for `base`.
///
/// Suffixes that are not integers (`.backup`, `.old`) are ignored.
pub fn next_quarantine_name(base: &Path, matches: &[PathBuf]) -> PathBuf {
    let max = matches
        .iter()
        .filter_map(|m| m.extension())
        .filter_map(|ext| ext.to_str()?.parse::<u64>().ok())
        .max()
        .unwrap_or(0);

    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{}", max + 1));
    PathBuf::from(name)
}

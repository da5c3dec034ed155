//! Backups of the local store before it is overwritten

use crate::error::{Result, TableSyncError};
use chrono::Utc;
use std::path::{Path, PathBuf};

const BACKUP_SUFFIX: &str = "backup";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Path of the single rolling backup of `store`
pub fn rolling_backup_path(store: &Path) -> PathBuf {
    with_suffix(store, BACKUP_SUFFIX)
}

/// Copy `store` aside before it is replaced.
///
/// With `generations <= 1` a single `<store>.backup` is overwritten each
/// time. Larger values keep timestamped `<store>.<stamp>.backup` copies and
/// prune the oldest beyond `generations`. Returns `None` when there is no
/// store to back up.
pub fn backup_store(store: &Path, generations: usize) -> Result<Option<PathBuf>> {
    if !store.is_file() {
        return Ok(None);
    }
    let backup_err = |source| TableSyncError::Backup {
        path: store.to_path_buf(),
        source,
    };

    let target = if generations <= 1 {
        rolling_backup_path(store)
    } else {
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        with_suffix(store, &format!("{}.{}", stamp, BACKUP_SUFFIX))
    };

    let mut temp = target.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);
    std::fs::copy(store, &temp).map_err(backup_err)?;
    std::fs::rename(&temp, &target).map_err(backup_err)?;
    tracing::info!("Backed up {} to {}", store.display(), target.display());

    if generations > 1 {
        for old in timestamped_backups(store)
            .map_err(backup_err)?
            .into_iter()
            .rev()
            .skip(generations)
        {
            match std::fs::remove_file(&old) {
                Ok(()) => tracing::debug!("Pruned old backup {}", old.display()),
                Err(e) => tracing::warn!("Could not prune backup {}: {}", old.display(), e),
            }
        }
    }

    Ok(Some(target))
}

/// Timestamped backups of `store`, oldest first
pub fn timestamped_backups(store: &Path) -> std::io::Result<Vec<PathBuf>> {
    let (Some(dir), Some(name)) = (store.parent(), store.file_name()) else {
        return Ok(Vec::new());
    };
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    let prefix = format!("{}.", name.to_string_lossy());
    let suffix = format!(".{}", BACKUP_SUFFIX);

    let mut backups: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            let file = e.file_name();
            let file = file.to_string_lossy();
            file.strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
                .map(|stamp| stamp.len() == 16 && stamp.ends_with('Z'))
                .unwrap_or(false)
        })
        .map(|e| e.path())
        .collect();
    // The stamp sorts chronologically
    backups.sort();
    Ok(backups)
}

//! Remote storage abstraction
//!
//! Keys are `/`-separated paths relative to the configured remote root
//! (filesystem) or key prefix (S3).

use crate::error::{Result, TableSyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Size and modification time of a remote object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectMetadata {
    /// Object size in bytes
    pub size: u64,
    /// Last modification time, if the backend reports one
    pub updated_at: Option<DateTime<Utc>>,
}

/// Counts of a directory upload or download
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectoryTransfer {
    /// Files matching the pattern
    pub matched: usize,
    /// Files transferred
    pub transferred: usize,
    /// Files that failed
    pub failed: usize,
    /// Bytes transferred
    pub bytes: u64,
}

impl DirectoryTransfer {
    /// At least one file matched and none failed
    pub fn is_success(&self) -> bool {
        self.matched > 0 && self.failed == 0
    }
}

/// Build a matcher from a comma-separated list of glob patterns
pub fn build_pattern(pattern: &str) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for part in pattern.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let glob = Glob::new(part).map_err(|e| {
            TableSyncError::config(format!("Invalid glob pattern '{}': {}", part, e))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| TableSyncError::config(format!("Failed to build glob set: {}", e)))
}

/// Join a key prefix and a relative key
pub fn join_key(prefix: &str, relative: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", prefix, relative)
    }
}

/// Files under `dir` matching `pattern`, as (path, relative key) pairs
pub fn matching_files(dir: &Path, pattern: &GlobSet) -> Vec<(PathBuf, String)> {
    let mut files: Vec<(PathBuf, String)> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let relative = e.path().strip_prefix(dir).ok()?;
            let key = relative_key(relative);
            pattern
                .is_match(&key)
                .then(|| (e.path().to_path_buf(), key))
        })
        .collect();
    files.sort_by(|a, b| a.1.cmp(&b.1));
    files
}

/// Render a relative path as a `/`-separated key
pub fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// `key` is a relative `/`-separated path with no empty, `.` or `..`
/// segments
pub fn is_plain_relative(key: &str) -> bool {
    !key.is_empty()
        && key
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}

/// Object storage holding the shared copy of the data directory
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Human-readable location, for logs
    fn describe(&self) -> String;

    /// Whether an object exists at `key`
    async fn file_exists(&self, key: &str) -> Result<bool>;

    /// Metadata of the object at `key`, `None` if absent
    async fn get_metadata(&self, key: &str) -> Result<Option<ObjectMetadata>>;

    /// Upload `local` to `key`, returning bytes sent
    async fn upload_file(&self, local: &Path, key: &str) -> Result<u64>;

    /// Download `key` to `local`, returning bytes received
    async fn download_file(&self, key: &str, local: &Path) -> Result<u64>;

    /// Keys under `prefix`, sorted
    async fn list_files(&self, prefix: &str) -> Result<Vec<String>>;

    /// Upload files of `local_dir` matching `pattern` under `prefix`.
    ///
    /// Individual file failures are counted rather than returned.
    async fn upload_directory(
        &self,
        local_dir: &Path,
        prefix: &str,
        pattern: &GlobSet,
    ) -> Result<DirectoryTransfer> {
        let mut summary = DirectoryTransfer::default();
        if !local_dir.is_dir() {
            return Ok(summary);
        }

        for (path, relative) in matching_files(local_dir, pattern) {
            summary.matched += 1;
            let key = join_key(prefix, &relative);
            match self.upload_file(&path, &key).await {
                Ok(bytes) => {
                    summary.transferred += 1;
                    summary.bytes += bytes;
                }
                Err(e) => {
                    tracing::warn!("Upload of {} failed: {}", path.display(), e);
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Download objects under `prefix` matching `pattern` into `local_dir`
    async fn download_directory(
        &self,
        prefix: &str,
        local_dir: &Path,
        pattern: &GlobSet,
    ) -> Result<DirectoryTransfer> {
        let mut summary = DirectoryTransfer::default();
        let base = join_key(prefix, "");

        for key in self.list_files(&base).await? {
            // Listings are raw prefix matches: `snapshots/` must not pick up
            // `snapshots_archive/`
            let Some(relative) = key.strip_prefix(base.as_str()) else {
                continue;
            };
            if relative.is_empty() || !pattern.is_match(relative) {
                continue;
            }
            if !is_plain_relative(relative) {
                tracing::warn!("Skipping remote key {} outside {}", key, base);
                continue;
            }
            summary.matched += 1;

            let local = local_dir.join(relative);
            match self.download_file(&key, &local).await {
                Ok(bytes) => {
                    summary.transferred += 1;
                    summary.bytes += bytes;
                }
                Err(e) => {
                    tracing::warn!("Download of {} failed: {}", key, e);
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Keys and bodies held in memory, listed by raw prefix match like S3
    #[derive(Default)]
    struct MemoryStorage {
        objects: BTreeMap<String, Vec<u8>>,
        downloaded: Mutex<Vec<String>>,
    }

    impl MemoryStorage {
        fn with(keys: &[&str]) -> Self {
            Self {
                objects: keys.iter().map(|k| (k.to_string(), k.as_bytes().to_vec())).collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RemoteStorage for MemoryStorage {
        fn describe(&self) -> String {
            "memory".to_string()
        }

        async fn file_exists(&self, key: &str) -> Result<bool> {
            Ok(self.objects.contains_key(key))
        }

        async fn get_metadata(&self, key: &str) -> Result<Option<ObjectMetadata>> {
            Ok(self.objects.get(key).map(|body| ObjectMetadata {
                size: body.len() as u64,
                updated_at: None,
            }))
        }

        async fn upload_file(&self, _local: &Path, key: &str) -> Result<u64> {
            Err(TableSyncError::Transfer {
                path: key.to_string(),
                message: "read-only".to_string(),
            })
        }

        async fn download_file(&self, key: &str, local: &Path) -> Result<u64> {
            let body = self.objects.get(key).cloned().unwrap_or_default();
            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(local, &body).unwrap();
            self.downloaded.lock().unwrap().push(key.to_string());
            Ok(body.len() as u64)
        }

        async fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
            Ok(self
                .objects
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }
    }

    #[test]
    fn test_is_plain_relative() {
        assert!(is_plain_relative("a.parquet"));
        assert!(is_plain_relative("2024/a.parquet"));
        assert!(!is_plain_relative(""));
        assert!(!is_plain_relative("../x.parquet"));
        assert!(!is_plain_relative("a/./b.parquet"));
        assert!(!is_plain_relative("a//b.parquet"));
    }

    #[tokio::test]
    async fn test_download_directory_stays_under_prefix() {
        let storage = MemoryStorage::with(&[
            "snapshots/a.parquet",
            "snapshots/2024/b.parquet",
            "snapshots/../x.parquet",
            "snapshots_archive/old.parquet",
            "tablesync.db",
        ]);
        let root = tempdir().unwrap();
        let target = root.path().join("snapshots");
        let pattern = build_pattern("*.parquet").unwrap();

        let summary = storage
            .download_directory("snapshots", &target, &pattern)
            .await
            .unwrap();

        assert_eq!(summary.matched, 2);
        assert_eq!(summary.transferred, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(
            *storage.downloaded.lock().unwrap(),
            vec!["snapshots/2024/b.parquet", "snapshots/a.parquet"]
        );
        assert!(target.join("a.parquet").is_file());
        assert!(target.join("2024").join("b.parquet").is_file());
        assert!(!root.path().join("x.parquet").exists());
        assert!(!target.join("snapshots_archive").exists());
        assert!(!target.join("_archive").exists());
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("", "a.db"), "a.db");
        assert_eq!(join_key("snapshots", "x/y.parquet"), "snapshots/x/y.parquet");
        assert_eq!(join_key("snapshots/", "/y.parquet"), "snapshots/y.parquet");
        assert_eq!(join_key("snapshots", ""), "snapshots/");
    }

    #[test]
    fn test_build_pattern() {
        let set = build_pattern("*.parquet, *.arrow").unwrap();
        assert!(set.is_match("orders.parquet"));
        assert!(set.is_match("2024/orders.arrow"));
        assert!(!set.is_match("orders.csv"));
        assert!(build_pattern("[").is_err());
    }

    #[test]
    fn test_directory_transfer_success() {
        assert!(!DirectoryTransfer::default().is_success());
        let ok = DirectoryTransfer {
            matched: 2,
            transferred: 2,
            ..Default::default()
        };
        assert!(ok.is_success());
    }
}

//! Directory-backed remote storage (network share, mounted bucket)

use super::remote::{relative_key, ObjectMetadata, RemoteStorage};
use crate::error::{IoResultExt, Result, TableSyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Remote storage rooted at a local directory
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    /// Use `root` as the remote root (created on first upload)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Remote root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(TableSyncError::transfer(key, "key escapes the storage root"));
        }
        Ok(self.root.join(relative))
    }
}

/// Copy `from` to a temporary sibling of `to`, then rename it into place
async fn copy_atomic(from: &Path, to: &Path) -> Result<u64> {
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.with_path(parent)?;
    }
    let mut temp = to.as_os_str().to_owned();
    temp.push(".partial");
    let temp = PathBuf::from(temp);

    let bytes = tokio::fs::copy(from, &temp).await.with_path(from)?;
    tokio::fs::rename(&temp, to).await.with_path(to)?;
    Ok(bytes)
}

#[async_trait]
impl RemoteStorage for FilesystemStorage {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TableSyncError::io(path, e)),
        }
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let path = self.path_for(key)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TableSyncError::io(path, e)),
        };
        Ok(Some(ObjectMetadata {
            size: meta.len(),
            updated_at: meta.modified().ok().map(DateTime::<Utc>::from),
        }))
    }

    async fn upload_file(&self, local: &Path, key: &str) -> Result<u64> {
        let target = self.path_for(key)?;
        let bytes = copy_atomic(local, &target).await?;
        tracing::debug!(
            "Uploaded {} to {} ({})",
            local.display(),
            target.display(),
            humansize::format_size(bytes, humansize::BINARY)
        );
        Ok(bytes)
    }

    async fn download_file(&self, key: &str, local: &Path) -> Result<u64> {
        let source = self.path_for(key)?;
        if !self.file_exists(key).await? {
            return Err(TableSyncError::transfer(key, "object not found"));
        }
        let bytes = copy_atomic(&source, local).await?;
        tracing::debug!(
            "Downloaded {} to {} ({})",
            source.display(),
            local.display(),
            humansize::format_size(bytes, humansize::BINARY)
        );
        Ok(bytes)
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let start = self.path_for(prefix)?;
        let keys = tokio::task::spawn_blocking(move || {
            if !start.exists() {
                return Vec::new();
            }
            let mut keys: Vec<String> = WalkDir::new(&start)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| e.path().strip_prefix(&root).ok().map(relative_key))
                .filter(|key| !key.ends_with(".partial"))
                .collect();
            keys.sort();
            keys
        })
        .await
        .map_err(|e| TableSyncError::transfer(prefix, format!("listing task failed: {}", e)))?;
        Ok(keys)
    }
}

//! Bulk upload and download of the data directory
//!
//! The data directory is moved in four independent categories: the SQLite
//! store file, the derived snapshot directory, the side CSV file and the
//! resume-state file. Each category is attempted regardless of how the
//! others went, and the outcome of every category is reported back rather
//! than raised.

use crate::config::PathSettings;
use crate::error::{IoResultExt, Result};
use crate::storage::{build_pattern, DirectoryTransfer, RemoteStorage};
use globset::GlobSet;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// One independently transferred part of the data directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum TransferCategory {
    /// SQLite store file
    #[serde(rename = "database")]
    Database,
    /// Directory of derived snapshot files
    #[serde(rename = "derived_snapshots")]
    DerivedSnapshots,
    /// Auxiliary CSV side-file
    #[serde(rename = "faction_csv")]
    SideCsv,
    /// Resume-state JSON file
    #[serde(rename = "resume_state")]
    ResumeState,
}

impl TransferCategory {
    /// Every category, in transfer order
    pub const ALL: [TransferCategory; 4] = [
        TransferCategory::Database,
        TransferCategory::DerivedSnapshots,
        TransferCategory::SideCsv,
        TransferCategory::ResumeState,
    ];

    /// Key used in results and progress events
    pub fn key(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::DerivedSnapshots => "derived_snapshots",
            Self::SideCsv => "faction_csv",
            Self::ResumeState => "resume_state",
        }
    }
}

impl fmt::Display for TransferCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Local to remote
    Upload,
    /// Remote to local
    Download,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::Download => write!(f, "download"),
        }
    }
}

/// Outcome of one category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategoryResult {
    /// Category transferred completely
    pub success: bool,
    /// Files transferred
    pub files_transferred: usize,
    /// Files that failed
    pub files_failed: usize,
    /// Bytes moved
    pub bytes: u64,
    /// Nothing to transfer on the source side
    pub skipped: bool,
    /// Failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CategoryResult {
    fn transferred(bytes: u64) -> Self {
        Self {
            success: true,
            files_transferred: 1,
            bytes,
            ..Default::default()
        }
    }

    fn missing() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    fn failed(error: impl fmt::Display) -> Self {
        Self {
            files_failed: 1,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    fn from_directory(summary: DirectoryTransfer) -> Self {
        Self {
            success: summary.is_success(),
            files_transferred: summary.transferred,
            files_failed: summary.failed,
            bytes: summary.bytes,
            skipped: summary.matched == 0,
            error: (summary.failed > 0)
                .then(|| format!("{} of {} files failed", summary.failed, summary.matched)),
        }
    }
}

/// Per-category outcome of a bulk transfer
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferResult {
    /// Outcome keyed by category
    pub categories: BTreeMap<TransferCategory, CategoryResult>,
    /// Every category succeeded
    pub all_succeeded: bool,
}

impl TransferResult {
    /// Whether `category` succeeded
    pub fn success(&self, category: TransferCategory) -> bool {
        self.categories
            .get(&category)
            .map(|r| r.success)
            .unwrap_or(false)
    }

    /// Outcome of `category`
    pub fn get(&self, category: TransferCategory) -> Option<&CategoryResult> {
        self.categories.get(&category)
    }

    /// Number of successful categories
    pub fn succeeded(&self) -> usize {
        self.categories.values().filter(|r| r.success).count()
    }

    /// Total bytes moved
    pub fn bytes(&self) -> u64 {
        self.categories.values().map(|r| r.bytes).sum()
    }
}

/// Progress event emitted when a category finishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    /// Category just finished
    pub category: TransferCategory,
    /// 1-based position among all categories
    pub position: usize,
    /// Number of categories
    pub total: usize,
    /// Category outcome
    pub success: bool,
}

/// Receives category-boundary progress events
pub trait ProgressSink: Send + Sync {
    /// Called once after each category
    fn category_finished(&self, progress: &TransferProgress);
}

/// Local paths and remote keys of every category
#[derive(Debug, Clone)]
pub struct TransferLayout {
    /// Local store file
    pub database: PathBuf,
    /// Local snapshot directory
    pub snapshot_dir: PathBuf,
    /// Comma-separated globs selecting snapshot files
    pub snapshot_pattern: String,
    /// Local side CSV file
    pub side_csv: PathBuf,
    /// Local resume-state file
    pub resume_state: PathBuf,
}

impl From<&PathSettings> for TransferLayout {
    fn from(paths: &PathSettings) -> Self {
        Self {
            database: paths.database_path(),
            snapshot_dir: paths.snapshot_dir_path(),
            snapshot_pattern: paths.snapshot_pattern.clone(),
            side_csv: paths.side_csv_path(),
            resume_state: paths.resume_state_path(),
        }
    }
}

impl TransferLayout {
    /// Remote key of a single-file category, or the key prefix of the
    /// snapshot directory
    pub fn remote_key(&self, category: TransferCategory) -> String {
        file_key(self.local_path(category))
    }

    /// Local path of `category`
    pub fn local_path(&self, category: TransferCategory) -> &Path {
        match category {
            TransferCategory::Database => &self.database,
            TransferCategory::DerivedSnapshots => &self.snapshot_dir,
            TransferCategory::SideCsv => &self.side_csv,
            TransferCategory::ResumeState => &self.resume_state,
        }
    }
}

fn file_key(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".download");
    PathBuf::from(temp)
}

/// Moves the data directory to and from remote storage
pub struct TransferOrchestrator {
    storage: Arc<dyn RemoteStorage>,
    layout: TransferLayout,
    pattern: GlobSet,
}

impl TransferOrchestrator {
    /// Create an orchestrator; fails on an invalid snapshot pattern
    pub fn new(storage: Arc<dyn RemoteStorage>, layout: TransferLayout) -> Result<Self> {
        let pattern = build_pattern(&layout.snapshot_pattern)?;
        Ok(Self {
            storage,
            layout,
            pattern,
        })
    }

    /// Remote storage backend
    pub fn storage(&self) -> &Arc<dyn RemoteStorage> {
        &self.storage
    }

    /// Remote key of the store file
    pub fn database_key(&self) -> String {
        self.layout.remote_key(TransferCategory::Database)
    }

    /// Download every category from remote storage
    pub async fn download_all(&self, sink: Option<&dyn ProgressSink>) -> TransferResult {
        self.run_all(TransferDirection::Download, sink).await
    }

    /// Upload every category to remote storage
    pub async fn upload_all(&self, sink: Option<&dyn ProgressSink>) -> TransferResult {
        self.run_all(TransferDirection::Upload, sink).await
    }

    async fn run_all(
        &self,
        direction: TransferDirection,
        sink: Option<&dyn ProgressSink>,
    ) -> TransferResult {
        let start = Instant::now();
        let total = TransferCategory::ALL.len();
        let mut result = TransferResult::default();

        for (i, category) in TransferCategory::ALL.into_iter().enumerate() {
            let outcome = match direction {
                TransferDirection::Download => self.download(category).await,
                TransferDirection::Upload => self.upload(category).await,
            };
            let outcome = outcome.unwrap_or_else(CategoryResult::failed);

            if let Some(ref error) = outcome.error {
                tracing::warn!("{} of {} failed: {}", direction, category, error);
            } else if outcome.skipped {
                tracing::info!("{} of {} skipped: nothing to transfer", direction, category);
            } else {
                tracing::debug!(
                    "{} of {} done: {} file(s), {}",
                    direction,
                    category,
                    outcome.files_transferred,
                    humansize::format_size(outcome.bytes, humansize::BINARY)
                );
            }

            if let Some(sink) = sink {
                sink.category_finished(&TransferProgress {
                    category,
                    position: i + 1,
                    total,
                    success: outcome.success,
                });
            }
            result.categories.insert(category, outcome);
        }

        result.all_succeeded = result.succeeded() == total;
        tracing::info!(
            "{} with {}: {} of {} categories succeeded ({}, {})",
            direction,
            self.storage.describe(),
            result.succeeded(),
            total,
            humansize::format_size(result.bytes(), humansize::BINARY),
            humantime::format_duration(std::time::Duration::from_millis(
                start.elapsed().as_millis() as u64
            ))
        );
        result
    }

    async fn download(&self, category: TransferCategory) -> Result<CategoryResult> {
        let local = self.layout.local_path(category);
        let key = self.layout.remote_key(category);

        if category == TransferCategory::DerivedSnapshots {
            let summary = self
                .storage
                .download_directory(&key, local, &self.pattern)
                .await?;
            return Ok(CategoryResult::from_directory(summary));
        }

        if !self.storage.file_exists(&key).await? {
            return Ok(CategoryResult::missing());
        }

        let temp = temp_sibling(local);
        match self.storage.download_file(&key, &temp).await {
            Ok(bytes) => {
                tokio::fs::rename(&temp, local).await.with_path(local)?;
                Ok(CategoryResult::transferred(bytes))
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                Ok(CategoryResult::failed(e))
            }
        }
    }

    async fn upload(&self, category: TransferCategory) -> Result<CategoryResult> {
        let local = self.layout.local_path(category);
        let key = self.layout.remote_key(category);

        if category == TransferCategory::DerivedSnapshots {
            let summary = self
                .storage
                .upload_directory(local, &key, &self.pattern)
                .await?;
            return Ok(CategoryResult::from_directory(summary));
        }

        if !local.is_file() {
            return Ok(CategoryResult::missing());
        }
        let bytes = self.storage.upload_file(local, &key).await?;
        Ok(CategoryResult::transferred(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TableSyncError;
    use crate::storage::{FilesystemStorage, ObjectMetadata};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    /// Filesystem storage whose downloads of one key always fail
    struct BrokenKey {
        inner: FilesystemStorage,
        key: &'static str,
    }

    #[async_trait]
    impl RemoteStorage for BrokenKey {
        fn describe(&self) -> String {
            self.inner.describe()
        }

        async fn file_exists(&self, key: &str) -> Result<bool> {
            self.inner.file_exists(key).await
        }

        async fn get_metadata(&self, key: &str) -> Result<Option<ObjectMetadata>> {
            self.inner.get_metadata(key).await
        }

        async fn upload_file(&self, local: &Path, key: &str) -> Result<u64> {
            self.inner.upload_file(local, key).await
        }

        async fn download_file(&self, key: &str, local: &Path) -> Result<u64> {
            if key == self.key {
                return Err(TableSyncError::transfer(key, "connection reset"));
            }
            self.inner.download_file(key, local).await
        }

        async fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list_files(prefix).await
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<TransferProgress>>);

    impl ProgressSink for RecordingSink {
        fn category_finished(&self, progress: &TransferProgress) {
            self.0.lock().unwrap().push(progress.clone());
        }
    }

    fn layout(dir: &Path) -> TransferLayout {
        TransferLayout::from(&PathSettings {
            data_dir: dir.to_path_buf(),
            ..Default::default()
        })
    }

    fn orchestrator(local: &TempDir, remote: &TempDir) -> TransferOrchestrator {
        TransferOrchestrator::new(
            Arc::new(FilesystemStorage::new(remote.path())),
            layout(local.path()),
        )
        .unwrap()
    }

    fn populate(dir: &Path, with_csv: bool) {
        std::fs::write(dir.join("tablesync.db"), b"store").unwrap();
        std::fs::create_dir_all(dir.join("snapshots")).unwrap();
        std::fs::write(dir.join("snapshots").join("orders.parquet"), b"cols").unwrap();
        std::fs::write(dir.join("resume_state.json"), b"{}").unwrap();
        if with_csv {
            std::fs::write(dir.join("faction.csv"), b"id,name\n").unwrap();
        }
    }

    #[tokio::test]
    async fn test_upload_then_download_all() {
        let local = tempdir().unwrap();
        let remote = tempdir().unwrap();
        populate(local.path(), true);

        let up = orchestrator(&local, &remote).upload_all(None).await;
        assert!(up.all_succeeded);
        assert_eq!(up.succeeded(), 4);
        assert!(remote.path().join("snapshots").join("orders.parquet").exists());

        let fresh = tempdir().unwrap();
        let sink = RecordingSink::default();
        let down = orchestrator(&fresh, &remote).download_all(Some(&sink)).await;
        assert!(down.all_succeeded);
        assert_eq!(
            std::fs::read(fresh.path().join("tablesync.db")).unwrap(),
            b"store"
        );
        assert!(!fresh.path().join("tablesync.db.download").exists());

        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].category, TransferCategory::Database);
        assert_eq!(events[3].position, 4);
        assert!(events.iter().all(|e| e.total == 4 && e.success));
    }

    #[tokio::test]
    async fn test_missing_side_csv_is_reported_independently() {
        let local = tempdir().unwrap();
        let remote = tempdir().unwrap();
        populate(local.path(), false);
        orchestrator(&local, &remote).upload_all(None).await;

        let fresh = tempdir().unwrap();
        let down = orchestrator(&fresh, &remote).download_all(None).await;

        assert!(!down.success(TransferCategory::SideCsv));
        assert!(down.get(TransferCategory::SideCsv).unwrap().skipped);
        assert!(down.success(TransferCategory::Database));
        assert!(down.success(TransferCategory::DerivedSnapshots));
        assert!(down.success(TransferCategory::ResumeState));
        assert!(!down.all_succeeded);

        let json = serde_json::to_value(&down).unwrap();
        assert_eq!(json["categories"]["faction_csv"]["success"], false);
        assert_eq!(json["categories"]["database"]["success"], true);
    }

    #[tokio::test]
    async fn test_failed_store_download_leaves_other_categories() {
        let local = tempdir().unwrap();
        let remote = tempdir().unwrap();
        populate(local.path(), true);
        orchestrator(&local, &remote).upload_all(None).await;

        let fresh = tempdir().unwrap();
        std::fs::write(fresh.path().join("tablesync.db"), b"kept").unwrap();
        let broken = TransferOrchestrator::new(
            Arc::new(BrokenKey {
                inner: FilesystemStorage::new(remote.path()),
                key: "tablesync.db",
            }),
            layout(fresh.path()),
        )
        .unwrap();
        let sink = RecordingSink::default();
        let down = broken.download_all(Some(&sink)).await;

        let database = down.get(TransferCategory::Database).unwrap();
        assert!(!database.success);
        assert!(!database.skipped);
        assert!(database.error.as_deref().unwrap().contains("connection reset"));
        assert!(down.success(TransferCategory::DerivedSnapshots));
        assert!(down.success(TransferCategory::SideCsv));
        assert!(down.success(TransferCategory::ResumeState));
        assert!(!down.all_succeeded);
        assert_eq!(sink.0.lock().unwrap().len(), 4);

        assert_eq!(
            std::fs::read(fresh.path().join("tablesync.db")).unwrap(),
            b"kept"
        );
        assert!(!fresh.path().join("tablesync.db.download").exists());
        assert!(fresh.path().join("faction.csv").is_file());
    }

    #[tokio::test]
    async fn test_empty_remote_reports_every_category_false() {
        let local = tempdir().unwrap();
        let remote = tempdir().unwrap();
        let result = orchestrator(&local, &remote).download_all(None).await;
        assert_eq!(result.succeeded(), 0);
        assert!(result.categories.values().all(|r| r.skipped));
        assert!(!local.path().join("tablesync.db").exists());
    }

    #[tokio::test]
    async fn test_download_replaces_existing_store() {
        let local = tempdir().unwrap();
        let remote = tempdir().unwrap();
        std::fs::write(remote.path().join("tablesync.db"), b"newer").unwrap();
        std::fs::write(local.path().join("tablesync.db"), b"older").unwrap();

        let result = orchestrator(&local, &remote).download_all(None).await;
        assert!(result.success(TransferCategory::Database));
        assert_eq!(result.get(TransferCategory::Database).unwrap().bytes, 5);
        assert_eq!(
            std::fs::read(local.path().join("tablesync.db")).unwrap(),
            b"newer"
        );
    }

    #[test]
    fn test_invalid_snapshot_pattern() {
        let remote = tempdir().unwrap();
        let mut layout = layout(remote.path());
        layout.snapshot_pattern = "[".into();
        assert!(
            TransferOrchestrator::new(Arc::new(FilesystemStorage::new(remote.path())), layout)
                .is_err()
        );
    }

    #[test]
    fn test_remote_keys_use_file_names() {
        let layout = layout(Path::new("/srv/data"));
        assert_eq!(layout.remote_key(TransferCategory::Database), "tablesync.db");
        assert_eq!(
            layout.remote_key(TransferCategory::DerivedSnapshots),
            "snapshots"
        );
        assert_eq!(layout.remote_key(TransferCategory::SideCsv), "faction.csv");
    }
}

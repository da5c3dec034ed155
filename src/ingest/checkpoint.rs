//! Durable per-table paging checkpoints
//!
//! All checkpoints live in one JSON object keyed by table name. Every
//! update is a read-modify-write of the whole file under a process-wide
//! lock, written to a temporary sibling and renamed into place so a crash
//! never leaves a half-written file behind.

use super::{PagePosition, PagingMode, TableSpec};
use crate::error::{IoResultExt, Result, TableSyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Lifecycle of a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// Ingestion is running or was interrupted
    InProgress,
    /// Ingestion finished; nothing to resume
    Complete,
    /// Ingestion stopped on an error; position is preserved
    Failed,
}

/// Paging progress of one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeCheckpoint {
    /// Table name
    pub table_name: String,
    /// Paging mode the position belongs to
    pub paging_mode: PagingMode,
    /// Last primary key committed (cursor mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_value: Option<Value>,
    /// Next record offset (offset mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Pages durably staged
    pub pages_completed: u64,
    /// Records durably staged
    #[serde(default)]
    pub records_staged: u64,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Status
    pub status: CheckpointStatus,
    /// Error that left the checkpoint in `failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ResumeCheckpoint {
    /// In-progress checkpoint resuming at `next` once `pages_completed`
    /// pages are staged
    pub fn in_progress(
        table: &TableSpec,
        next: &PagePosition,
        pages_completed: u64,
        records_staged: u64,
    ) -> Self {
        let (cursor_value, offset) = match next {
            PagePosition::Cursor(value) => (value.clone(), None),
            PagePosition::Offset(offset) => (None, Some(*offset)),
        };
        Self {
            table_name: table.name().to_string(),
            paging_mode: table.paging_mode(),
            cursor_value,
            offset,
            pages_completed,
            records_staged,
            updated_at: Utc::now(),
            status: CheckpointStatus::InProgress,
            last_error: None,
        }
    }

    /// Position to resume paging from, if this checkpoint is resumable
    pub fn position(&self) -> Option<PagePosition> {
        if self.status == CheckpointStatus::Complete {
            return None;
        }
        match self.paging_mode {
            PagingMode::Cursor => self
                .cursor_value
                .clone()
                .map(|value| PagePosition::Cursor(Some(value))),
            PagingMode::Offset => self.offset.map(PagePosition::Offset),
        }
    }
}

/// Checkpoint file shared by every table of a data directory
#[derive(Debug, Clone)]
pub struct ResumeStateStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl ResumeStateStore {
    /// Use the checkpoint file at `path` (created on first save)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Checkpoint file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Checkpoint of one table
    pub fn load(&self, table: &str) -> Option<ResumeCheckpoint> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read_all().remove(table)
    }

    /// Every stored checkpoint
    pub fn load_all(&self) -> BTreeMap<String, ResumeCheckpoint> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read_all()
    }

    /// Insert or replace the checkpoint of `checkpoint.table_name`
    pub fn save(&self, checkpoint: &ResumeCheckpoint) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut all = self.read_all();
        all.insert(checkpoint.table_name.clone(), checkpoint.clone());
        self.write_all(&all)
    }

    /// Remove the checkpoint of `table`
    pub fn clear(&self, table: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut all = self.read_all();
        if all.remove(table).is_none() {
            return Ok(());
        }
        self.write_all(&all)
    }

    /// Flip a table's checkpoint to `failed`, keeping its position.
    ///
    /// Returns whether a checkpoint existed.
    pub fn mark_failed(&self, table: &str, error: &str) -> Result<bool> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut all = self.read_all();
        match all.get_mut(table) {
            Some(checkpoint) => {
                checkpoint.status = CheckpointStatus::Failed;
                checkpoint.last_error = Some(error.to_string());
                checkpoint.updated_at = Utc::now();
            }
            None => return Ok(false),
        }
        self.write_all(&all)?;
        Ok(true)
    }

    fn read_all(&self) -> BTreeMap<String, ResumeCheckpoint> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                tracing::warn!(
                    "Cannot read resume state {}: {}. Starting without checkpoints",
                    self.path.display(),
                    e
                );
                return BTreeMap::new();
            }
        };

        match serde_json::from_str(&content) {
            Ok(all) => all,
            Err(e) => {
                tracing::warn!(
                    "Resume state {} is corrupt ({}). Starting without checkpoints",
                    self.path.display(),
                    e
                );
                BTreeMap::new()
            }
        }
    }

    fn write_all(&self, all: &BTreeMap<String, ResumeCheckpoint>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }

        let mut temp_name = self.path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        let file = File::create(&temp_path).with_path(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, all).map_err(|e| TableSyncError::Checkpoint {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        writer.flush().with_path(&temp_path)?;
        let file = writer.into_inner().map_err(|e| TableSyncError::Checkpoint {
            path: temp_path.clone(),
            message: e.to_string(),
        })?;
        file.sync_all().with_path(&temp_path)?;

        std::fs::rename(&temp_path, &self.path).with_path(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn offset_checkpoint(table: &str, pages: u64) -> ResumeCheckpoint {
        let spec = TableSpec::offset(table, 100);
        ResumeCheckpoint::in_progress(&spec, &PagePosition::Offset(pages * 100), pages, pages * 100)
    }

    #[test]
    fn test_save_load_clear() {
        let dir = tempdir().unwrap();
        let store = ResumeStateStore::new(dir.path().join("resume_state.json"));

        assert!(store.load("regions").is_none());
        store.save(&offset_checkpoint("regions", 2)).unwrap();
        store.save(&offset_checkpoint("branches", 1)).unwrap();

        let loaded = store.load("regions").unwrap();
        assert_eq!(loaded.pages_completed, 2);
        assert_eq!(loaded.position(), Some(PagePosition::Offset(200)));
        assert_eq!(store.load_all().len(), 2);

        store.clear("regions").unwrap();
        assert!(store.load("regions").is_none());
        assert!(store.load("branches").is_some());
    }

    #[test]
    fn test_cursor_checkpoint_position() {
        let spec = TableSpec::cursor("orders", "OrderId", 50);
        let next = PagePosition::Cursor(Some(json!(50)));
        let checkpoint = ResumeCheckpoint::in_progress(&spec, &next, 1, 50);
        assert_eq!(checkpoint.pages_completed, 1);
        assert_eq!(checkpoint.position(), Some(PagePosition::Cursor(Some(json!(50)))));
    }

    #[test]
    fn test_corrupt_file_means_no_checkpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resume_state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = ResumeStateStore::new(&path);
        assert!(store.load("regions").is_none());

        // Next save replaces the corrupt file
        store.save(&offset_checkpoint("regions", 1)).unwrap();
        assert!(store.load("regions").is_some());
    }

    #[test]
    fn test_mark_failed_keeps_position() {
        let dir = tempdir().unwrap();
        let store = ResumeStateStore::new(dir.path().join("state").join("resume.json"));
        store.save(&offset_checkpoint("regions", 3)).unwrap();

        assert!(store.mark_failed("regions", "503 on page 4").unwrap());
        assert!(!store.mark_failed("missing", "x").unwrap());

        let failed = store.load("regions").unwrap();
        assert_eq!(failed.status, CheckpointStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("503 on page 4"));
        assert_eq!(failed.position(), Some(PagePosition::Offset(300)));
    }

    #[test]
    fn test_complete_checkpoint_does_not_resume() {
        let mut checkpoint = offset_checkpoint("regions", 2);
        checkpoint.status = CheckpointStatus::Complete;
        assert!(checkpoint.position().is_none());
    }

    #[test]
    fn test_concurrent_saves_from_clones_keep_every_table() {
        let dir = tempdir().unwrap();
        let store = ResumeStateStore::new(dir.path().join("resume_state.json"));

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for pages in 1..=5 {
                        store
                            .save(&offset_checkpoint(&format!("table_{}", i), pages))
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let all = store.load_all();
        assert_eq!(all.len(), 8);
        assert!(all.values().all(|cp| cp.pages_completed == 5));
    }

    #[test]
    fn test_file_is_keyed_by_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resume_state.json");
        let store = ResumeStateStore::new(&path);
        store.save(&offset_checkpoint("regions", 1)).unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["regions"]["status"], "in_progress");
        assert_eq!(raw["regions"]["paging_mode"], "offset");
        assert!(!dir.path().join("resume_state.json.tmp").exists());
    }
}

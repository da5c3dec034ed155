//! Once-per-process reconciliation of the local store with remote storage
//!
//! Before anything reads or refreshes the local store, the controller
//! decides whether the remote copy should replace it:
//!
//! - no remote configured: the local store is used as is
//! - local store present and not forced: download only when the remote
//!   copy is newer beyond the freshness tolerance
//! - local store absent, or forced: download whenever the remote copy
//!   exists
//!
//! The local store is backed up before every download. Backup failures are
//! logged and never block the download.

use super::backup::backup_store;
use super::freshness::{FreshnessComparator, FreshnessState, SyncMetadata};
use super::transfer::{ProgressSink, TransferCategory, TransferOrchestrator};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Branch taken by a startup sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupAction {
    /// No remote configured
    LocalOnly,
    /// Local and remote agree
    UpToDate,
    /// Local copy is newer, nothing downloaded
    LocalNewer,
    /// Freshness could not be determined, local copy kept
    Unknown,
    /// Remote copy downloaded
    Downloaded,
    /// Remote copy needed but absent
    RemoteMissing,
    /// Remote copy needed but the store download failed
    DownloadFailed,
}

impl fmt::Display for StartupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LocalOnly => "local_only",
            Self::UpToDate => "up_to_date",
            Self::LocalNewer => "local_newer",
            Self::Unknown => "unknown",
            Self::Downloaded => "downloaded",
            Self::RemoteMissing => "remote_missing",
            Self::DownloadFailed => "download_failed",
        };
        write!(f, "{}", s)
    }
}

/// Result of a startup sync
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartupSyncOutcome {
    /// The local store is usable
    pub ready: bool,
    /// Branch taken
    pub action: StartupAction,
}

impl StartupSyncOutcome {
    fn new(ready: bool, action: StartupAction) -> Self {
        Self { ready, action }
    }
}

/// Decides, once per process, whether to pull the remote store
pub struct StartupSyncController {
    orchestrator: Option<TransferOrchestrator>,
    database: PathBuf,
    backup_generations: usize,
    comparator: FreshnessComparator,
    outcome: Mutex<Option<StartupSyncOutcome>>,
}

impl StartupSyncController {
    /// Controller for the store at `database`; `orchestrator` is `None`
    /// when no remote is configured
    pub fn new(orchestrator: Option<TransferOrchestrator>, database: impl Into<PathBuf>) -> Self {
        Self {
            orchestrator,
            database: database.into(),
            backup_generations: 1,
            comparator: FreshnessComparator::default(),
            outcome: Mutex::new(None),
        }
    }

    /// Number of store backups to keep
    pub fn with_backup_generations(mut self, generations: usize) -> Self {
        self.backup_generations = generations;
        self
    }

    /// Reconcile the local store with remote storage.
    ///
    /// The first unforced outcome is cached; later unforced calls return it
    /// without touching storage. A forced call always runs.
    pub async fn run(&self, force: bool, sink: Option<&dyn ProgressSink>) -> StartupSyncOutcome {
        let mut cached = self.outcome.lock().await;
        if !force {
            if let Some(ref outcome) = *cached {
                tracing::debug!("Startup sync already ran: {}", outcome.action);
                return outcome.clone();
            }
        }

        let outcome = self.reconcile(force, sink).await;
        tracing::info!(
            "Startup sync finished: {} (ready: {})",
            outcome.action,
            outcome.ready
        );
        *cached = Some(outcome.clone());
        outcome
    }

    async fn reconcile(&self, force: bool, sink: Option<&dyn ProgressSink>) -> StartupSyncOutcome {
        let local_exists = self.database.is_file();

        let Some(ref orchestrator) = self.orchestrator else {
            if !local_exists {
                tracing::warn!(
                    "No remote storage configured and no local store at {}",
                    self.database.display()
                );
            }
            return StartupSyncOutcome::new(local_exists, StartupAction::LocalOnly);
        };
        let key = orchestrator.database_key();

        if local_exists && !force {
            let metadata = match SyncMetadata::gather(
                &self.database,
                orchestrator.storage().as_ref(),
                &key,
                &self.comparator,
            )
            .await
            {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!("Could not compare with remote store, keeping local: {}", e);
                    return StartupSyncOutcome::new(true, StartupAction::Unknown);
                }
            };

            return match metadata.freshness_state {
                FreshnessState::CloudNewer => self.download(orchestrator, sink).await,
                FreshnessState::LocalNewer => {
                    StartupSyncOutcome::new(true, StartupAction::LocalNewer)
                }
                FreshnessState::UpToDate => StartupSyncOutcome::new(true, StartupAction::UpToDate),
                FreshnessState::Unknown => StartupSyncOutcome::new(true, StartupAction::Unknown),
            };
        }

        match orchestrator.storage().file_exists(&key).await {
            Ok(true) => self.download(orchestrator, sink).await,
            Ok(false) => {
                tracing::warn!(
                    "Remote store {} not found on {}",
                    key,
                    orchestrator.storage().describe()
                );
                StartupSyncOutcome::new(false, StartupAction::RemoteMissing)
            }
            Err(e) => {
                tracing::warn!("Could not check remote store {}: {}", key, e);
                StartupSyncOutcome::new(false, StartupAction::RemoteMissing)
            }
        }
    }

    async fn download(
        &self,
        orchestrator: &TransferOrchestrator,
        sink: Option<&dyn ProgressSink>,
    ) -> StartupSyncOutcome {
        let database = self.database.clone();
        let generations = self.backup_generations;
        let backup =
            tokio::task::spawn_blocking(move || backup_store(&database, generations)).await;
        match backup {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!("Continuing without backup: {}", e),
            Err(e) => tracing::warn!("Continuing without backup: backup task failed: {}", e),
        }

        let result = orchestrator.download_all(sink).await;
        if result.success(TransferCategory::Database) {
            StartupSyncOutcome::new(true, StartupAction::Downloaded)
        } else {
            StartupSyncOutcome::new(false, StartupAction::DownloadFailed)
        }
    }
}

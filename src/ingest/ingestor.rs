//! Table ingestion and refresh
//!
//! [`TableIngestor::ingest`] drives a [`Pager`] for one table, stages each
//! page in the local store, checkpoints after every staged page and finally
//! swaps the staged records in as the live table. [`TableIngestor::refresh`]
//! runs several tables side by side and reports each one separately.

use super::{
    CancelSignal, ConcurrencyLimiter, FetchedPage, PagePosition, Pager, RecordSource,
    ResumeCheckpoint, ResumeStateStore, RetryExecutor, TableSpec,
};
use crate::error::{Result, TableSyncError};
use crate::store::LocalStore;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Result of ingesting one table
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableOutcome {
    /// The live table was replaced
    Succeeded {
        /// Rows in the new table
        rows: u64,
        /// Pages fetched in total, including pages from an earlier run
        pages: u64,
        /// Page the run resumed at, if it continued a checkpoint
        resumed_from_page: Option<u64>,
    },
    /// Nothing to ingest; the live table was left alone
    Skipped {
        /// Why the table was skipped
        reason: String,
    },
    /// Ingestion failed; the live table was left alone
    Failed {
        /// Error description
        error: String,
        /// Whether a checkpoint remains to resume from
        checkpoint_preserved: bool,
    },
}

impl TableOutcome {
    /// Whether the table ended in a consistent, up-to-date state
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Per-table outcomes of one refresh
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    /// Outcome keyed by table name
    pub outcomes: BTreeMap<String, TableOutcome>,
    /// True when no table failed
    pub all_succeeded: bool,
}

impl RefreshReport {
    fn from_outcomes(outcomes: BTreeMap<String, TableOutcome>) -> Self {
        let all_succeeded = outcomes.values().all(TableOutcome::is_success);
        Self {
            outcomes,
            all_succeeded,
        }
    }

    /// Number of tables that did not fail
    pub fn succeeded(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }
}

/// Marks a table as being ingested until dropped
struct BusyGuard {
    busy: Arc<Mutex<HashSet<String>>>,
    table: String,
}

impl BusyGuard {
    fn claim(busy: &Arc<Mutex<HashSet<String>>>, table: &str) -> Option<Self> {
        let mut set = busy.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(table.to_string()) {
            return None;
        }
        Some(Self {
            busy: Arc::clone(busy),
            table: table.to_string(),
        })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut set = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.table);
    }
}

/// Materializes remote tables into the local store
pub struct TableIngestor {
    source: Arc<dyn RecordSource>,
    store: LocalStore,
    checkpoints: ResumeStateStore,
    retry: RetryExecutor,
    limiter: ConcurrencyLimiter,
    cancel: CancelSignal,
    tables: Vec<TableSpec>,
    table_parallelism: usize,
    busy: Arc<Mutex<HashSet<String>>>,
}

impl TableIngestor {
    /// Create an ingestor for the configured `tables`
    pub fn new(
        source: Arc<dyn RecordSource>,
        store: LocalStore,
        checkpoints: ResumeStateStore,
        retry: RetryExecutor,
        limiter: ConcurrencyLimiter,
        tables: Vec<TableSpec>,
    ) -> Self {
        Self {
            source,
            store,
            checkpoints,
            retry,
            limiter,
            cancel: CancelSignal::new(),
            tables,
            table_parallelism: 4,
            busy: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Use `cancel` to stop ingestion
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Tables ingested at the same time during a refresh
    pub fn with_table_parallelism(mut self, parallelism: usize) -> Self {
        self.table_parallelism = parallelism.max(1);
        self
    }

    /// Ingest the named tables, or every configured table when `names` is
    /// `None`
    pub async fn refresh(&self, names: Option<&[String]>) -> RefreshReport {
        let mut outcomes = BTreeMap::new();
        let mut selected = Vec::new();

        match names {
            None => selected.extend(self.tables.iter().cloned()),
            Some(names) => {
                let mut seen = HashSet::new();
                for name in names.iter().filter(|n| seen.insert(n.as_str())) {
                    match self.tables.iter().find(|t| t.name() == name.as_str()) {
                        Some(spec) => selected.push(spec.clone()),
                        None => {
                            tracing::warn!("Skipping unknown table '{}'", name);
                            outcomes.insert(
                                name.clone(),
                                TableOutcome::Failed {
                                    error: TableSyncError::UnknownTable(name.clone()).to_string(),
                                    checkpoint_preserved: false,
                                },
                            );
                        }
                    }
                }
            }
        }

        tracing::info!(
            "Refreshing {} table(s), {} at a time",
            selected.len(),
            self.table_parallelism
        );
        let finished: Vec<(String, TableOutcome)> = stream::iter(selected)
            .map(|spec| async move {
                let outcome = self.ingest(&spec).await;
                (spec.name().to_string(), outcome)
            })
            .buffer_unordered(self.table_parallelism)
            .collect()
            .await;
        outcomes.extend(finished);

        let report = RefreshReport::from_outcomes(outcomes);
        tracing::info!(
            "Refresh finished: {} of {} table(s) succeeded",
            report.succeeded(),
            report.outcomes.len()
        );
        report
    }

    /// Ingest one table, replacing its live contents on success.
    ///
    /// A failure never touches the live table; the table's checkpoint is
    /// kept (marked `failed`) so the next run resumes where this one
    /// stopped.
    pub async fn ingest(&self, table: &TableSpec) -> TableOutcome {
        let _busy = match BusyGuard::claim(&self.busy, table.name()) {
            Some(guard) => guard,
            None => {
                let err = TableSyncError::TableBusy(table.name().to_string());
                tracing::warn!("{}", err);
                return TableOutcome::Failed {
                    error: err.to_string(),
                    checkpoint_preserved: false,
                };
            }
        };

        let started = Instant::now();
        match self.run(table).await {
            Ok(outcome) => {
                match &outcome {
                    TableOutcome::Succeeded { rows, pages, .. } => tracing::info!(
                        "Table '{}' refreshed: {} row(s) in {} page(s) ({})",
                        table.name(),
                        rows,
                        pages,
                        humantime::format_duration(elapsed_millis(started))
                    ),
                    TableOutcome::Skipped { reason } => {
                        tracing::info!("Table '{}' skipped: {}", table.name(), reason)
                    }
                    TableOutcome::Failed { .. } => {}
                }
                outcome
            }
            Err(err) => {
                let error = err.to_string();
                let name = table.name().to_string();
                let preserved = self
                    .checkpoint_io(move |store| store.mark_failed(&name, &error))
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!("Could not mark checkpoint of '{}' failed: {}", table.name(), e);
                        false
                    });
                tracing::warn!(
                    "Table '{}' failed ({}): {}",
                    table.name(),
                    if preserved { "checkpoint kept" } else { "no checkpoint" },
                    err
                );
                TableOutcome::Failed {
                    error: err.to_string(),
                    checkpoint_preserved: preserved,
                }
            }
        }
    }

    async fn run(&self, table: &TableSpec) -> Result<TableOutcome> {
        let name = table.name().to_string();
        let mut pager = Pager::new(
            Arc::clone(&self.source),
            table.clone(),
            self.retry.clone(),
            self.limiter.clone(),
            self.cancel.clone(),
        );

        let (resumed_from_page, mut staged) = match self.resume_point(table).await? {
            Some((position, pages_completed, staged)) => {
                tracing::info!(
                    "Resuming '{}' at page {} ({} record(s) already staged)",
                    name,
                    pages_completed + 1,
                    staged
                );
                pager = pager.starting_at(position, pages_completed);
                (Some(pages_completed), staged)
            }
            None => {
                self.store.reset_staging(&name).await?;
                (None, 0)
            }
        };

        let mut pages = resumed_from_page.unwrap_or(0);
        while let Some(page) = pager.next_page().await? {
            let FetchedPage {
                index,
                records,
                next,
            } = page;
            staged = self
                .store
                .stage_page(&name, index, records)
                .await?
                .applied_to(staged);
            pages = index + 1;

            let checkpoint = ResumeCheckpoint::in_progress(table, &next, pages, staged);
            self.checkpoint_io(move |store| store.save(&checkpoint)).await?;
        }

        if staged == 0 {
            self.store.reset_staging(&name).await?;
            self.clear_checkpoint(&name).await?;
            return Ok(TableOutcome::Skipped {
                reason: "remote returned no records".to_string(),
            });
        }

        let rows = self.store.commit_staged(&name).await?;
        self.clear_checkpoint(&name).await?;
        Ok(TableOutcome::Succeeded {
            rows,
            pages,
            resumed_from_page,
        })
    }

    /// Position, page count and staged records to resume from, after
    /// discarding pages staged past the checkpoint
    async fn resume_point(&self, table: &TableSpec) -> Result<Option<(PagePosition, u64, u64)>> {
        let name = table.name().to_string();
        let checkpoint = {
            let name = name.clone();
            self.checkpoint_io(move |store| Ok(store.load(&name))).await?
        };
        let checkpoint = match checkpoint {
            Some(checkpoint) => checkpoint,
            None => return Ok(None),
        };

        if checkpoint.paging_mode != table.paging_mode() {
            tracing::warn!(
                "Ignoring {} checkpoint of '{}': table now uses {} paging",
                checkpoint.paging_mode,
                name,
                table.paging_mode()
            );
            return Ok(None);
        }
        let position = match checkpoint.position() {
            Some(position) => position,
            None => return Ok(None),
        };

        let discarded = self
            .store
            .truncate_staging(&name, checkpoint.pages_completed)
            .await?;
        if discarded > 0 {
            tracing::debug!(
                "Discarded {} record(s) staged past the checkpoint of '{}'",
                discarded,
                name
            );
        }
        let staged = self.store.staged_count(&name).await?;
        if staged == 0 && checkpoint.pages_completed > 0 {
            tracing::warn!(
                "Staged pages of '{}' are missing; restarting from the first page",
                name
            );
            return Ok(None);
        }

        Ok(Some((position, checkpoint.pages_completed, staged)))
    }

    async fn clear_checkpoint(&self, table: &str) -> Result<()> {
        let table = table.to_string();
        self.checkpoint_io(move |store| store.clear(&table)).await
    }

    async fn checkpoint_io<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ResumeStateStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.checkpoints.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| TableSyncError::Checkpoint {
                path: self.checkpoints.path().to_path_buf(),
                message: format!("checkpoint task failed: {}", e),
            })?
    }
}

fn elapsed_millis(started: Instant) -> std::time::Duration {
    std::time::Duration::from_millis(started.elapsed().as_millis() as u64)
}

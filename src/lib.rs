//! # tablesync - paginated API ingestion with remote store reconciliation
//!
//! tablesync materializes tables from a paginated JSON API into a local
//! SQLite store and keeps that store in step with a shared copy in remote
//! object storage.
//!
//! ## Features
//!
//! - **Two paging modes**: cursor paging on a primary key, or concurrent
//!   offset paging with pages committed in request order
//! - **Bounded retries**: exponential backoff with jitter for transient
//!   failures, a separate cap for malformed responses
//! - **Resumable ingestion**: a checkpoint after every staged page
//! - **Atomic replace**: each table is rebuilt in a shadow table and swapped
//!   in inside one transaction
//! - **Remote reconciliation**: freshness comparison, backups and
//!   per-category bulk transfer of the data directory
//!
//! ## Quick Start
//!
//! ```no_run
//! use tablesync::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> tablesync::Result<()> {
//! let settings = SyncSettings::load(std::path::Path::new("tablesync.json"))?;
//! let source = Arc::new(HttpRecordSource::new(&settings.api)?);
//! let store = LocalStore::open(settings.paths.database_path())?;
//! let ingestor = TableIngestor::new(
//!     source,
//!     store,
//!     ResumeStateStore::new(settings.paths.resume_state_path()),
//!     RetryExecutor::new(RetryPolicy::from_settings(&settings.api)),
//!     ConcurrencyLimiter::new(settings.api.concurrency),
//!     settings.table_specs(),
//! );
//!
//! let report = ingestor.refresh(None).await;
//! println!("{} table(s) refreshed", report.succeeded());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod ingest;
pub mod progress;
pub mod storage;
pub mod store;
pub mod sync;

// Re-export commonly used types
pub use config::SyncSettings;
pub use error::{Result, TableSyncError};
pub use ingest::{RefreshReport, TableIngestor, TableOutcome};
pub use sync::{StartupSyncController, TransferOrchestrator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use tablesync::prelude::*;
    //! ```

    pub use crate::config::{RemoteSettings, SyncSettings};
    pub use crate::error::{FetchError, Result, TableSyncError};
    pub use crate::ingest::{
        CancelSignal, ConcurrencyLimiter, HttpRecordSource, RecordSource, RefreshReport,
        ResumeStateStore, RetryExecutor, RetryPolicy, TableIngestor, TableOutcome, TableSpec,
    };
    pub use crate::storage::{FilesystemStorage, RemoteStorage};
    pub use crate::store::LocalStore;
    pub use crate::sync::{
        FreshnessComparator, FreshnessState, StartupSyncController, SyncMetadata,
        TransferLayout, TransferOrchestrator, TransferResult,
    };
}

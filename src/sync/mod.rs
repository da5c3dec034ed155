//! Reconciliation of the local data directory with remote storage
//!
//! - [`FreshnessComparator`] decides which copy of the store is newer
//! - [`TransferOrchestrator`] moves the data directory category by category
//! - [`StartupSyncController`] combines the two once per process

mod backup;
mod freshness;
mod startup;
mod transfer;

pub use backup::*;
pub use freshness::*;
pub use startup::*;
pub use transfer::*;

//! Cap on simultaneously outstanding page requests

use crate::error::{Result, TableSyncError};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Cloneable handle over one shared semaphore.
///
/// Every clone draws from the same pool of permits, so one limiter bounds
/// requests across all tables of a refresh.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl ConcurrencyLimiter {
    /// Create a limiter allowing `limit` outstanding requests
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Configured limit
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Permits currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| TableSyncError::LimiterClosed(e.to_string()))
    }
}

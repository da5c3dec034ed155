//! Lazy page sequence for one table
//!
//! The [`Pager`] hands out pages of raw records one at a time through
//! [`Pager::next_page`]. Cursor-paged tables are fetched strictly one
//! request after another. Offset-paged tables keep a window of requests in
//! flight, as wide as the [`ConcurrencyLimiter`] allows, and still yield
//! pages in request order.

use super::{CancelSignal, ConcurrencyLimiter, PageRequest, RecordSource, RetryExecutor, TableSpec};
use crate::error::{FetchError, Result, TableSyncError};
use futures::future::BoxFuture;
use futures::stream::FuturesOrdered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;

/// Where the next page starts
#[derive(Debug, Clone, PartialEq)]
pub enum PagePosition {
    /// After this primary key value (`None` = first page)
    Cursor(Option<Value>),
    /// At this record offset
    Offset(u64),
}

/// One page handed out by the pager
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Zero-based page index, counted from the start of the table
    pub index: u64,
    /// Records in the page
    pub records: Vec<Value>,
    /// Position to resume from once this page is committed
    pub next: PagePosition,
}

type OffsetFetch = BoxFuture<'static, (u64, u64, Result<Vec<Value>>)>;

/// Ordered, restartable page sequence
pub struct Pager {
    source: Arc<dyn RecordSource>,
    table: Arc<TableSpec>,
    retry: RetryExecutor,
    limiter: ConcurrencyLimiter,
    cancel: CancelSignal,
    position: PagePosition,
    next_index: u64,
    finished: bool,
    in_flight: FuturesOrdered<OffsetFetch>,
}

impl Pager {
    /// Create a pager starting at the beginning of the table
    pub fn new(
        source: Arc<dyn RecordSource>,
        table: TableSpec,
        retry: RetryExecutor,
        limiter: ConcurrencyLimiter,
        cancel: CancelSignal,
    ) -> Self {
        let position = match table.primary_key() {
            Some(_) => PagePosition::Cursor(None),
            None => PagePosition::Offset(0),
        };
        Self {
            source,
            table: Arc::new(table),
            retry,
            limiter,
            cancel,
            position,
            next_index: 0,
            finished: false,
            in_flight: FuturesOrdered::new(),
        }
    }

    /// Resume at `position`, numbering pages from `pages_completed`
    pub fn starting_at(mut self, position: PagePosition, pages_completed: u64) -> Self {
        self.position = position;
        self.next_index = pages_completed;
        self
    }

    /// Fetch the next page.
    ///
    /// `Ok(None)` is end-of-data. An error ends the sequence: later calls
    /// return `Ok(None)`.
    pub async fn next_page(&mut self) -> Result<Option<FetchedPage>> {
        let result = match self.position {
            PagePosition::Cursor(_) => self.next_cursor_page().await,
            PagePosition::Offset(_) => self.next_offset_page().await,
        };
        if result.is_err() {
            self.finish();
        }
        result
    }

    fn finish(&mut self) {
        self.finished = true;
        // Drops requests that ran past the end of the table
        self.in_flight = FuturesOrdered::new();
    }

    async fn next_cursor_page(&mut self) -> Result<Option<FetchedPage>> {
        if self.finished {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            return Err(TableSyncError::Cancelled(self.table.name().to_string()));
        }

        let key = match self.table.primary_key() {
            Some(key) => key.to_string(),
            None => {
                return Err(TableSyncError::config(format!(
                    "table '{}' has no primary key for cursor paging",
                    self.table.name()
                )))
            }
        };
        let after = match &self.position {
            PagePosition::Cursor(after) => after.clone(),
            PagePosition::Offset(_) => None,
        };
        let limit = self.table.chunk_size();
        let request = PageRequest::Cursor {
            key: key.clone(),
            after,
            limit,
        };
        let index = self.next_index;
        let label = format!("page {} ({})", index + 1, request);

        let source = Arc::clone(&self.source);
        let table = Arc::clone(&self.table);
        let records = {
            let _permit = self.limiter.acquire().await?;
            self.retry
                .run(table.name(), &label, || {
                    fetch_keyed_page(source.as_ref(), &table, &request, &key)
                })
                .await?
        };

        let last_key = match records.last() {
            Some(record) => record.get(&key).cloned(),
            None => {
                tracing::debug!("Table '{}' exhausted at {}", self.table.name(), label);
                self.finished = true;
                return Ok(None);
            }
        };
        if records.len() < limit {
            self.finished = true;
        }

        tracing::debug!(
            "Fetched {} record(s) for '{}' {}",
            records.len(),
            self.table.name(),
            label
        );
        self.position = PagePosition::Cursor(last_key);
        self.next_index += 1;
        Ok(Some(FetchedPage {
            index,
            records,
            next: self.position.clone(),
        }))
    }

    async fn next_offset_page(&mut self) -> Result<Option<FetchedPage>> {
        let cancelled = self.cancel.is_cancelled();
        let window = self.limiter.limit();
        let page_size = self.table.page_size() as u64;

        while !self.finished && !cancelled && self.in_flight.len() < window {
            let skip = match self.position {
                PagePosition::Offset(skip) => skip,
                PagePosition::Cursor(_) => break,
            };
            let index = self.next_index + self.in_flight.len() as u64;
            let fetch = self.offset_fetch(index, skip);
            self.in_flight.push_back(fetch);
            self.position = PagePosition::Offset(skip + page_size);
        }

        let (index, skip, result) = match self.in_flight.next().await {
            Some(done) => done,
            None if cancelled && !self.finished => {
                return Err(TableSyncError::Cancelled(self.table.name().to_string()))
            }
            None => return Ok(None),
        };

        let records = result?;
        if records.is_empty() {
            tracing::debug!(
                "Table '{}' exhausted at offset {} (page {})",
                self.table.name(),
                skip,
                index + 1
            );
            self.finish();
            return Ok(None);
        }

        tracing::debug!(
            "Fetched {} record(s) for '{}' at offset {}",
            records.len(),
            self.table.name(),
            skip
        );
        self.next_index = index + 1;
        Ok(Some(FetchedPage {
            index,
            records,
            next: PagePosition::Offset(skip + page_size),
        }))
    }

    fn offset_fetch(&self, index: u64, skip: u64) -> OffsetFetch {
        let source = Arc::clone(&self.source);
        let table = Arc::clone(&self.table);
        let retry = self.retry.clone();
        let limiter = self.limiter.clone();
        fetch_offset_page(source, table, retry, limiter, index, skip).boxed()
    }
}

async fn fetch_offset_page(
    source: Arc<dyn RecordSource>,
    table: Arc<TableSpec>,
    retry: RetryExecutor,
    limiter: ConcurrencyLimiter,
    index: u64,
    skip: u64,
) -> (u64, u64, Result<Vec<Value>>) {
    let request = PageRequest::Offset {
        skip,
        top: table.page_size(),
    };
    let label = format!("page {} ({})", index + 1, request);

    let result = match limiter.acquire().await {
        Ok(_permit) => {
            retry
                .run(table.name(), &label, || source.fetch_page(&table, &request))
                .await
        }
        Err(e) => Err(e),
    };
    (index, skip, result)
}

/// Fetch a cursor page and check that its last record carries the key the
/// next request filters on.
async fn fetch_keyed_page(
    source: &dyn RecordSource,
    table: &TableSpec,
    request: &PageRequest,
    key: &str,
) -> std::result::Result<Vec<Value>, FetchError> {
    let records = source.fetch_page(table, request).await?;
    match records.last() {
        Some(last) if last.get(key).map_or(true, Value::is_null) => Err(FetchError::malformed(
            table.name(),
            format!("record is missing primary key '{}'", key),
        )),
        _ => Ok(records),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::test_support::{rows, MemorySource, ALWAYS};
    use crate::ingest::RetryPolicy;
    use serde_json::json;

    fn pager(source: &Arc<MemorySource>, table: TableSpec, limit: usize) -> Pager {
        Pager::new(
            Arc::clone(source) as Arc<dyn RecordSource>,
            table,
            RetryExecutor::new(RetryPolicy::immediate(3)),
            ConcurrencyLimiter::new(limit),
            CancelSignal::new(),
        )
    }

    async fn drain(pager: &mut Pager) -> Vec<FetchedPage> {
        let mut pages = Vec::new();
        while let Some(page) = pager.next_page().await.unwrap() {
            pages.push(page);
        }
        pages
    }

    fn ids(pages: &[FetchedPage]) -> Vec<i64> {
        pages
            .iter()
            .flat_map(|p| p.records.iter())
            .filter_map(|r| r["id"].as_i64())
            .collect()
    }

    #[tokio::test]
    async fn test_offset_requests_with_single_slot() {
        let source = Arc::new(MemorySource::new().with_table("regions", rows(10)));
        let mut pager = pager(&source, TableSpec::offset("regions", 3), 1);

        let pages = drain(&mut pager).await;

        assert_eq!(pages.len(), 4);
        assert_eq!(ids(&pages), (1..=10).collect::<Vec<_>>());
        // ceil(10 / 3) + 1 trailing empty page
        assert_eq!(source.request_count("regions"), 5);
        assert_eq!(pages[3].next, PagePosition::Offset(12));
    }

    #[tokio::test]
    async fn test_offset_window_keeps_request_order() {
        let source = Arc::new(MemorySource::new().with_table("regions", rows(20)).staggered());
        let mut pager = pager(&source, TableSpec::offset("regions", 2), 4);

        let pages = drain(&mut pager).await;

        let indexes: Vec<u64> = pages.iter().map(|p| p.index).collect();
        assert_eq!(indexes, (0..10).collect::<Vec<_>>());
        assert_eq!(ids(&pages), (1..=20).collect::<Vec<_>>());
        assert!(source.request_count("regions") <= 10 + 4);
        assert!(source.peak_in_flight() <= 4);
    }

    #[tokio::test]
    async fn test_cursor_short_page_ends_paging() {
        let source = Arc::new(MemorySource::new().with_table("orders", rows(10)));
        let mut pager = pager(&source, TableSpec::cursor("orders", "id", 3), 4);

        let pages = drain(&mut pager).await;

        assert_eq!(ids(&pages), (1..=10).collect::<Vec<_>>());
        assert_eq!(source.request_count("orders"), 4);
        assert_eq!(pages[3].next, PagePosition::Cursor(Some(json!(10))));
    }

    #[tokio::test]
    async fn test_cursor_exact_multiple_issues_trailing_request() {
        let source = Arc::new(MemorySource::new().with_table("orders", rows(9)));
        let mut pager = pager(&source, TableSpec::cursor("orders", "id", 3), 1);

        let pages = drain(&mut pager).await;

        assert_eq!(pages.len(), 3);
        assert_eq!(source.request_count("orders"), 4);
        let requests = source.requests();
        assert_eq!(
            requests[1].1,
            PageRequest::Cursor {
                key: "id".into(),
                after: Some(json!(3)),
                limit: 3
            }
        );
    }

    #[tokio::test]
    async fn test_failure_is_not_end_of_data() {
        let source = Arc::new(MemorySource::new().with_table("regions", rows(15)));
        source.fail_offset(6, ALWAYS);
        let mut pager = pager(&source, TableSpec::offset("regions", 3), 1);

        assert_eq!(pager.next_page().await.unwrap().unwrap().index, 0);
        assert_eq!(pager.next_page().await.unwrap().unwrap().index, 1);
        let err = pager.next_page().await.unwrap_err();
        assert!(matches!(err, TableSyncError::FetchFailed { attempts: 3, .. }));
        assert!(pager.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let source = Arc::new(MemorySource::new().with_table("orders", rows(5)));
        source.fail_cursor(Some(2), 2);
        let mut pager = pager(&source, TableSpec::cursor("orders", "id", 2), 1);

        let pages = drain(&mut pager).await;
        assert_eq!(ids(&pages), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_malformed_page_is_retried_then_capped() {
        let source = Arc::new(MemorySource::new().with_table("regions", rows(9)));
        source.malformed_offset(3, 1);
        let mut recovering = pager(&source, TableSpec::offset("regions", 3), 1);

        let pages = drain(&mut recovering).await;
        assert_eq!(ids(&pages), (1..=9).collect::<Vec<_>>());
        // one extra attempt for the malformed page plus the trailing empty page
        assert_eq!(source.request_count("regions"), 5);

        let source = Arc::new(MemorySource::new().with_table("regions", rows(9)));
        source.malformed_offset(3, ALWAYS);
        let policy = RetryPolicy {
            max_malformed_attempts: 2,
            ..RetryPolicy::immediate(5)
        };
        let mut capped = Pager::new(
            Arc::clone(&source) as Arc<dyn RecordSource>,
            TableSpec::offset("regions", 3),
            RetryExecutor::new(policy),
            ConcurrencyLimiter::new(1),
            CancelSignal::new(),
        );

        assert_eq!(capped.next_page().await.unwrap().unwrap().index, 0);
        let err = capped.next_page().await.unwrap_err();
        match err {
            TableSyncError::FetchFailed {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 2);
                assert!(source.is_malformed());
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_starting_position_is_honoured() {
        let source = Arc::new(MemorySource::new().with_table("regions", rows(10)));
        let mut offset = pager(&source, TableSpec::offset("regions", 3), 2)
            .starting_at(PagePosition::Offset(6), 2);

        let pages = drain(&mut offset).await;
        assert_eq!(pages[0].index, 2);
        assert_eq!(ids(&pages), vec![7, 8, 9, 10]);
        assert!(source
            .requests()
            .iter()
            .all(|(_, r)| !matches!(r, PageRequest::Offset { skip, .. } if *skip < 6)));

        let source = Arc::new(MemorySource::new().with_table("orders", rows(10)));
        let mut cursor = pager(&source, TableSpec::cursor("orders", "id", 4), 1)
            .starting_at(PagePosition::Cursor(Some(json!(4))), 1);
        let pages = drain(&mut cursor).await;
        assert_eq!(pages[0].index, 1);
        assert_eq!(ids(&pages), vec![5, 6, 7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn test_cancel_drains_in_flight_pages() {
        let source = Arc::new(MemorySource::new().with_table("regions", rows(30)));
        let cancel = CancelSignal::new();
        let mut pager = Pager::new(
            Arc::clone(&source) as Arc<dyn RecordSource>,
            TableSpec::offset("regions", 3),
            RetryExecutor::new(RetryPolicy::immediate(1)),
            ConcurrencyLimiter::new(3),
            cancel.clone(),
        );

        assert_eq!(pager.next_page().await.unwrap().unwrap().index, 0);
        cancel.cancel();
        assert_eq!(pager.next_page().await.unwrap().unwrap().index, 1);
        assert_eq!(pager.next_page().await.unwrap().unwrap().index, 2);
        assert!(matches!(
            pager.next_page().await.unwrap_err(),
            TableSyncError::Cancelled(_)
        ));
        assert!(pager.next_page().await.unwrap().is_none());
        assert_eq!(source.request_count("regions"), 3);
    }

    #[tokio::test]
    async fn test_cursor_cancel_stops_before_request() {
        let source = Arc::new(MemorySource::new().with_table("orders", rows(5)));
        let cancel = CancelSignal::new();
        cancel.cancel();
        let mut pager = Pager::new(
            Arc::clone(&source) as Arc<dyn RecordSource>,
            TableSpec::cursor("orders", "id", 2),
            RetryExecutor::default(),
            ConcurrencyLimiter::new(1),
            cancel,
        );

        assert!(pager.next_page().await.is_err());
        assert_eq!(source.request_count("orders"), 0);
    }

    #[tokio::test]
    async fn test_missing_primary_key_is_malformed() {
        let records = vec![json!({"name": "a"}), json!({"name": "b"})];
        let source = Arc::new(MemorySource::new().with_table("orders", records));
        let mut pager = pager(&source, TableSpec::cursor("orders", "id", 5), 1);

        let err = pager.next_page().await.unwrap_err();
        assert!(matches!(
            err,
            TableSyncError::FetchFailed { source: FetchError::Malformed { .. }, .. }
        ));
    }
}

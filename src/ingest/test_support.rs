//! In-memory record source used by the ingestion tests.

use super::{PageRequest, RecordSource, TableSpec};
use crate::error::FetchError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Failure budget meaning "fail every time"
pub const ALWAYS: u32 = u32::MAX;

/// Serves fixed rows per table and records every request it sees.
#[derive(Default)]
pub struct MemorySource {
    tables: HashMap<String, Vec<Value>>,
    requests: Mutex<Vec<(String, PageRequest)>>,
    /// Remaining failures keyed by offset `skip`
    failing_offsets: Mutex<HashMap<u64, u32>>,
    /// Remaining failures keyed by cursor `after` (rendered, "" = first page)
    failing_cursors: Mutex<HashMap<String, u32>>,
    /// Remaining malformed responses keyed by offset `skip`
    malformed_offsets: Mutex<HashMap<u64, u32>>,
    /// Added latency shrinking with page number so later pages finish first
    staggered: bool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// `count` rows `{"id": 1..=count, "name": "row-N"}`
pub fn rows(count: usize) -> Vec<Value> {
    (1..=count)
        .map(|i| json!({"id": i as i64, "name": format!("row-{}", i), "score": i as f64 / 2.0}))
        .collect()
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: &str, rows: Vec<Value>) -> Self {
        self.tables.insert(name.to_string(), rows);
        self
    }

    pub fn staggered(mut self) -> Self {
        self.staggered = true;
        self
    }

    pub fn fail_offset(&self, skip: u64, times: u32) {
        self.failing_offsets.lock().unwrap().insert(skip, times);
    }

    pub fn malformed_offset(&self, skip: u64, times: u32) {
        self.malformed_offsets.lock().unwrap().insert(skip, times);
    }

    pub fn fail_cursor(&self, after: Option<i64>, times: u32) {
        let key = after.map(|v| v.to_string()).unwrap_or_default();
        self.failing_cursors.lock().unwrap().insert(key, times);
    }

    pub fn heal(&self) {
        self.failing_offsets.lock().unwrap().clear();
        self.failing_cursors.lock().unwrap().clear();
        self.malformed_offsets.lock().unwrap().clear();
    }

    pub fn requests(&self) -> Vec<(String, PageRequest)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self, table: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == table)
            .count()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn take_failure(map: &Mutex<HashMap<String, u32>>, key: &str) -> bool {
        let mut map = map.lock().unwrap();
        match map.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                if *remaining != ALWAYS {
                    *remaining -= 1;
                }
                true
            }
            _ => false,
        }
    }

    fn take_offset_failure(map: &Mutex<HashMap<u64, u32>>, skip: u64) -> bool {
        let mut map = map.lock().unwrap();
        match map.get_mut(&skip) {
            Some(remaining) if *remaining > 0 => {
                if *remaining != ALWAYS {
                    *remaining -= 1;
                }
                true
            }
            _ => false,
        }
    }

    fn serve(&self, table: &TableSpec, request: &PageRequest) -> Result<Vec<Value>, FetchError> {
        let url = format!("memory://{}", table.name());
        let rows = self.tables.get(table.name()).cloned().unwrap_or_default();

        match request {
            PageRequest::Offset { skip, top } => {
                if Self::take_offset_failure(&self.failing_offsets, *skip) {
                    return Err(FetchError::transient(url, "503 Service Unavailable"));
                }
                if Self::take_offset_failure(&self.malformed_offsets, *skip) {
                    return Err(FetchError::malformed(url, "truncated body"));
                }
                Ok(rows.into_iter().skip(*skip as usize).take(*top).collect())
            }
            PageRequest::Cursor { key, after, limit } => {
                let rendered = after.as_ref().map(|v| v.to_string()).unwrap_or_default();
                if Self::take_failure(&self.failing_cursors, &rendered) {
                    return Err(FetchError::transient(url, "connection reset"));
                }
                let floor = after.as_ref().and_then(Value::as_i64);
                Ok(rows
                    .into_iter()
                    .filter(|r| match (floor, r.get(key).and_then(Value::as_i64)) {
                        (Some(floor), Some(id)) => id > floor,
                        (None, _) => true,
                        _ => false,
                    })
                    .take(*limit)
                    .collect())
            }
        }
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn fetch_page(
        &self,
        table: &TableSpec,
        request: &PageRequest,
    ) -> Result<Vec<Value>, FetchError> {
        self.requests
            .lock()
            .unwrap()
            .push((table.name().to_string(), request.clone()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if self.staggered {
            let ordinal = match request {
                PageRequest::Offset { skip, top } => skip / (*top as u64).max(1),
                PageRequest::Cursor { .. } => 0,
            };
            let delay = 20u64.saturating_sub(ordinal.min(20) * 4);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        } else {
            tokio::task::yield_now().await;
        }

        let result = self.serve(table, request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

//! SQLite-backed local store
//!
//! Pages are staged durably in a per-table staging table as they arrive.
//! [`LocalStore::commit_staged`] then builds a shadow table from the staged
//! records and renames it over the live table inside one transaction, so
//! readers see either the previous contents or the new ones, never a mix.

use super::schema::{quote_ident, shadow_table, staging_table, InferredSchema, CATALOG_TABLE};
use crate::error::{IoResultExt, Result, TableSyncError};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One row of the refresh catalog
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableRefresh {
    /// Table name
    pub name: String,
    /// Rows committed by the last refresh
    pub row_count: u64,
    /// When the table was last replaced
    pub refreshed_at: DateTime<Utc>,
}

/// Effect of staging one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedPage {
    /// Records of an earlier copy of the page that were replaced
    pub replaced: u64,
    /// Records written for the page
    pub inserted: u64,
}

impl StagedPage {
    /// Running staged total after this page, given the total before it
    pub fn applied_to(&self, staged: u64) -> u64 {
        staged.saturating_sub(self.replaced) + self.inserted
    }
}

/// Handle to the local store file.
///
/// Clones share one connection; the connection mutex is the store-wide
/// write lock.
#[derive(Clone)]
pub struct LocalStore {
    path: Option<PathBuf>,
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore").field("path", &self.path).finish()
    }
}

fn write_err(table: &str, operation: &'static str) -> impl FnOnce(rusqlite::Error) -> TableSyncError {
    let table = table.to_string();
    move |source| TableSyncError::StoreWrite {
        table,
        operation,
        source,
    }
}

impl LocalStore {
    /// Open (or create) the store file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }
        let conn = Connection::open(path).map_err(|source| TableSyncError::StoreOpen {
            path: path.to_path_buf(),
            source,
        })?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| TableSyncError::StoreOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(write_err(CATALOG_TABLE, "configure connection"))?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                name TEXT PRIMARY KEY,
                row_count INTEGER NOT NULL,
                refreshed_at TEXT NOT NULL
            )",
            quote_ident(CATALOG_TABLE)
        ))
        .map_err(write_err(CATALOG_TABLE, "create catalog"))?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Store file path (`None` for in-memory stores)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| TableSyncError::StoreUnavailable("connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| TableSyncError::StoreUnavailable(format!("store task failed: {}", e)))?
    }

    /// Drop any staged records of `table`
    pub async fn reset_staging(&self, table: &str) -> Result<()> {
        let table = table.to_string();
        self.with_conn(move |conn| {
            conn.execute_batch(&format!(
                "DROP TABLE IF EXISTS {}",
                quote_ident(&staging_table(&table))
            ))
            .map_err(write_err(&table, "reset staging"))
        })
        .await
    }

    /// Drop staged pages numbered `from_page` and later
    pub async fn truncate_staging(&self, table: &str, from_page: u64) -> Result<u64> {
        let table = table.to_string();
        self.with_conn(move |conn| {
            ensure_staging(conn, &table)?;
            let removed = conn
                .execute(
                    &format!(
                        "DELETE FROM {} WHERE page >= ?1",
                        quote_ident(&staging_table(&table))
                    ),
                    params![from_page as i64],
                )
                .map_err(write_err(&table, "truncate staging"))?;
            Ok(removed as u64)
        })
        .await
    }

    /// Durably stage one page of records, replacing any earlier copy of the
    /// same page.
    pub async fn stage_page(
        &self,
        table: &str,
        page: u64,
        records: Vec<Value>,
    ) -> Result<StagedPage> {
        let table = table.to_string();
        self.with_conn(move |conn| {
            ensure_staging(conn, &table)?;
            let staging = quote_ident(&staging_table(&table));
            let tx = conn
                .transaction()
                .map_err(write_err(&table, "begin staging transaction"))?;
            let replaced = tx
                .execute(
                    &format!("DELETE FROM {} WHERE page = ?1", staging),
                    params![page as i64],
                )
                .map_err(write_err(&table, "clear staged page"))?;
            {

                let mut insert = tx
                    .prepare_cached(&format!(
                        "INSERT INTO {} (page, seq, record) VALUES (?1, ?2, ?3)",
                        staging
                    ))
                    .map_err(write_err(&table, "prepare staging insert"))?;
                for (seq, record) in records.iter().enumerate() {
                    let encoded =
                        serde_json::to_string(record).map_err(|e| TableSyncError::InvalidRecord {
                            table: table.clone(),
                            message: e.to_string(),
                        })?;
                    insert
                        .execute(params![page as i64, seq as i64, encoded])
                        .map_err(write_err(&table, "stage record"))?;
                }
            }
            tx.commit().map_err(write_err(&table, "commit staged page"))?;
            Ok(StagedPage {
                replaced: replaced as u64,
                inserted: records.len() as u64,
            })
        })
        .await
    }

    /// Records currently staged for `table`
    pub async fn staged_count(&self, table: &str) -> Result<u64> {
        let table = table.to_string();
        self.with_conn(move |conn| {
            if !exists(conn, &staging_table(&table))? {
                return Ok(0);
            }
            count_rows(conn, &staging_table(&table))
        })
        .await
    }

    /// Replace the live table with the staged records.
    ///
    /// Returns the number of rows now in the table.
    pub async fn commit_staged(&self, table: &str) -> Result<u64> {
        let table = table.to_string();
        self.with_conn(move |conn| commit_staged(conn, &table)).await
    }

    /// Whether a live table named `table` exists
    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let table = table.to_string();
        self.with_conn(move |conn| exists(conn, &table)).await
    }

    /// Rows in the live table, `None` if it does not exist
    pub async fn row_count(&self, table: &str) -> Result<Option<u64>> {
        let table = table.to_string();
        self.with_conn(move |conn| {
            if !exists(conn, &table)? {
                return Ok(None);
            }
            count_rows(conn, &table).map(Some)
        })
        .await
    }

    /// Refresh catalog, ordered by table name
    pub async fn catalog(&self) -> Result<Vec<TableRefresh>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT name, row_count, refreshed_at FROM {} ORDER BY name",
                    quote_ident(CATALOG_TABLE)
                ))
                .map_err(write_err(CATALOG_TABLE, "prepare catalog query"))?;
            let rows = stmt
                .query_map([], |row| {
                    let name: String = row.get(0)?;
                    let row_count: i64 = row.get(1)?;
                    let refreshed_at: String = row.get(2)?;
                    Ok((name, row_count, refreshed_at))
                })
                .map_err(write_err(CATALOG_TABLE, "query catalog"))?;

            let mut entries = Vec::new();
            for row in rows {
                let (name, row_count, refreshed_at) =
                    row.map_err(write_err(CATALOG_TABLE, "read catalog row"))?;
                let refreshed_at = DateTime::parse_from_rfc3339(&refreshed_at)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| TableSyncError::InvalidRecord {
                        table: CATALOG_TABLE.to_string(),
                        message: format!("bad timestamp for '{}': {}", name, e),
                    })?;
                entries.push(TableRefresh {
                    name,
                    row_count: row_count.max(0) as u64,
                    refreshed_at,
                });
            }
            Ok(entries)
        })
        .await
    }
}

fn exists(conn: &Connection, table: &str) -> Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(write_err(table, "look up table"))
}

fn count_rows(conn: &Connection, table: &str) -> Result<u64> {
    let count: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
            [],
            |row| row.get(0),
        )
        .map_err(write_err(table, "count rows"))?;
    Ok(count.max(0) as u64)
}

fn ensure_staging(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            page INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            record TEXT NOT NULL,
            PRIMARY KEY (page, seq)
        )",
        quote_ident(&staging_table(table))
    ))
    .map_err(write_err(table, "create staging"))
}

fn decode(table: &str, text: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(TableSyncError::InvalidRecord {
            table: table.to_string(),
            message: "staged record is not an object".into(),
        }),
        Err(e) => Err(TableSyncError::InvalidRecord {
            table: table.to_string(),
            message: e.to_string(),
        }),
    }
}

fn commit_staged(conn: &mut Connection, table: &str) -> Result<u64> {
    let staging = quote_ident(&staging_table(table));
    let shadow = shadow_table(table);
    let select = format!("SELECT record FROM {} ORDER BY page, seq", staging);

    let tx = conn
        .transaction()
        .map_err(write_err(table, "begin commit transaction"))?;

    let mut schema = InferredSchema::default();
    {
        let mut stmt = tx.prepare(&select).map_err(write_err(table, "read staging"))?;
        let mut rows = stmt.query([]).map_err(write_err(table, "read staging"))?;
        while let Some(row) = rows.next().map_err(write_err(table, "read staging"))? {
            let text: String = row.get(0).map_err(write_err(table, "read staging"))?;
            schema.observe(&decode(table, &text)?);
        }
    }
    if schema.is_empty() {
        return Err(TableSyncError::InvalidRecord {
            table: table.to_string(),
            message: "staged records have no fields".into(),
        });
    }

    tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(&shadow)))
        .map_err(write_err(table, "drop stale shadow"))?;
    tx.execute_batch(&schema.create_statement(&shadow))
        .map_err(write_err(table, "create shadow"))?;

    let mut inserted = 0u64;
    {
        let mut stmt = tx.prepare(&select).map_err(write_err(table, "read staging"))?;
        let mut insert = tx
            .prepare(&schema.insert_statement(&shadow))
            .map_err(write_err(table, "prepare shadow insert"))?;
        let mut rows = stmt.query([]).map_err(write_err(table, "read staging"))?;
        while let Some(row) = rows.next().map_err(write_err(table, "read staging"))? {
            let text: String = row.get(0).map_err(write_err(table, "read staging"))?;
            let record = decode(table, &text)?;
            insert
                .execute(params_from_iter(schema.row(&record)))
                .map_err(write_err(table, "insert shadow row"))?;
            inserted += 1;
        }
    }

    tx.execute_batch(&format!(
        "DROP TABLE IF EXISTS {live};
         ALTER TABLE {shadow} RENAME TO {live};
         DROP TABLE {staging};",
        live = quote_ident(table),
        shadow = quote_ident(&shadow),
        staging = staging,
    ))
    .map_err(write_err(table, "swap shadow table"))?;

    tx.execute(
        &format!(
            "INSERT OR REPLACE INTO {} (name, row_count, refreshed_at) VALUES (?1, ?2, ?3)",
            quote_ident(CATALOG_TABLE)
        ),
        params![table, inserted as i64, Utc::now().to_rfc3339()],
    )
    .map_err(write_err(table, "update catalog"))?;

    tx.commit().map_err(write_err(table, "commit table swap"))?;
    Ok(inserted)
}

//! Error types for tablesync
//!
//! Two layers of errors live here. [`FetchError`] describes what went wrong
//! with a single request to the remote API and drives the retry policy.
//! [`TableSyncError`] is what the rest of the crate returns: failures are
//! contained per table (ingestion) or per category (transfers), so most
//! variants carry the table, path or category they belong to.

use std::path::PathBuf;
use thiserror::Error;

/// Failure of one attempt to fetch a page from the remote API
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    /// Network failure, timeout, or retryable HTTP status (5xx, 408, 429)
    #[error("transient failure contacting {url}: {message}")]
    Transient {
        /// Request URL
        url: String,
        /// Description of the failure
        message: String,
    },

    /// The response arrived but its body could not be used
    #[error("malformed response from {url}: {message}")]
    Malformed {
        /// Request URL
        url: String,
        /// Description of the problem with the payload
        message: String,
    },

    /// The server refused the request outright (4xx other than 408/429)
    #[error("request to {url} rejected with status {status}: {message}")]
    Rejected {
        /// Request URL
        url: String,
        /// HTTP status code
        status: u16,
        /// Short error description
        message: String,
    },
}

impl FetchError {
    /// Create a transient error
    pub fn transient(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a malformed-response error
    pub fn malformed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Malformed { .. })
    }

    /// Whether the failure was a bad payload rather than a transport problem
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}

/// Main error type for tablesync operations
#[derive(Error, Debug)]
pub enum TableSyncError {
    /// Retries exhausted (or request rejected) while fetching a page
    #[error("fetching {page} of table '{table}' failed after {attempts} attempt(s): {source}")]
    FetchFailed {
        /// Table being ingested
        table: String,
        /// Human-readable page descriptor
        page: String,
        /// Attempts made before giving up
        attempts: u32,
        /// Last underlying failure
        #[source]
        source: FetchError,
    },

    /// Ingestion was stopped by a cancellation request
    #[error("ingestion of table '{0}' cancelled")]
    Cancelled(String),

    /// Another ingestion of the same table is already running
    #[error("table '{0}' is already being ingested")]
    TableBusy(String),

    /// The request limiter was shut down
    #[error("request limiter closed: {0}")]
    LimiterClosed(String),

    /// Table name not present in configuration
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    /// Local store could not be opened
    #[error("failed to open local store at '{path}': {source}")]
    StoreOpen {
        /// Store file path
        path: PathBuf,
        /// SQLite error
        #[source]
        source: rusqlite::Error,
    },

    /// Writing to the local store failed
    #[error("local store write failed for table '{table}' during {operation}: {source}")]
    StoreWrite {
        /// Table being written
        table: String,
        /// Step that failed
        operation: &'static str,
        /// SQLite error
        #[source]
        source: rusqlite::Error,
    },

    /// The store connection could not be used (lock poisoned, task lost)
    #[error("local store unavailable: {0}")]
    StoreUnavailable(String),

    /// Staged record could not be encoded or decoded
    #[error("invalid staged record for table '{table}': {message}")]
    InvalidRecord {
        /// Table being written
        table: String,
        /// Problem description
        message: String,
    },

    /// Checkpoint file could not be written
    #[error("checkpoint error at '{path}': {message}")]
    Checkpoint {
        /// Checkpoint file path
        path: PathBuf,
        /// Problem description
        message: String,
    },

    /// Remote storage operation failed
    #[error("transfer error for '{path}': {message}")]
    Transfer {
        /// Remote key or local path involved
        path: String,
        /// Problem description
        message: String,
    },

    /// Backup of the local store failed
    #[error("backup of '{path}' failed: {source}")]
    Backup {
        /// Store file being backed up
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// I/O error with path context
    #[error("I/O error at '{path}': {source}")]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl TableSyncError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a transfer error
    pub fn transfer(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transfer {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Get the path associated with this error, if any
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Io { path, .. }
            | Self::Backup { path, .. }
            | Self::StoreOpen { path, .. }
            | Self::Checkpoint { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// Result type alias for tablesync operations
pub type Result<T> = std::result::Result<T, TableSyncError>;

impl From<serde_json::Error> for TableSyncError {
    fn from(err: serde_json::Error) -> Self {
        TableSyncError::Config(err.to_string())
    }
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| TableSyncError::io(path, e))
    }
}

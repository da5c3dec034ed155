//! Configuration settings for tablesync
//!
//! Defines the CLI arguments and the JSON settings file that describe the
//! remote API, the configured tables, the local data directory layout and
//! the optional remote object store.

use crate::error::{IoResultExt, Result, TableSyncError};
use crate::ingest::TableSpec;
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the API bearer token
pub const API_TOKEN_ENV: &str = "TABLESYNC_API_TOKEN";

/// Default settings file name
pub const DEFAULT_CONFIG_FILE: &str = "tablesync.json";

/// tablesync - paginated API ingestion with remote store reconciliation
#[derive(Parser, Debug, Clone)]
#[command(name = "tablesync")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ingest paginated API tables into a local store and keep it in sync")]
#[command(long_about = r#"
tablesync pulls tables from a paginated JSON API into a local SQLite store,
resuming interrupted runs from checkpoints, and reconciles that store with a
remote object-storage copy.

Examples:
  tablesync refresh                      # Sync from remote, then refresh all tables
  tablesync refresh orders customers     # Refresh selected tables
  tablesync sync --force                 # Pull the remote copy unconditionally
  tablesync upload                       # Push local data to remote storage
  tablesync status                       # Show checkpoints and refresh catalog
"#)]
pub struct CliArgs {
    /// Settings file (JSON)
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_FILE, value_name = "PATH")]
    pub config: PathBuf,

    /// Override the API base URL
    #[arg(long, value_name = "URL")]
    pub base_url: Option<String>,

    /// Override the local data directory
    #[arg(long, value_name = "PATH")]
    pub data_dir: Option<PathBuf>,

    /// Override the page request concurrency limit
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Log line format
    #[arg(long, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Output format for reports
    #[arg(long, value_enum, default_value = "text")]
    pub output_format: OutputFormat,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Refresh tables from the remote API
    #[command(name = "refresh")]
    Refresh {
        /// Tables to refresh (default: all configured tables)
        tables: Vec<String>,
        /// Skip the startup sync with remote storage
        #[arg(long)]
        skip_sync: bool,
    },

    /// Reconcile the local store with remote storage
    #[command(name = "sync")]
    Sync {
        /// Download the remote copy regardless of freshness
        #[arg(long)]
        force: bool,
    },

    /// Upload local data to remote storage
    #[command(name = "upload")]
    Upload,

    /// Download remote data into the data directory
    #[command(name = "download")]
    Download,

    /// Show checkpoints and the local refresh catalog
    #[command(name = "status")]
    Status,

    /// Compare local and remote freshness
    #[command(name = "compare")]
    Compare,
}

/// Log line format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Output format for reports
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// JSON format
    Json,
}

/// Remote API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    /// Base URL; table names are appended as the last path segment
    pub base_url: String,
    /// Page size for tables that don't set their own
    pub default_page_size: usize,
    /// Maximum attempts for transient failures
    pub max_retries: u32,
    /// Maximum attempts for malformed responses
    pub max_malformed_attempts: u32,
    /// First retry delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Retry delay cap in milliseconds
    pub max_backoff_ms: u64,
    /// Jitter fraction applied to each delay, in [0, 1)
    pub jitter: f64,
    /// Maximum in-flight page requests across all tables
    pub concurrency: usize,
    /// Maximum tables ingested at the same time
    pub table_parallelism: usize,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Bearer token sent with every request
    pub bearer_token: Option<String>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            default_page_size: 1000,
            max_retries: 5,
            max_malformed_attempts: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            jitter: 0.25,
            concurrency: 4,
            table_parallelism: 4,
            request_timeout_secs: 60,
            bearer_token: None,
        }
    }
}

impl ApiSettings {
    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// One configured table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSettings {
    /// Table name, also the API path segment
    pub name: String,
    /// Primary key column; presence selects cursor paging
    #[serde(default)]
    pub primary_key: Option<String>,
    /// Offset page size override
    #[serde(default)]
    pub page_size: Option<usize>,
    /// Cursor chunk size override
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

/// Local data directory layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Root of all local data
    pub data_dir: PathBuf,
    /// SQLite store file
    pub database: PathBuf,
    /// Directory of derived snapshot files
    pub snapshot_dir: PathBuf,
    /// Glob selecting snapshot files to transfer
    pub snapshot_pattern: String,
    /// Auxiliary CSV side-file
    pub side_csv: PathBuf,
    /// Resume-state JSON file
    pub resume_state: PathBuf,
    /// Backups kept of the store file (1 = single rolling backup)
    pub backup_generations: usize,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            database: PathBuf::from("tablesync.db"),
            snapshot_dir: PathBuf::from("snapshots"),
            snapshot_pattern: "*.parquet".to_string(),
            side_csv: PathBuf::from("faction.csv"),
            resume_state: PathBuf::from("resume_state.json"),
            backup_generations: 1,
        }
    }
}

impl PathSettings {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    /// Resolved store file path
    pub fn database_path(&self) -> PathBuf {
        self.resolve(&self.database)
    }

    /// Resolved snapshot directory
    pub fn snapshot_dir_path(&self) -> PathBuf {
        self.resolve(&self.snapshot_dir)
    }

    /// Resolved side CSV path
    pub fn side_csv_path(&self) -> PathBuf {
        self.resolve(&self.side_csv)
    }

    /// Resolved resume-state file path
    pub fn resume_state_path(&self) -> PathBuf {
        self.resolve(&self.resume_state)
    }
}

/// Remote storage backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    /// A directory tree (network share, mounted bucket)
    #[default]
    Filesystem,
    /// S3-compatible object storage
    S3,
}

/// Remote storage settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RemoteSettings {
    /// Backend kind
    pub kind: RemoteKind,
    /// Root directory for the filesystem backend
    pub root: Option<PathBuf>,
    /// Bucket for the S3 backend
    pub bucket: Option<String>,
    /// AWS region
    pub region: Option<String>,
    /// Custom endpoint URL (MinIO, Ceph, ...)
    pub endpoint: Option<String>,
    /// Use path-style URLs
    pub path_style: bool,
    /// Key prefix under which all objects live
    pub prefix: Option<String>,
}

impl RemoteSettings {
    /// Fill unset S3 fields from the environment
    pub fn with_env_fallbacks(mut self) -> Self {
        if self.bucket.is_none() {
            self.bucket = std::env::var("S3_BUCKET").ok();
        }
        if self.region.is_none() {
            self.region = std::env::var("AWS_REGION")
                .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
                .ok();
        }
        if self.endpoint.is_none() {
            self.endpoint = std::env::var("AWS_ENDPOINT_URL")
                .ok()
                .or_else(|| std::env::var("S3_ENDPOINT").ok());
        }
        if self.prefix.is_none() {
            self.prefix = std::env::var("S3_PREFIX").ok();
        }
        self
    }

    /// Normalised key prefix ("" or "a/b/")
    pub fn key_prefix(&self) -> String {
        match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(p) if !p.is_empty() => format!("{}/", p),
            _ => String::new(),
        }
    }
}

/// Complete settings file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SyncSettings {
    /// Remote API
    pub api: ApiSettings,
    /// Configured tables
    pub tables: Vec<TableSettings>,
    /// Local data layout
    pub paths: PathSettings,
    /// Remote storage, absent for local-only operation
    pub remote: Option<RemoteSettings>,
}

impl SyncSettings {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let mut settings: Self = serde_json::from_str(&content).map_err(|e| {
            TableSyncError::config(format!("invalid settings file {:?}: {}", path, e))
        })?;
        if settings.api.bearer_token.is_none() {
            settings.api.bearer_token = std::env::var(API_TOKEN_ENV).ok();
        }
        settings.remote = settings.remote.map(RemoteSettings::with_env_fallbacks);
        Ok(settings)
    }

    /// Apply CLI overrides
    pub fn apply_cli(&mut self, args: &CliArgs) {
        if let Some(ref url) = args.base_url {
            self.api.base_url = url.clone();
        }
        if let Some(ref dir) = args.data_dir {
            self.paths.data_dir = dir.clone();
        }
        if let Some(concurrency) = args.concurrency {
            self.api.concurrency = concurrency;
        }
    }

    /// Validate settings shared by every command.
    ///
    /// The API endpoint is only needed to refresh tables and is checked by
    /// [`SyncSettings::validate_api`].
    pub fn validate(&self) -> Result<()> {
        if self.api.default_page_size == 0 {
            return Err(TableSyncError::config("api.default_page_size must be positive"));
        }
        if self.api.concurrency == 0 {
            return Err(TableSyncError::config("api.concurrency must be positive"));
        }
        if self.api.table_parallelism == 0 {
            return Err(TableSyncError::config("api.table_parallelism must be positive"));
        }
        if self.api.max_retries == 0 {
            return Err(TableSyncError::config("api.max_retries must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.api.jitter) {
            return Err(TableSyncError::config("api.jitter must be in [0, 1)"));
        }

        let mut seen = HashSet::new();
        for table in &self.tables {
            if table.name.trim().is_empty() {
                return Err(TableSyncError::config("table names must not be empty"));
            }
            if !seen.insert(table.name.as_str()) {
                return Err(TableSyncError::config(format!(
                    "table '{}' is configured twice",
                    table.name
                )));
            }
            if table.page_size == Some(0) || table.chunk_size == Some(0) {
                return Err(TableSyncError::config(format!(
                    "table '{}' has a zero page or chunk size",
                    table.name
                )));
            }
        }

        if let Some(ref remote) = self.remote {
            match remote.kind {
                RemoteKind::Filesystem if remote.root.is_none() => {
                    return Err(TableSyncError::config(
                        "remote.root is required for the filesystem backend",
                    ));
                }
                RemoteKind::S3 if remote.bucket.as_deref().unwrap_or("").is_empty() => {
                    return Err(TableSyncError::config("remote.bucket is required for s3"));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Validate the settings needed to talk to the API
    pub fn validate_api(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(TableSyncError::config("api.base_url is required"));
        }
        Ok(())
    }

    /// Resolve every configured table into an immutable [`TableSpec`]
    pub fn table_specs(&self) -> Vec<TableSpec> {
        self.tables
            .iter()
            .map(|t| {
                let page_size = t.page_size.unwrap_or(self.api.default_page_size);
                TableSpec::new(
                    t.name.clone(),
                    t.primary_key.clone(),
                    page_size,
                    t.chunk_size.unwrap_or(page_size),
                )
            })
            .collect()
    }
}

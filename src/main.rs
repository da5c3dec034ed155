//! tablesync CLI
//!
//! Refreshes tables from a paginated API into the local store and keeps the
//! data directory in step with remote storage.

use clap::Parser;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tablesync::config::{CliArgs, Commands, LogFormat, OutputFormat, SyncSettings};
use tablesync::error::{Result, TableSyncError};
use tablesync::ingest::{
    CancelSignal, ConcurrencyLimiter, HttpRecordSource, RefreshReport, ResumeCheckpoint,
    ResumeStateStore, RetryExecutor, RetryPolicy, TableIngestor, TableOutcome,
};
use tablesync::progress::{RefreshSpinner, TransferProgressBar};
use tablesync::storage;
use tablesync::store::{LocalStore, TableRefresh};
use tablesync::sync::{
    FreshnessComparator, StartupSyncController, StartupSyncOutcome, SyncMetadata,
    TransferCategory, TransferLayout, TransferOrchestrator, TransferResult,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Parse CLI arguments
    let args = CliArgs::parse();
    init_logging(&args);

    // Handle result
    match run(args).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging(args: &CliArgs) {
    let level = if args.quiet {
        "tablesync=error"
    } else {
        match args.verbose {
            0 => "tablesync=info",
            1 => "tablesync=debug",
            _ => "tablesync=trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match args.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Everything a command needs, built from settings
struct Context {
    settings: SyncSettings,
    output: OutputFormat,
    show_progress: bool,
}

impl Context {
    fn load(args: &CliArgs) -> Result<Self> {
        let mut settings = SyncSettings::load(&args.config)?;
        settings.apply_cli(args);
        settings.validate()?;
        Ok(Self {
            settings,
            output: args.output_format,
            show_progress: !args.quiet && args.output_format == OutputFormat::Text,
        })
    }

    async fn orchestrator(&self) -> Result<Option<TransferOrchestrator>> {
        let Some(ref remote) = self.settings.remote else {
            return Ok(None);
        };
        let storage = storage::from_settings(remote).await?;
        let layout = TransferLayout::from(&self.settings.paths);
        Ok(Some(TransferOrchestrator::new(storage, layout)?))
    }

    async fn require_orchestrator(&self) -> Result<TransferOrchestrator> {
        self.orchestrator()
            .await?
            .ok_or_else(|| TableSyncError::config("no remote storage configured"))
    }

    async fn startup_controller(&self) -> Result<StartupSyncController> {
        Ok(StartupSyncController::new(
            self.orchestrator().await?,
            self.settings.paths.database_path(),
        )
        .with_backup_generations(self.settings.paths.backup_generations))
    }

    fn progress_bar(&self, verb: &str) -> TransferProgressBar {
        let total = TransferCategory::ALL.len();
        if self.show_progress {
            TransferProgressBar::new(verb, total)
        } else {
            TransferProgressBar::disabled(total)
        }
    }

    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T)) -> Result<()> {
        match self.output {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
            OutputFormat::Text => text(value),
        }
        Ok(())
    }
}

async fn run(args: CliArgs) -> Result<bool> {
    let ctx = Context::load(&args)?;

    match args.command {
        Commands::Refresh {
            ref tables,
            skip_sync,
        } => cmd_refresh(&ctx, tables, skip_sync).await,
        Commands::Sync { force } => cmd_sync(&ctx, force).await,
        Commands::Upload => cmd_upload(&ctx).await,
        Commands::Download => cmd_download(&ctx).await,
        Commands::Status => cmd_status(&ctx).await,
        Commands::Compare => cmd_compare(&ctx).await,
    }
}

async fn cmd_refresh(ctx: &Context, tables: &[String], skip_sync: bool) -> Result<bool> {
    let settings = &ctx.settings;
    settings.validate_api()?;

    if !skip_sync {
        let bar = ctx.progress_bar("Syncing");
        let outcome = ctx.startup_controller().await?.run(false, Some(&bar)).await;
        bar.finish_startup(&outcome);
        if !outcome.ready {
            tracing::warn!(
                "Startup sync did not produce a usable store ({}), refreshing from scratch",
                outcome.action
            );
        }
    }

    let cancel = CancelSignal::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing in-flight pages");
            on_interrupt.cancel();
        }
    });

    let source = Arc::new(HttpRecordSource::new(&settings.api)?);
    let store = LocalStore::open(settings.paths.database_path())?;
    let ingestor = TableIngestor::new(
        source,
        store,
        ResumeStateStore::new(settings.paths.resume_state_path()),
        RetryExecutor::new(RetryPolicy::from_settings(&settings.api)),
        ConcurrencyLimiter::new(settings.api.concurrency),
        settings.table_specs(),
    )
    .with_cancel(cancel)
    .with_table_parallelism(settings.api.table_parallelism);

    let names = (!tables.is_empty()).then_some(tables);
    let spinner = RefreshSpinner::new(ctx.show_progress, "Refreshing tables");
    let report = ingestor.refresh(names).await;
    spinner.finish();

    ctx.emit(&report, print_refresh_report)?;
    Ok(report.all_succeeded)
}

fn print_refresh_report(report: &RefreshReport) {
    println!("=== Refresh Summary ===");
    for (table, outcome) in &report.outcomes {
        match outcome {
            TableOutcome::Succeeded {
                rows,
                pages,
                resumed_from_page,
            } => {
                let resumed = resumed_from_page
                    .map(|p| format!(", resumed at page {}", p))
                    .unwrap_or_default();
                println!("✓ {:24} {} rows in {} pages{}", table, rows, pages, resumed);
            }
            TableOutcome::Skipped { reason } => println!("- {:24} skipped: {}", table, reason),
            TableOutcome::Failed {
                error,
                checkpoint_preserved,
            } => {
                let note = if *checkpoint_preserved {
                    " (checkpoint kept)"
                } else {
                    ""
                };
                println!("✗ {:24} {}{}", table, error, note);
            }
        }
    }
    println!(
        "\n{} of {} table(s) succeeded",
        report.succeeded(),
        report.outcomes.len()
    );
}

async fn cmd_sync(ctx: &Context, force: bool) -> Result<bool> {
    let bar = ctx.progress_bar("Downloading");
    let outcome = ctx.startup_controller().await?.run(force, Some(&bar)).await;
    bar.finish_startup(&outcome);
    ctx.emit(&outcome, |o: &StartupSyncOutcome| {
        println!("Sync: {} (store ready: {})", o.action, o.ready);
    })?;
    Ok(outcome.ready)
}

async fn cmd_upload(ctx: &Context) -> Result<bool> {
    let orchestrator = ctx.require_orchestrator().await?;
    let bar = ctx.progress_bar("Uploading");
    let result = orchestrator.upload_all(Some(&bar)).await;
    bar.finish(&result);
    ctx.emit(&result, print_transfer_result)?;
    Ok(result.all_succeeded)
}

async fn cmd_download(ctx: &Context) -> Result<bool> {
    let orchestrator = ctx.require_orchestrator().await?;
    let bar = ctx.progress_bar("Downloading");
    let result = orchestrator.download_all(Some(&bar)).await;
    bar.finish(&result);
    ctx.emit(&result, print_transfer_result)?;
    Ok(result.all_succeeded)
}

fn print_transfer_result(result: &TransferResult) {
    for (category, outcome) in &result.categories {
        let state = if outcome.success {
            "ok"
        } else if outcome.skipped {
            "missing"
        } else {
            "failed"
        };
        println!(
            "{:20} {:8} {} file(s), {}{}",
            category.key(),
            state,
            outcome.files_transferred,
            humansize::format_size(outcome.bytes, humansize::BINARY),
            outcome
                .error
                .as_deref()
                .map(|e| format!(" ({})", e))
                .unwrap_or_default()
        );
    }
}

#[derive(Serialize)]
struct StatusReport {
    database: String,
    checkpoints: BTreeMap<String, ResumeCheckpoint>,
    catalog: Vec<TableRefresh>,
}

async fn cmd_status(ctx: &Context) -> Result<bool> {
    let paths = &ctx.settings.paths;
    let database = paths.database_path();
    let checkpoints = ResumeStateStore::new(paths.resume_state_path());
    let checkpoints = tokio::task::spawn_blocking(move || checkpoints.load_all())
        .await
        .map_err(|e| TableSyncError::StoreUnavailable(format!("status task failed: {}", e)))?;

    let catalog = if database.is_file() {
        LocalStore::open(&database)?.catalog().await?
    } else {
        Vec::new()
    };

    let report = StatusReport {
        database: database.display().to_string(),
        checkpoints,
        catalog,
    };
    ctx.emit(&report, |r| {
        println!("Local store: {}", r.database);
        println!("\nRefreshed tables:");
        if r.catalog.is_empty() {
            println!("  (none)");
        }
        for entry in &r.catalog {
            println!(
                "  {:24} {:>10} rows  {}",
                entry.name,
                entry.row_count,
                entry.refreshed_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        println!("\nCheckpoints:");
        if r.checkpoints.is_empty() {
            println!("  (none)");
        }
        for (table, cp) in &r.checkpoints {
            println!(
                "  {:24} {:?} after {} page(s), {} staged{}",
                table,
                cp.status,
                cp.pages_completed,
                cp.records_staged,
                cp.last_error
                    .as_deref()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default()
            );
        }
    })?;
    Ok(true)
}

async fn cmd_compare(ctx: &Context) -> Result<bool> {
    let orchestrator = ctx.require_orchestrator().await?;
    let metadata = SyncMetadata::gather(
        &ctx.settings.paths.database_path(),
        orchestrator.storage().as_ref(),
        &orchestrator.database_key(),
        &FreshnessComparator::default(),
    )
    .await?;

    ctx.emit(&metadata, |m| {
        let stamp = |t: Option<chrono::DateTime<chrono::Utc>>| {
            t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
        };
        println!("Remote:   {}", orchestrator.storage().describe());
        println!("Local:    exists={} modified={}", m.local_exists, stamp(m.local_modified));
        println!("Remote:   exists={} modified={}", m.cloud_exists, stamp(m.cloud_modified));
        println!("State:    {}", m.freshness_state);
    })?;
    Ok(true)
}

//! Progress reporter implementation
//!
//! Uses indicatif for the category bar of bulk transfers and the spinner
//! shown while tables are refreshed.

use crate::sync::{ProgressSink, StartupSyncOutcome, TransferProgress, TransferResult};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Category progress bar for uploads and downloads
pub struct TransferProgressBar {
    bar: ProgressBar,
    start_time: Instant,
    failed: AtomicUsize,
}

impl TransferProgressBar {
    /// Create a bar labelled with `verb` ("Uploading", "Downloading")
    pub fn new(verb: &str, total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:30.cyan/blue}] {pos}/{len} categories {msg}")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_prefix(verb.to_string());
        Self {
            bar,
            start_time: Instant::now(),
            failed: AtomicUsize::new(0),
        }
    }

    /// Create a hidden bar (quiet mode, JSON output)
    pub fn disabled(total: usize) -> Self {
        let reporter = Self::new("", total);
        reporter.bar.set_draw_target(ProgressDrawTarget::hidden());
        reporter
    }

    /// Categories finished so far
    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// Categories reported as failed
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Finish the bar with a summary of `result`
    pub fn finish(&self, result: &TransferResult) {
        let message = format!(
            "{} of {} succeeded, {} in {}",
            result.succeeded(),
            result.categories.len(),
            humansize::format_size(result.bytes(), humansize::BINARY),
            humantime::format_duration(Duration::from_secs(self.elapsed().as_secs()))
        );
        if result.all_succeeded {
            self.bar.finish_with_message(format!("✓ {}", message));
        } else {
            self.bar.abandon_with_message(format!("✗ {}", message));
        }
    }

    /// Finish the bar after a startup sync. Cleared when nothing was
    /// transferred.
    pub fn finish_startup(&self, outcome: &StartupSyncOutcome) {
        if self.position() == 0 {
            self.bar.finish_and_clear();
        } else if outcome.ready {
            self.bar.finish_with_message(format!("✓ {}", outcome.action));
        } else {
            self.bar.abandon_with_message(format!("✗ {}", outcome.action));
        }
    }

    /// Whether the bar has been finished
    pub fn is_finished(&self) -> bool {
        self.bar.is_finished()
    }
}

impl ProgressSink for TransferProgressBar {
    fn category_finished(&self, progress: &TransferProgress) {
        if !progress.success {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.bar.set_length(progress.total as u64);
        self.bar.set_position(progress.position as u64);
        self.bar.set_message(format!(
            "{} {}",
            if progress.success { "✓" } else { "✗" },
            progress.category
        ));
    }
}

/// Spinner shown while tables are refreshed
pub struct RefreshSpinner {
    spinner: ProgressBar,
}

impl RefreshSpinner {
    /// Start a spinner; hidden when `enabled` is false
    pub fn new(enabled: bool, message: &str) -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            spinner.set_style(style);
        }
        if enabled {
            spinner.enable_steady_tick(Duration::from_millis(120));
        } else {
            spinner.set_draw_target(ProgressDrawTarget::hidden());
        }
        spinner.set_message(message.to_string());
        Self { spinner }
    }

    /// Clear the spinner
    pub fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{StartupAction, StartupSyncController, TransferCategory};

    #[test]
    fn test_transfer_progress_bar() {
        let reporter = TransferProgressBar::disabled(4);

        for (i, category) in TransferCategory::ALL.into_iter().enumerate() {
            reporter.category_finished(&TransferProgress {
                category,
                position: i + 1,
                total: 4,
                success: category != TransferCategory::SideCsv,
            });
        }

        assert_eq!(reporter.position(), 4);
        assert_eq!(reporter.failed(), 1);
        assert!(!reporter.is_finished());
        reporter.finish(&TransferResult::default());
        assert!(reporter.is_finished());
    }

    #[tokio::test]
    async fn test_startup_sync_finishes_bar() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("tablesync.db");
        std::fs::write(&db, b"local").unwrap();

        let untouched = TransferProgressBar::disabled(4);
        let outcome = StartupSyncController::new(None, &db)
            .run(false, Some(&untouched))
            .await;
        untouched.finish_startup(&outcome);
        assert!(untouched.is_finished());
        assert_eq!(untouched.position(), 0);

        let advanced = TransferProgressBar::disabled(4);
        advanced.category_finished(&TransferProgress {
            category: TransferCategory::Database,
            position: 1,
            total: 4,
            success: false,
        });
        advanced.finish_startup(&StartupSyncOutcome {
            ready: false,
            action: StartupAction::DownloadFailed,
        });
        assert!(advanced.is_finished());
    }

    #[test]
    fn test_hidden_spinner() {
        let spinner = RefreshSpinner::new(false, "Refreshing");
        spinner.finish();
    }
}

//! Run command - Back up configured accounts
//!
//! Provides the `cloudkeep run` CLI command which:
//! 1. Loads and validates the configuration
//! 2. Opens the run status database and the per-account caches
//! 3. Mirrors the source directory into each account's backup root
//! 4. Prints one report per account

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cloudkeep_cache::{DatabasePool, SqliteCacheStore, SqliteRunStatusStore};
use cloudkeep_core::config::Config;
use cloudkeep_core::domain::{KindStats, RunReport, RunStatus};
use cloudkeep_sync::mirror::{DirectoryMediaLibrary, DirectoryTreeSource};
use cloudkeep_sync::{BackupEngine, TracingProgressSink};

use crate::output::{format_bytes, get_formatter, OutputFormat, OutputFormatter};

/// Name of the run status database inside the state directory
pub const STATUS_DB: &str = "status.db";

#[derive(Debug, Args)]
pub struct RunCommand {
    /// Back up only this account (default: every configured account)
    #[arg(long)]
    pub account: Option<String>,

    /// Show what would be done without making changes
    #[arg(long)]
    pub dry_run: bool,

    /// Directory holding the remote contents: `drive/` for the tree source
    /// and `photos/` for the media libraries
    #[arg(long, value_name = "DIR")]
    pub source_dir: PathBuf,
}

impl RunCommand {
    pub async fn execute(&self, format: OutputFormat, config_path: &Path) -> Result<()> {
        let formatter = get_formatter(matches!(format, OutputFormat::Json));

        let config = Config::load(config_path)?;
        let errors = config.validate();
        if !errors.is_empty() {
            for e in &errors {
                formatter.error(&e.to_string());
            }
            bail!("Configuration has {} error(s)", errors.len());
        }

        let accounts: Vec<_> = match &self.account {
            Some(id) => vec![config
                .account(id)
                .with_context(|| format!("Account '{}' is not configured", id))?],
            None => config.accounts.iter().collect(),
        };
        if accounts.is_empty() {
            formatter.warn("No accounts configured");
            return Ok(());
        }

        if !self.source_dir.is_dir() {
            bail!("Source directory {} does not exist", self.source_dir.display());
        }

        // Open state
        let state_dir = &config.paths.state_dir;
        tokio::fs::create_dir_all(state_dir)
            .await
            .with_context(|| format!("Failed to create state directory {}", state_dir.display()))?;
        let pool = DatabasePool::new(&state_dir.join(STATUS_DB))
            .await
            .context("Failed to open status database")?;
        let status = Arc::new(SqliteRunStatusStore::new(pool.pool().clone()));

        let engine = BackupEngine::new(
            Arc::new(DirectoryTreeSource::new(self.source_dir.join("drive"))),
            Arc::new(DirectoryMediaLibrary::new(self.source_dir.join("photos"))),
            Arc::new(SqliteCacheStore::new(state_dir)),
            Arc::new(TracingProgressSink),
        )
        .with_status_store(status);

        let cancel = CancellationToken::new();
        let ctrl_c = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, stopping after in-flight transfers");
                    cancel.cancel();
                }
            })
        };

        let mut reports = Vec::with_capacity(accounts.len());
        for account in accounts {
            if cancel.is_cancelled() {
                break;
            }
            let plan = account
                .plan(&config, self.dry_run)
                .with_context(|| format!("Invalid settings for account '{}'", account.account_id))?;
            info!(account = %plan.account, destination = %plan.destination.display(), "Starting backup");

            let report = engine
                .run(&plan, cancel.child_token())
                .await
                .with_context(|| format!("Backup of '{}' could not start", plan.account))?;
            reports.push(report);
        }
        ctrl_c.abort();

        if matches!(format, OutputFormat::Json) {
            let json = serde_json::to_value(&reports).context("Failed to serialize run reports")?;
            formatter.print_json(&json);
        } else {
            for report in &reports {
                print_report(formatter.as_ref(), report);
            }
        }

        let failed = reports
            .iter()
            .filter(|r| r.status == RunStatus::Error)
            .count();
        if failed > 0 {
            bail!("{} backup run(s) failed", failed);
        }
        Ok(())
    }
}

/// Print a run report in human form
pub(crate) fn print_report(formatter: &dyn OutputFormatter, report: &RunReport) {
    let headline = format!("{}: {}", report.account, report.message);
    match report.status {
        RunStatus::Success => formatter.success(&headline),
        RunStatus::SuccessWithWarnings | RunStatus::Cancelled => formatter.warn(&headline),
        RunStatus::Error => formatter.error(&headline),
    }

    if report.dry_run {
        formatter.info("Dry run: no files were changed");
    }
    if let Some(stats) = &report.drive {
        formatter.info(&format!("Drive:  {}", stats_line(stats)));
    }
    if let Some(stats) = &report.photos {
        formatter.info(&format!("Photos: {}", stats_line(stats)));
    }
    if let Some(duration) = report.duration() {
        formatter.info(&format!(
            "Finished in {:.1}s",
            duration.num_milliseconds() as f64 / 1000.0
        ));
    }
    for name in &report.skipped_shared {
        formatter.info(&format!("Skipped shared folder: {}", name));
    }
    for failure in &report.failures {
        formatter.info(&format!(
            "Failed [{}] {}: {}",
            failure.kind, failure.path, failure.reason
        ));
    }
}

fn stats_line(stats: &KindStats) -> String {
    format!(
        "{} processed, {} fetched ({}), {} up to date, {} failed, {} removed, {} archived",
        stats.processed,
        stats.fetched,
        format_bytes(stats.bytes),
        stats.skipped,
        stats.failed,
        stats.removed,
        stats.archived
    )
}

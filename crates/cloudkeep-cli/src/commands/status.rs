//! Status command - Show the last run and local storage usage

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;

use cloudkeep_cache::{DatabasePool, SqliteRunStatusStore};
use cloudkeep_core::config::Config;
use cloudkeep_core::domain::AccountKey;
use cloudkeep_core::ports::IRunStatusStore;
use cloudkeep_sync::storage::storage_usage;

use super::run::{print_report, STATUS_DB};
use crate::output::{format_bytes, get_formatter, OutputFormat};

#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Show only this account
    #[arg(long)]
    pub account: Option<String>,
}

impl StatusCommand {
    pub async fn execute(&self, format: OutputFormat, config_path: &Path) -> Result<()> {
        let formatter = get_formatter(matches!(format, OutputFormat::Json));
        let config = Config::load_or_default(config_path);

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

        // The database only exists once a run has happened
        let db_path = config.paths.state_dir.join(STATUS_DB);
        let store = if db_path.exists() {
            let pool = DatabasePool::new(&db_path)
                .await
                .context("Failed to open status database")?;
            Some(SqliteRunStatusStore::new(pool.pool().clone()))
        } else {
            None
        };

        let mut entries = Vec::with_capacity(accounts.len());
        for account in accounts {
            let key = AccountKey::new(account.account_id.clone())
                .with_context(|| format!("Invalid account id '{}'", account.account_id))?;
            let destination = config.paths.backup_root.join(account.destination_key()?);

            let (state, last) = match &store {
                Some(store) => (
                    store.status(&key).await?,
                    store.last_report(&key).await?,
                ),
                None => (None, None),
            };
            let usage = storage_usage(&destination)
                .await
                .with_context(|| format!("Failed to measure {}", destination.display()))?;

            entries.push((key, destination, state, last, usage));
        }

        if matches!(format, OutputFormat::Json) {
            let json: Vec<_> = entries
                .iter()
                .map(|(key, destination, state, last, usage)| {
                    serde_json::json!({
                        "account": key.as_str(),
                        "destination": destination,
                        "state": state,
                        "last_run": last,
                        "storage": usage,
                    })
                })
                .collect();
            formatter.print_json(&serde_json::Value::Array(json));
            return Ok(());
        }

        for (key, destination, state, last, usage) in &entries {
            formatter.success(&format!("{} ({})", key, destination.display()));
            if state.as_deref() == Some("running") {
                formatter.info("A backup is currently running");
            }
            match last {
                Some(report) => print_report(formatter.as_ref(), report),
                None => formatter.info("Never backed up"),
            }
            formatter.info(&format!(
                "Local storage: {} ({} drive files, {} photos)",
                format_bytes(usage.total_bytes()),
                usage.drive.files,
                usage.photos.files
            ));
            formatter.info("");
        }
        Ok(())
    }
}

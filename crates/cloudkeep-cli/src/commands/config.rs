//! Config command - View and validate cloudkeep configuration

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use tracing::info;

use cloudkeep_core::config::Config;

use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display current configuration
    Show,
    /// Validate configuration file
    Validate,
    /// Print the configuration file location
    Path,
}

impl ConfigCommand {
    pub async fn execute(&self, format: OutputFormat, config_path: &Path) -> Result<()> {
        match self {
            ConfigCommand::Show => self.execute_show(format, config_path),
            ConfigCommand::Validate => self.execute_validate(format, config_path),
            ConfigCommand::Path => self.execute_path(format, config_path),
        }
    }

    fn execute_show(&self, format: OutputFormat, config_path: &Path) -> Result<()> {
        let formatter = get_formatter(matches!(format, OutputFormat::Json));
        let exists = config_path.exists();
        let config = Config::load_or_default(config_path);
        info!(config_path = %config_path.display(), exists, "Showing configuration");

        match format {
            OutputFormat::Json => {
                let config = serde_json::to_value(&config).context("cannot render configuration")?;
                formatter.print_json(&serde_json::json!({
                    "path": config_path,
                    "exists": exists,
                    "config": config,
                }));
            }
            OutputFormat::Human => {
                if exists {
                    formatter.success(&config_path.display().to_string());
                } else {
                    formatter.warn(&format!(
                        "{} does not exist, showing defaults",
                        config_path.display()
                    ));
                }
                let yaml = serde_yaml::to_string(&config).context("cannot render configuration")?;
                yaml.lines().for_each(|line| formatter.info(line));
                for account in &config.accounts {
                    let destination = account
                        .destination_key()
                        .map(|key| config.paths.backup_root.join(key).display().to_string())
                        .unwrap_or_else(|e| format!("invalid ({e})"));
                    formatter.info(&format!("{} -> {}", account.account_id, destination));
                }
            }
        }
        Ok(())
    }

    fn execute_validate(&self, format: OutputFormat, config_path: &Path) -> Result<()> {
        let formatter = get_formatter(matches!(format, OutputFormat::Json));

        let config = match Config::load(config_path) {
            Ok(c) => c,
            Err(e) => {
                if matches!(format, OutputFormat::Json) {
                    formatter.print_json(&serde_json::json!({
                        "valid": false,
                        "path": config_path,
                        "errors": [format!("{:#}", e)],
                    }));
                } else {
                    formatter.error(&format!("{:#}", e));
                }
                bail!("Configuration could not be loaded");
            }
        };

        let errors = config.validate();
        if matches!(format, OutputFormat::Json) {
            let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
            formatter.print_json(&serde_json::json!({
                "valid": errors.is_empty(),
                "path": config_path,
                "errors": messages,
            }));
        } else if errors.is_empty() {
            formatter.success(&format!("Configuration is valid ({})", config_path.display()));
        } else {
            for e in &errors {
                formatter.error(&e.to_string());
            }
        }

        if !errors.is_empty() {
            bail!("Configuration has {} error(s)", errors.len());
        }
        Ok(())
    }

    fn execute_path(&self, format: OutputFormat, config_path: &Path) -> Result<()> {
        let formatter = get_formatter(matches!(format, OutputFormat::Json));
        if matches!(format, OutputFormat::Json) {
            formatter.print_json(&serde_json::json!({
                "path": config_path,
                "exists": config_path.exists(),
            }));
        } else {
            println!("{}", config_path.display());
        }
        Ok(())
    }
}

//! Check-exclude command - Explain whether exclusion rules match a path
//!
//! Rules come from `--rule` arguments, or from the account's configured
//! exclusions when none are given.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Args;

use cloudkeep_core::config::Config;
use cloudkeep_core::domain::exclusion::normalize_path;
use cloudkeep_core::domain::ExclusionRule;
use cloudkeep_sync::ExclusionSet;

use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Args)]
pub struct CheckExcludeCommand {
    /// Path relative to the backup root (e.g. "Work/build/out.o")
    pub path: String,

    /// Rule to test (can be repeated)
    #[arg(long = "rule", value_name = "RULE")]
    pub rules: Vec<String>,

    /// Use this account's exclusions when no --rule is given
    #[arg(long)]
    pub account: Option<String>,
}

impl CheckExcludeCommand {
    pub async fn execute(&self, format: OutputFormat, config_path: &Path) -> Result<()> {
        let formatter = get_formatter(matches!(format, OutputFormat::Json));

        let raw_rules = if !self.rules.is_empty() {
            self.rules.clone()
        } else {
            let config = Config::load_or_default(config_path);
            let account = match &self.account {
                Some(id) => config.account(id),
                None => config.accounts.first(),
            };
            match account {
                Some(a) => a.exclusions.clone(),
                None => bail!("No rules given and no account configured"),
            }
        };

        let rules = raw_rules
            .iter()
            .map(|r| ExclusionRule::parse(r).with_context(|| format!("Invalid rule '{}'", r)))
            .collect::<Result<Vec<_>>>()?;
        let set = ExclusionSet::new(rules);

        let path = normalize_path(&self.path);
        let matching: Vec<String> = set
            .matching_rules(&path)
            .iter()
            .map(|r| r.to_string())
            .collect();
        let excluded = set.is_excluded(&path);
        let prunes = set.prunes_folder(&path);

        if matches!(format, OutputFormat::Json) {
            formatter.print_json(&serde_json::json!({
                "path": path,
                "excluded": excluded,
                "prunes_folder": prunes,
                "matching_rules": matching,
                "rules_checked": set.len(),
            }));
            return Ok(());
        }

        if excluded {
            formatter.success(&format!("'{}' is excluded", path));
            for rule in &matching {
                formatter.info(&format!("matched by: {}", rule));
            }
            if prunes {
                formatter.info("As a folder, its whole subtree is skipped");
            }
        } else {
            formatter.info(&format!(
                "'{}' is not excluded ({} rule(s) checked)",
                path,
                set.len()
            ));
        }
        Ok(())
    }
}

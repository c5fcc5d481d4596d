//! cloudkeep CLI - Command-line interface for cloudkeep
//!
//! Provides commands for:
//! - Running backups for one or all configured accounts
//! - Viewing the last run and local storage usage
//! - Inspecting and validating configuration
//! - Explaining exclusion rules

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use cloudkeep_core::config::Config;
use commands::{
    check_exclude::CheckExcludeCommand, config::ConfigCommand, run::RunCommand,
    status::StatusCommand,
};
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "cloudkeep", version, about = "Incremental cloud backup to local disk")]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Back up configured accounts
    Run(RunCommand),
    /// Show the last run and local storage usage
    Status(StatusCommand),
    /// View and validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Explain whether exclusion rules match a path
    CheckExclude(CheckExcludeCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let logging = Config::load_or_default(&config_path).logging;

    // Setup tracing
    let filter = match cli.verbose {
        0 => logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };

    match cli.command {
        Commands::Run(cmd) => cmd.execute(format, &config_path).await,
        Commands::Status(cmd) => cmd.execute(format, &config_path).await,
        Commands::Config(cmd) => cmd.execute(format, &config_path).await,
        Commands::CheckExclude(cmd) => cmd.execute(format, &config_path).await,
    }
}

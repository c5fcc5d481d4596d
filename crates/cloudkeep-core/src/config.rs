//! Configuration module for cloudkeep.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.
//! The engine never reads this module directly: each run receives a
//! [`BackupPlan`] resolved from it by [`AccountConfig::plan`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::domain::{
    AccountKey, BackupKind, BackupPlan, DomainError, DrivePlan, EngineSettings, ExclusionRule,
    FolderSelection, LibrarySelector, PhotosPlan, SyncPolicy,
};

/// Prefix the remote source uses for shared (family) library identifiers.
pub const SHARED_LIBRARY_PREFIX: &str = "SharedSync-";

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for cloudkeep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
    pub accounts: Vec<AccountConfig>,
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of concurrent downloads per run.
    pub fetch_concurrency: usize,
    /// Size of one streamed chunk in KiB.
    pub chunk_size_kb: usize,
    /// Retries per item for transient remote errors.
    pub max_retries: u32,
    /// First backoff delay in milliseconds; doubled on every retry.
    pub retry_base_delay_ms: u64,
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root under which every account's backup directory is created.
    pub backup_root: PathBuf,
    /// Root under which archived files are mirrored.
    pub archive_root: PathBuf,
    /// Directory for cache databases and run status.
    pub state_dir: PathBuf,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of `trace`, `debug`, `info`, `warn`, `error`.
    pub level: String,
    /// `human` or `json`.
    pub format: String,
}

/// How the Drive folder list is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderMode {
    /// Every top-level folder.
    #[default]
    All,
    /// Top-level folder names from `folders`.
    Names,
    /// Slash-separated paths from `folders`.
    Paths,
}

/// Drive backup settings of one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub enabled: bool,
    pub mode: FolderMode,
    pub folders: Vec<String>,
    pub sync_policy: SyncPolicy,
}

/// Photos backup settings of one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhotosConfig {
    pub enabled: bool,
    /// Also back up the shared (family) library.
    pub include_family: bool,
    /// Identifier of the shared library, as reported by the remote source.
    pub shared_library_id: Option<String>,
    pub sync_policy: SyncPolicy,
}

/// One configured account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Login identity, usually an e-mail address.
    pub account_id: String,
    /// Directory name under the backup root; derived from the id when unset.
    #[serde(default)]
    pub destination: Option<String>,
    /// Exclusion rules applied to both backup kinds.
    #[serde(default)]
    pub exclusions: Vec<String>,
    #[serde(default)]
    pub drive: DriveConfig,
    #[serde(default)]
    pub photos: PhotosConfig,
    /// Cron expression for the external scheduler; stored, not interpreted.
    #[serde(default)]
    pub schedule: Option<String>,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/cloudkeep/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("cloudkeep")
            .join("config.yaml")
    }

    /// Look up an account by id.
    pub fn account(&self, account_id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.account_id == account_id)
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join("cloudkeep")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: 4,
            chunk_size_kb: 256,
            max_retries: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = data_dir();
        Self {
            backup_root: base.join("backup"),
            archive_root: base.join("archive"),
            state_dir: base.join("state"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "human".to_string(),
        }
    }
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: FolderMode::All,
            folders: Vec::new(),
            sync_policy: BackupKind::Drive.default_policy(),
        }
    }
}

impl Default for PhotosConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            include_family: false,
            shared_library_id: None,
            sync_policy: BackupKind::Photos.default_policy(),
        }
    }
}

impl EngineConfig {
    /// Engine settings as the run consumes them.
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            fetch_concurrency: self.fetch_concurrency,
            chunk_size: self.chunk_size_kb * 1024,
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// AccountConfig -> BackupPlan
// ---------------------------------------------------------------------------

impl AccountConfig {
    /// New account with default settings.
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            destination: None,
            exclusions: Vec::new(),
            drive: DriveConfig::default(),
            photos: PhotosConfig::default(),
            schedule: None,
        }
    }

    /// Directory name used under the backup and archive roots.
    pub fn destination_key(&self) -> Result<String, DomainError> {
        match &self.destination {
            Some(dest) if !dest.trim().is_empty() => Ok(dest.trim().to_string()),
            _ => Ok(AccountKey::new(self.account_id.clone())?.destination_key()),
        }
    }

    /// Libraries the photos backup covers, in order.
    ///
    /// The shared library is included only when requested and when its id
    /// has the shape the remote source uses for shared libraries.
    pub fn libraries(&self) -> Vec<LibrarySelector> {
        let mut libraries = vec![LibrarySelector::Personal];
        if self.photos.include_family {
            if let Some(id) = &self.photos.shared_library_id {
                if id.starts_with(SHARED_LIBRARY_PREFIX) {
                    libraries.push(LibrarySelector::Shared(id.clone()));
                }
            }
        }
        libraries
    }

    /// Resolve the immutable snapshot a run executes.
    ///
    /// # Errors
    ///
    /// Returns a [`DomainError`] if the account id or an exclusion rule is
    /// invalid. Call [`Config::validate`] first for a complete report.
    pub fn plan(&self, config: &Config, dry_run: bool) -> Result<BackupPlan, DomainError> {
        let account = AccountKey::new(self.account_id.clone())?;
        let dest = self.destination_key()?;

        let mut plan = BackupPlan::new(
            account,
            config.paths.backup_root.join(&dest),
            config.paths.archive_root.join(&dest),
        );
        plan.exclusions = self
            .exclusions
            .iter()
            .map(|raw| ExclusionRule::parse(raw))
            .collect::<Result<_, _>>()?;
        plan.settings = config.engine.settings();
        plan.dry_run = dry_run;

        if self.drive.enabled {
            let folders = match self.drive.mode {
                FolderMode::All => FolderSelection::All,
                FolderMode::Names => FolderSelection::Names(self.drive.folders.clone()),
                FolderMode::Paths => FolderSelection::Paths(self.drive.folders.clone()),
            };
            plan.drive = Some(DrivePlan {
                folders,
                policy: self.drive.sync_policy,
            });
        }

        if self.photos.enabled {
            plan.photos = Some(PhotosPlan {
                libraries: self.libraries(),
                policy: self.photos.sync_policy,
            });
        }

        Ok(plan)
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"engine.fetch_concurrency"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `logging.format`.
const VALID_LOG_FORMATS: &[&str] = &["human", "json"];

/// Upper bound for `engine.fetch_concurrency`.
const MAX_FETCH_CONCURRENCY: usize = 16;

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut push = |field: String, message: String| {
            errors.push(ValidationError { field, message });
        };

        // --- engine ---
        if self.engine.fetch_concurrency == 0
            || self.engine.fetch_concurrency > MAX_FETCH_CONCURRENCY
        {
            push(
                "engine.fetch_concurrency".into(),
                format!("must be between 1 and {MAX_FETCH_CONCURRENCY}"),
            );
        }
        if self.engine.chunk_size_kb == 0 {
            push("engine.chunk_size_kb".into(), "must be greater than 0".into());
        }
        if self.engine.max_retries > 10 {
            push("engine.max_retries".into(), "must be at most 10".into());
        }

        // --- paths ---
        if self.paths.backup_root.as_os_str().is_empty() {
            push("paths.backup_root".into(), "must not be empty".into());
        }
        if self.paths.archive_root.as_os_str().is_empty() {
            push("paths.archive_root".into(), "must not be empty".into());
        } else if self.paths.archive_root.starts_with(&self.paths.backup_root) {
            push(
                "paths.archive_root".into(),
                "must not be inside paths.backup_root".into(),
            );
        }
        if self.paths.state_dir.as_os_str().is_empty() {
            push("paths.state_dir".into(), "must not be empty".into());
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            push(
                "logging.level".into(),
                format!(
                    "invalid level '{}', expected one of: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            );
        }
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            push(
                "logging.format".into(),
                format!(
                    "invalid format '{}', expected one of: {}",
                    self.logging.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            );
        }

        // --- accounts ---
        let mut seen_ids = HashSet::new();
        let mut seen_destinations = HashSet::new();
        for (i, account) in self.accounts.iter().enumerate() {
            let prefix = format!("accounts[{i}]");

            if let Err(e) = AccountKey::new(account.account_id.clone()) {
                push(format!("{prefix}.account_id"), e.to_string());
            } else if !seen_ids.insert(account.account_id.as_str()) {
                push(
                    format!("{prefix}.account_id"),
                    format!("duplicate account '{}'", account.account_id),
                );
            }

            match account.destination_key() {
                Ok(dest) if dest.contains('/') || dest.contains('\\') || dest == ".." => {
                    push(
                        format!("{prefix}.destination"),
                        "must be a single directory name".into(),
                    );
                }
                Ok(dest) => {
                    if !seen_destinations.insert(dest.clone()) {
                        push(
                            format!("{prefix}.destination"),
                            format!("destination '{dest}' is used by another account"),
                        );
                    }
                }
                // Already reported through account_id
                Err(_) => {}
            }

            for (j, raw) in account.exclusions.iter().enumerate() {
                if let Err(e) = ExclusionRule::parse(raw) {
                    push(format!("{prefix}.exclusions[{j}]"), e.to_string());
                }
            }

            if account.drive.enabled && account.drive.mode != FolderMode::All {
                if account.drive.folders.is_empty() {
                    push(
                        format!("{prefix}.drive.folders"),
                        "must list at least one folder unless mode is 'all'".into(),
                    );
                }
                for (j, folder) in account.drive.folders.iter().enumerate() {
                    let trimmed = folder.trim().trim_matches('/');
                    if trimmed.is_empty() || trimmed.split('/').any(|s| s == ".." || s == ".")
                    {
                        push(
                            format!("{prefix}.drive.folders[{j}]"),
                            format!("invalid folder '{folder}'"),
                        );
                    } else if account.drive.mode == FolderMode::Names && trimmed.contains('/') {
                        push(
                            format!("{prefix}.drive.folders[{j}]"),
                            "folder names must not contain '/'; use mode 'paths'".into(),
                        );
                    }
                }
            }

            if account.photos.enabled && account.photos.include_family {
                match &account.photos.shared_library_id {
                    None => push(
                        format!("{prefix}.photos.shared_library_id"),
                        "required when include_family is set".into(),
                    ),
                    Some(id) if !id.starts_with(SHARED_LIBRARY_PREFIX) => push(
                        format!("{prefix}.photos.shared_library_id"),
                        format!("must start with '{SHARED_LIBRARY_PREFIX}'"),
                    ),
                    Some(_) => {}
                }
            }
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Fluent builder for [`Config`], starting from defaults.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a builder initialised with [`Config::default`].
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- engine ---

    pub fn fetch_concurrency(mut self, n: usize) -> Self {
        self.config.engine.fetch_concurrency = n;
        self
    }

    pub fn chunk_size_kb(mut self, kb: usize) -> Self {
        self.config.engine.chunk_size_kb = kb;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.engine.max_retries = n;
        self
    }

    pub fn retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.engine.retry_base_delay_ms = ms;
        self
    }

    // --- paths ---

    pub fn backup_root(mut self, root: PathBuf) -> Self {
        self.config.paths.backup_root = root;
        self
    }

    pub fn archive_root(mut self, root: PathBuf) -> Self {
        self.config.paths.archive_root = root;
        self
    }

    pub fn state_dir(mut self, dir: PathBuf) -> Self {
        self.config.paths.state_dir = dir;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_format(mut self, format: impl Into<String>) -> Self {
        self.config.logging.format = format.into();
        self
    }

    // --- accounts ---

    pub fn account(mut self, account: AccountConfig) -> Self {
        self.config.accounts.push(account);
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

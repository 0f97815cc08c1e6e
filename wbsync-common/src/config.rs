//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration lives in a small TOML file. Every field has a
//! compiled default, so a missing file is never fatal.
//!
//! # Resolution Priority
//!
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`WBSYNC_ROOT_FOLDER`, `WBSYNC_API_BASE_URL`)
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the data root folder
pub const ROOT_FOLDER_ENV: &str = "WBSYNC_ROOT_FOLDER";

/// Environment variable overriding the remote API base URL
pub const API_BASE_URL_ENV: &str = "WBSYNC_API_BASE_URL";

/// Database file created inside the root folder when no explicit path is configured
pub const DATABASE_FILE_NAME: &str = "wbsync.db";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder for the database and other local state
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Explicit SQLite database path (overrides `<root_folder>/wbsync.db`)
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Remote API client settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Synchronization run settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote API client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL, e.g. `https://api.worldbank.org/v2`
    pub base_url: String,
    /// Records requested per page
    pub per_page: u32,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Retries allowed after the first attempt for transient network failures
    pub max_retries: u32,
    /// First backoff delay, doubled on every further attempt
    pub backoff_base_ms: u64,
    /// Upper bound for a single backoff delay
    pub backoff_max_ms: u64,
    /// Pause after HTTP 429 when the server sends no `Retry-After`
    pub rate_limit_cooldown_ms: u64,
    /// Rate-limit pauses tolerated per request before giving up
    pub max_rate_limit_pauses: u32,
    /// Outbound requests per second shared by all workers
    pub requests_per_second: u32,
    /// Hard cap on pages followed for one task
    pub max_pages: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.worldbank.org/v2".to_string(),
            per_page: 1000,
            request_timeout_secs: 30,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            rate_limit_cooldown_ms: 5_000,
            max_rate_limit_pauses: 10,
            requests_per_second: 10,
            max_pages: 1000,
        }
    }
}

/// Synchronization run settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Concurrent fetch workers
    pub concurrency_limit: usize,
    /// Countries per request; longer lists are split into several tasks
    pub max_countries_per_task: usize,
    /// Optional deadline for a whole run, in seconds
    pub run_deadline_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 10,
            max_countries_per_task: 50,
            run_deadline_secs: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TomlConfig {
    /// Apply environment variable overrides on top of file values
    pub fn apply_env_overrides(&mut self) {
        if let Ok(base_url) = std::env::var(API_BASE_URL_ENV) {
            if !base_url.trim().is_empty() {
                info!("API base URL overridden by {}", API_BASE_URL_ENV);
                self.api.base_url = base_url.trim().to_string();
            }
        }
    }

    /// Reject values that would make a run meaningless
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(Error::Config("api.base_url must not be empty".to_string()));
        }
        if self.api.per_page == 0 {
            return Err(Error::Config("api.per_page must be at least 1".to_string()));
        }
        if self.api.requests_per_second == 0 {
            return Err(Error::Config(
                "api.requests_per_second must be at least 1".to_string(),
            ));
        }
        if self.api.max_pages == 0 {
            return Err(Error::Config("api.max_pages must be at least 1".to_string()));
        }
        if self.sync.concurrency_limit == 0 {
            return Err(Error::Config(
                "sync.concurrency_limit must be at least 1".to_string(),
            ));
        }
        if self.sync.max_countries_per_task == 0 {
            return Err(Error::Config(
                "sync.max_countries_per_task must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Database file location for the given root folder
    pub fn database_path(&self, root_folder: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| root_folder.join(DATABASE_FILE_NAME))
    }
}

/// Load TOML configuration with graceful degradation
///
/// A missing file logs a warning and yields compiled defaults. A file that
/// exists but does not parse is a configuration error.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        warn!(
            "Config file not found at {}, using compiled defaults",
            path.display()
        );
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Write TOML configuration atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;

    Ok(())
}

/// Default config file path for the platform (`<config_dir>/wbsync/wbsync.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("wbsync").join("wbsync.toml"))
}

/// Resolve the data root folder
///
/// Priority: CLI argument → `WBSYNC_ROOT_FOLDER` → TOML `root_folder` →
/// OS default.
pub fn resolve_root_folder(cli_arg: Option<&Path>, toml_config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &toml_config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("wbsync"))
        .unwrap_or_else(|| PathBuf::from("./wbsync_data"))
}

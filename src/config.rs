//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub fragmentation: FragmentationConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Repository backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Backend URL; recognized schemes are `memory://` and `sqlite://<path>`
    #[serde(default = "default_database_url")]
    pub url: String,
}

fn default_database_url() -> String {
    let path = dirs::data_local_dir()
        .map(|p| p.join("fragtree").join("index.db"))
        .unwrap_or_else(|| PathBuf::from("./fragtree_data/index.db"));
    format!("sqlite://{}", path.display())
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

/// Tuning knobs of the fragmentation tree
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FragmentationConfig {
    /// Max members per leaf fragment before a split or pagination
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Branching factor for temporal splits
    #[serde(default = "default_k")]
    pub k: u32,

    /// Floor (seconds) below which temporal splitting yields to pagination
    #[serde(default = "default_min_bucket_span")]
    pub min_bucket_span_secs: u64,
}

fn default_max_size() -> usize {
    100
}

fn default_k() -> u32 {
    4
}

fn default_min_bucket_span() -> u64 {
    300 // 5 minutes
}

impl Default for FragmentationConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            k: default_k(),
            min_bucket_span_secs: default_min_bucket_span(),
        }
    }
}

impl FragmentationConfig {
    /// The pagination floor in milliseconds
    pub fn min_span_ms(&self) -> i64 {
        self.min_bucket_span_secs as i64 * 1000
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("FRAGTREE_DATABASE_URL") {
            self.database.url = url;
        }

        if let Ok(max_size) = std::env::var("FRAGTREE_MAX_SIZE") {
            if let Ok(n) = max_size.parse() {
                self.fragmentation.max_size = n;
            }
        }
        if let Ok(k) = std::env::var("FRAGTREE_K") {
            if let Ok(n) = k.parse() {
                self.fragmentation.k = n;
            }
        }
        if let Ok(span) = std::env::var("FRAGTREE_MIN_BUCKET_SPAN") {
            if let Ok(n) = span.parse() {
                self.fragmentation.min_bucket_span_secs = n;
            }
        }

        if let Ok(level) = std::env::var("FRAGTREE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("FRAGTREE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

//! Configuration System
//!
//! Hierarchical configuration loading from:
//! - zincr.toml (base configuration)
//! - zincr.local.toml (git-ignored local overrides)
//! - Environment variables (ZINCR_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # zincr.toml
//! [store]
//! db_url = "postgresql://postgres@127.0.0.1:5432/zincr"
//! table_prefix = "zincr"
//!
//! [execution]
//! fixpoint_cap = 1000
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! ZINCR_STORE__DB_URL=postgresql://...
//! ZINCR_EXECUTION__FIXPOINT_CAP=500
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SQL store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection URL for the PostgreSQL store
    #[serde(default = "default_db_url")]
    pub db_url: String,

    /// Prefix for Z-set table names
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,

    /// Rows per upsert batch when flushing changes
    #[serde(default = "default_upsert_batch")]
    pub upsert_batch: usize,
}

/// Step evaluator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Hard cap on `integrate_til_zero` iterations per step
    #[serde(default = "default_fixpoint_cap")]
    pub fixpoint_cap: usize,

    /// Upper bound on cross-process frontier polling, in seconds
    #[serde(default = "default_frontier_timeout")]
    pub frontier_timeout_secs: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_db_url() -> String {
    "postgresql://postgres@127.0.0.1:5432/zincr".to_string()
}
fn default_table_prefix() -> String {
    "zincr".to_string()
}
fn default_upsert_batch() -> usize {
    1000
}
fn default_fixpoint_cap() -> usize {
    1000
}
fn default_frontier_timeout() -> f64 {
    5.0
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from default locations.
    ///
    /// Merges in order:
    /// 1. zincr.toml
    /// 2. zincr.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (ZINCR_* prefix)
    pub fn load() -> Result<Self> {
        Figment::new()
            .merge(Toml::file("zincr.toml"))
            .merge(Toml::file("zincr.local.toml"))
            .merge(Env::prefixed("ZINCR_").split("__"))
            .extract()
            .map_err(|e| Box::new(e).into())
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: &str) -> Result<Self> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("ZINCR_").split("__"))
            .extract()
            .map_err(|e| Box::new(e).into())
    }

    /// Install a global tracing subscriber at the configured level.
    /// `RUST_LOG` still wins when set. Idempotent: later calls are no-ops.
    pub fn init_logging(&self) {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.logging.level.clone()));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            store: StoreConfig::default(),
            execution: ExecutionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            db_url: default_db_url(),
            table_prefix: default_table_prefix(),
            upsert_batch: default_upsert_batch(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            fixpoint_cap: default_fixpoint_cap(),
            frontier_timeout_secs: default_frontier_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

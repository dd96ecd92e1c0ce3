//! Serializable sync configuration.
//!
//! One immutable `SyncConfig` value describes a run: which tickers, which
//! store, how to talk to the price source. The CLI loads it from TOML and
//! applies flag overrides before handing it to the engine.

use crate::domain::Ticker;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Retries beyond this only stretch a run against a source that is down.
pub const MAX_RETRIES: u32 = 10;

/// Errors loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("serialize config TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration for a sync run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub universe: UniverseConfig,
    pub store: StoreConfig,
    pub source: SourceConfig,
    pub sync: SyncOptions,
}

impl SyncConfig {
    /// Load a configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse a configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let StoreConfig::Sqlite {
            table, chunk_rows, ..
        } = &self.store
        {
            if *chunk_rows == 0 {
                return Err(ConfigError::Invalid("store.chunk_rows must be > 0".into()));
            }
            if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(ConfigError::Invalid(format!(
                    "store.table '{table}' must be a plain identifier"
                )));
            }
        }
        if self.source.max_retries > MAX_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "source.max_retries must be at most {MAX_RETRIES}"
            )));
        }
        if let UniverseConfig::Fixed { tickers } = &self.universe {
            if tickers.iter().any(|t| t.is_empty()) {
                return Err(ConfigError::Invalid("universe.tickers contains an empty symbol".into()));
            }
        }
        Ok(())
    }
}

/// Where the ticker list comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UniverseConfig {
    /// A configured list.
    Fixed { tickers: Vec<Ticker> },
    /// Every group of a TOML groups file (`[groups] name = [...]`).
    File { path: PathBuf },
    /// Every common stock listed in the Nasdaq Trader symbol directory.
    NasdaqDirectory {
        #[serde(default = "default_true")]
        include_etfs: bool,
        /// HTTP timeout for each directory download.
        #[serde(default = "default_directory_timeout_secs")]
        timeout_secs: u64,
    },
}

impl UniverseConfig {
    /// The Nasdaq Trader directory with the default download timeout.
    pub fn nasdaq_directory(include_etfs: bool) -> Self {
        UniverseConfig::NasdaqDirectory {
            include_etfs,
            timeout_secs: default_directory_timeout_secs(),
        }
    }
}

impl Default for UniverseConfig {
    fn default() -> Self {
        UniverseConfig::Fixed {
            tickers: ["QQQ", "TQQQ", "SQQQ"].into_iter().map(Ticker::new).collect(),
        }
    }
}

/// Which store backend holds the prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Single relational table in a SQLite file.
    Sqlite {
        path: PathBuf,
        #[serde(default = "default_table")]
        table: String,
        /// Rows per INSERT statement during a merge.
        #[serde(default = "default_chunk_rows")]
        chunk_rows: usize,
    },
    /// One Parquet document per ticker, partitioned by year.
    Parquet { dir: PathBuf },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::sqlite("stock_data.sqlite")
    }
}

impl StoreConfig {
    /// SQLite file with the default table and chunk size.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        StoreConfig::Sqlite {
            path: path.into(),
            table: default_table(),
            chunk_rows: default_chunk_rows(),
        }
    }

    pub fn parquet(dir: impl Into<PathBuf>) -> Self {
        StoreConfig::Parquet { dir: dir.into() }
    }

    /// The SQLite file or Parquet directory.
    pub fn location(&self) -> &Path {
        match self {
            StoreConfig::Sqlite { path, .. } => path,
            StoreConfig::Parquet { dir } => dir,
        }
    }

    /// Same backend and settings at a different location.
    pub fn with_location(self, location: impl Into<PathBuf>) -> Self {
        match self {
            StoreConfig::Sqlite {
                table, chunk_rows, ..
            } => StoreConfig::Sqlite {
                path: location.into(),
                table,
                chunk_rows,
            },
            StoreConfig::Parquet { .. } => StoreConfig::Parquet {
                dir: location.into(),
            },
        }
    }
}

/// HTTP settings for the remote price source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub user_agent: String,
    /// Consecutive failures before the circuit breaker opens.
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            base_delay_ms: 500,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".into(),
            breaker_threshold: 3,
            breaker_cooldown_secs: 30 * 60,
        }
    }
}

/// Engine behaviour switches.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Run independent batches concurrently.
    pub parallel: bool,
}

fn default_true() -> bool {
    true
}

fn default_directory_timeout_secs() -> u64 {
    30
}

fn default_table() -> String {
    "prices".into()
}

fn default_chunk_rows() -> usize {
    100
}

//! # pool-config
//!
//! Configuration management for a storage pool node.
//!
//! Loads configuration from:
//! 1. `~/.pool/config.toml` (global)
//! 2. `<base_dir>/config.toml` (pool-local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! Runtime changes made through administrative commands are kept apart from
//! the configuration files, in the pool's `setup.toml` (see [`setup`]).

pub mod logging;
pub mod setup;
pub mod size;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub use setup::PoolSetup;
pub use size::{DiskSpace, SizeParseError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Overlay `overlay` onto `base`. Keys present in the overlay win, whatever
/// their value; nested tables are merged key by key.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(inner)), toml::Value::Table(value)) => merge_tables(inner, value),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub repository: RepositoryConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations.
    ///
    /// `base_dir` selects the pool whose local `config.toml` is layered on top
    /// of the global one. When `None`, the base directory from the global
    /// config (or `POOL_BASE_DIR`) is used.
    pub fn load(base_dir: Option<&Path>) -> Result<Self, ConfigError> {
        // 1. Global config (~/.pool/config.toml)
        let mut layered = toml::Table::new();
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                layered = std::fs::read_to_string(&global_path)?.parse()?;
            }
        }
        let mut config = Self::from_table(layered.clone())?;

        if let Some(dir) = base_dir {
            config.pool.base_dir = dir.to_path_buf();
        }
        config.apply_env_overrides();

        // 2. Pool-local config overrides global
        let local_path = config.pool.base_dir.join("config.toml");
        if local_path.exists() {
            debug!("Loading pool config from {:?}", local_path);
            let local: toml::Table = std::fs::read_to_string(&local_path)?.parse()?;
            merge_tables(&mut layered, local);
            config = Self::from_table(layered)?;
        }

        // 3. Environment wins over both files
        config.apply_env_overrides();
        if let Some(dir) = base_dir {
            config.pool.base_dir = dir.to_path_buf();
        }

        Ok(config)
    }

    /// Global config path: ~/.pool/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".pool/config.toml"))
    }

    fn from_table(table: toml::Table) -> Result<Self, ConfigError> {
        Ok(toml::Value::Table(table).try_into()?)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("POOL_BASE_DIR") {
            self.pool.base_dir = PathBuf::from(path);
        }
        if let Ok(name) = std::env::var("POOL_NAME") {
            if !name.is_empty() {
                self.pool.name = name;
            }
        }
        if let Ok(level) = std::env::var("POOL_LOG") {
            self.logging.level = level;
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }

    /// Path of the persisted runtime setup for this pool.
    pub fn setup_path(&self) -> PathBuf {
        setup::setup_path(&self.pool.base_dir)
    }
}

/// Pool identity and layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Name under which this pool registers replica locations
    pub name: String,
    /// Root directory holding `meta/`, `data/` and `setup.toml`
    pub base_dir: PathBuf,
    /// Ask the namespace to drop files whose last replica leaves this pool
    pub volatile: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let base_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".pool/default");
        Self {
            name: "pool".to_string(),
            base_dir,
            volatile: false,
        }
    }
}

/// Replica repository tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Statically configured pool size (None = bounded by the file system)
    pub max_diskspace: Option<DiskSpace>,
    /// Space reported as always removable to the pool manager
    pub gap: Option<DiskSpace>,
    /// Extra delay added to sticky expiration tasks to absorb clock granularity
    pub sticky_expiration_skew_ms: u64,
    /// Lifetime of the default sticky flag granted to freshly cached replicas
    pub cached_hold_secs: u64,
    /// Period of the background health check
    pub health_check_interval_secs: u64,
    /// Capacity of the event queue feeding the notification dispatcher
    pub notification_queue_capacity: usize,
    /// Deliver events on the mutating thread (tests only)
    pub synchronous_notification: bool,
    /// Fixed back-off between retries of metadata and namespace operations
    pub retry_interval_ms: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            max_diskspace: None,
            gap: None,
            sticky_expiration_skew_ms: 10,
            cached_hold_secs: 300,
            health_check_interval_secs: 60,
            notification_queue_capacity: 4096,
            synchronous_notification: false,
            retry_interval_ms: 1000,
        }
    }
}

impl RepositoryConfig {
    pub fn sticky_expiration_skew(&self) -> Duration {
        Duration::from_millis(self.sticky_expiration_skew_ms)
    }

    pub fn cached_hold(&self) -> Duration {
        Duration::from_secs(self.cached_hold_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// error, warn, info, debug or trace
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Temporary pool directories
//! - A matching `Config` with test-friendly timings
//!
//! # Usage
//!
//! ```ignore
//! use pool_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     // env.base_dir is isolated; env.config points at it
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with its own pool directory
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Pool base directory
    pub base_dir: PathBuf,
    /// Configuration pointing at `base_dir`
    pub config: Config,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let base_dir = temp_dir.path().join("pool");
        std::fs::create_dir_all(&base_dir)?;

        let mut config = Config::default();
        config.pool.name = format!("test-pool-{}", test_id);
        config.pool.base_dir = base_dir.clone();
        config.repository.sticky_expiration_skew_ms = 5;
        config.repository.retry_interval_ms = 20;
        config.repository.health_check_interval_secs = 3600;

        Ok(Self {
            _temp_dir: temp_dir,
            base_dir,
            config,
            test_id,
        })
    }

    /// Path of the persisted runtime setup
    pub fn setup_path(&self) -> PathBuf {
        self.config.setup_path()
    }

    /// Write a pool-local config file
    pub fn write_local_config(&self, contents: &str) -> anyhow::Result<PathBuf> {
        let path = self.base_dir.join("config.toml");
        std::fs::write(&path, contents)?;
        Ok(path)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.base_dir.exists());
        assert_eq!(env.config.pool.base_dir, env.base_dir);
    }

    #[test]
    fn test_environment_has_unique_pool_names() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.config.pool.name, env2.config.pool.name);
        assert_ne!(env1.base_dir, env2.base_dir);
    }

    #[test]
    fn test_setup_path_inside_pool() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.setup_path().starts_with(&env.base_dir));
    }
}

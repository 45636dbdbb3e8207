//! Persisted runtime setup of a pool.
//!
//! Administrative commands such as `set max-diskspace` change the running
//! pool and are recorded here so the next start applies them again.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{ConfigError, DiskSpace};

/// Setup file path: `<base_dir>/setup.toml`
pub fn setup_path(base_dir: &Path) -> PathBuf {
    base_dir.join("setup.toml")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSetup {
    /// Pool size set at runtime; overrides the configured size
    pub max_diskspace: Option<DiskSpace>,
    /// Gap set at runtime
    pub gap: Option<DiskSpace>,
}

impl PoolSetup {
    /// Load the setup file. A missing file yields an empty setup.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        debug!("Loading pool setup from {:?}", path);
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Write the setup atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension(format!("toml.{}.tmp", std::process::id()));
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;

        if let Err(e) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_setup_is_empty() {
        let temp = TempDir::new().unwrap();
        let setup = PoolSetup::load(&setup_path(temp.path())).unwrap();
        assert_eq!(setup, PoolSetup::default());
    }

    #[test]
    fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = setup_path(temp.path());

        let setup = PoolSetup {
            max_diskspace: Some(DiskSpace::Bytes(10 << 30)),
            gap: Some(DiskSpace::Bytes(4096)),
        };
        setup.save(&path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("max_diskspace = \"10g\""));
        assert_eq!(PoolSetup::load(&path).unwrap(), setup);
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        PoolSetup::default().save(&setup_path(temp.path())).unwrap();
        let names: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }
}

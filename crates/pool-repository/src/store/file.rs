//! Directory-backed metadata store.
//!
//! ```text
//! <base_dir>/
//! ├── meta/
//! │   └── <ID>.json    # one record per replica
//! └── data/
//!     └── <ID>         # replica bytes
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use nix::sys::statvfs::statvfs;
use parking_lot::Mutex;
use pool_config::{log_repo_debug, log_repo_warn};
use tracing::field::display;

use super::{MetadataStore, PersistedRecord, StoreError, StoreResult};
use crate::id::ReplicaId;

const RECORD_EXT: &str = "json";
const HEALTH_PROBE: &str = ".health-probe";

#[derive(Debug)]
pub struct FileMetadataStore {
    root: PathBuf,
    meta_dir: PathBuf,
    data_dir: PathBuf,
    /// Serialises create so the existence check and the write are atomic
    create_lock: Mutex<()>,
}

impl FileMetadataStore {
    /// Open the store under `root`, creating `meta/` and `data/` if needed.
    pub fn open<P: AsRef<Path>>(root: P) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        let meta_dir = root.join("meta");
        let data_dir = root.join("data");
        fs::create_dir_all(&meta_dir)?;
        fs::create_dir_all(&data_dir)?;
        Ok(Self {
            root,
            meta_dir,
            data_dir,
            create_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &ReplicaId) -> PathBuf {
        self.meta_dir.join(format!("{}.{}", id, RECORD_EXT))
    }

    /// Write a record atomically using temp file + rename.
    fn write_record(&self, record: &PersistedRecord) -> StoreResult<()> {
        let path = self.record_path(&record.id);
        let json = serde_json::to_vec_pretty(record).map_err(|e| StoreError::Corrupted {
            id: record.id.to_string(),
            reason: e.to_string(),
        })?;

        let temp_path = self.meta_dir.join(format!(
            ".{}.{}.{:?}.tmp",
            record.id,
            std::process::id(),
            std::thread::current().id()
        ));
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;

        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::Io(e));
        }
        Ok(())
    }

    fn statvfs(&self) -> StoreResult<nix::sys::statvfs::Statvfs> {
        statvfs(&self.data_dir).map_err(|e| StoreError::Io(io::Error::from(e)))
    }
}

impl MetadataStore for FileMetadataStore {
    fn list(&self) -> StoreResult<Vec<ReplicaId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.meta_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with('.') {
                continue;
            }
            match stem.parse::<ReplicaId>() {
                Ok(id) => ids.push(id),
                Err(e) => log_repo_warn!(
                    "Ignoring foreign file in metadata directory",
                    path = display(path.display()),
                    error = display(&e)
                ),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn get(&self, id: &ReplicaId) -> StoreResult<Option<PersistedRecord>> {
        let path = self.record_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut record: PersistedRecord =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupted {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        if &record.id != id {
            return Err(StoreError::Corrupted {
                id: id.to_string(),
                reason: format!("record carries id {}", record.id),
            });
        }

        // The data file is authoritative for the replica size.
        if let Ok(meta) = fs::metadata(self.data_path(id)) {
            if meta.len() != record.size {
                log_repo_debug!(
                    "Reconciled replica size",
                    id = id.as_str(),
                    recorded = record.size,
                    actual = meta.len()
                );
                record.size = meta.len();
            }
        }
        Ok(Some(record))
    }

    fn create(&self, record: &PersistedRecord) -> StoreResult<()> {
        let _guard = self.create_lock.lock();
        if self.record_path(&record.id).exists() {
            return Err(StoreError::Duplicate(record.id.clone()));
        }
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.data_path(&record.id))?;
        self.write_record(record)
    }

    fn put(&self, record: &PersistedRecord) -> StoreResult<()> {
        self.write_record(record)
    }

    fn remove(&self, id: &ReplicaId) -> StoreResult<()> {
        for path in [self.data_path(id), self.record_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn data_path(&self, id: &ReplicaId) -> PathBuf {
        self.data_dir.join(id.as_str())
    }

    fn free_space(&self) -> StoreResult<u64> {
        let stat = self.statvfs()?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    fn total_space(&self) -> StoreResult<u64> {
        let stat = self.statvfs()?;
        Ok(stat.blocks() as u64 * stat.fragment_size() as u64)
    }

    fn check_health(&self) -> StoreResult<()> {
        let probe = self.meta_dir.join(HEALTH_PROBE);
        let mut file = File::create(&probe)?;
        file.write_all(b"ok")?;
        file.sync_all()?;
        fs::remove_file(&probe)?;
        Ok(())
    }
}

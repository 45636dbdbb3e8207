//! Persistent metadata records and the store abstraction behind them.

mod file;

pub use file::FileMetadataStore;

use std::io;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attributes::FileAttributes;
use crate::id::ReplicaId;
use crate::state::ReplicaState;
use crate::sticky::StickyRecord;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("record already exists: {0}")]
    Duplicate(ReplicaId),

    #[error("metadata store timed out: {0}")]
    Timeout(String),

    #[error("corrupted record {id}: {reason}")]
    Corrupted { id: String, reason: String },
}

impl StoreError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The persisted form of one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: ReplicaId,
    pub state: ReplicaState,
    pub size: u64,
    pub created_ms: u64,
    pub last_access_ms: u64,
    #[serde(default)]
    pub sticky: Vec<StickyRecord>,
    pub attributes: FileAttributes,
}

impl PersistedRecord {
    /// A fresh record as written by `create`.
    pub fn new(attributes: FileAttributes, state: ReplicaState) -> Self {
        let now = epoch_millis(SystemTime::now());
        Self {
            id: attributes.id.clone(),
            state,
            size: 0,
            created_ms: now,
            last_access_ms: now,
            sticky: Vec::new(),
            attributes,
        }
    }
}

pub(crate) fn epoch_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Storage of replica metadata and data files.
///
/// `get` may fail with [`StoreError::Timeout`]; callers retry those
/// indefinitely. Free and total space are probes of the underlying file
/// system and are not synchronised with the space ledger.
pub trait MetadataStore: Send + Sync {
    /// Ids of every persisted record.
    fn list(&self) -> StoreResult<Vec<ReplicaId>>;

    fn get(&self, id: &ReplicaId) -> StoreResult<Option<PersistedRecord>>;

    /// Persist a new record and create its empty data file.
    /// Fails with [`StoreError::Duplicate`] if the id is already present.
    fn create(&self, record: &PersistedRecord) -> StoreResult<()>;

    /// Overwrite an existing record.
    fn put(&self, record: &PersistedRecord) -> StoreResult<()>;

    /// Erase the record and its data file. Removing an absent id succeeds.
    fn remove(&self, id: &ReplicaId) -> StoreResult<()>;

    fn data_path(&self, id: &ReplicaId) -> PathBuf;

    fn free_space(&self) -> StoreResult<u64>;

    fn total_space(&self) -> StoreResult<u64>;

    /// Verify the store is still writable.
    fn check_health(&self) -> StoreResult<()>;
}

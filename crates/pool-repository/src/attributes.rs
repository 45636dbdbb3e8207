//! File attributes carried alongside a replica.

use serde::{Deserialize, Serialize};

use crate::id::ReplicaId;

/// Namespace attributes of the file a replica belongs to.
///
/// The repository only interprets `size`; the remaining fields are stored
/// and forwarded to the namespace untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub id: ReplicaId,
    /// Expected size in bytes, if known before the transfer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_class: Option<String>,
    /// Pools the namespace lists as holding a replica
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<String>,
}

impl FileAttributes {
    pub fn new(id: ReplicaId) -> Self {
        Self {
            id,
            size: None,
            checksum: None,
            storage_class: None,
            cache_class: None,
            locations: Vec::new(),
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_storage_class(mut self, storage_class: impl Into<String>) -> Self {
        self.storage_class = Some(storage_class.into());
        self
    }
}

//! Client side of the namespace (catalog) service.

use thiserror::Error;

use crate::attributes::FileAttributes;
use crate::id::ReplicaId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NamespaceError {
    /// The file no longer exists in the catalog.
    #[error("file not found in namespace: {0}")]
    FileNotFound(ReplicaId),

    #[error("namespace request timed out: {0}")]
    Timeout(String),

    #[error("namespace error: {0}")]
    Other(String),
}

impl NamespaceError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, NamespaceError::Timeout(_))
    }

    pub fn is_file_not_found(&self) -> bool {
        matches!(self, NamespaceError::FileNotFound(_))
    }
}

pub type NamespaceResult<T> = std::result::Result<T, NamespaceError>;

/// Operations the repository needs from the catalog.
///
/// `FileNotFound` from any call means the file was deleted concurrently; the
/// repository reacts by removing its replica instead of failing.
pub trait Namespace: Send + Sync {
    fn set_file_attributes(&self, id: &ReplicaId, attributes: &FileAttributes) -> NamespaceResult<()>;

    fn add_cache_location(&self, id: &ReplicaId, pool: &str) -> NamespaceResult<()>;

    /// Drop `pool` from the file's locations. With `remove_if_last` the
    /// catalog deletes the file once no location is left.
    fn clear_cache_location(&self, id: &ReplicaId, pool: &str, remove_if_last: bool) -> NamespaceResult<()>;

    fn get_file_attributes(&self, id: &ReplicaId) -> NamespaceResult<FileAttributes>;
}

/// Namespace for a pool operated without a catalog connection.
///
/// Location updates are accepted and dropped. Attribute lookups fail, so an
/// aborted upload is always kept as broken.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNamespace;

impl Namespace for NullNamespace {
    fn set_file_attributes(&self, _id: &ReplicaId, _attributes: &FileAttributes) -> NamespaceResult<()> {
        Ok(())
    }

    fn add_cache_location(&self, _id: &ReplicaId, _pool: &str) -> NamespaceResult<()> {
        Ok(())
    }

    fn clear_cache_location(&self, _id: &ReplicaId, _pool: &str, _remove_if_last: bool) -> NamespaceResult<()> {
        Ok(())
    }

    fn get_file_attributes(&self, id: &ReplicaId) -> NamespaceResult<FileAttributes> {
        Err(NamespaceError::Other(format!("no namespace connection to look up {}", id)))
    }
}

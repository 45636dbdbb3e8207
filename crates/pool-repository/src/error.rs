//! Error taxonomy surfaced by the replica repository.

use std::io;

use thiserror::Error;

use crate::account::LedgerError;
use crate::id::ReplicaId;
use crate::namespace::NamespaceError;
use crate::state::ReplicaState;
use crate::store::StoreError;

/// Errors returned by repository operations and replica handles
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Illegal state transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: ReplicaId,
        from: ReplicaState,
        to: ReplicaState,
    },

    #[error("File not in cache: {id} ({reason})")]
    FileNotInCache { id: ReplicaId, reason: String },

    #[error("Entry already exists: {0}")]
    DuplicateEntry(ReplicaId),

    #[error("File corrupted: {id}: expected {expected} bytes, got {actual}")]
    FileCorrupted {
        id: ReplicaId,
        expected: u64,
        actual: u64,
    },

    #[error("Disk error: {0}")]
    DiskError(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Allocation interrupted")]
    Interrupted,

    #[error("Namespace error: {0}")]
    Namespace(#[from] NamespaceError),

    #[error("Metadata store error: {0}")]
    Store(#[from] StoreError),
}

impl RepositoryError {
    pub(crate) fn not_in_cache(id: &ReplicaId, reason: impl Into<String>) -> Self {
        RepositoryError::FileNotInCache {
            id: id.clone(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        match self {
            RepositoryError::Interrupted => true,
            RepositoryError::Namespace(e) => e.is_timeout(),
            RepositoryError::Store(e) => e.is_timeout(),
            _ => false,
        }
    }
}

impl From<LedgerError> for RepositoryError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Cancelled => RepositoryError::Interrupted,
            other => RepositoryError::IllegalState(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RepositoryError::Interrupted.is_retryable());
        assert!(RepositoryError::Store(StoreError::Timeout("slow".into())).is_retryable());
        assert!(!RepositoryError::IllegalState("closed".into()).is_retryable());
        let id: ReplicaId = "00A1".parse().unwrap();
        assert!(!RepositoryError::DuplicateEntry(id).is_retryable());
    }

    #[test]
    fn test_transition_message() {
        let err = RepositoryError::IllegalTransition {
            id: "00A1".parse().unwrap(),
            from: ReplicaState::Removed,
            to: ReplicaState::Cached,
        };
        assert_eq!(
            err.to_string(),
            "Illegal state transition for 00A1: REMOVED -> CACHED"
        );
    }
}

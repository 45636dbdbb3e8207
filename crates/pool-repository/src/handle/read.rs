use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pool_config::log_repo_warn;
use tracing::field::display;

use super::{data_file_length, ReplicaChannel};
use crate::attributes::FileAttributes;
use crate::error::{RepositoryError, Result};
use crate::id::ReplicaId;
use crate::record::{CacheEntry, ReplicaRecord};
use crate::repository::{Deferred, RepositoryInner};
use crate::state::ReplicaState;

/// Handle on a complete replica. While open, the replica's data file is not
/// deleted even if the replica is removed.
pub struct ReadHandle {
    repo: Arc<RepositoryInner>,
    record: Arc<ReplicaRecord>,
    closed: AtomicBool,
}

impl fmt::Debug for ReadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadHandle")
            .field("id", self.record.id())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ReadHandle {
    pub(crate) fn new(repo: Arc<RepositoryInner>, record: Arc<ReplicaRecord>) -> Self {
        Self {
            repo,
            record,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &ReplicaId {
        self.record.id()
    }

    pub fn entry(&self) -> CacheEntry {
        self.record.snapshot()
    }

    pub fn attributes(&self) -> FileAttributes {
        self.record.lock().attributes.clone()
    }

    /// Open the data file for reading.
    ///
    /// A data file whose length disagrees with the recorded size marks the
    /// replica broken.
    pub fn create_channel(&self) -> Result<ReplicaChannel> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RepositoryError::IllegalState("Handle is closed".to_string()));
        }
        let path = self.repo.store.data_path(self.id());
        let length = data_file_length(&path)
            .map_err(|e| self.repo.disk_error(format!("Failed to stat {}", path.display()), e))?;

        let mut deferred = Deferred::default();
        let mismatch = {
            let _io = self.record.lock_io();
            let mut data = self.record.lock();
            let expected = data.attributes.size.unwrap_or(data.size);
            if expected == length {
                None
            } else {
                if matches!(data.state, ReplicaState::Precious | ReplicaState::Cached) {
                    if let Err(e) = self.repo.apply_state(
                        &self.record,
                        &mut data,
                        ReplicaState::Broken,
                        &mut deferred,
                    ) {
                        log_repo_warn!(
                            "Failed to mark replica broken",
                            id = self.id().as_str(),
                            error = display(&e)
                        );
                    }
                }
                Some(expected)
            }
        };
        self.repo.run_deferred(deferred);

        if let Some(expected) = mismatch {
            return Err(RepositoryError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "File size mismatch for {}: expected {} bytes, found {}",
                    self.id(),
                    expected,
                    length
                ),
            )));
        }
        ReplicaChannel::open_read(&path).map_err(RepositoryError::Io)
    }

    /// Release the handle. The last reader of a removed replica destroys it.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(RepositoryError::IllegalState("Handle is closed".to_string()));
        }
        let _io = self.record.lock_io();
        let mut data = self.record.lock();
        data.link_count = data.link_count.saturating_sub(1);
        if data.state == ReplicaState::Removed && data.link_count == 0 {
            self.repo.destroy(&self.record, &mut data)?;
        } else {
            let entry = data.snapshot();
            self.repo.entry_changed(&entry);
        }
        Ok(())
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        log_repo_warn!("Read handle dropped without close", id = self.id().as_str());
        if let Err(e) = self.close() {
            log_repo_warn!(
                "Failed to close read handle",
                id = self.id().as_str(),
                error = display(&e)
            );
        }
    }
}

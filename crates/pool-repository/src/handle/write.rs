//! Write handle: transactional creation of a replica.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use pool_config::{log_repo_error, log_repo_warn};
use tracing::field::display;

use super::{data_file_length, OpenFlags, ReplicaChannel};
use crate::account::{CancellationToken, LedgerError};
use crate::error::{RepositoryError, Result};
use crate::fault::FaultAction;
use crate::id::ReplicaId;
use crate::namespace::NamespaceError;
use crate::record::{CacheEntry, RecordGuard, ReplicaRecord};
use crate::repository::{Deferred, RepositoryInner};
use crate::state::ReplicaState;
use crate::sticky::StickyRecord;

/// Owner of the default sticky flag granted to freshly cached replicas
pub const CACHED_HOLD_OWNER: &str = "self";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Committed,
    Closed,
}

#[derive(Debug)]
struct Progress {
    phase: Phase,
    /// Bytes reserved in the ledger for this replica
    allocated: u64,
}

/// Handle through which a new replica is written.
///
/// Methods take `&self` so another thread may `close` the handle while an
/// `allocate` call is blocked; the allocation then fails with
/// [`RepositoryError::Interrupted`].
pub struct WriteHandle {
    repo: Arc<RepositoryInner>,
    record: Arc<ReplicaRecord>,
    target: ReplicaState,
    sticky: Vec<StickyRecord>,
    flags: OpenFlags,
    token: CancellationToken,
    progress: Mutex<Progress>,
}

impl fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteHandle")
            .field("id", self.record.id())
            .field("target", &self.target)
            .field("progress", &*self.progress.lock())
            .finish()
    }
}

impl WriteHandle {
    pub(crate) fn new(
        repo: Arc<RepositoryInner>,
        record: Arc<ReplicaRecord>,
        target: ReplicaState,
        sticky: Vec<StickyRecord>,
        flags: OpenFlags,
    ) -> Self {
        Self {
            repo,
            record,
            target,
            sticky,
            flags,
            token: CancellationToken::new(),
            progress: Mutex::new(Progress {
                phase: Phase::Open,
                allocated: 0,
            }),
        }
    }

    pub fn id(&self) -> &ReplicaId {
        self.record.id()
    }

    pub fn target_state(&self) -> ReplicaState {
        self.target
    }

    /// Bytes reserved so far.
    pub fn allocated(&self) -> u64 {
        self.progress.lock().allocated
    }

    pub fn entry(&self) -> CacheEntry {
        self.record.snapshot()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.progress.lock().phase {
            Phase::Open => Ok(()),
            Phase::Committed => Err(RepositoryError::IllegalState(
                "Handle is committed".to_string(),
            )),
            Phase::Closed => Err(RepositoryError::IllegalState("Handle is closed".to_string())),
        }
    }

    /// Open the data file for writing.
    pub fn create_channel(&self) -> Result<ReplicaChannel> {
        self.ensure_open()?;
        let path = self.repo.store.data_path(self.id());
        ReplicaChannel::open_write(&path).map_err(|e| {
            self.repo
                .disk_error(format!("Failed to open {}", path.display()), &e);
            RepositoryError::Io(e)
        })
    }

    /// Record a successful reservation, unless the handle was closed while
    /// the ledger was being asked.
    fn allocated_bytes(&self, size: u64) -> Result<()> {
        let mut progress = self.progress.lock();
        if progress.phase != Phase::Open {
            drop(progress);
            self.repo.ledger(self.repo.account.free(size));
            return Err(RepositoryError::IllegalState(
                "Handle closed during allocation".to_string(),
            ));
        }
        progress.allocated += size;
        let mut data = self.record.lock();
        if progress.allocated > data.size {
            data.size = progress.allocated;
        }
        Ok(())
    }

    /// Reserve `size` more bytes, blocking until they are free.
    pub fn allocate(&self, size: u64) -> Result<()> {
        self.ensure_open()?;
        match self.repo.account.allocate(size, &self.token) {
            Ok(()) => self.allocated_bytes(size),
            Err(LedgerError::Cancelled) => Err(RepositoryError::Interrupted),
            Err(e) => Err(e.into()),
        }
    }

    /// Reserve `size` more bytes if they are free right now.
    pub fn allocate_now(&self, size: u64) -> Result<bool> {
        self.ensure_open()?;
        if !self.repo.account.allocate_now(size) {
            return Ok(false);
        }
        self.allocated_bytes(size)?;
        Ok(true)
    }

    /// Bring the reservation in line with the bytes on disk. Returns false if
    /// more space was written than could be accounted for.
    fn adjust_reservation(&self, progress: &mut Progress, length: u64) -> bool {
        if length > progress.allocated {
            let missing = length - progress.allocated;
            log_repo_error!(
                "Replica exceeds its space reservation",
                id = self.id().as_str(),
                allocated = progress.allocated,
                length = length
            );
            if !self.repo.account.allocate_now(missing) {
                return false;
            }
        } else if length < progress.allocated {
            self.repo
                .ledger(self.repo.account.free(progress.allocated - length));
        }
        progress.allocated = length;
        self.record.lock().size = length;
        true
    }

    /// Complete the transfer and move the replica to its target state.
    pub fn commit(&self) -> Result<()> {
        let mut progress = self.progress.lock();
        match progress.phase {
            Phase::Open => {}
            Phase::Committed => {
                return Err(RepositoryError::IllegalState(
                    "Handle is already committed".to_string(),
                ))
            }
            Phase::Closed => return Err(RepositoryError::IllegalState("Handle is closed".to_string())),
        }

        let id = self.id().clone();
        let path = self.repo.store.data_path(&id);
        let length = data_file_length(&path)
            .map_err(|e| self.repo.disk_error(format!("Failed to stat {}", path.display()), e))?;

        if !self.adjust_reservation(&mut progress, length) {
            return Err(RepositoryError::DiskError(format!(
                "Failed to adjust space reservation of {} because the pool is full",
                id
            )));
        }

        let mut attributes = self.record.lock().attributes.clone();
        if let Some(expected) = attributes.size {
            if expected != length {
                return Err(RepositoryError::FileCorrupted {
                    id,
                    expected,
                    actual: length,
                });
            }
        }
        attributes.size = Some(length);

        let mut target = self.target;
        let registered = self
            .repo
            .namespace
            .set_file_attributes(&id, &attributes)
            .and_then(|()| self.repo.namespace.add_cache_location(&id, &self.repo.pool_name));
        match registered {
            Ok(()) => {}
            Err(NamespaceError::FileNotFound(_)) => {
                log_repo_warn!("File was deleted while being written", id = id.as_str());
                target = ReplicaState::Removed;
            }
            Err(e) => return Err(e.into()),
        }

        let mut deferred = Deferred::default();
        let result = {
            let _io = self.record.lock_io();
            let mut data = self.record.lock();
            data.attributes = attributes;
            if !self.flags.no_atime {
                data.touch();
            }
            let sticky = if target == ReplicaState::Removed {
                Ok(())
            } else {
                self.apply_sticky(&mut data)
            };
            sticky.and_then(|()| {
                self.repo
                    .apply_state(&self.record, &mut data, target, &mut deferred)
            })
        };
        self.repo.run_deferred(deferred);
        result?;

        progress.phase = Phase::Committed;
        Ok(())
    }

    fn apply_sticky(&self, data: &mut RecordGuard<'_>) -> Result<()> {
        if self.target == ReplicaState::Cached && self.sticky.is_empty() {
            let hold = SystemTime::now() + self.repo.config.cached_hold();
            self.repo
                .update_sticky(data, CACHED_HOLD_OWNER, Some(hold), false)?;
        }
        for record in &self.sticky {
            self.repo
                .update_sticky(data, &record.owner, record.expires_at, false)?;
        }
        Ok(())
    }

    /// Abort an open transfer. Staged and pool-to-pool copies are removed,
    /// uploads are kept as broken unless the file is gone from the namespace.
    fn fail(&self, progress: &mut Progress) {
        let id = self.id().clone();
        let path = self.repo.store.data_path(&id);
        let length = match data_file_length(&path) {
            Ok(length) => length,
            Err(e) => {
                log_repo_warn!(
                    "Failed to stat data file of failed transfer",
                    id = id.as_str(),
                    error = display(&e)
                );
                progress.allocated
            }
        };
        if !self.adjust_reservation(progress, length) {
            self.repo.fail(
                FaultAction::ReadOnly,
                format!("Failed to adjust space reservation of {}", id),
                Some("pool is full".to_string()),
            );
            self.record.lock().size = progress.allocated;
        }

        let transfer = self.record.lock().state;
        let target = match transfer {
            ReplicaState::FromClient => self.classify_upload(&id),
            _ => ReplicaState::Removed,
        };

        let mut deferred = Deferred::default();
        {
            let _io = self.record.lock_io();
            let mut data = self.record.lock();
            if let Err(e) = self
                .repo
                .apply_state(&self.record, &mut data, target, &mut deferred)
            {
                log_repo_warn!(
                    "Failed to record aborted transfer",
                    id = id.as_str(),
                    error = display(&e)
                );
            }
        }
        self.repo.run_deferred(deferred);
    }

    fn classify_upload(&self, id: &ReplicaId) -> ReplicaState {
        let namespace = &self.repo.namespace;
        let registered = namespace
            .get_file_attributes(id)
            .and_then(|_| namespace.add_cache_location(id, &self.repo.pool_name));
        match registered {
            Ok(()) => ReplicaState::Broken,
            Err(NamespaceError::FileNotFound(_)) => ReplicaState::Removed,
            Err(e) => {
                log_repo_warn!(
                    "Failed to register broken upload in namespace",
                    id = id.as_str(),
                    error = display(&e)
                );
                ReplicaState::Broken
            }
        }
    }

    /// Release the handle. An uncommitted handle is aborted and any thread
    /// blocked in `allocate` on it is interrupted.
    pub fn close(&self) -> Result<()> {
        // Interrupt before taking the progress lock so a pending allocation
        // can observe the cancellation.
        if self.progress.lock().phase == Phase::Open {
            self.token.cancel();
            self.repo.account.wake_waiters();
        }
        let mut progress = self.progress.lock();
        match progress.phase {
            Phase::Open => {
                self.fail(&mut progress);
                progress.phase = Phase::Closed;
                Ok(())
            }
            Phase::Committed => {
                progress.phase = Phase::Closed;
                Ok(())
            }
            Phase::Closed => Err(RepositoryError::IllegalState("Handle is closed".to_string())),
        }
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        let phase = self.progress.lock().phase;
        if phase == Phase::Closed {
            return;
        }
        if phase == Phase::Open {
            log_repo_warn!(
                "Write handle dropped without close, aborting transfer",
                id = self.id().as_str()
            );
        }
        if let Err(e) = self.close() {
            log_repo_warn!(
                "Failed to close write handle",
                id = self.id().as_str(),
                error = display(&e)
            );
        }
    }
}

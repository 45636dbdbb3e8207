//! In-memory replica records.
//!
//! Every record is guarded by its own mutex. Callers hold the guard only for
//! the duration of a mutation and never across store or namespace calls.
//! Changes that are written to the metadata store are additionally ordered by
//! the record's I/O lock, which is taken first and kept while the store is
//! written with the record lock released.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};

use crate::attributes::FileAttributes;
use crate::id::ReplicaId;
use crate::state::ReplicaState;
use crate::sticky::StickyRecord;
use crate::store::{epoch_millis, PersistedRecord};

/// Immutable snapshot of a replica, handed to listeners and callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub id: ReplicaId,
    pub state: ReplicaState,
    pub size: u64,
    pub created_at: SystemTime,
    pub last_access: SystemTime,
    pub link_count: u32,
    pub sticky: Vec<StickyRecord>,
    pub attributes: FileAttributes,
}

impl CacheEntry {
    /// Whether at least one sticky record is still valid.
    pub fn is_sticky(&self) -> bool {
        let now = SystemTime::now();
        self.sticky.iter().any(|r| r.is_valid_at(now))
    }

    /// Twelve state columns followed by the link count, as listed by
    /// `rep ls`.
    pub fn flags(&self) -> String {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        let removed = self.state == ReplicaState::Removed;
        let mut s = String::with_capacity(24);
        s.push(flag(self.state == ReplicaState::Cached, 'C'));
        s.push(flag(self.state == ReplicaState::Precious, 'P'));
        s.push(flag(self.state == ReplicaState::FromClient, 'C'));
        s.push(flag(
            matches!(self.state, ReplicaState::FromStore | ReplicaState::FromPool),
            'S',
        ));
        s.push('-');
        s.push('-');
        s.push(flag(removed && self.link_count > 0, 'R'));
        s.push(flag(removed, 'D'));
        s.push(flag(self.is_sticky(), 'X'));
        s.push(flag(self.state == ReplicaState::Broken, 'E'));
        s.push('-');
        s.push_str(&format!("L(0)({})", self.link_count));
        s
    }
}

impl std::fmt::Display for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} <{}> {} si={}",
            self.id,
            self.flags(),
            self.size,
            self.attributes.storage_class.as_deref().unwrap_or("<unknown>")
        )
    }
}

/// Mutable part of a record, reachable only through [`ReplicaRecord::lock`].
#[derive(Debug)]
pub struct RecordData {
    pub(crate) id: ReplicaId,
    pub(crate) state: ReplicaState,
    pub(crate) size: u64,
    pub(crate) created_at: SystemTime,
    pub(crate) last_access: SystemTime,
    pub(crate) link_count: u32,
    pub(crate) sticky: Vec<StickyRecord>,
    pub(crate) attributes: FileAttributes,
}

impl RecordData {
    pub fn state(&self) -> ReplicaState {
        self.state
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn link_count(&self) -> u32 {
        self.link_count
    }

    pub fn sticky(&self) -> &[StickyRecord] {
        &self.sticky
    }

    pub fn attributes(&self) -> &FileAttributes {
        &self.attributes
    }

    pub fn snapshot(&self) -> CacheEntry {
        CacheEntry {
            id: self.id.clone(),
            state: self.state,
            size: self.size,
            created_at: self.created_at,
            last_access: self.last_access,
            link_count: self.link_count,
            sticky: self.sticky.clone(),
            attributes: self.attributes.clone(),
        }
    }

    pub fn to_persisted(&self) -> PersistedRecord {
        PersistedRecord {
            id: self.id.clone(),
            state: self.state,
            size: self.size,
            created_ms: epoch_millis(self.created_at),
            last_access_ms: epoch_millis(self.last_access),
            sticky: self.sticky.clone(),
            attributes: self.attributes.clone(),
        }
    }

    pub fn touch(&mut self) {
        self.last_access = SystemTime::now();
    }

    pub fn is_sticky_at(&self, now: SystemTime) -> bool {
        self.sticky.iter().any(|r| r.is_valid_at(now))
    }

    /// Add, refresh or clear the sticky record of `owner`.
    ///
    /// An expiry at or before `now` clears the owner's record. Without
    /// `overwrite` an existing record is only replaced by a longer-lived one.
    /// Returns whether the sticky records changed.
    pub fn set_sticky(
        &mut self,
        owner: &str,
        expires_at: Option<SystemTime>,
        overwrite: bool,
        now: SystemTime,
    ) -> bool {
        let record = StickyRecord::new(owner, expires_at);
        let existing = self.sticky.iter().position(|r| r.owner == owner);

        if !record.is_valid_at(now) {
            return match existing {
                Some(pos) => {
                    self.sticky.remove(pos);
                    true
                }
                None => false,
            };
        }

        match existing {
            Some(pos) => {
                let current = &self.sticky[pos];
                if *current == record || (!overwrite && current.outlives(&record)) {
                    return false;
                }
                self.sticky[pos] = record;
                true
            }
            None => {
                self.sticky.push(record);
                true
            }
        }
    }

    /// Drop sticky records that have expired by `now` and return them.
    pub fn remove_expired(&mut self, now: SystemTime) -> Vec<StickyRecord> {
        let (kept, expired): (Vec<_>, Vec<_>) =
            self.sticky.drain(..).partition(|r| r.is_valid_at(now));
        self.sticky = kept;
        expired
    }

    /// Earliest finite expiry, including ones already in the past.
    pub fn next_expiry(&self) -> Option<SystemTime> {
        self.sticky.iter().filter_map(|r| r.expires_at).min()
    }
}

pub type RecordGuard<'a> = MutexGuard<'a, RecordData>;

/// One replica known to the repository.
#[derive(Debug)]
pub struct ReplicaRecord {
    id: ReplicaId,
    io: Mutex<()>,
    data: Mutex<RecordData>,
}

impl ReplicaRecord {
    pub fn from_persisted(record: PersistedRecord) -> Self {
        let millis = |ms: u64| UNIX_EPOCH + std::time::Duration::from_millis(ms);
        let data = RecordData {
            id: record.id.clone(),
            state: record.state,
            size: record.size,
            created_at: millis(record.created_ms),
            last_access: millis(record.last_access_ms),
            link_count: 0,
            sticky: record.sticky,
            attributes: record.attributes,
        };
        Self {
            id: record.id,
            io: Mutex::new(()),
            data: Mutex::new(data),
        }
    }

    pub fn id(&self) -> &ReplicaId {
        &self.id
    }

    pub fn lock(&self) -> RecordGuard<'_> {
        self.data.lock()
    }

    /// Serialises writers of this record's persisted form.
    pub(crate) fn lock_io(&self) -> MutexGuard<'_, ()> {
        self.io.lock()
    }

    pub fn snapshot(&self) -> CacheEntry {
        self.lock().snapshot()
    }
}

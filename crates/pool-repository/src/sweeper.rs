//! Eviction policy: which replicas may be reclaimed, and in which order.

use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::id::ReplicaId;
use crate::record::CacheEntry;
use crate::state::ReplicaState;

/// Policy consulted by the repository on every state, sticky and access time
/// change.
pub trait SweeperPolicy: Send + Sync {
    fn is_removable(&self, entry: &CacheEntry) -> bool;

    /// Record the latest view of a replica.
    fn notify_lru(&self, entry: &CacheEntry);

    /// Forget a destroyed replica.
    fn forget(&self, id: &ReplicaId);

    /// Last access time of the least recently used removable replica.
    fn lru(&self) -> Option<SystemTime>;
}

/// Removable means cached and not pinned. Candidates are queued by last
/// access, ties broken by registration order.
#[derive(Debug, Default)]
pub struct LruSweeper {
    queue: Mutex<LruQueue>,
}

type LruKey = (SystemTime, u64);

#[derive(Debug, Default)]
struct LruQueue {
    order: BTreeMap<LruKey, ReplicaId>,
    index: HashMap<ReplicaId, LruKey>,
    seq: u64,
}

impl LruQueue {
    fn remove(&mut self, id: &ReplicaId) {
        if let Some(key) = self.index.remove(id) {
            self.order.remove(&key);
        }
    }

    fn insert(&mut self, id: ReplicaId, last_access: SystemTime) {
        self.remove(&id);
        self.seq += 1;
        let key = (last_access, self.seq);
        self.order.insert(key, id.clone());
        self.index.insert(id, key);
    }
}

impl LruSweeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removable replicas, least recently used first.
    pub fn eviction_order(&self) -> Vec<ReplicaId> {
        self.queue.lock().order.values().cloned().collect()
    }
}

impl SweeperPolicy for LruSweeper {
    fn is_removable(&self, entry: &CacheEntry) -> bool {
        entry.state == ReplicaState::Cached && !entry.is_sticky()
    }

    fn notify_lru(&self, entry: &CacheEntry) {
        let mut queue = self.queue.lock();
        if self.is_removable(entry) {
            queue.insert(entry.id.clone(), entry.last_access);
        } else {
            queue.remove(&entry.id);
        }
    }

    fn forget(&self, id: &ReplicaId) {
        self.queue.lock().remove(id);
    }

    fn lru(&self) -> Option<SystemTime> {
        self.queue.lock().order.keys().next().map(|(t, _)| *t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::FileAttributes;
    use crate::sticky::StickyRecord;
    use std::time::Duration;

    fn entry(id: &str, state: ReplicaState, last_access: SystemTime) -> CacheEntry {
        let id: ReplicaId = id.parse().unwrap();
        CacheEntry {
            attributes: FileAttributes::new(id.clone()),
            id,
            state,
            size: 1,
            created_at: last_access,
            last_access,
            link_count: 0,
            sticky: Vec::new(),
        }
    }

    #[test]
    fn test_only_unpinned_cached_is_removable() {
        let sweeper = LruSweeper::new();
        let now = SystemTime::now();
        assert!(sweeper.is_removable(&entry("01", ReplicaState::Cached, now)));
        assert!(!sweeper.is_removable(&entry("02", ReplicaState::Precious, now)));

        let mut pinned = entry("03", ReplicaState::Cached, now);
        pinned.sticky.push(StickyRecord::forever("owner"));
        assert!(!sweeper.is_removable(&pinned));
    }

    #[test]
    fn test_registration_order_breaks_ties() {
        let sweeper = LruSweeper::new();
        let t = SystemTime::now();
        sweeper.notify_lru(&entry("0B", ReplicaState::Cached, t));
        sweeper.notify_lru(&entry("0A", ReplicaState::Cached, t));
        sweeper.notify_lru(&entry("0C", ReplicaState::Cached, t - Duration::from_secs(1)));
        let order: Vec<String> = sweeper.eviction_order().iter().map(|i| i.to_string()).collect();
        assert_eq!(order, vec!["0C", "0B", "0A"]);
        assert_eq!(sweeper.lru(), Some(t - Duration::from_secs(1)));
    }

    #[test]
    fn test_touch_moves_to_tail_and_state_change_drops() {
        let sweeper = LruSweeper::new();
        let t = SystemTime::now();
        sweeper.notify_lru(&entry("01", ReplicaState::Cached, t));
        sweeper.notify_lru(&entry("02", ReplicaState::Cached, t));
        sweeper.notify_lru(&entry("01", ReplicaState::Cached, t + Duration::from_secs(1)));
        assert_eq!(sweeper.eviction_order()[0].as_str(), "02");

        sweeper.notify_lru(&entry("02", ReplicaState::Precious, t));
        sweeper.forget(&"01".parse().unwrap());
        assert!(sweeper.eviction_order().is_empty());
        assert_eq!(sweeper.lru(), None);
    }
}

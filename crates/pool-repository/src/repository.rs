//! The replica repository.
//!
//! Owns the replica state machine, hands out read and write handles, keeps
//! the space ledger in step with replica states and reports changes to the
//! eviction policy and to listeners.
//!
//! Lock order: lifecycle or limits, then a record's I/O lock, then the record
//! itself, then the ledger, the eviction policy and the internal maps. A
//! record is never locked while a guard into `records` is held; callers clone
//! the `Arc` out first. Store writes run with the record lock released and the
//! I/O lock held. Namespace requests are issued after both are released.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::Receiver;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, MutexGuard, RwLock};
use pool_config::{
    log_repo_debug, log_repo_error, log_repo_info, log_repo_warn, Config, DiskSpace, PoolSetup,
    RepositoryConfig,
};
use serde::Serialize;
use tracing::field::display;

use crate::account::{Account, LedgerError, SpaceRecord};
use crate::attributes::FileAttributes;
use crate::error::{RepositoryError, Result};
use crate::fault::{FaultAction, FaultEvent, FaultListener, FaultListeners};
use crate::handle::{OpenFlags, ReadHandle, WriteHandle};
use crate::id::ReplicaId;
use crate::namespace::{Namespace, NamespaceError};
use crate::notify::{ListenerId, Notifier, ReplicaEvent, StateListener};
use crate::record::{CacheEntry, RecordData, RecordGuard, ReplicaRecord};
use crate::scheduler::{Scheduler, TaskHandle};
use crate::state::{ReplicaState, Transition};
use crate::sticky::StickyRecord;
use crate::store::{MetadataStore, PersistedRecord, StoreError, StoreResult};
use crate::sweeper::SweeperPolicy;

/// Upper bound of the default gap.
pub const DEFAULT_GAP: u64 = 4 << 30;

/// Lifecycle of the repository itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Lifecycle {
    Initialized,
    Loading,
    Open,
    Failed,
    Closed,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Initialized => "INITIALIZED",
            Lifecycle::Loading => "LOADING",
            Lifecycle::Open => "OPEN",
            Lifecycle::Failed => "FAILED",
            Lifecycle::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool size limits. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Limits {
    pub static_max: Option<u64>,
    pub runtime_max: Option<u64>,
    pub gap: Option<u64>,
}

/// Namespace work collected under a record lock and run after release.
#[derive(Debug, Default)]
pub(crate) struct Deferred {
    clear_locations: Vec<ReplicaId>,
}

pub(crate) struct RepositoryInner {
    pub(crate) me: Weak<RepositoryInner>,
    pub(crate) config: RepositoryConfig,
    pub(crate) pool_name: String,
    pub(crate) volatile: bool,
    pub(crate) setup_path: Option<PathBuf>,
    pub(crate) store: Arc<dyn MetadataStore>,
    pub(crate) namespace: Arc<dyn Namespace>,
    pub(crate) sweeper: Arc<dyn SweeperPolicy>,
    pub(crate) account: Arc<Account>,
    pub(crate) records: DashMap<ReplicaId, Arc<ReplicaRecord>>,
    pub(crate) removable: DashSet<ReplicaId>,
    pub(crate) notifier: Notifier,
    pub(crate) faults: FaultListeners,
    pub(crate) scheduler: Scheduler,
    pub(crate) expiration_tasks: DashMap<ReplicaId, TaskHandle>,
    pub(crate) lifecycle: RwLock<Lifecycle>,
    pub(crate) load_progress: AtomicU32,
    pub(crate) limits: Mutex<Limits>,
    pub(crate) health_task: Mutex<Option<TaskHandle>>,
}

/// Cheaply cloneable handle to a replica repository.
#[derive(Clone)]
pub struct Repository {
    pub(crate) inner: Arc<RepositoryInner>,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("pool", &self.inner.pool_name)
            .field("state", &self.inner.lifecycle())
            .field("files", &self.inner.records.len())
            .finish()
    }
}

impl RepositoryInner {
    pub(crate) fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read()
    }

    fn assert_open(&self) -> Result<()> {
        let state = self.lifecycle();
        if state != Lifecycle::Open {
            return Err(RepositoryError::IllegalState(format!(
                "Operation not allowed while repository is in state {}",
                state
            )));
        }
        Ok(())
    }

    fn assert_initialized(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Initialized | Lifecycle::Loading | Lifecycle::Open => Ok(()),
            state => Err(RepositoryError::IllegalState(format!(
                "Operation not allowed while repository is in state {}",
                state
            ))),
        }
    }

    // === Fault reporting ===

    pub(crate) fn fail(&self, action: FaultAction, message: impl Into<String>, cause: Option<String>) {
        self.faults.report(FaultEvent {
            source: "repository".to_string(),
            action,
            message: message.into(),
            cause,
        });
    }

    /// Report a failed store operation and put the pool in read-only mode.
    pub(crate) fn disk_error(&self, context: String, cause: impl fmt::Display) -> RepositoryError {
        let cause = cause.to_string();
        self.fail(FaultAction::ReadOnly, context.clone(), Some(cause.clone()));
        RepositoryError::DiskError(format!("{}: {}", context, cause))
    }

    /// Accounting errors are bugs; they disable the pool.
    pub(crate) fn ledger(&self, result: std::result::Result<(), LedgerError>) {
        if let Err(e) = result {
            self.fail(
                FaultAction::Disabled,
                "Internal repository error: space accounting is inconsistent",
                Some(e.to_string()),
            );
        }
    }

    // === Record bookkeeping ===

    fn update_removable(&self, entry: &CacheEntry) {
        let size = entry.size as i64;
        if self.sweeper.is_removable(entry) {
            if self.removable.insert(entry.id.clone()) {
                self.ledger(self.account.adjust_removable(size));
            }
        } else if self.removable.remove(&entry.id).is_some() {
            self.ledger(self.account.adjust_removable(-size));
        }
    }

    pub(crate) fn entry_changed(&self, entry: &CacheEntry) {
        self.update_removable(entry);
        self.sweeper.notify_lru(entry);
    }

    /// Write `record` with the record lock released. The caller holds the
    /// record's I/O lock, so no other write to it can interleave.
    pub(crate) fn persist(&self, data: &mut RecordGuard<'_>, record: &PersistedRecord) -> Result<()> {
        MutexGuard::unlocked(data, || self.store.put(record))
            .map_err(|e| self.disk_error(format!("Failed to update meta data for {}", record.id), e))
    }

    pub(crate) fn raise(&self, event: ReplicaEvent) {
        self.notifier.raise(event);
    }

    /// Move a record to `state` without consulting the transition table.
    /// The new state becomes visible once it is stored.
    pub(crate) fn apply_state(
        &self,
        record: &Arc<ReplicaRecord>,
        data: &mut RecordGuard<'_>,
        state: ReplicaState,
        deferred: &mut Deferred,
    ) -> Result<()> {
        if data.state == state {
            return Ok(());
        }
        let mut persisted = data.to_persisted();
        persisted.state = state;
        self.persist(data, &persisted)?;

        let old = data.snapshot();
        data.state = state;
        let new = data.snapshot();
        if old.state != ReplicaState::Precious && state == ReplicaState::Precious {
            self.ledger(self.account.adjust_precious(new.size as i64));
        } else if old.state == ReplicaState::Precious && state != ReplicaState::Precious {
            self.ledger(self.account.adjust_precious(-(old.size as i64)));
        }
        self.entry_changed(&new);
        self.raise(ReplicaEvent::StateChanged { old, new: new.clone() });

        match state {
            ReplicaState::Removed => {
                log_repo_info!("Removing replica", id = new.id.as_str(), links = new.link_count);
                self.cancel_expiration(&data.id);
                deferred.clear_locations.push(data.id.clone());
                if data.link_count == 0 {
                    self.destroy(record, data)?;
                }
            }
            ReplicaState::Broken => {
                log_repo_warn!("Replica marked broken", id = data.id.as_str());
            }
            _ => {}
        }
        Ok(())
    }

    /// Erase a removed record and release its space.
    pub(crate) fn destroy(&self, record: &Arc<ReplicaRecord>, data: &mut RecordGuard<'_>) -> Result<()> {
        let id = record.id();
        MutexGuard::unlocked(data, || self.store.remove(id))
            .map_err(|e| self.disk_error(format!("Failed to remove {}", id), e))?;

        let old = data.snapshot();
        data.state = ReplicaState::Destroyed;
        let new = data.snapshot();
        self.update_removable(&new);
        self.sweeper.forget(&data.id);
        // Space is freed only after the data file is gone.
        self.ledger(self.account.free(old.size));
        self.raise(ReplicaEvent::StateChanged { old: old.clone(), new });
        self.records
            .remove_if(&data.id, |_, current| Arc::ptr_eq(current, record));
        log_repo_debug!("Replica destroyed", id = id.as_str(), size = old.size);
        Ok(())
    }

    pub(crate) fn run_deferred(&self, deferred: Deferred) {
        for id in deferred.clear_locations {
            self.clear_location(id);
        }
    }

    /// Best-effort removal of this pool from the file's namespace locations.
    /// Timeouts are retried on the scheduler.
    pub(crate) fn clear_location(&self, id: ReplicaId) {
        match self
            .namespace
            .clear_cache_location(&id, &self.pool_name, self.volatile)
        {
            Ok(()) => {}
            Err(NamespaceError::FileNotFound(_)) => {
                log_repo_debug!("File already gone from namespace", id = id.as_str());
            }
            Err(e) if e.is_timeout() => {
                log_repo_warn!(
                    "Namespace timed out clearing cache location, retrying",
                    id = id.as_str(),
                    error = display(&e)
                );
                let me = self.me.clone();
                self.scheduler.schedule(self.config.retry_interval(), move || {
                    if let Some(inner) = me.upgrade() {
                        inner.clear_location(id);
                    }
                });
            }
            Err(e) => log_repo_warn!(
                "Failed to clear cache location",
                id = id.as_str(),
                error = display(&e)
            ),
        }
    }

    /// Drop a namespace location pointing at a replica this pool lacks.
    fn stale_location(&self, id: &ReplicaId) -> RepositoryError {
        log_repo_debug!("Clearing stale cache location", id = id.as_str());
        self.clear_location(id.clone());
        RepositoryError::not_in_cache(id, "Entry not in repository")
    }

    /// Re-register the location of an existing replica.
    fn duplicate(&self, id: &ReplicaId) -> RepositoryError {
        if let Err(e) = self.namespace.add_cache_location(id, &self.pool_name) {
            log_repo_warn!("Failed to register cache location", id = id.as_str(), error = display(&e));
        }
        RepositoryError::DuplicateEntry(id.clone())
    }

    // === Sticky expiration ===

    fn cancel_expiration(&self, id: &ReplicaId) {
        if let Some((_, task)) = self.expiration_tasks.remove(id) {
            task.cancel();
        }
    }

    /// Replace the expiration task of a record with one firing at its next
    /// sticky expiry. Expiries already in the past fire immediately.
    pub(crate) fn schedule_expiration(&self, data: &RecordData) {
        self.cancel_expiration(&data.id);
        let Some(expiry) = data.next_expiry() else {
            return;
        };
        let delay = expiry
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
            + self.config.sticky_expiration_skew();
        self.schedule_expiration_after(&data.id, delay);
    }

    fn schedule_expiration_after(&self, id: &ReplicaId, delay: Duration) {
        let me = self.me.clone();
        let task_id = id.clone();
        let task = self.scheduler.schedule(delay, move || {
            if let Some(inner) = me.upgrade() {
                inner.expire_sticky(&task_id);
            }
        });
        if let Some(previous) = self.expiration_tasks.insert(id.clone(), task) {
            previous.cancel();
        }
    }

    fn expire_sticky(&self, id: &ReplicaId) {
        let Some(record) = self.records.get(id).map(|r| r.value().clone()) else {
            self.expiration_tasks.remove(id);
            return;
        };
        let _io = record.lock_io();
        let mut data = record.lock();
        if matches!(data.state, ReplicaState::Removed | ReplicaState::Destroyed) {
            return;
        }

        let previous = data.sticky.clone();
        let expired = data.remove_expired(SystemTime::now());
        if !expired.is_empty() {
            let persisted = data.to_persisted();
            let kept = std::mem::replace(&mut data.sticky, previous);
            if let Err(e) = MutexGuard::unlocked(&mut data, || self.store.put(&persisted)) {
                log_repo_warn!(
                    "Failed to clear sticky flags, retrying",
                    id = id.as_str(),
                    error = display(&e)
                );
                self.schedule_expiration_after(id, self.config.retry_interval());
                return;
            }
            data.sticky = kept;
            let entry = data.snapshot();
            self.entry_changed(&entry);
            for record in expired {
                log_repo_debug!("Sticky flag expired", id = id.as_str(), owner = record.owner.as_str());
                self.raise(ReplicaEvent::StickyChanged {
                    entry: entry.clone(),
                    record,
                });
            }
        }
        // Also covers a task that fired early: the same expiry is rescheduled.
        self.schedule_expiration(&data);
    }

    /// Add, refresh or clear a sticky record and publish the change. The
    /// caller holds the record's I/O lock.
    pub(crate) fn update_sticky(
        &self,
        data: &mut RecordGuard<'_>,
        owner: &str,
        expires_at: Option<SystemTime>,
        overwrite: bool,
    ) -> Result<bool> {
        let previous = data.sticky.clone();
        if !data.set_sticky(owner, expires_at, overwrite, SystemTime::now()) {
            return Ok(false);
        }
        let persisted = data.to_persisted();
        let updated = std::mem::replace(&mut data.sticky, previous);
        self.persist(data, &persisted)?;
        data.sticky = updated;
        let entry = data.snapshot();
        self.entry_changed(&entry);
        self.raise(ReplicaEvent::StickyChanged {
            entry,
            record: StickyRecord::new(owner, expires_at),
        });
        self.schedule_expiration(data);
        Ok(true)
    }

    // === Inventory ===

    /// Run a store operation, retrying timeouts with a fixed back-off.
    fn with_retry<T>(&self, what: &str, op: impl Fn() -> StoreResult<T>) -> Result<T> {
        loop {
            match op() {
                Err(StoreError::Timeout(reason)) => {
                    log_repo_warn!(
                        "Metadata store timed out, retrying",
                        operation = what,
                        reason = reason.as_str()
                    );
                    if self.lifecycle() == Lifecycle::Closed {
                        return Err(RepositoryError::Interrupted);
                    }
                    thread::sleep(self.config.retry_interval());
                }
                Err(e) => return Err(RepositoryError::Store(e)),
                Ok(value) => return Ok(value),
            }
        }
    }

    /// Reconcile records left behind by a crash.
    fn recover(&self, mut record: PersistedRecord) -> Result<Option<PersistedRecord>> {
        let id = record.id.clone();
        match record.state {
            ReplicaState::FromClient => {
                log_repo_warn!("Marking interrupted upload as broken", id = id.as_str());
                record.state = ReplicaState::Broken;
                self.store.put(&record)?;
            }
            ReplicaState::FromStore | ReplicaState::FromPool => {
                log_repo_warn!(
                    "Removing incomplete transfer",
                    id = id.as_str(),
                    state = record.state.as_str()
                );
                self.store.remove(&id)?;
                self.clear_location(id);
                return Ok(None);
            }
            ReplicaState::New | ReplicaState::Removed | ReplicaState::Destroyed => {
                log_repo_debug!(
                    "Erasing removed replica",
                    id = id.as_str(),
                    state = record.state.as_str()
                );
                self.store.remove(&id)?;
                self.clear_location(id);
                return Ok(None);
            }
            ReplicaState::Precious | ReplicaState::Cached => {
                if !self.store.data_path(&id).exists() {
                    log_repo_error!("Data file is missing, marking replica broken", id = id.as_str());
                    record.state = ReplicaState::Broken;
                    record.size = 0;
                    self.store.put(&record)?;
                }
            }
            ReplicaState::Broken => {}
        }
        Ok(Some(record))
    }

    /// Account for a record found on disk and announce it to listeners.
    fn register_loaded(&self, record: &Arc<ReplicaRecord>) {
        let data = record.lock();
        let new = data.snapshot();
        // Replicas found on disk already consume space.
        self.account.grow_total_and_used(new.size);
        if new.state == ReplicaState::Precious {
            self.ledger(self.account.adjust_precious(new.size as i64));
        }
        self.entry_changed(&new);
        let mut old = new.clone();
        old.state = ReplicaState::New;
        self.raise(ReplicaEvent::StateChanged { old, new });
    }

    /// Look up a record. Before the inventory is complete, unknown ids are
    /// read from the store on demand.
    pub(crate) fn get_record(&self, id: &ReplicaId) -> Result<Option<Arc<ReplicaRecord>>> {
        if let Some(record) = self.records.get(id) {
            return Ok(Some(record.value().clone()));
        }
        if self.lifecycle() == Lifecycle::Open {
            return Ok(None);
        }

        let Some(persisted) = self.with_retry("get", || self.store.get(id))? else {
            return Ok(None);
        };
        let Some(persisted) = self.recover(persisted)? else {
            return Ok(None);
        };
        let record = Arc::new(ReplicaRecord::from_persisted(persisted));
        match self.records.entry(id.clone()) {
            Entry::Occupied(existing) => return Ok(Some(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
            }
        }
        self.register_loaded(&record);
        self.schedule_expiration(&record.lock());
        Ok(Some(record))
    }

    fn load_inventory(&self) -> Result<usize> {
        let started = Instant::now();
        self.apply_setup()?;

        let ids = self.with_retry("list", || self.store.list())?;
        let count = ids.len();
        log_repo_info!("Reading inventory", files = count);

        let mut loaded = Vec::with_capacity(count);
        for (n, id) in ids.iter().enumerate() {
            self.load_progress
                .store((n * 100 / count.max(1)) as u32, Ordering::Relaxed);
            if self.records.contains_key(id) {
                continue;
            }
            let Some(persisted) = self.with_retry("get", || self.store.get(id))? else {
                continue;
            };
            if let Some(persisted) = self.recover(persisted)? {
                log_repo_debug!(
                    "Found replica",
                    id = id.as_str(),
                    state = persisted.state.as_str()
                );
                loaded.push(persisted);
            }
        }

        // The eviction policy relies on registration order as LRU tie-break.
        loaded.sort_by(|a, b| {
            (a.last_access_ms, &a.id).cmp(&(b.last_access_ms, &b.id))
        });
        let mut registered = Vec::with_capacity(loaded.len());
        for persisted in loaded {
            let record = Arc::new(ReplicaRecord::from_persisted(persisted));
            match self.records.entry(record.id().clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(record.clone());
                }
            }
            self.register_loaded(&record);
            registered.push(record);
        }
        for record in &registered {
            self.schedule_expiration(&record.lock());
        }

        self.update_account_size()?;
        self.load_progress.store(100, Ordering::Relaxed);
        log_repo_info!(
            "Done generating inventory",
            files = self.records.len(),
            elapsed_ms = started.elapsed().as_millis() as u64
        );
        Ok(self.records.len())
    }

    // === Space limits ===

    fn apply_setup(&self) -> Result<()> {
        let Some(path) = &self.setup_path else {
            return Ok(());
        };
        let setup = PoolSetup::load(path).map_err(|e| {
            RepositoryError::IllegalState(format!("Failed to read pool setup {}: {}", path.display(), e))
        })?;
        let mut limits = self.limits.lock();
        if let Some(max) = setup.max_diskspace {
            limits.runtime_max = max.bytes();
        }
        if let Some(gap) = setup.gap {
            limits.gap = gap.bytes();
        }
        Ok(())
    }

    pub(crate) fn save_setup(&self, limits: &Limits) -> Result<()> {
        let Some(path) = &self.setup_path else {
            return Ok(());
        };
        let setup = PoolSetup {
            max_diskspace: limits.runtime_max.map(DiskSpace::Bytes),
            gap: limits.gap.map(DiskSpace::Bytes),
        };
        setup
            .save(path)
            .map_err(|e| RepositoryError::DiskError(format!("Failed to save pool setup: {}", e)))
    }

    pub(crate) fn update_account_size(&self) -> Result<()> {
        let limits = self.limits.lock();
        self.resize(&limits)
    }

    /// Pool size is the configured size capped by what the file system can
    /// still hold, but never less than what is already used.
    pub(crate) fn resize(&self, limits: &Limits) -> Result<()> {
        let configured = limits.runtime_max.or(limits.static_max);
        let fs_total = self
            .store
            .total_space()
            .map_err(|e| self.disk_error("Failed to query file system size".to_string(), e))?;
        if fs_total == 0 {
            log_repo_warn!("File system reported a size of 0");
            if configured.is_none() {
                return Err(RepositoryError::IllegalState(
                    "Failed to determine file system size. A pool size must be configured."
                        .to_string(),
                ));
            }
        }
        let fs_free = self
            .store
            .free_space()
            .map_err(|e| self.disk_error("Failed to query free space".to_string(), e))?;

        self.account.update_total::<RepositoryError>(|used, total| {
            let fs_max = fs_free.saturating_add(used);
            if let Some(configured) = configured {
                if fs_max < configured {
                    log_repo_warn!(
                        "Configured pool size is larger than what is available on disk",
                        configured = configured,
                        available = fs_max
                    );
                }
                if configured < used {
                    log_repo_warn!(
                        "Configured pool size is smaller than what is used already",
                        configured = configured,
                        used = used
                    );
                }
            }
            let size = used.max(configured.unwrap_or(u64::MAX).min(fs_max));
            if size == total {
                return Ok(None);
            }
            log_repo_info!("Adjusting pool size", size = size);
            Ok(Some(size))
        })?;
        Ok(())
    }

    pub(crate) fn space_record(&self) -> SpaceRecord {
        let mut space = self.account.space_record();
        let gap = self.limits.lock().gap;
        space.gap = gap.unwrap_or_else(|| (space.total / 4).min(DEFAULT_GAP));
        space.lru_age = self
            .sweeper
            .lru()
            .and_then(|t| SystemTime::now().duration_since(t).ok())
            .unwrap_or_default();
        space
    }
}

impl Repository {
    /// Build a repository over `store`. Nothing is read until [`Repository::load`].
    pub fn new(
        config: &Config,
        store: Arc<dyn MetadataStore>,
        namespace: Arc<dyn Namespace>,
        sweeper: Arc<dyn SweeperPolicy>,
    ) -> Self {
        let repo = config.repository.clone();
        let limits = Limits {
            static_max: repo.max_diskspace.and_then(DiskSpace::bytes),
            runtime_max: None,
            gap: repo.gap.and_then(DiskSpace::bytes),
        };
        let inner = Arc::new_cyclic(|me| RepositoryInner {
            me: me.clone(),
            notifier: Notifier::new(repo.notification_queue_capacity, repo.synchronous_notification),
            config: repo,
            pool_name: config.pool.name.clone(),
            volatile: config.pool.volatile,
            setup_path: Some(config.setup_path()),
            store,
            namespace,
            sweeper,
            account: Arc::new(Account::new()),
            records: DashMap::new(),
            removable: DashSet::new(),
            faults: FaultListeners::default(),
            scheduler: Scheduler::new(),
            expiration_tasks: DashMap::new(),
            lifecycle: RwLock::new(Lifecycle::Initialized),
            load_progress: AtomicU32::new(0),
            limits: Mutex::new(limits),
            health_task: Mutex::new(None),
        });
        Self { inner }
    }

    pub fn pool_name(&self) -> &str {
        &self.inner.pool_name
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lifecycle()
    }

    /// The shared space ledger.
    pub fn account(&self) -> Arc<Account> {
        self.inner.account.clone()
    }

    /// Read the inventory and open the repository.
    ///
    /// Until this returns, only `open_entry`, `get_entry`, `get_state` and
    /// `set_sticky` are served. Returns the number of replicas found.
    pub fn load(&self) -> Result<usize> {
        let inner = &self.inner;
        {
            let mut state = inner.lifecycle.write();
            if *state != Lifecycle::Initialized {
                return Err(RepositoryError::IllegalState(
                    "Can only load repository after initialization and only once.".to_string(),
                ));
            }
            *state = Lifecycle::Loading;
        }

        let result = inner.load_inventory();

        let mut state = inner.lifecycle.write();
        match result {
            Ok(count) if *state == Lifecycle::Loading => {
                *state = Lifecycle::Open;
                drop(state);
                self.start_health_check();
                Ok(count)
            }
            Ok(_) => Err(RepositoryError::IllegalState(
                "Repository was closed during loading.".to_string(),
            )),
            Err(e) => {
                if *state == Lifecycle::Loading {
                    *state = Lifecycle::Failed;
                }
                log_repo_error!("Failed to load inventory", error = display(&e));
                Err(e)
            }
        }
    }

    fn start_health_check(&self) {
        let me = Arc::downgrade(&self.inner);
        let task = self
            .inner
            .scheduler
            .schedule_periodic(self.inner.config.health_check_interval(), move || {
                if let Some(inner) = me.upgrade() {
                    inner.check_health();
                }
            });
        if let Some(previous) = self.inner.health_task.lock().replace(task) {
            previous.cancel();
        }
    }

    /// Run the periodic health check now.
    pub fn check_health(&self) {
        self.inner.check_health();
    }

    /// Ids of every replica in the repository.
    pub fn list(&self) -> Result<Vec<ReplicaId>> {
        self.inner.assert_open()?;
        let mut ids: Vec<ReplicaId> = self.inner.records.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }

    /// Create a replica and return the handle through which it is written.
    pub fn create_entry(
        &self,
        attributes: FileAttributes,
        transfer: ReplicaState,
        target: ReplicaState,
        sticky: Vec<StickyRecord>,
        flags: OpenFlags,
    ) -> Result<WriteHandle> {
        if !transfer.is_transfer() {
            return Err(RepositoryError::InvalidArgument(format!(
                "Invalid initial state {}",
                transfer
            )));
        }
        if !target.is_target() {
            return Err(RepositoryError::InvalidArgument(format!(
                "Invalid target state {}",
                target
            )));
        }
        let inner = &self.inner;
        inner.assert_open()?;

        let id = attributes.id.clone();
        log_repo_info!("Creating new entry", id = id.as_str(), state = transfer.as_str());
        let persisted = PersistedRecord::new(attributes, transfer);
        let record = Arc::new(ReplicaRecord::from_persisted(persisted.clone()));

        // Nobody else writes the record before it is created in the store.
        let io = record.lock_io();
        loop {
            let existing = match inner.records.entry(id.clone()) {
                Entry::Occupied(slot) => slot.get().clone(),
                Entry::Vacant(slot) => {
                    slot.insert(record.clone());
                    break;
                }
            };
            // A destroyed record is about to leave the map.
            if existing.lock().state == ReplicaState::Destroyed {
                thread::yield_now();
                continue;
            }
            drop(io);
            return Err(inner.duplicate(&id));
        }

        if let Err(e) = inner.store.create(&persisted) {
            inner
                .records
                .remove_if(&id, |_, current| Arc::ptr_eq(current, &record));
            drop(io);
            return Err(match e {
                StoreError::Duplicate(_) => inner.duplicate(&id),
                other => inner.disk_error(format!("Failed to create {}", id), other),
            });
        }

        let data = record.lock();
        let new = data.snapshot();
        let mut old = new.clone();
        old.state = ReplicaState::New;
        inner.entry_changed(&new);
        inner.raise(ReplicaEvent::StateChanged { old, new });
        drop(data);
        drop(io);

        Ok(WriteHandle::new(inner.clone(), record, target, sticky, flags))
    }

    /// Open a complete replica for reading.
    pub fn open_entry(&self, id: &ReplicaId, flags: OpenFlags) -> Result<ReadHandle> {
        let inner = &self.inner;
        inner.assert_initialized()?;
        let Some(record) = inner.get_record(id)? else {
            return Err(inner.stale_location(id));
        };

        // Only an access time update is written to the store.
        let io = (!flags.no_atime).then(|| record.lock_io());
        let mut data = record.lock();
        let reason = match data.state {
            ReplicaState::Precious | ReplicaState::Cached => None,
            ReplicaState::New
            | ReplicaState::FromClient
            | ReplicaState::FromStore
            | ReplicaState::FromPool => Some("File is incomplete"),
            ReplicaState::Broken => Some("File is broken"),
            ReplicaState::Removed => Some("File has been removed"),
            ReplicaState::Destroyed => {
                drop(data);
                drop(io);
                return Err(inner.stale_location(id));
            }
        };
        if let Some(reason) = reason {
            return Err(RepositoryError::not_in_cache(id, reason));
        }

        data.link_count += 1;
        if !flags.no_atime {
            data.touch();
            let persisted = data.to_persisted();
            if let Err(e) = MutexGuard::unlocked(&mut data, || inner.store.put(&persisted)) {
                log_repo_warn!("Failed to persist access time", id = id.as_str(), error = display(&e));
            }
            let entry = data.snapshot();
            inner.entry_changed(&entry);
            inner.raise(ReplicaEvent::AccessTimeChanged { entry });
        }
        drop(data);
        drop(io);

        Ok(ReadHandle::new(inner.clone(), record))
    }

    pub fn get_entry(&self, id: &ReplicaId) -> Result<CacheEntry> {
        self.inner.assert_initialized()?;
        let Some(record) = self.inner.get_record(id)? else {
            return Err(RepositoryError::not_in_cache(id, "Entry not in repository"));
        };
        let data = record.lock();
        match data.state {
            ReplicaState::New | ReplicaState::Destroyed => {
                Err(RepositoryError::not_in_cache(id, "Entry not in repository"))
            }
            _ => Ok(data.snapshot()),
        }
    }

    /// State of a replica; `New` if the repository has no record of it.
    pub fn get_state(&self, id: &ReplicaId) -> Result<ReplicaState> {
        self.inner.assert_initialized()?;
        Ok(match self.inner.get_record(id)? {
            Some(record) => record.lock().state,
            None => ReplicaState::New,
        })
    }

    /// Change the state of a replica at rest.
    ///
    /// Removing an unknown or already removed replica succeeds.
    pub fn set_state(&self, id: &ReplicaId, state: ReplicaState) -> Result<()> {
        let inner = &self.inner;
        inner.assert_open()?;
        let Some(record) = inner.get_record(id)? else {
            if state == ReplicaState::Removed {
                return Ok(());
            }
            return Err(RepositoryError::IllegalTransition {
                id: id.clone(),
                from: ReplicaState::New,
                to: state,
            });
        };

        let mut deferred = Deferred::default();
        let result = {
            let _io = record.lock_io();
            let mut data = record.lock();
            match data.state.transition_to(state) {
                Transition::NoOp => Ok(()),
                Transition::Illegal => Err(RepositoryError::IllegalTransition {
                    id: id.clone(),
                    from: data.state,
                    to: state,
                }),
                Transition::Apply => inner.apply_state(&record, &mut data, state, &mut deferred),
            }
        };
        inner.run_deferred(deferred);
        result
    }

    /// Pin a replica for `owner` until `expires_at` (`None` pins forever).
    ///
    /// An expiry that already passed clears the owner's pin.
    pub fn set_sticky(
        &self,
        id: &ReplicaId,
        owner: &str,
        expires_at: Option<SystemTime>,
        overwrite: bool,
    ) -> Result<()> {
        if owner.is_empty() {
            return Err(RepositoryError::InvalidArgument(
                "Sticky owner must not be empty".to_string(),
            ));
        }
        let inner = &self.inner;
        inner.assert_initialized()?;
        let Some(record) = inner.get_record(id)? else {
            return Err(inner.stale_location(id));
        };

        let _io = record.lock_io();
        let mut data = record.lock();
        match data.state {
            ReplicaState::New
            | ReplicaState::FromClient
            | ReplicaState::FromStore
            | ReplicaState::FromPool => {
                Err(RepositoryError::not_in_cache(id, "File is incomplete"))
            }
            ReplicaState::Removed | ReplicaState::Destroyed => {
                Err(RepositoryError::not_in_cache(id, "File has been removed"))
            }
            ReplicaState::Broken | ReplicaState::Precious | ReplicaState::Cached => inner
                .update_sticky(&mut data, owner, expires_at, overwrite)
                .map(|_| ()),
        }
    }

    /// Current ledger snapshot including gap and LRU age.
    pub fn space_record(&self) -> SpaceRecord {
        self.inner.space_record()
    }

    /// Set the runtime pool size; `Infinite` falls back to the configured
    /// size. Persisted in the pool setup.
    pub fn set_max_disk_space(&self, size: DiskSpace) -> Result<()> {
        let inner = &self.inner;
        let mut limits = inner.limits.lock();
        let previous = *limits;
        limits.runtime_max = size.bytes();
        if inner.lifecycle() == Lifecycle::Open {
            if let Err(e) = inner.resize(&limits) {
                *limits = previous;
                return Err(e);
            }
        }
        inner.save_setup(&limits)
    }

    /// Set the gap reported as always removable. Persisted in the pool setup.
    pub fn set_gap(&self, gap: DiskSpace) -> Result<()> {
        let Some(bytes) = gap.bytes() else {
            return Err(RepositoryError::InvalidArgument(
                "Gap must be a finite size".to_string(),
            ));
        };
        let mut limits = self.inner.limits.lock();
        limits.gap = Some(bytes);
        self.inner.save_setup(&limits)
    }

    pub fn add_listener(&self, listener: StateListener) -> ListenerId {
        self.inner.notifier.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.notifier.remove_listener(id)
    }

    /// Channel receiving every event raised from now on.
    pub fn subscribe(&self) -> Receiver<ReplicaEvent> {
        self.inner.notifier.subscribe()
    }

    /// Deliver events on the mutating thread. Listeners must then not call
    /// back into the repository.
    pub fn set_synchronous_notification(&self, value: bool) {
        self.inner.notifier.set_synchronous(value);
    }

    pub fn add_fault_listener(&self, listener: FaultListener) -> ListenerId {
        self.inner.faults.add(listener)
    }

    pub fn remove_fault_listener(&self, id: ListenerId) -> bool {
        self.inner.faults.remove(id)
    }

    /// Stop background tasks and deliver pending events.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.lifecycle.write();
            if *state == Lifecycle::Closed {
                return;
            }
            *state = Lifecycle::Closed;
        }
        if let Some(task) = inner.health_task.lock().take() {
            task.cancel();
        }
        for task in inner.expiration_tasks.iter() {
            task.value().cancel();
        }
        inner.expiration_tasks.clear();
        inner.scheduler.shutdown();
        inner.notifier.stop();
        log_repo_info!("Repository closed", pool = inner.pool_name.as_str());
    }
}

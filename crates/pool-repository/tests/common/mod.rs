#![allow(dead_code)]

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use pool_config::testing::TestEnvironment;
use pool_config::DiskSpace;
use pool_repository::{
    FileAttributes, FileMetadataStore, LruSweeper, MetadataStore, Namespace, NamespaceError,
    NamespaceResult, OpenFlags, PersistedRecord, ReplicaEvent, ReplicaId, ReplicaState,
    Repository, StoreError, StoreResult,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SetAttributes(ReplicaId),
    AddLocation(ReplicaId),
    ClearLocation(ReplicaId),
    GetAttributes(ReplicaId),
}

/// Namespace double that records every call and can be told to fail.
#[derive(Default)]
pub struct RecordingNamespace {
    pub calls: Mutex<Vec<Call>>,
    /// Ids the catalog no longer knows
    pub deleted: Mutex<Vec<ReplicaId>>,
    /// Number of clear-location calls to time out before succeeding
    pub clear_timeouts: AtomicUsize,
}

impl RecordingNamespace {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn delete(&self, id: &ReplicaId) {
        self.deleted.lock().push(id.clone());
    }

    fn check(&self, id: &ReplicaId) -> NamespaceResult<()> {
        if self.deleted.lock().contains(id) {
            return Err(NamespaceError::FileNotFound(id.clone()));
        }
        Ok(())
    }
}

impl Namespace for RecordingNamespace {
    fn set_file_attributes(&self, id: &ReplicaId, _attributes: &FileAttributes) -> NamespaceResult<()> {
        self.calls.lock().push(Call::SetAttributes(id.clone()));
        self.check(id)
    }

    fn add_cache_location(&self, id: &ReplicaId, _pool: &str) -> NamespaceResult<()> {
        self.calls.lock().push(Call::AddLocation(id.clone()));
        self.check(id)
    }

    fn clear_cache_location(&self, id: &ReplicaId, _pool: &str, _remove_if_last: bool) -> NamespaceResult<()> {
        self.calls.lock().push(Call::ClearLocation(id.clone()));
        let pending = self.clear_timeouts.load(Ordering::SeqCst);
        if pending > 0 {
            self.clear_timeouts.store(pending - 1, Ordering::SeqCst);
            return Err(NamespaceError::Timeout("catalog busy".to_string()));
        }
        Ok(())
    }

    fn get_file_attributes(&self, id: &ReplicaId) -> NamespaceResult<FileAttributes> {
        self.calls.lock().push(Call::GetAttributes(id.clone()));
        self.check(id)?;
        Ok(FileAttributes::new(id.clone()))
    }
}

/// Store wrapper with injectable timeouts, write failures, slow writes and a
/// shrunken file system.
pub struct FlakyStore {
    pub inner: FileMetadataStore,
    /// Number of `get` calls to time out before succeeding
    pub get_timeouts: AtomicUsize,
    /// Fail `put` and the health check with an I/O error
    pub fail_writes: AtomicBool,
    /// Delay every `put`
    pub put_delay: Mutex<Option<Duration>>,
    /// Reported free space instead of the real one
    pub free_space: Mutex<Option<u64>>,
}

impl FlakyStore {
    pub fn new(inner: FileMetadataStore) -> Self {
        Self {
            inner,
            get_timeouts: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            put_delay: Mutex::new(None),
            free_space: Mutex::new(None),
        }
    }

    fn write_failure(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(io::Error::new(io::ErrorKind::Other, "disk gone")));
        }
        Ok(())
    }
}

impl MetadataStore for FlakyStore {
    fn list(&self) -> StoreResult<Vec<ReplicaId>> {
        self.inner.list()
    }

    fn get(&self, id: &ReplicaId) -> StoreResult<Option<PersistedRecord>> {
        let pending = self.get_timeouts.load(Ordering::SeqCst);
        if pending > 0 {
            self.get_timeouts.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::Timeout("store busy".to_string()));
        }
        self.inner.get(id)
    }

    fn create(&self, record: &PersistedRecord) -> StoreResult<()> {
        self.inner.create(record)
    }

    fn put(&self, record: &PersistedRecord) -> StoreResult<()> {
        if let Some(delay) = *self.put_delay.lock() {
            std::thread::sleep(delay);
        }
        self.write_failure()?;
        self.inner.put(record)
    }

    fn remove(&self, id: &ReplicaId) -> StoreResult<()> {
        self.inner.remove(id)
    }

    fn data_path(&self, id: &ReplicaId) -> PathBuf {
        self.inner.data_path(id)
    }

    fn free_space(&self) -> StoreResult<u64> {
        match *self.free_space.lock() {
            Some(free) => Ok(free),
            None => self.inner.free_space(),
        }
    }

    fn total_space(&self) -> StoreResult<u64> {
        self.inner.total_space()
    }

    fn check_health(&self) -> StoreResult<()> {
        self.write_failure()?;
        self.inner.check_health()
    }
}

/// A repository over a temporary pool directory.
pub struct TestPool {
    pub env: TestEnvironment,
    pub namespace: Arc<RecordingNamespace>,
    pub repo: Repository,
    pub events: Receiver<ReplicaEvent>,
}

pub const POOL_SIZE: u64 = 1 << 20;

impl TestPool {
    /// An open pool of [`POOL_SIZE`] bytes.
    pub fn new() -> Self {
        let pool = Self::unloaded();
        pool.repo.load().unwrap();
        pool
    }

    pub fn unloaded() -> Self {
        let mut env = TestEnvironment::new().unwrap();
        env.config.repository.max_diskspace = Some(DiskSpace::Bytes(POOL_SIZE));
        Self::with_env(env)
    }

    pub fn with_env(env: TestEnvironment) -> Self {
        let store = FileMetadataStore::open(&env.base_dir).unwrap();
        Self::with_store(env, Arc::new(store))
    }

    /// An unloaded pool over `store`.
    pub fn with_store(env: TestEnvironment, store: Arc<dyn MetadataStore>) -> Self {
        let namespace = Arc::new(RecordingNamespace::default());
        let repo = Repository::new(
            &env.config,
            store,
            namespace.clone(),
            Arc::new(LruSweeper::new()),
        );
        let events = repo.subscribe();
        Self {
            env,
            namespace,
            repo,
            events,
        }
    }

    /// Shut the repository down and open a fresh one over the same directory.
    pub fn restart(self) -> Self {
        self.repo.shutdown();
        let TestPool { env, .. } = self;
        Self::with_env(env)
    }

    /// Write and commit a replica of `len` bytes.
    pub fn write(&self, id: &ReplicaId, len: usize, target: ReplicaState) {
        let handle = self
            .repo
            .create_entry(
                FileAttributes::new(id.clone()),
                ReplicaState::FromClient,
                target,
                Vec::new(),
                OpenFlags::NONE,
            )
            .unwrap();
        handle.allocate(len as u64).unwrap();
        let mut channel = handle.create_channel().unwrap();
        channel.write_all(&vec![7u8; len]).unwrap();
        handle.commit().unwrap();
        handle.close().unwrap();
    }

    /// Collect events until none arrives for `quiet`.
    pub fn drain_events(&self, quiet: Duration) -> Vec<ReplicaEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.recv_timeout(quiet) {
            events.push(event);
        }
        events
    }

    /// Wait for a state change of `id` into `state`.
    pub fn wait_for_state(&self, id: &ReplicaId, state: ReplicaState) -> bool {
        while let Ok(event) = self.events.recv_timeout(Duration::from_secs(2)) {
            if event.id() == id && event.states().map(|(_, new)| new) == Some(state) {
                return true;
            }
        }
        false
    }

    /// Poll until `id` carries no sticky records.
    pub fn wait_for_sticky_clear(&self, id: &ReplicaId) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if self.repo.get_entry(id).map(|e| e.sticky.is_empty()).unwrap_or(false) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

pub fn id(s: &str) -> ReplicaId {
    s.parse().unwrap()
}

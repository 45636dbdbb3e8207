//! Delivery of replica change events to registered listeners.
//!
//! Events are queued on a bounded channel and delivered by one dispatcher
//! thread, so listeners see the events of a record in the order they were
//! raised. Raising never blocks: when the channel is full, events wait in an
//! overflow buffer that the dispatcher drains once the channel is empty. A
//! failing or panicking listener is logged and skipped.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::{Mutex, RwLock};
use pool_config::{log_repo_debug, log_repo_warn};
use tracing::field::display;

use crate::id::ReplicaId;
use crate::record::CacheEntry;
use crate::state::ReplicaState;
use crate::sticky::StickyRecord;

/// Handle returned when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaEvent {
    StateChanged { old: CacheEntry, new: CacheEntry },
    AccessTimeChanged { entry: CacheEntry },
    /// `record` is the sticky record that was added, changed or removed
    StickyChanged { entry: CacheEntry, record: StickyRecord },
}

impl ReplicaEvent {
    pub fn id(&self) -> &ReplicaId {
        match self {
            ReplicaEvent::StateChanged { new, .. } => &new.id,
            ReplicaEvent::AccessTimeChanged { entry } => &entry.id,
            ReplicaEvent::StickyChanged { entry, .. } => &entry.id,
        }
    }

    /// `(old, new)` for state changes.
    pub fn states(&self) -> Option<(ReplicaState, ReplicaState)> {
        match self {
            ReplicaEvent::StateChanged { old, new } => Some((old.state, new.state)),
            _ => None,
        }
    }
}

pub type StateListener = Arc<dyn Fn(&ReplicaEvent) -> anyhow::Result<()> + Send + Sync>;

type Listeners = Arc<RwLock<Vec<(ListenerId, StateListener)>>>;

/// Producer side of the event queue.
///
/// Once the overflow buffer holds an event, later events go there too until
/// the dispatcher has taken it, which keeps delivery in raise order.
#[derive(Default)]
struct Outbox {
    sender: Option<Sender<ReplicaEvent>>,
    overflow: VecDeque<ReplicaEvent>,
}

pub(crate) struct Notifier {
    listeners: Listeners,
    next_id: AtomicU64,
    synchronous: AtomicBool,
    outbox: Arc<Mutex<Outbox>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: Option<ThreadId>,
}

fn dispatch(listeners: &Listeners, event: &ReplicaEvent) {
    let current: Vec<StateListener> = listeners.read().iter().map(|(_, l)| l.clone()).collect();
    for listener in current {
        match catch_unwind(AssertUnwindSafe(|| listener(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log_repo_warn!(
                "State change listener failed",
                id = event.id().as_str(),
                error = display(&e)
            ),
            Err(_) => log_repo_warn!("State change listener panicked", id = event.id().as_str()),
        }
    }
}

fn drain_overflow(outbox: &Mutex<Outbox>, listeners: &Listeners) -> bool {
    let pending = std::mem::take(&mut outbox.lock().overflow);
    if pending.is_empty() {
        return false;
    }
    for event in &pending {
        dispatch(listeners, event);
    }
    true
}

fn run_dispatcher(rx: Receiver<ReplicaEvent>, outbox: Arc<Mutex<Outbox>>, listeners: Listeners) {
    loop {
        match rx.try_recv() {
            Ok(event) => {
                dispatch(&listeners, &event);
                continue;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => break,
        }
        // The channel is empty, so everything buffered is next in line.
        if drain_overflow(&outbox, &listeners) {
            continue;
        }
        match rx.recv() {
            Ok(event) => dispatch(&listeners, &event),
            Err(_) => break,
        }
    }
    drain_overflow(&outbox, &listeners);
    log_repo_debug!("Notification dispatcher stopped");
}

impl Notifier {
    pub fn new(capacity: usize, synchronous: bool) -> Self {
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));
        let outbox = Arc::new(Mutex::new(Outbox::default()));
        let (tx, rx) = bounded::<ReplicaEvent>(capacity.max(1));

        let worker = {
            let listeners = listeners.clone();
            let outbox = outbox.clone();
            thread::Builder::new()
                .name("replica-events".to_string())
                .spawn(move || run_dispatcher(rx, outbox, listeners))
        };
        let (worker, worker_thread) = match worker {
            Ok(handle) => {
                let thread_id = handle.thread().id();
                outbox.lock().sender = Some(tx);
                (Some(handle), Some(thread_id))
            }
            Err(e) => {
                log_repo_warn!(
                    "Failed to start notification dispatcher, delivering synchronously",
                    error = display(&e)
                );
                (None, None)
            }
        };

        Self {
            listeners,
            next_id: AtomicU64::new(0),
            synchronous: AtomicBool::new(synchronous || worker.is_none()),
            outbox,
            worker: Mutex::new(worker),
            worker_thread,
        }
    }

    pub fn add_listener(&self, listener: StateListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    /// Channel receiving a copy of every event raised from now on.
    pub fn subscribe(&self) -> Receiver<ReplicaEvent> {
        let (tx, rx) = unbounded();
        self.add_listener(Arc::new(move |event: &ReplicaEvent| -> anyhow::Result<()> {
            // A dropped receiver just stops listening.
            let _ = tx.send(event.clone());
            Ok(())
        }));
        rx
    }

    pub fn set_synchronous(&self, value: bool) {
        self.synchronous.store(value, Ordering::SeqCst);
    }

    /// Queue `event` for delivery. Never blocks on listeners, so callers may
    /// hold a record lock.
    pub fn raise(&self, event: ReplicaEvent) {
        if self.synchronous.load(Ordering::SeqCst) {
            dispatch(&self.listeners, &event);
            return;
        }

        let mut guard = self.outbox.lock();
        let outbox = &mut *guard;
        let Some(tx) = &outbox.sender else {
            log_repo_debug!("Dropping event raised after shutdown", id = event.id().as_str());
            return;
        };
        if !outbox.overflow.is_empty() {
            outbox.overflow.push_back(event);
            return;
        }
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                log_repo_debug!("Notification queue full, buffering", id = event.id().as_str());
                outbox.overflow.push_back(event);
            }
            Err(TrySendError::Disconnected(event)) => {
                log_repo_debug!("Dropping event raised after shutdown", id = event.id().as_str());
            }
        }
    }

    /// Deliver every queued event, then stop the dispatcher.
    pub fn stop(&self) {
        self.outbox.lock().sender.take();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if Some(thread::current().id()) == self.worker_thread {
                return;
            }
            if handle.join().is_err() {
                log_repo_warn!("Notification dispatcher panicked");
            }
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.stop();
    }
}

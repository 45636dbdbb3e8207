//! Fault reporting towards the hosting process.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use pool_config::{log_repo_error, log_repo_warn};
use tracing::field::display;

use crate::notify::ListenerId;

/// What the hosting process should do with the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    ReadOnly,
    Disabled,
    Fatal,
}

impl fmt::Display for FaultAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FaultAction::ReadOnly => "READONLY",
            FaultAction::Disabled => "DISABLED",
            FaultAction::Fatal => "FATAL",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultEvent {
    pub source: String,
    pub action: FaultAction,
    pub message: String,
    pub cause: Option<String>,
}

pub type FaultListener = Arc<dyn Fn(&FaultEvent) + Send + Sync>;

/// Fault listeners are invoked synchronously on the reporting thread.
#[derive(Default)]
pub(crate) struct FaultListeners {
    listeners: RwLock<Vec<(ListenerId, FaultListener)>>,
    next_id: AtomicU64,
}

impl FaultListeners {
    pub fn add(&self, listener: FaultListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    pub fn report(&self, event: FaultEvent) {
        log_repo_error!(
            "Fault reported",
            message = event.message.as_str(),
            source = display(&event.source),
            action = display(&event.action),
            cause = event.cause.as_deref().unwrap_or("")
        );
        let listeners: Vec<FaultListener> =
            self.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                log_repo_warn!("Fault listener panicked", message = event.message.as_str());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_report_reaches_listeners_despite_panics() {
        let faults = FaultListeners::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        faults.add(Arc::new(|_: &FaultEvent| panic!("listener bug")));
        let id = {
            let seen = seen.clone();
            faults.add(Arc::new(move |e: &FaultEvent| seen.lock().push(e.action)))
        };

        faults.report(FaultEvent {
            source: "repository".into(),
            action: FaultAction::Disabled,
            message: "ledger broken".into(),
            cause: None,
        });
        assert_eq!(*seen.lock(), vec![FaultAction::Disabled]);

        assert!(faults.remove(id));
        assert!(!faults.remove(id));
    }
}

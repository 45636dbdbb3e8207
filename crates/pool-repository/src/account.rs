//! Space ledger shared by the repository and every replica handle.
//!
//! All counters live behind one mutex. `allocate` blocks on a condition
//! variable until enough space is free or its cancellation token fires;
//! every operation that makes space available wakes the waiters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("allocation cancelled")]
    Cancelled,

    #[error("cannot free {requested} bytes, only {used} bytes are used")]
    FreeUnderflow { requested: u64, used: u64 },

    #[error("cannot set total to {total} bytes, {used} bytes are used")]
    TotalBelowUsed { total: u64, used: u64 },

    #[error("{counter} space would become {value}")]
    CounterOutOfRange { counter: &'static str, value: i128 },

    #[error("ledger invariant violated: {0}")]
    Invariant(String),
}

/// Cooperative cancellation flag for blocking allocations.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Snapshot of the ledger as reported to the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SpaceRecord {
    pub total: u64,
    pub free: u64,
    pub precious: u64,
    pub removable: u64,
    /// Space reported as always removable
    pub gap: u64,
    /// Age of the least recently used removable replica
    pub lru_age: Duration,
}

impl SpaceRecord {
    pub fn used(&self) -> u64 {
        self.total - self.free
    }
}

#[derive(Debug, Default)]
struct Space {
    total: u64,
    used: u64,
    precious: u64,
    removable: u64,
}

impl Space {
    fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}

/// In-memory space accounting for one pool.
#[derive(Debug, Default)]
pub struct Account {
    space: Mutex<Space>,
    available: Condvar,
}

fn adjusted(counter: &'static str, current: u64, delta: i64, limit: u64) -> Result<u64, LedgerError> {
    let value = current as i128 + delta as i128;
    if value < 0 || value > limit as i128 {
        return Err(LedgerError::CounterOutOfRange { counter, value });
    }
    Ok(value as u64)
}

impl Account {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> u64 {
        self.space.lock().total
    }

    pub fn used(&self) -> u64 {
        self.space.lock().used
    }

    pub fn free_space(&self) -> u64 {
        self.space.lock().free()
    }

    pub fn precious(&self) -> u64 {
        self.space.lock().precious
    }

    pub fn removable(&self) -> u64 {
        self.space.lock().removable
    }

    /// Block until `size` bytes are free, then reserve them.
    ///
    /// Returns `Cancelled` without touching the counters if `token` fires
    /// while waiting. Cancellers must call [`Account::wake_waiters`] after
    /// cancelling so the waiter re-checks its token.
    pub fn allocate(&self, size: u64, token: &CancellationToken) -> Result<(), LedgerError> {
        let mut space = self.space.lock();
        loop {
            if token.is_cancelled() {
                return Err(LedgerError::Cancelled);
            }
            if space.free() >= size {
                space.used += size;
                return Ok(());
            }
            self.available.wait(&mut space);
        }
    }

    /// Reserve `size` bytes if they are free right now.
    pub fn allocate_now(&self, size: u64) -> bool {
        let mut space = self.space.lock();
        if space.free() < size {
            return false;
        }
        space.used += size;
        true
    }

    /// Return `size` bytes to the free pool.
    pub fn free(&self, size: u64) -> Result<(), LedgerError> {
        if size == 0 {
            return Ok(());
        }
        let mut space = self.space.lock();
        if size > space.used {
            return Err(LedgerError::FreeUnderflow {
                requested: size,
                used: space.used,
            });
        }
        space.used -= size;
        self.available.notify_all();
        Ok(())
    }

    pub fn adjust_precious(&self, delta: i64) -> Result<(), LedgerError> {
        let mut space = self.space.lock();
        space.precious = adjusted("precious", space.precious, delta, space.used)?;
        Ok(())
    }

    pub fn adjust_removable(&self, delta: i64) -> Result<(), LedgerError> {
        let mut space = self.space.lock();
        space.removable = adjusted("removable", space.removable, delta, space.used)?;
        Ok(())
    }

    /// Set the pool size. Refused if it would drop below used space.
    pub fn set_total(&self, total: u64) -> Result<(), LedgerError> {
        let mut space = self.space.lock();
        if total < space.used {
            return Err(LedgerError::TotalBelowUsed {
                total,
                used: space.used,
            });
        }
        let grew = total > space.total;
        space.total = total;
        if grew {
            self.available.notify_all();
        }
        Ok(())
    }

    /// Account for a replica found on disk during the inventory scan.
    pub fn grow_total_and_used(&self, size: u64) {
        let mut space = self.space.lock();
        space.total += size;
        space.used += size;
    }

    /// Recompute the pool size while holding the ledger lock.
    ///
    /// `resize` receives the used and current total space and returns the
    /// new total, or `None` to leave it unchanged. Returns the total in
    /// effect afterwards.
    pub fn update_total<E>(
        &self,
        resize: impl FnOnce(u64, u64) -> Result<Option<u64>, E>,
    ) -> Result<u64, E>
    where
        E: From<LedgerError>,
    {
        let mut space = self.space.lock();
        if let Some(total) = resize(space.used, space.total)? {
            if total < space.used {
                return Err(LedgerError::TotalBelowUsed {
                    total,
                    used: space.used,
                }
                .into());
            }
            let grew = total > space.total;
            space.total = total;
            if grew {
                self.available.notify_all();
            }
        }
        Ok(space.total)
    }

    /// Wake every blocked `allocate` so it re-checks space and its token.
    pub fn wake_waiters(&self) {
        let _space = self.space.lock();
        self.available.notify_all();
    }

    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        let space = self.space.lock();
        if space.used > space.total {
            return Err(LedgerError::Invariant(format!(
                "used {} exceeds total {}",
                space.used, space.total
            )));
        }
        if space.precious > space.used {
            return Err(LedgerError::Invariant(format!(
                "precious {} exceeds used {}",
                space.precious, space.used
            )));
        }
        if space.removable > space.used {
            return Err(LedgerError::Invariant(format!(
                "removable {} exceeds used {}",
                space.removable, space.used
            )));
        }
        Ok(())
    }

    pub fn space_record(&self) -> SpaceRecord {
        let space = self.space.lock();
        SpaceRecord {
            total: space.total,
            free: space.free(),
            precious: space.precious,
            removable: space.removable,
            gap: 0,
            lru_age: Duration::ZERO,
        }
    }
}

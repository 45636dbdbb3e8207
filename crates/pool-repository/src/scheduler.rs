//! Background timer for sticky expiration, health checks and retries.
//!
//! Delays are awaited on a small tokio runtime owned by the repository. The
//! work itself touches locks and the metadata store, so it runs on the
//! runtime's blocking pool.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pool_config::{log_repo_debug, log_repo_warn};
use tokio::runtime::{Builder, Runtime};
use tokio::task::AbortHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::field::display;

/// Cancels a scheduled task. Cancelling after the task ran is a no-op.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    abort: Option<AbortHandle>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    /// Whether the task ran, was cancelled or was never scheduled.
    pub fn is_finished(&self) -> bool {
        self.abort.as_ref().map_or(true, AbortHandle::is_finished)
    }
}

/// Run `job` on the blocking pool and wait for it.
async fn run_blocking<F>(job: F)
where
    F: FnOnce() + Send + 'static,
{
    if let Err(e) = tokio::task::spawn_blocking(job).await {
        if e.is_panic() {
            log_repo_warn!("Scheduled task panicked");
        }
    }
}

pub(crate) struct Scheduler {
    runtime: Mutex<Option<Runtime>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("replica-timer")
            .enable_time()
            .build();
        let runtime = match runtime {
            Ok(runtime) => Some(runtime),
            Err(e) => {
                log_repo_warn!(
                    "Failed to start scheduler runtime, background tasks disabled",
                    error = display(&e)
                );
                None
            }
        };
        Self {
            runtime: Mutex::new(runtime),
        }
    }

    fn spawn<T>(&self, task: T) -> TaskHandle
    where
        T: std::future::Future<Output = ()> + Send + 'static,
    {
        match self.runtime.lock().as_ref() {
            Some(runtime) => TaskHandle {
                abort: Some(runtime.spawn(task).abort_handle()),
            },
            None => {
                log_repo_debug!("Task scheduled after shutdown ignored");
                TaskHandle::default()
            }
        }
    }

    /// Run `job` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, job: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move {
            sleep(delay).await;
            run_blocking(job).await;
        })
    }

    /// Run `job` every `period`, first after one period. A run that overlaps
    /// the next tick delays it.
    pub fn schedule_periodic<F>(&self, period: Duration, job: F) -> TaskHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let job = Arc::new(job);
        self.spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let job = job.clone();
                run_blocking(move || job()).await;
            }
        })
    }

    /// Stop the runtime. Pending tasks are dropped without running.
    pub fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
            log_repo_debug!("Scheduler stopped");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

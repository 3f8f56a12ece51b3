//! Background tasks
//!
//! Every timer-driven loop in the broker runs as one of the two task kinds
//! defined here, spawned on the ambient tokio runtime and stopped through a
//! `CancellationToken`:
//! - `PeriodicTask`: runs a closure at a fixed period (maintenance, retention
//!   cleanup, consumer polling, auto-commit).
//! - `DebouncedTask`: runs a closure once per burst of triggers, after a fixed
//!   window (consumer group rebalancing).
//!
//! Both return `None` from `spawn` when called outside a tokio runtime so the
//! synchronous parts of the crate stay usable from plain `#[test]` code.
//! Dropping a task cancels it; `stop` additionally waits for the task to
//! finish, bounded by a timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug)]
struct TaskHandle {
    name: String,
    cancel: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TaskHandle {
    async fn stop(&self, timeout: Duration) {
        self.cancel.cancel();
        let join = self.join.lock().take();
        let Some(mut join) = join else {
            return;
        };
        match tokio::time::timeout(timeout, &mut join).await {
            Ok(Ok(())) => debug!(task = %self.name, "background task stopped"),
            Ok(Err(e)) => warn!(task = %self.name, "background task ended abnormally: {e}"),
            Err(_) => {
                warn!(task = %self.name, "background task did not stop in {timeout:?}, aborting");
                join.abort();
            }
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A closure executed at a fixed period until cancelled.
#[derive(Debug)]
pub struct PeriodicTask {
    inner: TaskHandle,
}

impl PeriodicTask {
    /// Spawn `tick` to run every `period`, first run one period from now.
    pub fn spawn<F>(name: impl Into<String>, period: Duration, mut tick: F) -> Option<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let runtime = Handle::try_current().ok()?;
        // tokio intervals panic on a zero period
        let period = period.max(Duration::from_millis(1));
        let name = name.into();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task_name = name.clone();

        let join = runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tick(),
                }
            }
            debug!(task = %task_name, "periodic task exiting");
        });

        Some(Self {
            inner: TaskHandle {
                name,
                cancel,
                join: Mutex::new(Some(join)),
            },
        })
    }

    /// Cancel the task and wait up to `timeout` for it to finish.
    pub async fn stop(&self, timeout: Duration) {
        self.inner.stop(timeout).await;
    }
}

/// A closure executed once per burst of `trigger` calls.
///
/// The first trigger arms the task; the closure runs after `window` has
/// elapsed, and every trigger received meanwhile is folded into that run.
/// Runs never overlap.
#[derive(Debug)]
pub struct DebouncedTask {
    inner: TaskHandle,
    pending: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl DebouncedTask {
    pub fn spawn<F>(name: impl Into<String>, window: Duration, mut run: F) -> Option<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let runtime = Handle::try_current().ok()?;
        let name = name.into();
        let cancel = CancellationToken::new();
        let pending = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());

        let token = cancel.clone();
        let task_pending = pending.clone();
        let task_notify = notify.clone();
        let task_name = name.clone();

        let join = runtime.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = task_notify.notified() => {}
                }
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(window) => {}
                }
                // A stale permit from a folded trigger finds nothing pending.
                if task_pending.swap(false, Ordering::AcqRel) {
                    run();
                }
            }
            debug!(task = %task_name, "debounced task exiting");
        });

        Some(Self {
            inner: TaskHandle {
                name,
                cancel,
                join: Mutex::new(Some(join)),
            },
            pending,
            notify,
        })
    }

    pub fn trigger(&self) {
        self.pending.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub async fn stop(&self, timeout: Duration) {
        self.inner.stop(timeout).await;
    }
}

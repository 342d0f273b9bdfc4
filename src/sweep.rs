//! Background sweep tasks.
//!
//! A sweeper runs a cleanup closure on a fixed period against a weakly-held target. It stops on
//! its own once the target is dropped, is aborted when its [`SweepHandle`] is cancelled or
//! dropped, and never keeps a runtime from shutting down.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Cancel handle for a running sweeper. Dropping it aborts the task.
#[derive(Debug)]
pub struct SweepHandle {
    task: Option<JoinHandle<()>>,
}

impl SweepHandle {
    /// Stop the sweeper. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Spawn `sweep` every `period` on the current tokio runtime.
///
/// Returns `None` outside a runtime; callers then rely on lazy expiry alone. The first sweep
/// happens one full `period` after spawning. `period` must be non-zero.
pub fn spawn<T, F, Fut>(target: Weak<T>, period: Duration, sweep: F) -> Option<SweepHandle>
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    let task = runtime.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(target) = target.upgrade() else {
                break;
            };
            sweep(target).await;
        }
    });
    Some(SweepHandle { task: Some(task) })
}

//! Tokio-backed timer service
//!
//! Each armed timer is a small tokio task that sleeps and then posts a
//! timeout message into the owning executor's mailbox, so expirations are
//! handled by the same single thread of control as every other event.
//! Cancelling aborts the task; a fire that was already posted is left for
//! the receiver to ignore.

use crate::executor::{ExecutorHandle, PostStatus};
use crate::mailbox::WaitPolicy;
use bluestack_core::{RequestId, Signal, TimerHandle, TimerService};
use hashbrown::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;

#[cfg(not(feature = "std"))]
use log::debug;
#[cfg(feature = "std")]
use tracing::debug;

/// Timer service that reports expirations as messages to an executor
///
/// Must be armed from inside a tokio runtime, which is always the case for
/// code running in an executor's handlers.
pub struct TokioTimerService<P> {
    executor: ExecutorHandle<P>,
    signal: Signal,
    to_param: fn(RequestId) -> P,
    next_handle: u64,
    armed: HashMap<TimerHandle, JoinHandle<()>>,
}

impl<P: Send + 'static> TokioTimerService<P> {
    /// Expirations are posted to `executor` as `signal` with `to_param(request)`
    pub fn new(executor: ExecutorHandle<P>, signal: Signal, to_param: fn(RequestId) -> P) -> Self {
        Self {
            executor,
            signal,
            to_param,
            next_handle: 0,
            armed: HashMap::new(),
        }
    }

    /// Timers armed and not yet fired or cancelled
    pub fn armed_count(&mut self) -> usize {
        self.reap();
        self.armed.len()
    }

    fn reap(&mut self) {
        self.armed.retain(|_, task| !task.is_finished());
    }
}

impl<P: Send + 'static> TimerService for TokioTimerService<P> {
    fn arm(&mut self, request: RequestId, after: Duration) -> TimerHandle {
        self.reap();

        self.next_handle += 1;
        let handle = TimerHandle::new(self.next_handle);

        let executor = self.executor.clone();
        let signal = self.signal;
        let param = (self.to_param)(request);

        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let PostStatus::Fail(e) = executor
                .post(signal, param, WaitPolicy::BlockingForever)
                .await
            {
                debug!(
                    "Timer for {} could not reach executor '{}': {}",
                    request,
                    executor.name(),
                    e
                );
            }
        });

        self.armed.insert(handle, task);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if let Some(task) = self.armed.remove(&handle) {
            task.abort();
        }
    }
}

impl<P> Drop for TokioTimerService<P> {
    fn drop(&mut self) {
        for (_, task) in self.armed.drain() {
            task.abort();
        }
    }
}

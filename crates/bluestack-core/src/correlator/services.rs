//! External services the correlator depends on
//!
//! The correlator never touches a radio or a clock directly. Frames leave
//! through a [`Transport`] and per-request deadlines are armed on a
//! [`TimerService`]; whoever owns the timer is responsible for feeding
//! expirations back through `RequestCorrelator::on_timeout` on the
//! correlator's own executor.

use crate::errors::TransportError;
use crate::types::{ContextKey, Opcode, RequestId, TimerHandle};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::time::Duration;
use std::sync::{Mutex, MutexGuard};

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// A single outbound protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub context: ContextKey,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Sink for outbound frames
pub trait Transport {
    /// Hand a frame to the lower layer. Must not block.
    fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        (**self).send(frame)
    }
}

// ----------------------------------------------------------------------------
// Timer Service
// ----------------------------------------------------------------------------

/// One-shot timers keyed by request
pub trait TimerService {
    /// Arm a timer that reports `request` once `after` has elapsed
    fn arm(&mut self, request: RequestId, after: Duration) -> TimerHandle;

    /// Cancel a timer. Cancelling a fired or unknown timer is a no-op.
    fn cancel(&mut self, handle: TimerHandle);
}

impl<M: TimerService + ?Sized> TimerService for Box<M> {
    fn arm(&mut self, request: RequestId, after: Duration) -> TimerHandle {
        (**self).arm(request, after)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        (**self).cancel(handle)
    }
}

// ----------------------------------------------------------------------------
// Manual Timer
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ManualTimerState {
    now_ms: u64,
    next_handle: u64,
    armed: BTreeMap<TimerHandle, (u64, RequestId)>,
}

/// Deterministic timer driven by explicit calls to [`ManualTimer::advance`]
///
/// Clones share the same virtual clock, so a test can keep one clone while
/// the correlator owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualTimer {
    state: Arc<Mutex<ManualTimerState>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ManualTimerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move the virtual clock forward and return the requests whose timers
    /// expired, earliest deadline first
    pub fn advance(&self, millis: u64) -> Vec<RequestId> {
        let mut state = self.lock();
        state.now_ms = state.now_ms.saturating_add(millis);
        let now = state.now_ms;

        let mut expired: Vec<(u64, TimerHandle, RequestId)> = state
            .armed
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(handle, (deadline, request))| (*deadline, *handle, *request))
            .collect();
        expired.sort();

        for (_, handle, _) in &expired {
            state.armed.remove(handle);
        }

        expired.into_iter().map(|(_, _, request)| request).collect()
    }

    /// Current virtual time in milliseconds
    pub fn now_ms(&self) -> u64 {
        self.lock().now_ms
    }

    /// Number of armed, unexpired timers
    pub fn armed_count(&self) -> usize {
        self.lock().armed.len()
    }

    /// Absolute deadline of the timer armed for `request`
    pub fn deadline_of(&self, request: RequestId) -> Option<u64> {
        self.lock()
            .armed
            .values()
            .find(|(_, armed_for)| *armed_for == request)
            .map(|(deadline, _)| *deadline)
    }
}

impl TimerService for ManualTimer {
    fn arm(&mut self, request: RequestId, after: Duration) -> TimerHandle {
        let mut state = self.lock();
        state.next_handle += 1;
        let handle = TimerHandle::new(state.next_handle);
        let deadline = state.now_ms.saturating_add(after.as_millis() as u64);
        state.armed.insert(handle, (deadline, request));
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.lock().armed.remove(&handle);
    }
}

//! Request/response correlation for client models
//!
//! A [`RequestCorrelator`] pairs each acknowledged request it sends with the
//! response that eventually completes it, or with its timeout. Every
//! registered request ends in exactly one of three ways and its callback is
//! invoked exactly once:
//!
//! - a matching response arrives (`Ok(payload)`),
//! - its timer fires first (`Err(RequestError::ResponseTimeout)`),
//! - it is cancelled, alone or with its whole context (`Err(RequestError::Cancelled)`).
//!
//! A send that the transport refuses is reported through the callback as
//! `Err(RequestError::SendFailed)`. Inbound messages that match no
//! outstanding request are handed back as [`Correlation::Unsolicited`].
//!
//! The correlator takes no locks; it must be driven from a single executor.

mod opcode_table;
mod services;

pub use opcode_table::OpcodePairTable;
pub use services::{ManualTimer, OutboundFrame, TimerService, Transport};

use crate::config::CorrelatorConfig;
use crate::errors::{CorrelatorError, RequestError, StackResult};
use crate::types::{ContextKey, Opcode, RequestId, TimerHandle};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::time::Duration;
use instant::Instant;

cfg_if::cfg_if! {
    if #[cfg(feature = "tracing")] {
        use tracing::{debug, info, warn};
    } else {
        use log::{debug, info, warn};
    }
}

// ----------------------------------------------------------------------------
// Request Types
// ----------------------------------------------------------------------------

/// An acknowledged request to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub opcode: Opcode,
    pub context: ContextKey,
    pub payload: Vec<u8>,
    /// Overrides the configured default timeout
    pub timeout: Option<Duration>,
}

impl OutboundRequest {
    pub fn new<O: Into<Opcode>>(opcode: O, context: ContextKey, payload: Vec<u8>) -> Self {
        Self {
            opcode: opcode.into(),
            context,
            payload,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Terminal result handed to a request's callback
pub type RequestOutcome = Result<Vec<u8>, RequestError>;

/// Completion invoked exactly once per registered request
pub type ResponseCallback = Box<dyn FnOnce(RequestOutcome) + Send>;

/// Lifecycle of an outstanding request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Registered and waiting for a response
    Sent,
    /// Completed by a matching response
    Resolved,
    /// Timer fired before any response
    TimedOut,
    /// Cancelled explicitly or with its context
    Cancelled,
}

/// Inbound message that completed no outstanding request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsolicitedMessage {
    pub context: ContextKey,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Classification of an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// The message completed this request
    Resolved(RequestId),
    /// No outstanding request expected it; deliver as a publication
    Unsolicited(UnsolicitedMessage),
}

impl Correlation {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Correlation::Resolved(_))
    }
}

struct OutstandingRequest {
    id: RequestId,
    opcode_sent: Opcode,
    opcode_expected: Opcode,
    context: ContextKey,
    sent_at: Instant,
    timeout: Duration,
    timer: TimerHandle,
    callback: ResponseCallback,
}

impl OutstandingRequest {
    fn finish(self, state: RequestState, outcome: RequestOutcome) {
        debug!(
            "{} ({} -> {}) for {} finished as {:?} after {:?}",
            self.id,
            self.opcode_sent,
            self.opcode_expected,
            self.context,
            state,
            self.sent_at.elapsed()
        );
        (self.callback)(outcome);
    }
}

// ----------------------------------------------------------------------------
// Correlator Statistics
// ----------------------------------------------------------------------------

/// Running counters for one correlator
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CorrelatorStats {
    /// Acknowledged requests registered
    pub sent: u64,
    /// Requests completed by a response
    pub resolved: u64,
    /// Requests whose timer fired first
    pub timed_out: u64,
    /// Requests cancelled singly, by context, or in bulk
    pub cancelled: u64,
    /// Requests the transport refused
    pub send_failed: u64,
    /// Inbound messages that matched nothing
    pub unsolicited: u64,
    /// Unacknowledged messages sent
    pub unacknowledged: u64,
}

impl CorrelatorStats {
    /// Fraction of completed requests that received a response (0.0 to 1.0)
    pub fn success_rate(&self) -> f32 {
        let completed = self.resolved + self.timed_out + self.cancelled + self.send_failed;
        if completed == 0 {
            0.0
        } else {
            self.resolved as f32 / completed as f32
        }
    }
}

// ----------------------------------------------------------------------------
// Request Correlator
// ----------------------------------------------------------------------------

/// Outstanding-request tracker for one client model instance
pub struct RequestCorrelator<T: Transport, M: TimerService> {
    config: CorrelatorConfig,
    pairs: Arc<OpcodePairTable>,
    transport: T,
    timers: M,
    // Send order; the front is the oldest request
    outstanding: VecDeque<OutstandingRequest>,
    next_id: u64,
    stats: CorrelatorStats,
}

impl<T: Transport, M: TimerService> RequestCorrelator<T, M> {
    pub fn new(
        config: CorrelatorConfig,
        pairs: Arc<OpcodePairTable>,
        transport: T,
        timers: M,
    ) -> Self {
        Self {
            config,
            pairs,
            transport,
            timers,
            outstanding: VecDeque::new(),
            next_id: 0,
            stats: CorrelatorStats::default(),
        }
    }

    /// Register and send an acknowledged request
    ///
    /// Synchronous errors mean nothing was registered and `callback` is
    /// dropped without being called. Once an id is returned the callback
    /// will run exactly once, possibly before this call returns if the
    /// transport refuses the frame.
    pub fn send_request(
        &mut self,
        request: OutboundRequest,
        callback: ResponseCallback,
    ) -> StackResult<RequestId> {
        let opcode_expected = self.pairs.expected_response(request.opcode).ok_or(
            CorrelatorError::UnknownOpcode {
                opcode: request.opcode,
            },
        )?;

        if self.config.one_outstanding_per_context && self.contains_context(&request.context) {
            return Err(CorrelatorError::Busy {
                context: request.context,
            }
            .into());
        }

        if self.outstanding.len() >= self.config.max_outstanding {
            return Err(CorrelatorError::TooManyOutstanding {
                limit: self.config.max_outstanding,
            }
            .into());
        }

        self.next_id += 1;
        let id = RequestId::new(self.next_id);
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let timer = self.timers.arm(id, timeout);

        self.outstanding.push_back(OutstandingRequest {
            id,
            opcode_sent: request.opcode,
            opcode_expected,
            context: request.context,
            sent_at: Instant::now(),
            timeout,
            timer,
            callback,
        });
        self.stats.sent += 1;

        debug!(
            "Sending {} opcode {} to {} expecting {} within {:?}",
            id, request.opcode, request.context, opcode_expected, timeout
        );

        let frame = OutboundFrame {
            context: request.context,
            opcode: request.opcode,
            payload: request.payload,
        };

        if let Err(e) = self.transport.send(frame) {
            warn!("Transport refused {}: {}", id, e);
            if let Some(entry) = self.take(id) {
                self.timers.cancel(entry.timer);
                self.stats.send_failed += 1;
                entry.finish(RequestState::Cancelled, Err(RequestError::SendFailed(e)));
            }
        }

        Ok(id)
    }

    /// Send a message that expects no response; nothing is registered
    pub fn send_unacknowledged<O: Into<Opcode>>(
        &mut self,
        opcode: O,
        context: ContextKey,
        payload: Vec<u8>,
    ) -> StackResult<()> {
        let opcode = opcode.into();
        self.transport.send(OutboundFrame {
            context,
            opcode,
            payload,
        })?;
        self.stats.unacknowledged += 1;
        Ok(())
    }

    /// Classify an inbound message, resolving the oldest matching request
    pub fn on_message_received(
        &mut self,
        context: ContextKey,
        opcode: Opcode,
        payload: Vec<u8>,
    ) -> Correlation {
        let position = self
            .outstanding
            .iter()
            .position(|entry| entry.context == context && entry.opcode_expected == opcode);

        match position.and_then(|index| self.outstanding.remove(index)) {
            Some(entry) => {
                let id = entry.id;
                self.timers.cancel(entry.timer);
                self.stats.resolved += 1;
                entry.finish(RequestState::Resolved, Ok(payload));
                Correlation::Resolved(id)
            }
            None => {
                debug!("Unsolicited opcode {} from {}", opcode, context);
                self.stats.unsolicited += 1;
                Correlation::Unsolicited(UnsolicitedMessage {
                    context,
                    opcode,
                    payload,
                })
            }
        }
    }

    /// Report a fired timer. Returns whether a request actually timed out;
    /// a timer for a request that already finished is ignored.
    pub fn on_timeout(&mut self, id: RequestId) -> bool {
        match self.take(id) {
            Some(entry) => {
                info!(
                    "{} to {} timed out waiting for {}",
                    id, entry.context, entry.opcode_expected
                );
                self.stats.timed_out += 1;
                let error = RequestError::ResponseTimeout {
                    expected: entry.opcode_expected,
                    timeout_ms: entry.timeout.as_millis() as u64,
                };
                entry.finish(RequestState::TimedOut, Err(error));
                true
            }
            None => {
                debug!("Ignoring timer for finished {}", id);
                false
            }
        }
    }

    /// Cancel one request. Returns `false` if it already finished.
    pub fn cancel_request(&mut self, id: RequestId) -> bool {
        match self.take(id) {
            Some(entry) => {
                self.cancel_entry(entry);
                true
            }
            None => false,
        }
    }

    /// Cancel every request of a context; later responses for them are
    /// unsolicited. Returns the number cancelled.
    pub fn cancel_context(&mut self, context: &ContextKey) -> usize {
        let (cancelled, kept): (VecDeque<_>, VecDeque<_>) = self
            .outstanding
            .drain(..)
            .partition(|entry| entry.context == *context);
        self.outstanding = kept;

        let count = cancelled.len();
        if count > 0 {
            info!("Cancelling {} outstanding requests for {}", count, context);
        }
        for entry in cancelled {
            self.cancel_entry(entry);
        }
        count
    }

    /// Cancel everything, oldest first. Returns the number cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.outstanding.len();
        while let Some(entry) = self.outstanding.pop_front() {
            self.cancel_entry(entry);
        }
        count
    }

    fn cancel_entry(&mut self, entry: OutstandingRequest) {
        self.timers.cancel(entry.timer);
        self.stats.cancelled += 1;
        entry.finish(RequestState::Cancelled, Err(RequestError::Cancelled));
    }

    fn take(&mut self, id: RequestId) -> Option<OutstandingRequest> {
        let index = self.outstanding.iter().position(|entry| entry.id == id)?;
        self.outstanding.remove(index)
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_outstanding(&self, id: RequestId) -> bool {
        self.outstanding.iter().any(|entry| entry.id == id)
    }

    pub fn contains_context(&self, context: &ContextKey) -> bool {
        self.outstanding.iter().any(|entry| entry.context == *context)
    }

    /// Response opcode the request `id` is waiting for
    pub fn expected_opcode(&self, id: RequestId) -> Option<Opcode> {
        self.outstanding
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.opcode_expected)
    }

    pub fn pair_table(&self) -> &Arc<OpcodePairTable> {
        &self.pairs
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    pub fn stats(&self) -> &CorrelatorStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn timers(&self) -> &M {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut M {
        &mut self.timers
    }
}

impl<T: Transport, M: TimerService> Drop for RequestCorrelator<T, M> {
    fn drop(&mut self) {
        let cancelled = self.cancel_all();
        if cancelled > 0 {
            debug!("Correlator dropped with {} outstanding requests", cancelled);
        }
    }
}

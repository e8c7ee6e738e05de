//! Error types for the Bluestack host stack
//!
//! One enum per concern (mailbox, dispatch, state machines, correlation,
//! transport) unified by [`StackError`]. Request-level failures
//! ([`RequestError`]) are never returned synchronously; they reach the
//! requester through its callback, exactly once.

use crate::types::{ContextKey, Opcode, RequestId, Signal};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Mailbox queue failures, reported synchronously to the poster
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Mailbox full (capacity: {capacity})")]
    Full { capacity: usize },
    #[error("Mailbox empty")]
    Empty,
    #[error("Mailbox operation timed out after {waited_ms}ms")]
    Timeout { waited_ms: u64 },
    #[error("Mailbox closed")]
    Closed,
}

/// Failures while dispatching a dequeued message to its handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("No handler registered for {signal}")]
    HandlerNotFound { signal: Signal },
    #[error("Handler for {signal} panicked")]
    HandlerPanicked { signal: Signal },
    #[error("Handler for {signal} received an unexpected payload: {reason}")]
    UnexpectedPayload { signal: Signal, reason: String },
    #[error("Signal {signal} is already registered")]
    DuplicateSignal { signal: Signal },
}

/// State machine engine failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    #[error("State machine '{machine}' has been shut down")]
    Shutdown { machine: String },
    #[error("State machine '{machine}' exceeded {limit} chained transitions")]
    TransitionLoop { machine: String, limit: usize },
}

/// Synchronous failures of the request correlator (the request was never registered)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelatorError {
    #[error("Opcode {opcode} has no expected response in the pair table")]
    UnknownOpcode { opcode: Opcode },
    #[error("A request to {context} is already outstanding")]
    Busy { context: ContextKey },
    #[error("Too many outstanding requests (limit: {limit})")]
    TooManyOutstanding { limit: usize },
    #[error("Unknown request {id}")]
    UnknownRequest { id: RequestId },
}

/// Transport-level failures, opaque to the correlator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport busy: {reason}")]
    Busy { reason: String },
    #[error("Transport closed")]
    Closed,
    #[error("Transport rejected frame: {reason}")]
    Rejected { reason: String },
}

/// Terminal failure of an outstanding request, delivered through its callback
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("Send failed: {0}")]
    SendFailed(#[from] TransportError),
    #[error("No {expected} response within {timeout_ms}ms")]
    ResponseTimeout { expected: Opcode, timeout_ms: u64 },
    #[error("Request cancelled")]
    Cancelled,
}

// ----------------------------------------------------------------------------
// Stack Error
// ----------------------------------------------------------------------------

/// Core error type for the host stack
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("Correlator error: {0}")]
    Correlator(#[from] CorrelatorError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Executor lifecycle error (spawn failure, executor stopped)
    #[error("Executor '{name}': {reason}")]
    Executor { name: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl StackError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        StackError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create an executor lifecycle error
    pub fn executor_error<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        StackError::Executor {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Error reported to completions of messages an executor never processed
    pub fn executor_stopped<N: Into<String>>(name: N) -> Self {
        Self::executor_error(name, "executor stopped before processing the message")
    }

    /// Create an unexpected payload dispatch error
    pub fn unexpected_payload<R: Into<String>>(signal: Signal, reason: R) -> Self {
        StackError::Dispatch(DispatchError::UnexpectedPayload {
            signal,
            reason: reason.into(),
        })
    }

    /// Whether this error is a request timeout
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            StackError::Request(RequestError::ResponseTimeout { .. })
                | StackError::Queue(QueueError::Timeout { .. })
        )
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, StackError>;
pub type StackResult<T> = Result<T>;

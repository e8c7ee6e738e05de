//! Bluestack Core
//!
//! Runtime-agnostic building blocks of the Bluestack host stack: typed
//! identifiers, the error taxonomy, configuration, the state machine engine
//! and the client-model request correlator. Nothing in this crate spawns
//! threads or owns a clock; `bluestack-runtime` supplies executors, timers
//! and transports on top of it.

extern crate alloc;

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod correlator;
pub mod errors;
pub mod state_machine;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{CoreAffinity, CorrelatorConfig, ExecutorConfig, StackConfig};
pub use correlator::{
    Correlation, CorrelatorStats, ManualTimer, OpcodePairTable, OutboundFrame, OutboundRequest,
    RequestCorrelator, RequestOutcome, RequestState, ResponseCallback, TimerService, Transport,
    UnsolicitedMessage,
};
pub use errors::{
    CorrelatorError, DispatchError, QueueError, RequestError, Result, StackError, StackResult,
    StateMachineError, TransportError,
};
pub use state_machine::{SmEvent, StateHandler, StateMachine, Transition, MAX_CHAINED_TRANSITIONS};
pub use types::{ContextKey, Opcode, PeerAddr, RequestId, Signal, TimerHandle};

//! Bluestack Runtime
//!
//! Tokio-based execution layer of the Bluestack host stack:
//! - `mailbox`: bounded single-consumer queues with explicit wait policies
//! - `executor`: per-domain run loops dispatching signals to handlers
//! - `timer` / `transport`: correlator services that talk through mailboxes
//! - `client`: a client model task wrapping the request correlator
//! - `builder`: the stack wiring point that owns every executor thread

pub mod builder;
pub mod client;
pub mod executor;
pub mod logging;
pub mod mailbox;
pub mod timer;
pub mod transport;

pub use builder::{StackBuilder, StackHandle};
pub use client::{
    client_dispatch_table, new_client_model, signals, spawn_client_model, ClientHandle,
    ClientModelState, ClientParam, PublicationReceiver,
};
pub use executor::{
    spawn, Completion, DispatchTable, ExecutorHandle, ExecutorStatsSnapshot, HandlerFn,
    ManagedExecutor, Message, PostStatus, SpawnedExecutor, TaskContext, TaskExecutor,
};
pub use mailbox::{mailbox, EnqueueError, MailboxReceiver, MailboxSender, WaitPolicy};
pub use timer::TokioTimerService;
pub use transport::MailboxTransport;

// Re-export core types for convenience
pub use bluestack_core::{
    ContextKey, Correlation, CorrelatorConfig, ExecutorConfig, Opcode, OpcodePairTable,
    OutboundFrame, OutboundRequest, PeerAddr, QueueError, RequestError, RequestId, Signal,
    StackConfig, StackError, StackResult, Transport, TransportError, UnsolicitedMessage,
};

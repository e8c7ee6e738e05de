//! Client model task
//!
//! Runs a [`RequestCorrelator`] inside its own executor. Sends, inbound
//! messages, timer expirations and cancellations all arrive as messages, so
//! the correlator is only ever touched by that executor's thread. Inbound
//! messages that match no outstanding request are forwarded to a
//! publication channel for the application.

use crate::executor::{
    self, DispatchTable, ExecutorHandle, PostStatus, SpawnedExecutor, TaskContext, TaskExecutor,
};
use crate::mailbox::WaitPolicy;
use crate::timer::TokioTimerService;
use bluestack_core::{
    ContextKey, Correlation, CorrelatorConfig, ExecutorConfig, OpcodePairTable, Opcode,
    OutboundRequest, RequestCorrelator, RequestId, RequestOutcome, ResponseCallback, Signal,
    StackError, StackResult, Transport, UnsolicitedMessage,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[cfg(not(feature = "std"))]
use log::{debug, info, warn};
#[cfg(feature = "std")]
use tracing::{debug, info, warn};

// ----------------------------------------------------------------------------
// Signals and Parameters
// ----------------------------------------------------------------------------

pub mod signals {
    use bluestack_core::Signal;

    pub const SEND: Signal = Signal::new(0x0100);
    pub const SEND_UNACKNOWLEDGED: Signal = Signal::new(0x0101);
    pub const RECEIVED: Signal = Signal::new(0x0102);
    pub const TIMEOUT: Signal = Signal::new(0x0103);
    pub const CANCEL_CONTEXT: Signal = Signal::new(0x0104);
    pub const CANCEL_REQUEST: Signal = Signal::new(0x0105);
    pub const CANCEL_ALL: Signal = Signal::new(0x0106);
}

/// Payloads understood by the client model executor
pub enum ClientParam {
    Send {
        request: OutboundRequest,
        callback: ResponseCallback,
        reply: Option<oneshot::Sender<StackResult<RequestId>>>,
    },
    SendUnacknowledged {
        opcode: Opcode,
        context: ContextKey,
        payload: Vec<u8>,
    },
    Received {
        context: ContextKey,
        opcode: Opcode,
        payload: Vec<u8>,
    },
    Timeout(RequestId),
    CancelContext(ContextKey),
    CancelRequest(RequestId),
    CancelAll,
}

impl ClientParam {
    fn kind(&self) -> &'static str {
        match self {
            ClientParam::Send { .. } => "send",
            ClientParam::SendUnacknowledged { .. } => "send-unacknowledged",
            ClientParam::Received { .. } => "received",
            ClientParam::Timeout(_) => "timeout",
            ClientParam::CancelContext(_) => "cancel-context",
            ClientParam::CancelRequest(_) => "cancel-request",
            ClientParam::CancelAll => "cancel-all",
        }
    }
}

fn unexpected(signal: Signal, param: &ClientParam) -> StackError {
    StackError::unexpected_payload(signal, format!("got a {} payload", param.kind()))
}

// ----------------------------------------------------------------------------
// Client Model State
// ----------------------------------------------------------------------------

/// Correlator timers that report back into the client executor
pub type ClientTimers = TokioTimerService<ClientParam>;

/// State owned by a client model executor
pub struct ClientModelState<T: Transport> {
    correlator: RequestCorrelator<T, ClientTimers>,
    publications: mpsc::Sender<UnsolicitedMessage>,
}

impl<T: Transport> ClientModelState<T> {
    pub fn correlator(&self) -> &RequestCorrelator<T, ClientTimers> {
        &self.correlator
    }
}

fn on_send<T: Transport>(
    state: &mut ClientModelState<T>,
    _: &TaskContext<ClientParam>,
    param: ClientParam,
) -> StackResult<()> {
    let ClientParam::Send {
        request,
        callback,
        reply,
    } = param
    else {
        return Err(unexpected(signals::SEND, &param));
    };

    let result = state.correlator.send_request(request, callback);
    match reply {
        Some(reply) => {
            // The requester may have stopped waiting; the callback still owns the outcome
            let _ = reply.send(result);
            Ok(())
        }
        None => result.map(|_| ()),
    }
}

fn on_send_unacknowledged<T: Transport>(
    state: &mut ClientModelState<T>,
    _: &TaskContext<ClientParam>,
    param: ClientParam,
) -> StackResult<()> {
    let ClientParam::SendUnacknowledged {
        opcode,
        context,
        payload,
    } = param
    else {
        return Err(unexpected(signals::SEND_UNACKNOWLEDGED, &param));
    };

    state.correlator.send_unacknowledged(opcode, context, payload)
}

fn on_received<T: Transport>(
    state: &mut ClientModelState<T>,
    _: &TaskContext<ClientParam>,
    param: ClientParam,
) -> StackResult<()> {
    let ClientParam::Received {
        context,
        opcode,
        payload,
    } = param
    else {
        return Err(unexpected(signals::RECEIVED, &param));
    };

    match state.correlator.on_message_received(context, opcode, payload) {
        Correlation::Resolved(id) => debug!("Response {} from {} resolved {}", opcode, context, id),
        Correlation::Unsolicited(message) => {
            if let Err(e) = state.publications.try_send(message) {
                warn!("Publication {} from {} not delivered: {}", opcode, context, e);
            }
        }
    }
    Ok(())
}

fn on_timeout<T: Transport>(
    state: &mut ClientModelState<T>,
    _: &TaskContext<ClientParam>,
    param: ClientParam,
) -> StackResult<()> {
    let ClientParam::Timeout(id) = param else {
        return Err(unexpected(signals::TIMEOUT, &param));
    };

    state.correlator.on_timeout(id);
    Ok(())
}

fn on_cancel_context<T: Transport>(
    state: &mut ClientModelState<T>,
    _: &TaskContext<ClientParam>,
    param: ClientParam,
) -> StackResult<()> {
    let ClientParam::CancelContext(context) = param else {
        return Err(unexpected(signals::CANCEL_CONTEXT, &param));
    };

    let cancelled = state.correlator.cancel_context(&context);
    debug!("Cancelled {} requests for {}", cancelled, context);
    Ok(())
}

fn on_cancel_request<T: Transport>(
    state: &mut ClientModelState<T>,
    _: &TaskContext<ClientParam>,
    param: ClientParam,
) -> StackResult<()> {
    let ClientParam::CancelRequest(id) = param else {
        return Err(unexpected(signals::CANCEL_REQUEST, &param));
    };

    if !state.correlator.cancel_request(id) {
        debug!("{} already finished, nothing to cancel", id);
    }
    Ok(())
}

fn on_cancel_all<T: Transport>(
    state: &mut ClientModelState<T>,
    _: &TaskContext<ClientParam>,
    param: ClientParam,
) -> StackResult<()> {
    if !matches!(param, ClientParam::CancelAll) {
        return Err(unexpected(signals::CANCEL_ALL, &param));
    }

    let cancelled = state.correlator.cancel_all();
    info!("Client model cancelled all {} outstanding requests", cancelled);
    Ok(())
}

/// Dispatch table for a client model executor
pub fn client_dispatch_table<T: Transport>() -> DispatchTable<ClientModelState<T>, ClientParam> {
    let mut table = DispatchTable::new();
    let registrations: [(Signal, &'static str, executor::HandlerFn<ClientModelState<T>, ClientParam>); 7] = [
        (signals::SEND, "send", on_send::<T>),
        (
            signals::SEND_UNACKNOWLEDGED,
            "send_unacknowledged",
            on_send_unacknowledged::<T>,
        ),
        (signals::RECEIVED, "received", on_received::<T>),
        (signals::TIMEOUT, "timeout", on_timeout::<T>),
        (signals::CANCEL_CONTEXT, "cancel_context", on_cancel_context::<T>),
        (signals::CANCEL_REQUEST, "cancel_request", on_cancel_request::<T>),
        (signals::CANCEL_ALL, "cancel_all", on_cancel_all::<T>),
    ];

    for (signal, name, handler) in registrations {
        // Signals above are distinct constants
        let _ = table.register(signal, name, handler);
    }
    table
}

// ----------------------------------------------------------------------------
// Client Handle
// ----------------------------------------------------------------------------

/// Async API over a client model executor
#[derive(Debug, Clone)]
pub struct ClientHandle {
    executor: ExecutorHandle<ClientParam>,
}

impl ClientHandle {
    pub fn new(executor: ExecutorHandle<ClientParam>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &ExecutorHandle<ClientParam> {
        &self.executor
    }

    /// Register and send a request; `callback` later receives its outcome
    ///
    /// Returns once the correlator has accepted or refused the request. An
    /// `Err` means the callback will never be invoked.
    pub async fn send_request<F>(
        &self,
        request: OutboundRequest,
        callback: F,
    ) -> StackResult<RequestId>
    where
        F: FnOnce(RequestOutcome) + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let param = ClientParam::Send {
            request,
            callback: Box::new(callback),
            reply: Some(reply_tx),
        };

        self.executor
            .post(signals::SEND, param, WaitPolicy::BlockingForever)
            .await
            .into_result()?;

        reply_rx
            .await
            .unwrap_or_else(|_| Err(StackError::executor_stopped(self.executor.name())))
    }

    /// Send a request and wait for its response payload
    pub async fn request(&self, request: OutboundRequest) -> StackResult<Vec<u8>> {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        self.send_request(request, move |outcome| {
            let _ = outcome_tx.send(outcome);
        })
        .await?;

        match outcome_rx.await {
            Ok(outcome) => outcome.map_err(StackError::from),
            Err(_) => Err(StackError::executor_stopped(self.executor.name())),
        }
    }

    /// Send a message that expects no response
    pub async fn send_unacknowledged<O: Into<Opcode>>(
        &self,
        opcode: O,
        context: ContextKey,
        payload: Vec<u8>,
    ) -> StackResult<()> {
        self.executor
            .post_and_wait(
                signals::SEND_UNACKNOWLEDGED,
                ClientParam::SendUnacknowledged {
                    opcode: opcode.into(),
                    context,
                    payload,
                },
            )
            .await
    }

    /// Feed an inbound message to the correlator
    pub async fn deliver(&self, context: ContextKey, opcode: Opcode, payload: Vec<u8>) -> PostStatus {
        self.executor
            .post(
                signals::RECEIVED,
                ClientParam::Received {
                    context,
                    opcode,
                    payload,
                },
                WaitPolicy::BlockingForever,
            )
            .await
    }

    /// Non-blocking [`ClientHandle::deliver`] for transport threads
    pub fn try_deliver(&self, context: ContextKey, opcode: Opcode, payload: Vec<u8>) -> PostStatus {
        self.executor.try_post(
            signals::RECEIVED,
            ClientParam::Received {
                context,
                opcode,
                payload,
            },
        )
    }

    /// Cancel every request of `context`; no callback for them runs after
    /// this returns
    pub async fn cancel_context(&self, context: ContextKey) -> StackResult<()> {
        self.executor
            .post_and_wait(signals::CANCEL_CONTEXT, ClientParam::CancelContext(context))
            .await
    }

    pub async fn cancel_request(&self, id: RequestId) -> StackResult<()> {
        self.executor
            .post_and_wait(signals::CANCEL_REQUEST, ClientParam::CancelRequest(id))
            .await
    }

    pub async fn cancel_all(&self) -> StackResult<()> {
        self.executor
            .post_and_wait(signals::CANCEL_ALL, ClientParam::CancelAll)
            .await
    }

    /// Stop the client executor after its queued messages; outstanding
    /// requests are cancelled when its state is dropped
    pub async fn shutdown(&self) -> PostStatus {
        self.executor.shutdown().await
    }
}

// ----------------------------------------------------------------------------
// Construction
// ----------------------------------------------------------------------------

/// Channel receiving inbound messages that matched no outstanding request
pub type PublicationReceiver = mpsc::Receiver<UnsolicitedMessage>;

fn client_state<T: Transport>(
    context: &TaskContext<ClientParam>,
    correlator: CorrelatorConfig,
    pairs: Arc<OpcodePairTable>,
    transport: T,
    publications: mpsc::Sender<UnsolicitedMessage>,
) -> ClientModelState<T> {
    let timers = TokioTimerService::new(
        context.handle().clone(),
        signals::TIMEOUT,
        ClientParam::Timeout,
    );
    ClientModelState {
        correlator: RequestCorrelator::new(correlator, pairs, transport, timers),
        publications,
    }
}

/// Build a client model executor to be run inside an existing runtime
pub fn new_client_model<T, F>(
    config: ExecutorConfig,
    correlator: CorrelatorConfig,
    pairs: Arc<OpcodePairTable>,
    make_transport: F,
) -> (
    TaskExecutor<ClientModelState<T>, ClientParam>,
    ClientHandle,
    PublicationReceiver,
)
where
    T: Transport,
    F: FnOnce(&TaskContext<ClientParam>) -> T,
{
    let (publications, publication_rx) = mpsc::channel(config.queue_capacity.max(1));
    let (executor, handle) = TaskExecutor::new(config, client_dispatch_table(), |context| {
        let transport = make_transport(context);
        client_state(context, correlator, pairs, transport, publications)
    });
    (executor, ClientHandle::new(handle), publication_rx)
}

/// Run a client model executor on its own thread
pub fn spawn_client_model<T, F>(
    config: ExecutorConfig,
    correlator: CorrelatorConfig,
    pairs: Arc<OpcodePairTable>,
    make_transport: F,
) -> StackResult<(SpawnedExecutor<ClientParam>, ClientHandle, PublicationReceiver)>
where
    T: Transport + 'static,
    F: FnOnce(&TaskContext<ClientParam>) -> T + Send + 'static,
{
    correlator.validate()?;
    let (publications, publication_rx) = mpsc::channel(config.queue_capacity.max(1));
    let spawned = executor::spawn(config, client_dispatch_table(), move |context| {
        let transport = make_transport(context);
        client_state(context, correlator, pairs, transport, publications)
    })?;
    let handle = ClientHandle::new(spawned.handle().clone());
    Ok((spawned, handle, publication_rx))
}

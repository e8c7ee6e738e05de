//! Task Executor
//!
//! One executor is one concurrency domain: a mailbox, a piece of owned state
//! and a dispatch table of plain `fn` handlers keyed by [`Signal`]. The run
//! loop pulls one message at a time and runs its handler to completion before
//! pulling the next, so everything reachable from the state is mutated by a
//! single thread of control without locks.
//!
//! Other domains talk to an executor only through its [`ExecutorHandle`].
//! A handler that fails, panics, or is missing never stops the loop.

use crate::mailbox::{mailbox, MailboxReceiver, MailboxSender, WaitPolicy};
use bluestack_core::{
    DispatchError, ExecutorConfig, QueueError, Signal, StackError, StackResult,
};
use hashbrown::HashMap;
use instant::Instant;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::{oneshot, Notify};

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        use tracing::{debug, error, info, warn};
    } else {
        use log::{debug, error, info, warn};
    }
}

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

/// Completion invoked with the handler's result once a message is processed
pub type Completion = Box<dyn FnOnce(StackResult<()>) + Send>;

/// A signal, its owned payload and an optional completion
pub struct Message<P> {
    pub signal: Signal,
    pub param: P,
    completion: Option<Completion>,
}

impl<P> Message<P> {
    pub fn new(signal: Signal, param: P) -> Self {
        Self {
            signal,
            param,
            completion: None,
        }
    }

    pub fn with_completion<F>(mut self, completion: F) -> Self
    where
        F: FnOnce(StackResult<()>) + Send + 'static,
    {
        self.completion = Some(Box::new(completion));
        self
    }
}

impl<P> fmt::Debug for Message<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("signal", &self.signal)
            .field("completion", &self.completion.is_some())
            .finish_non_exhaustive()
    }
}

/// What actually travels through an executor's mailbox
pub(crate) enum Envelope<P> {
    Dispatch(Message<P>),
    Shutdown,
}

/// Result of posting to an executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostStatus {
    Success,
    Fail(QueueError),
}

impl PostStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, PostStatus::Success)
    }

    pub fn into_result(self) -> StackResult<()> {
        match self {
            PostStatus::Success => Ok(()),
            PostStatus::Fail(e) => Err(e.into()),
        }
    }
}

// ----------------------------------------------------------------------------
// Dispatch Table
// ----------------------------------------------------------------------------

/// Handler invoked for one signal with the executor's state and the payload
pub type HandlerFn<S, P> = fn(&mut S, &TaskContext<P>, P) -> StackResult<()>;

/// Signal to handler registrations for one executor
pub struct DispatchTable<S, P> {
    handlers: HashMap<Signal, (&'static str, HandlerFn<S, P>)>,
}

impl<S, P> Default for DispatchTable<S, P> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S, P> DispatchTable<S, P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `signal`; each signal can be registered once
    pub fn register(
        &mut self,
        signal: Signal,
        name: &'static str,
        handler: HandlerFn<S, P>,
    ) -> StackResult<&mut Self> {
        if self.handlers.contains_key(&signal) {
            return Err(DispatchError::DuplicateSignal { signal }.into());
        }
        self.handlers.insert(signal, (name, handler));
        Ok(self)
    }

    pub fn contains(&self, signal: Signal) -> bool {
        self.handlers.contains_key(&signal)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn get(&self, signal: Signal) -> Option<(&'static str, HandlerFn<S, P>)> {
        self.handlers.get(&signal).copied()
    }
}

// ----------------------------------------------------------------------------
// Executor Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ExecutorStats {
    processed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    handler_not_found: AtomicU64,
    rejected_posts: AtomicU64,
    dropped_at_shutdown: AtomicU64,
}

/// Point-in-time copy of an executor's counters
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStatsSnapshot {
    /// Messages taken from the mailbox and dispatched
    pub processed: u64,
    /// Handlers that returned an error
    pub failed: u64,
    /// Handlers that panicked
    pub panicked: u64,
    /// Messages whose signal had no handler
    pub handler_not_found: u64,
    /// Posts refused by the mailbox
    pub rejected_posts: u64,
    /// Messages still queued when the executor stopped
    pub dropped_at_shutdown: u64,
}

impl ExecutorStats {
    fn snapshot(&self) -> ExecutorStatsSnapshot {
        ExecutorStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            handler_not_found: self.handler_not_found.load(Ordering::Relaxed),
            rejected_posts: self.rejected_posts.load(Ordering::Relaxed),
            dropped_at_shutdown: self.dropped_at_shutdown.load(Ordering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// Executor Handle
// ----------------------------------------------------------------------------

/// Cloneable handle for posting to an executor from any thread
pub struct ExecutorHandle<P> {
    name: Arc<str>,
    sender: MailboxSender<Envelope<P>>,
    abort: Arc<Notify>,
    stats: Arc<ExecutorStats>,
}

impl<P> Clone for ExecutorHandle<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            sender: self.sender.clone(),
            abort: self.abort.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<P> fmt::Debug for ExecutorHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("name", &self.name)
            .field("queued", &self.queued())
            .finish()
    }
}

impl<P: Send + 'static> ExecutorHandle<P> {
    /// Post `param` under `signal`
    pub async fn post(&self, signal: Signal, param: P, policy: WaitPolicy) -> PostStatus {
        self.post_message(Message::new(signal, param), policy).await
    }

    /// Post with a completion that receives the handler's result
    ///
    /// If the post itself fails the completion is dropped without being
    /// called; the failure is the returned status.
    pub async fn post_with_callback<F>(
        &self,
        signal: Signal,
        param: P,
        policy: WaitPolicy,
        completion: F,
    ) -> PostStatus
    where
        F: FnOnce(StackResult<()>) + Send + 'static,
    {
        self.post_message(Message::new(signal, param).with_completion(completion), policy)
            .await
    }

    /// Post and wait until the handler has run, returning its result
    pub async fn post_and_wait(&self, signal: Signal, param: P) -> StackResult<()> {
        let (tx, rx) = oneshot::channel();
        self.post_with_callback(signal, param, WaitPolicy::BlockingForever, move |result| {
            let _ = tx.send(result);
        })
        .await
        .into_result()?;

        rx.await
            .unwrap_or_else(|_| Err(StackError::executor_stopped(&*self.name)))
    }

    /// Post a prepared message
    pub async fn post_message(&self, message: Message<P>, policy: WaitPolicy) -> PostStatus {
        let result = self.sender.enqueue(Envelope::Dispatch(message), policy).await;
        self.status(result.map_err(|e| e.error))
    }

    /// Non-blocking post usable from plain threads
    pub fn try_post(&self, signal: Signal, param: P) -> PostStatus {
        self.try_post_message(Message::new(signal, param))
    }

    pub fn try_post_message(&self, message: Message<P>) -> PostStatus {
        let result = self.sender.try_enqueue(Envelope::Dispatch(message));
        self.status(result.map_err(|e| e.error))
    }

    /// Ask the executor to stop once every message queued before this
    /// request has been processed
    pub async fn shutdown(&self) -> PostStatus {
        let result = self
            .sender
            .enqueue(Envelope::Shutdown, WaitPolicy::BlockingForever)
            .await;
        self.status(result.map_err(|e| e.error))
    }

    /// Non-blocking [`ExecutorHandle::shutdown`]
    pub fn try_shutdown(&self) -> PostStatus {
        let result = self.sender.try_enqueue(Envelope::Shutdown);
        self.status(result.map_err(|e| e.error))
    }
}

impl<P> ExecutorHandle<P> {
    /// Stop the executor after the message currently being handled,
    /// abandoning everything still queued
    pub fn abort(&self) {
        self.abort.notify_one();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Messages waiting in the mailbox
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    pub fn capacity(&self) -> usize {
        self.sender.capacity()
    }

    /// Whether the executor has stopped accepting messages
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn stats(&self) -> ExecutorStatsSnapshot {
        self.stats.snapshot()
    }

    fn status(&self, result: Result<(), QueueError>) -> PostStatus {
        match result {
            Ok(()) => PostStatus::Success,
            Err(e) => {
                self.stats.rejected_posts.fetch_add(1, Ordering::Relaxed);
                debug!("Post to executor '{}' refused: {}", self.name, e);
                PostStatus::Fail(e)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Task Context
// ----------------------------------------------------------------------------

/// What a handler can see of its own executor
pub struct TaskContext<P> {
    handle: ExecutorHandle<P>,
}

impl<P> TaskContext<P> {
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Handle onto the executor running this handler, e.g. for deferred
    /// self-posts from timers
    pub fn handle(&self) -> &ExecutorHandle<P> {
        &self.handle
    }
}

// ----------------------------------------------------------------------------
// Task Executor
// ----------------------------------------------------------------------------

/// A single-consumer run loop over owned state `S` and payloads `P`
pub struct TaskExecutor<S, P> {
    config: ExecutorConfig,
    table: DispatchTable<S, P>,
    receiver: MailboxReceiver<Envelope<P>>,
    context: TaskContext<P>,
    state: S,
}

fn channel<P>(config: &ExecutorConfig) -> (ExecutorHandle<P>, MailboxReceiver<Envelope<P>>) {
    let (sender, receiver) = mailbox(config.queue_capacity);
    let handle = ExecutorHandle {
        name: Arc::from(config.name.as_str()),
        sender,
        abort: Arc::new(Notify::new()),
        stats: Arc::new(ExecutorStats::default()),
    };
    (handle, receiver)
}

impl<S, P: Send + 'static> TaskExecutor<S, P> {
    /// Create an executor whose state is built by `init`
    ///
    /// The executor does nothing until [`TaskExecutor::run_forever`] is
    /// awaited; messages posted before that are queued.
    pub fn new<I>(config: ExecutorConfig, table: DispatchTable<S, P>, init: I) -> (Self, ExecutorHandle<P>)
    where
        I: FnOnce(&TaskContext<P>) -> S,
    {
        let (handle, receiver) = channel(&config);
        let executor = Self::assemble(config, table, receiver, handle.clone(), init);
        (executor, handle)
    }

    fn assemble<I>(
        config: ExecutorConfig,
        table: DispatchTable<S, P>,
        receiver: MailboxReceiver<Envelope<P>>,
        handle: ExecutorHandle<P>,
        init: I,
    ) -> Self
    where
        I: FnOnce(&TaskContext<P>) -> S,
    {
        let context = TaskContext { handle };
        let state = init(&context);
        Self {
            config,
            table,
            receiver,
            context,
            state,
        }
    }

    /// Handle onto this executor
    pub fn handle(&self) -> ExecutorHandle<P> {
        self.context.handle.clone()
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Run until shutdown or abort, then hand back the state
    ///
    /// On exit the mailbox is closed and every message still queued is
    /// dropped; their completions receive an "executor stopped" error.
    pub async fn run_forever(mut self) -> S {
        info!(
            "Executor '{}' running (priority {}, affinity {}, {} handlers, capacity {})",
            self.config.name,
            self.config.priority,
            self.config.affinity,
            self.table.len(),
            self.config.queue_capacity
        );

        let abort = self.context.handle.abort.clone();
        let mut running = true;

        while running {
            tokio::select! {
                biased;

                _ = abort.notified() => {
                    info!("Executor '{}' aborted", self.config.name);
                    running = false;
                }

                envelope = self.receiver.dequeue(WaitPolicy::BlockingForever) => {
                    match envelope {
                        Ok(Envelope::Dispatch(message)) => self.dispatch(message),
                        Ok(Envelope::Shutdown) => {
                            info!("Executor '{}' shutting down", self.config.name);
                            running = false;
                        }
                        Err(e) => {
                            warn!("Executor '{}' mailbox unavailable: {}", self.config.name, e);
                            running = false;
                        }
                    }
                }
            }
        }

        self.drain();
        info!(
            "Executor '{}' stopped: {:?}",
            self.config.name,
            self.context.handle.stats()
        );
        self.state
    }

    fn dispatch(&mut self, message: Message<P>) {
        let Message {
            signal,
            param,
            completion,
        } = message;
        let stats = &self.context.handle.stats;
        stats.processed.fetch_add(1, Ordering::Relaxed);

        let result = match self.table.get(signal) {
            None => {
                stats.handler_not_found.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Executor '{}' has no handler for {}",
                    self.config.name, signal
                );
                Err(DispatchError::HandlerNotFound { signal }.into())
            }
            Some((handler_name, handler)) => {
                let started = Instant::now();
                let state = &mut self.state;
                let context = &self.context;

                let outcome = catch_unwind(AssertUnwindSafe(|| handler(state, context, param)));
                debug!(
                    "Executor '{}' ran {} ({}) in {:?}",
                    self.config.name,
                    handler_name,
                    signal,
                    started.elapsed()
                );

                match outcome {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "Executor '{}' handler {} failed: {}",
                            self.config.name, handler_name, e
                        );
                        Err(e)
                    }
                    Err(_) => {
                        stats.panicked.fetch_add(1, Ordering::Relaxed);
                        error!(
                            "Executor '{}' handler {} panicked",
                            self.config.name, handler_name
                        );
                        Err(DispatchError::HandlerPanicked { signal }.into())
                    }
                }
            }
        };

        if let Some(completion) = completion {
            completion(result);
        }
    }

    fn drain(&mut self) {
        self.receiver.close();

        let mut dropped = 0u64;
        while let Ok(envelope) = self.receiver.try_dequeue() {
            if let Envelope::Dispatch(message) = envelope {
                dropped += 1;
                if let Some(completion) = message.completion {
                    completion(Err(StackError::executor_stopped(self.config.name.as_str())));
                }
            }
        }

        if dropped > 0 {
            self.context
                .handle
                .stats
                .dropped_at_shutdown
                .fetch_add(dropped, Ordering::Relaxed);
            warn!(
                "Executor '{}' dropped {} unprocessed messages",
                self.config.name, dropped
            );
        }
    }
}

// ----------------------------------------------------------------------------
// Dedicated Thread Executors
// ----------------------------------------------------------------------------

/// Run an executor on its own named OS thread with a current-thread runtime
///
/// The state is built on the new thread, so it does not need to be `Send`.
pub fn spawn<S, P, I>(
    config: ExecutorConfig,
    table: DispatchTable<S, P>,
    init: I,
) -> StackResult<SpawnedExecutor<P>>
where
    S: 'static,
    P: Send + 'static,
    I: FnOnce(&TaskContext<P>) -> S + Send + 'static,
{
    config.validate()?;

    let (handle, receiver) = channel(&config);
    let thread_handle = handle.clone();
    let name = config.name.clone();

    let thread = thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build();

            match runtime {
                Ok(runtime) => {
                    // State construction may already arm timers or spawn tasks
                    let executor = {
                        let _guard = runtime.enter();
                        TaskExecutor::assemble(config, table, receiver, thread_handle, init)
                    };
                    let state = runtime.block_on(executor.run_forever());
                    drop(state);
                }
                Err(e) => error!("Executor '{}' could not build its runtime: {}", config.name, e),
            }
        })
        .map_err(|e| StackError::executor_error(name.as_str(), e.to_string()))?;

    Ok(SpawnedExecutor {
        handle,
        thread: Some(thread),
    })
}

/// An executor running on a dedicated thread
///
/// Dropping it requests a graceful shutdown and joins the thread.
pub struct SpawnedExecutor<P> {
    handle: ExecutorHandle<P>,
    thread: Option<thread::JoinHandle<()>>,
}

impl<P> fmt::Debug for SpawnedExecutor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedExecutor")
            .field("name", &self.handle.name())
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl<P: Send + 'static> SpawnedExecutor<P> {
    pub fn handle(&self) -> &ExecutorHandle<P> {
        &self.handle
    }

    /// Ask the executor to stop after its queued messages. Falls back to
    /// abort when the mailbox is too full to take the request.
    pub fn request_shutdown(&self) {
        if let PostStatus::Fail(e) = self.handle.try_shutdown() {
            debug!(
                "Executor '{}' shutdown request refused ({}), aborting",
                self.handle.name(),
                e
            );
            self.handle.abort();
        }
    }

    /// Wait for the executor thread to exit. Blocks the calling thread.
    pub fn join(&mut self) -> StackResult<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| StackError::executor_error(self.handle.name(), "executor thread panicked")),
            None => Ok(()),
        }
    }

    /// Graceful shutdown followed by join
    pub fn shutdown(mut self) -> StackResult<()> {
        self.request_shutdown();
        self.join()
    }
}

impl<P> Drop for SpawnedExecutor<P> {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            if self.handle.sender.try_enqueue(Envelope::Shutdown).is_err() {
                self.handle.abort();
            }
            if thread.join().is_err() {
                error!("Executor '{}' thread panicked", self.handle.name());
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Managed Executors
// ----------------------------------------------------------------------------

/// Type-erased control surface over a spawned executor
pub trait ManagedExecutor: Send {
    fn name(&self) -> &str;
    fn request_shutdown(&self);
    fn abort(&self);
    fn join(&mut self) -> StackResult<()>;
    fn stats(&self) -> ExecutorStatsSnapshot;
}

impl<P: Send + 'static> ManagedExecutor for SpawnedExecutor<P> {
    fn name(&self) -> &str {
        self.handle.name()
    }

    fn request_shutdown(&self) {
        SpawnedExecutor::request_shutdown(self)
    }

    fn abort(&self) {
        self.handle.abort()
    }

    fn join(&mut self) -> StackResult<()> {
        SpawnedExecutor::join(self)
    }

    fn stats(&self) -> ExecutorStatsSnapshot {
        self.handle.stats()
    }
}

//! Mailbox Queue
//!
//! Bounded FIFO hand-off between any number of producers and exactly one
//! consumer. Built on a tokio bounded mpsc channel; the receiving half is
//! deliberately not `Clone`.
//!
//! A refused message is never dropped: enqueue failures hand it back inside
//! [`EnqueueError`].

use bluestack_core::QueueError;
use core::fmt;
use std::time::Duration;
use tokio::sync::mpsc::{
    self,
    error::{SendTimeoutError, TryRecvError, TrySendError},
};

// ----------------------------------------------------------------------------
// Wait Policy
// ----------------------------------------------------------------------------

/// How long an enqueue or dequeue may suspend the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Fail immediately with `Full` / `Empty`
    NonBlocking,
    /// Wait up to the given duration, then fail with `Timeout`
    BlockingWithTimeout(Duration),
    /// Wait until the operation can complete or the mailbox closes
    BlockingForever,
}

// ----------------------------------------------------------------------------
// Enqueue Error
// ----------------------------------------------------------------------------

/// A refused enqueue, carrying the message back to the caller
#[derive(thiserror::Error)]
#[error("{error}")]
pub struct EnqueueError<M> {
    pub error: QueueError,
    pub message: M,
}

impl<M> EnqueueError<M> {
    fn new(error: QueueError, message: M) -> Self {
        Self { error, message }
    }

    /// Recover the refused message
    pub fn into_inner(self) -> M {
        self.message
    }
}

impl<M> fmt::Debug for EnqueueError<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnqueueError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Mailbox
// ----------------------------------------------------------------------------

/// Create a mailbox holding at most `capacity` messages (minimum 1)
pub fn mailbox<M>(capacity: usize) -> (MailboxSender<M>, MailboxReceiver<M>) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (
        MailboxSender { inner: tx, capacity },
        MailboxReceiver { inner: rx },
    )
}

/// Producer half; cheap to clone
pub struct MailboxSender<M> {
    inner: mpsc::Sender<M>,
    capacity: usize,
}

impl<M> Clone for MailboxSender<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            capacity: self.capacity,
        }
    }
}

impl<M> fmt::Debug for MailboxSender<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxSender")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl<M> MailboxSender<M> {
    /// Enqueue `message` according to `policy`
    pub async fn enqueue(&self, message: M, policy: WaitPolicy) -> Result<(), EnqueueError<M>> {
        match policy {
            WaitPolicy::NonBlocking => self.try_enqueue(message),
            WaitPolicy::BlockingWithTimeout(wait) => {
                self.inner
                    .send_timeout(message, wait)
                    .await
                    .map_err(|e| match e {
                        SendTimeoutError::Timeout(message) => EnqueueError::new(
                            QueueError::Timeout {
                                waited_ms: wait.as_millis() as u64,
                            },
                            message,
                        ),
                        SendTimeoutError::Closed(message) => {
                            EnqueueError::new(QueueError::Closed, message)
                        }
                    })
            }
            WaitPolicy::BlockingForever => self
                .inner
                .send(message)
                .await
                .map_err(|e| EnqueueError::new(QueueError::Closed, e.0)),
        }
    }

    /// Non-blocking enqueue, callable from threads outside any runtime
    pub fn try_enqueue(&self, message: M) -> Result<(), EnqueueError<M>> {
        self.inner.try_send(message).map_err(|e| match e {
            TrySendError::Full(message) => EnqueueError::new(
                QueueError::Full {
                    capacity: self.capacity,
                },
                message,
            ),
            TrySendError::Closed(message) => EnqueueError::new(QueueError::Closed, message),
        })
    }

    /// Messages currently queued
    pub fn len(&self) -> usize {
        self.capacity.saturating_sub(self.inner.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the consumer has closed or dropped its half
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Consumer half; exactly one per mailbox
pub struct MailboxReceiver<M> {
    inner: mpsc::Receiver<M>,
}

impl<M> fmt::Debug for MailboxReceiver<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxReceiver").finish_non_exhaustive()
    }
}

impl<M> MailboxReceiver<M> {
    /// Dequeue the oldest message according to `policy`
    pub async fn dequeue(&mut self, policy: WaitPolicy) -> Result<M, QueueError> {
        match policy {
            WaitPolicy::NonBlocking => self.try_dequeue(),
            WaitPolicy::BlockingWithTimeout(wait) => {
                match tokio::time::timeout(wait, self.inner.recv()).await {
                    Ok(Some(message)) => Ok(message),
                    Ok(None) => Err(QueueError::Closed),
                    Err(_) => Err(QueueError::Timeout {
                        waited_ms: wait.as_millis() as u64,
                    }),
                }
            }
            WaitPolicy::BlockingForever => self.inner.recv().await.ok_or(QueueError::Closed),
        }
    }

    /// Non-blocking dequeue
    pub fn try_dequeue(&mut self) -> Result<M, QueueError> {
        self.inner.try_recv().map_err(|e| match e {
            TryRecvError::Empty => QueueError::Empty,
            TryRecvError::Disconnected => QueueError::Closed,
        })
    }

    /// Refuse further enqueues; already queued messages can still be drained
    pub fn close(&mut self) {
        self.inner.close();
    }
}

//! Mailbox-backed transport
//!
//! Hands outbound frames to another executor (typically the one owning the
//! bearer or the HCI link) by non-blocking post, so a correlator never
//! suspends on a busy lower layer.

use crate::executor::{ExecutorHandle, PostStatus};
use bluestack_core::{OutboundFrame, QueueError, Signal, Transport, TransportError};

/// [`Transport`] that posts each frame to a downstream executor
pub struct MailboxTransport<P> {
    target: ExecutorHandle<P>,
    signal: Signal,
    to_param: fn(OutboundFrame) -> P,
}

impl<P> MailboxTransport<P> {
    pub fn new(target: ExecutorHandle<P>, signal: Signal, to_param: fn(OutboundFrame) -> P) -> Self {
        Self {
            target,
            signal,
            to_param,
        }
    }

    pub fn target(&self) -> &ExecutorHandle<P> {
        &self.target
    }
}

impl<P: Send + 'static> Transport for MailboxTransport<P> {
    fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        match self.target.try_post(self.signal, (self.to_param)(frame)) {
            PostStatus::Success => Ok(()),
            PostStatus::Fail(QueueError::Closed) => Err(TransportError::Closed),
            PostStatus::Fail(e) => Err(TransportError::Busy {
                reason: format!("executor '{}': {}", self.target.name(), e),
            }),
        }
    }
}

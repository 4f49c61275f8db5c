//! Queue/topic abstraction (mechanics only).
//!
//! The channel model is the one exposed by hosted queue services:
//!
//! - **At-least-once delivery**: a message may be delivered more than once;
//!   consumers must be idempotent.
//! - **Leases**: a received message becomes invisible to other consumers for a
//!   lease window. Deleting it acknowledges it; letting the lease lapse makes it
//!   visible again (implicit retry).
//! - **No ordering**: deliveries may arrive in any order.
//!
//! Extending a lease is the only time-control primitive. It doubles as the
//! policy timer (grace periods) and as poll backoff (retrieval status).

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Opaque token identifying one particular delivery of a message.
///
/// A new handle is issued on every receive; only the latest one can delete or
/// extend the message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A raw message as handed out by a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub handle: ReceiptHandle,
    pub body: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub receive_count: u32,
}

/// A decoded message plus the handle needed to settle it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery<M> {
    pub handle: ReceiptHandle,
    pub message: M,
    pub receive_count: u32,
}

impl<M> Delivery<M> {
    pub fn new(handle: ReceiptHandle, message: M, receive_count: u32) -> Self {
        Self {
            handle,
            message,
            receive_count,
        }
    }

    pub fn is_redelivery(&self) -> bool {
        self.receive_count > 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The handle is stale (message deleted or re-received by someone else).
    #[error("receipt handle not found: {0}")]
    ReceiptNotFound(String),

    #[error("invalid lease of {0:?}")]
    InvalidLease(Duration),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Network/throttling/service failure; retry later.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel lock poisoned")]
    Poisoned,
}

/// Consumer side of a queue.
pub trait MessageChannel: Send + Sync {
    /// Long-poll for at most one message, waiting up to `wait`.
    fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage>, ChannelError>;

    /// Acknowledge (delete) a delivered message.
    fn delete(&self, handle: &ReceiptHandle) -> Result<(), ChannelError>;

    /// Make the message invisible for `lease`, measured from now.
    fn extend_lease(&self, handle: &ReceiptHandle, lease: Duration) -> Result<(), ChannelError>;
}

impl<C> MessageChannel for Arc<C>
where
    C: MessageChannel + ?Sized,
{
    fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage>, ChannelError> {
        (**self).receive(wait)
    }

    fn delete(&self, handle: &ReceiptHandle) -> Result<(), ChannelError> {
        (**self).delete(handle)
    }

    fn extend_lease(&self, handle: &ReceiptHandle, lease: Duration) -> Result<(), ChannelError> {
        (**self).extend_lease(handle, lease)
    }
}

/// Producer side: publish a typed event to a topic.
pub trait EventPublisher<M>: Send + Sync {
    fn publish(&self, message: &M) -> Result<(), ChannelError>;
}

impl<M, P> EventPublisher<M> for Arc<P>
where
    P: EventPublisher<M> + ?Sized,
{
    fn publish(&self, message: &M) -> Result<(), ChannelError> {
        (**self).publish(message)
    }
}

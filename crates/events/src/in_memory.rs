//! In-memory queue and topic for tests/dev.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use annotator_core::Clock;

use crate::channel::{ChannelError, EventPublisher, MessageChannel, ReceiptHandle, ReceivedMessage};
use crate::envelope::Notification;

/// Upper bound accepted for a single lease (matches hosted queue limits).
pub const MAX_LEASE: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Debug)]
struct StoredMessage {
    message_id: Uuid,
    body: String,
    visible_at: DateTime<Utc>,
    receipt: Option<ReceiptHandle>,
    receive_count: u32,
}

/// Point-in-time view of a queued message (introspection for tests/dev).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub message_id: Uuid,
    pub body: String,
    pub visible_at: DateTime<Utc>,
    pub receive_count: u32,
    pub in_flight: bool,
}

/// In-memory queue with visibility leases.
///
/// - Messages stay queued until deleted through their *latest* receipt handle
/// - A receive hides the message for `default_lease`
/// - Visibility is computed from the injected clock, so a `ManualClock`
///   controls redelivery deterministically
/// - Long-poll waits use real time and wake up on new arrivals
pub struct InMemoryQueue {
    name: String,
    clock: Arc<dyn Clock>,
    default_lease: Duration,
    messages: Mutex<Vec<StoredMessage>>,
    arrivals: Condvar,
}

impl core::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("name", &self.name)
            .field("default_lease", &self.default_lease)
            .finish_non_exhaustive()
    }
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>, clock: Arc<dyn Clock>, default_lease: Duration) -> Self {
        Self {
            name: name.into(),
            clock,
            default_lease,
            messages: Mutex::new(Vec::new()),
            arrivals: Condvar::new(),
        }
    }

    pub fn arc(name: impl Into<String>, clock: Arc<dyn Clock>, default_lease: Duration) -> Arc<Self> {
        Arc::new(Self::new(name, clock, default_lease))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a raw body (what a topic subscription or a direct send does).
    pub fn send_raw(&self, body: impl Into<String>) -> Result<Uuid, ChannelError> {
        let message_id = Uuid::new_v4();
        let now = self.clock.now();
        let mut messages = self.messages.lock().map_err(|_| ChannelError::Poisoned)?;
        messages.push(StoredMessage {
            message_id,
            body: body.into(),
            visible_at: now,
            receipt: None,
            receive_count: 0,
        });
        self.arrivals.notify_all();
        Ok(message_id)
    }

    /// Enqueue a payload directly, without a topic notification around it.
    pub fn send<M: Serialize>(&self, payload: &M) -> Result<Uuid, ChannelError> {
        let body =
            serde_json::to_string(payload).map_err(|e| ChannelError::Serialization(e.to_string()))?;
        self.send_raw(body)
    }

    /// Number of messages not yet deleted (visible or in flight).
    pub fn len(&self) -> usize {
        self.messages.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        let now = self.clock.now();
        let messages = match self.messages.lock() {
            Ok(m) => m,
            Err(_) => return vec![],
        };
        messages
            .iter()
            .map(|m| QueuedMessage {
                message_id: m.message_id,
                body: m.body.clone(),
                visible_at: m.visible_at,
                receive_count: m.receive_count,
                in_flight: m.visible_at > now,
            })
            .collect()
    }

    fn take_visible(&self, messages: &mut [StoredMessage]) -> Option<ReceivedMessage> {
        let now = self.clock.now();
        let msg = messages.iter_mut().find(|m| m.visible_at <= now)?;

        let handle = ReceiptHandle::new(Uuid::new_v4().to_string());
        msg.receipt = Some(handle.clone());
        msg.receive_count += 1;
        msg.visible_at = now + to_chrono(self.default_lease);

        debug!(
            queue = %self.name,
            message_id = %msg.message_id,
            receive_count = msg.receive_count,
            "message received"
        );

        Some(ReceivedMessage {
            handle,
            body: msg.body.clone(),
            receive_count: msg.receive_count,
        })
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

impl MessageChannel for InMemoryQueue {
    fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage>, ChannelError> {
        let deadline = Instant::now() + wait;
        let mut messages = self.messages.lock().map_err(|_| ChannelError::Poisoned)?;
        loop {
            if let Some(msg) = self.take_visible(&mut messages) {
                return Ok(Some(msg));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let (guard, _) = self
                .arrivals
                .wait_timeout(messages, remaining)
                .map_err(|_| ChannelError::Poisoned)?;
            messages = guard;
        }
    }

    fn delete(&self, handle: &ReceiptHandle) -> Result<(), ChannelError> {
        let mut messages = self.messages.lock().map_err(|_| ChannelError::Poisoned)?;
        let before = messages.len();
        messages.retain(|m| m.receipt.as_ref() != Some(handle));
        if messages.len() == before {
            return Err(ChannelError::ReceiptNotFound(handle.to_string()));
        }
        Ok(())
    }

    fn extend_lease(&self, handle: &ReceiptHandle, lease: Duration) -> Result<(), ChannelError> {
        if lease > MAX_LEASE {
            return Err(ChannelError::InvalidLease(lease));
        }
        let now = self.clock.now();
        let mut messages = self.messages.lock().map_err(|_| ChannelError::Poisoned)?;
        let msg = messages
            .iter_mut()
            .find(|m| m.receipt.as_ref() == Some(handle))
            .ok_or_else(|| ChannelError::ReceiptNotFound(handle.to_string()))?;
        msg.visible_at = now + to_chrono(lease);
        Ok(())
    }
}

/// In-memory fan-out topic.
///
/// Every publish is wrapped in a [`Notification`] and copied into each
/// subscribed queue.
#[derive(Debug)]
pub struct InMemoryTopic {
    name: String,
    subscribers: Mutex<Vec<Arc<InMemoryQueue>>>,
}

impl InMemoryTopic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self, queue: Arc<InMemoryQueue>) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(queue);
        }
    }
}

impl<M> EventPublisher<M> for InMemoryTopic
where
    M: Serialize,
{
    fn publish(&self, message: &M) -> Result<(), ChannelError> {
        let body = Notification::wrap(self.name.clone(), message)
            .and_then(|n| n.to_body())
            .map_err(|e| ChannelError::Serialization(e.to_string()))?;

        let subs = self.subscribers.lock().map_err(|_| ChannelError::Poisoned)?;
        for queue in subs.iter() {
            queue.send_raw(body.clone())?;
        }
        Ok(())
    }
}

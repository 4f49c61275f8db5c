//! Message channels and payloads exchanged between the pipeline workers.
//!
//! Workers never call each other: every hand-off is a message published to a
//! topic and consumed from a queue with at-least-once, lease-based delivery.

pub mod channel;
pub mod envelope;
pub mod in_memory;
pub mod messages;

pub use channel::{ChannelError, Delivery, EventPublisher, MessageChannel, ReceiptHandle, ReceivedMessage};
pub use envelope::{DecodeError, Notification};
pub use in_memory::{InMemoryQueue, InMemoryTopic, QueuedMessage, MAX_LEASE};
pub use messages::{CompletionEvent, JobRequest, RetrievalPendingEvent, UpgradeEvent};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::{Delivery, ReceivedMessage};

/// Topic notification wrapping a payload on its way to a subscribed queue.
///
/// Fan-out topics deliver `{"Type": "Notification", "MessageId": .., "TopicArn": ..,
/// "Message": "<payload json>"}` bodies; the payload itself is a JSON string
/// inside the envelope.
///
/// Notes:
/// - `message_id` is unique per publish, *not* per delivery.
/// - `message` is kept as a string so the envelope never needs to know the
///   payload type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Notification {
    #[serde(rename = "Type", default = "notification_type")]
    kind: String,
    message_id: Uuid,
    #[serde(rename = "TopicArn")]
    topic: String,
    message: String,
}

fn notification_type() -> String {
    "Notification".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("message body is not valid json: {0}")]
    Body(serde_json::Error),

    #[error("payload does not match the expected schema: {0}")]
    Payload(serde_json::Error),
}

impl Notification {
    pub fn wrap<M: Serialize>(topic: impl Into<String>, payload: &M) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: notification_type(),
            message_id: Uuid::new_v4(),
            topic: topic.into(),
            message: serde_json::to_string(payload)?,
        })
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn to_body(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Decode a queue body into a typed payload.
///
/// Accepts both topic notifications and payloads sent straight to the queue.
pub fn decode_body<M: DeserializeOwned>(body: &str) -> Result<M, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(body).map_err(DecodeError::Body)?;

    match value.get("Message").and_then(serde_json::Value::as_str) {
        Some(inner) => serde_json::from_str(inner).map_err(DecodeError::Payload),
        None => serde_json::from_value(value).map_err(DecodeError::Payload),
    }
}

impl ReceivedMessage {
    /// Decode into a typed delivery, keeping the receipt handle.
    pub fn decode<M: DeserializeOwned>(&self) -> Result<Delivery<M>, DecodeError> {
        let message = decode_body(&self.body)?;
        Ok(Delivery::new(self.handle.clone(), message, self.receive_count))
    }
}

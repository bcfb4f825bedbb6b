//! Control-plane frames exchanged with the relay.
//!
//! These travel unencrypted; for `pub` frames the `payload` field carries a
//! serialized [`Envelope`](crate::Envelope) and is opaque to the relay.

use serde::{Deserialize, Serialize};

/// Relay-level operation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ControlType {
    /// Join a topic's subscriber set.
    Sub,
    /// Publish a payload to a topic.
    Pub,
    /// Acknowledge receipt of a relayed frame.
    Ack,
}

/// A control-plane message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlMessage {
    /// Topic the operation addresses.
    pub topic: String,
    /// Operation type.
    #[serde(rename = "type")]
    pub control_type: ControlType,
    /// Payload; empty for `sub`/`ack`, a serialized envelope for `pub`.
    pub payload: String,
    /// Hint that the relay should not trigger push-style delivery.
    pub silent: bool,
}

impl ControlMessage {
    /// A `sub` frame for `topic`.
    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            control_type: ControlType::Sub,
            payload: String::new(),
            silent: true,
        }
    }

    /// A `pub` frame carrying `payload` to `topic`.
    pub fn publish(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            control_type: ControlType::Pub,
            payload: payload.into(),
            silent: true,
        }
    }

    /// An `ack` frame for `topic`.
    pub fn ack(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            control_type: ControlType::Ack,
            payload: String::new(),
            silent: true,
        }
    }
}

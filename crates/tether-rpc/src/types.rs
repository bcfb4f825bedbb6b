//! RPC wire-format types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A data-plane message: request, notification, or response.
///
/// The wire format is a JSON-RPC-style union; which fields are present
/// determines the kind. Field omission (not `null`) is significant, so every
/// field skips serialization when absent.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct RpcMessage {
    /// Call id; absent for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Method name; absent for responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Call or notification parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Success payload of a response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload of a response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

/// Structured error carried in a response.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcErrorBody {
    /// Machine-readable error code (e.g. `METHOD_NOT_FOUND`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// Classification of an [`RpcMessage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// Carries a method and an id; expects a response.
    Request,
    /// Carries a method but no id; fire and forget.
    Notification,
    /// Carries an id and a result or error.
    Response,
    /// None of the above.
    Malformed,
}

impl RpcMessage {
    /// Build a request.
    pub fn request(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Some(id),
            method: Some(method.into()),
            params,
            ..Self::default()
        }
    }

    /// Build a notification.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: Some(method.into()),
            params,
            ..Self::default()
        }
    }

    /// Build a success response.
    pub fn response(id: u64, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Self::default()
        }
    }

    /// Build an error response.
    pub fn error_response(id: u64, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            error: Some(RpcErrorBody {
                code: code.into(),
                message: message.into(),
            }),
            ..Self::default()
        }
    }

    /// Which kind of message this is.
    pub fn kind(&self) -> MessageKind {
        match (self.id, &self.method) {
            (Some(_), Some(_)) => MessageKind::Request,
            (None, Some(_)) => MessageKind::Notification,
            (Some(_), None) if self.result.is_some() || self.error.is_some() => {
                MessageKind::Response
            }
            _ => MessageKind::Malformed,
        }
    }
}

//! RPC error codes and error type.

use crate::types::RpcErrorBody;

// ── Error code constants ────────────────────────────────────────────

/// Invalid or missing parameters.
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
/// Method not accepted in the current session phase.
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
/// Unexpected internal error.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// The call table was closed before the call settled.
pub const CONNECTION_CLOSED: &str = "CONNECTION_CLOSED";
/// A duplicate request id arrived from the peer.
pub const DUPLICATE_REQUEST: &str = "DUPLICATE_REQUEST";
/// The peer rejected the request.
pub const PEER_ERROR: &str = "PEER_ERROR";

/// Error produced while issuing or settling calls.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum RpcError {
    /// Required parameter missing or wrong type.
    #[error("{message}")]
    InvalidParams {
        /// Description of what is wrong.
        message: String,
    },

    /// No handler accepts this method in the current phase.
    #[error("method '{method}' not found")]
    MethodNotFound {
        /// The rejected method name.
        method: String,
    },

    /// Unexpected internal failure.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },

    /// The engine was closed while the call was outstanding.
    #[error("closed: {message}")]
    Closed {
        /// Why the engine closed.
        message: String,
    },

    /// A structured error sent by the peer.
    #[error("{}: {}", .0.code, .0.message)]
    Peer(RpcErrorBody),
}

impl RpcError {
    /// Machine-readable code for this variant.
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::MethodNotFound { .. } => METHOD_NOT_FOUND,
            Self::Internal { .. } => INTERNAL_ERROR,
            Self::Closed { .. } => CONNECTION_CLOSED,
            Self::Peer(body) => &body.code,
        }
    }

    /// Convert to the wire-format error body.
    pub fn to_error_body(&self) -> RpcErrorBody {
        match self {
            Self::Peer(body) => body.clone(),
            other => RpcErrorBody {
                code: other.code().to_owned(),
                message: other.to_string(),
            },
        }
    }
}

impl From<RpcErrorBody> for RpcError {
    fn from(body: RpcErrorBody) -> Self {
        Self::Peer(body)
    }
}

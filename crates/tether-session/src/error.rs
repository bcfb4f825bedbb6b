//! Session error type.

use tether_core::{EnvelopeError, PairingUriError};
use tether_rpc::RpcError;

/// Errors surfaced by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A required field was missing or invalid.
    #[error("invalid {field}")]
    Validation {
        /// Name of the offending field.
        field: &'static str,
    },

    /// The bridge connection failed.
    #[error("transport: {reason}")]
    Transport {
        /// What went wrong.
        reason: String,
    },

    /// The initial bridge connection did not open in time.
    #[error("timed out connecting to bridge")]
    ConnectTimeout,

    /// The peer declined the pairing request.
    #[error("peer rejected pairing: {reason}")]
    PeerRejected {
        /// Rejection message from the peer.
        reason: String,
    },

    /// The session has been destroyed.
    #[error("session destroyed")]
    Destroyed,

    /// A data-plane call failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// An envelope could not be sealed or opened.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// The pairing string could not be parsed.
    #[error(transparent)]
    Pairing(#[from] PairingUriError),
}

//! # tether-core
//!
//! Shared wire types for the tether pairing protocol:
//!
//! - Envelope codec: authenticated encryption of data-plane payloads
//!   (AES-256-CBC + HMAC-SHA256, hex-encoded on the wire)
//! - Pairing URI: the out-of-band string that bootstraps a pairing
//! - Control messages: the unencrypted relay-level sub/pub/ack frames
//! - Peer metadata exchanged during the handshake

#![deny(unsafe_code)]

pub mod control;
pub mod envelope;
pub mod meta;
pub mod pairing;

pub use control::{ControlMessage, ControlType};
pub use envelope::{Envelope, EnvelopeError, PairingKey};
pub use meta::PeerMeta;
pub use pairing::{PairingUri, PairingUriError};

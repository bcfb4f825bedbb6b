//! # tether-session
//!
//! Client side of the tether pairing protocol:
//!
//! - [`Session`]: the pairing state machine, request queues, and
//!   lifecycle events
//! - [`Bridge`]: the resilient relay connection with transparent
//!   reconnect and envelope encryption
//! - [`AppLauncher`]: injected deep-link launch of the peer application
//!
//! A typical initiator flow: build a [`Session`] with
//! [`Session::initiator`], hand [`Session::pairing_uri`] to the peer
//! out of band, then await [`Session::create_session`].

#![deny(unsafe_code)]

pub mod bridge;
pub mod error;
pub mod events;
pub mod launcher;
pub mod routing;
pub mod session;

pub use bridge::{Bridge, BridgeConfig, BridgeState};
pub use error::SessionError;
pub use events::SessionEvent;
pub use launcher::AppLauncher;
pub use routing::{MethodRoute, SessionPhase};
pub use session::{
    OutgoingCall, PeerRequest, Request, RequestStatus, Session, SessionConfig, SessionDescriptor,
};

//! # tether-rpc
//!
//! The method-call dispatch and correlation engine used on the data plane:
//!
//! - [`RpcMessage`]: the JSON wire union for requests, notifications, and
//!   responses
//! - [`CallTable`]: call-id assignment and pending-call correlation
//! - [`DispatchContext`]: the per-dispatch request id, captured fresh for
//!   every inbound message

#![deny(unsafe_code)]

pub mod calls;
pub mod context;
pub mod errors;
pub mod types;

pub use calls::{CallTable, PendingCall};
pub use context::DispatchContext;
pub use errors::RpcError;
pub use types::{MessageKind, RpcErrorBody, RpcMessage};

//! Per-dispatch context.

use crate::types::RpcMessage;

/// Values scoped to the dispatch of one inbound message.
///
/// Constructed fresh for each message and threaded explicitly through
/// handlers so that a responder always knows which request id it is
/// answering, without any shared mutable state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchContext {
    /// Id of the request being dispatched, when the inbound message
    /// carries one.
    pub request_id: Option<u64>,
}

impl DispatchContext {
    /// Context for dispatching the given inbound message.
    pub fn for_message(message: &RpcMessage) -> Self {
        Self {
            request_id: message.id,
        }
    }
}

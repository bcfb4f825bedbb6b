//! Pending-call correlation table.
//!
//! Outbound requests get a monotonically increasing id and a one-shot
//! receiver for the eventual response. Inbound responses settle the
//! matching entry by id. Closing the table rejects every outstanding
//! call and makes further calls fail.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::errors::RpcError;
use crate::types::{RpcErrorBody, RpcMessage};

/// Correlates outbound requests with inbound responses by id.
#[derive(Debug, Default)]
pub struct CallTable {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>,
    closed: Option<RpcError>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
            closed: None,
        }
    }
}

/// Handle for awaiting the response to one outbound request.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<Result<Value, RpcError>>,
}

impl PendingCall {
    /// The id assigned to this call.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the peer's response.
    pub async fn wait(self) -> Result<Value, RpcError> {
        self.rx.await.unwrap_or_else(|_| {
            Err(RpcError::Closed {
                message: "call abandoned".into(),
            })
        })
    }
}

impl CallTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table that assigns ids starting at `next_id`.
    /// Used when resuming with previously persisted call ids.
    pub fn starting_at(next_id: u64) -> Self {
        let table = Self::default();
        table.inner.lock().next_id = next_id.max(1);
        table
    }

    /// Build a request message with the next id and register a pending
    /// entry for its response.
    pub fn call(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(RpcMessage, PendingCall), RpcError> {
        let mut inner = self.inner.lock();
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let (tx, rx) = oneshot::channel();
        let _ = inner.pending.insert(id, tx);
        let message = RpcMessage::request(id, method, params);
        Ok((message, PendingCall { id, rx }))
    }

    /// Settle the pending call with the given id. Returns `false` when
    /// no call with that id is outstanding.
    pub fn settle(&self, id: u64, result: Result<Value, RpcErrorBody>) -> bool {
        let entry = self.inner.lock().pending.remove(&id);
        match entry {
            Some(tx) => {
                // The caller may have dropped its PendingCall already.
                let _ = tx.send(result.map_err(RpcError::Peer));
                true
            }
            None => {
                debug!(id, "dropping response with no pending call");
                false
            }
        }
    }

    /// Number of calls still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Reject every outstanding call and refuse future ones. Idempotent;
    /// the first close's error sticks.
    pub fn close(&self, err: RpcError) {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock();
            if inner.closed.is_some() {
                return;
            }
            inner.closed = Some(err.clone());
            inner.pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }
}

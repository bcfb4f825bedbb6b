//! Session lifecycle events.

use tokio::sync::broadcast;

/// Capacity of the event channel; slow subscribers lag rather than block.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted as the session moves through its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Session parameters changed: pairing progressed, peer fields
    /// adopted, or accounts/chain updated.
    Updated,
    /// The session ended. `error` is `None` for an orderly teardown.
    Destroyed {
        /// Failure description, when the teardown was not requested.
        error: Option<String>,
    },
}

/// Broadcast fan-out for [`SessionEvent`]s.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a bus with no subscribers yet.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. A send with no subscribers is not an error.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

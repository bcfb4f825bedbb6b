//! Topic table: subscriber sets, single-slot caches, idle eviction.
//!
//! Subscribe, publish, and the eviction sweep all mutate the table from
//! different tasks, so every operation runs under one mutex. Senders
//! are cloned out under the lock; actual channel sends happen outside.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Sender feeding one connection's write task.
pub type Subscriber = mpsc::Sender<Arc<String>>;

struct Topic {
    subscribers: HashMap<u64, Subscriber>,
    /// Most recent publish with no subscriber to receive it. Never more
    /// than one; repeated publishes overwrite.
    cached: Option<Arc<String>>,
    last_touch: Instant,
}

impl Topic {
    fn new(now: Instant) -> Self {
        Self {
            subscribers: HashMap::new(),
            cached: None,
            last_touch: now,
        }
    }
}

/// All live topics, keyed by opaque topic string.
pub struct TopicTable {
    inner: Mutex<HashMap<String, Topic>>,
    idle_window: Duration,
}

impl TopicTable {
    /// Create an empty table with the given idle eviction window.
    pub fn new(idle_window: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            idle_window,
        }
    }

    /// Touch a topic, creating it if needed. Every well-formed frame
    /// naming a topic keeps it alive this way.
    pub fn touch(&self, topic: &str) {
        let now = Instant::now();
        self.inner
            .lock()
            .entry(topic.to_owned())
            .or_insert_with(|| Topic::new(now))
            .last_touch = now;
    }

    /// Add a subscriber (idempotent per connection id). Returns the
    /// cached message, if any, which is delivered to this subscriber
    /// only and cleared.
    pub fn subscribe(&self, topic: &str, conn_id: u64, tx: Subscriber) -> Option<Arc<String>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let entry = inner
            .entry(topic.to_owned())
            .or_insert_with(|| Topic::new(now));
        entry.last_touch = now;
        let _ = entry.subscribers.insert(conn_id, tx);
        entry.cached.take()
    }

    /// Record a publish. With no subscribers the raw frame overwrites
    /// the cache and an empty list is returned; otherwise the current
    /// subscribers are returned for fan-out.
    pub fn publish(&self, topic: &str, raw: Arc<String>) -> Vec<Subscriber> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let entry = inner
            .entry(topic.to_owned())
            .or_insert_with(|| Topic::new(now));
        entry.last_touch = now;
        if entry.subscribers.is_empty() {
            entry.cached = Some(raw);
            return Vec::new();
        }
        entry.subscribers.values().cloned().collect()
    }

    /// Remove a connection from every topic it subscribed to.
    pub fn disconnect(&self, conn_id: u64) {
        let mut inner = self.inner.lock();
        for topic in inner.values_mut() {
            let _ = topic.subscribers.remove(&conn_id);
        }
    }

    /// Remove subscriber-less topics untouched for longer than the idle
    /// window, cached messages included. Returns how many were removed.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|_, topic| {
            !topic.subscribers.is_empty() || now.duration_since(topic.last_touch) < self.idle_window
        });
        before - inner.len()
    }

    /// Number of live topics.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether no topics are live.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    #[cfg(test)]
    fn backdate(&self, topic: &str, by: Duration) {
        if let Some(entry) = self.inner.lock().get_mut(topic) {
            entry.last_touch -= by;
        }
    }
}

//! `RelayServer` — Axum WebSocket pub/sub endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::response::{Json, Response};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::shutdown::ShutdownCoordinator;
use crate::topics::{Subscriber, TopicTable};

/// Per-connection outbound buffer. A subscriber falling this far behind
/// starts losing frames.
const OUTBOUND_BUFFER: usize = 64;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The topic table.
    pub topics: Arc<TopicTable>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    next_conn_id: Arc<AtomicU64>,
    max_message_size: usize,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    topics: Arc<TopicTable>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl RelayServer {
    /// Create a new server.
    pub fn new(config: RelayConfig) -> Self {
        let topics = Arc::new(TopicTable::new(config.idle_window()));
        Self {
            config,
            topics,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            topics: self.topics.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            next_conn_id: Arc::new(AtomicU64::new(1)),
            max_message_size: self.config.max_message_size,
        };
        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .with_state(state)
    }

    /// Bind and serve. Returns the bound address (port 0 is resolved)
    /// and the join handle of the serve task. Also starts the eviction
    /// sweep; both stop when the shutdown coordinator fires.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "relay listening");

        self.spawn_sweeper();

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(err) = served {
                warn!(error = %err, "relay serve loop ended with error");
            }
        });
        Ok((addr, handle))
    }

    fn spawn_sweeper(&self) {
        let topics = self.topics.clone();
        let interval = self.config.sweep_interval();
        let token = self.shutdown.token();
        let _ = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = topics.sweep_idle();
                        if removed > 0 {
                            debug!(removed, "evicted idle topics");
                            counter!("tether_relay_topics_evicted_total").increment(removed as u64);
                        }
                        gauge!("tether_relay_topics").set(topics.len() as f64);
                    }
                }
            }
        });
    }

    /// Get the topic table.
    pub fn topics(&self) -> &Arc<TopicTable> {
        &self.topics
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        topics: state.topics.len(),
    })
}

/// Health check payload.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Number of live topics.
    pub topics: usize,
}

/// GET /ws — WebSocket upgrade.
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let max = state.max_message_size;
    ws.max_message_size(max)
        .on_upgrade(move |socket| handle_socket(state, socket))
}

/// Serve one connection: a write task drains the outbound channel while
/// the read loop handles frames to completion, one at a time.
async fn handle_socket(state: AppState, socket: WebSocket) {
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
    gauge!("tether_relay_connections").increment(1.0);
    debug!(conn_id, "connection open");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(OUTBOUND_BUFFER);
    let write_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let frame = Message::Text(Utf8Bytes::from(message.as_str()));
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let token = state.shutdown.token();
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if handle_frame(&state, conn_id, &tx, text.as_str()).is_err() {
                        warn!(conn_id, "dropping connection after malformed frame");
                        counter!("tether_relay_malformed_frames_total").increment(1);
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(conn_id, error = %err, "read error");
                    break;
                }
            }
        }
    }

    state.topics.disconnect(conn_id);
    write_task.abort();
    gauge!("tether_relay_connections").decrement(1.0);
    debug!(conn_id, "connection closed");
}

/// Frame was not JSON; the connection must go.
#[derive(Debug)]
struct MalformedFrame;

/// Handle one text frame. Malformed JSON is an error that drops the
/// connection; a well-formed frame missing `type` or `topic` is merely
/// ignored.
fn handle_frame(
    state: &AppState,
    conn_id: u64,
    tx: &Subscriber,
    text: &str,
) -> Result<(), MalformedFrame> {
    let value: Value = serde_json::from_str(text).map_err(|_| MalformedFrame)?;
    let frame_type = value.get("type").and_then(Value::as_str);
    let topic = value.get("topic").and_then(Value::as_str);
    let (Some(frame_type), Some(topic)) = (frame_type, topic) else {
        debug!(conn_id, "ignoring frame without type or topic");
        return Ok(());
    };

    match frame_type {
        "sub" => {
            if let Some(cached) = state.topics.subscribe(topic, conn_id, tx.clone()) {
                debug!(conn_id, topic, "delivering cached message");
                if tx.try_send(cached).is_err() {
                    counter!("tether_relay_dropped_frames_total").increment(1);
                }
            }
        }
        "pub" => {
            let raw = Arc::new(text.to_owned());
            let silent = value.get("silent").and_then(Value::as_bool).unwrap_or(false);
            if !silent {
                debug!(conn_id, topic, "publish");
            }
            for subscriber in state.topics.publish(topic, Arc::clone(&raw)) {
                if subscriber.try_send(Arc::clone(&raw)).is_err() {
                    counter!("tether_relay_dropped_frames_total").increment(1);
                }
            }
        }
        "ack" => state.topics.touch(topic),
        other => {
            debug!(conn_id, frame_type = other, "ignoring unknown frame type");
            state.topics.touch(topic);
        }
    }
    Ok(())
}

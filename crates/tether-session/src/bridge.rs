//! Resilient relay connection.
//!
//! One `Bridge` per session. A background task owns the socket: it
//! connects with a timeout, resubscribes the session's topics, pumps
//! outbound control frames from a channel, decrypts inbound payloads,
//! and reconnects with a fixed delay after any failure until the
//! bridge is closed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::{ControlMessage, ControlType, Envelope, PairingKey, envelope};
use tether_rpc::RpcMessage;

use crate::error::SessionError;
use crate::launcher::AppLauncher;
use crate::routing::METHOD_SESSION_UPDATE;

/// How long one connect attempt may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Fixed delay between reconnect attempts. No growth, no jitter.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state, published through a `watch` channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeState {
    /// No socket; a reconnect may be scheduled.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Connected and subscribed.
    Open,
    /// Closed for good; no further reconnects.
    Closed,
}

/// Everything the bridge needs to run.
pub struct BridgeConfig {
    /// Relay root URL, e.g. `ws://127.0.0.1:3000`.
    pub url: String,
    /// Shared pairing secret for the envelope codec.
    pub key: PairingKey,
    /// Topic the session listens on (its own id).
    pub own_topic: String,
    /// Topic used before a peer id is known.
    pub handshake_topic: String,
    /// Whether this side initiated the pairing.
    pub initiator: bool,
    /// Pairing string handed to the launcher on first data send.
    pub pairing_uri: String,
    /// Optional deep-link launcher for the peer application.
    pub launcher: Option<Arc<dyn AppLauncher>>,
}

/// State shared between the `Bridge` handle and its background task.
struct Shared {
    url: String,
    key: PairingKey,
    handshake_topic: String,
    /// Topics resubscribed after every (re)connect.
    topics: Mutex<Vec<String>>,
    peer_topic: Mutex<Option<String>>,
    state: watch::Sender<BridgeState>,
    outbound_tx: mpsc::UnboundedSender<ControlMessage>,
    inbound_tx: mpsc::UnboundedSender<RpcMessage>,
    cancel: CancellationToken,
}

/// Handle to a session's relay connection.
pub struct Bridge {
    shared: Arc<Shared>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlMessage>>>,
    first_open: Mutex<Option<oneshot::Receiver<Result<(), SessionError>>>>,
    initiator: bool,
    pairing_uri: String,
    launcher: Option<Arc<dyn AppLauncher>>,
    launched: AtomicBool,
}

impl Bridge {
    /// Build a bridge and the channel its session drains decrypted
    /// inbound messages from. Nothing connects until [`open`](Self::open).
    pub fn new(config: BridgeConfig) -> (Self, mpsc::UnboundedReceiver<RpcMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(BridgeState::Disconnected);
        let shared = Arc::new(Shared {
            url: config.url,
            key: config.key,
            handshake_topic: config.handshake_topic,
            topics: Mutex::new(vec![config.own_topic]),
            peer_topic: Mutex::new(None),
            state,
            outbound_tx,
            inbound_tx,
            cancel: CancellationToken::new(),
        });
        let bridge = Self {
            shared,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            first_open: Mutex::new(None),
            initiator: config.initiator,
            pairing_uri: config.pairing_uri,
            launcher: config.launcher,
            launched: AtomicBool::new(false),
        };
        (bridge, inbound_rx)
    }

    /// Current connection state.
    pub fn state(&self) -> BridgeState {
        *self.shared.state.borrow()
    }

    /// Connect and wait until the bridge is open.
    ///
    /// Idempotent; the background task is spawned on first call. A
    /// connect failure is returned only when it happens before the
    /// first successful open; after that, reconnects are silent.
    pub async fn open(&self) -> Result<(), SessionError> {
        if self.shared.cancel.is_cancelled() {
            return Err(SessionError::Destroyed);
        }
        if self.state() == BridgeState::Open {
            return Ok(());
        }
        if let Some(outbound_rx) = self.outbound_rx.lock().take() {
            let (result_tx, result_rx) = oneshot::channel();
            *self.first_open.lock() = Some(result_rx);
            let _ = tokio::spawn(run(Arc::clone(&self.shared), outbound_rx, result_tx));
        }
        let first = self.first_open.lock().take();
        if let Some(result_rx) = first {
            result_rx.await.map_err(|_| SessionError::Destroyed)?
        } else {
            let mut state_rx = self.shared.state.subscribe();
            let state = state_rx
                .wait_for(|s| matches!(s, BridgeState::Open | BridgeState::Closed))
                .await
                .map_err(|_| SessionError::Destroyed)?;
            match *state {
                BridgeState::Closed => Err(SessionError::Destroyed),
                _ => Ok(()),
            }
        }
    }

    /// Close permanently. Cancels any scheduled reconnect. Idempotent.
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    /// Record the peer's topic once the handshake reveals it.
    pub fn set_peer_topic(&self, peer_id: impl Into<String>) {
        *self.shared.peer_topic.lock() = Some(peer_id.into());
    }

    /// Subscribe to an additional topic, now and after every reconnect.
    pub fn subscribe_topic(&self, topic: impl Into<String>) -> Result<(), SessionError> {
        let topic = topic.into();
        self.shared.topics.lock().push(topic.clone());
        self.send_control(ControlMessage::subscribe(topic))
    }

    /// Send a raw control frame.
    pub fn send_control(&self, message: ControlMessage) -> Result<(), SessionError> {
        self.shared
            .outbound_tx
            .send(message)
            .map_err(|_| SessionError::Transport {
                reason: "bridge task gone".into(),
            })
    }

    /// Seal a data-plane message and publish it to the peer's topic
    /// (peer id once known, else the handshake topic).
    pub fn send_data(&self, message: &RpcMessage) -> Result<(), SessionError> {
        let plaintext = serde_json::to_vec(message).map_err(|err| SessionError::Transport {
            reason: err.to_string(),
        })?;
        let sealed = envelope::seal(&plaintext, &self.shared.key);
        let payload = serde_json::to_string(&sealed).map_err(|err| SessionError::Transport {
            reason: err.to_string(),
        })?;
        let topic = self
            .shared
            .peer_topic
            .lock()
            .clone()
            .unwrap_or_else(|| self.shared.handshake_topic.clone());
        self.send_control(ControlMessage::publish(topic, payload))?;
        self.maybe_launch_peer(message);
        Ok(())
    }

    /// Fire the one-time deep-link launch on the first data message
    /// that is not a session update.
    fn maybe_launch_peer(&self, message: &RpcMessage) {
        if !self.initiator || message.method.as_deref() == Some(METHOD_SESSION_UPDATE) {
            return;
        }
        if let Some(launcher) = &self.launcher {
            if !self.launched.swap(true, Ordering::Relaxed) {
                launcher.launch(&self.pairing_uri);
            }
        }
    }
}

/// WebSocket endpoint for a relay root URL.
fn endpoint_url(url: &str) -> String {
    format!("{}/ws", url.trim_end_matches('/'))
}

/// Connect/pump loop. Lives until the cancellation token fires.
async fn run(
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<ControlMessage>,
    first: oneshot::Sender<Result<(), SessionError>>,
) {
    let mut first = Some(first);
    let endpoint = endpoint_url(&shared.url);
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        let _ = shared.state.send_replace(BridgeState::Connecting);
        let attempt = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(endpoint.as_str()));
        let outcome = tokio::select! {
            () = shared.cancel.cancelled() => break,
            outcome = attempt => outcome,
        };
        match outcome {
            Ok(Ok((socket, _response))) => {
                if let Some(tx) = first.take() {
                    let _ = tx.send(Ok(()));
                }
                pump(&shared, socket, &mut outbound).await;
                if shared.cancel.is_cancelled() {
                    break;
                }
                counter!("tether_bridge_disconnects_total").increment(1);
                let _ = shared.state.send_replace(BridgeState::Disconnected);
            }
            Ok(Err(err)) => {
                warn!(error = %err, url = %endpoint, "bridge connect failed");
                counter!("tether_bridge_connect_failures_total").increment(1);
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(SessionError::Transport {
                        reason: err.to_string(),
                    }));
                }
                let _ = shared.state.send_replace(BridgeState::Disconnected);
            }
            Err(_) => {
                warn!(url = %endpoint, "bridge connect timed out");
                counter!("tether_bridge_connect_failures_total").increment(1);
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(SessionError::ConnectTimeout));
                }
                let _ = shared.state.send_replace(BridgeState::Disconnected);
            }
        }
        tokio::select! {
            () = shared.cancel.cancelled() => break,
            () = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
    let _ = shared.state.send_replace(BridgeState::Closed);
}

/// Drive one live socket: resubscribe, then interleave outbound frames
/// and inbound handling until the socket drops or the bridge closes.
async fn pump(
    shared: &Shared,
    socket: Socket,
    outbound: &mut mpsc::UnboundedReceiver<ControlMessage>,
) {
    let (mut sink, mut stream) = socket.split();

    let topics = shared.topics.lock().clone();
    for topic in topics {
        if send_frame(&mut sink, &ControlMessage::subscribe(topic))
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = shared.state.send_replace(BridgeState::Open);
    info!(url = %shared.url, "bridge open");

    loop {
        tokio::select! {
            () = shared.cancel.cancelled() => {
                // Flush already-queued frames so a termination notice
                // enqueued just before close still goes out.
                while let Ok(message) = outbound.try_recv() {
                    if send_frame(&mut sink, &message).await.is_err() {
                        return;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            message = outbound.recv() => {
                let Some(message) = message else { return };
                if send_frame(&mut sink, &message).await.is_err() {
                    return;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => handle_frame(shared, text.as_str()),
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "bridge read error");
                        return;
                    }
                }
            }
        }
    }
}

async fn send_frame(
    sink: &mut (impl futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    message: &ControlMessage,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let json = serde_json::to_string(message).map_err(|err| {
        tokio_tungstenite::tungstenite::Error::Io(std::io::Error::other(err.to_string()))
    })?;
    sink.send(Message::Text(json.into())).await
}

/// Process one raw relay frame: ack it, open the envelope, forward the
/// decrypted message. A failure at any stage discards only this frame.
fn handle_frame(shared: &Shared, text: &str) {
    let control: ControlMessage = match serde_json::from_str(text) {
        Ok(control) => control,
        Err(err) => {
            warn!(error = %err, "discarding unparseable relay frame");
            return;
        }
    };

    if !control.topic.is_empty() {
        let _ = shared
            .outbound_tx
            .send(ControlMessage::ack(control.topic.clone()));
    }

    if control.control_type != ControlType::Pub {
        return;
    }

    let sealed: Envelope = match serde_json::from_str(&control.payload) {
        Ok(sealed) => sealed,
        Err(err) => {
            warn!(error = %err, "discarding frame with malformed envelope");
            return;
        }
    };
    let plaintext = match envelope::open(&sealed, &shared.key) {
        Ok(plaintext) => plaintext,
        Err(err) => {
            warn!(error = %err, "discarding unauthenticated frame");
            counter!("tether_bridge_auth_failures_total").increment(1);
            return;
        }
    };
    let mut message: RpcMessage = match serde_json::from_slice(&plaintext) {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, "discarding undecodable payload");
            return;
        }
    };

    // Some peers tag the update notification with a call id.
    if message.method.as_deref() == Some(METHOD_SESSION_UPDATE) && message.id.is_some() {
        debug!("stripping call id from session update notification");
        message.id = None;
    }

    let _ = shared.inbound_tx.send(message);
}

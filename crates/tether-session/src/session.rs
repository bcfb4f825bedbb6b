//! Pairing session state machine.
//!
//! A `Session` owns one bridge connection, a call table for outbound
//! requests, and the ordered queues of outgoing requests and incoming
//! peer requests. One dispatch task drains the bridge's decrypted
//! inbound channel and routes each message by the current phase, so
//! session state never sees concurrent handlers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tether_core::{PairingKey, PairingUri, PeerMeta};
use tether_rpc::errors::{DUPLICATE_REQUEST, METHOD_NOT_FOUND};
use tether_rpc::{CallTable, DispatchContext, MessageKind, RpcError, RpcErrorBody, RpcMessage};

use crate::bridge::{Bridge, BridgeConfig};
use crate::error::SessionError;
use crate::events::{EventBus, SessionEvent};
use crate::launcher::AppLauncher;
use crate::routing::{
    METHOD_SESSION_REQUEST, METHOD_SESSION_UPDATE, MethodRoute, SessionPhase, route,
};

/// Protocol version carried in the pairing string.
const PROTOCOL_VERSION: &str = "1";

/// Local identity and bridge location for a new session.
pub struct SessionConfig {
    /// Metadata shown to the peer during the handshake.
    pub meta: PeerMeta,
    /// Chain the session starts on.
    pub chain_id: Option<u64>,
    /// RPC endpoint offered to the peer.
    pub rpc_url: Option<String>,
    /// Accounts exposed to the peer.
    pub accounts: Vec<String>,
    /// Optional deep-link launcher for the peer application.
    pub launcher: Option<Arc<dyn AppLauncher>>,
}

/// Terminal or pending outcome of an outgoing request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RequestStatus {
    /// The peer answered with an error.
    Failed {
        /// The peer's error body.
        error: RpcErrorBody,
    },
    /// The peer answered with a result.
    Completed {
        /// The peer's result value.
        result: Value,
    },
    /// Still awaiting the peer's answer.
    Pending {},
}

/// An outgoing request, kept in order of issue.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Assigned call id.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Parameters as sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Pending or terminal outcome.
    #[serde(flatten)]
    pub status: RequestStatus,
}

/// An inbound request awaiting an application decision.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerRequest {
    /// The peer's call id.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Parameters as received.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Everything needed to persist and later resume a session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    /// Own topic id.
    pub id: String,
    /// Peer topic id, once paired.
    pub peer_id: Option<String>,
    /// Peer metadata, once paired.
    pub peer_meta: Option<PeerMeta>,
    /// Current chain.
    pub chain_id: Option<u64>,
    /// Own accounts.
    pub accounts: Vec<String>,
    /// Outgoing request queue.
    pub requests: Vec<Request>,
    /// Peer accounts.
    pub peer_accounts: Vec<String>,
    /// Incoming request queue.
    pub peer_requests: Vec<PeerRequest>,
    /// Handshake topic.
    pub handshake_id: String,
    /// Whether this side initiated the pairing.
    pub initiator: bool,
    /// Protocol version.
    pub version: String,
    /// Relay root URL.
    pub bridge: String,
    /// Hex-encoded pairing secret.
    pub key: String,
}

/// Handle for awaiting the peer's reply to an outgoing request.
#[derive(Debug)]
pub struct OutgoingCall {
    id: u64,
    rx: oneshot::Receiver<Result<Value, RpcError>>,
}

impl OutgoingCall {
    /// The call id this handle settles.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the peer's reply.
    pub async fn wait(self) -> Result<Value, RpcError> {
        self.rx.await.unwrap_or_else(|_| {
            Err(RpcError::Closed {
                message: "session destroyed".into(),
            })
        })
    }
}

type Responder = oneshot::Sender<Result<Value, RpcErrorBody>>;

struct State {
    phase: SessionPhase,
    peer_id: Option<String>,
    peer_meta: Option<PeerMeta>,
    chain_id: Option<u64>,
    rpc_url: Option<String>,
    accounts: Vec<String>,
    peer_accounts: Vec<String>,
    requests: Vec<Request>,
    peer_requests: Vec<PeerRequest>,
    responders: HashMap<u64, Responder>,
    /// Every peer request id ever accepted; ids stay burned after the
    /// request resolves.
    seen_peer_ids: HashSet<u64>,
}

struct Inner {
    id: String,
    version: String,
    handshake_id: String,
    bridge_url: String,
    key: PairingKey,
    initiator: bool,
    meta: PeerMeta,
    state: Mutex<State>,
    calls: CallTable,
    bridge: Bridge,
    events: EventBus,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<RpcMessage>>>,
    approval: Mutex<Option<oneshot::Sender<Result<(), SessionError>>>>,
}

/// One end of a pairing. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Create the requesting side of a new pairing. The pairing string
    /// from [`pairing_uri`](Self::pairing_uri) must reach the peer out
    /// of band.
    pub fn initiator(bridge_url: impl Into<String>, config: SessionConfig) -> Self {
        let key = PairingKey::generate();
        let handshake_id = Uuid::new_v4().to_string();
        Self::build(
            Uuid::new_v4().to_string(),
            handshake_id,
            bridge_url.into(),
            key,
            true,
            config,
            CallTable::new(),
        )
    }

    /// Create the approving side from a received pairing string.
    pub fn responder(uri: &PairingUri, config: SessionConfig) -> Self {
        Self::build(
            Uuid::new_v4().to_string(),
            uri.handshake_id.clone(),
            uri.bridge.clone(),
            uri.key.clone(),
            false,
            config,
            CallTable::new(),
        )
    }

    /// Rebuild a session from a persisted descriptor.
    pub fn restore(
        descriptor: SessionDescriptor,
        launcher: Option<Arc<dyn AppLauncher>>,
    ) -> Result<Self, SessionError> {
        let key = PairingKey::from_hex(&descriptor.key)?;
        let next_id = descriptor
            .requests
            .iter()
            .map(|r| r.id + 1)
            .max()
            .unwrap_or(1);
        let config = SessionConfig {
            meta: PeerMeta {
                name: String::new(),
                description: String::new(),
                url: String::new(),
                icons: Vec::new(),
            },
            chain_id: descriptor.chain_id,
            rpc_url: None,
            accounts: descriptor.accounts.clone(),
            launcher,
        };
        let session = Self::build(
            descriptor.id,
            descriptor.handshake_id,
            descriptor.bridge,
            key,
            descriptor.initiator,
            config,
            CallTable::starting_at(next_id),
        );
        {
            let mut state = session.inner.state.lock();
            state.peer_id = descriptor.peer_id.clone();
            state.peer_meta = descriptor.peer_meta;
            state.peer_accounts = descriptor.peer_accounts;
            state.requests = descriptor.requests;
            state.peer_requests = descriptor.peer_requests;
            state.seen_peer_ids = state.peer_requests.iter().map(|r| r.id).collect();
        }
        if let Some(peer_id) = descriptor.peer_id {
            session.inner.bridge.set_peer_topic(peer_id);
        }
        Ok(session)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        id: String,
        handshake_id: String,
        bridge_url: String,
        key: PairingKey,
        initiator: bool,
        config: SessionConfig,
        calls: CallTable,
    ) -> Self {
        let pairing_uri = PairingUri {
            handshake_id: handshake_id.clone(),
            version: PROTOCOL_VERSION.to_owned(),
            bridge: bridge_url.clone(),
            key: key.clone(),
        };
        let (bridge, inbound_rx) = Bridge::new(BridgeConfig {
            url: bridge_url.clone(),
            key: key.clone(),
            own_topic: id.clone(),
            handshake_topic: handshake_id.clone(),
            initiator,
            pairing_uri: pairing_uri.to_string(),
            launcher: config.launcher,
        });
        let state = State {
            phase: SessionPhase::Idle,
            peer_id: None,
            peer_meta: None,
            chain_id: config.chain_id,
            rpc_url: config.rpc_url,
            accounts: config.accounts,
            peer_accounts: Vec::new(),
            requests: Vec::new(),
            peer_requests: Vec::new(),
            responders: HashMap::new(),
            seen_peer_ids: HashSet::new(),
        };
        Self {
            inner: Arc::new(Inner {
                id,
                version: PROTOCOL_VERSION.to_owned(),
                handshake_id,
                bridge_url,
                key,
                initiator,
                meta: config.meta,
                state: Mutex::new(state),
                calls,
                bridge,
                events: EventBus::new(),
                inbound_rx: Mutex::new(None),
                approval: Mutex::new(None),
            }),
        }
        .with_inbound(inbound_rx)
    }

    fn with_inbound(self, inbound_rx: mpsc::UnboundedReceiver<RpcMessage>) -> Self {
        *self.inner.inbound_rx.lock() = Some(inbound_rx);
        self
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Open the bridge and run the pairing handshake.
    ///
    /// Initiator: sends `wc_sessionRequest` and blocks until the peer
    /// approves or rejects. Responder: subscribes the handshake topic
    /// and blocks until a local [`approve_session`](Self::approve_session)
    /// (or destruction) settles the pairing.
    pub async fn create_session(&self) -> Result<(), SessionError> {
        self.inner.bridge.open().await?;
        self.spawn_dispatch();
        if self.inner.initiator {
            self.run_handshake().await
        } else {
            self.inner.bridge.subscribe_topic(&self.inner.handshake_id)?;
            self.inner.state.lock().phase = SessionPhase::Subscribed;
            self.inner.events.emit(SessionEvent::Updated);
            let (tx, rx) = oneshot::channel();
            *self.inner.approval.lock() = Some(tx);
            rx.await.map_err(|_| SessionError::Destroyed)?
        }
    }

    async fn run_handshake(&self) -> Result<(), SessionError> {
        let params = {
            let state = self.inner.state.lock();
            json!({
                "peerId": self.inner.id,
                "peerMeta": self.inner.meta,
                "chainId": state.chain_id,
                "rpcUrl": state.rpc_url,
            })
        };
        self.inner.state.lock().phase = SessionPhase::AwaitingPeerReply;
        let call = self.make_request(METHOD_SESSION_REQUEST, Some(params))?;
        let reply = match call.wait().await {
            Ok(reply) => reply,
            Err(err) => {
                self.destroy_session(Some(SessionError::Rpc(err.clone())));
                return Err(SessionError::Rpc(err));
            }
        };
        let peer_id = reply
            .get("peerId")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let peer_meta: Option<PeerMeta> = reply
            .get("peerMeta")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let (Some(peer_id), Some(peer_meta)) = (peer_id, peer_meta) else {
            let field = if reply.get("peerId").and_then(Value::as_str).is_none() {
                "peerId"
            } else {
                "peerMeta"
            };
            self.destroy_session(Some(SessionError::Validation { field }));
            return Err(SessionError::Validation { field });
        };
        {
            let mut state = self.inner.state.lock();
            state.peer_id = Some(peer_id.clone());
            state.peer_meta = Some(peer_meta);
            if let Some(chain) = reply.get("chainId").and_then(Value::as_u64) {
                state.chain_id = Some(chain);
            }
            state.rpc_url = reply
                .get("rpcUrl")
                .and_then(Value::as_str)
                .map(str::to_owned);
            state.peer_accounts = string_array(reply.get("accounts")).unwrap_or_default();
            state.phase = SessionPhase::Active;
        }
        self.inner.bridge.set_peer_topic(peer_id);
        info!(session = %self.inner.id, "session active");
        self.inner.events.emit(SessionEvent::Updated);
        Ok(())
    }

    /// Reopen the bridge for a restored session without repeating the
    /// handshake.
    pub async fn resume_session(&self) -> Result<(), SessionError> {
        self.inner.bridge.open().await?;
        self.spawn_dispatch();
        // Re-wire responders for peer requests persisted while pending.
        let waiting: Vec<u64> = {
            let state = self.inner.state.lock();
            state
                .peer_requests
                .iter()
                .map(|r| r.id)
                .filter(|id| !state.responders.contains_key(id))
                .collect()
        };
        for id in waiting {
            let (tx, rx) = oneshot::channel();
            let _ = self.inner.state.lock().responders.insert(id, tx);
            self.spawn_forwarder(id, rx);
        }
        self.inner.state.lock().phase = SessionPhase::Active;
        self.inner.events.emit(SessionEvent::Updated);
        Ok(())
    }

    /// Approve a queued `wc_sessionRequest`, activating the session and
    /// answering the peer with our identity and accounts.
    pub fn approve_session(&self, request_id: u64) -> Result<(), SessionError> {
        let (responder, response) = {
            let mut state = self.inner.state.lock();
            let position = state
                .peer_requests
                .iter()
                .position(|r| r.id == request_id && r.method == METHOD_SESSION_REQUEST)
                .ok_or(SessionError::Validation { field: "requestId" })?;
            let request = state.peer_requests.remove(position);
            let responder = state
                .responders
                .remove(&request_id)
                .ok_or(SessionError::Validation { field: "requestId" })?;
            if let Some(chain) = request
                .params
                .as_ref()
                .and_then(|p| p.get("chainId"))
                .and_then(Value::as_u64)
            {
                state.chain_id = Some(chain);
            }
            state.phase = SessionPhase::Active;
            let mut response = json!({
                "approved": true,
                "peerId": self.inner.id,
                "peerMeta": self.inner.meta,
                "chainId": state.chain_id,
                "accounts": state.accounts,
            });
            if let Some(url) = &state.rpc_url {
                response["rpcUrl"] = json!(url);
            }
            (responder, response)
        };
        let _ = responder.send(Ok(response));
        if let Some(tx) = self.inner.approval.lock().take() {
            let _ = tx.send(Ok(()));
        }
        info!(session = %self.inner.id, "session approved");
        self.inner.events.emit(SessionEvent::Updated);
        Ok(())
    }

    /// Tear the session down. Idempotent; a second call is a no-op.
    ///
    /// Sends a best-effort termination notice to the peer, closes the
    /// bridge, rejects every outstanding future, and emits a single
    /// terminal event.
    pub fn destroy_session(&self, error: Option<SessionError>) {
        let reason = error.as_ref().map(ToString::to_string);
        {
            let mut state = self.inner.state.lock();
            if state.phase == SessionPhase::Destroyed {
                return;
            }
            state.phase = SessionPhase::Destroyed;
            state.responders.clear();
        }
        let notice = RpcMessage::notification(
            METHOD_SESSION_UPDATE,
            Some(json!({"approved": false, "accounts": []})),
        );
        if let Err(err) = self.inner.bridge.send_data(&notice) {
            debug!(error = %err, "termination notice not sent");
        }
        self.inner.bridge.close();
        self.inner.calls.close(RpcError::Closed {
            message: reason
                .clone()
                .unwrap_or_else(|| "session destroyed".into()),
        });
        if let Some(tx) = self.inner.approval.lock().take() {
            let _ = tx.send(Err(error.unwrap_or(SessionError::Destroyed)));
        }
        info!(session = %self.inner.id, error = ?reason, "session destroyed");
        self.inner.events.emit(SessionEvent::Destroyed { error: reason });
    }

    // ── Requests ────────────────────────────────────────────────────

    /// Issue a request to the peer. Records it in the outgoing queue
    /// and returns a handle for the reply; the queue entry settles when
    /// the reply arrives regardless of whether the handle is awaited.
    pub fn make_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<OutgoingCall, SessionError> {
        let (message, pending) = self.inner.calls.call(method, params)?;
        let id = pending.id();
        {
            let mut state = self.inner.state.lock();
            state.requests.push(Request {
                id,
                method: method.to_owned(),
                params: message.params.clone(),
                status: RequestStatus::Pending {},
            });
        }
        self.inner.bridge.send_data(&message)?;
        self.inner.events.emit(SessionEvent::Updated);

        let (tx, rx) = oneshot::channel();
        let session = self.clone();
        let _ = tokio::spawn(async move {
            let outcome = pending.wait().await;
            session.settle_request_record(
                id,
                outcome
                    .as_ref()
                    .map(Clone::clone)
                    .map_err(RpcError::to_error_body),
            );
            let _ = tx.send(outcome);
        });
        Ok(OutgoingCall { id, rx })
    }

    /// Send a notification to the peer.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), SessionError> {
        self.inner
            .bridge
            .send_data(&RpcMessage::notification(method, params))
    }

    /// Answer a queued peer request with a result.
    pub fn resolve_peer_request(&self, request_id: u64, result: Value) -> Result<(), SessionError> {
        let responder = self.take_peer_request(request_id)?;
        let _ = responder.send(Ok(result));
        self.inner.events.emit(SessionEvent::Updated);
        Ok(())
    }

    /// Answer a queued peer request with an error.
    pub fn reject_peer_request(
        &self,
        request_id: u64,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), SessionError> {
        let responder = self.take_peer_request(request_id)?;
        let _ = responder.send(Err(RpcErrorBody {
            code: code.into(),
            message: message.into(),
        }));
        self.inner.events.emit(SessionEvent::Updated);
        Ok(())
    }

    fn take_peer_request(&self, request_id: u64) -> Result<Responder, SessionError> {
        let mut state = self.inner.state.lock();
        let position = state
            .peer_requests
            .iter()
            .position(|r| r.id == request_id)
            .ok_or(SessionError::Validation { field: "requestId" })?;
        let _ = state.peer_requests.remove(position);
        state
            .responders
            .remove(&request_id)
            .ok_or(SessionError::Validation { field: "requestId" })
    }

    fn settle_request_record(&self, id: u64, outcome: Result<Value, RpcErrorBody>) {
        let mut state = self.inner.state.lock();
        let Some(request) = state.requests.iter_mut().find(|r| r.id == id) else {
            return;
        };
        request.status = match outcome {
            Ok(result) => RequestStatus::Completed { result },
            Err(error) => RequestStatus::Failed { error },
        };
        drop(state);
        self.inner.events.emit(SessionEvent::Updated);
    }

    // ── Inbound dispatch ────────────────────────────────────────────

    fn spawn_dispatch(&self) {
        if let Some(rx) = self.inner.inbound_rx.lock().take() {
            let session = self.clone();
            let _ = tokio::spawn(async move {
                session.dispatch_loop(rx).await;
            });
        }
    }

    async fn dispatch_loop(self, mut rx: mpsc::UnboundedReceiver<RpcMessage>) {
        while let Some(message) = rx.recv().await {
            self.dispatch(message);
        }
    }

    /// Route one decrypted inbound message. The context is rebuilt for
    /// every message so concurrent inbound calls can never cross-assign
    /// request ids.
    fn dispatch(&self, message: RpcMessage) {
        let context = DispatchContext::for_message(&message);
        match message.kind() {
            MessageKind::Response => self.handle_response(message),
            MessageKind::Request | MessageKind::Notification => {
                let method = message.method.clone().unwrap_or_default();
                let phase = self.inner.state.lock().phase;
                match route(phase, &method) {
                    MethodRoute::SessionRequest => self.handle_session_request(context, &message),
                    MethodRoute::SessionUpdate => self.handle_session_update(&message),
                    MethodRoute::PeerDefault => self.handle_peer_request(context, message),
                    MethodRoute::NotFound => {
                        debug!(method = %method, ?phase, "method not routable in this phase");
                        if let Some(id) = context.request_id {
                            let _ = self.inner.bridge.send_data(&RpcMessage::error_response(
                                id,
                                METHOD_NOT_FOUND,
                                format!("method '{method}' not found"),
                            ));
                        }
                    }
                }
            }
            MessageKind::Malformed => warn!("discarding malformed data-plane message"),
        }
    }

    fn handle_response(&self, message: RpcMessage) {
        let Some(id) = message.id else { return };
        let outcome = match message.error {
            Some(body) => Err(body),
            None => Ok(message.result.unwrap_or(Value::Null)),
        };
        if !self.inner.calls.settle(id, outcome.clone()) {
            // A reply to a request persisted before a restart has no
            // live pending call; settle the queue record directly.
            self.settle_request_record(id, outcome);
        }
    }

    fn handle_session_request(&self, context: DispatchContext, message: &RpcMessage) {
        let Some(request_id) = context.request_id else {
            warn!("pairing request arrived without an id");
            return;
        };
        let params = message.params.clone().unwrap_or(Value::Null);
        let peer_id = params
            .get("peerId")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let peer_meta: Option<PeerMeta> = params
            .get("peerMeta")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let (Some(peer_id), Some(peer_meta)) = (peer_id, peer_meta) else {
            let field = if params.get("peerId").and_then(Value::as_str).is_none() {
                "peerId"
            } else {
                "peerMeta"
            };
            warn!(field, "pairing request rejected");
            self.destroy_session(Some(SessionError::Validation { field }));
            return;
        };
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            state.peer_id = Some(peer_id.clone());
            state.peer_meta = Some(peer_meta);
            state.phase = SessionPhase::AwaitingApproval;
            state.peer_requests.push(PeerRequest {
                id: request_id,
                method: METHOD_SESSION_REQUEST.to_owned(),
                params: Some(params),
            });
            let _ = state.seen_peer_ids.insert(request_id);
            let _ = state.responders.insert(request_id, tx);
        }
        self.inner.bridge.set_peer_topic(peer_id);
        self.spawn_forwarder(request_id, rx);
        self.inner.events.emit(SessionEvent::Updated);
    }

    fn handle_session_update(&self, message: &RpcMessage) {
        let params = message.params.clone().unwrap_or(Value::Null);
        if params.get("approved").and_then(Value::as_bool) == Some(false) {
            self.destroy_session(Some(SessionError::PeerRejected {
                reason: "peer ended the session".into(),
            }));
            return;
        }
        {
            let mut state = self.inner.state.lock();
            if let Some(accounts) = string_array(params.get("accounts")) {
                state.peer_accounts = accounts;
            }
            if let Some(chain) = params.get("chainId").and_then(Value::as_u64) {
                state.chain_id = Some(chain);
            }
            if let Some(url) = params.get("rpcUrl").and_then(Value::as_str) {
                state.rpc_url = Some(url.to_owned());
            }
        }
        self.inner.events.emit(SessionEvent::Updated);
    }

    fn handle_peer_request(&self, context: DispatchContext, message: RpcMessage) {
        let method = message.method.unwrap_or_default();
        let Some(request_id) = context.request_id else {
            debug!(method = %method, "ignoring notification with no handler");
            return;
        };
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if !state.seen_peer_ids.insert(request_id) {
                drop(state);
                warn!(request_id, "duplicate peer request id");
                let _ = self.inner.bridge.send_data(&RpcMessage::error_response(
                    request_id,
                    DUPLICATE_REQUEST,
                    "duplicate request id",
                ));
                return;
            }
            state.peer_requests.push(PeerRequest {
                id: request_id,
                method,
                params: message.params,
            });
            let _ = state.responders.insert(request_id, tx);
        }
        self.spawn_forwarder(request_id, rx);
        self.inner.events.emit(SessionEvent::Updated);
    }

    /// Forward a responder's settlement to a raw send, so applications
    /// can answer a queued peer request long after dispatch moved on.
    fn spawn_forwarder(&self, id: u64, rx: oneshot::Receiver<Result<Value, RpcErrorBody>>) {
        let session = self.clone();
        let _ = tokio::spawn(async move {
            match rx.await {
                Ok(Ok(result)) => {
                    if let Err(err) = session
                        .inner
                        .bridge
                        .send_data(&RpcMessage::response(id, result))
                    {
                        warn!(id, error = %err, "response not sent");
                    }
                }
                Ok(Err(body)) => {
                    if let Err(err) = session
                        .inner
                        .bridge
                        .send_data(&RpcMessage::error_response(id, body.code, body.message))
                    {
                        warn!(id, error = %err, "error response not sent");
                    }
                }
                // Responder dropped without settling; session teardown.
                Err(_) => {}
            }
        });
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// Own topic id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SessionPhase {
        self.inner.state.lock().phase
    }

    /// Peer topic id, once paired.
    pub fn peer_id(&self) -> Option<String> {
        self.inner.state.lock().peer_id.clone()
    }

    /// Peer metadata, once paired.
    pub fn peer_meta(&self) -> Option<PeerMeta> {
        self.inner.state.lock().peer_meta.clone()
    }

    /// Current chain id.
    pub fn chain_id(&self) -> Option<u64> {
        self.inner.state.lock().chain_id
    }

    /// Accounts we expose to the peer.
    pub fn accounts(&self) -> Vec<String> {
        self.inner.state.lock().accounts.clone()
    }

    /// Accounts the peer exposed to us.
    pub fn peer_accounts(&self) -> Vec<String> {
        self.inner.state.lock().peer_accounts.clone()
    }

    /// Ordered outgoing request queue.
    pub fn requests(&self) -> Vec<Request> {
        self.inner.state.lock().requests.clone()
    }

    /// Ordered incoming request queue.
    pub fn peer_requests(&self) -> Vec<PeerRequest> {
        self.inner.state.lock().peer_requests.clone()
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// The pairing string to hand to the peer out of band.
    pub fn pairing_uri(&self) -> PairingUri {
        PairingUri {
            handshake_id: self.inner.handshake_id.clone(),
            version: self.inner.version.clone(),
            bridge: self.inner.bridge_url.clone(),
            key: self.inner.key.clone(),
        }
    }

    /// Snapshot for persistence.
    pub fn descriptor(&self) -> SessionDescriptor {
        let state = self.inner.state.lock();
        SessionDescriptor {
            id: self.inner.id.clone(),
            peer_id: state.peer_id.clone(),
            peer_meta: state.peer_meta.clone(),
            chain_id: state.chain_id,
            accounts: state.accounts.clone(),
            requests: state.requests.clone(),
            peer_accounts: state.peer_accounts.clone(),
            peer_requests: state.peer_requests.clone(),
            handshake_id: self.inner.handshake_id.clone(),
            initiator: self.inner.initiator,
            version: self.inner.version.clone(),
            bridge: self.inner.bridge_url.clone(),
            key: self.inner.key.to_hex(),
        }
    }
}

fn string_array(value: Option<&Value>) -> Option<Vec<String>> {
    value.and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str) -> PeerMeta {
        PeerMeta {
            name: name.into(),
            description: format!("{name} app"),
            url: format!("https://{name}.example"),
            icons: Vec::new(),
        }
    }

    fn responder_session() -> Session {
        let initiator = Session::initiator(
            "ws://127.0.0.1:0",
            SessionConfig {
                meta: meta("requester"),
                chain_id: Some(1),
                rpc_url: None,
                accounts: Vec::new(),
                launcher: None,
            },
        );
        Session::responder(
            &initiator.pairing_uri(),
            SessionConfig {
                meta: meta("approver"),
                chain_id: None,
                rpc_url: Some("https://rpc.example".into()),
                accounts: vec!["0xabc".into()],
                launcher: None,
            },
        )
    }

    fn pairing_request(id: u64) -> RpcMessage {
        RpcMessage::request(
            id,
            METHOD_SESSION_REQUEST,
            Some(json!({
                "peerId": "initiator-id",
                "peerMeta": meta("requester"),
                "chainId": 137,
            })),
        )
    }

    fn dispatch(session: &Session, message: RpcMessage) {
        session.dispatch(message);
    }

    // ── Handshake (responder side) ──────────────────────────────────

    #[tokio::test]
    async fn pairing_request_is_queued_for_approval() {
        let session = responder_session();
        session.inner.state.lock().phase = SessionPhase::Subscribed;

        dispatch(&session, pairing_request(1));

        assert_eq!(session.phase(), SessionPhase::AwaitingApproval);
        assert_eq!(session.peer_id().as_deref(), Some("initiator-id"));
        assert_eq!(session.peer_meta().unwrap().name, "requester");
        let queued = session.peer_requests();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, 1);
        assert_eq!(queued[0].method, METHOD_SESSION_REQUEST);
    }

    #[tokio::test]
    async fn approve_activates_and_removes_request_exactly_once() {
        let session = responder_session();
        session.inner.state.lock().phase = SessionPhase::Subscribed;
        dispatch(&session, pairing_request(1));

        session.approve_session(1).unwrap();
        assert_eq!(session.phase(), SessionPhase::Active);
        assert_eq!(session.chain_id(), Some(137));
        assert!(session.peer_requests().is_empty());

        let err = session.approve_session(1).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Validation { field: "requestId" }
        ));
    }

    #[tokio::test]
    async fn missing_peer_meta_destroys_without_enqueue() {
        let session = responder_session();
        session.inner.state.lock().phase = SessionPhase::Subscribed;
        let (tx, rx) = oneshot::channel();
        *session.inner.approval.lock() = Some(tx);
        let mut events = session.events();

        dispatch(
            &session,
            RpcMessage::request(
                1,
                METHOD_SESSION_REQUEST,
                Some(json!({"peerId": "initiator-id"})),
            ),
        );

        assert_eq!(session.phase(), SessionPhase::Destroyed);
        assert!(session.peer_requests().is_empty());
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SessionError::Validation { field: "peerMeta" }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Destroyed { error: Some(_) }
        ));
    }

    #[tokio::test]
    async fn termination_update_before_approval_destroys_session() {
        let session = responder_session();
        session.inner.state.lock().phase = SessionPhase::Subscribed;
        let (tx, rx) = oneshot::channel();
        *session.inner.approval.lock() = Some(tx);
        dispatch(&session, pairing_request(1));
        assert_eq!(session.phase(), SessionPhase::AwaitingApproval);

        // The initiator gives up before we approve.
        dispatch(
            &session,
            RpcMessage::notification(
                METHOD_SESSION_UPDATE,
                Some(json!({"approved": false, "accounts": []})),
            ),
        );

        assert_eq!(session.phase(), SessionPhase::Destroyed);
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::PeerRejected { .. }));
    }

    // ── Updates and teardown ────────────────────────────────────────

    #[tokio::test]
    async fn peer_rejection_update_destroys_session() {
        let session = responder_session();
        session.inner.state.lock().phase = SessionPhase::Active;
        let mut events = session.events();

        dispatch(
            &session,
            RpcMessage::notification(
                METHOD_SESSION_UPDATE,
                Some(json!({"approved": false, "accounts": []})),
            ),
        );

        assert_eq!(session.phase(), SessionPhase::Destroyed);
        let event = events.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::Destroyed { error: Some(_) }));
    }

    #[tokio::test]
    async fn update_merges_only_present_fields() {
        let session = responder_session();
        {
            let mut state = session.inner.state.lock();
            state.phase = SessionPhase::Active;
            state.chain_id = Some(1);
            state.peer_accounts = vec!["0xold".into()];
        }

        dispatch(
            &session,
            RpcMessage::notification(METHOD_SESSION_UPDATE, Some(json!({"chainId": 10}))),
        );
        assert_eq!(session.chain_id(), Some(10));
        assert_eq!(session.peer_accounts(), vec!["0xold".to_owned()]);

        dispatch(
            &session,
            RpcMessage::notification(
                METHOD_SESSION_UPDATE,
                Some(json!({"accounts": ["0xnew"], "approved": true})),
            ),
        );
        assert_eq!(session.peer_accounts(), vec!["0xnew".to_owned()]);
        assert_eq!(session.chain_id(), Some(10));
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_emits_once() {
        let session = responder_session();
        let mut events = session.events();

        session.destroy_session(None);
        session.destroy_session(Some(SessionError::Destroyed));

        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Destroyed { error: None }
        );
        assert!(events.try_recv().is_err());
    }

    // ── Request queues ──────────────────────────────────────────────

    #[tokio::test]
    async fn make_request_records_and_settles_queue_entry() {
        let session = responder_session();
        session.inner.state.lock().phase = SessionPhase::Active;

        let call = session
            .make_request("personal_sign", Some(json!(["0xdead"])))
            .unwrap();
        let id = call.id();
        assert!(matches!(
            session.requests()[0].status,
            RequestStatus::Pending {}
        ));

        assert!(session.inner.calls.settle(id, Ok(json!("0xsigned"))));
        let reply = call.wait().await.unwrap();
        assert_eq!(reply, json!("0xsigned"));
        assert_eq!(
            session.requests()[0].status,
            RequestStatus::Completed {
                result: json!("0xsigned")
            }
        );
    }

    #[tokio::test]
    async fn late_response_settles_restored_request_record() {
        let session = responder_session();
        session.inner.state.lock().requests.push(Request {
            id: 9,
            method: "personal_sign".into(),
            params: None,
            status: RequestStatus::Pending {},
        });

        dispatch(&session, RpcMessage::response(9, json!("ok")));

        assert_eq!(
            session.requests()[0].status,
            RequestStatus::Completed {
                result: json!("ok")
            }
        );
    }

    #[tokio::test]
    async fn duplicate_peer_request_id_is_not_enqueued() {
        let session = responder_session();
        session.inner.state.lock().phase = SessionPhase::Active;

        dispatch(
            &session,
            RpcMessage::request(5, "personal_sign", Some(json!(["a"]))),
        );
        dispatch(
            &session,
            RpcMessage::request(5, "personal_sign", Some(json!(["b"]))),
        );

        let queued = session.peer_requests();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].params, Some(json!(["a"])));
    }

    #[tokio::test]
    async fn peer_request_id_stays_burned_after_resolution() {
        let session = responder_session();
        session.inner.state.lock().phase = SessionPhase::Active;

        dispatch(&session, RpcMessage::request(5, "personal_sign", None));
        session.resolve_peer_request(5, json!("sig")).unwrap();
        assert!(session.peer_requests().is_empty());

        dispatch(&session, RpcMessage::request(5, "personal_sign", None));
        assert!(session.peer_requests().is_empty());
    }

    #[tokio::test]
    async fn resolve_and_reject_consume_peer_requests() {
        let session = responder_session();
        session.inner.state.lock().phase = SessionPhase::Active;
        dispatch(&session, RpcMessage::request(5, "personal_sign", None));
        dispatch(&session, RpcMessage::request(6, "personal_sign", None));

        session.resolve_peer_request(5, json!("sig")).unwrap();
        session
            .reject_peer_request(6, "USER_DECLINED", "declined")
            .unwrap();
        assert!(session.peer_requests().is_empty());

        let err = session.resolve_peer_request(5, json!("x")).unwrap_err();
        assert!(matches!(err, SessionError::Validation { .. }));
    }

    // ── Persistence ─────────────────────────────────────────────────

    #[tokio::test]
    async fn descriptor_roundtrips_through_restore() {
        let session = responder_session();
        {
            let mut state = session.inner.state.lock();
            state.phase = SessionPhase::Active;
            state.peer_id = Some("initiator-id".into());
            state.peer_meta = Some(meta("requester"));
            state.chain_id = Some(137);
            state.peer_accounts = vec!["0xpeer".into()];
            state.requests.push(Request {
                id: 3,
                method: "personal_sign".into(),
                params: None,
                status: RequestStatus::Pending {},
            });
        }

        let descriptor = session.descriptor();
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["peerId"], "initiator-id");
        assert_eq!(json["handshakeId"], descriptor.handshake_id);
        assert_eq!(json["requests"][0]["id"], 3);

        let restored = Session::restore(descriptor.clone(), None).unwrap();
        assert_eq!(restored.id(), session.id());
        assert_eq!(restored.peer_id().as_deref(), Some("initiator-id"));
        assert_eq!(restored.chain_id(), Some(137));
        assert_eq!(restored.descriptor(), descriptor);

        // Assigned ids must not collide with persisted ones.
        let (message, _pending) = restored.inner.calls.call("m", None).unwrap();
        assert_eq!(message.id, Some(4));
    }

    #[test]
    fn request_status_serde_shape() {
        let completed = Request {
            id: 1,
            method: "m".into(),
            params: None,
            status: RequestStatus::Completed { result: json!(7) },
        };
        let json = serde_json::to_value(&completed).unwrap();
        assert_eq!(json, json!({"id": 1, "method": "m", "result": 7}));

        let parsed: Request = serde_json::from_value(json!({
            "id": 2,
            "method": "m",
            "error": {"code": "X", "message": "y"},
        }))
        .unwrap();
        assert!(matches!(parsed.status, RequestStatus::Failed { .. }));

        let pending: Request =
            serde_json::from_value(json!({"id": 3, "method": "m"})).unwrap();
        assert!(matches!(pending.status, RequestStatus::Pending {}));
    }
}

//! End-to-end pairing tests: two sessions talking through a real relay.

use std::time::Duration;

use futures::SinkExt;
use serde_json::json;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use tether_core::{ControlMessage, PairingKey, PairingUri, PeerMeta, envelope};
use tether_relay::{RelayConfig, RelayServer};
use tether_rpc::RpcMessage;
use tether_session::{
    Bridge, BridgeConfig, BridgeState, Session, SessionConfig, SessionError, SessionEvent,
    SessionPhase,
};

const TIMEOUT: Duration = Duration::from_secs(10);

async fn boot_relay() -> String {
    let server = RelayServer::new(RelayConfig::default());
    let (addr, _handle) = server.listen().await.unwrap();
    format!("ws://{addr}")
}

fn meta(name: &str) -> PeerMeta {
    PeerMeta {
        name: name.into(),
        description: format!("{name} app"),
        url: format!("https://{name}.example"),
        icons: Vec::new(),
    }
}

/// Poll until `check` passes or the timeout burns down.
async fn wait_until(check: impl Fn() -> bool) {
    timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn full_pairing_approval_and_request_roundtrip() {
    let bridge_url = boot_relay().await;

    let initiator = Session::initiator(
        &bridge_url,
        SessionConfig {
            meta: meta("requester"),
            chain_id: Some(1),
            rpc_url: None,
            accounts: Vec::new(),
            launcher: None,
        },
    );
    let responder = Session::responder(
        &initiator.pairing_uri(),
        SessionConfig {
            meta: meta("approver"),
            chain_id: None,
            rpc_url: Some("https://rpc.example".into()),
            accounts: vec!["0xabc".into()],
            launcher: None,
        },
    );

    let responder_task = tokio::spawn({
        let responder = responder.clone();
        async move { responder.create_session().await }
    });

    // Approve as soon as the pairing request lands in the queue.
    let approver = tokio::spawn({
        let responder = responder.clone();
        async move {
            timeout(TIMEOUT, async {
                loop {
                    if let Some(request) = responder.peer_requests().first() {
                        responder.approve_session(request.id).unwrap();
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            })
            .await
            .unwrap();
        }
    });

    timeout(TIMEOUT, initiator.create_session())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(initiator.phase(), SessionPhase::Active);
    assert_eq!(initiator.peer_id().as_deref(), Some(responder.id()));
    assert_eq!(initiator.peer_meta().unwrap().name, "approver");
    assert_eq!(initiator.peer_accounts(), vec!["0xabc".to_owned()]);
    assert_eq!(initiator.chain_id(), Some(1));

    timeout(TIMEOUT, responder_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    approver.await.unwrap();
    assert_eq!(responder.phase(), SessionPhase::Active);
    assert_eq!(responder.peer_id().as_deref(), Some(initiator.id()));
    assert_eq!(responder.peer_meta().unwrap().name, "requester");

    // Application-level call from initiator to responder.
    let resolver = tokio::spawn({
        let responder = responder.clone();
        async move {
            timeout(TIMEOUT, async {
                loop {
                    if let Some(request) = responder
                        .peer_requests()
                        .iter()
                        .find(|r| r.method == "personal_sign")
                    {
                        responder
                            .resolve_peer_request(request.id, json!("0xsigned"))
                            .unwrap();
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            })
            .await
            .unwrap();
        }
    });
    let call = initiator
        .make_request("personal_sign", Some(json!(["0xdeadbeef"])))
        .unwrap();
    let reply = timeout(TIMEOUT, call.wait()).await.unwrap().unwrap();
    assert_eq!(reply, json!("0xsigned"));
    resolver.await.unwrap();

    // A session update from the responder reaches the initiator.
    responder
        .notify(
            "wc_sessionUpdate",
            Some(json!({"approved": true, "accounts": ["0xnew"], "chainId": 10})),
        )
        .unwrap();
    wait_until(|| initiator.peer_accounts() == vec!["0xnew".to_owned()]).await;
    assert_eq!(initiator.chain_id(), Some(10));

    // Teardown on one side destroys the other via the approved:false
    // notice.
    let mut events = initiator.events();
    responder.destroy_session(None);
    let destroyed = timeout(TIMEOUT, async {
        loop {
            if let SessionEvent::Destroyed { error } = events.recv().await.unwrap() {
                break error;
            }
        }
    })
    .await
    .unwrap();
    assert!(destroyed.is_some());
    assert_eq!(initiator.phase(), SessionPhase::Destroyed);
}

#[tokio::test]
async fn bridge_reconnects_and_resubscribes_after_relay_restart() {
    let server = RelayServer::new(RelayConfig::default());
    let (addr, handle) = server.listen().await.unwrap();

    let key = PairingKey::generate();
    let (bridge, mut inbound) = Bridge::new(BridgeConfig {
        url: format!("ws://{addr}"),
        key: key.clone(),
        own_topic: "own-topic".into(),
        handshake_topic: "handshake-topic".into(),
        initiator: false,
        pairing_uri: String::new(),
        launcher: None,
    });
    bridge.open().await.unwrap();
    bridge.subscribe_topic("handshake-topic").unwrap();

    // Take the relay down, then bring a fresh one up on the same port.
    server.shutdown().graceful_shutdown(vec![handle], None).await;
    let restarted = RelayServer::new(RelayConfig {
        port: addr.port(),
        ..RelayConfig::default()
    });
    let (addr2, _handle2) = restarted.listen().await.unwrap();

    // The fixed-delay retry brings the bridge back without any call
    // from this side.
    timeout(Duration::from_secs(15), async {
        while bridge.state() != BridgeState::Open {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("bridge did not reconnect");

    // Both topics were resubscribed on the new relay: a publish to
    // either one reaches the bridge.
    let (mut publisher, _) = connect_async(format!("ws://{addr2}/ws")).await.unwrap();
    for (id, topic) in [(1, "own-topic"), (2, "handshake-topic")] {
        let message = RpcMessage::request(id, "personal_sign", None);
        let sealed = envelope::seal(&serde_json::to_vec(&message).unwrap(), &key);
        let frame = ControlMessage::publish(topic, serde_json::to_string(&sealed).unwrap());
        publisher
            .send(Message::Text(
                serde_json::to_string(&frame).unwrap().into(),
            ))
            .await
            .unwrap();
    }
    let mut ids = vec![
        timeout(TIMEOUT, inbound.recv()).await.unwrap().unwrap().id,
        timeout(TIMEOUT, inbound.recv()).await.unwrap().unwrap().id,
    ];
    ids.sort_unstable();
    assert_eq!(ids, vec![Some(1), Some(2)]);
    bridge.close();
}

#[tokio::test]
async fn handshake_missing_peer_meta_rejects_the_approval_future() {
    let bridge_url = boot_relay().await;
    let key = PairingKey::generate();
    let uri = PairingUri {
        handshake_id: "rogue-handshake".into(),
        version: "1".into(),
        bridge: bridge_url.clone(),
        key: key.clone(),
    };

    let responder = Session::responder(
        &uri,
        SessionConfig {
            meta: meta("approver"),
            chain_id: None,
            rpc_url: None,
            accounts: Vec::new(),
            launcher: None,
        },
    );
    let responder_task = tokio::spawn({
        let responder = responder.clone();
        async move { responder.create_session().await }
    });
    wait_until(|| responder.phase() == SessionPhase::Subscribed).await;

    // A rogue initiator that omits peerMeta entirely.
    let request = RpcMessage::request(1, "wc_sessionRequest", Some(json!({"peerId": "rogue"})));
    let sealed = envelope::seal(&serde_json::to_vec(&request).unwrap(), &key);
    let frame = ControlMessage::publish("rogue-handshake", serde_json::to_string(&sealed).unwrap());
    let (mut socket, _) = connect_async(format!("{bridge_url}/ws")).await.unwrap();
    socket
        .send(Message::Text(
            serde_json::to_string(&frame).unwrap().into(),
        ))
        .await
        .unwrap();

    let outcome = timeout(TIMEOUT, responder_task).await.unwrap().unwrap();
    assert!(matches!(
        outcome,
        Err(SessionError::Validation { field: "peerMeta" })
    ));
    assert_eq!(responder.phase(), SessionPhase::Destroyed);
    assert!(responder.peer_requests().is_empty());
}

//! End-to-end tests: real servers on ephemeral ports driven over WebSocket.

#![allow(unused_results)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use conduit_core::clock;
use conduit_server::{AppState, Claims, GatewayConfig, GatewayServer};
use conduit_store::{AuditStore, ConnectionConfig, MemoryStore, SharedStore};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const TIMEOUT: Duration = Duration::from_secs(5);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Gateway {
    server: GatewayServer,
    addr: SocketAddr,
}

impl Gateway {
    async fn start(instance_id: &str, store: Arc<MemoryStore>) -> Self {
        Self::start_with_audit(instance_id, store, AuditStore::in_memory().unwrap()).await
    }

    async fn start_with_audit(instance_id: &str, store: Arc<MemoryStore>, audit: AuditStore) -> Self {
        let config = GatewayConfig {
            instance_id: instance_id.into(),
            replay_pacing: Duration::from_millis(1),
            ..GatewayConfig::default()
        };
        let store: Arc<dyn SharedStore> = store;
        let state = AppState::new(config, store, Some(audit));
        let server = GatewayServer::new(state);
        server.spawn_background_tasks();
        let (addr, _handle) = server.listen().await.unwrap();
        // Let the broker listener subscribe before traffic flows.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Self { server, addr }
    }

    fn token(&self, user: &str, org: &str, role: &str) -> String {
        let claims = Claims {
            sub: user.into(),
            org: org.into(),
            role: role.into(),
            exp: u64::try_from(clock::now_ms() / 1000 + 3600).unwrap(),
            iss: None,
        };
        self.server.state().verifier.issue(&claims).unwrap()
    }

    async fn connect(&self, user: &str, org: &str, role: &str) -> (Ws, Value) {
        let url = format!("ws://{}/ws?token={}", self.addr, self.token(user, org, role));
        let (mut ws, _) = connect_async(url).await.unwrap();
        let ack = next_json(&mut ws).await;
        (ws, ack)
    }
}

async fn send(ws: &mut Ws, message_type: &str, request_id: &str, payload: Value) {
    let frame = json!({
        "type": message_type,
        "session_id": "sess-it",
        "request_id": request_id,
        "payload": payload,
    });
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn request(ws: &mut Ws, message_type: &str, payload: Value) -> Value {
    send(ws, message_type, "req", payload).await;
    next_json(ws).await
}

#[tokio::test]
async fn handshake_acks_then_ping_pong() {
    let gw = Gateway::start("gw-a", Arc::new(MemoryStore::new())).await;
    let (mut ws, ack) = gw.connect("u1", "org-1", "DEVELOPER").await;

    assert_eq!(ack["type"], "CONNECTION_ACK");
    assert_eq!(ack["payload"]["protocolVersion"], "1.0");
    assert_eq!(ack["payload"]["rateLimits"]["messagesPerMinute"], 200);
    assert_eq!(gw.server.state().registry.len(), 1);

    let pong = request(&mut ws, "PING", json!({})).await;
    assert_eq!(pong["type"], "PONG");
    assert_eq!(pong["request_id"], "req");
    assert_eq!(pong["session_id"], "sess-it");
}

#[tokio::test]
async fn bad_token_is_rejected_before_upgrade() {
    let gw = Gateway::start("gw-a", Arc::new(MemoryStore::new())).await;
    let url = format!("ws://{}/ws?token=garbage", gw.addr);
    let err = connect_async(url).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 401),
        other => panic!("expected HTTP 401, got {other:?}"),
    }
    assert!(gw.server.state().registry.is_empty());
}

#[tokio::test]
async fn invalid_frame_keeps_connection_open() {
    let gw = Gateway::start("gw-a", Arc::new(MemoryStore::new())).await;
    let (mut ws, _) = gw.connect("u1", "org-1", "VIEWER").await;

    ws.send(Message::text("not json")).await.unwrap();
    let err = next_json(&mut ws).await;
    assert_eq!(err["type"], "ERROR");
    assert_eq!(err["payload"]["code"], "INVALID_JSON");

    let pong = request(&mut ws, "PING", json!({})).await;
    assert_eq!(pong["type"], "PONG");
}

#[tokio::test]
async fn events_fan_out_across_instances() {
    let store = Arc::new(MemoryStore::new());
    let a = Gateway::start("gw-a", store.clone()).await;
    let b = Gateway::start("gw-b", store.clone()).await;

    let (mut listener, _) = a.connect("u1", "org-1", "DEVELOPER").await;
    let (mut outsider, _) = a.connect("u3", "org-2", "DEVELOPER").await;
    let (mut publisher, _) = b.connect("u2", "org-1", "DEVELOPER").await;

    let ack = request(&mut listener, "SUBSCRIBE", json!({ "eventTypes": ["deploy.finished"] })).await;
    assert_eq!(ack["type"], "ACK");
    let ack = request(&mut outsider, "SUBSCRIBE", json!({ "eventTypes": ["deploy.finished"] })).await;
    assert_eq!(ack["type"], "ACK");

    let ack = request(
        &mut publisher,
        "EVENT_PUBLISH",
        json!({ "eventType": "deploy.finished", "data": { "build": 42 } }),
    )
    .await;
    assert_eq!(ack["type"], "ACK");
    // Nobody on instance B subscribed.
    assert_eq!(ack["payload"]["data"]["delivered"], 0);

    let event = next_json(&mut listener).await;
    assert_eq!(event["type"], "EVENT");
    assert_eq!(event["session_id"], "gw-a");
    assert_eq!(event["payload"]["eventType"], "deploy.finished");
    assert_eq!(event["payload"]["data"]["build"], 42);

    // The org-2 subscriber must not see org-1's event.
    let pong = request(&mut outsider, "PING", json!({})).await;
    assert_eq!(pong["type"], "PONG");
}

#[tokio::test]
async fn disconnect_removes_subscriptions() {
    let gw = Gateway::start("gw-a", Arc::new(MemoryStore::new())).await;
    let (mut ws, _) = gw.connect("u1", "org-1", "DEVELOPER").await;
    request(&mut ws, "SUBSCRIBE", json!({ "eventTypes": ["a", "b"] })).await;
    assert_eq!(gw.server.state().subscriptions.len(), 2);

    ws.close(None).await.unwrap();
    for _ in 0..50 {
        if gw.server.state().registry.is_empty() && gw.server.state().subscriptions.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(gw.server.state().registry.is_empty());
    assert!(gw.server.state().subscriptions.is_empty());
}

#[tokio::test]
async fn shutdown_closes_clients() {
    let gw = Gateway::start("gw-a", Arc::new(MemoryStore::new())).await;
    let (mut ws, _) = gw.connect("u1", "org-1", "VIEWER").await;

    gw.server.shutdown(Some(TIMEOUT)).await;

    let closed = tokio::time::timeout(TIMEOUT, async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => return true,
                Ok(_) => {}
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(closed);
    assert!(gw.server.state().registry.is_empty());
}

#[tokio::test]
async fn replay_reads_log_written_by_previous_instance() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("audit.db");
    let db = db.to_str().unwrap();
    let start = clock::now_ms() - 1_000;

    {
        let audit = AuditStore::open(db, &ConnectionConfig::default()).unwrap();
        let gw = Gateway::start_with_audit("gw-old", Arc::new(MemoryStore::new()), audit).await;
        let (mut ws, _) = gw.connect("u1", "org-1", "DEVELOPER").await;
        for n in 0..3 {
            let ack = request(
                &mut ws,
                "EVENT_PUBLISH",
                json!({ "eventType": "order.placed", "data": { "n": n } }),
            )
            .await;
            assert_eq!(ack["payload"]["data"]["logged"], true);
        }
        gw.server.shutdown(Some(TIMEOUT)).await;
    }

    let audit = AuditStore::open(db, &ConnectionConfig::default()).unwrap();
    let gw = Gateway::start_with_audit("gw-new", Arc::new(MemoryStore::new()), audit).await;
    let (mut ws, _) = gw.connect("u2", "org-1", "DEVELOPER").await;
    request(&mut ws, "SUBSCRIBE", json!({ "eventTypes": ["order.placed"] })).await;

    send(
        &mut ws,
        "EVENT_REPLAY",
        "replay-1",
        json!({ "fromTimestamp": start, "eventTypes": ["order.placed"], "maxEvents": 2 }),
    )
    .await;
    let first = next_json(&mut ws).await;
    let second = next_json(&mut ws).await;
    let ack = next_json(&mut ws).await;
    assert_eq!(first["payload"]["data"]["n"], 0);
    assert_eq!(second["payload"]["data"]["n"], 1);
    assert_eq!(second["payload"]["sourceModule"], "replay");
    assert_eq!(ack["type"], "ACK");
    assert_eq!(ack["request_id"], "replay-1");
    assert_eq!(ack["payload"]["data"]["replayed"], 2);
}

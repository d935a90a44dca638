//! Gateway client integration tests.
//!
//! Drives a real client against a mock WebSocket gateway to verify the
//! handshake, request correlation, and reconnection behaviour.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use claw_control::{
    ChannelHandler, ConnectionState, EventFrame, GatewayClient, GatewayClientOptions,
    GatewayError, GatewayHandler, GatewayNotification, ReconnectPolicy, SequenceGap,
};
use claw_identity::{DeviceAuthPayload, derive_device_id, verify_signature};
use claw_persist::MemoryStore;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{WebSocketStream, accept_async};

const WAIT: Duration = Duration::from_secs(5);

type Ws = WebSocketStream<TcpStream>;

// ============================================================================
// Test Helpers - Mock Gateway Server
// ============================================================================

/// A mock gateway server for testing.
struct MockGateway {
    listener: TcpListener,
    addr: SocketAddr,
}

impl MockGateway {
    async fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        Self { listener, addr }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    async fn accept(&self) -> Ws {
        let (stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("timed out waiting for client")
            .expect("accept");
        accept_async(stream).await.expect("websocket handshake")
    }

    /// Accept a connection and read its `connect` request.
    async fn accept_connect(&self) -> (Ws, String, Value) {
        let mut ws = self.accept().await;
        let frame = next_frame(&mut ws).await;
        assert_eq!(frame["type"], "req");
        assert_eq!(frame["method"], "connect");
        let id = frame["id"].as_str().expect("request id").to_string();
        (ws, id, frame["params"].clone())
    }

    /// Accept a connection and answer its `connect` with `hello`.
    async fn accept_hello(&self, hello: Value) -> Ws {
        let (mut ws, id, _) = self.accept_connect().await;
        reply_ok(&mut ws, &id, hello).await;
        ws
    }
}

async fn next_message(ws: &mut Ws) -> Message {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if !matches!(msg, Message::Ping(_) | Message::Pong(_)) {
            return msg;
        }
    }
}

async fn next_frame(ws: &mut Ws) -> Value {
    match next_message(ws).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).expect("json frame"),
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send");
}

async fn reply_ok(ws: &mut Ws, id: &str, payload: Value) {
    send_json(ws, json!({"type": "res", "id": id, "ok": true, "payload": payload})).await;
}

fn hello_ok() -> Value {
    json!({"type": "hello-ok", "protocol": 3, "server": {"version": "test"}})
}

// ============================================================================
// Test Helpers - Client
// ============================================================================

fn fast_options(url: &str) -> GatewayClientOptions {
    GatewayClientOptions::new(url)
        .with_handshake_delay(Duration::from_millis(50))
        .with_connect_timeout(Duration::from_secs(2))
        .with_reconnect_policy(ReconnectPolicy {
            floor_ms: 20.0,
            cap_ms: 200.0,
            multiplier: 2.0,
        })
}

fn new_client(options: GatewayClientOptions) -> (GatewayClient, mpsc::Receiver<GatewayNotification>) {
    let (handler, rx) = ChannelHandler::new(64);
    let client = GatewayClient::new(options, Arc::new(MemoryStore::new()), handler);
    (client, rx)
}

async fn wait_for(
    rx: &mut mpsc::Receiver<GatewayNotification>,
    mut pred: impl FnMut(&GatewayNotification) -> bool,
) -> GatewayNotification {
    timeout(WAIT, async {
        loop {
            let notification = rx.recv().await.expect("notification channel closed");
            if pred(&notification) {
                return notification;
            }
        }
    })
    .await
    .expect("timed out waiting for notification")
}

async fn wait_hello(rx: &mut mpsc::Receiver<GatewayNotification>) {
    wait_for(rx, |n| matches!(n, GatewayNotification::Hello(_))).await;
}

/// Rebuild the signed payload from connect params and check the signature.
fn assert_device_signature(params: &Value) {
    let device = &params["device"];
    let public_key = device["publicKey"].as_str().expect("publicKey");
    let payload = DeviceAuthPayload {
        device_id: device["id"].as_str().expect("id").to_string(),
        client_id: params["client"]["id"].as_str().expect("client id").to_string(),
        client_mode: params["client"]["mode"].as_str().expect("mode").to_string(),
        role: params["role"].as_str().expect("role").to_string(),
        scopes: serde_json::from_value(params["scopes"].clone()).expect("scopes"),
        signed_at_ms: device["signedAt"].as_u64().expect("signedAt"),
        token: params["auth"]["token"].as_str().map(String::from),
        nonce: device["nonce"].as_str().map(String::from),
    };

    assert_eq!(
        derive_device_id(public_key).expect("device id"),
        payload.device_id
    );
    assert!(verify_signature(
        public_key,
        &payload.build_signing_string(),
        device["signature"].as_str().expect("signature"),
    ));
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_handshake_without_challenge_sends_v1_signature() {
    let gateway = MockGateway::new().await;
    let (client, mut rx) = new_client(fast_options(&gateway.url()).with_token("shared"));
    client.start();

    let (mut ws, id, params) = gateway.accept_connect().await;
    assert_eq!(params["minProtocol"], 3);
    assert_eq!(params["maxProtocol"], 3);
    assert_eq!(params["role"], "operator");
    assert_eq!(params["client"]["id"], "cli");
    assert_eq!(params["auth"], json!({"token": "shared"}));
    assert!(params["device"].get("nonce").is_none());
    assert_device_signature(&params);
    assert_eq!(client.connection_state(), ConnectionState::Authenticating);

    reply_ok(&mut ws, &id, hello_ok()).await;
    wait_hello(&mut rx).await;

    assert_eq!(client.connection_state(), ConnectionState::Open);
    assert!(client.is_connected());
    assert_eq!(client.hello().expect("hello")["server"]["version"], "test");
    client.stop();
}

#[tokio::test]
async fn test_challenge_nonce_is_signed() {
    let gateway = MockGateway::new().await;
    let (client, mut rx) = new_client(
        fast_options(&gateway.url()).with_handshake_delay(Duration::from_secs(30)),
    );
    client.start();

    let mut ws = gateway.accept().await;
    send_json(
        &mut ws,
        json!({"type": "event", "event": "connect.challenge", "payload": {"nonce": "n-42", "ts": 1}}),
    )
    .await;

    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["method"], "connect");
    let params = &frame["params"];
    assert_eq!(params["device"]["nonce"], "n-42");
    assert_device_signature(params);

    reply_ok(&mut ws, frame["id"].as_str().expect("id"), hello_ok()).await;
    wait_hello(&mut rx).await;

    // The challenge is consumed by the handshake, never forwarded.
    assert!(rx.try_recv().is_err());
    client.stop();
}

#[tokio::test]
async fn test_late_challenge_does_not_resend_connect() {
    let gateway = MockGateway::new().await;
    let (client, mut rx) = new_client(fast_options(&gateway.url()));
    client.start();

    let (mut ws, id, params) = gateway.accept_connect().await;
    assert!(params["device"].get("nonce").is_none());

    send_json(
        &mut ws,
        json!({"type": "event", "event": "connect.challenge", "payload": {"nonce": "late"}}),
    )
    .await;
    assert!(
        timeout(Duration::from_millis(300), ws.next()).await.is_err(),
        "no second connect expected"
    );

    reply_ok(&mut ws, &id, hello_ok()).await;
    wait_hello(&mut rx).await;
    client.stop();
}

#[tokio::test]
async fn test_issued_device_token_is_cached_and_reused() {
    let gateway = MockGateway::new().await;
    let (client, mut rx) = new_client(fast_options(&gateway.url()).with_token("shared"));
    client.start();

    let mut ws = gateway
        .accept_hello(json!({
            "type": "hello-ok",
            "auth": {"deviceToken": "dt-1", "role": "operator", "scopes": ["operator.admin"]}
        }))
        .await;
    wait_hello(&mut rx).await;

    let device_id = client.identity().ensure_identity().device_id;
    let cached = client.tokens().get(&device_id, "operator").expect("token cached");
    assert_eq!(cached.token, "dt-1");

    ws.close(Some(CloseFrame {
        code: CloseCode::Restart,
        reason: "restart".into(),
    }))
    .await
    .expect("close");

    let (_ws, _, params) = gateway.accept_connect().await;
    assert_eq!(params["auth"]["token"], "dt-1");
    assert_device_signature(&params);
    client.stop();
}

#[tokio::test]
async fn test_handshake_failure_clears_cached_token() {
    let gateway = MockGateway::new().await;
    let (client, mut rx) = new_client(fast_options(&gateway.url()).with_token("shared"));
    let device_id = client.identity().ensure_identity().device_id;
    client
        .tokens()
        .set(&device_id, "operator", "stale", ["operator.admin"])
        .expect("seed token");
    client
        .tokens()
        .set(&device_id, "node", "node-token", ["node.invoke"])
        .expect("seed token");
    client.start();

    let (mut ws, id, params) = gateway.accept_connect().await;
    assert_eq!(params["auth"]["token"], "stale");
    send_json(
        &mut ws,
        json!({"type": "res", "id": id, "ok": false, "error": {"code": "UNAUTHORIZED", "message": "device token mismatch"}}),
    )
    .await;

    match next_message(&mut ws).await {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 4008);
            assert_eq!(frame.reason.as_str(), "connect failed");
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    let closed = wait_for(&mut rx, |n| matches!(n, GatewayNotification::Closed(_))).await;
    assert!(matches!(closed, GatewayNotification::Closed(c) if c.code == 4008));
    assert!(client.tokens().get(&device_id, "operator").is_none());
    assert_eq!(
        client.tokens().get(&device_id, "node").expect("other role kept").token,
        "node-token"
    );

    // The retry falls back to the explicit token.
    let (_ws, _, params) = gateway.accept_connect().await;
    assert_eq!(params["auth"]["token"], "shared");
    client.stop();
}

// ============================================================================
// Requests
// ============================================================================

#[tokio::test]
async fn test_request_before_start_fails_fast() {
    let (client, _rx) = new_client(fast_options("ws://127.0.0.1:9"));
    let result = timeout(WAIT, client.request("health", json!({})))
        .await
        .expect("request must not hang");
    assert!(matches!(result, Err(GatewayError::NotConnected)));
}

#[tokio::test]
async fn test_out_of_order_replies_reach_their_callers() {
    let gateway = MockGateway::new().await;
    let (client, mut rx) = new_client(fast_options(&gateway.url()));
    client.start();
    let mut ws = gateway.accept_hello(hello_ok()).await;
    wait_hello(&mut rx).await;

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.request("first", json!({})).await })
    };
    let first_frame = next_frame(&mut ws).await;
    let second = {
        let client = client.clone();
        tokio::spawn(async move { client.request("second", json!({})).await })
    };
    let second_frame = next_frame(&mut ws).await;
    assert_eq!(first_frame["method"], "first");
    assert_eq!(second_frame["method"], "second");
    assert_ne!(first_frame["id"], second_frame["id"]);

    reply_ok(&mut ws, second_frame["id"].as_str().expect("id"), json!(2)).await;
    reply_ok(&mut ws, first_frame["id"].as_str().expect("id"), json!(1)).await;

    assert_eq!(first.await.expect("join").expect("first"), json!(1));
    assert_eq!(second.await.expect("join").expect("second"), json!(2));
    assert_eq!(client.pending_requests(), 0);
    client.stop();
}

#[tokio::test]
async fn test_error_replies_carry_message_or_fallback() {
    let gateway = MockGateway::new().await;
    let (client, mut rx) = new_client(fast_options(&gateway.url()));
    client.start();
    let mut ws = gateway.accept_hello(hello_ok()).await;
    wait_hello(&mut rx).await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.request("nope", json!({})).await })
    };
    let frame = next_frame(&mut ws).await;
    send_json(
        &mut ws,
        json!({"type": "res", "id": frame["id"], "ok": false, "error": {"code": "INVALID_REQUEST", "message": "unknown method: nope", "details": {"method": "nope"}}}),
    )
    .await;
    match call.await.expect("join") {
        Err(GatewayError::Rejected { message, code, details }) => {
            assert_eq!(message, "unknown method: nope");
            assert_eq!(code.as_deref(), Some("INVALID_REQUEST"));
            assert_eq!(details, Some(json!({"method": "nope"})));
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.request("bare", json!({})).await })
    };
    let frame = next_frame(&mut ws).await;
    send_json(&mut ws, json!({"type": "res", "id": frame["id"], "ok": false})).await;
    let err = call.await.expect("join").expect_err("rejected");
    assert_eq!(err.to_string(), "request failed");
    client.stop();
}

#[tokio::test]
async fn test_typed_request() {
    #[derive(Debug, serde::Deserialize)]
    struct Health {
        ok: bool,
        uptime: u64,
    }

    let gateway = MockGateway::new().await;
    let (client, mut rx) = new_client(fast_options(&gateway.url()));
    client.start();
    let mut ws = gateway.accept_hello(hello_ok()).await;
    wait_hello(&mut rx).await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.request_as::<Health, _>("health", json!({})).await })
    };
    let frame = next_frame(&mut ws).await;
    reply_ok(
        &mut ws,
        frame["id"].as_str().expect("id"),
        json!({"ok": true, "uptime": 12}),
    )
    .await;

    let health = call.await.expect("join").expect("health");
    assert!(health.ok);
    assert_eq!(health.uptime, 12);
    client.stop();
}

#[tokio::test]
async fn test_device_admin_helpers() {
    let gateway = MockGateway::new().await;
    let (client, mut rx) = new_client(fast_options(&gateway.url()));
    client.start();
    let mut ws = gateway.accept_hello(hello_ok()).await;
    wait_hello(&mut rx).await;
    let device_id = client.identity().ensure_identity().device_id;

    let list = {
        let client = client.clone();
        tokio::spawn(async move { client.list_pairings().await })
    };
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["method"], "device.pair.list");
    reply_ok(
        &mut ws,
        frame["id"].as_str().expect("id"),
        json!({"pending": [{"requestId": "r1", "deviceId": "other", "ts": 1}], "paired": []}),
    )
    .await;
    let list = list.await.expect("join").expect("list");
    assert_eq!(list.pending[0].request_id, "r1");

    let rotate = {
        let client = client.clone();
        let device_id = device_id.clone();
        tokio::spawn(async move {
            client
                .rotate_token(&device_id, "operator", &["operator.read".to_string()])
                .await
        })
    };
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["method"], "device.token.rotate");
    assert_eq!(frame["params"]["scopes"], json!(["operator.read"]));
    reply_ok(
        &mut ws,
        frame["id"].as_str().expect("id"),
        json!({"deviceId": device_id, "role": "operator", "token": "rotated", "scopes": ["operator.read"]}),
    )
    .await;
    rotate.await.expect("join").expect("rotate");
    assert_eq!(
        client.tokens().get(&device_id, "operator").expect("cached").token,
        "rotated"
    );

    let revoke = {
        let client = client.clone();
        let device_id = device_id.clone();
        tokio::spawn(async move { client.revoke_token(&device_id, "operator").await })
    };
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["method"], "device.token.revoke");
    reply_ok(
        &mut ws,
        frame["id"].as_str().expect("id"),
        json!({"deviceId": device_id, "role": "operator", "revokedAtMs": 5}),
    )
    .await;
    revoke.await.expect("join").expect("revoke");
    assert!(client.tokens().get(&device_id, "operator").is_none());
    client.stop();
}

// ============================================================================
// Close and reconnect
// ============================================================================

#[tokio::test]
async fn test_close_rejects_pending_and_reconnects() {
    let gateway = MockGateway::new().await;
    let (client, mut rx) = new_client(fast_options(&gateway.url()));
    client.start();
    let mut ws = gateway.accept_hello(hello_ok()).await;
    wait_hello(&mut rx).await;

    let mut calls = Vec::new();
    for i in 0..3 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            client.request("slow", json!({"i": i})).await
        }));
        next_frame(&mut ws).await;
    }
    assert_eq!(client.pending_requests(), 3);

    ws.close(Some(CloseFrame {
        code: CloseCode::Restart,
        reason: "restart".into(),
    }))
    .await
    .expect("close");

    for call in calls {
        match call.await.expect("join") {
            Err(GatewayError::Closed { code, reason }) => {
                assert_eq!(code, 1012);
                assert_eq!(reason, "restart");
            }
            other => panic!("expected close error, got {other:?}"),
        }
    }
    assert_eq!(client.pending_requests(), 0);

    let closed = wait_for(&mut rx, |n| matches!(n, GatewayNotification::Closed(_))).await;
    assert!(matches!(closed, GatewayNotification::Closed(c) if c.code == 1012));

    let _ws = gateway.accept_hello(hello_ok()).await;
    wait_hello(&mut rx).await;
    assert_eq!(client.connection_state(), ConnectionState::Open);
    client.stop();
}

#[tokio::test]
async fn test_stop_prevents_reconnect_until_restarted() {
    let gateway = MockGateway::new().await;
    let (client, mut rx) = new_client(fast_options(&gateway.url()));
    client.start();
    let mut ws = gateway.accept_hello(hello_ok()).await;
    wait_hello(&mut rx).await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.request("slow", json!({})).await })
    };
    next_frame(&mut ws).await;

    client.stop();
    assert!(matches!(call.await.expect("join"), Err(GatewayError::Stopped)));
    assert!(!client.is_connected());
    match next_message(&mut ws).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1000),
        other => panic!("expected close frame, got {other:?}"),
    }

    assert!(
        timeout(Duration::from_millis(400), gateway.listener.accept())
            .await
            .is_err(),
        "stopped client must not reconnect"
    );
    assert_eq!(client.connection_state(), ConnectionState::Stopped);

    client.start();
    client.start();
    let _ws = gateway.accept_hello(hello_ok()).await;
    wait_hello(&mut rx).await;
    assert!(
        timeout(Duration::from_millis(300), gateway.listener.accept())
            .await
            .is_err(),
        "a second start must not open another transport"
    );
    client.stop();
}

#[tokio::test]
async fn test_unreachable_gateway_keeps_retrying() {
    let gateway = MockGateway::new().await;
    let url = gateway.url();
    drop(gateway);

    let (client, mut rx) = new_client(fast_options(&url));
    client.start();

    for _ in 0..2 {
        let closed = wait_for(&mut rx, |n| matches!(n, GatewayNotification::Closed(_))).await;
        assert!(matches!(closed, GatewayNotification::Closed(c) if c.code == 1006));
    }
    client.stop();
    timeout(WAIT, async {
        while client.connection_state() != ConnectionState::Stopped {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("driver settles in stopped state");
    assert!(!client.is_connected());
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test]
async fn test_events_gaps_and_malformed_frames() {
    let gateway = MockGateway::new().await;
    let (client, mut rx) = new_client(fast_options(&gateway.url()));
    client.start();
    let mut ws = gateway.accept_hello(hello_ok()).await;
    wait_hello(&mut rx).await;

    send_json(&mut ws, json!({"type": "event", "event": "presence", "payload": {"n": 1}, "seq": 3})).await;
    ws.send(Message::Text("definitely not json".into()))
        .await
        .expect("send");
    send_json(&mut ws, json!({"type": "mystery"})).await;
    send_json(&mut ws, json!({"type": "event", "event": "presence", "payload": {"n": 2}, "seq": 5})).await;
    send_json(&mut ws, json!({"type": "event", "event": "presence", "payload": {"n": 3}, "seq": 6})).await;

    let mut seen = Vec::new();
    while seen.len() < 4 {
        let n = wait_for(&mut rx, |_| true).await;
        seen.push(n);
    }

    assert!(matches!(&seen[0], GatewayNotification::Event(e) if e.seq == Some(3)));
    assert!(matches!(
        &seen[1],
        GatewayNotification::Gap(SequenceGap { expected: 4, received: 5 })
    ));
    assert!(matches!(&seen[2], GatewayNotification::Event(e) if e.seq == Some(5)));
    assert!(matches!(&seen[3], GatewayNotification::Event(e) if e.seq == Some(6)));
    assert_eq!(client.last_seq(), Some(6));
    assert_eq!(client.connection_state(), ConnectionState::Open);
    client.stop();
}

struct FlakyHandler {
    delivered: Arc<AtomicUsize>,
}

impl GatewayHandler for FlakyHandler {
    fn on_event(&self, event: &EventFrame) {
        if event.event == "boom" {
            panic!("handler failure");
        }
        self.delivered.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_dispatch() {
    let gateway = MockGateway::new().await;
    let delivered = Arc::new(AtomicUsize::new(0));
    let client = GatewayClient::new(
        fast_options(&gateway.url()),
        Arc::new(MemoryStore::new()),
        FlakyHandler {
            delivered: Arc::clone(&delivered),
        },
    );
    client.start();
    let mut ws = gateway.accept_hello(hello_ok()).await;

    send_json(&mut ws, json!({"type": "event", "event": "boom", "payload": {}})).await;
    send_json(&mut ws, json!({"type": "event", "event": "tick", "payload": {}})).await;

    timeout(WAIT, async {
        while delivered.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("event after panic delivered");

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.request("health", json!({})).await })
    };
    let frame = next_frame(&mut ws).await;
    reply_ok(&mut ws, frame["id"].as_str().expect("id"), json!({"ok": true})).await;
    assert!(call.await.expect("join").is_ok());
    client.stop();
}

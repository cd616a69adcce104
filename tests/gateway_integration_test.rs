//! 网关集成测试：本地起一个假的 NapCat WebSocket 服务，走真实的会话 + 关联表

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use napbot::core::GatewayError;
use napbot::gateway::{
    CorrelationRegistry, EventSink, FrameRouter, InboundEvent, MessageSegment, NapCatApi,
    SessionConfig, SessionState, TransportSession,
};
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type ServerWs = WebSocketStream<TcpStream>;

/// 接受一条连接，返回连接与握手时的 Authorization 头
async fn accept_one(listener: &TcpListener) -> (ServerWs, Option<String>) {
    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("accept timed out")
        .unwrap();
    let auth = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&auth);
    let ws = tokio_tungstenite::accept_hdr_async(
        stream,
        move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            *captured.lock().unwrap() = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            Ok(resp)
        },
    )
    .await
    .unwrap();
    let auth = auth.lock().unwrap().clone();
    (ws, auth)
}

async fn next_json(ws: &mut ServerWs) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no frame from client")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn wait_state(session: &TransportSession, expected: SessionState) {
    let mut rx = session.subscribe();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == expected))
        .await
        .expect("state not reached")
        .unwrap();
}

struct Harness {
    listener: TcpListener,
    session: Arc<TransportSession>,
    registry: Arc<CorrelationRegistry>,
}

async fn harness(token: Option<&str>, timeout: Duration) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let session = Arc::new(TransportSession::new(SessionConfig {
        access_token: token.map(String::from),
        reconnect_delay: Duration::from_millis(50),
        ..SessionConfig::new("api", &url)
    }));
    let registry = Arc::new(CorrelationRegistry::new(session.clone(), timeout));
    Harness {
        listener,
        session,
        registry,
    }
}

impl Harness {
    fn start_api_router(&self) {
        let rx = self.session.start().unwrap();
        tokio::spawn(FrameRouter::for_api("api", Arc::clone(&self.registry)).run(rx));
    }
}

#[tokio::test]
async fn test_not_connected_before_open() {
    let h = harness(None, Duration::from_secs(2)).await;
    assert_eq!(
        h.registry.send("get_status", json!({})).await,
        Err(GatewayError::NotConnected)
    );
    assert_eq!(h.registry.pending_count(), 0);
}

#[tokio::test]
async fn test_not_connected_while_handshake_pending() {
    let h = harness(None, Duration::from_secs(2)).await;
    h.start_api_router();

    // 只接受 TCP，不回应 WebSocket 升级，会话停在 Connecting
    let (mut stream, _) = tokio::time::timeout(Duration::from_secs(5), h.listener.accept())
        .await
        .expect("accept timed out")
        .unwrap();
    let mut upgrade = Vec::new();
    while !upgrade.windows(4).any(|w| w == b"\r\n\r\n") {
        let mut buf = [0u8; 1024];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("no upgrade request")
            .unwrap();
        assert!(n > 0, "client closed before upgrade");
        upgrade.extend_from_slice(&buf[..n]);
    }
    assert!(upgrade.starts_with(b"GET "));
    wait_state(&h.session, SessionState::Connecting).await;

    assert_eq!(
        h.registry.send("get_status", json!({})).await,
        Err(GatewayError::NotConnected)
    );
    assert_eq!(h.registry.pending_count(), 0);

    // 升级请求之后客户端不应再写任何东西
    let mut rest = [0u8; 256];
    assert!(
        tokio::time::timeout(Duration::from_millis(150), stream.read(&mut rest))
            .await
            .is_err()
    );
    assert_eq!(h.session.state(), SessionState::Connecting);
    h.session.stop();
}

#[tokio::test]
async fn test_bearer_header_and_success_round_trip() {
    let h = harness(Some("secret"), Duration::from_secs(2)).await;
    h.start_api_router();

    let (mut ws, auth) = accept_one(&h.listener).await;
    assert_eq!(auth.as_deref(), Some("Bearer secret"));
    wait_state(&h.session, SessionState::Open).await;

    let api = NapCatApi::new(Arc::clone(&h.registry));
    let call = tokio::spawn(async move {
        api.send_group_msg(
            100,
            vec![
                MessageSegment::Reply { id: "7".into() },
                MessageSegment::Text { text: "hi".into() },
            ],
        )
        .await
    });

    let req = next_json(&mut ws).await;
    assert_eq!(req["action"], "send_group_msg");
    assert_eq!(req["params"]["group_id"], 100);
    assert_eq!(req["params"]["message"][0]["type"], "reply");
    let echo = req["echo"].as_str().unwrap().to_string();
    assert!(echo.starts_with("send_group_msg_"));

    // 无 echo 的帧与事件帧不会被当成响应
    ws.send(Message::Text(json!({"status": "ok", "data": {}}).to_string()))
        .await
        .unwrap();
    ws.send(Message::Text(
        json!({"post_type": "meta_event", "echo": echo}).to_string(),
    ))
    .await
    .unwrap();
    ws.send(Message::Text(
        json!({"status": "ok", "retcode": 0, "data": {"message_id": 9}, "echo": echo}).to_string(),
    ))
    .await
    .unwrap();

    assert_eq!(call.await.unwrap(), Ok(9));
    assert_eq!(h.registry.pending_count(), 0);
    h.session.stop();
}

#[tokio::test]
async fn test_remote_error_is_surfaced() {
    let h = harness(None, Duration::from_secs(2)).await;
    h.start_api_router();
    let (mut ws, auth) = accept_one(&h.listener).await;
    assert!(auth.is_none());
    wait_state(&h.session, SessionState::Open).await;

    let registry = Arc::clone(&h.registry);
    let call = tokio::spawn(async move { registry.send("get_msg", json!({"message_id": 1})).await });

    let req = next_json(&mut ws).await;
    ws.send(Message::Text(
        json!({"status": "failed", "retcode": 1400, "wording": "消息不存在", "echo": req["echo"]})
            .to_string(),
    ))
    .await
    .unwrap();

    assert_eq!(
        call.await.unwrap(),
        Err(GatewayError::RemoteError("消息不存在".to_string()))
    );
    h.session.stop();
}

#[tokio::test]
async fn test_timeout_removes_pending_entry() {
    let h = harness(None, Duration::from_millis(100)).await;
    h.start_api_router();
    let (mut ws, _) = accept_one(&h.listener).await;
    wait_state(&h.session, SessionState::Open).await;

    let registry = Arc::clone(&h.registry);
    let call = tokio::spawn(async move { registry.send("get_status", json!({})).await });
    let req = next_json(&mut ws).await;

    assert_eq!(call.await.unwrap(), Err(GatewayError::Timeout));
    assert_eq!(h.registry.pending_count(), 0);

    // 过期后才到的响应直接丢弃
    ws.send(Message::Text(
        json!({"status": "ok", "data": {}, "echo": req["echo"]}).to_string(),
    ))
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.registry.pending_count(), 0);
    h.session.stop();
}

#[tokio::test]
async fn test_connection_lost_then_reconnect() {
    let h = harness(None, Duration::from_secs(5)).await;
    h.start_api_router();
    let (mut ws, _) = accept_one(&h.listener).await;
    wait_state(&h.session, SessionState::Open).await;

    let mut calls = Vec::new();
    for _ in 0..3 {
        let registry = Arc::clone(&h.registry);
        calls.push(tokio::spawn(async move {
            registry.send("get_status", json!({})).await
        }));
    }
    for _ in 0..3 {
        next_json(&mut ws).await;
    }
    assert_eq!(h.registry.pending_count(), 3);

    ws.close(None).await.unwrap();
    drop(ws);

    for call in calls {
        assert_eq!(call.await.unwrap(), Err(GatewayError::ConnectionLost));
    }
    assert_eq!(h.registry.pending_count(), 0);

    // 仍在运行，固定延迟后自动重连
    let (_ws, _) = accept_one(&h.listener).await;
    wait_state(&h.session, SessionState::Open).await;
    h.session.stop();
    assert_eq!(h.session.state(), SessionState::Stopped);
}

struct CollectingSink(Mutex<Vec<InboundEvent>>);

impl EventSink for CollectingSink {
    fn on_event(&self, event: InboundEvent) {
        self.0.lock().unwrap().push(event);
    }
}

#[tokio::test]
async fn test_event_session_delivers_events() {
    let h = harness(None, Duration::from_secs(2)).await;
    let sink = Arc::new(CollectingSink(Mutex::new(Vec::new())));
    let rx = h.session.start().unwrap();
    let dyn_sink: Arc<dyn EventSink> = sink.clone();
    tokio::spawn(FrameRouter::for_events("event", Arc::clone(&h.registry), dyn_sink).run(rx));

    let (mut ws, _) = accept_one(&h.listener).await;
    wait_state(&h.session, SessionState::Open).await;

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    ws.send(Message::Text(
        json!({
            "post_type": "message",
            "message_type": "group",
            "group_id": 100,
            "user_id": 5,
            "self_id": 42,
            "message_id": 1,
            "raw_message": "**hello**",
            "sender": {"nickname": "阿五", "role": "member"}
        })
        .to_string(),
    ))
    .await
    .unwrap();

    for _ in 0..100 {
        if !sink.0.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let events = sink.0.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].group_message_id(), Some(100));
    assert_eq!(events[0].raw_text, "**hello**");
    assert_eq!(events[0].sender.display_name(), "阿五");
    drop(events);
    h.session.stop();
}

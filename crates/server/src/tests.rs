use super::*;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;
use townhall_engine::{BrokerError, Endpoint, LocalBroker, RecordStream, TopicStatus};
use townhall_protocol::{ChatMessage, ErrorBody, Offset, Record, RecordMetadata, TopicSpec};

const TOPIC: &str = "chat-messages";

async fn memory_state() -> (Arc<LocalBroker>, AppState) {
    let broker = Arc::new(LocalBroker::memory());
    let service = Arc::new(StreamingService::in_process(broker.clone()));
    service.initialize(&Endpoint::default()).await.unwrap();
    service
        .ensure_topic(TOPIC, &TopicConfig::default())
        .await
        .unwrap();
    (broker, AppState::new(service, TOPIC))
}

fn app(state: AppState) -> Router {
    build_router(Arc::new(state), relay_cors(&[]))
}

async fn post_json(app: Router, body: &str) -> (StatusCode, serde_json::Value) {
    let resp = app
        .oneshot(
            Request::post("/send-message")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn backlog(state: &AppState) -> Vec<Record> {
    let mut out = Vec::new();
    let mut records = state.consumer.stream(Offset::Beginning).await.unwrap();
    while let Ok(Some(next)) = tokio::time::timeout(Duration::from_millis(100), records.next()).await {
        out.push(next.unwrap());
    }
    out
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn free_addr() -> SocketAddr {
    let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap()
}

struct RunningRelay {
    http: SocketAddr,
    ws: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for RunningRelay {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn spawn_relay(state: AppState) -> RunningRelay {
    let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (http_addr, ws_addr) = (http.local_addr().unwrap(), ws.local_addr().unwrap());
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(serve_relay_listeners(http, ws, state, relay_cors(&[]), async {
        let _ = rx.await;
    }));
    RunningRelay {
        http: http_addr,
        ws: ws_addr,
        stop: Some(tx),
    }
}

#[tokio::test]
async fn health_is_ok() {
    let (_broker, state) = memory_state().await;
    let resp = app(state)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn posted_chat_gets_defaults_and_lands_in_topic() {
    let (_broker, state) = memory_state().await;
    let (status, body) = post_json(
        app(state.clone()),
        r#"{"type":"chat","sender":"Alice","message":"hello"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({"success": true}));

    let records = backlog(&state).await;
    assert_eq!(records.len(), 1);
    let msg: ChatMessage = records[0].decode().unwrap();
    assert!(!msg.id().is_empty() && msg.id().chars().all(|c| c.is_ascii_digit()));
    assert_eq!(records[0].key, msg.id());
    assert_eq!(msg.kind.as_deref(), Some("chat"));
    assert_eq!(msg.sender.as_deref(), Some("Alice"));
    assert_eq!(msg.message.as_deref(), Some("hello"));
    let ts = msg.timestamp.unwrap();
    assert!(ts.ends_with('Z') && ts.contains('T'), "{ts}");
}

#[tokio::test]
async fn caller_supplied_fields_are_kept() {
    let (_broker, state) = memory_state().await;
    let (status, _) = post_json(
        app(state.clone()),
        r#"{"id":"m-1","message":"hi","timestamp":"2024-01-01T00:00:00.000Z"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let records = backlog(&state).await;
    assert_eq!(records[0].key, "m-1");
    let msg: ChatMessage = records[0].decode().unwrap();
    assert_eq!(msg.timestamp.as_deref(), Some("2024-01-01T00:00:00.000Z"));
    assert_eq!(msg.kind, None);
}

#[tokio::test]
async fn empty_body_still_sends_a_message() {
    let (_broker, state) = memory_state().await;
    let (status, _) = post_json(app(state.clone()), "{}").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(backlog(&state).await.len(), 1);
}

#[tokio::test]
async fn numeric_fields_are_accepted_as_text() {
    let (_broker, state) = memory_state().await;
    let (status, body) = post_json(
        app(state.clone()),
        r#"{"id":1700000000000,"sender":"Bob","message":42}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({"success": true}));

    let records = backlog(&state).await;
    assert_eq!(records[0].key, "1700000000000");
    let msg: ChatMessage = records[0].decode().unwrap();
    assert_eq!(msg.id(), "1700000000000");
    assert_eq!(msg.message.as_deref(), Some("42"));
}

#[tokio::test]
async fn malformed_body_is_a_json_400() {
    let (_broker, state) = memory_state().await;
    let (status, body) = post_json(app(state.clone()), r#"{"message": "unterminated"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("invalid message body"));
    assert!(backlog(&state).await.is_empty());
}

#[tokio::test]
async fn send_after_disconnect_is_503() {
    let (_broker, state) = memory_state().await;
    state.service.disconnect();
    let (status, body) = post_json(app(state), r#"{"message":"hi"}"#).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, serde_json::json!({"error": "Fluvio not initialized"}));
}

#[tokio::test]
async fn broker_failure_is_500_with_message() {
    let broker = Arc::new(LocalBroker::memory());
    let service = Arc::new(StreamingService::in_process(broker));
    service.initialize(&Endpoint::default()).await.unwrap();
    // Topic never created.
    let (status, body) = post_json(app(AppState::new(service, TOPIC)), r#"{"message":"x"}"#).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "topic not found: chat-messages");
}

#[tokio::test]
async fn cors_allows_local_origins_only() {
    let (_broker, state) = memory_state().await;
    let router = build_router(Arc::new(state), relay_cors(&["https://town.example/".to_string()]));
    for (origin, allowed) in [
        ("http://localhost:5173", true),
        ("http://127.0.0.1:3000", true),
        ("https://town.example", true),
        ("http://localhost.evil.com", false),
        ("https://evil.com", false),
    ] {
        let resp = router
            .clone()
            .oneshot(
                Request::get("/health")
                    .header("origin", origin)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let header = resp.headers().get("access-control-allow-origin");
        assert_eq!(header.is_some(), allowed, "{origin}");
    }
}

#[tokio::test]
async fn every_websocket_client_gets_every_later_message_in_order() {
    let (broker, state) = memory_state().await;
    // Sent before anyone connects; clients start at the end.
    state.producer.send("old", r#"{"id":"old"}"#).await.unwrap();
    let relay = spawn_relay(state).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/", relay.ws))
            .await
            .unwrap();
        clients.push(ws);
    }
    wait_until(|| broker.subscriber_count(TOPIC, 0) == 3).await;

    let http = reqwest::Client::new();
    for i in 0..3 {
        let resp = http
            .post(format!("http://{}/send-message", relay.http))
            .json(&serde_json::json!({"id": format!("m{i}"), "message": format!("msg {i}")}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    for ws in clients.iter_mut() {
        let mut ids = Vec::new();
        while ids.len() < 3 {
            let frame = tokio::time::timeout(Duration::from_secs(3), ws.next())
                .await
                .expect("frame in time")
                .unwrap()
                .unwrap();
            if let Message::Text(text) = frame {
                let msg: ChatMessage = serde_json::from_str(text.as_str()).unwrap();
                ids.push(msg.id().to_string());
            }
        }
        assert_eq!(ids, vec!["m0", "m1", "m2"]);
    }
}

#[tokio::test]
async fn any_path_upgrades() {
    let (broker, state) = memory_state().await;
    let relay = spawn_relay(state).await;
    let (_ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/some/room", relay.ws))
        .await
        .unwrap();
    wait_until(|| broker.subscriber_count(TOPIC, 0) == 1).await;
}

#[tokio::test]
async fn closing_the_socket_releases_the_consumer() {
    let (broker, state) = memory_state().await;
    let relay = spawn_relay(state).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/", relay.ws))
        .await
        .unwrap();
    wait_until(|| broker.subscriber_count(TOPIC, 0) == 1).await;

    ws.close(None).await.unwrap();
    drop(ws);
    wait_until(|| broker.subscriber_count(TOPIC, 0) == 0).await;
}

#[tokio::test]
async fn websocket_without_broker_gets_error_then_1013() {
    let (_broker, state) = memory_state().await;
    state.service.disconnect();
    let relay = spawn_relay(state).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/", relay.ws))
        .await
        .unwrap();

    let first = ws.next().await.unwrap().unwrap();
    let body: ErrorBody = serde_json::from_str(first.to_text().unwrap()).unwrap();
    assert_eq!(body.error, "Fluvio not initialized");
    match ws.next().await.unwrap().unwrap() {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1013),
        other => panic!("expected close, got {other:?}"),
    }
}

/// Wraps a local broker; the first consumer stream yields an error before
/// any record.
struct FirstStreamFails {
    inner: Arc<LocalBroker>,
    failed: AtomicBool,
}

#[async_trait::async_trait]
impl Broker for FirstStreamFails {
    fn kind(&self) -> &'static str {
        "first-stream-fails"
    }

    async fn create_topic(&self, name: &str, config: &TopicConfig) -> townhall_engine::Result<()> {
        self.inner.create_topic(name, config).await
    }

    async fn topics(&self) -> townhall_engine::Result<Vec<TopicSpec>> {
        self.inner.topics().await
    }

    async fn send(&self, topic: &str, key: &str, value: &str) -> townhall_engine::Result<RecordMetadata> {
        self.inner.send(topic, key, value).await
    }

    async fn stream(
        &self,
        topic: &str,
        partition: u32,
        offset: Offset,
    ) -> townhall_engine::Result<RecordStream> {
        let records = self.inner.stream(topic, partition, offset).await?;
        if self.failed.swap(true, Ordering::SeqCst) {
            return Ok(records);
        }
        let failure = stream::once(async {
            Err::<Record, _>(BrokerError::Stream("partition reader lost".to_string()))
        });
        let records: RecordStream = Box::pin(failure.chain(records));
        Ok(records)
    }
}

#[tokio::test]
async fn stream_failure_closes_that_client_with_1011_only() {
    let local = Arc::new(LocalBroker::memory());
    let broker = Arc::new(FirstStreamFails {
        inner: local.clone(),
        failed: AtomicBool::new(false),
    });
    let service = Arc::new(StreamingService::in_process(broker));
    service.initialize(&Endpoint::default()).await.unwrap();
    service
        .ensure_topic(TOPIC, &TopicConfig::default())
        .await
        .unwrap();
    let relay = spawn_relay(AppState::new(service, TOPIC)).await;

    let (mut failing, _) = tokio_tungstenite::connect_async(format!("ws://{}/", relay.ws))
        .await
        .unwrap();
    let first = tokio::time::timeout(Duration::from_secs(3), failing.next())
        .await
        .expect("error frame in time")
        .unwrap()
        .unwrap();
    assert_eq!(first.to_text().unwrap(), r#"{"error":"Streaming error"}"#);
    match failing.next().await.unwrap().unwrap() {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1011),
        other => panic!("expected close, got {other:?}"),
    }
    wait_until(|| local.subscriber_count(TOPIC, 0) == 0).await;

    let (mut healthy, _) = tokio_tungstenite::connect_async(format!("ws://{}/", relay.ws))
        .await
        .unwrap();
    wait_until(|| local.subscriber_count(TOPIC, 0) == 1).await;
    let resp = reqwest::Client::new()
        .post(format!("http://{}/send-message", relay.http))
        .json(&serde_json::json!({"id": "after-failure", "message": "still here"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let frame = tokio::time::timeout(Duration::from_secs(3), healthy.next())
        .await
        .expect("frame in time")
        .unwrap()
        .unwrap();
    let msg: ChatMessage = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(msg.id(), "after-failure");
}

#[tokio::test]
async fn startup_fails_when_broker_is_unreachable() {
    let config = RelayConfig {
        broker_endpoint: Endpoint::from(free_addr()),
        connect_timeout_ms: 300,
        connect_attempts: 2,
        ws_port: 0,
        port: 0,
        ..RelayConfig::default()
    };
    let err = run_relay(config, std::future::pending()).await.unwrap_err();
    let root = err.root_cause().to_string();
    assert!(root.contains("broker unreachable"), "{err:#}");
}

#[tokio::test]
async fn relay_starts_on_in_process_backends() {
    for backend in [config::BackendKind::Memory, config::BackendKind::Mock] {
        let config = RelayConfig {
            broker: backend,
            ..RelayConfig::default()
        };
        let state = connect_relay(&config).await.unwrap();
        assert!(state.producer.is_ready());
        assert_eq!(state.producer.topic(), "chat-messages");
    }
}

async fn spawn_broker_node(broker: Arc<LocalBroker>) -> (SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(serve_broker_listener(listener, broker, async {
        let _ = rx.await;
    }));
    (addr, tx)
}

#[tokio::test]
async fn remote_backend_talks_to_a_broker_node() {
    let node = Arc::new(LocalBroker::memory());
    let (addr, _stop) = spawn_broker_node(node.clone()).await;

    let service = Arc::new(StreamingService::new(townhall_engine::Backend::Remote));
    service.initialize(&Endpoint::from(addr)).await.unwrap();
    let cfg = TopicConfig::default();
    assert_eq!(service.ensure_topic("t", &cfg).await.unwrap(), TopicStatus::Created);
    assert_eq!(service.ensure_topic("t", &cfg).await.unwrap(), TopicStatus::Existing);

    let producer = service.producer("t");
    producer.send("k", "one").await.unwrap();
    producer.send("k", "two").await.unwrap();

    let consumer = service.consumer("t", 0);
    let mut records = consumer.stream(Offset::Beginning).await.unwrap();
    let first = records.next().await.unwrap().unwrap();
    let second = records.next().await.unwrap().unwrap();
    assert_eq!((first.offset, first.value.as_str()), (0, "one"));
    assert_eq!((second.offset, second.value.as_str()), (1, "two"));
    wait_until(|| node.subscriber_count("t", 0) == 1).await;

    drop(records);
    wait_until(|| node.subscriber_count("t", 0) == 0).await;

    let topics = service.broker().unwrap().topics().await.unwrap();
    assert_eq!(topics.len(), 1);
    assert_eq!(topics[0].name, "t");
}

#[tokio::test]
async fn broker_node_errors_come_back_typed() {
    let node = Arc::new(LocalBroker::memory());
    let (addr, _stop) = spawn_broker_node(node).await;
    let service = Arc::new(StreamingService::new(townhall_engine::Backend::Remote));
    service.initialize(&Endpoint::from(addr)).await.unwrap();
    service
        .ensure_topic("t", &TopicConfig::default())
        .await
        .unwrap();

    let missing = service.consumer("nope", 0).stream(Offset::End).await;
    assert!(matches!(missing, Err(BrokerError::TopicNotFound(_))));
    let bad_partition = service.consumer("t", 4).stream(Offset::End).await;
    assert!(matches!(
        bad_partition,
        Err(BrokerError::PartitionNotFound { partition: 4, .. })
    ));
    let unsent = service.producer("nope").send("", "x").await;
    assert!(matches!(unsent, Err(BrokerError::TopicNotFound(_))));
}

#[tokio::test]
async fn oversized_topic_is_rejected_with_400() {
    let router = build_broker_router(Arc::new(LocalBroker::memory()));
    let resp = router
        .oneshot(
            Request::put("/topics/huge")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"partitions":4294967295,"replication_factor":1,"ignore_rack_assignment":true}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body.code.as_deref(), Some("invalid_config"));
}

#[tokio::test]
async fn relay_over_broker_node_end_to_end() {
    let node = Arc::new(LocalBroker::memory());
    let (addr, _stop) = spawn_broker_node(node.clone()).await;

    let config = RelayConfig {
        broker_endpoint: Endpoint::from(addr),
        ..RelayConfig::default()
    };
    let state = connect_relay(&config).await.unwrap();
    let relay = spawn_relay(state).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/", relay.ws))
        .await
        .unwrap();
    wait_until(|| node.subscriber_count(TOPIC, 0) == 1).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{}/send-message", relay.http))
        .json(&serde_json::json!({"type": "chat", "sender": "Alice", "message": "hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let frame = tokio::time::timeout(Duration::from_secs(3), ws.next())
        .await
        .expect("frame in time")
        .unwrap()
        .unwrap();
    let msg: ChatMessage = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(msg.sender.as_deref(), Some("Alice"));
    assert_eq!(msg.message.as_deref(), Some("hello"));
}

//! Integration tests for the relay HTTP + WebSocket surface.
//!
//! Each test starts the full service on a random port with an in-memory
//! store, connects via tokio-tungstenite, and drives the public contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{Json, Router, routing::post};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use chat_relay::auth::StaticTokenAuthenticator;
use chat_relay::config::{QueueBacking, RelayConfig, UpstreamConfig};
use chat_relay::error::UpstreamError;
use chat_relay::service::{RelayService, ServiceDeps};
use chat_relay::store::LibSqlStore;
use chat_relay::upstream::{Assist, AssistClient, AssistReply, AssistRequest};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const TOKEN: &str = "test-token";

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Upstream that answers slowly.
struct SlowAssist(Duration);

#[async_trait]
impl Assist for SlowAssist {
    async fn assist(&self, request: AssistRequest) -> Result<AssistReply, UpstreamError> {
        tokio::time::sleep(self.0).await;
        Ok(AssistReply {
            response: format!("slow: {}", request.user.content),
            docs: Vec::new(),
        })
    }
}

/// Upstream that always fails.
struct DownAssist;

#[async_trait]
impl Assist for DownAssist {
    async fn assist(&self, _request: AssistRequest) -> Result<AssistReply, UpstreamError> {
        Err(UpstreamError::Status {
            status: 503,
            snippet: "maintenance".into(),
        })
    }
}

/// Stub assist service speaking the real HTTP protocol.
async fn start_stub_upstream() -> String {
    async fn assist(Json(body): Json<Value>) -> Json<Value> {
        let content = body["user"]["content"].as_str().unwrap_or_default();
        Json(json!({"response": format!("You said: {content}"), "docs": [{"title": "doc"}]}))
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, Router::new().route("/assist", post(assist)))
            .await
            .unwrap();
    });
    format!("http://{addr}")
}

fn test_config(upstream_url: &str) -> RelayConfig {
    RelayConfig {
        port: 0,
        queue: QueueBacking::Memory,
        upstream: UpstreamConfig {
            base_url: upstream_url.to_string(),
            backoff: Duration::from_millis(10),
            attempt_timeout: Some(Duration::from_secs(2)),
            ..Default::default()
        },
        api_tokens: HashMap::from([(TOKEN.to_string(), "user-1".to_string())]),
        ..Default::default()
    }
}

/// Start the relay on a random port, return (port, service).
async fn start_relay(assist: Option<Arc<dyn Assist>>) -> (u16, RelayService) {
    let upstream_url = start_stub_upstream().await;
    let config = test_config(&upstream_url);
    let assist = assist.unwrap_or_else(|| Arc::new(AssistClient::new(&config.upstream)));

    let deps = ServiceDeps {
        store: Arc::new(LibSqlStore::new_memory().await.unwrap()),
        journal: None,
        assist,
        auth: Arc::new(StaticTokenAuthenticator::new(config.api_tokens.clone())),
    };
    let service = RelayService::start(&config, deps).await.unwrap();
    let app = service.app();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, service)
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

/// Read frames until one with the given event name arrives.
async fn next_event(ws: &mut Ws, name: &str) -> Value {
    loop {
        let msg = ws.next().await.expect("socket closed").expect("ws error");
        let json = parse_ws_json(&msg);
        if json["event"] == name {
            return json["data"].clone();
        }
    }
}

/// Connect and consume the greeting, returning the assigned client id.
async fn connect(port: u16) -> (Ws, String) {
    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .expect("WS connect failed");
    let session = next_event(&mut ws, "session").await;
    let client_id = session["clientId"].as_str().unwrap().to_string();
    (ws, client_id)
}

async fn post_chat(port: u16, client_id: &str, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/api/chat"))
        .bearer_auth(TOKEN)
        .header("x-client-id", client_id)
        .json(&body)
        .send()
        .await
        .unwrap()
}

async fn enqueue(port: u16, client_id: &str, message: &str) -> String {
    let resp = post_chat(port, client_id, json!({"message": message})).await;
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    body["result"]["jobId"].as_str().unwrap().to_string()
}

// ── WebSocket Tests ──────────────────────────────────────────────────

#[tokio::test]
async fn ws_connect_receives_session_then_stats() {
    timeout(TEST_TIMEOUT, async {
        let (port, _service) = start_relay(None).await;
        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .unwrap();

        let first = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(first["event"], "session");
        assert!(first["data"]["clientId"].as_str().is_some());

        let second = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(second["event"], "queue:stats");
        assert_eq!(
            second["data"],
            json!({"waiting": 0, "delayed": 0, "active": 0, "length": 0})
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_stats_request_is_answered() {
    timeout(TEST_TIMEOUT, async {
        let (port, _service) = start_relay(None).await;
        let (mut ws, _) = connect(port).await;
        let _ = next_event(&mut ws, "queue:stats").await;

        ws.send(Message::Text(json!({"event": "queue:stats"}).to_string().into()))
            .await
            .unwrap();
        let stats = next_event(&mut ws, "queue:stats").await;
        assert_eq!(stats["length"], 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn chat_round_trip_delivers_response() {
    timeout(TEST_TIMEOUT, async {
        let (port, _service) = start_relay(None).await;
        let (mut ws, client_id) = connect(port).await;

        let job_id = enqueue(port, &client_id, "hello").await;
        let waiting = next_event(&mut ws, "chat:waiting").await;
        assert_eq!(waiting["jobId"], job_id);
        assert_eq!(waiting["position"], 1);

        let response = next_event(&mut ws, "chat:response").await;
        assert_eq!(response["jobId"], job_id);
        assert_eq!(response["reply"], "You said: hello");
        assert_eq!(response["docs"][0]["title"], "doc");

        let conversation_id = response["conversationId"].as_str().unwrap();
        let messages: Value = reqwest::Client::new()
            .get(format!(
                "http://127.0.0.1:{port}/api/conversations/{conversation_id}/messages"
            ))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let messages = messages["result"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["content"], "You said: hello");

        let job: Value = reqwest::Client::new()
            .get(format!("http://127.0.0.1:{port}/api/jobs/{job_id}"))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(job["result"]["state"], "completed");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn upstream_failure_sends_chat_error() {
    timeout(TEST_TIMEOUT, async {
        let (port, _service) = start_relay(Some(Arc::new(DownAssist))).await;
        let (mut ws, client_id) = connect(port).await;

        let job_id = enqueue(port, &client_id, "hello").await;
        let error = next_event(&mut ws, "chat:error").await;
        assert_eq!(error["jobId"], job_id);
        assert!(error["error"].as_str().unwrap().contains("503"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn second_job_is_told_its_position() {
    timeout(TEST_TIMEOUT, async {
        let (port, _service) =
            start_relay(Some(Arc::new(SlowAssist(Duration::from_millis(500))))).await;
        let (mut ws, client_id) = connect(port).await;

        let first = enqueue(port, &client_id, "first").await;
        let waiting = next_event(&mut ws, "chat:waiting").await;
        assert_eq!(waiting["jobId"], first);
        assert_eq!(waiting["position"], 1);
        assert_eq!(waiting["length"], 1);

        // Let the worker pick up the first job.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = enqueue(port, &client_id, "second").await;

        let waiting = next_event(&mut ws, "chat:waiting").await;
        assert_eq!(waiting["jobId"], second);
        assert_eq!(waiting["position"], 1);
        assert_eq!(waiting["length"], 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn disconnect_cancels_client_jobs() {
    timeout(TEST_TIMEOUT, async {
        let (port, service) = start_relay(Some(Arc::new(SlowAssist(Duration::from_secs(1))))).await;
        let (mut ws, client_id) = connect(port).await;

        enqueue(port, &client_id, "first").await;
        enqueue(port, &client_id, "second").await;
        assert_eq!(service.queue().stats().await.length, 2);

        ws.close(None).await.unwrap();
        drop(ws);

        loop {
            if service.queue().stats().await.length == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!service.router().is_reachable(&client_id).await);
    })
    .await
    .expect("test timed out");
}

// ── REST Tests ───────────────────────────────────────────────────────

#[tokio::test]
async fn api_rejects_missing_token() {
    timeout(TEST_TIMEOUT, async {
        let (port, _service) = start_relay(None).await;
        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/api/chat"))
            .json(&json!({"message": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let health = reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .unwrap();
        assert_eq!(health.status(), 200);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn plain_chat_without_message_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let (port, service) = start_relay(None).await;
        let resp = post_chat(port, "c1", json!({"action": 1})).await;
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
        assert_eq!(service.queue().stats().await.length, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn shutdown_drains_worker() {
    timeout(TEST_TIMEOUT, async {
        let (port, service) =
            start_relay(Some(Arc::new(SlowAssist(Duration::from_millis(200))))).await;
        let (_ws, client_id) = connect(port).await;
        let job_id = enqueue(port, &client_id, "hi").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let queue = service.queue().clone();
        service.shutdown().await;
        let job = queue.get(job_id.parse().unwrap()).await.unwrap();
        assert_eq!(job.state.to_string(), "completed");
    })
    .await
    .expect("test timed out");
}

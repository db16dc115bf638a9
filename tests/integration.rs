//! Integration tests for the relay.
//!
//! A relay runs on a loopback listener. Workers are plain WebSocket clients
//! that speak the control protocol frame by frame, so each test controls
//! exactly what the worker sends and when.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use futures::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

use relaywire::protocol::{Frame, FrameCodec, JobId, ResponsePayload};
use relaywire::relay::{router, spawn_hub, ConnectionConfig, GatewayState, HubConfig, HubHandle};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct TestRelay {
    addr: SocketAddr,
    app: Router,
    hub: HubHandle,
}

impl TestRelay {
    async fn start(config: HubConfig) -> Self {
        Self::start_with(config, ConnectionConfig::default()).await
    }

    async fn start_with(config: HubConfig, connection: ConnectionConfig) -> Self {
        let (hub, _task) = spawn_hub(config);
        let app = router(GatewayState {
            connection,
            ..GatewayState::new(hub.clone())
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = app.clone();
        tokio::spawn(async move {
            axum::serve(listener, server).await.unwrap();
        });

        Self { addr, app, hub }
    }

    async fn connect(&self, path: &str) -> Ws {
        let (ws, _) = connect_async(format!("ws://{}{}", self.addr, path))
            .await
            .unwrap();
        ws
    }

    /// Connect and register a worker, waiting until the relay has applied it.
    async fn worker(&self, id: &str) -> Ws {
        let mut ws = self.connect("/ws").await;
        send_raw(
            &mut ws,
            &json!({
                "type": "backend_register",
                "data": { "backendId": id, "capabilities": ["chat"], "version": "test" }
            })
            .to_string(),
        )
        .await;
        self.wait_for(|workers| workers.iter().any(|w| w == id)).await;
        ws
    }

    async fn wait_for(&self, condition: impl Fn(&[String]) -> bool) {
        timeout(WAIT, async {
            loop {
                if condition(&self.hub.stats().await.workers) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relay state did not converge");
    }

    fn request(&self, method: &str, uri: &str, body: Body) -> tokio::task::JoinHandle<Response> {
        let app = self.app.clone();
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        tokio::spawn(async move { app.oneshot(request).await.unwrap() })
    }
}

async fn send_raw(ws: &mut Ws, text: &str) {
    ws.send(Message::text(text.to_string())).await.unwrap();
}

async fn send(ws: &mut Ws, frame: &Frame) {
    send_raw(ws, &FrameCodec::encode(frame).unwrap()).await;
}

/// Next non-ping frame sent by the relay.
async fn next_frame(ws: &mut Ws) -> Frame {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("no frame from relay")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            let frame = FrameCodec::decode(&text).unwrap();
            if !matches!(frame, Frame::Ping { .. }) {
                return frame;
            }
        }
    }
}

async fn next_request(ws: &mut Ws) -> (JobId, relaywire::protocol::ApiRequest) {
    match next_frame(ws).await {
        Frame::ApiRequest { request_id, data } => (request_id, data),
        other => panic!("expected api_request, got {other:?}"),
    }
}

async fn json_body(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// No worker connected: 503 and no job is created.
#[tokio::test]
async fn test_no_worker_returns_503() {
    let relay = TestRelay::start(HubConfig::default()).await;

    let response = relay.request("GET", "/api/projects", Body::empty()).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        json_body(response).await,
        json!({ "error": "No backend servers available" })
    );
    assert_eq!(relay.hub.stats().await.pending, 0);
}

/// Unary job: the worker's JSON data and status reach the HTTP client.
#[tokio::test]
async fn test_unary_round_trip() {
    let relay = TestRelay::start(HubConfig::default()).await;
    let mut worker = relay.worker("backend-1").await;

    let pending = relay.request("GET", "/api/projects?limit=2", Body::empty());
    let (id, request) = next_request(&mut worker).await;
    assert_eq!(request.method, "GET");
    assert_eq!(request.path, "/api/projects?limit=2");
    assert_eq!(request.headers.get("content-type").map(String::as_str), Some("application/json"));

    send_raw(
        &mut worker,
        &json!({
            "type": "api_response",
            "requestId": id,
            "data": { "data": { "projects": [] }, "status": 200 }
        })
        .to_string(),
    )
    .await;

    let response = pending.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({ "projects": [] }));
    assert_eq!(relay.hub.stats().await.pending, 0);
}

/// The JSON request body is forwarded as JSON.
#[tokio::test]
async fn test_request_body_forwarded() {
    let relay = TestRelay::start(HubConfig::default()).await;
    let mut worker = relay.worker("backend-1").await;

    let pending = relay.request("POST", "/api/chat", Body::from(r#"{"message":"hi"}"#));
    let (id, request) = next_request(&mut worker).await;
    assert_eq!(request.body, json!({ "message": "hi" }));

    send(
        &mut worker,
        &Frame::ApiResponse {
            request_id: id,
            data: ResponsePayload::text("plain answer", 201),
        },
    )
    .await;

    let response = pending.await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"plain answer");
}

/// A worker error is rendered with the stated status.
#[tokio::test]
async fn test_worker_error_status() {
    let relay = TestRelay::start(HubConfig::default()).await;
    let mut worker = relay.worker("backend-1").await;

    let pending = relay.request("GET", "/api/projects/p/histories/s", Body::empty());
    let (id, _) = next_request(&mut worker).await;
    send_raw(
        &mut worker,
        &json!({
            "type": "api_response",
            "requestId": id,
            "data": { "error": "Session not found", "status": 404 }
        })
        .to_string(),
    )
    .await;

    let response = pending.await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await, json!({ "error": "Session not found" }));
}

/// Worker never answers: 504 at the deadline, and the late answer is dropped.
#[tokio::test]
async fn test_timeout_returns_504() {
    let relay = TestRelay::start(HubConfig {
        job_timeout: Duration::from_millis(200),
        ..HubConfig::default()
    })
    .await;
    let mut worker = relay.worker("backend-1").await;

    let pending = relay.request("GET", "/api/projects", Body::empty());
    let (id, _) = next_request(&mut worker).await;

    let response = pending.await.unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(json_body(response).await, json!({ "error": "Request timeout" }));

    send(
        &mut worker,
        &Frame::ApiResponse {
            request_id: id,
            data: ResponsePayload::json(json!({}), 200),
        },
    )
    .await;
    let stats = relay.hub.stats().await;
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.workers, vec!["backend-1".to_string()]);
}

/// Stream: chunks arrive in order, late chunks after the end are dropped.
#[tokio::test]
async fn test_stream_relays_chunks_in_order() {
    let relay = TestRelay::start(HubConfig {
        job_timeout: Duration::from_millis(300),
        ..HubConfig::default()
    })
    .await;
    let mut worker = relay.worker("backend-1").await;

    let pending = relay.request("POST", "/api/chat", Body::from(r#"{"message":"abc"}"#));
    let (id, _) = next_request(&mut worker).await;

    send_raw(&mut worker, &json!({ "type": "streaming_start", "requestId": id }).to_string()).await;
    let response = pending.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/plain; charset=utf-8"
    );

    // Well past the job deadline; a started stream is no longer subject to it.
    tokio::time::sleep(Duration::from_millis(400)).await;
    for (seq, part) in ["a", "b", "c"].iter().enumerate() {
        send_raw(
            &mut worker,
            &json!({ "type": "streaming_chunk", "requestId": id, "data": part, "sequence": seq })
                .to_string(),
        )
        .await;
    }
    send_raw(&mut worker, &json!({ "type": "streaming_end", "requestId": id }).to_string()).await;
    send_raw(
        &mut worker,
        &json!({ "type": "streaming_chunk", "requestId": id, "data": "late" }).to_string(),
    )
    .await;

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"abc");

    let stats = relay.hub.stats().await;
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.streaming, 0);
}

/// The worker may name the stream's content type.
#[tokio::test]
async fn test_stream_content_type() {
    let relay = TestRelay::start(HubConfig::default()).await;
    let mut worker = relay.worker("backend-1").await;

    let pending = relay.request("POST", "/api/chat", Body::from("{}"));
    let (id, _) = next_request(&mut worker).await;
    send_raw(
        &mut worker,
        &json!({
            "type": "streaming_start",
            "requestId": id,
            "data": { "contentType": "application/x-ndjson" }
        })
        .to_string(),
    )
    .await;
    send_raw(&mut worker, &json!({ "type": "streaming_end", "requestId": id }).to_string()).await;

    let response = pending.await.unwrap();
    assert_eq!(response.headers()["content-type"], "application/x-ndjson");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert!(bytes.is_empty());
}

/// Worker disconnects mid-stream: the body carries what was sent, then fails.
#[tokio::test]
async fn test_disconnect_mid_stream_force_closes() {
    let relay = TestRelay::start(HubConfig::default()).await;
    let mut worker = relay.worker("backend-1").await;

    let pending = relay.request("POST", "/api/chat", Body::from("{}"));
    let (id, _) = next_request(&mut worker).await;
    send_raw(&mut worker, &json!({ "type": "streaming_start", "requestId": id }).to_string()).await;
    for part in ["a", "b"] {
        send_raw(
            &mut worker,
            &json!({ "type": "streaming_chunk", "requestId": id, "data": part }).to_string(),
        )
        .await;
    }

    let response = pending.await.unwrap();
    worker.close(None).await.unwrap();
    drop(worker);

    let mut body = response.into_body();
    let mut received = Vec::new();
    let mut failed = false;
    while let Some(frame) = timeout(WAIT, body.frame()).await.unwrap() {
        match frame {
            Ok(frame) => {
                if let Some(data) = frame.data_ref() {
                    received.extend_from_slice(data);
                }
            }
            Err(_) => {
                failed = true;
                break;
            }
        }
    }
    assert_eq!(received, b"ab");
    assert!(failed, "stream must not end cleanly");

    relay.wait_for(|workers| workers.is_empty()).await;
    assert_eq!(relay.hub.stats().await.streaming, 0);
}

/// Fail-fast mode: a pending job fails with 502 when its worker disconnects.
#[tokio::test]
async fn test_fail_pending_on_disconnect() {
    let relay = TestRelay::start(HubConfig {
        fail_pending_on_disconnect: true,
        ..HubConfig::default()
    })
    .await;
    let mut worker = relay.worker("backend-1").await;

    let pending = relay.request("GET", "/api/projects", Body::empty());
    next_request(&mut worker).await;
    drop(worker);

    let response = pending.await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(json_body(response).await, json!({ "error": "Backend disconnected" }));
}

/// Two workers: exactly one of them receives the job.
#[tokio::test]
async fn test_two_workers_exactly_one_receives() {
    let relay = TestRelay::start(HubConfig::default()).await;
    let mut first = relay.worker("backend-a").await;
    let mut second = relay.worker("backend-b").await;

    let pending = relay.request("GET", "/api/projects", Body::empty());
    let (id, _) = next_request(&mut first).await;
    send(
        &mut first,
        &Frame::ApiResponse {
            request_id: id,
            data: ResponsePayload::json(json!({ "from": "a" }), 200),
        },
    )
    .await;
    assert_eq!(json_body(pending.await.unwrap()).await, json!({ "from": "a" }));

    // The other worker saw nothing.
    assert!(timeout(Duration::from_millis(200), second.next()).await.is_err());
}

/// Frames carrying another connection's job id are ignored.
#[tokio::test]
async fn test_foreign_connection_cannot_answer() {
    let relay = TestRelay::start(HubConfig::default()).await;
    let mut owner = relay.worker("backend-a").await;
    let mut intruder = relay.worker("backend-b").await;

    let pending = relay.request("GET", "/api/projects", Body::empty());
    let (id, _) = next_request(&mut owner).await;

    send(
        &mut intruder,
        &Frame::ApiResponse {
            request_id: id.clone(),
            data: ResponsePayload::json(json!({ "from": "intruder" }), 200),
        },
    )
    .await;
    send(
        &mut owner,
        &Frame::ApiResponse {
            request_id: id,
            data: ResponsePayload::json(json!({ "from": "owner" }), 200),
        },
    )
    .await;

    assert_eq!(json_body(pending.await.unwrap()).await, json!({ "from": "owner" }));
}

/// Heartbeats are acknowledged and malformed frames do not close the connection.
#[tokio::test]
async fn test_heartbeat_and_malformed_frames() {
    let relay = TestRelay::start(HubConfig::default()).await;
    let mut ws = relay.connect("/").await;

    send_raw(&mut ws, "this is not json").await;
    send_raw(&mut ws, r#"{"type":"teleport"}"#).await;
    send_raw(&mut ws, r#"{"type":"heartbeat","timestamp":1}"#).await;
    assert!(matches!(next_frame(&mut ws).await, Frame::HeartbeatAck { .. }));

    send_raw(&mut ws, r#"{"type":"ping"}"#).await;
    assert!(matches!(next_frame(&mut ws).await, Frame::Pong { .. }));

    send_raw(
        &mut ws,
        r#"{"type":"backend_register","data":{"backendId":"late","capabilities":[],"version":"1"}}"#,
    )
    .await;
    relay.wait_for(|workers| workers == ["late".to_string()]).await;
}

/// Re-registering an id replaces the old connection without double counting.
#[tokio::test]
async fn test_reregistration_replaces_connection() {
    let relay = TestRelay::start(HubConfig::default()).await;
    let mut old = relay.worker("backend-1").await;
    let mut new = relay.worker("backend-1").await;

    // The relay closes the replaced connection once the new registration is applied.
    let closed = timeout(WAIT, async {
        loop {
            match old.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "replaced connection was not closed");
    drop(old);

    // Let the old connection's close reach the relay.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(relay.hub.stats().await.workers, vec!["backend-1".to_string()]);

    // Jobs go to the replacement connection.
    let pending = relay.request("GET", "/api/projects", Body::empty());
    let (id, _) = next_request(&mut new).await;
    send(
        &mut new,
        &Frame::ApiResponse {
            request_id: id,
            data: ResponsePayload::json(json!({ "from": "new" }), 200),
        },
    )
    .await;
    assert_eq!(json_body(pending.await.unwrap()).await, json!({ "from": "new" }));
}

/// A connection that stays silent past the liveness timeout is closed and deregistered.
#[tokio::test]
async fn test_silent_connection_closed_after_liveness_timeout() {
    let relay = TestRelay::start_with(
        HubConfig::default(),
        ConnectionConfig {
            ping_interval: Duration::from_millis(50),
            liveness_timeout: Duration::from_millis(200),
        },
    )
    .await;
    let mut silent = relay.worker("backend-1").await;

    // Read without ever answering; relay pings do not count as traffic from us.
    let mut pings = 0;
    let closed = timeout(WAIT, async {
        loop {
            match silent.next().await {
                Some(Ok(Message::Text(text))) => {
                    if matches!(FrameCodec::decode(&text), Ok(Frame::Ping { .. })) {
                        pings += 1;
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "silent connection was not closed");
    assert!(pings >= 1);

    relay.wait_for(|workers| workers.is_empty()).await;
}

/// Health reports the number of registered workers.
#[tokio::test]
async fn test_health_counts_backends() {
    let relay = TestRelay::start(HubConfig::default()).await;
    let _worker = relay.worker("backend-1").await;

    let response = relay.request("GET", "/health", Body::empty()).await.unwrap();
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backends"], 1);
}

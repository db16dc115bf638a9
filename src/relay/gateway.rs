//! HTTP gateway.
//!
//! Accepts public HTTP requests on the relayed endpoint set, submits each one
//! to the dispatch loop and renders the job outcome. The control endpoint
//! (`GET /` and `GET /ws`) upgrades to the worker WebSocket.

use std::collections::BTreeMap;
use std::time::Instant;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::SecondsFormat;
use http_body_util::LengthLimitError;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::JobError;
use crate::protocol::ApiRequest;

use super::connection::{run_connection, ConnectionConfig};
use super::correlator::{JobHead, ResponseBody, StreamBody, UnaryResponse};
use super::hub::HubHandle;

/// Default limit for request bodies forwarded to workers.
pub const DEFAULT_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Shared state of the gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    /// Dispatch loop handle.
    pub hub: HubHandle,
    /// Liveness settings for accepted control connections.
    pub connection: ConnectionConfig,
    /// Maximum accepted request body size.
    pub body_limit: usize,
}

impl GatewayState {
    /// Gateway state with default connection settings and body limit.
    pub fn new(hub: HubHandle) -> Self {
        Self {
            hub,
            connection: ConnectionConfig::default(),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }
}

/// Build the gateway router.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health).fallback(not_found))
        .route("/api/projects", get(relay).fallback(not_found))
        .route("/api/chat", post(relay).fallback(not_found))
        .route("/api/abort/:request_id", post(relay).fallback(not_found))
        .route(
            "/api/projects/:encoded_project_name/histories",
            get(relay).fallback(not_found),
        )
        .route(
            "/api/projects/:encoded_project_name/histories/:session_id",
            get(relay).fallback(not_found),
        )
        .route("/", get(control).fallback(not_found))
        .route("/ws", get(control).fallback(not_found))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<GatewayState>) -> Json<Value> {
    let stats = state.hub.stats().await;
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "backends": stats.workers.len(),
    }))
}

async fn not_found() -> JobError {
    JobError::NotFound
}

async fn control(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    let hub = state.hub.clone();
    let config = state.connection;
    ws.on_upgrade(move |socket| run_connection(socket, hub, config))
}

async fn relay(State(state): State<GatewayState>, request: Request) -> Response {
    let started = Instant::now();
    let (parts, body) = request.into_parts();

    let method = parts.method.as_str().to_string();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let bytes = match axum::body::to_bytes(body, state.body_limit).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(%method, %path, "Rejecting request body: {}", e);
            return body_rejection(&e);
        }
    };

    let api_request = ApiRequest {
        method: method.clone(),
        path: path.clone(),
        headers: forwarded_headers(&parts.headers),
        body: parse_body(&bytes),
    };

    let response = match state.hub.submit(api_request).await {
        JobHead::Unary(unary) => render_unary(unary),
        JobHead::Stream(stream) => render_stream(stream),
        JobHead::Failed(error) => {
            tracing::info!(%method, %path, error = %error, "Relayed request failed");
            error.into_response()
        }
    };

    tracing::debug!(
        %method,
        %path,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "Gateway response"
    );
    response
}

fn body_rejection(error: &axum::Error) -> Response {
    if exceeds_length_limit(error) {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({ "error": "Request body too large" })),
        )
            .into_response()
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Failed to read request body" })),
        )
            .into_response()
    }
}

fn exceeds_length_limit(error: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

fn forwarded_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

/// JSON when the body parses as JSON, a string when it is UTF-8, null otherwise.
fn parse_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    if let Ok(value) = serde_json::from_slice(bytes) {
        return value;
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::Null,
    }
}

fn render_unary(unary: UnaryResponse) -> Response {
    let status = StatusCode::from_u16(unary.status).unwrap_or(StatusCode::OK);
    match unary.body {
        ResponseBody::Json(value) => (status, Json(value)).into_response(),
        ResponseBody::Text(text) => (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            text,
        )
            .into_response(),
    }
}

fn render_stream(stream: StreamBody) -> Response {
    let StreamBody {
        content_type,
        chunks,
    } = stream;
    let body = Body::from_stream(futures::stream::unfold(chunks, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap_or_else(|e| {
            tracing::error!("Failed to build streaming response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::hub::{spawn_hub, HubConfig};
    use axum::http::Method;
    use tower::ServiceExt;

    fn app() -> Router {
        let (hub, _task) = spawn_hub(HubConfig::default());
        router(GatewayState::new(hub))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(method: Method, uri: &str) -> Request {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_backends() {
        let response = app().oneshot(request(Method::GET, "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["backends"], 0);
        let timestamp = body["timestamp"].as_str().unwrap();
        assert!(timestamp.ends_with('Z'), "{timestamp}");
        // Millisecond precision: `YYYY-MM-DDTHH:MM:SS.mmmZ`.
        assert_eq!(timestamp.len(), 24, "{timestamp}");
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[tokio::test]
    async fn test_oversized_body_returns_413() {
        let (hub, _task) = spawn_hub(HubConfig::default());
        let state = GatewayState {
            body_limit: 8,
            ..GatewayState::new(hub)
        };
        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/api/chat")
            .body(Body::from(r#"{"message":"far too long"}"#))
            .unwrap();

        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "Request body too large" })
        );
    }

    #[tokio::test]
    async fn test_interrupted_upload_returns_400() {
        let chunks: Vec<std::result::Result<bytes::Bytes, std::io::Error>> = vec![
            Ok(bytes::Bytes::from_static(b"{\"message\":")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "client went away")),
        ];
        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/api/chat")
            .body(Body::from_stream(futures::stream::iter(chunks)))
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "Failed to read request body" })
        );
    }

    #[tokio::test]
    async fn test_no_worker_returns_503() {
        let response = app()
            .oneshot(request(Method::GET, "/api/projects"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "No backend servers available" })
        );
    }

    #[tokio::test]
    async fn test_unknown_route_returns_404() {
        let response = app()
            .oneshot(request(Method::GET, "/api/unknown"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await, json!({ "error": "Not found" }));
    }

    #[tokio::test]
    async fn test_wrong_method_returns_404() {
        let response = app()
            .oneshot(request(Method::GET, "/api/chat"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app()
            .oneshot(request(Method::POST, "/api/projects"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_parameterized_routes_are_relayed() {
        for (method, uri) in [
            (Method::POST, "/api/abort/req_9"),
            (Method::GET, "/api/projects/my%2Dproj/histories"),
            (Method::GET, "/api/projects/my%2Dproj/histories/abc"),
        ] {
            let response = app().oneshot(request(method, uri)).await.unwrap();
            // Recognized routes reach the dispatch loop, which has no worker.
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE, "{uri}");
        }
    }

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(b""), Value::Null);
        assert_eq!(parse_body(br#"{"message":"hi"}"#), json!({"message": "hi"}));
        assert_eq!(parse_body(b"plain"), json!("plain"));
        assert_eq!(parse_body(&[0xff, 0xfe]), Value::Null);
    }

    #[test]
    fn test_forwarded_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-custom", "1".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());

        let forwarded = forwarded_headers(&headers);
        assert_eq!(forwarded.get("x-custom").map(String::as_str), Some("1"));
        assert_eq!(
            forwarded.get("content-type").map(String::as_str),
            Some("application/json")
        );
    }

    #[tokio::test]
    async fn test_text_response_rendering() {
        let response = render_unary(UnaryResponse {
            status: 200,
            body: ResponseBody::Text("hello".to_string()),
        });
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"hello");
    }
}

//! HTTP handlers for the push stream, response intake, and dispatch triggers.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response as HttpResponse};
use axum::Json;
use duplex_core::{ClientId, Payload, RelayError, Response};
use serde::{Deserialize, Serialize};

use crate::server::AppState;
use crate::stream::{self, SessionGuard};

/// Header carrying the submitting client's id on `POST /response`.
pub const CLIENT_ID_HEADER: &str = "Client-ID";

const DEFAULT_METHOD: &str = "analyze";

/// Handler failure mapped onto an HTTP status and a JSON body.
#[derive(Debug)]
pub enum ApiError {
    Relay(RelayError),
    BadRequest(String),
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self::Relay(e)
    }
}

pub fn status_for(error: &RelayError) -> StatusCode {
    match error {
        RelayError::ClientNotFound(_) | RelayError::UnknownClient(_) => StatusCode::NOT_FOUND,
        RelayError::Backpressure(_) => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
        RelayError::Cancelled(_) => StatusCode::CONFLICT,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> HttpResponse {
        let (status, kind, message) = match &self {
            Self::Relay(e) => (status_for(e), e.error_kind(), e.to_string()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
        };
        let body = serde_json::json!({ "error": kind, "message": message });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub client_id: Option<String>,
}

/// `GET /events`: open the push stream for a client.
pub async fn events_handler(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let client_id = query
        .client_id
        .filter(|id| !id.is_empty())
        .map(ClientId::from_raw);

    let (_session, receiver) = state.relay.connect(client_id);
    let guard = SessionGuard::new(Arc::clone(&state.relay), &receiver);
    let body = stream::push_stream(receiver, guard);

    let keep_alive = KeepAlive::new().interval(state.config.keep_alive_interval);
    (
        [(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))],
        Sse::new(body).keep_alive(keep_alive),
    )
}

/// Acknowledgement body for `POST /response`.
#[derive(Debug, Serialize)]
pub struct SubmitAck {
    pub status: &'static str,
    pub outcome: &'static str,
}

/// `POST /response`: accept a client's response to a pushed request.
pub async fn response_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SubmitAck>, ApiError> {
    // No usable header means no session can own the response.
    let client_id = ClientId::from_raw(
        headers
            .get(CLIENT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default(),
    );
    if client_id.as_str().is_empty() {
        return Err(RelayError::UnknownClient(client_id).into());
    }

    let response: Response = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid response body: {e}")))?;

    let outcome = state.relay.submit(&client_id, response)?;
    Ok(Json(SubmitAck {
        status: "ok",
        outcome: outcome.as_str(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct TriggerQuery {
    pub client_id: Option<String>,
    pub message: Option<String>,
    pub method: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// `GET /trigger`: push a request to a client and return its response.
pub async fn trigger_handler(
    State(state): State<AppState>,
    Query(query): Query<TriggerQuery>,
) -> Result<Json<Response>, ApiError> {
    let (Some(client_id), Some(message)) = (
        query.client_id.filter(|v| !v.is_empty()),
        query.message.filter(|v| !v.is_empty()),
    ) else {
        return Err(ApiError::BadRequest(
            "Need client_id and message parameters".into(),
        ));
    };

    let payload = Payload::new(
        query.method.unwrap_or_else(|| DEFAULT_METHOD.to_string()),
        message,
    );
    let timeout = state
        .config
        .effective_timeout(query.timeout_ms.map(Duration::from_millis));

    let response = state
        .relay
        .dispatch(&ClientId::from_raw(client_id), payload, timeout)
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct DispatchBody {
    pub client_id: String,
    #[serde(default)]
    pub method: Option<String>,
    pub message: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// `POST /dispatch`: structured variant of `/trigger`.
pub async fn dispatch_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Response>, ApiError> {
    let req: DispatchBody = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid dispatch body: {e}")))?;

    let mut payload = Payload::new(
        req.method.unwrap_or_else(|| DEFAULT_METHOD.to_string()),
        req.message,
    );
    if let Some(params) = req.params {
        payload = payload.with_params(params);
    }
    let timeout = state
        .config
        .effective_timeout(req.timeout_ms.map(Duration::from_millis));

    let response = state
        .relay
        .dispatch(&ClientId::from_raw(req.client_id), payload, timeout)
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub queued: usize,
}

/// `GET /clients`: connected clients.
pub async fn clients_handler(State(state): State<AppState>) -> Json<Vec<ClientInfo>> {
    let clients = state
        .relay
        .sessions()
        .iter()
        .map(|s| ClientInfo {
            client_id: s.client_id().to_string(),
            connected_at: s.connected_at(),
            queued: s.queued(),
        })
        .collect();
    Json(clients)
}

/// `GET /health`.
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "clients": state.relay.client_count(),
        "pending": state.relay.pending_count(),
    }))
}

/// `GET /metrics`: JSON snapshot of relay metrics.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.relay.metrics().snapshot())
}

/// `GET /`: status page.
pub async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>duplex relay</title></head>
<body>
  <h1>duplex: request/response over SSE + HTTP POST</h1>
  <ul>
    <li><strong>SSE stream:</strong> server &rarr; client requests</li>
    <li><strong>HTTP POST:</strong> client &rarr; server responses</li>
  </ul>
  <p><strong>Endpoints:</strong></p>
  <ul>
    <li><code>GET /events?client_id=test</code> - push stream for a client</li>
    <li><code>POST /response</code> (header <code>Client-ID</code>) - client sends a response</li>
    <li><code>GET /trigger?client_id=test&amp;message=hello</code> - dispatch and wait for the response</li>
    <li><code>POST /dispatch</code> - structured dispatch</li>
    <li><code>GET /clients</code>, <code>GET /health</code>, <code>GET /metrics</code></li>
  </ul>
</body>
</html>"#;

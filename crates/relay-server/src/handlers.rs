//! HTTP handlers for the passthrough, stream and batch endpoints.

use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::header::ACCEPT;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use relay_core::ids::SessionId;
use relay_core::provider::CompletionProvider;
use relay_engine::{BatchQuery, EngineError, SinkStream};

use crate::error::ApiError;
use crate::server::AppState;

const SESSION_HEADER: &str = "x-session-id";
const EVENT_STREAM: &str = "text/event-stream";

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub queries: Vec<BatchQuery>,
}

fn parse_body(bytes: &Bytes) -> Result<Value, ApiError> {
    let required = || ApiError::BadRequest("Request body is required".to_string());
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(required());
    }
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Null) => Err(required()),
        Ok(value) => Ok(value),
        Err(e) => Err(ApiError::BadRequest(format!("Invalid JSON body: {e}"))),
    }
}

async fn passthrough(provider: &dyn CompletionProvider, body: &Bytes) -> Result<Json<Value>, ApiError> {
    let body = parse_body(body)?;
    match provider.complete(&body).await {
        Ok(payload) => Ok(Json(payload)),
        Err(e) => {
            error!(provider = provider.name(), kind = e.error_kind(), error = %e, "passthrough failed");
            Err(ApiError::Upstream(e))
        }
    }
}

/// `POST /api/anthropic`
pub async fn anthropic(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    passthrough(state.anthropic.as_ref(), &body).await
}

/// `POST /api/perplexity`
pub async fn perplexity(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    passthrough(state.perplexity.as_ref(), &body).await
}

fn sse_response(stream: SinkStream) -> Response {
    let events = stream.map(|frame| Ok::<_, Infallible>(Event::default().data(frame)));
    let mut response = Sse::new(events).into_response();
    response
        .headers_mut()
        .insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

fn connect_stream(state: &AppState, session_id: Option<&str>) -> Result<Response, ApiError> {
    let stream = state.orchestrator.handle_stream_connect(session_id)?;
    info!(session_id = %stream.session_id(), conn_id = %stream.connection_id(), "event stream opened");
    Ok(sse_response(stream))
}

/// `GET /api/perplexity/stream?sessionId=...`
pub async fn stream(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Response, ApiError> {
    connect_stream(&state, query.session_id.as_deref())
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains(EVENT_STREAM))
}

/// `POST /api/perplexity/batch`
///
/// Session id comes from the `x-session-id` header or the `sessionId` query
/// parameter. An event-stream `Accept` header opens the session's stream
/// instead of running a batch.
pub async fn batch(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .or(query.session_id.as_deref());

    if SessionId::from_client(session_id).is_none() {
        return Err(EngineError::MissingSessionId.into());
    }
    if wants_event_stream(&headers) {
        return connect_stream(&state, session_id);
    }

    let request: BatchRequest = serde_json::from_value(parse_body(&body)?)
        .map_err(|e| ApiError::BadRequest(format!("Invalid batch request: {e}")))?;

    let results = state
        .orchestrator
        .handle_batch(session_id, request.queries)
        .await
        .map_err(|e| ApiError::from(e).masked(state.production))?;

    Ok(Json(json!({ "results": results })).into_response())
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "activeQueues": state.orchestrator.queues().active_count(),
        "openStreams": state.orchestrator.sinks().open_count(),
    }))
}

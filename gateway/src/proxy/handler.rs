//! Handlers for the public `/v1` surface.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::header::CACHE_CONTROL;
use axum::http::HeaderValue;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::errors::AppError;
use crate::models::chat::ModelCard;
use crate::models::token::CallerIdentity;
use crate::proxy::translate::{StreamFrame, Surface};
use crate::AppState;

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    body: Bytes,
) -> Result<Response, AppError> {
    handle_completion(state, caller, body, Surface::Chat).await
}

/// POST /v1/completions
pub async fn completions(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    body: Bytes,
) -> Result<Response, AppError> {
    handle_completion(state, caller, body, Surface::Text).await
}

/// POST /v1/responses
pub async fn responses(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    body: Bytes,
) -> Result<Response, AppError> {
    handle_completion(state, caller, body, Surface::Response).await
}

/// GET /v1/models
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": state.translator.catalog().list(),
    }))
}

/// GET /v1/models/:id
pub async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ModelCard>, AppError> {
    state
        .translator
        .catalog()
        .get(&id)
        .map(Json)
        .ok_or(AppError::UnknownModel(id))
}

async fn handle_completion(
    state: Arc<AppState>,
    caller: CallerIdentity,
    body: Bytes,
    surface: Surface,
) -> Result<Response, AppError> {
    let start = Instant::now();

    // Parsed by hand so malformed JSON gets the same error envelope as
    // every other validation failure.
    let body: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("request body is not valid JSON: {}", e)))?;
    let prepared = state.translator.prepare(&body, surface)?;

    tracing::info!(
        caller = %caller.log_name(),
        model = %prepared.request.model,
        upstream_model = %prepared.upstream_model,
        stream = prepared.request.stream,
        messages = prepared.request.messages.len(),
        "completion request"
    );

    if !prepared.request.stream {
        let completion = state.translator.complete(&prepared).await.map_err(|e| {
            tracing::warn!(latency_ms = start.elapsed().as_millis() as u64, "completion failed: {}", e);
            e
        })?;
        tracing::info!(latency_ms = start.elapsed().as_millis() as u64, "completion served");
        return Ok(Json(completion).into_response());
    }

    let frames = state.translator.stream(&prepared).await?;
    tracing::debug!(latency_ms = start.elapsed().as_millis() as u64, "upstream stream opened");

    let events = frames.map(|frame| {
        let event = match frame {
            StreamFrame::Chunk(v) | StreamFrame::Error(v) => Event::default().data(v.to_string()),
            StreamFrame::Done => Event::default().data("[DONE]"),
        };
        Ok::<_, Infallible>(event)
    });

    let mut resp = Sse::new(events).keep_alive(KeepAlive::default()).into_response();
    resp.headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(resp)
}

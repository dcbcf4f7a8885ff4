use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use bytes::Bytes;
use serde::Serialize;

use crate::errors::AppError;
use crate::models::token::{AccessToken, CreateTokenRequest, IssuedToken};
use crate::session::{SessionEvent, SessionStatus};
use crate::AppState;

/// How long `POST /session/authorize` waits for the verification code before
/// answering with whatever state it has.
const AUTHORIZE_WAIT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
pub struct RevokeResponse {
    pub id: String,
    pub revoked: bool,
}

#[derive(Serialize)]
pub struct DeleteResponse {
    pub id: String,
    pub deleted: bool,
}

/// GET /api/v1/tokens
pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<AccessToken>>, AppError> {
    Ok(Json(state.tokens.list().await?))
}

/// GET /api/v1/tokens/:id
pub async fn get_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<AccessToken>, AppError> {
    state
        .tokens
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("token '{}'", id)))
}

/// POST /api/v1/tokens. The plaintext secret appears in this response only.
pub async fn create_token(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<IssuedToken>), AppError> {
    let payload: CreateTokenRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateTokenRequest {
            label: String::new(),
        }
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::Validation(format!("invalid token request: {}", e)))?
    };

    let issued = state.tokens.issue(&payload.label).await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

/// POST /api/v1/tokens/:id/revoke
pub async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RevokeResponse>, AppError> {
    if !state.tokens.revoke(&id).await? {
        return Err(AppError::NotFound(format!("token '{}'", id)));
    }
    Ok(Json(RevokeResponse { id, revoked: true }))
}

/// DELETE /api/v1/tokens/:id. Deleting an unknown id is not an error.
pub async fn delete_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let deleted = state.tokens.delete(&id).await?;
    Ok(Json(DeleteResponse { id, deleted }))
}

/// GET /api/v1/session
pub async fn session_status(State(state): State<Arc<AppState>>) -> Json<SessionStatus> {
    Json(state.session.status().await)
}

/// POST /api/v1/session/authorize: starts (or joins) an authorization in the
/// background and reports the verification code once it is known.
pub async fn start_authorization(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<SessionStatus>) {
    if state.session.current().await.is_some() {
        return (StatusCode::OK, Json(state.session.status().await));
    }
    let status = state.session.status().await;
    if status.pending_verification.is_some() {
        return (StatusCode::ACCEPTED, Json(status));
    }

    let mut events = state.session.subscribe();
    let session = state.session.clone();
    tokio::spawn(async move {
        if let Err(e) = session.ensure_session().await {
            tracing::warn!("admin-triggered authorization failed: {}", e);
        }
    });

    let _ = tokio::time::timeout(AUTHORIZE_WAIT, async {
        while let Ok(event) = events.recv().await {
            if matches!(
                event,
                SessionEvent::VerificationRequired { .. }
                    | SessionEvent::Authorized { .. }
                    | SessionEvent::AuthorizationFailed { .. }
            ) {
                break;
            }
        }
    })
    .await;

    let status = state.session.status().await;
    let code = if status.state == crate::session::SessionState::Authorized {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    (code, Json(status))
}

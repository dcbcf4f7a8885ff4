use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use subtle::ConstantTimeEq;

use crate::errors::AppError;
use crate::middleware::auth::{bearer_token, mask};
use crate::AppState;

pub mod handlers;

/// Build the administration router.
/// All routes are relative; the caller mounts this under `/api/v1`.
pub fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/tokens",
            get(handlers::list_tokens).post(handlers::create_token),
        )
        .route(
            "/tokens/:id",
            get(handlers::get_token).delete(handlers::delete_token),
        )
        .route("/tokens/:id/revoke", post(handlers::revoke_token))
        .route("/session", get(handlers::session_status))
        .route("/session/authorize", post(handlers::start_authorization))
        .layer(middleware::from_fn_with_state(state, admin_auth))
        .fallback(fallback_404)
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Middleware: validates `X-Admin-Key` (or a bearer token) against the
/// configured admin key.
async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = state.config.admin_key.as_deref() else {
        return Err(AppError::NotFound("route".to_string()));
    };

    let provided = req
        .headers()
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .or_else(|| bearer_token(req.headers()));

    match provided {
        Some(k) if bool::from(k.as_bytes().ct_eq(expected.as_bytes())) => Ok(next.run(req).await),
        Some(k) => {
            tracing::warn!("admin API: invalid key (provided: '{}')", mask(&k));
            Err(AppError::Unauthorized)
        }
        None => {
            tracing::warn!("admin API: missing X-Admin-Key header");
            Err(AppError::Unauthorized)
        }
    }
}

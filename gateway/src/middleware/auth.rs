//! Caller authentication for the `/v1` surface.
//!
//! With no issued tokens and no static key the gateway is open. Otherwise the
//! bearer value must equal the static key or an active issued token.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use crate::errors::AppError;
use crate::models::token::CallerIdentity;
use crate::store::TokenStore;
use crate::AppState;

pub async fn caller_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let presented = bearer_token(req.headers());
    let identity = authenticate_caller(
        &state.tokens,
        state.config.api_key.as_deref(),
        presented.as_deref(),
    )
    .await?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

pub async fn authenticate_caller(
    tokens: &TokenStore,
    static_key: Option<&str>,
    presented: Option<&str>,
) -> Result<CallerIdentity, AppError> {
    if static_key.is_none() && tokens.is_empty().await? {
        return Ok(CallerIdentity::Open);
    }

    let presented = match presented {
        Some(p) if !p.is_empty() => p,
        _ => {
            tracing::debug!("caller auth: missing bearer token");
            return Err(AppError::Unauthorized);
        }
    };

    if let Some(key) = static_key {
        if bool::from(key.as_bytes().ct_eq(presented.as_bytes())) {
            return Ok(CallerIdentity::StaticKey);
        }
    }

    match tokens.authenticate(presented).await? {
        Some(token) => Ok(CallerIdentity::Token {
            id: token.id,
            label: token.label,
        }),
        None => {
            tracing::warn!(prefix = %mask(presented), "caller auth: unknown or revoked token");
            Err(AppError::Unauthorized)
        }
    }
}

/// Value of an `Authorization: Bearer ...` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim().to_string())
}

/// Never log more of a presented secret than this.
pub(crate) fn mask(secret: &str) -> String {
    if secret.len() > 12 {
        format!("{}…", secret.chars().take(6).collect::<String>())
    } else {
        "****".to_string()
    }
}

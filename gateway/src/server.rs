use std::sync::Arc;

use anyhow::Context;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::Instrument;

use crate::config::Config;
use crate::models::catalog::ModelCatalog;
use crate::proxy::translate::Translator;
use crate::proxy::upstream::UpstreamChatClient;
use crate::session::{AuthorizationBackend, HttpAuthorizationBackend, SessionManager, SessionState};
use crate::store::TokenStore;
use crate::{api, middleware, proxy};

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub config: Config,
    pub tokens: TokenStore,
    pub session: SessionManager,
    pub translator: Translator,
}

impl AppState {
    pub fn build(config: Config) -> anyhow::Result<Self> {
        let backend = HttpAuthorizationBackend::new(&config)
            .context("failed to build authorization HTTP client")?;
        Self::with_backend(config, Arc::new(backend))
    }

    /// Same as [`build`](Self::build) with a caller-supplied authorization backend.
    pub fn with_backend(
        config: Config,
        backend: Arc<dyn AuthorizationBackend>,
    ) -> anyhow::Result<Self> {
        let tokens = TokenStore::open(config.tokens_path())
            .with_context(|| format!("failed to open {}", config.tokens_path().display()))?;
        let session = SessionManager::open(backend, config.session_path(), config.handshake_timeout)
            .with_context(|| format!("failed to open {}", config.session_path().display()))?;
        let upstream = UpstreamChatClient::new(&config, session.clone())
            .context("failed to build upstream HTTP client")?;
        let translator = Translator::new(
            ModelCatalog::new(&config.model_aliases),
            upstream,
            config.default_model.clone(),
            config.stream_error_policy,
        );

        Ok(Self {
            config,
            tokens,
            session,
            translator,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route("/chat/completions", post(proxy::handler::chat_completions))
        .route("/completions", post(proxy::handler::completions))
        .route("/responses", post(proxy::handler::responses))
        .route("/models", get(proxy::handler::list_models))
        .route("/models/:id", get(proxy::handler::get_model))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::caller_auth,
        ));

    let mut app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/readyz", get(readiness_check))
        .nest("/v1", v1);

    if state.config.admin_key.is_some() {
        app = app.nest("/api/v1", api::api_router(state.clone()));
    }

    app.with_state(state)
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors_layer())
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(axum::middleware::from_fn(security_headers_middleware))
}

/// Browser clients are only accepted from local origins.
fn cors_layer() -> CorsLayer {
    use axum::http::{HeaderName, Method};
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin, _| {
            let origin = origin.to_str().unwrap_or("");
            origin.starts_with("http://localhost:") || origin.starts_with("http://127.0.0.1:")
        }))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static("content-type"),
            HeaderName::from_static("authorization"),
            HeaderName::from_static("x-admin-key"),
            HeaderName::from_static("x-request-id"),
        ])
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "ok",
        "endpoints": {
            "chat": "/v1/chat/completions",
            "completions": "/v1/completions",
            "responses": "/v1/responses",
            "models": "/v1/models",
            "health": "/health",
        }
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Ready only once the upstream session is usable.
async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.session.status().await;
    let code = if status.state == SessionState::Authorized {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let label = if code == StatusCode::OK { "ready" } else { "not_ready" };
    (code, Json(json!({ "status": label, "session": status.state })))
}

/// Middleware: injects a unique X-Request-Id into every response.
/// This allows clients to correlate errors with gateway logs.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let span = tracing::info_span!("request", request_id = %req_id);
    let mut resp = next.run(req).instrument(span).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

/// Middleware: security headers on every response.
async fn security_headers_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();

    headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    // Streams set their own `no-cache`.
    if !headers.contains_key("cache-control") {
        headers.insert("Cache-Control", HeaderValue::from_static("no-store"));
    }
    headers.remove("Server");

    resp
}

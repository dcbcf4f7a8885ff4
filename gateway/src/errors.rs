use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Every failure the gateway can surface to a caller.
///
/// The enum is `Clone` so one in-flight upstream authorization can hand the
/// same outcome to every request waiting on it.
#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("upstream authorization required: {0}")]
    AuthenticationRequired(String),

    #[error("upstream session expired")]
    UpstreamAuthExpired,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream rejected request ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable kind, also used as the `code` of the error body.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::UnknownModel(_) => "model_not_found",
            AppError::Unauthorized => "invalid_api_key",
            AppError::AuthenticationRequired(_) => "upstream_authentication_required",
            AppError::UpstreamAuthExpired => "upstream_auth_expired",
            AppError::UpstreamUnavailable(_) => "upstream_unavailable",
            AppError::Upstream { .. } => "upstream_error",
            AppError::Storage(_) => "storage_error",
            AppError::NotFound(_) => "not_found",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Whether resubmitting the same request later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::UpstreamAuthExpired
                | AppError::UpstreamUnavailable(_)
                | AppError::AuthenticationRequired(_)
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::UnknownModel(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::AuthenticationRequired(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::UpstreamAuthExpired => StatusCode::SERVICE_UNAVAILABLE,
            AppError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::Validation(_) | AppError::UnknownModel(_) | AppError::NotFound(_) => {
                "invalid_request_error"
            }
            AppError::Unauthorized => "authentication_error",
            AppError::AuthenticationRequired(_)
            | AppError::UpstreamAuthExpired
            | AppError::UpstreamUnavailable(_)
            | AppError::Upstream { .. } => "upstream_error",
            AppError::Storage(_) | AppError::Internal(_) => "server_error",
        }
    }

    /// Message safe to show to callers. Storage and internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Validation(msg) => msg.clone(),
            AppError::UnknownModel(model) => format!("The model '{}' does not exist", model),
            AppError::Unauthorized => "Invalid API key provided".to_string(),
            AppError::AuthenticationRequired(msg) => format!(
                "the gateway is not linked to its upstream service yet: {}",
                msg
            ),
            AppError::UpstreamAuthExpired => {
                "upstream session expired and is being renewed; retry the request".to_string()
            }
            AppError::UpstreamUnavailable(msg) => format!("upstream unavailable: {}", msg),
            AppError::Upstream { status, message } => {
                format!("upstream rejected the request ({}): {}", status, message)
            }
            AppError::Storage(_) | AppError::Internal(_) => "internal server error".to_string(),
            AppError::NotFound(what) => format!("{} not found", what),
        }
    }

    /// The provider-style error envelope without the HTTP status.
    pub fn body(&self) -> serde_json::Value {
        json!({
            "error": {
                "message": self.public_message(),
                "type": self.error_type(),
                "param": serde_json::Value::Null,
                "code": self.kind(),
            }
        })
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Storage(e) => tracing::error!("storage error: {}", e),
            AppError::Internal(e) => tracing::error!("internal error: {}", e),
            _ => {}
        }

        let mut response = (self.status(), Json(self.body())).into_response();

        if self.is_retryable() {
            response.headers_mut().insert(
                "retry-after",
                axum::http::HeaderValue::from_static("1"),
            );
        }

        response
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Storage(e.to_string())
    }
}

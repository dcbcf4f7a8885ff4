//! HTTP client for the upstream chat endpoint.
//! Uses reqwest-middleware to retry transient failures once.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{
    default_on_request_failure, policies::ExponentialBackoff, Retryable, RetryableStrategy,
    RetryTransientMiddleware,
};
use serde::Serialize;
use serde_json::Value;

use crate::config::Config;
use crate::errors::AppError;
use crate::models::chat::{ChatMessage, SamplingParams, Usage};
use crate::proxy::stream_bridge::{bridge_sse_response, UpstreamEventStream};
use crate::session::backend::{EDITOR_PLUGIN_VERSION, EDITOR_VERSION, INTEGRATION_USER_AGENT};
use crate::session::{SessionManager, UpstreamSession};

/// Retries timeouts, connection failures and 5xx; never a 4xx.
struct TransientOnly;

impl RetryableStrategy for TransientOnly {
    fn handle(
        &self,
        res: &Result<reqwest::Response, reqwest_middleware::Error>,
    ) -> Option<Retryable> {
        match res {
            Ok(resp) if resp.status().is_server_error() => Some(Retryable::Transient),
            Ok(_) => None,
            Err(e) => default_on_request_failure(e),
        }
    }
}

#[derive(Serialize)]
struct UpstreamChatBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    n: u32,
    intent: bool,
}

/// A finished single-shot completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub finish_reason: String,
    /// Exact counts when the upstream reported them.
    pub usage: Option<Usage>,
    pub model: Option<String>,
}

pub struct UpstreamChatClient {
    client: ClientWithMiddleware,
    stream_client: ClientWithMiddleware,
    chat_url: String,
    session: SessionManager,
    auth_wait: Duration,
    request_timeout: Duration,
    stream_idle_timeout: Duration,
}

impl UpstreamChatClient {
    pub fn new(cfg: &Config, session: SessionManager) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(32)
            .timeout(cfg.request_timeout)
            .connect_timeout(cfg.connect_timeout)
            .build()?;

        // No total timeout: a stream may legitimately run for minutes. Stalls
        // are caught by the per-chunk idle timeout instead.
        let stream_client = reqwest::Client::builder()
            .use_rustls_tls()
            .connect_timeout(cfg.connect_timeout)
            .build()?;

        Ok(Self {
            client: ClientBuilder::new(client)
                .with(retry_once())
                .build(),
            stream_client: ClientBuilder::new(stream_client)
                .with(retry_once())
                .build(),
            chat_url: format!("{}/chat/completions", cfg.upstream_url.trim_end_matches('/')),
            session,
            auth_wait: cfg.auth_wait,
            request_timeout: cfg.request_timeout,
            stream_idle_timeout: cfg.stream_idle_timeout,
        })
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub async fn complete(
        &self,
        upstream_model: &str,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> Result<Completion, AppError> {
        let resp = self
            .send(&self.client, upstream_model, messages, params, false)
            .await?;
        let body: Value = resp.json().await.map_err(|e| {
            AppError::UpstreamUnavailable(format!("unreadable upstream response: {}", e))
        })?;
        Ok(parse_completion(&body))
    }

    /// Opens the upstream stream. Failures before the first byte (auth,
    /// rejection, connect) come back as `Err`; anything later arrives as a
    /// terminal [`UpstreamEvent::Failed`](crate::proxy::stream::UpstreamEvent::Failed).
    pub async fn complete_streaming(
        &self,
        upstream_model: &str,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> Result<UpstreamEventStream, AppError> {
        let open = self.send(&self.stream_client, upstream_model, messages, params, true);
        let resp = tokio::time::timeout(self.request_timeout, open)
            .await
            .map_err(|_| {
                AppError::UpstreamUnavailable("timed out waiting for the upstream stream".to_string())
            })??;
        Ok(bridge_sse_response(resp, self.stream_idle_timeout))
    }

    async fn send(
        &self,
        client: &ClientWithMiddleware,
        upstream_model: &str,
        messages: &[ChatMessage],
        params: &SamplingParams,
        stream: bool,
    ) -> Result<reqwest::Response, AppError> {
        let session = self.session.ensure_session_within(self.auth_wait).await?;

        let body = UpstreamChatBody {
            model: upstream_model,
            messages,
            stream,
            temperature: params.temperature,
            top_p: params.top_p,
            max_tokens: params.max_tokens,
            stop: params.stop.as_deref(),
            n: 1,
            intent: false,
        };
        let payload = serde_json::to_vec(&body)
            .map_err(|e| AppError::Internal(format!("failed to encode upstream request: {}", e)))?;

        let resp = client
            .post(&self.chat_url)
            .header(AUTHORIZATION, format!("Bearer {}", session.bearer()))
            .header(CONTENT_TYPE, "application/json")
            .header("editor-version", EDITOR_VERSION)
            .header("editor-plugin-version", EDITOR_PLUGIN_VERSION)
            .header("user-agent", INTEGRATION_USER_AGENT)
            .body(payload)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("upstream request failed after retry: {}", e);
                AppError::UpstreamUnavailable(e.to_string())
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        if status == StatusCode::UNAUTHORIZED {
            self.expire(&session).await;
            return Err(AppError::UpstreamAuthExpired);
        }

        let text = resp.text().await.unwrap_or_default();
        Err(classify_failure(status, &text))
    }

    async fn expire(&self, session: &UpstreamSession) {
        if let Err(e) = self.session.mark_expired(session).await {
            tracing::error!("failed to record expired upstream session: {}", e);
        }
    }
}

fn retry_once() -> RetryTransientMiddleware<ExponentialBackoff, TransientOnly> {
    RetryTransientMiddleware::new_with_policy_and_strategy(
        ExponentialBackoff::builder().build_with_max_retries(1),
        TransientOnly,
    )
}

fn classify_failure(status: StatusCode, text: &str) -> AppError {
    if status.is_server_error() {
        return AppError::UpstreamUnavailable(format!("upstream returned {}", status.as_u16()));
    }
    let message = serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| text.chars().take(200).collect());
    AppError::Upstream {
        status: status.as_u16(),
        message,
    }
}

fn parse_completion(body: &Value) -> Completion {
    let choice = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first());
    let content = choice
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let finish_reason = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(Value::as_str)
        .unwrap_or("stop")
        .to_string();
    let usage = body
        .get("usage")
        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());
    let model = body.get("model").and_then(Value::as_str).map(str::to_string);

    Completion {
        content,
        finish_reason,
        usage,
        model,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_completion() {
        let parsed = parse_completion(&json!({
            "model": "gpt-4.1-2025-04-14",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "1, 2, 3"}, "finish_reason": "length"}],
            "usage": {"prompt_tokens": 4, "completion_tokens": 3, "total_tokens": 7}
        }));
        assert_eq!(parsed.content, "1, 2, 3");
        assert_eq!(parsed.finish_reason, "length");
        assert_eq!(parsed.usage.unwrap().total_tokens, 7);
    }

    #[test]
    fn test_parse_completion_tolerates_missing_fields() {
        let parsed = parse_completion(&json!({"choices": []}));
        assert_eq!(parsed.content, "");
        assert_eq!(parsed.finish_reason, "stop");
        assert!(parsed.usage.is_none());
    }

    #[test]
    fn test_classify_failure() {
        let err = classify_failure(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"model not supported"}}"#,
        );
        assert!(matches!(err, AppError::Upstream { status: 400, ref message } if message == "model not supported"));

        let err = classify_failure(StatusCode::BAD_GATEWAY, "");
        assert_eq!(err.kind(), "upstream_unavailable");

        let err = classify_failure(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(err, AppError::Upstream { status: 429, .. }));
    }
}

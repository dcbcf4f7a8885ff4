//! Talking to the upstream authorization endpoints.
//!
//! The manager only sees [`AuthorizationBackend`]; tests substitute a fake.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::Config;

/// Identification the upstream expects from editor integrations.
pub(crate) const EDITOR_VERSION: &str = "Neovim/0.6.1";
pub(crate) const EDITOR_PLUGIN_VERSION: &str = "copilot.vim/1.16.0";
pub(crate) const INTEGRATION_USER_AGENT: &str = "GithubCopilot/1.155.0";

const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_interval() -> u64 {
    5
}

/// One answer from the grant endpoint while the human is (maybe) verifying.
#[derive(Debug, Clone)]
pub enum GrantPoll {
    Granted(Zeroizing<String>),
    Pending,
    SlowDown,
    Expired,
    Denied,
}

#[derive(Debug, Clone)]
pub struct SessionToken {
    pub token: Zeroizing<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Network trouble or a 5xx; worth trying again.
    #[error("transient: {0}")]
    Transient(String),
    /// The credential we presented is no longer accepted.
    #[error("rejected: {0}")]
    Rejected(String),
    /// Anything else the endpoint said that we cannot act on.
    #[error("protocol: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait AuthorizationBackend: Send + Sync {
    async fn request_device_code(&self) -> Result<DeviceCode, BackendError>;

    async fn poll_grant(&self, device_code: &str) -> Result<GrantPoll, BackendError>;

    /// Trades the long-lived grant for a short-lived session token.
    async fn exchange(&self, grant: &str) -> Result<SessionToken, BackendError>;
}

pub struct HttpAuthorizationBackend {
    client: reqwest::Client,
    device_code_url: String,
    access_token_url: String,
    session_token_url: String,
    client_id: String,
    scope: String,
}

impl HttpAuthorizationBackend {
    pub fn new(cfg: &Config) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert("editor-version", HeaderValue::from_static(EDITOR_VERSION));
        headers.insert(
            "editor-plugin-version",
            HeaderValue::from_static(EDITOR_PLUGIN_VERSION),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static(INTEGRATION_USER_AGENT));

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .default_headers(headers)
            .timeout(cfg.request_timeout.min(Duration::from_secs(30)))
            .connect_timeout(cfg.connect_timeout)
            .build()?;

        Ok(Self {
            client,
            device_code_url: cfg.device_code_url.clone(),
            access_token_url: cfg.access_token_url.clone(),
            session_token_url: cfg.session_token_url.clone(),
            client_id: cfg.client_id.clone(),
            scope: cfg.oauth_scope.clone(),
        })
    }

    async fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<(reqwest::StatusCode, String), BackendError> {
        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        let text = resp.text().await.map_err(transport_error)?;
        Ok((status, text))
    }
}

#[derive(Deserialize)]
struct GrantResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct SessionTokenResponse {
    token: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

#[async_trait]
impl AuthorizationBackend for HttpAuthorizationBackend {
    async fn request_device_code(&self) -> Result<DeviceCode, BackendError> {
        let (status, text) = self
            .post_json(
                &self.device_code_url,
                serde_json::json!({ "client_id": self.client_id, "scope": self.scope }),
            )
            .await?;
        if status.is_server_error() {
            return Err(BackendError::Transient(format!("device code endpoint returned {}", status)));
        }
        if !status.is_success() {
            return Err(BackendError::Protocol(format!(
                "device code endpoint returned {}: {}",
                status,
                truncate(&text)
            )));
        }
        serde_json::from_str(&text)
            .map_err(|e| BackendError::Protocol(format!("unreadable device code response: {}", e)))
    }

    async fn poll_grant(&self, device_code: &str) -> Result<GrantPoll, BackendError> {
        let (status, text) = self
            .post_json(
                &self.access_token_url,
                serde_json::json!({
                    "client_id": self.client_id,
                    "device_code": device_code,
                    "grant_type": DEVICE_GRANT_TYPE,
                }),
            )
            .await?;
        if status.is_server_error() {
            return Err(BackendError::Transient(format!("grant endpoint returned {}", status)));
        }

        // Pending answers come back as 200 from some servers and 400 from others.
        let parsed: GrantResponse = serde_json::from_str(&text).map_err(|_| {
            BackendError::Protocol(format!(
                "grant endpoint returned {}: {}",
                status,
                truncate(&text)
            ))
        })?;
        classify_grant(parsed)
    }

    async fn exchange(&self, grant: &str) -> Result<SessionToken, BackendError> {
        let resp = self
            .client
            .get(&self.session_token_url)
            .header(AUTHORIZATION, format!("token {}", grant))
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        let text = resp.text().await.map_err(transport_error)?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(BackendError::Rejected(format!("session endpoint returned {}", status)));
        }
        if status.is_server_error() {
            return Err(BackendError::Transient(format!("session endpoint returned {}", status)));
        }
        if !status.is_success() {
            return Err(BackendError::Protocol(format!(
                "session endpoint returned {}: {}",
                status,
                truncate(&text)
            )));
        }

        let parsed: SessionTokenResponse = serde_json::from_str(&text)
            .map_err(|e| BackendError::Protocol(format!("unreadable session token: {}", e)))?;
        Ok(SessionToken {
            token: Zeroizing::new(parsed.token),
            expires_at: parsed
                .expires_at
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        })
    }
}

fn classify_grant(resp: GrantResponse) -> Result<GrantPoll, BackendError> {
    if let Some(token) = resp.access_token.filter(|t| !t.is_empty()) {
        return Ok(GrantPoll::Granted(Zeroizing::new(token)));
    }
    match resp.error.as_deref() {
        Some("authorization_pending") => Ok(GrantPoll::Pending),
        Some("slow_down") => Ok(GrantPoll::SlowDown),
        Some("expired_token") => Ok(GrantPoll::Expired),
        Some("access_denied") => Ok(GrantPoll::Denied),
        Some(other) => Err(BackendError::Protocol(format!(
            "device flow error: {} {}",
            other,
            resp.error_description.unwrap_or_default()
        ))),
        None => Err(BackendError::Protocol(
            "grant response carried neither a token nor an error".to_string(),
        )),
    }
}

fn transport_error(e: reqwest::Error) -> BackendError {
    BackendError::Transient(e.to_string())
}

fn truncate(text: &str) -> String {
    text.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend_for(server: &MockServer) -> HttpAuthorizationBackend {
        let cfg = Config {
            device_code_url: format!("{}/login/device/code", server.uri()),
            access_token_url: format!("{}/login/oauth/access_token", server.uri()),
            session_token_url: format!("{}/copilot_internal/v2/token", server.uri()),
            ..Config::default()
        };
        HttpAuthorizationBackend::new(&cfg).unwrap()
    }

    #[tokio::test]
    async fn test_request_device_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login/device/code"))
            .and(body_partial_json(serde_json::json!({"scope": "read:user"})))
            .and(header("editor-version", EDITOR_VERSION))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "device_code": "dc",
                "user_code": "ABCD-1234",
                "verification_uri": "https://example.com/login/device",
                "expires_in": 900
            })))
            .expect(1)
            .mount(&server)
            .await;

        let code = backend_for(&server).request_device_code().await.unwrap();
        assert_eq!(code.user_code, "ABCD-1234");
        assert_eq!(code.interval, 5);
    }

    #[tokio::test]
    async fn test_poll_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login/oauth/access_token"))
            .and(body_partial_json(serde_json::json!({"device_code": "pending"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"error": "authorization_pending"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/login/oauth/access_token"))
            .and(body_partial_json(serde_json::json!({"device_code": "denied"})))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(serde_json::json!({"error": "access_denied"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/login/oauth/access_token"))
            .and(body_partial_json(serde_json::json!({"device_code": "ok"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"access_token": "gho_x"})),
            )
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        assert!(matches!(backend.poll_grant("pending").await.unwrap(), GrantPoll::Pending));
        assert!(matches!(backend.poll_grant("denied").await.unwrap(), GrantPoll::Denied));
        match backend.poll_grant("ok").await.unwrap() {
            GrantPoll::Granted(g) => assert_eq!(g.as_str(), "gho_x"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exchange_classifies_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/copilot_internal/v2/token"))
            .and(header("authorization", "token good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": "tid=abc",
                "expires_at": 4_102_444_800i64
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/copilot_internal/v2/token"))
            .and(header("authorization", "token stale"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        let token = backend.exchange("good").await.unwrap();
        assert_eq!(token.token.as_str(), "tid=abc");
        assert_eq!(token.expires_at.unwrap().timestamp(), 4_102_444_800);

        let err = backend.exchange("stale").await.unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
    }

    #[test]
    fn test_classify_unknown_error() {
        let resp = GrantResponse {
            access_token: None,
            error: Some("unsupported_grant_type".into()),
            error_description: None,
        };
        assert!(matches!(classify_grant(resp), Err(BackendError::Protocol(_))));
    }
}

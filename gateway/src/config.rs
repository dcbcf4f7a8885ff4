use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

/// What to do when the upstream stream breaks after the first chunk was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorPolicy {
    /// Close with a `"stop"` terminal chunk and the end-of-stream marker only.
    Stop,
    /// Close with the `"stop"` terminal chunk, then an `{"error": ...}` event,
    /// then the end-of-stream marker.
    ErrorEvent,
}

impl std::str::FromStr for StreamErrorPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "stop" => Ok(StreamErrorPolicy::Stop),
            "error_event" => Ok(StreamErrorPolicy::ErrorEvent),
            other => anyhow::bail!(
                "invalid stream error policy '{}': expected 'stop' or 'error_event'",
                other
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Static caller key checked in addition to issued tokens.
    pub api_key: Option<String>,
    /// Enables the `/api/v1` administration surface when set.
    pub admin_key: Option<String>,
    /// Holds `tokens.json` and `upstream_session.json`.
    pub data_dir: PathBuf,
    pub upstream_url: String,
    pub device_code_url: String,
    pub access_token_url: String,
    pub session_token_url: String,
    pub client_id: String,
    pub oauth_scope: String,
    pub default_model: String,
    /// Extra `(alias, upstream)` pairs layered over the built-in catalog.
    pub model_aliases: Vec<(String, String)>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub handshake_timeout: Duration,
    /// How long a chat request waits on a pending upstream authorization.
    pub auth_wait: Duration,
    pub stream_error_policy: StreamErrorPolicy,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            api_key: None,
            admin_key: None,
            data_dir: PathBuf::from("./data"),
            upstream_url: "https://api.githubcopilot.com".into(),
            device_code_url: "https://github.com/login/device/code".into(),
            access_token_url: "https://github.com/login/oauth/access_token".into(),
            session_token_url: "https://api.github.com/copilot_internal/v2/token".into(),
            client_id: "Iv1.b507a08c87ecfe98".into(),
            oauth_scope: "read:user".into(),
            default_model: "gpt-4.1".into(),
            model_aliases: Vec::new(),
            request_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
            stream_idle_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(900),
            auth_wait: Duration::from_secs(30),
            stream_error_policy: StreamErrorPolicy::ErrorEvent,
            log_json: false,
        }
    }
}

impl Config {
    pub fn tokens_path(&self) -> PathBuf {
        self.data_dir.join("tokens.json")
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join("upstream_session.json")
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let defaults = Config::default();

    let upstream_url = env_or("CHATGATE_UPSTREAM_URL", &defaults.upstream_url);
    let device_code_url = env_or("CHATGATE_DEVICE_CODE_URL", &defaults.device_code_url);
    let access_token_url = env_or("CHATGATE_ACCESS_TOKEN_URL", &defaults.access_token_url);
    let session_token_url = env_or("CHATGATE_SESSION_TOKEN_URL", &defaults.session_token_url);
    for (name, value) in [
        ("CHATGATE_UPSTREAM_URL", &upstream_url),
        ("CHATGATE_DEVICE_CODE_URL", &device_code_url),
        ("CHATGATE_ACCESS_TOKEN_URL", &access_token_url),
        ("CHATGATE_SESSION_TOKEN_URL", &session_token_url),
    ] {
        url::Url::parse(value).with_context(|| format!("{} is not a valid URL", name))?;
    }

    let stream_error_policy = match std::env::var("CHATGATE_STREAM_ERROR_POLICY") {
        Ok(v) => v.parse()?,
        Err(_) => defaults.stream_error_policy,
    };

    Ok(Config {
        host: std::env::var("CHATGATE_HOST")
            .or_else(|_| std::env::var("HOST"))
            .unwrap_or(defaults.host),
        port: std::env::var("CHATGATE_PORT")
            .or_else(|_| std::env::var("PORT"))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.port),
        api_key: non_empty_env("CHATGATE_API_KEY").or_else(|| non_empty_env("OPENAI_API_KEY")),
        admin_key: non_empty_env("CHATGATE_ADMIN_KEY"),
        data_dir: std::env::var("CHATGATE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir),
        upstream_url: upstream_url.trim_end_matches('/').to_string(),
        device_code_url,
        access_token_url,
        session_token_url,
        client_id: env_or("CHATGATE_CLIENT_ID", &defaults.client_id),
        oauth_scope: env_or("CHATGATE_OAUTH_SCOPE", &defaults.oauth_scope),
        default_model: env_or("CHATGATE_DEFAULT_MODEL", &defaults.default_model),
        model_aliases: parse_aliases(&std::env::var("CHATGATE_MODEL_ALIASES").unwrap_or_default())?,
        request_timeout: secs_or("CHATGATE_REQUEST_TIMEOUT_SECS", defaults.request_timeout),
        connect_timeout: secs_or("CHATGATE_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
        stream_idle_timeout: secs_or(
            "CHATGATE_STREAM_IDLE_TIMEOUT_SECS",
            defaults.stream_idle_timeout,
        ),
        handshake_timeout: secs_or("CHATGATE_HANDSHAKE_TIMEOUT_SECS", defaults.handshake_timeout),
        auth_wait: secs_or("CHATGATE_AUTH_WAIT_SECS", defaults.auth_wait),
        stream_error_policy,
        log_json: std::env::var("CHATGATE_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false),
    })
}

/// Parses `alias=upstream,alias2=upstream2`.
pub fn parse_aliases(raw: &str) -> anyhow::Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (alias, upstream) = pair
                .split_once('=')
                .with_context(|| format!("model alias '{}' must look like alias=upstream", pair))?;
            let (alias, upstream) = (alias.trim(), upstream.trim());
            if alias.is_empty() || upstream.is_empty() {
                anyhow::bail!("model alias '{}' has an empty side", pair);
            }
            Ok((alias.to_string(), upstream.to_string()))
        })
        .collect()
}

fn env_or(name: &str, default: &str) -> String {
    non_empty_env(name).unwrap_or_else(|| default.to_string())
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn secs_or(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        let aliases = parse_aliases(" gpt-4 = gpt-4.1 ,fast=gpt-4o-mini,").unwrap();
        assert_eq!(
            aliases,
            vec![
                ("gpt-4".to_string(), "gpt-4.1".to_string()),
                ("fast".to_string(), "gpt-4o-mini".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_aliases_rejects_malformed() {
        assert!(parse_aliases("gpt-4").is_err());
        assert!(parse_aliases("=gpt-4.1").is_err());
    }

    #[test]
    fn test_stream_error_policy_from_str() {
        assert_eq!("stop".parse::<StreamErrorPolicy>().unwrap(), StreamErrorPolicy::Stop);
        assert_eq!(
            "error_event".parse::<StreamErrorPolicy>().unwrap(),
            StreamErrorPolicy::ErrorEvent
        );
        assert!("explode".parse::<StreamErrorPolicy>().is_err());
    }

    #[test]
    fn test_data_paths() {
        let cfg = Config {
            data_dir: PathBuf::from("/tmp/cg"),
            ..Config::default()
        };
        assert_eq!(cfg.tokens_path(), PathBuf::from("/tmp/cg/tokens.json"));
        assert_eq!(cfg.session_path(), PathBuf::from("/tmp/cg/upstream_session.json"));
    }
}

//! Shared fixtures: a scripted authorization backend and a gateway wired to a
//! mock upstream.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chatgate::config::Config;
use chatgate::session::{AuthorizationBackend, BackendError, DeviceCode, GrantPoll, SessionToken};
use chatgate::AppState;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use zeroize::Zeroizing;

/// Authorization backend that answers from scripts and counts every call.
///
/// With empty scripts every poll grants immediately and every exchange hands
/// out `session-<n>` valid for an hour.
#[derive(Default)]
pub struct FakeBackend {
    pub device_code_calls: AtomicUsize,
    pub poll_calls: AtomicUsize,
    pub exchange_calls: AtomicUsize,
    pub interval: u64,
    pub exchange_delay: Duration,
    polls: Mutex<VecDeque<Result<GrantPoll, BackendError>>>,
    exchanges: Mutex<VecDeque<Result<SessionToken, BackendError>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exchange_delay(mut self, delay: Duration) -> Self {
        self.exchange_delay = delay;
        self
    }

    pub fn with_interval(mut self, secs: u64) -> Self {
        self.interval = secs;
        self
    }

    pub fn script_polls(self, polls: Vec<Result<GrantPoll, BackendError>>) -> Self {
        *self.polls.lock().unwrap() = polls.into();
        self
    }

    pub fn script_exchanges(self, exchanges: Vec<Result<SessionToken, BackendError>>) -> Self {
        *self.exchanges.lock().unwrap() = exchanges.into();
        self
    }

    pub fn device_codes(&self) -> usize {
        self.device_code_calls.load(Ordering::SeqCst)
    }

    pub fn exchanges(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }
}

pub fn session_token(token: &str, valid_for_secs: i64) -> SessionToken {
    SessionToken {
        token: Zeroizing::new(token.to_string()),
        expires_at: Some(Utc::now() + chrono::Duration::seconds(valid_for_secs)),
    }
}

#[async_trait]
impl AuthorizationBackend for FakeBackend {
    async fn request_device_code(&self) -> Result<DeviceCode, BackendError> {
        self.device_code_calls.fetch_add(1, Ordering::SeqCst);
        Ok(DeviceCode {
            device_code: "dev-code".into(),
            user_code: "ABCD-1234".into(),
            verification_uri: "https://example.test/login/device".into(),
            expires_in: 900,
            interval: self.interval,
        })
    }

    async fn poll_grant(&self, _device_code: &str) -> Result<GrantPoll, BackendError> {
        let n = self.poll_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let scripted = self.polls.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(GrantPoll::Granted(Zeroizing::new(format!("grant-{}", n)))))
    }

    async fn exchange(&self, _grant: &str) -> Result<SessionToken, BackendError> {
        let n = self.exchange_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.exchange_delay.is_zero() {
            tokio::time::sleep(self.exchange_delay).await;
        }
        let scripted = self.exchanges.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(session_token(&format!("session-{}", n), 3600)))
    }
}

pub fn test_config(data_dir: &Path, upstream_url: &str) -> Config {
    Config {
        data_dir: data_dir.to_path_buf(),
        upstream_url: upstream_url.trim_end_matches('/').to_string(),
        auth_wait: Duration::from_secs(5),
        handshake_timeout: Duration::from_secs(30),
        request_timeout: Duration::from_secs(10),
        stream_idle_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

pub fn build_state(config: Config, backend: Arc<FakeBackend>) -> Arc<AppState> {
    Arc::new(AppState::with_backend(config, backend).expect("state builds"))
}

/// Upstream that answers its first request with one SSE chunk and then keeps
/// the response open. The receiver fires once the client hangs up.
pub async fn lingering_sse_upstream() -> (String, oneshot::Receiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (hung_up, hung_up_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let mut head = Vec::new();
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            head.extend_from_slice(&buf[..n]);
        }

        let event = "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"}}]}\n\n";
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{}\r\n",
            event.len(),
            event
        );
        socket.write_all(response.as_bytes()).await.unwrap();

        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = hung_up.send(());
    });

    (format!("http://{}", addr), hung_up_rx)
}

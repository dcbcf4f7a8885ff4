//! The device-code poll loop.

use std::time::Duration;

use tokio::time::Instant;
use zeroize::Zeroizing;

use crate::errors::AppError;
use crate::session::backend::{AuthorizationBackend, BackendError, DeviceCode, GrantPoll};

/// Added to the poll interval each time the server answers `slow_down`.
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// Floor for the server-sent interval; `0` would poll in a tight loop.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub async fn request_device_code(
    backend: &dyn AuthorizationBackend,
) -> Result<DeviceCode, AppError> {
    backend.request_device_code().await.map_err(|e| match e {
        BackendError::Transient(msg) => AppError::UpstreamUnavailable(msg),
        BackendError::Rejected(msg) | BackendError::Protocol(msg) => {
            AppError::AuthenticationRequired(format!("could not start device authorization: {}", msg))
        }
    })
}

/// Polls until the human approves, the code expires, or `timeout` runs out,
/// whichever comes first. Transient failures are retried at the current interval.
pub async fn poll_for_grant(
    backend: &dyn AuthorizationBackend,
    code: &DeviceCode,
    timeout: Duration,
) -> Result<Zeroizing<String>, AppError> {
    let limit = if code.expires_in > 0 {
        timeout.min(Duration::from_secs(code.expires_in))
    } else {
        timeout
    };
    let deadline = Instant::now() + limit;
    let mut interval = Duration::from_secs(code.interval).max(MIN_POLL_INTERVAL);
    let mut attempts: u32 = 0;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(AppError::AuthenticationRequired(
                "device authorization was not completed in time".to_string(),
            ));
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
        attempts += 1;

        match backend.poll_grant(&code.device_code).await {
            Ok(GrantPoll::Granted(grant)) => {
                tracing::debug!(attempts, "device authorization granted");
                return Ok(grant);
            }
            Ok(GrantPoll::Pending) => {}
            Ok(GrantPoll::SlowDown) => {
                interval += SLOW_DOWN_STEP;
                tracing::debug!(interval_secs = interval.as_secs(), "grant endpoint asked to slow down");
            }
            Ok(GrantPoll::Expired) => {
                return Err(AppError::AuthenticationRequired(
                    "device code expired before it was verified".to_string(),
                ))
            }
            Ok(GrantPoll::Denied) => {
                return Err(AppError::AuthenticationRequired(
                    "device authorization was denied".to_string(),
                ))
            }
            Err(BackendError::Transient(msg)) => {
                tracing::warn!(attempts, "grant poll failed, will retry: {}", msg);
            }
            Err(BackendError::Rejected(msg)) | Err(BackendError::Protocol(msg)) => {
                return Err(AppError::AuthenticationRequired(msg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::session::backend::SessionToken;

    struct Scripted {
        polls: Mutex<Vec<Result<GrantPoll, BackendError>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(mut polls: Vec<Result<GrantPoll, BackendError>>) -> Self {
            polls.reverse();
            Self {
                polls: Mutex::new(polls),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AuthorizationBackend for Scripted {
        async fn request_device_code(&self) -> Result<DeviceCode, BackendError> {
            unreachable!()
        }

        async fn poll_grant(&self, _device_code: &str) -> Result<GrantPoll, BackendError> {
            self.calls.lock().unwrap().push(Instant::now());
            self.polls.lock().unwrap().pop().unwrap_or(Ok(GrantPoll::Pending))
        }

        async fn exchange(&self, _grant: &str) -> Result<SessionToken, BackendError> {
            unreachable!()
        }
    }

    fn code(interval: u64, expires_in: u64) -> DeviceCode {
        DeviceCode {
            device_code: "dc".into(),
            user_code: "ABCD-1234".into(),
            verification_uri: "https://example.com/device".into(),
            expires_in,
            interval,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let backend = Scripted::new(vec![
            Ok(GrantPoll::Pending),
            Err(BackendError::Transient("connection reset".into())),
            Ok(GrantPoll::Granted(Zeroizing::new("gho_ok".into()))),
        ]);
        let grant = poll_for_grant(&backend, &code(5, 900), Duration::from_secs(900))
            .await
            .unwrap();
        assert_eq!(grant.as_str(), "gho_ok");
        assert_eq!(backend.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_down_widens_interval() {
        let backend = Scripted::new(vec![
            Ok(GrantPoll::SlowDown),
            Ok(GrantPoll::Granted(Zeroizing::new("g".into()))),
        ]);
        poll_for_grant(&backend, &code(5, 900), Duration::from_secs(900))
            .await
            .unwrap();
        let calls = backend.calls.lock().unwrap();
        assert_eq!(calls[1] - calls[0], Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout() {
        let backend = Scripted::new(vec![]);
        let started = Instant::now();
        let err = poll_for_grant(&backend, &code(5, 900), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "upstream_authentication_required");
        assert!(started.elapsed() <= Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_floored() {
        let backend = Scripted::new(vec![]);
        poll_for_grant(&backend, &code(0, 900), Duration::from_secs(10))
            .await
            .unwrap_err();

        let calls = backend.calls.lock().unwrap();
        assert!(calls.len() <= 10, "polled {} times in 10s", calls.len());
        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] >= MIN_POLL_INTERVAL);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_and_expired() {
        let denied = Scripted::new(vec![Ok(GrantPoll::Denied)]);
        let err = poll_for_grant(&denied, &code(1, 900), Duration::from_secs(900))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("denied"));

        let expired = Scripted::new(vec![Ok(GrantPoll::Expired)]);
        let err = poll_for_grant(&expired, &code(1, 900), Duration::from_secs(900))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expired"));
    }
}

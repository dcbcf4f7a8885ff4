use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use zeroize::Zeroizing;

use crate::errors::AppError;
use crate::session::backend::{AuthorizationBackend, BackendError, SessionToken};
use crate::session::{
    handshake, PendingVerification, SessionEvent, SessionState, SessionStatus, UpstreamSession,
};
use crate::store::secure_file;

type AuthorizeFuture = Shared<BoxFuture<'static, Result<UpstreamSession, AppError>>>;

#[derive(Default, Serialize, Deserialize)]
struct PersistedSession {
    #[serde(default)]
    grant: Option<String>,
    #[serde(default)]
    session_token: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

struct Slot {
    state: SessionState,
    grant: Option<Zeroizing<String>>,
    session: Option<UpstreamSession>,
    pending: Option<PendingVerification>,
}

struct Inner {
    backend: Arc<dyn AuthorizationBackend>,
    path: PathBuf,
    handshake_timeout: Duration,
    slot: RwLock<Slot>,
    /// The one authorization currently running, shared by every waiter.
    inflight: Mutex<Option<AuthorizeFuture>>,
    events: broadcast::Sender<SessionEvent>,
}

/// Process-wide owner of the upstream credential.
///
/// Requests holding a valid session only take a read lock. When the session is
/// missing or stale, the first caller spawns the authorization task and every
/// concurrent caller awaits that same task's result.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Restores whatever was persisted at `path`.
    pub fn open(
        backend: Arc<dyn AuthorizationBackend>,
        path: impl Into<PathBuf>,
        handshake_timeout: Duration,
    ) -> Result<Self, AppError> {
        let path = path.into();
        let persisted: PersistedSession = secure_file::read_json(&path)?.unwrap_or_default();

        let grant = persisted.grant.map(Zeroizing::new);
        let session = persisted
            .session_token
            .map(|token| UpstreamSession::new(token, persisted.expires_at))
            .filter(|s| !s.is_expired());

        let state = match (&session, &grant) {
            (Some(_), _) => SessionState::Authorized,
            (None, Some(_)) => SessionState::Expired,
            (None, None) => SessionState::Unauthenticated,
        };
        tracing::info!(state = state.as_str(), "upstream session loaded");

        let (events, _) = broadcast::channel(16);
        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                path,
                handshake_timeout,
                slot: RwLock::new(Slot {
                    state,
                    grant,
                    session,
                    pending: None,
                }),
                inflight: Mutex::new(None),
                events,
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.slot.read().await.state
    }

    /// The current session if it is authorized and not about to expire.
    pub async fn current(&self) -> Option<UpstreamSession> {
        self.inner.current().await
    }

    pub async fn status(&self) -> SessionStatus {
        let authorization_in_flight = self.inner.inflight.lock().await.is_some();
        let slot = self.inner.slot.read().await;
        SessionStatus {
            state: slot.state,
            expires_at: slot.session.as_ref().and_then(|s| s.expires_at),
            has_grant: slot.grant.is_some(),
            pending_verification: slot.pending.clone(),
            authorization_in_flight,
        }
    }

    /// Returns a usable session, authorizing first if needed.
    pub async fn ensure_session(&self) -> Result<UpstreamSession, AppError> {
        if let Some(session) = self.inner.current().await {
            return Ok(session);
        }

        let authorization = {
            let mut inflight = self.inner.inflight.lock().await;
            // Another caller may have finished while we waited for the lock.
            if let Some(session) = self.inner.current().await {
                return Ok(session);
            }
            match inflight.as_ref() {
                Some(running) => running.clone(),
                None => {
                    let inner = self.inner.clone();
                    let task = tokio::spawn(async move {
                        let result = authorize(&inner).await;
                        *inner.inflight.lock().await = None;
                        result
                    });
                    let shared = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(AppError::Internal(format!("authorization task failed: {}", e)))
                        })
                    }
                    .boxed()
                    .shared();
                    *inflight = Some(shared.clone());
                    shared
                }
            }
        };

        authorization.await
    }

    /// Like [`ensure_session`](Self::ensure_session) but gives up waiting after
    /// `wait`. The authorization itself keeps running in the background.
    pub async fn ensure_session_within(&self, wait: Duration) -> Result<UpstreamSession, AppError> {
        match tokio::time::timeout(wait, self.ensure_session()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::AuthenticationRequired(
                "upstream authorization is pending; complete the device verification and retry"
                    .to_string(),
            )),
        }
    }

    /// Drops `used` after the upstream refused it. A no-op when the session
    /// has already been replaced. Re-authorization happens on the next
    /// `ensure_session` call.
    pub async fn mark_expired(&self, used: &UpstreamSession) -> Result<bool, AppError> {
        let mut slot = self.inner.slot.write().await;
        let same = slot
            .session
            .as_ref()
            .map(|current| current.same_token(used))
            .unwrap_or(false);
        if !same {
            return Ok(false);
        }

        slot.session = None;
        slot.state = SessionState::Expired;
        tracing::warn!("upstream rejected the session token, marked expired");
        self.inner.emit(SessionEvent::Expired);
        self.inner.persist(&slot)?;
        Ok(true)
    }

    /// Forgets the grant and session, on disk and in memory.
    pub async fn logout(&self) -> Result<(), AppError> {
        let mut slot = self.inner.slot.write().await;
        secure_file::remove(&self.inner.path)?;
        slot.state = SessionState::Unauthenticated;
        slot.grant = None;
        slot.session = None;
        slot.pending = None;
        tracing::info!("upstream session cleared");
        Ok(())
    }
}

impl Inner {
    async fn current(&self) -> Option<UpstreamSession> {
        let slot = self.slot.read().await;
        match (&slot.state, &slot.session) {
            (SessionState::Authorized, Some(session)) if !session.is_expired() => {
                Some(session.clone())
            }
            _ => None,
        }
    }

    fn persist(&self, slot: &Slot) -> Result<(), AppError> {
        let persisted = PersistedSession {
            grant: slot.grant.as_ref().map(|g| g.to_string()),
            session_token: slot.session.as_ref().map(|s| s.bearer().to_string()),
            expires_at: slot.session.as_ref().and_then(|s| s.expires_at),
        };
        secure_file::write_json(&self.path, &persisted)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn install(
        &self,
        grant: Zeroizing<String>,
        token: SessionToken,
    ) -> Result<UpstreamSession, AppError> {
        let session = UpstreamSession::new(token.token.as_str(), token.expires_at);

        let mut slot = self.slot.write().await;
        slot.grant = Some(grant);
        slot.session = Some(session.clone());
        slot.pending = None;
        if let Err(e) = self.persist(&slot) {
            slot.session = None;
            slot.state = SessionState::Expired;
            self.emit(SessionEvent::AuthorizationFailed {
                reason: e.public_message(),
            });
            return Err(e);
        }
        slot.state = SessionState::Authorized;
        drop(slot);

        tracing::info!(expires_at = ?session.expires_at, "upstream session authorized");
        self.emit(SessionEvent::Authorized {
            expires_at: session.expires_at,
        });
        Ok(session)
    }

    async fn device_flow(&self) -> Result<Zeroizing<String>, AppError> {
        {
            let mut slot = self.slot.write().await;
            slot.state = SessionState::AuthorizationPending;
            slot.session = None;
        }

        let result = async {
            let code = handshake::request_device_code(self.backend.as_ref()).await?;
            tracing::warn!(
                verification_uri = %code.verification_uri,
                user_code = %code.user_code,
                "upstream authorization required: open the URL and enter the code"
            );
            self.slot.write().await.pending = Some(PendingVerification {
                verification_uri: code.verification_uri.clone(),
                user_code: code.user_code.clone(),
                expires_at: Utc::now() + chrono::Duration::seconds(code.expires_in as i64),
            });
            self.emit(SessionEvent::VerificationRequired {
                verification_uri: code.verification_uri.clone(),
                user_code: code.user_code.clone(),
                expires_in: code.expires_in,
            });

            let grant =
                handshake::poll_for_grant(self.backend.as_ref(), &code, self.handshake_timeout)
                    .await?;

            let mut slot = self.slot.write().await;
            slot.grant = Some(grant.clone());
            slot.pending = None;
            self.persist(&slot)?;
            Ok::<_, AppError>(grant)
        }
        .await;

        if let Err(e) = &result {
            let mut slot = self.slot.write().await;
            slot.state = SessionState::Unauthenticated;
            slot.grant = None;
            slot.pending = None;
            drop(slot);
            tracing::error!("upstream authorization failed: {}", e);
            self.emit(SessionEvent::AuthorizationFailed {
                reason: e.public_message(),
            });
        }
        result
    }
}

async fn authorize(inner: &Inner) -> Result<UpstreamSession, AppError> {
    let grant = inner.slot.read().await.grant.clone();

    if let Some(grant) = grant {
        match inner.backend.exchange(&grant).await {
            Ok(token) => return inner.install(grant, token).await,
            Err(BackendError::Rejected(msg)) => {
                tracing::warn!("upstream grant rejected, starting device authorization: {}", msg);
                let mut slot = inner.slot.write().await;
                slot.state = SessionState::Revoked;
                slot.grant = None;
                slot.session = None;
                inner.persist(&slot)?;
            }
            Err(BackendError::Transient(msg)) | Err(BackendError::Protocol(msg)) => {
                return Err(AppError::UpstreamUnavailable(format!(
                    "session token exchange failed: {}",
                    msg
                )))
            }
        }
    }

    let grant = inner.device_flow().await?;
    match inner.backend.exchange(&grant).await {
        Ok(token) => inner.install(grant, token).await,
        Err(e) => {
            let mut slot = inner.slot.write().await;
            let err = match e {
                BackendError::Rejected(msg) => {
                    slot.grant = None;
                    slot.state = SessionState::Revoked;
                    AppError::AuthenticationRequired(format!(
                        "new grant was refused by the session endpoint: {}",
                        msg
                    ))
                }
                BackendError::Transient(msg) | BackendError::Protocol(msg) => {
                    slot.state = SessionState::Expired;
                    AppError::UpstreamUnavailable(format!("session token exchange failed: {}", msg))
                }
            };
            inner.persist(&slot)?;
            drop(slot);
            inner.emit(SessionEvent::AuthorizationFailed {
                reason: err.public_message(),
            });
            Err(err)
        }
    }
}

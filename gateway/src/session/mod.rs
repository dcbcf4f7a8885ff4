//! Upstream session: the device-code grant and the short-lived bearer token
//! derived from it.
//!
//! [`SessionManager`] is the process-wide owner of that credential. It loads
//! whatever was persisted at startup, runs at most one authorization at a time,
//! and broadcasts [`SessionEvent`]s so the operator can be shown the
//! verification URL without the core doing any console I/O.

pub mod backend;
pub mod handshake;
mod manager;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub use backend::{
    AuthorizationBackend, BackendError, DeviceCode, GrantPoll, HttpAuthorizationBackend,
    SessionToken,
};
pub use manager::SessionManager;

/// Seconds before `expires_at` at which a session token is treated as expired.
pub const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    AuthorizationPending,
    Authorized,
    /// The session token was rejected or ran out; the grant may still be good.
    Expired,
    /// The grant itself was rejected; only a new device flow can recover.
    Revoked,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::AuthorizationPending => "authorization_pending",
            SessionState::Authorized => "authorized",
            SessionState::Expired => "expired",
            SessionState::Revoked => "revoked",
        }
    }
}

/// A usable upstream bearer credential. Cheap to clone.
#[derive(Clone)]
pub struct UpstreamSession {
    token: Arc<Zeroizing<String>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl UpstreamSession {
    pub fn new(token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            token: Arc::new(Zeroizing::new(token.into())),
            expires_at,
        }
    }

    pub fn bearer(&self) -> &str {
        self.token.as_str()
    }

    /// True once within [`EXPIRY_MARGIN_SECS`] of `expires_at`. Tokens without
    /// a known expiry never expire on their own.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => at - chrono::Duration::seconds(EXPIRY_MARGIN_SECS) <= now,
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether two handles carry the same bearer value.
    pub fn same_token(&self, other: &UpstreamSession) -> bool {
        Arc::ptr_eq(&self.token, &other.token) || self.bearer() == other.bearer()
    }
}

impl fmt::Debug for UpstreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamSession")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// What the operator must do to finish a pending authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingVerification {
    pub verification_uri: String,
    pub user_code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    VerificationRequired {
        verification_uri: String,
        user_code: String,
        expires_in: u64,
    },
    Authorized {
        expires_at: Option<DateTime<Utc>>,
    },
    AuthorizationFailed {
        reason: String,
    },
    Expired,
}

/// Snapshot for the admin surface and readiness probe.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub expires_at: Option<DateTime<Utc>>,
    pub has_grant: bool,
    pub pending_verification: Option<PendingVerification>,
    pub authorization_in_flight: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_margin() {
        let now = Utc::now();
        let soon = UpstreamSession::new("t", Some(now + chrono::Duration::seconds(30)));
        let later = UpstreamSession::new("t", Some(now + chrono::Duration::seconds(600)));
        let unknown = UpstreamSession::new("t", None);
        assert!(soon.is_expired_at(now));
        assert!(!later.is_expired_at(now));
        assert!(!unknown.is_expired_at(now));
    }

    #[test]
    fn test_debug_redacts_bearer() {
        let session = UpstreamSession::new("tid=secret-bearer", None);
        let dbg = format!("{:?}", session);
        assert!(!dbg.contains("secret-bearer"));
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::VerificationRequired {
            verification_uri: "https://example.com/device".into(),
            user_code: "ABCD-1234".into(),
            expires_in: 900,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "verification_required");
        assert_eq!(json["user_code"], "ABCD-1234");
    }
}

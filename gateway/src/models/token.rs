use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Non-secret length of the plaintext kept for listings (`sk-` plus 12 hex chars).
pub const DISPLAY_PREFIX_LEN: usize = 15;

/// Caller token metadata as exposed by every read path.
///
/// The secret hash lives only in the store's persisted record type, so nothing
/// holding an `AccessToken` can leak it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub id: String,
    pub display_prefix: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub active: bool,
}

/// Result of issuing a token. `secret` is the only copy of the plaintext.
#[derive(Clone, Serialize)]
pub struct IssuedToken {
    #[serde(flatten)]
    pub token: AccessToken,
    pub secret: String,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &self.token)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTokenRequest {
    #[serde(default)]
    pub label: String,
}

/// Who made an authenticated chat request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerIdentity {
    /// No tokens issued and no static key: the gateway runs open.
    Open,
    StaticKey,
    Token { id: String, label: String },
}

impl CallerIdentity {
    pub fn log_name(&self) -> String {
        match self {
            CallerIdentity::Open => "open".to_string(),
            CallerIdentity::StaticKey => "static-key".to_string(),
            CallerIdentity::Token { id, .. } => id.clone(),
        }
    }
}

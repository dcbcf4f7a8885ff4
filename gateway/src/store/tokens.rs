//! Durable store of caller tokens.
//!
//! Records live in a single owner-only JSON file. Reads go through an in-memory
//! map behind a `RwLock`, so concurrent `authenticate` calls never contend with
//! each other. Every mutation holds `write_lock` plus an advisory lock on the
//! file, re-reads the file, and only becomes visible once the write succeeds.
//!
//! The file is re-read whenever its modification time or length changes, so
//! tokens issued or revoked by the CLI while the server runs take effect on the
//! next request.
//!
//! `last_used_at` is stamped in memory on every hit but written back at most
//! once per [`LAST_USED_PERSIST_INTERVAL_SECS`] per token.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, RwLock};

use crate::errors::AppError;
use crate::models::token::{AccessToken, IssuedToken, DISPLAY_PREFIX_LEN};
use crate::store::secure_file::{self, FileLock, FileStamp};

const SECRET_PREFIX: &str = "sk-";
const SECRET_BYTES: usize = 32;

pub const LAST_USED_PERSIST_INTERVAL_SECS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenRecord {
    id: String,
    secret_hash: String,
    display_prefix: String,
    label: String,
    created_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
    active: bool,
}

impl TokenRecord {
    fn metadata(&self) -> AccessToken {
        AccessToken {
            id: self.id.clone(),
            display_prefix: self.display_prefix.clone(),
            label: self.label.clone(),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            active: self.active,
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
struct TokenFile {
    tokens: Vec<TokenRecord>,
}

pub struct TokenStore {
    path: PathBuf,
    records: RwLock<HashMap<String, TokenRecord>>,
    write_lock: Mutex<()>,
    loaded_stamp: std::sync::Mutex<Option<FileStamp>>,
}

impl TokenStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AppError> {
        let path = path.into();
        let records = load_records(&path)?;
        tracing::debug!(path = %path.display(), count = records.len(), "token store loaded");
        Ok(Self {
            loaded_stamp: std::sync::Mutex::new(secure_file::stamp(&path)),
            path,
            records: RwLock::new(records),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates a token and returns its plaintext secret. Nothing becomes
    /// visible unless the file write succeeds.
    pub async fn issue(&self, label: &str) -> Result<IssuedToken, AppError> {
        let _guard = self.write_lock.lock().await;
        let _file = self.lock_file().await?;
        self.reload().await?;

        let secret = generate_secret();
        let record = TokenRecord {
            id: format!("tok_{}", uuid::Uuid::new_v4().simple()),
            secret_hash: hash_secret(&secret),
            display_prefix: secret.chars().take(DISPLAY_PREFIX_LEN).collect(),
            label: label.trim().to_string(),
            created_at: Utc::now(),
            last_used_at: None,
            active: true,
        };

        let mut next = self.records.read().await.clone();
        next.insert(record.id.clone(), record.clone());
        self.commit(next).await?;

        tracing::info!(token_id = %record.id, label = %record.label, "issued caller token");
        Ok(IssuedToken {
            token: record.metadata(),
            secret,
        })
    }

    /// Matches `presented` against every active token in constant time per
    /// record. A miss is `Ok(None)`; a hit stamps `last_used_at`.
    pub async fn authenticate(&self, presented: &str) -> Result<Option<AccessToken>, AppError> {
        self.reload_if_changed().await?;

        let presented_hash = hash_secret(presented);
        let matched = {
            let records = self.records.read().await;
            let mut matched: Option<String> = None;
            for record in records.values() {
                let equal: bool = record
                    .secret_hash
                    .as_bytes()
                    .ct_eq(presented_hash.as_bytes())
                    .into();
                if equal && record.active {
                    matched = Some(record.id.clone());
                }
            }
            matched
        };

        let Some(id) = matched else {
            return Ok(None);
        };

        let now = Utc::now();
        let (token, stale) = {
            let mut records = self.records.write().await;
            match records.get_mut(&id) {
                // Revoked or deleted by a reload since the match.
                Some(record) if record.active => {
                    let stale = record.last_used_at.map_or(true, |at| {
                        now - at >= chrono::Duration::seconds(LAST_USED_PERSIST_INTERVAL_SECS)
                    });
                    record.last_used_at = Some(now);
                    (record.metadata(), stale)
                }
                _ => return Ok(None),
            }
        };

        if stale {
            match self.persist_last_used(&id, now).await {
                Ok(true) => {}
                Ok(false) => return Ok(None),
                Err(e) => tracing::warn!(token_id = %id, "failed to persist last_used_at: {}", e),
            }
        }
        Ok(Some(token))
    }

    /// All tokens, oldest first, without secret material.
    pub async fn list(&self) -> Result<Vec<AccessToken>, AppError> {
        self.reload_if_changed().await?;
        let records = self.records.read().await;
        let mut tokens: Vec<AccessToken> = records.values().map(TokenRecord::metadata).collect();
        tokens.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tokens)
    }

    pub async fn get(&self, id: &str) -> Result<Option<AccessToken>, AppError> {
        self.reload_if_changed().await?;
        Ok(self.records.read().await.get(id).map(TokenRecord::metadata))
    }

    /// True when no token has ever been issued (revoked records still count).
    pub async fn is_empty(&self) -> Result<bool, AppError> {
        self.reload_if_changed().await?;
        Ok(self.records.read().await.is_empty())
    }

    /// Marks a token inactive. Returns `false` if the id is unknown; revoking
    /// an already revoked token is a no-op that still returns `true`.
    pub async fn revoke(&self, id: &str) -> Result<bool, AppError> {
        let _guard = self.write_lock.lock().await;
        let _file = self.lock_file().await?;
        self.reload().await?;

        let mut next = self.records.read().await.clone();
        match next.get_mut(id) {
            None => return Ok(false),
            Some(record) if !record.active => return Ok(true),
            Some(record) => record.active = false,
        }
        self.commit(next).await?;
        tracing::info!(token_id = %id, "revoked caller token");
        Ok(true)
    }

    /// Removes a token permanently. Returns `false` if it was already gone.
    pub async fn delete(&self, id: &str) -> Result<bool, AppError> {
        let _guard = self.write_lock.lock().await;
        let _file = self.lock_file().await?;
        self.reload().await?;

        let mut next = self.records.read().await.clone();
        if next.remove(id).is_none() {
            return Ok(false);
        }
        self.commit(next).await?;
        tracing::info!(token_id = %id, "deleted caller token");
        Ok(true)
    }

    /// Persists `next`, then publishes it. Caller must hold `write_lock`.
    async fn commit(&self, next: HashMap<String, TokenRecord>) -> Result<(), AppError> {
        let mut tokens: Vec<TokenRecord> = next.values().cloned().collect();
        tokens.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        secure_file::write_json(&self.path, &TokenFile { tokens })?;

        *self.records.write().await = next;
        self.set_loaded_stamp(secure_file::stamp(&self.path));
        Ok(())
    }

    /// Writes a `last_used_at` stamp against the current file contents.
    /// Returns `false` if another handle revoked or deleted the token.
    async fn persist_last_used(&self, id: &str, at: DateTime<Utc>) -> Result<bool, AppError> {
        let _guard = self.write_lock.lock().await;
        let _file = self.lock_file().await?;
        self.reload().await?;

        let mut next = self.records.read().await.clone();
        match next.get_mut(id) {
            Some(record) if record.active => {
                if record.last_used_at.map_or(true, |prev| prev < at) {
                    record.last_used_at = Some(at);
                }
            }
            _ => return Ok(false),
        }
        self.commit(next).await?;
        Ok(true)
    }

    async fn reload_if_changed(&self) -> Result<(), AppError> {
        if !self.file_changed() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        if !self.file_changed() {
            return Ok(());
        }
        self.reload().await?;
        tracing::debug!("token file changed on disk, reloaded");
        Ok(())
    }

    /// Replaces the in-memory map with the file contents. Caller must hold
    /// `write_lock`, and the file lock too when a commit follows.
    async fn reload(&self) -> Result<(), AppError> {
        let stamp = secure_file::stamp(&self.path);
        let records = load_records(&self.path)?;
        *self.records.write().await = records;
        self.set_loaded_stamp(stamp);
        Ok(())
    }

    async fn lock_file(&self) -> Result<FileLock, AppError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || secure_file::lock_exclusive(&path))
            .await
            .map_err(|e| AppError::Internal(format!("token file lock task failed: {}", e)))?
    }

    fn file_changed(&self) -> bool {
        let current = secure_file::stamp(&self.path);
        match self.loaded_stamp.lock() {
            Ok(loaded) => *loaded != current,
            Err(_) => true,
        }
    }

    fn set_loaded_stamp(&self, stamp: Option<FileStamp>) {
        if let Ok(mut loaded) = self.loaded_stamp.lock() {
            *loaded = stamp;
        }
    }
}

fn load_records(path: &Path) -> Result<HashMap<String, TokenRecord>, AppError> {
    let file: TokenFile = secure_file::read_json(path)?.unwrap_or_default();
    Ok(file
        .tokens
        .into_iter()
        .map(|record| (record.id.clone(), record))
        .collect())
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("{}{}", SECRET_PREFIX, hex::encode(bytes))
}

fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

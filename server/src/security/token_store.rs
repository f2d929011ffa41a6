use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use sha2::Sha256;

use super::{query_permission, QUERY_ANY};
use crate::config::SecurityConfig;

type HmacSha256 = Hmac<Sha256>;

pub const MIN_SECRET_LEN: usize = 32;

const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token secret is too short (min {MIN_SECRET_LEN} bytes)")]
    SecretTooShort,

    #[error("token is unknown or revoked")]
    Unknown,

    #[error("token is expired")]
    Expired,
}

/// What a bearer token grants. Records are never mutated after issue.
#[derive(Debug, Clone, Serialize)]
pub struct TokenRecord {
    pub user_id: String,
    pub permissions: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub expires_at: Instant,
}

impl TokenRecord {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn expires_in(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    pub fn can_query(&self, source: &str) -> bool {
        self.has_permission(QUERY_ANY) || self.has_permission(&query_permission(source))
    }
}

/// In-memory token store keyed by an HMAC fingerprint of each token.
#[derive(Clone)]
pub struct TokenStore {
    mac: HmacSha256,
    ttl: Duration,
    // fingerprint -> record
    tokens: Arc<DashMap<String, TokenRecord>>,
}

impl TokenStore {
    pub fn new(secret: &[u8], ttl: Duration) -> Result<Self, TokenError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(TokenError::SecretTooShort);
        }

        let mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::SecretTooShort)?;

        Ok(Self {
            mac,
            ttl,
            tokens: Arc::new(DashMap::new()),
        })
    }

    /// Store keyed with a fresh random secret.
    pub fn with_random_secret(ttl: Duration) -> Result<Self, TokenError> {
        let mut secret = [0u8; MIN_SECRET_LEN];
        OsRng.fill_bytes(&mut secret);
        Self::new(&secret, ttl)
    }

    pub fn from_config(config: &SecurityConfig) -> Result<Self, TokenError> {
        match config.secret_key.as_deref() {
            Some(secret) => Self::new(secret.as_bytes(), config.token_ttl()),
            None => Self::with_random_secret(config.token_ttl()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issues a fresh random token for `user_id`.
    pub fn issue<I, S>(&self, user_id: &str, permissions: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);

        let record = TokenRecord {
            user_id: user_id.to_string(),
            permissions: permissions.into_iter().map(Into::into).collect(),
            created_at: Utc::now(),
            expires_at: Instant::now() + self.ttl,
        };

        log::info!(
            "Issued token for user {} with {} permissions",
            user_id,
            record.permissions.len()
        );
        self.tokens.insert(self.fingerprint(&token), record);

        token
    }

    /// Like [`validate`](Self::validate) but tells unknown and expired apart.
    pub fn check(&self, token: &str) -> Result<TokenRecord, TokenError> {
        let key = self.fingerprint(token);
        let record = self.tokens.get(&key).ok_or(TokenError::Unknown)?;

        if record.is_expired() {
            let user_id = record.user_id.clone();
            drop(record);
            self.tokens.remove(&key);
            log::debug!("Evicted expired token for user {}", user_id);
            return Err(TokenError::Expired);
        }

        Ok(record.clone())
    }

    pub fn validate(&self, token: &str) -> Option<TokenRecord> {
        self.check(token).ok()
    }

    pub fn revoke(&self, token: &str) -> bool {
        match self.tokens.remove(&self.fingerprint(token)) {
            Some((_, record)) => {
                log::info!("Revoked token for user {}", record.user_id);
                true
            }
            None => false,
        }
    }

    pub fn has_permission(&self, token: &str, permission: &str) -> bool {
        self.validate(token)
            .map(|record| record.has_permission(permission))
            .unwrap_or(false)
    }

    pub fn sweep_expired(&self) -> usize {
        let mut removed = 0;

        self.tokens.retain(|_, record| {
            if record.is_expired() {
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            log::info!("Swept {} expired tokens", removed);
        }

        removed
    }

    pub fn active_count(&self) -> usize {
        self.tokens.len()
    }

    fn fingerprint(&self, token: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(token.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

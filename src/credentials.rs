//! Storage of the mail provider's OAuth token pair.
//!
//! The pair is always handled through [`CredentialStore`] so that the token
//! manager does not care whether it lives in the admin's session cookie, in
//! the local SQLite file used by the CLI, or in memory (tests).

use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::crypto::{self, SealedEnvelope, SealingKey};
use crate::db::{DbError, SharedDatabase};

pub const CREDENTIALS_STATE_KEY: &str = "gmail_credentials";
pub const CREDENTIAL_COOKIE_NAME: &str = "psync_gmail_tokens";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("malformed stored credentials: {0}")]
    Malformed(String),

    #[error("credential storage: {0}")]
    Storage(#[from] DbError),

    #[error("credential sealing: {0}")]
    Sealing(String),

    #[error("credential store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialPair {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(
        default,
        rename = "expiry_date",
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expiry: Option<DateTime<Utc>>,
    /// Provider claims (`scope`, `token_type`, `id_token`, ...) passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expiry: None,
            extra: serde_json::Map::new(),
        }
    }

    /// A pair without expiry never counts as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.expiry.is_some_and(|expiry| now >= expiry - skew)
    }
}

pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<CredentialPair>, CredentialError>;
    fn save(&self, pair: &CredentialPair) -> Result<(), CredentialError>;
    fn clear(&self) -> Result<(), CredentialError>;
}

/// Text encoding of a pair for storage outside the process: base64url of the
/// sealed envelope when a key is configured, of the plain JSON otherwise.
#[derive(Clone, Default)]
pub struct CredentialCodec {
    key: Option<SealingKey>,
}

impl CredentialCodec {
    pub fn new(key: Option<SealingKey>) -> Self {
        Self { key }
    }

    pub fn is_sealed(&self) -> bool {
        self.key.is_some()
    }

    pub fn encode(&self, pair: &CredentialPair) -> Result<String, CredentialError> {
        let json = match &self.key {
            Some(key) => {
                let envelope =
                    crypto::seal_json(pair, key).map_err(|e| CredentialError::Sealing(format!("{e:#}")))?;
                serde_json::to_vec(&envelope)
            }
            None => serde_json::to_vec(pair),
        }
        .map_err(|e| CredentialError::Sealing(e.to_string()))?;

        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(&self, raw: &str) -> Result<CredentialPair, CredentialError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw.trim())
            .map_err(|e| CredentialError::Malformed(format!("base64url: {e}")))?;

        if let Ok(envelope) = serde_json::from_slice::<SealedEnvelope>(&bytes) {
            let key = self.key.as_ref().ok_or_else(|| {
                CredentialError::Malformed("sealed credentials but no sealing key configured".to_string())
            })?;
            return crypto::open_json(&envelope, key)
                .map_err(|e| CredentialError::Malformed(format!("{e:#}")));
        }

        serde_json::from_slice(&bytes).map_err(|e| CredentialError::Malformed(e.to_string()))
    }
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    pair: Mutex<Option<CredentialPair>>,
}

impl MemoryCredentialStore {
    pub fn new(pair: Option<CredentialPair>) -> Self {
        Self {
            pair: Mutex::new(pair),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<CredentialPair>, CredentialError> {
        Ok(self.pair.lock().map_err(|_| CredentialError::Poisoned)?.clone())
    }

    fn save(&self, pair: &CredentialPair) -> Result<(), CredentialError> {
        *self.pair.lock().map_err(|_| CredentialError::Poisoned)? = Some(pair.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        *self.pair.lock().map_err(|_| CredentialError::Poisoned)? = None;
        Ok(())
    }
}

/// Credentials kept in the local database (`kv_state`), used by the CLI.
pub struct SqliteCredentialStore {
    db: SharedDatabase,
    codec: CredentialCodec,
}

impl SqliteCredentialStore {
    pub fn new(db: SharedDatabase, codec: CredentialCodec) -> Self {
        if !codec.is_sealed() {
            warn!("no sealing key configured; gmail credentials are stored unencrypted");
        }
        Self { db, codec }
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn load(&self) -> Result<Option<CredentialPair>, CredentialError> {
        let raw = self
            .db
            .with(|db| db.get_state(CREDENTIALS_STATE_KEY))?
            .and_then(|state| state.value)
            .filter(|value| !value.trim().is_empty());

        raw.map(|value| self.codec.decode(&value)).transpose()
    }

    fn save(&self, pair: &CredentialPair) -> Result<(), CredentialError> {
        let encoded = self.codec.encode(pair)?;
        self.db
            .with(|db| db.set_state(CREDENTIALS_STATE_KEY, &encoded))?;
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        self.db.with(|db| db.clear_state(CREDENTIALS_STATE_KEY))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieChange {
    Set(String),
    Clear,
}

/// Request-scoped store bound to the admin's credential cookie. Writes are
/// recorded and turned into a `Set-Cookie` header by the HTTP layer.
pub struct CookieCredentialStore {
    codec: CredentialCodec,
    state: Mutex<CookieState>,
}

#[derive(Default)]
struct CookieState {
    current: Option<String>,
    change: Option<CookieChange>,
}

impl CookieCredentialStore {
    pub fn new(codec: CredentialCodec, cookie_value: Option<String>) -> Self {
        Self {
            codec,
            state: Mutex::new(CookieState {
                current: cookie_value.filter(|value| !value.trim().is_empty()),
                change: None,
            }),
        }
    }

    /// Builds the store from a raw `Cookie` request header.
    pub fn from_cookie_header(codec: CredentialCodec, header: Option<&str>) -> Self {
        let value = header.and_then(|raw| cookie_value(raw, CREDENTIAL_COOKIE_NAME));
        Self::new(codec, value)
    }

    pub fn take_change(&self) -> Option<CookieChange> {
        self.state.lock().ok().and_then(|mut state| state.change.take())
    }
}

impl CredentialStore for CookieCredentialStore {
    fn load(&self) -> Result<Option<CredentialPair>, CredentialError> {
        let state = self.state.lock().map_err(|_| CredentialError::Poisoned)?;
        state
            .current
            .as_deref()
            .map(|raw| self.codec.decode(raw))
            .transpose()
    }

    fn save(&self, pair: &CredentialPair) -> Result<(), CredentialError> {
        let encoded = self.codec.encode(pair)?;
        let mut state = self.state.lock().map_err(|_| CredentialError::Poisoned)?;
        state.current = Some(encoded.clone());
        state.change = Some(CookieChange::Set(encoded));
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        let mut state = self.state.lock().map_err(|_| CredentialError::Poisoned)?;
        state.current = None;
        state.change = Some(CookieChange::Clear);
        Ok(())
    }
}

pub(crate) fn cookie_value(header: &str, name: &str) -> Option<String> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
}

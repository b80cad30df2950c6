use std::fmt;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::models::{TokenPair, UserRecord};

use super::backend::StoreBackend;

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const SESSION_TOKEN_KEY: &str = "session_token";
pub const USER_KEY: &str = "user";

/// Every key cleared by [`CredentialStore::clear_all_auth_data`]
pub const ALL_KEYS: [&str; 4] = [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, SESSION_TOKEN_KEY, USER_KEY];

/// Persisted credentials for the one active session.
///
/// Reads never fail: a missing key, an unreadable backend and a malformed
/// payload all read as `None`. Writes never fail either; backend errors are
/// logged and dropped. A store built with [`CredentialStore::detached`] has
/// no backend at all, so every getter is `None` and every setter a no-op.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Option<Arc<dyn StoreBackend>>,
}

impl CredentialStore {
    pub fn new(backend: impl StoreBackend + 'static) -> Self {
        Self {
            backend: Some(Arc::new(backend)),
        }
    }

    pub fn from_shared(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// A store for contexts without durable storage
    pub fn detached() -> Self {
        Self { backend: None }
    }

    pub fn is_durable(&self) -> bool {
        self.backend.is_some()
    }

    // ===== Raw access =====

    fn read(&self, key: &'static str) -> Result<Option<String>, StoreError> {
        match &self.backend {
            Some(backend) => backend.get(key).map_err(|e| StoreError::Backend {
                key,
                source: e.into(),
            }),
            None => Ok(None),
        }
    }

    fn get(&self, key: &'static str) -> Option<String> {
        match self.read(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Credential store read failed");
                None
            }
        }
    }

    fn set(&self, key: &'static str, value: &str) {
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.set(key, value) {
                warn!(key, error = %e, "Credential store write failed");
            }
        }
    }

    fn remove(&self, key: &'static str) {
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.remove(key) {
                warn!(key, error = %e, "Credential store delete failed");
            }
        }
    }

    // ===== Tokens =====

    pub fn get_access_token(&self) -> Option<String> {
        self.get(ACCESS_TOKEN_KEY)
    }

    pub fn get_refresh_token(&self) -> Option<String> {
        self.get(REFRESH_TOKEN_KEY)
    }

    pub fn set_tokens(&self, access_token: &str, refresh_token: &str) {
        self.set(ACCESS_TOKEN_KEY, access_token);
        self.set(REFRESH_TOKEN_KEY, refresh_token);
    }

    pub fn store_token_pair(&self, tokens: &TokenPair) {
        self.set_tokens(&tokens.access_token, &tokens.refresh_token);
    }

    pub fn clear_tokens(&self) {
        self.remove(ACCESS_TOKEN_KEY);
        self.remove(REFRESH_TOKEN_KEY);
    }

    // ===== User =====

    /// Stored user, or `None` when absent or not decodable as `T`
    pub fn get_user<T: DeserializeOwned>(&self) -> Option<T> {
        match self.try_get_user() {
            Ok(user) => user,
            Err(e) => {
                debug!(error = %e, "Ignoring unreadable stored user");
                None
            }
        }
    }

    /// Stored user, reporting unreadable or malformed payloads
    pub fn try_get_user<T: DeserializeOwned>(&self) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.read(USER_KEY)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Malformed {
                key: USER_KEY,
                source,
            })
    }

    pub fn set_user<T: Serialize>(&self, value: &T) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(USER_KEY, &raw),
            Err(e) => warn!(error = %e, "Failed to serialize user for storage"),
        }
    }

    pub fn clear_user(&self) {
        self.remove(USER_KEY);
    }

    // ===== Signup session token =====

    pub fn get_session_token(&self) -> Option<String> {
        self.get(SESSION_TOKEN_KEY)
    }

    pub fn set_session_token(&self, token: &str) {
        self.set(SESSION_TOKEN_KEY, token);
    }

    pub fn clear_session_token(&self) {
        self.remove(SESSION_TOKEN_KEY);
    }

    // ===== Whole session =====

    /// Clear tokens, session token and user as one unit
    pub fn clear_all_auth_data(&self) {
        for key in ALL_KEYS {
            self.remove(key);
        }
        debug!("Cleared all stored auth data");
    }

    /// Strict read of the persisted session used at startup.
    ///
    /// Returns the stored user and whether an access token is present.
    /// Unlike the lenient getters, an unreadable backend or a malformed user
    /// record is reported so the caller can treat it as corruption.
    pub fn load_session(&self) -> Result<(Option<UserRecord>, bool), StoreError> {
        let user = self.try_get_user::<UserRecord>()?;
        let has_access_token = self.read(ACCESS_TOKEN_KEY)?.is_some();
        Ok((user, has_access_token))
    }

    /// Whether any credential key is still present
    pub fn has_any_auth_data(&self) -> bool {
        ALL_KEYS.into_iter().any(|key| self.get(key).is_some())
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("durable", &self.is_durable())
            .finish()
    }
}

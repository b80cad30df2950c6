//! Error taxonomy for the session core.
//!
//! - `StoreError`: persisted credentials are unreadable or malformed. Always
//!   recovered locally by clearing every credential key.
//! - `SessionError`: what a caller of login or manual refresh sees. By the
//!   time one is returned the controller has already settled in
//!   `Unauthenticated`.
//!
//! Failures of the scheduled background refresh have no caller to return to;
//! they surface as `SessionEvent::Terminated` instead.

use thiserror::Error;

use crate::api::AuthError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read {key} from credential store: {source}")]
    Backend {
        key: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Stored {key} is malformed: {source}")]
    Malformed {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Local session state is corrupt: {0}")]
    CorruptLocalState(#[from] StoreError),

    #[error(transparent)]
    Gateway(#[from] AuthError),
}

impl SessionError {
    /// The gateway failure behind this error, if any
    pub fn gateway_error(&self) -> Option<&AuthError> {
        match self {
            SessionError::Gateway(e) => Some(e),
            SessionError::CorruptLocalState(_) => None,
        }
    }
}

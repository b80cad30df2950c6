//! Authentication module for managing the user session and its credentials.
//!
//! This module provides:
//! - `SessionController`: the single owner of signed-in state, with a
//!   scheduled token refresh while authenticated
//! - `CredentialStore`: persistence of tokens and the user record over a
//!   pluggable `StoreBackend` (file, OS keyring, or memory)
//!
//! Access tokens live for 60 minutes and are refreshed every 55.

pub mod backend;
pub mod credentials;
pub mod session;
pub mod timer;

pub use backend::{FileBackend, KeyringBackend, MemoryBackend, StoreBackend};
pub use credentials::CredentialStore;
pub use session::{
    Session, SessionController, SessionEvent, SessionOptions, SessionState, TerminationReason,
};

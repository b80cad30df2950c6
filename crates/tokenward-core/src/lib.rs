//! Client-side authentication session management.
//!
//! `tokenward-core` tracks whether the user is signed in, persists tokens
//! between runs, keeps the access token fresh on a schedule, and caches the
//! user's profile. Hosts talk to the identity service through an
//! [`AuthGateway`]; [`HttpAuthGateway`] is the REST implementation.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;

pub use api::{AuthError, AuthGateway, HttpAuthGateway};
pub use auth::{
    CredentialStore, Session, SessionController, SessionEvent, SessionOptions, SessionState,
    TerminationReason,
};
pub use cache::{ProfileCache, ProfileCacheOptions, ProfileSnapshot};
pub use config::{Config, StorageKind};
pub use error::{SessionError, StoreError};
pub use models::{TokenPair, UserProfile, UserRecord};

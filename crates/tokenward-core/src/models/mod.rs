//! Data models exchanged with the identity service.
//!
//! - `TokenPair`: opaque access + refresh token strings
//! - `UserRecord`: the signed-in user, stored and restored whole
//! - `UserProfile`: the profile document served to UI layers
//! - `LoginResponse`, `RefreshResponse`: gateway success shapes

pub mod user;

pub use user::{
    LoginResponse, RefreshResponse, TokenPair, UserProfile, UserRecord, TOKEN_LIFETIME_SECS,
};

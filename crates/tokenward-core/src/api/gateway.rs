use async_trait::async_trait;

use crate::models::{LoginResponse, RefreshResponse, UserProfile};

use super::AuthError;

/// Remote identity service as seen by the session controller and profile cache.
///
/// Implementations own their transport, timeouts and retry policy. The core
/// only reacts to the eventual success or failure of each call.
#[async_trait]
pub trait AuthGateway: Send + Sync {
    /// Exchange an identifier and secret for a token pair and user record
    async fn login(&self, identifier: &str, secret: &str) -> Result<LoginResponse, AuthError>;

    /// Best-effort remote sign-out
    async fn logout(&self) -> Result<(), AuthError>;

    /// Exchange the stored refresh token for a rotated token pair
    async fn refresh_token(&self) -> Result<RefreshResponse, AuthError>;

    async fn get_profile(&self) -> Result<UserProfile, AuthError>;
}

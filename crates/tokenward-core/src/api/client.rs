//! REST implementation of the Auth Gateway.
//!
//! Login, logout, refresh and profile calls against an identity service
//! rooted at a configurable base URL. Bearer and refresh tokens are read
//! from the credential store at call time; persisting the results is left
//! to the session controller.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::auth::CredentialStore;
use crate::models::{LoginResponse, RefreshResponse, UserProfile};

use super::{AuthError, AuthGateway};

// ============================================================================
// Constants
// ============================================================================

const LOGIN_PATH: &str = "/auth/login";
const LOGOUT_PATH: &str = "/auth/logout";
const REFRESH_PATH: &str = "/auth/refresh";
const PROFILE_PATH: &str = "/auth/profile";

/// HTTP request timeout in seconds.
/// 30s allows for slow identity providers while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    identifier: &'a str,
    secret: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    #[serde(rename = "refreshToken")]
    refresh_token: &'a str,
}

/// Auth Gateway over HTTP.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpAuthGateway {
    client: Client,
    base_url: String,
    store: CredentialStore,
    initial_backoff: Duration,
}

impl HttpAuthGateway {
    pub fn new(base_url: impl Into<String>, store: CredentialStore) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            store,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// Override the first rate-limit backoff delay
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_bearer(&self, request: RequestBuilder) -> RequestBuilder {
        match self.store.get_access_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, AuthError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(AuthError::from_status(status, &body))
        }
    }

    /// Send a request built by `build`, retrying with exponential backoff
    /// while the server answers 429.
    async fn send<F>(&self, path: &str, build: F) -> Result<reqwest::Response, AuthError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let response = self
                .with_bearer(build())
                .header(header::ACCEPT, "application/json")
                .send()
                .await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(AuthError::RateLimited);
                    }
                    warn!(
                        path,
                        retry = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response, what: &str) -> Result<T, AuthError> {
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| AuthError::InvalidResponse(format!("Failed to parse {} response: {}", what, e)))
    }

    async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<reqwest::Response, AuthError> {
        let url = self.url(path);
        self.send(path, || self.client.post(&url).json(body)).await
    }
}

#[async_trait]
impl AuthGateway for HttpAuthGateway {
    async fn login(&self, identifier: &str, secret: &str) -> Result<LoginResponse, AuthError> {
        debug!("Sending login request");
        let body = LoginRequest { identifier, secret };
        let url = self.url(LOGIN_PATH);
        // No bearer on login: whatever is stored belongs to a previous session
        let response = self.client.post(&url).json(&body).send().await?;
        match Self::check_response_for_retry(response).await {
            Ok(Some(response)) => Self::parse(response, "login").await,
            Ok(None) => Err(AuthError::RateLimited),
            Err(AuthError::Unauthorized) => Err(AuthError::InvalidCredentials),
            Err(e) => Err(e),
        }
    }

    async fn logout(&self) -> Result<(), AuthError> {
        debug!("Sending logout request");
        let url = self.url(LOGOUT_PATH);
        self.send(LOGOUT_PATH, || self.client.post(&url)).await?;
        Ok(())
    }

    async fn refresh_token(&self) -> Result<RefreshResponse, AuthError> {
        let refresh_token = self
            .store
            .get_refresh_token()
            .ok_or(AuthError::MissingRefreshToken)?;
        debug!("Sending token refresh request");
        let body = RefreshRequest {
            refresh_token: &refresh_token,
        };
        let response = self.post_json(REFRESH_PATH, &body).await?;
        Self::parse(response, "refresh").await
    }

    async fn get_profile(&self) -> Result<UserProfile, AuthError> {
        let url = self.url(PROFILE_PATH);
        let response = self.send(PROFILE_PATH, || self.client.get(&url)).await?;
        Self::parse(response, "profile").await
    }
}

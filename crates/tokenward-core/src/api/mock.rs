//! Scripted in-memory gateway for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use crate::models::{LoginResponse, RefreshResponse, TokenPair, UserProfile, UserRecord};

use super::{AuthError, AuthGateway};

#[derive(Default)]
pub struct MockGateway {
    login_results: Mutex<VecDeque<Result<LoginResponse, AuthError>>>,
    refresh_results: Mutex<VecDeque<Result<RefreshResponse, AuthError>>>,
    profile_results: Mutex<VecDeque<Result<UserProfile, AuthError>>>,
    fail_logout: bool,
    hang_login: bool,
    panic_profile: AtomicBool,
    refresh_gate: Option<Semaphore>,
    hang_logout: bool,
    profile_gate: Option<Semaphore>,
    pub login_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub profile_calls: AtomicUsize,
}

pub fn login_ok(access: &str, refresh: &str, user: serde_json::Value) -> LoginResponse {
    LoginResponse {
        tokens: TokenPair::new(access, refresh),
        user: UserRecord::new(user),
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_logout(mut self) -> Self {
        self.fail_logout = true;
        self
    }

    /// Never answer logout calls
    pub fn hanging_logout(mut self) -> Self {
        self.hang_logout = true;
        self
    }

    /// Never answer logins that have no scripted result
    pub fn hanging_login(mut self) -> Self {
        self.hang_login = true;
        self
    }

    /// Panic inside the next profile fetch
    pub fn panicking_profile_once(self) -> Self {
        self.panic_profile.store(true, Ordering::SeqCst);
        self
    }

    /// Hold every refresh until [`MockGateway::release_refresh`]
    pub fn gated_refresh(mut self) -> Self {
        self.refresh_gate = Some(Semaphore::new(0));
        self
    }

    pub fn release_refresh(&self, refreshes: usize) {
        if let Some(gate) = &self.refresh_gate {
            gate.add_permits(refreshes);
        }
    }

    /// Hold every profile fetch until [`MockGateway::release_profile`]
    pub fn gated_profile(mut self) -> Self {
        self.profile_gate = Some(Semaphore::new(0));
        self
    }

    pub fn release_profile(&self, fetches: usize) {
        if let Some(gate) = &self.profile_gate {
            gate.add_permits(fetches);
        }
    }

    pub fn push_login(&self, result: Result<LoginResponse, AuthError>) {
        self.login_results.lock().unwrap().push_back(result);
    }

    pub fn push_refresh(&self, result: Result<RefreshResponse, AuthError>) {
        self.refresh_results.lock().unwrap().push_back(result);
    }

    pub fn push_profile(&self, result: Result<UserProfile, AuthError>) {
        self.profile_results.lock().unwrap().push_back(result);
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthGateway for MockGateway {
    async fn login(&self, _identifier: &str, _secret: &str) -> Result<LoginResponse, AuthError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.login_results.lock().unwrap().pop_front();
        if scripted.is_none() && self.hang_login {
            std::future::pending::<()>().await;
        }
        scripted.unwrap_or(Err(AuthError::InvalidCredentials))
    }

    async fn logout(&self) -> Result<(), AuthError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_logout {
            std::future::pending::<()>().await;
        }
        if self.fail_logout {
            Err(AuthError::ServerError("logout unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    async fn refresh_token(&self) -> Result<RefreshResponse, AuthError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.refresh_gate {
            gate.acquire().await.unwrap().forget();
        }
        let scripted = self.refresh_results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(RefreshResponse {
                tokens: TokenPair::new(format!("a-refreshed-{n}"), format!("r-refreshed-{n}")),
                user: None,
            })
        })
    }

    async fn get_profile(&self) -> Result<UserProfile, AuthError> {
        let n = self.profile_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.panic_profile.swap(false, Ordering::SeqCst) {
            panic!("profile endpoint blew up");
        }
        if let Some(gate) = &self.profile_gate {
            gate.acquire().await.unwrap().forget();
        }
        let scripted = self.profile_results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(UserProfile::new(json!({"id": "u1", "fetch": n}))))
    }
}

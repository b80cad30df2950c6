use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::{AuthError, AuthGateway};
use crate::error::SessionError;
use crate::models::{RefreshResponse, UserRecord, TOKEN_LIFETIME_SECS};

use super::credentials::CredentialStore;
use super::timer::RefreshTimer;

/// Minutes between scheduled refreshes.
/// Five minutes ahead of the nominal 60 minute access token lifetime.
pub const REFRESH_INTERVAL_MINUTES: u64 = 55;

/// Where the host application should send the user once a session ends
pub const DEFAULT_SIGN_IN_PATH: &str = "/sign-in";

/// Upper bound on the remote logout call during teardown.
/// Local state is cleared whether or not the identity service answers.
const LOGOUT_TIMEOUT_SECS: u64 = 10;

/// Buffer size for the session event channel
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum SessionState {
    Uninitialized,
    Loading,
    Authenticated,
    Unauthenticated,
}

impl SessionState {
    /// Authenticated and Unauthenticated are the only states nothing is pending in
    pub fn is_resting(&self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Unauthenticated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum TerminationReason {
    /// The user asked to sign out
    LoggedOut,
    /// The background refresh was rejected and the session could not be kept alive
    RefreshFailed { error: String },
}

/// Outward notifications for the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum SessionEvent {
    /// The session is gone; the host should navigate to `redirect_to`
    Terminated {
        reason: TerminationReason,
        #[serde(rename = "redirectTo")]
        redirect_to: String,
    },
}

/// In-memory mirror of the persisted session.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub user: Option<UserRecord>,
    pub access_token_present: bool,
    /// When the current access token was obtained, if known.
    /// Unknown for sessions restored from storage.
    pub issued_at: Option<DateTime<Utc>>,
}

impl Session {
    fn signed_in(user: UserRecord) -> Self {
        Self {
            user: Some(user),
            access_token_present: true,
            issued_at: Some(Utc::now()),
        }
    }

    fn restored(user: UserRecord) -> Self {
        Self {
            user: Some(user),
            access_token_present: true,
            issued_at: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some() && self.access_token_present
    }

    /// Nominal expiry of the current access token
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.issued_at
            .map(|issued| issued + chrono::Duration::seconds(TOKEN_LIFETIME_SECS))
    }

    /// Get minutes remaining until nominal expiry (for display)
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        self.expires_at()
            .map(|expiry| (expiry - Utc::now()).num_minutes().max(0))
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub refresh_interval: Duration,
    pub sign_in_path: String,
    pub logout_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(REFRESH_INTERVAL_MINUTES * 60),
            sign_in_path: DEFAULT_SIGN_IN_PATH.to_string(),
            logout_timeout: Duration::from_secs(LOGOUT_TIMEOUT_SECS),
        }
    }
}

/// What to do if an operation future is dropped before it settles
#[derive(Debug, Clone, Copy)]
enum OnCancel {
    Restore,
    Clear,
}

struct Inner {
    store: CredentialStore,
    gateway: Arc<dyn AuthGateway>,
    options: SessionOptions,
    session: Mutex<Session>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    timer: Mutex<RefreshTimer>,
    /// Serializes login, logout, refresh and the scheduled refresh
    op_lock: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
}

/// Owns the signed-in state of the one active session.
///
/// Clones share the same session. The scheduled refresh task only holds a
/// weak reference, so dropping the last clone (or calling
/// [`SessionController::shutdown`]) stops it.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(
        store: CredentialStore,
        gateway: Arc<dyn AuthGateway>,
        options: SessionOptions,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Uninitialized);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                gateway,
                options,
                session: Mutex::new(Session::default()),
                state,
                events,
                timer: Mutex::new(RefreshTimer::new()),
                op_lock: tokio::sync::Mutex::new(()),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Restore the persisted session. Only the first call does anything.
    ///
    /// A complete persisted session (user record plus access token) is
    /// trusted as-is and the refresh timer armed; no call is made to the
    /// identity service. Anything less, including unreadable storage, is
    /// wiped.
    pub async fn initialize(&self) -> SessionState {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        if inner.initialized.swap(true, Ordering::SeqCst) {
            debug!("Session already initialized");
            return self.state();
        }

        let loading = inner.enter_loading(OnCancel::Clear);
        match inner.store.load_session() {
            Ok((Some(user), true)) => {
                inner.replace_session(Session::restored(user));
                inner.arm_refresh_timer();
                loading.settle(SessionState::Authenticated);
                info!("Restored persisted session");
            }
            Ok((user, has_access_token)) => {
                debug!(
                    has_user = user.is_some(),
                    has_access_token, "No complete persisted session, clearing leftovers"
                );
                inner.clear_local();
                loading.settle(SessionState::Unauthenticated);
            }
            Err(e) => {
                let e = SessionError::from(e);
                warn!(error = %e, "Discarding persisted session");
                inner.clear_local();
                loading.settle(SessionState::Unauthenticated);
            }
        }
        self.state()
    }

    /// Sign in. On failure the controller is already Unauthenticated when
    /// the error is returned.
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<UserRecord, SessionError> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let loading = inner.enter_loading(OnCancel::Restore);

        match inner.gateway.login(identifier, secret).await {
            Ok(response) => {
                inner.store.store_token_pair(&response.tokens);
                inner.store.set_user(&response.user);
                inner.replace_session(Session::signed_in(response.user.clone()));
                inner.arm_refresh_timer();
                loading.settle(SessionState::Authenticated);
                info!("Login successful");
                Ok(response.user)
            }
            Err(e) => {
                warn!(error = %e, "Login failed");
                inner.disarm_refresh_timer();
                inner.clear_local();
                loading.settle(SessionState::Unauthenticated);
                Err(e.into())
            }
        }
    }

    /// Sign out. Never fails and is safe to repeat; local credentials are
    /// gone afterwards whatever the identity service says.
    pub async fn logout(&self) {
        let inner = &self.inner;
        // Before waiting on anything, so a refresh can't land mid-teardown
        inner.disarm_refresh_timer();

        let _op = inner.op_lock.lock().await;
        let loading = inner.enter_loading(OnCancel::Clear);
        inner.teardown(TerminationReason::LoggedOut).await;
        loading.settle(SessionState::Unauthenticated);
    }

    /// Refresh the token pair now and restart the refresh schedule.
    pub async fn refresh(&self) -> Result<UserRecord, SessionError> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let loading = inner.enter_loading(OnCancel::Restore);

        let result = match inner.gateway.refresh_token().await {
            Ok(response) => inner.apply_refresh(response),
            Err(e) => Err(e),
        };

        match result {
            Ok(user) => {
                inner.arm_refresh_timer();
                loading.settle(SessionState::Authenticated);
                info!("Token refreshed");
                Ok(user)
            }
            Err(e) => {
                inner.disarm_refresh_timer();
                warn!(error = %e, "Token refresh failed, clearing session");
                inner.clear_local();
                loading.settle(SessionState::Unauthenticated);
                Err(e.into())
            }
        }
    }

    /// Stop the refresh schedule without touching credentials.
    /// Call when the host that owns this controller goes away.
    pub fn shutdown(&self) {
        if self.inner.disarm_refresh_timer() {
            info!("Session controller shut down");
        }
    }

    // =========================================================================
    // Signup
    // =========================================================================

    /// Keep the short-lived token of a signup in progress
    pub fn set_signup_token(&self, token: &str) {
        self.inner.store.set_session_token(token);
    }

    pub fn signup_token(&self) -> Option<String> {
        self.inner.store.get_session_token()
    }

    /// Signup finished (or abandoned); its token is no longer needed
    pub fn complete_signup(&self) {
        self.inner.store.clear_session_token();
        debug!("Signup session token cleared");
    }

    // =========================================================================
    // Observers
    // =========================================================================

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn session(&self) -> Session {
        self.inner.lock_session().clone()
    }

    pub fn user(&self) -> Option<UserRecord> {
        self.inner.lock_session().user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.lock_session().is_authenticated()
    }

    pub fn is_refresh_armed(&self) -> bool {
        self.inner.lock_timer().is_armed()
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_timer(&self) -> MutexGuard<'_, RefreshTimer> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Session state changed");
        }
    }

    fn enter_loading(&self, on_cancel: OnCancel) -> LoadingGuard<'_> {
        let previous = self.state.send_replace(SessionState::Loading);
        LoadingGuard {
            inner: self,
            previous,
            on_cancel,
            settled: false,
        }
    }

    fn replace_session(&self, session: Session) {
        *self.lock_session() = session;
    }

    /// Forget the session in memory and in storage together
    fn clear_local(&self) {
        let mut session = self.lock_session();
        *session = Session::default();
        self.store.clear_all_auth_data();
    }

    /// Persist a successful refresh. A response without a user keeps the
    /// current one; with no user anywhere the response is unusable.
    fn apply_refresh(&self, response: RefreshResponse) -> Result<UserRecord, AuthError> {
        let mut session = self.lock_session();
        let user = response
            .user
            .or_else(|| session.user.clone())
            .or_else(|| self.store.get_user());
        let Some(user) = user else {
            return Err(AuthError::InvalidResponse(
                "refresh returned no user for a session without one".to_string(),
            ));
        };
        self.store.store_token_pair(&response.tokens);
        self.store.set_user(&user);
        *session = Session::signed_in(user.clone());
        Ok(user)
    }

    fn arm_refresh_timer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.options.refresh_interval;
        let generation = self
            .lock_timer()
            .arm(move |generation| scheduled_refresh_loop(weak, period, generation));
        debug!(generation, every_secs = period.as_secs(), "Scheduled token refresh");
    }

    fn disarm_refresh_timer(&self) -> bool {
        self.lock_timer().disarm()
    }

    /// One tick of the schedule. Returns whether the schedule continues.
    async fn run_scheduled_refresh(&self, generation: u64) -> bool {
        let _op = self.op_lock.lock().await;
        if self.lock_timer().generation() != generation {
            debug!(generation, "Superseded refresh schedule stopping");
            return false;
        }

        let result = match self.gateway.refresh_token().await {
            Ok(response) => self.apply_refresh(response),
            Err(e) => Err(e),
        };

        match result {
            Ok(_) => {
                self.set_state(SessionState::Authenticated);
                info!("Scheduled token refresh succeeded");
                true
            }
            Err(e) => {
                // Stop recurring before anything else; the rest of this task is the teardown
                self.lock_timer().release(generation);
                warn!(error = %e, "Scheduled token refresh failed, ending session");
                let loading = self.enter_loading(OnCancel::Clear);
                self.teardown(TerminationReason::RefreshFailed {
                    error: e.to_string(),
                })
                .await;
                loading.settle(SessionState::Unauthenticated);
                false
            }
        }
    }

    /// Best-effort remote logout, then wipe local state and tell the host.
    async fn teardown(&self, reason: TerminationReason) {
        self.disarm_refresh_timer();

        let has_session =
            self.lock_session().is_authenticated() || self.store.get_access_token().is_some();
        if has_session {
            match tokio::time::timeout(self.options.logout_timeout, self.gateway.logout()).await {
                Ok(Ok(())) => debug!("Remote logout succeeded"),
                Ok(Err(e)) => warn!(error = %e, "Remote logout failed, clearing local session anyway"),
                Err(_) => warn!(
                    timeout_secs = self.options.logout_timeout.as_secs(),
                    "Remote logout timed out, clearing local session anyway"
                ),
            }
        } else {
            debug!("No local session, skipping remote logout");
        }

        self.clear_local();
        self.set_state(SessionState::Unauthenticated);
        info!(reason = ?reason, "Session terminated");

        let event = SessionEvent::Terminated {
            reason,
            redirect_to: self.options.sign_in_path.clone(),
        };
        if self.events.send(event).is_err() {
            debug!("No subscribers for session event");
        }
    }
}

async fn scheduled_refresh_loop(inner: Weak<Inner>, period: Duration, generation: u64) {
    let start = match Instant::now().checked_add(period) {
        Some(start) if !period.is_zero() => start,
        _ => {
            warn!(generation, ?period, "Unusable refresh interval, no scheduled refresh");
            return;
        }
    };
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            debug!(generation, "Session controller dropped, refresh schedule stopping");
            break;
        };
        if !inner.run_scheduled_refresh(generation).await {
            break;
        }
    }
}

/// Keeps the controller out of `Loading` if an operation is cancelled
/// before it settles.
struct LoadingGuard<'a> {
    inner: &'a Inner,
    previous: SessionState,
    on_cancel: OnCancel,
    settled: bool,
}

impl LoadingGuard<'_> {
    fn settle(mut self, state: SessionState) {
        self.settled = true;
        self.inner.set_state(state);
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        match self.on_cancel {
            OnCancel::Restore => {
                debug!(state = ?self.previous, "Operation cancelled, restoring state");
                self.inner.set_state(self.previous);
            }
            OnCancel::Clear => {
                debug!("Operation cancelled, clearing session");
                self.inner.disarm_refresh_timer();
                self.inner.clear_local();
                self.inner.set_state(SessionState::Unauthenticated);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::{login_ok, MockGateway};
    use crate::auth::backend::{MemoryBackend, StoreBackend};
    use crate::auth::credentials::{ACCESS_TOKEN_KEY, USER_KEY};
    use crate::models::{RefreshResponse, TokenPair};
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    const INTERVAL: Duration = Duration::from_secs(REFRESH_INTERVAL_MINUTES * 60);

    fn setup(gateway: MockGateway) -> (SessionController, CredentialStore, Arc<MockGateway>) {
        let gateway = Arc::new(gateway);
        let store = CredentialStore::new(MemoryBackend::new());
        let controller =
            SessionController::new(store.clone(), gateway.clone(), SessionOptions::default());
        (controller, store, gateway)
    }

    fn calls(counter: &std::sync::atomic::AtomicUsize) -> usize {
        MockGateway::calls(counter)
    }

    async fn signed_in(gateway: MockGateway) -> (SessionController, CredentialStore, Arc<MockGateway>) {
        let (controller, store, gateway) = setup(gateway);
        gateway.push_login(Ok(login_ok("a1", "r1", json!({"id": "u1"}))));
        controller.initialize().await;
        controller.login("ada", "hunter2").await.expect("login should succeed");
        (controller, store, gateway)
    }

    // ===== Initialize =====

    #[tokio::test]
    async fn test_initialize_restores_complete_session() {
        let (controller, store, gateway) = setup(MockGateway::new());
        store.set_tokens("a1", "r1");
        store.set_user(&json!({"id": "u1"}));

        assert_eq!(controller.state(), SessionState::Uninitialized);
        assert_eq!(controller.initialize().await, SessionState::Authenticated);
        assert!(controller.is_authenticated());
        assert!(controller.is_refresh_armed());
        assert_eq!(controller.user(), Some(UserRecord::new(json!({"id": "u1"}))));
        assert_eq!(controller.session().issued_at, None);
        // Optimistic: nothing is asked of the identity service
        assert_eq!(calls(&gateway.refresh_calls), 0);
    }

    #[tokio::test]
    async fn test_initialize_clears_partial_session() {
        let (controller, store, _) = setup(MockGateway::new());
        store.set_tokens("a1", "r1");
        store.set_session_token("s1");

        assert_eq!(controller.initialize().await, SessionState::Unauthenticated);
        assert!(!store.has_any_auth_data());
        assert!(!controller.is_refresh_armed());
    }

    #[tokio::test]
    async fn test_initialize_clears_malformed_user() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set(USER_KEY, "{{not json").unwrap();
        backend.set(ACCESS_TOKEN_KEY, "a1").unwrap();
        let store = CredentialStore::from_shared(backend);
        let controller = SessionController::new(
            store.clone(),
            Arc::new(MockGateway::new()),
            SessionOptions::default(),
        );

        assert_eq!(controller.initialize().await, SessionState::Unauthenticated);
        assert!(!store.has_any_auth_data());
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let (controller, store, _) = setup(MockGateway::new());
        assert_eq!(controller.initialize().await, SessionState::Unauthenticated);

        store.set_tokens("a1", "r1");
        store.set_user(&json!({"id": "u1"}));
        assert_eq!(controller.initialize().await, SessionState::Unauthenticated);
        assert!(!controller.is_authenticated());
    }

    #[tokio::test]
    async fn test_initialize_without_durable_store() {
        let controller = SessionController::new(
            CredentialStore::detached(),
            Arc::new(MockGateway::new()),
            SessionOptions::default(),
        );
        assert_eq!(controller.initialize().await, SessionState::Unauthenticated);
    }

    // ===== Login =====

    #[tokio::test]
    async fn test_login_persists_exact_values() {
        let (controller, store, _) = signed_in(MockGateway::new()).await;

        assert_eq!(controller.state(), SessionState::Authenticated);
        assert_eq!(store.get_access_token().as_deref(), Some("a1"));
        assert_eq!(store.get_refresh_token().as_deref(), Some("r1"));
        assert_eq!(
            store.get_user::<UserRecord>(),
            Some(UserRecord::new(json!({"id": "u1"})))
        );
        assert!(controller.is_refresh_armed());
        assert_eq!(controller.session().minutes_until_expiry(), Some(59));
    }

    #[tokio::test]
    async fn test_login_failure_is_returned_after_settling() {
        let (controller, store, _) = setup(MockGateway::new());
        controller.initialize().await;
        let mut state = controller.watch_state();

        let err = controller
            .login("ada", "wrong")
            .await
            .expect_err("login should fail");

        assert!(matches!(
            err.gateway_error(),
            Some(AuthError::InvalidCredentials)
        ));
        assert_eq!(*state.borrow_and_update(), SessionState::Unauthenticated);
        assert!(!controller.is_authenticated());
        assert!(!store.has_any_auth_data());
    }

    #[tokio::test]
    async fn test_failed_login_drops_previous_session() {
        let (controller, store, gateway) = signed_in(MockGateway::new()).await;
        gateway.push_login(Err(AuthError::Unauthorized));

        assert!(controller.login("ada", "wrong").await.is_err());
        assert!(!controller.is_refresh_armed());
        assert!(!store.has_any_auth_data());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_login_restores_state() {
        let (controller, store, _) = signed_in(MockGateway::new().hanging_login()).await;

        let outcome =
            tokio::time::timeout(Duration::from_secs(1), controller.login("ada", "hunter2")).await;

        assert!(outcome.is_err(), "login should still be pending");
        assert_eq!(controller.state(), SessionState::Authenticated);
        assert_eq!(store.get_access_token().as_deref(), Some("a1"));
        assert!(controller.is_refresh_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unusable_interval_does_not_schedule() {
        let gateway = Arc::new(MockGateway::new());
        gateway.push_login(Ok(login_ok("a1", "r1", json!({"id": "u1"}))));
        let options = SessionOptions {
            refresh_interval: Duration::MAX,
            ..SessionOptions::default()
        };
        let controller = SessionController::new(
            CredentialStore::new(MemoryBackend::new()),
            gateway.clone(),
            options,
        );

        controller.login("ada", "hunter2").await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // The session itself is unaffected; only the schedule is skipped
        assert_eq!(controller.state(), SessionState::Authenticated);
        assert!(!controller.is_refresh_armed());
    }

    // ===== Logout =====

    #[tokio::test]
    async fn test_login_then_logout_clears_every_key() {
        let (controller, store, gateway) = signed_in(MockGateway::new()).await;
        store.set_session_token("s1");
        let mut events = controller.subscribe();

        controller.logout().await;

        assert_eq!(controller.state(), SessionState::Unauthenticated);
        assert!(!store.has_any_auth_data());
        assert!(!controller.is_refresh_armed());
        assert_eq!(calls(&gateway.logout_calls), 1);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Terminated {
                reason: TerminationReason::LoggedOut,
                redirect_to: DEFAULT_SIGN_IN_PATH.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let (controller, store, gateway) = signed_in(MockGateway::new()).await;

        controller.logout().await;
        controller.logout().await;

        assert_eq!(controller.state(), SessionState::Unauthenticated);
        assert!(!store.has_any_auth_data());
        // The second call has no session to sign out remotely
        assert_eq!(calls(&gateway.logout_calls), 1);

        let (fresh, _, _) = setup(MockGateway::new());
        fresh.logout().await;
        assert_eq!(fresh.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_logout_clears_even_if_remote_fails() {
        let (controller, store, gateway) = signed_in(MockGateway::new().failing_logout()).await;

        controller.logout().await;

        assert_eq!(calls(&gateway.logout_calls), 1);
        assert_eq!(controller.state(), SessionState::Unauthenticated);
        assert!(!store.has_any_auth_data());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_clears_even_if_remote_hangs() {
        let (controller, store, _) = signed_in(MockGateway::new().hanging_logout()).await;

        controller.logout().await;

        assert_eq!(controller.state(), SessionState::Unauthenticated);
        assert!(!store.has_any_auth_data());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_logout_clears_session() {
        let (controller, store, _) = signed_in(MockGateway::new().hanging_logout()).await;

        let outcome = tokio::time::timeout(Duration::from_secs(1), controller.logout()).await;

        assert!(outcome.is_err(), "logout should still be waiting on the remote call");
        assert_eq!(controller.state(), SessionState::Unauthenticated);
        assert!(!store.has_any_auth_data());
        assert!(!controller.is_refresh_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_scheduled_refresh() {
        let (controller, store, gateway) = signed_in(MockGateway::new().gated_refresh()).await;

        // The scheduled refresh is now waiting on the identity service
        tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(calls(&gateway.refresh_calls), 1);

        let logout = tokio::spawn({
            let controller = controller.clone();
            async move { controller.logout().await }
        });
        gateway.release_refresh(1);
        logout.await.unwrap();

        assert_eq!(controller.state(), SessionState::Unauthenticated);
        assert!(!store.has_any_auth_data());
        assert!(!controller.is_refresh_armed());

        tokio::time::sleep(INTERVAL * 2).await;
        assert_eq!(calls(&gateway.refresh_calls), 1);
        assert!(!store.has_any_auth_data());
    }

    // ===== Manual refresh =====

    #[tokio::test]
    async fn test_refresh_without_user_keeps_current_user() {
        let (controller, store, gateway) = signed_in(MockGateway::new()).await;
        gateway.push_refresh(Ok(RefreshResponse {
            tokens: TokenPair::new("a2", "r2"),
            user: None,
        }));

        let user = controller.refresh().await.expect("refresh should succeed");

        assert_eq!(user, UserRecord::new(json!({"id": "u1"})));
        assert_eq!(controller.state(), SessionState::Authenticated);
        assert_eq!(store.get_access_token().as_deref(), Some("a2"));
        assert_eq!(store.get_refresh_token().as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_refresh_replaces_user() {
        let (controller, store, gateway) = signed_in(MockGateway::new()).await;
        gateway.push_refresh(Ok(RefreshResponse {
            tokens: TokenPair::new("a2", "r2"),
            user: Some(UserRecord::new(json!({"id": "u1", "name": "Ada"}))),
        }));

        controller.refresh().await.expect("refresh should succeed");

        let expected = UserRecord::new(json!({"id": "u1", "name": "Ada"}));
        assert_eq!(controller.user(), Some(expected.clone()));
        assert_eq!(store.get_user::<UserRecord>(), Some(expected));
    }

    #[tokio::test]
    async fn test_refresh_failure_clears_and_returns_error() {
        let (controller, store, gateway) = signed_in(MockGateway::new()).await;
        gateway.push_refresh(Err(AuthError::Unauthorized));
        let mut events = controller.subscribe();

        let err = controller.refresh().await.expect_err("refresh should fail");

        assert!(matches!(err, SessionError::Gateway(AuthError::Unauthorized)));
        assert_eq!(controller.state(), SessionState::Unauthenticated);
        assert!(!controller.is_refresh_armed());
        assert!(!store.has_any_auth_data());
        // The caller is told directly; no navigation
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_refresh_without_any_user_fails() {
        let (controller, store, _) = setup(MockGateway::new());
        controller.initialize().await;

        assert!(controller.refresh().await.is_err());
        assert_eq!(controller.state(), SessionState::Unauthenticated);
        assert!(!store.has_any_auth_data());
    }

    // ===== Scheduled refresh =====

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_refresh_recurs() {
        let (controller, store, gateway) = signed_in(MockGateway::new()).await;

        tokio::time::sleep(INTERVAL - Duration::from_secs(1)).await;
        assert_eq!(calls(&gateway.refresh_calls), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls(&gateway.refresh_calls), 1);
        assert_eq!(store.get_access_token().as_deref(), Some("a-refreshed-1"));
        assert_eq!(controller.state(), SessionState::Authenticated);

        tokio::time::sleep(INTERVAL).await;
        assert_eq!(calls(&gateway.refresh_calls), 2);
        assert!(controller.is_refresh_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_keeps_one_timer() {
        let (controller, _, gateway) = signed_in(MockGateway::new()).await;
        gateway.push_login(Ok(login_ok("a2", "r2", json!({"id": "u1"}))));
        controller.login("ada", "hunter2").await.unwrap();
        controller.refresh().await.unwrap();
        assert_eq!(calls(&gateway.refresh_calls), 1);

        tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(calls(&gateway.refresh_calls), 2);

        tokio::time::sleep(INTERVAL).await;
        assert_eq!(calls(&gateway.refresh_calls), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_refresh_failure_terminates_once() {
        let (controller, store, gateway) = signed_in(MockGateway::new()).await;
        store.set_session_token("s1");
        gateway.push_refresh(Err(AuthError::Unauthorized));
        let mut events = controller.subscribe();

        tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;

        assert_eq!(controller.state(), SessionState::Unauthenticated);
        assert!(!store.has_any_auth_data());
        assert!(!controller.is_refresh_armed());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Terminated {
                reason: TerminationReason::RefreshFailed {
                    error: AuthError::Unauthorized.to_string(),
                },
                redirect_to: DEFAULT_SIGN_IN_PATH.to_string(),
            }
        );
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));

        // The schedule stopped itself
        tokio::time::sleep(INTERVAL * 3).await;
        assert_eq!(calls(&gateway.refresh_calls), 1);
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_stops_schedule() {
        let (controller, _, gateway) = signed_in(MockGateway::new()).await;
        controller.logout().await;

        tokio::time::sleep(INTERVAL * 2).await;
        assert_eq!(calls(&gateway.refresh_calls), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_and_drop_stop_schedule() {
        let (controller, store, gateway) = signed_in(MockGateway::new()).await;
        controller.shutdown();
        assert!(!controller.is_refresh_armed());
        // Credentials survive an unmount
        assert_eq!(store.get_access_token().as_deref(), Some("a1"));

        let (other, _, other_gateway) = signed_in(MockGateway::new()).await;
        drop(other);

        tokio::time::sleep(INTERVAL * 2).await;
        assert_eq!(calls(&gateway.refresh_calls), 0);
        assert_eq!(calls(&other_gateway.refresh_calls), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_controllers_do_not_share_timers() {
        let (first, _, first_gateway) = signed_in(MockGateway::new()).await;
        let (_second, _, second_gateway) = signed_in(MockGateway::new()).await;

        first.logout().await;
        tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;

        assert_eq!(calls(&first_gateway.refresh_calls), 0);
        assert_eq!(calls(&second_gateway.refresh_calls), 1);
    }

    // ===== Signup =====

    #[tokio::test]
    async fn test_signup_token_lifecycle() {
        let (controller, store, _) = setup(MockGateway::new());
        controller.set_signup_token("s1");
        assert_eq!(controller.signup_token().as_deref(), Some("s1"));
        assert_eq!(store.get_session_token().as_deref(), Some("s1"));

        controller.complete_signup();
        assert_eq!(controller.signup_token(), None);
    }

    #[test]
    fn test_session_expiry_helpers() {
        let mut session = Session::signed_in(UserRecord::new(json!({"id": "u1"})));
        assert!(session.is_authenticated());
        assert_eq!(session.minutes_until_expiry(), Some(59));

        session.issued_at = Some(Utc::now() - chrono::Duration::hours(2));
        assert_eq!(session.minutes_until_expiry(), Some(0));

        assert!(!Session::default().is_authenticated());
        assert_eq!(Session::default().minutes_until_expiry(), None);
    }
}

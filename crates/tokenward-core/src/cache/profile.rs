use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{AuthError, AuthGateway};
use crate::models::UserProfile;

/// The one key this cache holds
pub const PROFILE_CACHE_KEY: &str = "current-user-profile";

/// Profiles are served without revalidation for 5 minutes.
const PROFILE_STALE_MINUTES: i64 = 5;

/// Automatic retries after a failed fetch.
const FETCH_RETRIES: u32 = 1;

/// Delay before the automatic retry.
const RETRY_DELAY_MS: u64 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        let now = Utc::now();
        (now - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Includes clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            format!("{}h ago", minutes / 60)
        } else {
            format!("{}d ago", minutes / 1440)
        }
    }

    pub fn is_stale_after(&self, max_age: chrono::Duration) -> bool {
        Utc::now() - self.cached_at >= max_age
    }
}

/// Profile fetch failed even after the automatic retry.
#[derive(Error, Debug, Clone)]
#[error("Failed to load profile after {attempts} attempt(s): {source}")]
pub struct FetchError {
    pub attempts: u32,
    #[source]
    pub source: Arc<AuthError>,
}

#[derive(Debug, Clone)]
pub struct ProfileCacheOptions {
    pub stale_after: chrono::Duration,
    pub retry_delay: Duration,
    pub refetch_on_mount: bool,
    pub refetch_on_focus: bool,
}

impl Default for ProfileCacheOptions {
    fn default() -> Self {
        Self {
            stale_after: chrono::Duration::minutes(PROFILE_STALE_MINUTES),
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
            refetch_on_mount: true,
            refetch_on_focus: false,
        }
    }
}

/// What a consuming view renders from.
///
/// `data` is the last good profile and stays populated through fetches and
/// failures; `error` is the outcome of the latest completed fetch.
#[derive(Debug, Clone, Default)]
pub struct ProfileSnapshot {
    pub data: Option<CachedData<UserProfile>>,
    pub error: Option<FetchError>,
    pub is_fetching: bool,
}

type ProfileFetch = Shared<BoxFuture<'static, Result<UserProfile, FetchError>>>;

struct CacheState {
    in_flight: Mutex<Option<ProfileFetch>>,
    snapshot: watch::Sender<ProfileSnapshot>,
}

/// Read-through cache of the signed-in user's profile.
///
/// Concurrent readers share one in-flight fetch. Fresh entries are served
/// without a fetch. Clones share the same cache.
#[derive(Clone)]
pub struct ProfileCache {
    gateway: Arc<dyn AuthGateway>,
    options: ProfileCacheOptions,
    shared: Arc<CacheState>,
}

impl ProfileCache {
    pub fn new(gateway: Arc<dyn AuthGateway>, options: ProfileCacheOptions) -> Self {
        let (snapshot, _) = watch::channel(ProfileSnapshot::default());
        Self {
            gateway,
            options,
            shared: Arc::new(CacheState {
                in_flight: Mutex::new(None),
                snapshot,
            }),
        }
    }

    /// The profile, fetching it if missing or stale.
    ///
    /// Joins a fetch that is already running instead of starting another.
    pub async fn get_profile(&self) -> Result<UserProfile, FetchError> {
        let fetch = {
            let mut in_flight = self.lock_in_flight();
            if in_flight.is_none() {
                if let Some(fresh) = self.fresh_data() {
                    debug!(key = PROFILE_CACHE_KEY, "Serving cached profile");
                    return Ok(fresh);
                }
            }
            self.join_or_start(&mut in_flight)
        };
        fetch.await
    }

    /// Current state without triggering anything
    pub fn snapshot(&self) -> ProfileSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    /// Receive every state change, starting with the current one
    pub fn subscribe(&self) -> watch::Receiver<ProfileSnapshot> {
        self.shared.snapshot.subscribe()
    }

    /// A view started consuming the profile.
    ///
    /// Revalidates when the cached profile is missing or stale and returns
    /// a receiver that sees the cached value now and the new one later.
    pub fn mount(&self) -> watch::Receiver<ProfileSnapshot> {
        let receiver = self.subscribe();
        if self.options.refetch_on_mount {
            self.revalidate_if_stale("mount");
        }
        receiver
    }

    /// A view regained focus. Does nothing unless focus refetching is enabled.
    pub fn focus(&self) {
        if self.options.refetch_on_focus {
            self.revalidate_if_stale("focus");
        } else {
            debug!(key = PROFILE_CACHE_KEY, "Ignoring focus, refetch on focus disabled");
        }
    }

    /// Drop the cached profile and any recorded error, e.g. after sign-out.
    /// A fetch already running still completes and repopulates the cache.
    pub fn invalidate(&self) {
        self.shared.snapshot.send_modify(|snapshot| {
            snapshot.data = None;
            snapshot.error = None;
        });
        debug!(key = PROFILE_CACHE_KEY, "Profile cache invalidated");
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<ProfileFetch>> {
        self.shared.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh_data(&self) -> Option<UserProfile> {
        let snapshot = self.shared.snapshot.borrow();
        snapshot
            .data
            .as_ref()
            .filter(|cached| !cached.is_stale_after(self.options.stale_after))
            .map(|cached| cached.data.clone())
    }

    fn revalidate_if_stale(&self, trigger: &'static str) {
        let mut in_flight = self.lock_in_flight();
        if in_flight.is_some() || self.fresh_data().is_some() {
            return;
        }
        debug!(key = PROFILE_CACHE_KEY, trigger, "Revalidating profile");
        self.join_or_start(&mut in_flight);
    }

    /// Caller holds the in-flight lock, which is what makes the check-then-start atomic
    fn join_or_start(&self, in_flight: &mut Option<ProfileFetch>) -> ProfileFetch {
        if let Some(fetch) = in_flight.as_ref() {
            debug!(key = PROFILE_CACHE_KEY, "Joining in-flight profile fetch");
            return fetch.clone();
        }

        self.shared
            .snapshot
            .send_modify(|snapshot| snapshot.is_fetching = true);

        // The fetch runs as its own task so it completes and updates the
        // cache even if every caller stops waiting.
        let task = tokio::spawn(fetch_with_retry(
            Arc::clone(&self.gateway),
            Arc::clone(&self.shared),
            self.options.retry_delay,
        ));
        let fetch = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(FetchError {
                    attempts: 0,
                    source: Arc::new(AuthError::InvalidResponse(format!(
                        "profile fetch task ended: {}",
                        e
                    ))),
                }),
            }
        }
        .boxed()
        .shared();

        *in_flight = Some(fetch.clone());
        fetch
    }
}

impl CacheState {
    /// Publish a finished fetch and clear the in-flight marker together, so a
    /// new caller either joins the fetch or sees its result.
    fn finish(&self, result: &Result<UserProfile, FetchError>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        self.snapshot.send_modify(|snapshot| {
            snapshot.is_fetching = false;
            match result {
                Ok(profile) => {
                    snapshot.data = Some(CachedData::new(profile.clone()));
                    snapshot.error = None;
                }
                // Stale-while-error: the last good profile stays visible
                Err(e) => snapshot.error = Some(e.clone()),
            }
        });
        *in_flight = None;
    }
}

/// Finishes the fetch even if its task panics or is aborted, so the cache
/// never stays marked as fetching.
struct FetchGuard {
    shared: Arc<CacheState>,
    attempts: u32,
    finished: bool,
}

impl FetchGuard {
    fn finish(mut self, result: &Result<UserProfile, FetchError>) {
        self.finished = true;
        self.shared.finish(result);
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(key = PROFILE_CACHE_KEY, attempts = self.attempts, "Profile fetch ended without a result");
        self.shared.finish(&Err(FetchError {
            attempts: self.attempts,
            source: Arc::new(AuthError::InvalidResponse(
                "profile fetch ended before completing".to_string(),
            )),
        }));
    }
}

async fn fetch_with_retry(
    gateway: Arc<dyn AuthGateway>,
    shared: Arc<CacheState>,
    retry_delay: Duration,
) -> Result<UserProfile, FetchError> {
    let mut guard = FetchGuard {
        shared,
        attempts: 0,
        finished: false,
    };
    let result = loop {
        guard.attempts += 1;
        match gateway.get_profile().await {
            Ok(profile) => break Ok(profile),
            Err(e) if guard.attempts <= FETCH_RETRIES => {
                warn!(key = PROFILE_CACHE_KEY, attempt = guard.attempts, error = %e, "Profile fetch failed, retrying");
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => {
                break Err(FetchError {
                    attempts: guard.attempts,
                    source: Arc::new(e),
                })
            }
        }
    };

    let attempts = guard.attempts;
    guard.finish(&result);

    match &result {
        Ok(_) => info!(key = PROFILE_CACHE_KEY, attempts, "Profile fetched"),
        Err(e) => warn!(key = PROFILE_CACHE_KEY, error = %e, "Profile fetch gave up"),
    }
    result
}

use std::future::Future;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use tokenward_core::{
    AuthError, AuthGateway, Config, CredentialStore, HttpAuthGateway, ProfileCache,
    ProfileCacheOptions, SessionController, SessionError, SessionEvent, SessionState,
    TerminationReason, UserRecord,
};

/// Read instead of prompting when set
const SECRET_ENV: &str = "TOKENWARD_SECRET";

/// User record fields tried, in order, for a display name
const DISPLAY_FIELDS: [&str; 4] = ["name", "displayName", "email", "id"];

pub struct App {
    config: Config,
    controller: SessionController,
    profiles: ProfileCache,
}

impl App {
    /// Create a new application instance
    pub fn new(api_url: Option<String>, data_dir: &Path) -> Result<Self> {
        let mut config = match Config::load() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Failed to load config, using defaults");
                Config::default()
            }
        }
        .with_env_overrides();
        if let Some(url) = api_url {
            config.api_base_url = url;
        }
        debug!(api = %config.api_base_url, storage = ?config.storage, "Config loaded");

        let store = CredentialStore::from_shared(config.store_backend(data_dir));
        let gateway: Arc<dyn AuthGateway> = Arc::new(HttpAuthGateway::new(
            config.api_base_url.clone(),
            store.clone(),
        )?);
        let controller =
            SessionController::new(store, Arc::clone(&gateway), config.session_options());
        let profiles = ProfileCache::new(gateway, ProfileCacheOptions::default());

        Ok(Self {
            config,
            controller,
            profiles,
        })
    }

    pub fn shutdown(&self) {
        self.controller.shutdown();
    }

    // =========================================================================
    // Commands
    // =========================================================================

    pub async fn login(&mut self, identifier: Option<String>) -> Result<()> {
        self.controller.initialize().await;

        let identifier = match identifier.or_else(|| self.config.last_identifier.clone()) {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => prompt_identifier()?,
        };
        let secret = match std::env::var(SECRET_ENV) {
            Ok(secret) if !secret.is_empty() => secret,
            _ => rpassword::prompt_password("Password: ")?,
        };
        if identifier.is_empty() || secret.is_empty() {
            bail!("Identifier and password required");
        }

        match self.controller.login(&identifier, &secret).await {
            Ok(user) => {
                self.config.last_identifier = Some(identifier);
                if let Err(e) = self.config.save() {
                    warn!(error = %e, "Failed to save config");
                }
                self.profiles.invalidate();
                println!("Signed in as {}", display_name(&user));
                Ok(())
            }
            Err(e) => bail!(login_failure_message(&e)),
        }
    }

    pub async fn logout(&mut self) -> Result<()> {
        self.controller.initialize().await;
        self.controller.logout().await;
        self.profiles.invalidate();
        println!("Signed out.");
        Ok(())
    }

    pub async fn status(&self) -> Result<()> {
        let state = self.controller.initialize().await;
        let session = self.controller.session();

        println!("State:    {}", state_label(state));
        if let Some(user) = &session.user {
            println!("User:     {}", display_name(user));
        }
        match session.minutes_until_expiry() {
            Some(minutes) => println!("Expires:  in {}m", minutes),
            None if session.is_authenticated() => println!("Expires:  unknown (restored)"),
            None => {}
        }
        println!("Service:  {}", self.config.api_base_url);
        println!(
            "Storage:  {:?}{}",
            self.config.storage,
            if self.controller.store().is_durable() {
                ""
            } else {
                " (not persisted)"
            }
        );
        Ok(())
    }

    pub async fn refresh(&self) -> Result<()> {
        self.require_session().await?;
        match self.controller.refresh().await {
            Ok(user) => {
                println!("Session refreshed for {}", display_name(&user));
                Ok(())
            }
            Err(e) => bail!(
                "Refresh failed: {}. Run `tokenward login` to sign in again.",
                e
            ),
        }
    }

    pub async fn profile(&self) -> Result<()> {
        self.require_session().await?;
        let profile = self.profiles.get_profile().await?;
        println!("{}", serde_json::to_string_pretty(profile.as_value())?);
        Ok(())
    }

    /// Keep the session alive until Ctrl-C or until it ends on its own
    pub async fn watch(&self) -> Result<()> {
        self.require_session().await?;
        if let Some(user) = self.controller.user() {
            println!("Watching session for {} (Ctrl-C to stop)", display_name(&user));
        }

        match watch_session(&self.controller, &self.profiles, tokio::signal::ctrl_c()).await {
            WatchExit::Interrupted => {
                info!("Interrupted, leaving session in place");
                println!();
            }
            WatchExit::Terminated {
                reason,
                redirect_to,
            } => {
                println!("{}", termination_message(&reason));
                println!("Sign in again: tokenward login  ({})", redirect_to);
            }
            WatchExit::Closed => debug!("Session controller went away"),
        }
        Ok(())
    }

    async fn require_session(&self) -> Result<()> {
        match self.controller.initialize().await {
            SessionState::Authenticated => Ok(()),
            _ => bail!("Not signed in. Run `tokenward login` first."),
        }
    }
}

/// Why a watch ended
#[derive(Debug, PartialEq)]
enum WatchExit {
    Interrupted,
    Terminated {
        reason: TerminationReason,
        redirect_to: String,
    },
    Closed,
}

/// Follow session and profile changes until `shutdown` resolves or the
/// session ends. `shutdown` is polled from the first iteration on, so a
/// signal arriving between iterations is not lost.
async fn watch_session<S>(
    controller: &SessionController,
    profiles: &ProfileCache,
    shutdown: S,
) -> WatchExit
where
    S: Future,
{
    let mut events = controller.subscribe();
    let mut states = controller.watch_state();
    let mut profile = profiles.mount();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => return WatchExit::Interrupted,
            event = events.recv() => match event {
                Ok(SessionEvent::Terminated { reason, redirect_to }) => {
                    return WatchExit::Terminated { reason, redirect_to };
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Session events lagged");
                }
                Err(RecvError::Closed) => return WatchExit::Closed,
            },
            changed = states.changed() => {
                if changed.is_err() {
                    return WatchExit::Closed;
                }
                let state = *states.borrow_and_update();
                if state == SessionState::Authenticated {
                    println!("Session refreshed");
                }
            },
            changed = profile.changed() => {
                if changed.is_err() {
                    continue;
                }
                let snapshot = profile.borrow_and_update().clone();
                if let Some(e) = &snapshot.error {
                    warn!(error = %e, "Profile unavailable");
                } else if let (Some(cached), false) = (&snapshot.data, snapshot.is_fetching) {
                    debug!(age = %cached.age_display(), "Profile loaded");
                }
            },
        }
    }
}

fn prompt_identifier() -> Result<String> {
    print!("Identifier: ");
    io::stdout().flush()?;

    let mut identifier = String::new();
    io::stdin().read_line(&mut identifier)?;
    Ok(identifier.trim().to_string())
}

/// Best human-readable label for a user record
fn display_name(user: &UserRecord) -> String {
    DISPLAY_FIELDS
        .iter()
        .find_map(|field| match user.as_value().get(field) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| "(unnamed user)".to_string())
}

fn state_label(state: SessionState) -> &'static str {
    match state {
        SessionState::Uninitialized => "not started",
        SessionState::Loading => "working",
        SessionState::Authenticated => "signed in",
        SessionState::Unauthenticated => "signed out",
    }
}

fn termination_message(reason: &TerminationReason) -> String {
    match reason {
        TerminationReason::LoggedOut => "Session ended: signed out.".to_string(),
        TerminationReason::RefreshFailed { error } => {
            format!("Session ended: token refresh failed ({}).", error)
        }
    }
}

/// User-facing explanation of a failed sign-in
fn login_failure_message(error: &SessionError) -> String {
    match error.gateway_error() {
        Some(AuthError::InvalidCredentials) => "Invalid identifier or password".to_string(),
        Some(AuthError::RateLimited) => {
            "Too many attempts. Wait a moment and try again.".to_string()
        }
        Some(AuthError::NetworkError(e)) if e.is_timeout() => {
            "Connection timed out. Please try again.".to_string()
        }
        Some(AuthError::NetworkError(_)) => {
            "Unable to connect to the identity service. Check your connection.".to_string()
        }
        _ => format!("Login failed: {}", error),
    }
}

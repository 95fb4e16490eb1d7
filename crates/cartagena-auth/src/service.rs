//! High-level authentication service.
//!
//! [`AuthService`] wires the session, token endpoint, authorization flow and
//! clock together and is the entry point for the rest of the application.
//! It owns one HTTP client shared by every provider call.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::AuthConfig;
use crate::error::Result;
use crate::exchange::{TokenEndpoint, TokenExchanger};
use crate::flow::{AuthFlowController, BrowserLauncher, SystemBrowser};
use crate::notifier::{RegistrationHandle, RotationListener};
use crate::session::{AuthSession, SessionSnapshot};
use crate::watcher::{TokenWatcher, WatcherHandle};

/// Timeout applied to every provider HTTP request.
const HTTP_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// AuthService
// ---------------------------------------------------------------------------

/// Owns the credential session and everything that may change it.
pub struct AuthService {
    config: Arc<AuthConfig>,
    session: Arc<AuthSession>,
    endpoint: Arc<dyn TokenEndpoint>,
    flow: Arc<AuthFlowController>,
    clock: Arc<dyn Clock>,
}

impl AuthService {
    /// Build a service talking to the real provider.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AuthError::InvalidConfig`] for an unusable config or
    /// [`crate::AuthError::NetworkError`] if the HTTP client cannot be built.
    pub fn new(config: AuthConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let client = reqwest::Client::builder()
            .user_agent(concat!("cartagena/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        let endpoint = Arc::new(TokenExchanger::new(Arc::clone(&config), client));

        Ok(Self::with_parts(
            config,
            endpoint,
            Arc::new(SystemBrowser),
            Arc::new(SystemClock),
        ))
    }

    /// Build a service from explicit collaborators.
    pub fn with_parts(
        config: Arc<AuthConfig>,
        endpoint: Arc<dyn TokenEndpoint>,
        browser: Arc<dyn BrowserLauncher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let session = Arc::new(AuthSession::new());
        let flow = Arc::new(AuthFlowController::new(
            Arc::clone(&config),
            Arc::clone(&session),
            Arc::clone(&endpoint),
            browser,
            Arc::clone(&clock),
        ));
        Self {
            config,
            session,
            endpoint,
            flow,
            clock,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<AuthSession> {
        &self.session
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    pub fn flow(&self) -> &AuthFlowController {
        &self.flow
    }

    /// Run the interactive authorization flow.
    pub async fn run_auth_flow(&self) -> Result<SessionSnapshot> {
        self.flow.run_auth_flow().await
    }

    /// Refresh using the held refresh token.
    pub async fn refresh(&self) -> Result<SessionSnapshot> {
        self.session
            .refresh(self.endpoint.as_ref(), self.clock.as_ref())
            .await
    }

    /// Ask the provider whether the current access token is still accepted.
    /// `false` when no token is held.
    pub async fn validate(&self) -> bool {
        match self.session.access_token() {
            Some(token) if !token.is_empty() => self.endpoint.validate(&token).await,
            _ => false,
        }
    }

    /// Make sure a usable token is held, renewing it if needed.
    ///
    /// Runs the full flow when nothing is held. An expired or rejected token
    /// is refreshed; if that is impossible, the full flow runs instead.
    pub async fn ensure_valid(&self) -> Result<SessionSnapshot> {
        let snapshot = self.session.snapshot();
        if !snapshot.has_access_token() {
            tracing::info!("no access token held, starting authorization");
            return self.run_auth_flow().await;
        }

        if !snapshot.is_expired(self.clock.now()) && self.validate().await {
            return Ok(snapshot);
        }

        tracing::info!("access token expired or invalid, refreshing");
        match self.refresh().await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) if e.escalates_to_reauthorization() => {
                tracing::warn!(error = %e, "refresh failed, starting authorization");
                self.run_auth_flow().await
            }
            Err(e) => Err(e),
        }
    }

    /// A watcher over this service's session. Call
    /// [`TokenWatcher::start`] to run it.
    pub fn watcher(&self) -> TokenWatcher {
        TokenWatcher::new(
            Arc::clone(&self.session),
            Arc::clone(&self.endpoint),
            self.flow.clone(),
            Arc::clone(&self.clock),
        )
    }

    /// Start background renewal.
    ///
    /// # Errors
    ///
    /// [`crate::AuthError::WatcherAlreadyRunning`] if one is already running.
    pub fn start_watcher(&self, cancel: CancellationToken) -> Result<WatcherHandle> {
        self.watcher().start(cancel)
    }

    /// Register the rotation listener.
    ///
    /// # Errors
    ///
    /// [`crate::AuthError::ListenerAlreadyRegistered`] if one is in place.
    pub fn on_token_rotated(&self, listener: Arc<dyn RotationListener>) -> Result<RegistrationHandle> {
        self.session.notifier().register(listener)
    }

    /// Remove the rotation listener. Safe to call more than once.
    pub fn remove_rotation_listener(&self, handle: &RegistrationHandle) -> bool {
        self.session.notifier().unregister(handle)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

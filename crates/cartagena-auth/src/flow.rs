//! Interactive OAuth 2.0 authorization code flow.
//!
//! # Flow Overview
//!
//! 1. Generate a single-use `state` nonce and build the authorize URL.
//! 2. Bind the callback listener on the registered redirect URI.
//! 3. Open the URL in the user's browser (best effort; the URL is also
//!    logged so it can be opened by hand).
//! 4. Wait for exactly one callback and check the returned `state`.
//! 5. Exchange the code, resolve the identity, and commit both to the
//!    session in one step.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::rand::{SecureRandom, SystemRandom};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::callback::{CallbackListener, CallbackResult};
use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::exchange::TokenEndpoint;
use crate::session::{Activity, AuthSession, SessionSnapshot};

/// Length of the `state` nonce in bytes (before base64 encoding).
const STATE_NONCE_BYTES: usize = 32;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Opens a URL for the user. Called on the blocking thread pool.
pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &str) -> std::result::Result<(), String>;
}

/// The user's default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> std::result::Result<(), String> {
        webbrowser::open(url).map_err(|e| e.to_string())
    }
}

/// Something that can run a full, interactive authorization.
///
/// `cancel` may abandon the attempt while it waits on the user; once tokens
/// are being committed the attempt runs to completion.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, cancel: &CancellationToken) -> Result<SessionSnapshot>;
}

// ---------------------------------------------------------------------------
// PendingAuthorization
// ---------------------------------------------------------------------------

/// Generate a random `state` nonce (32 random bytes, base64url encoded).
///
/// # Errors
///
/// Returns an error if the system CSPRNG fails.
pub fn generate_state() -> Result<String> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; STATE_NONCE_BYTES];
    rng.fill(&mut bytes)
        .map_err(|_| AuthError::InvalidConfig {
            reason: "failed to generate state nonce: CSPRNG error".to_string(),
        })?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// One in-flight authorization attempt. Consumed by the callback.
#[derive(Debug)]
pub struct PendingAuthorization {
    attempt: Uuid,
    state: String,
    redirect_uri: String,
}

impl PendingAuthorization {
    pub fn new(redirect_uri: impl Into<String>) -> Result<Self> {
        Ok(Self {
            attempt: Uuid::now_v7(),
            state: generate_state()?,
            redirect_uri: redirect_uri.into(),
        })
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Check the callback against this attempt and yield the code.
    ///
    /// # Errors
    ///
    /// - [`AuthError::AuthorizationDenied`] if the provider sent `error`.
    /// - [`AuthError::CsrfMismatch`] if `state` is absent or differs.
    /// - [`AuthError::MissingCode`] if `code` is absent or empty.
    pub fn consume(self, callback: CallbackResult) -> Result<String> {
        if let Some(reason) = callback.error {
            return Err(AuthError::AuthorizationDenied { reason });
        }

        if callback.state.as_deref() != Some(self.state.as_str()) {
            tracing::warn!(attempt = %self.attempt, "callback state does not match this flow");
            return Err(AuthError::CsrfMismatch);
        }

        match callback.code {
            Some(code) if !code.is_empty() => Ok(code),
            _ => Err(AuthError::MissingCode),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthFlowController
// ---------------------------------------------------------------------------

/// Drives the browser-based authorization and populates the session.
pub struct AuthFlowController {
    config: Arc<AuthConfig>,
    session: Arc<AuthSession>,
    endpoint: Arc<dyn TokenEndpoint>,
    browser: Arc<dyn BrowserLauncher>,
    clock: Arc<dyn Clock>,
}

impl AuthFlowController {
    pub fn new(
        config: Arc<AuthConfig>,
        session: Arc<AuthSession>,
        endpoint: Arc<dyn TokenEndpoint>,
        browser: Arc<dyn BrowserLauncher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            session,
            endpoint,
            browser,
            clock,
        }
    }

    /// Build the authorize URL for one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::UrlParse`] if the configured base URL is invalid.
    pub fn authorization_url(&self, state: &str) -> Result<String> {
        let mut url = Url::parse(&self.config.authorize_url())?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", state);
        Ok(url.to_string())
    }

    /// Run one complete authorization.
    ///
    /// Fails fast with [`AuthError::FlowInProgress`] if another flow holds
    /// the session. Does not retry on failure.
    pub async fn run_auth_flow(&self) -> Result<SessionSnapshot> {
        self.run_auth_flow_until(&CancellationToken::new()).await
    }

    /// [`run_auth_flow`](Self::run_auth_flow) that gives up with
    /// [`AuthError::FlowCancelled`] if `cancel` fires before the callback
    /// arrives.
    pub async fn run_auth_flow_until(&self, cancel: &CancellationToken) -> Result<SessionSnapshot> {
        let _flow = self.session.claim(Activity::AuthorizationFlow)?;
        self.config.validate()?;

        let pending = PendingAuthorization::new(self.config.redirect_uri.clone())?;
        let auth_url = self.authorization_url(pending.state())?;

        tracing::info!(attempt = %pending.attempt, "starting OAuth authorization code flow");

        // Bind before the browser can possibly redirect.
        let listener = CallbackListener::bind(pending.redirect_uri()).await?;

        let browser = Arc::clone(&self.browser);
        let url = auth_url.clone();
        match tokio::task::spawn_blocking(move || browser.open(&url)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "could not open a browser"),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => tracing::warn!(error = %e, "browser launch task failed"),
        }
        tracing::info!(url = %auth_url, "open this URL in your browser to authorize");
        tracing::info!("waiting for Twitch login...");

        let callback = tokio::select! {
            callback = listener.wait(self.config.callback_timeout) => callback?,
            _ = cancel.cancelled() => {
                tracing::info!(attempt = %pending.attempt, "authorization abandoned");
                return Err(AuthError::FlowCancelled);
            }
        };
        let code = pending.consume(callback)?;

        tracing::debug!("state verified, exchanging code for tokens");
        let tokens = self.endpoint.exchange_code(&code).await?;
        let snapshot = self
            .session
            .install(tokens, self.endpoint.as_ref(), self.clock.as_ref())
            .await?;

        tracing::info!(
            login = snapshot.user_login().unwrap_or_default(),
            "OAuth flow completed successfully"
        );
        Ok(snapshot)
    }
}

#[async_trait]
impl Authorizer for AuthFlowController {
    async fn authorize(&self, cancel: &CancellationToken) -> Result<SessionSnapshot> {
        self.run_auth_flow_until(cancel).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::ClientSecret;
    use crate::exchange::{Identity, TokenSet};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts calls and never succeeds.
    #[derive(Default)]
    struct CountingEndpoint {
        exchanges: AtomicUsize,
    }

    #[async_trait]
    impl TokenEndpoint for CountingEndpoint {
        async fn exchange_code(&self, _code: &str) -> Result<TokenSet> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            Err(AuthError::TokenExchangeFailed {
                reason: "test".to_string(),
            })
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenSet> {
            unreachable!("not used")
        }

        async fn validate(&self, _access_token: &str) -> bool {
            false
        }

        async fn fetch_identity(&self, _access_token: &str) -> Result<Identity> {
            unreachable!("not used")
        }
    }

    struct NoBrowser;

    impl BrowserLauncher for NoBrowser {
        fn open(&self, _url: &str) -> std::result::Result<(), String> {
            Err("no display".to_string())
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn controller(redirect_uri: String, timeout: Duration) -> (AuthFlowController, Arc<CountingEndpoint>) {
        let mut config = AuthConfig::new("client-1", ClientSecret::new("s3cret"));
        config.redirect_uri = redirect_uri;
        config.callback_timeout = timeout;
        let endpoint = Arc::new(CountingEndpoint::default());
        let controller = AuthFlowController::new(
            Arc::new(config),
            Arc::new(AuthSession::new()),
            endpoint.clone(),
            Arc::new(NoBrowser),
            Arc::new(SystemClock),
        );
        (controller, endpoint)
    }

    fn callback(code: Option<&str>, state: Option<&str>) -> CallbackResult {
        CallbackResult {
            code: code.map(String::from),
            state: state.map(String::from),
            error: None,
        }
    }

    #[test]
    fn state_nonce_is_random_and_url_safe() {
        let a = generate_state().unwrap();
        let b = generate_state().unwrap();
        assert_ne!(a, b);
        // 32 bytes base64url encoded = 43 characters (no padding).
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn consume_matching_state_yields_code() {
        let pending = PendingAuthorization::new("http://localhost:5000/callback").unwrap();
        let state = pending.state().to_string();
        let code = pending.consume(callback(Some("abc123"), Some(&state))).unwrap();
        assert_eq!(code, "abc123");
    }

    #[test]
    fn consume_mismatched_state_is_csrf() {
        let pending = PendingAuthorization::new("http://localhost:5000/callback").unwrap();
        let err = pending
            .consume(callback(Some("abc123"), Some("forged")))
            .unwrap_err();
        assert!(matches!(err, AuthError::CsrfMismatch));
    }

    #[test]
    fn consume_missing_state_is_csrf() {
        let pending = PendingAuthorization::new("http://localhost:5000/callback").unwrap();
        let err = pending.consume(callback(Some("abc123"), None)).unwrap_err();
        assert!(matches!(err, AuthError::CsrfMismatch));
    }

    #[test]
    fn consume_empty_code_is_missing_code() {
        let pending = PendingAuthorization::new("http://localhost:5000/callback").unwrap();
        let state = pending.state().to_string();
        let err = pending.consume(callback(Some(""), Some(&state))).unwrap_err();
        assert!(matches!(err, AuthError::MissingCode));
    }

    #[test]
    fn consume_provider_error_is_denied() {
        let pending = PendingAuthorization::new("http://localhost:5000/callback").unwrap();
        let err = pending
            .consume(CallbackResult {
                code: None,
                state: None,
                error: Some("access_denied".to_string()),
            })
            .unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationDenied { .. }));
    }

    #[test]
    fn authorization_url_includes_all_params() {
        let (controller, _) = controller(
            "http://localhost:5000/callback".to_string(),
            Duration::from_secs(1),
        );
        let url_str = controller.authorization_url("nonce-1").unwrap();
        assert!(url_str.starts_with("https://id.twitch.tv/oauth2/authorize?"));

        let url = Url::parse(&url_str).unwrap();
        let params: HashMap<_, _> = url.query_pairs().collect();
        assert_eq!(params.get("client_id").unwrap(), "client-1");
        assert_eq!(
            params.get("redirect_uri").unwrap(),
            "http://localhost:5000/callback"
        );
        assert_eq!(params.get("response_type").unwrap(), "code");
        assert_eq!(
            params.get("scope").unwrap(),
            "chat:read chat:edit user:read:email"
        );
        assert_eq!(params.get("state").unwrap(), "nonce-1");
    }

    #[tokio::test]
    async fn concurrent_flow_is_rejected_without_binding() {
        let port = free_port();
        let (controller, _) = controller(
            format!("http://127.0.0.1:{port}/callback"),
            Duration::from_millis(300),
        );
        let controller = Arc::new(controller);

        let first = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.run_auth_flow().await })
        };
        // Let the first flow claim the session and bind.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = controller.run_auth_flow().await;
        assert!(matches!(second, Err(AuthError::FlowInProgress)));

        let first = first.await.unwrap();
        assert!(matches!(first, Err(AuthError::ListenerTimeout { .. })));

        // The claim is released once the first flow ends.
        assert!(!controller.session.is_active(Activity::AuthorizationFlow));
    }

    #[tokio::test]
    async fn browser_failure_is_not_fatal() {
        // NoBrowser always fails; the flow still waits for the callback.
        let port = free_port();
        let (controller, endpoint) = controller(
            format!("http://127.0.0.1:{port}/callback"),
            Duration::from_millis(100),
        );
        let err = controller.run_auth_flow().await.unwrap_err();
        assert!(matches!(err, AuthError::ListenerTimeout { .. }));
        assert_eq!(endpoint.exchanges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_flow_releases_listener_and_claim() {
        let port = free_port();
        let redirect = format!("http://127.0.0.1:{port}/callback");
        let (controller, endpoint) = controller(redirect, Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = controller.run_auth_flow_until(&cancel).await.unwrap_err();
        assert!(matches!(err, AuthError::FlowCancelled));
        assert_eq!(endpoint.exchanges.load(Ordering::SeqCst), 0);
        assert!(!controller.session.is_active(Activity::AuthorizationFlow));
        // The port is free again.
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    /// Blocks its thread for a while, like a slow desktop launcher.
    struct SlowBrowser {
        opened: Arc<std::sync::atomic::AtomicBool>,
    }

    impl BrowserLauncher for SlowBrowser {
        fn open(&self, _url: &str) -> std::result::Result<(), String> {
            std::thread::sleep(Duration::from_millis(300));
            self.opened.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn browser_launch_does_not_block_the_runtime() {
        let port = free_port();
        let mut config = AuthConfig::new("client-1", ClientSecret::new("s3cret"));
        config.redirect_uri = format!("http://127.0.0.1:{port}/callback");
        config.callback_timeout = Duration::from_millis(500);
        let opened = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let controller = AuthFlowController::new(
            Arc::new(config),
            Arc::new(AuthSession::new()),
            Arc::new(CountingEndpoint::default()),
            Arc::new(SlowBrowser {
                opened: Arc::clone(&opened),
            }),
            Arc::new(SystemClock),
        );

        let flow = tokio::spawn(async move { controller.run_auth_flow().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Single-threaded runtime: this only runs if the launcher is off-thread.
        assert!(!opened.load(Ordering::SeqCst));

        let err = flow.await.unwrap().unwrap_err();
        assert!(matches!(err, AuthError::ListenerTimeout { .. }));
        assert!(opened.load(Ordering::SeqCst));
    }
}

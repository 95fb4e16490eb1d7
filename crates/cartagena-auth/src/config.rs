//! Provider endpoints and client credentials.

use std::fmt;
use std::time::Duration;

use url::Url;

use crate::error::{AuthError, Result};

/// Base URL of the Twitch identity service (authorize, token, validate).
pub const DEFAULT_AUTH_BASE_URL: &str = "https://id.twitch.tv/oauth2";

/// Base URL of the Twitch Helix API (identity lookup).
pub const DEFAULT_API_BASE_URL: &str = "https://api.twitch.tv/helix";

/// Redirect URI registered with the provider. Must match exactly.
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:5000/callback";

/// Scopes requested by every authorization flow.
pub const DEFAULT_SCOPES: [&str; 3] = ["chat:read", "chat:edit", "user:read:email"];

/// How long the callback listener waits for the browser redirect (5 minutes).
pub const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// ClientSecret
// ---------------------------------------------------------------------------

/// The application's client secret.
///
/// Held only in memory. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientSecret(String);

impl ClientSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The raw secret, for use in a token request body only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClientSecret(****)")
    }
}

// ---------------------------------------------------------------------------
// AuthConfig
// ---------------------------------------------------------------------------

/// Everything the auth engine needs to talk to the provider.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// The application's client id.
    pub client_id: String,

    /// The application's client secret.
    pub client_secret: ClientSecret,

    /// Base URL for `/authorize`, `/token` and `/validate`.
    pub auth_base_url: String,

    /// Base URL for the `/users` identity endpoint.
    pub api_base_url: String,

    /// The local redirect URI the callback listener binds to.
    pub redirect_uri: String,

    /// The scopes to request.
    pub scopes: Vec<String>,

    /// Upper bound on the wait for the browser redirect.
    pub callback_timeout: Duration,
}

impl AuthConfig {
    /// Create a configuration with the default Twitch endpoints.
    pub fn new(client_id: impl Into<String>, client_secret: ClientSecret) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            auth_base_url: DEFAULT_AUTH_BASE_URL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            callback_timeout: Duration::from_secs(DEFAULT_CALLBACK_TIMEOUT_SECS),
        }
    }

    pub fn authorize_url(&self) -> String {
        join(&self.auth_base_url, "authorize")
    }

    pub fn token_url(&self) -> String {
        join(&self.auth_base_url, "token")
    }

    pub fn validate_url(&self) -> String {
        join(&self.auth_base_url, "validate")
    }

    pub fn users_url(&self) -> String {
        join(&self.api_base_url, "users")
    }

    /// Check that the configuration can drive an authorization flow.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] for an empty client id or secret,
    /// or a redirect URI that is not a plain-HTTP loopback URL.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(AuthError::InvalidConfig {
                reason: "client id is empty".to_string(),
            });
        }
        if self.client_secret.is_empty() {
            return Err(AuthError::InvalidConfig {
                reason: "client secret is empty".to_string(),
            });
        }

        let redirect = Url::parse(&self.redirect_uri)?;
        if redirect.scheme() != "http" {
            return Err(AuthError::InvalidConfig {
                reason: format!("redirect URI must use http: {}", self.redirect_uri),
            });
        }
        if !matches!(
            redirect.host_str(),
            Some("localhost") | Some("127.0.0.1") | Some("[::1]")
        ) {
            return Err(AuthError::InvalidConfig {
                reason: format!("redirect URI must point at loopback: {}", self.redirect_uri),
            });
        }
        if redirect.port().is_none() {
            return Err(AuthError::InvalidConfig {
                reason: format!("redirect URI needs an explicit port: {}", self.redirect_uri),
            });
        }
        Ok(())
    }
}

fn join(base: &str, segment: &str) -> String {
    format!("{}/{segment}", base.trim_end_matches('/'))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

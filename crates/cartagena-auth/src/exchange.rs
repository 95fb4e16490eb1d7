//! Token endpoint, validation and identity calls against the provider.
//!
//! The [`TokenExchanger`] turns an authorization code or a refresh token
//! into a [`TokenSet`], checks whether an access token is still accepted,
//! and resolves the [`Identity`] behind a token. Every non-2xx answer is
//! translated into a typed [`AuthError`]; transport failures surface as
//! [`AuthError::NetworkError`]. On refresh, only a 400, 401 or 403 means
//! the refresh token itself was rejected; anything else is an outage.
//!
//! The rest of the crate talks to the provider only through the
//! [`TokenEndpoint`] trait, so the flow and the watcher can be exercised
//! against a fake.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::{AuthError, Result};

/// Seconds subtracted from the provider's `expires_in` so the session is
/// renewed well before the token actually dies.
pub const EXPIRY_SAFETY_MARGIN_SECS: i64 = 600;

// ---------------------------------------------------------------------------
// Token types
// ---------------------------------------------------------------------------

/// Tokens returned by the token endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of the access token in seconds, as reported by the provider.
    pub expires_in: i64,
}

impl TokenSet {
    /// The instant after which the access token is treated as invalid:
    /// `issued_at + expires_in - 600s`.
    ///
    /// Lifetimes beyond what a timestamp can hold saturate instead of
    /// overflowing.
    pub fn expires_at(&self, issued_at: DateTime<Utc>) -> DateTime<Utc> {
        let lifetime = self.expires_in.saturating_sub(EXPIRY_SAFETY_MARGIN_SECS);
        TimeDelta::try_seconds(lifetime)
            .and_then(|delta| issued_at.checked_add_signed(delta))
            .unwrap_or(if lifetime > 0 {
                DateTime::<Utc>::MAX_UTC
            } else {
                DateTime::<Utc>::MIN_UTC
            })
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"****")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "****"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// The user behind an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub user_login: String,
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    data: Vec<UserRecord>,
}

#[derive(Debug, Deserialize)]
struct UserRecord {
    id: String,
    login: String,
    display_name: String,
}

/// Error body shapes seen from the provider: Twitch uses
/// `{status, message}`, plain OAuth uses `{error, error_description}`.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

// ---------------------------------------------------------------------------
// TokenEndpoint
// ---------------------------------------------------------------------------

/// The provider operations the session engine depends on.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchange an authorization code for tokens.
    async fn exchange_code(&self, code: &str) -> Result<TokenSet>;

    /// Trade a refresh token for a new token set.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet>;

    /// Whether the provider still accepts `access_token`. Any failure to
    /// find out counts as "not valid".
    async fn validate(&self, access_token: &str) -> bool;

    /// Resolve the user behind `access_token`.
    async fn fetch_identity(&self, access_token: &str) -> Result<Identity>;
}

// ---------------------------------------------------------------------------
// TokenExchanger
// ---------------------------------------------------------------------------

/// [`TokenEndpoint`] backed by the real provider over HTTPS.
///
/// The `reqwest::Client` is shared; it carries no per-request state.
pub struct TokenExchanger {
    config: Arc<AuthConfig>,
    client: reqwest::Client,
}

impl TokenExchanger {
    pub fn new(config: Arc<AuthConfig>, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    async fn post_token_form(&self, params: &[(&str, &str)]) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.config.token_url())
            .form(params)
            .send()
            .await?;
        Ok(response)
    }

    /// Read a token endpoint response, mapping a rejection through `reject`.
    async fn parse_token_response(
        response: reqwest::Response,
        reject: fn(reqwest::StatusCode, String) -> AuthError,
    ) -> Result<TokenSet> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(reject(status, error_reason(status, &body)));
        }

        let tokens: TokenSet = serde_json::from_str(&body)?;
        Ok(tokens)
    }
}

#[async_trait]
impl TokenEndpoint for TokenExchanger {
    async fn exchange_code(&self, code: &str) -> Result<TokenSet> {
        tracing::debug!(token_url = %self.config.token_url(), "exchanging authorization code");

        let response = self
            .post_token_form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.expose()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ])
            .await?;

        Self::parse_token_response(response, |_, reason| AuthError::TokenExchangeFailed { reason })
            .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet> {
        tracing::debug!(token_url = %self.config.token_url(), "refreshing access token");

        let response = self
            .post_token_form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.expose()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .await?;

        Self::parse_token_response(response, refresh_failure).await
    }

    async fn validate(&self, access_token: &str) -> bool {
        if access_token.is_empty() {
            return false;
        }

        let result = self
            .client
            .get(self.config.validate_url())
            .header("Authorization", format!("OAuth {access_token}"))
            .send()
            .await;

        match result {
            Ok(response) => {
                let valid = response.status().is_success();
                tracing::debug!(status = %response.status(), valid, "token validation");
                valid
            }
            Err(e) => {
                tracing::warn!(error = %e, "token validation request failed, treating token as invalid");
                false
            }
        }
    }

    async fn fetch_identity(&self, access_token: &str) -> Result<Identity> {
        let response = self
            .client
            .get(self.config.users_url())
            .bearer_auth(access_token)
            .header("Client-Id", &self.config.client_id)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AuthError::IdentityFetchFailed {
                reason: error_reason(status, &body),
            });
        }

        let users: UsersResponse =
            serde_json::from_str(&body).map_err(|e| AuthError::IdentityFetchFailed {
                reason: format!("malformed users response: {e}"),
            })?;

        let user = users
            .data
            .into_iter()
            .next()
            .ok_or_else(|| AuthError::IdentityFetchFailed {
                reason: "users response contained no user".to_string(),
            })?;

        Ok(Identity {
            user_id: user.id,
            user_login: user.login,
            display_name: user.display_name,
        })
    }
}

/// A refresh answered with 400/401/403 means the refresh token is dead; any
/// other failure status leaves it usable for a later retry.
fn refresh_failure(status: reqwest::StatusCode, reason: String) -> AuthError {
    match status {
        reqwest::StatusCode::BAD_REQUEST
        | reqwest::StatusCode::UNAUTHORIZED
        | reqwest::StatusCode::FORBIDDEN => AuthError::RefreshInvalid { reason },
        _ => AuthError::ProviderUnavailable {
            status: status.as_u16(),
            reason,
        },
    }
}

fn error_reason(status: reqwest::StatusCode, body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|e| e.error_description.or(e.message).or(e.error))
        .unwrap_or_else(|| format!("HTTP {status}: {body}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

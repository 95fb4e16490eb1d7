//! Error types for the auth crate.
//!
//! All auth operations surface errors through [`AuthError`], the single error
//! type for this crate. Each variant carries enough context for callers to
//! decide whether to abort, retry the whole flow, or fall back to a full
//! re-authorization.

/// Unified error type for the Cartagena auth engine.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The `state` returned by the callback does not match the nonce this
    /// flow generated. No token exchange is attempted.
    #[error("state mismatch on OAuth callback (possible CSRF attempt)")]
    CsrfMismatch,

    /// The callback request carried no authorization code.
    #[error("callback did not contain an authorization code")]
    MissingCode,

    /// The user (or the provider) refused the authorization request.
    #[error("authorization denied by provider: {reason}")]
    AuthorizationDenied {
        /// The `error` / `error_description` values from the redirect.
        reason: String,
    },

    /// The local callback listener could not bind its address.
    #[error("failed to bind callback listener on {addr}: {source}")]
    ListenerBindFailed {
        /// The address we tried to bind.
        addr: String,
        /// The underlying bind error.
        #[source]
        source: std::io::Error,
    },

    /// No callback arrived within the allotted time.
    #[error("callback timed out after {timeout_secs} seconds")]
    ListenerTimeout {
        /// How many seconds we waited before giving up.
        timeout_secs: u64,
    },

    /// The token endpoint rejected an authorization-code exchange.
    #[error("token exchange failed: {reason}")]
    TokenExchangeFailed {
        /// Explanation from the authorization server.
        reason: String,
    },

    /// The token endpoint rejected the refresh token. Callers fall back to a
    /// full authorization flow rather than retrying the refresh.
    #[error("refresh token rejected: {reason}")]
    RefreshInvalid {
        /// Explanation from the authorization server.
        reason: String,
    },

    /// The identity lookup for the current token failed.
    #[error("identity lookup failed: {reason}")]
    IdentityFetchFailed {
        /// What went wrong.
        reason: String,
    },

    /// An HTTP request to the provider failed at the transport level.
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// Another authorization flow is already running for this session.
    #[error("an authorization flow is already in progress")]
    FlowInProgress,

    /// The authorization flow was abandoned before the browser called back.
    #[error("authorization flow cancelled")]
    FlowCancelled,

    /// The token endpoint could not serve the request right now (5xx, rate
    /// limit). The refresh token may still be good; retry later.
    #[error("token endpoint unavailable (HTTP {status}): {reason}")]
    ProviderUnavailable {
        /// HTTP status returned by the authorization server.
        status: u16,
        /// Explanation from the authorization server.
        reason: String,
    },

    /// A token watcher is already running for this session.
    #[error("a token watcher is already running for this session")]
    WatcherAlreadyRunning,

    /// A rotation listener is already registered for this session.
    #[error("a rotation listener is already registered")]
    ListenerAlreadyRegistered,

    /// Configuration is missing or malformed.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// JSON serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error on the callback connection.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing error.
    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl AuthError {
    /// Whether the token watcher should react to this error by running a
    /// full authorization flow instead of retrying on its next tick.
    pub fn escalates_to_reauthorization(&self) -> bool {
        matches!(self, Self::RefreshInvalid { .. })
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AuthError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

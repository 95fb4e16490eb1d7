//! Twitch OAuth session engine for Cartagena.
//!
//! This crate acquires, holds and renews the credentials a chat bot needs:
//!
//! - **Authorization code flow** through the user's browser, with a
//!   single-use `state` nonce checked on the way back
//! - **Local callback listener** that answers exactly one redirect
//! - **Token exchange, refresh, validation** and identity lookup
//! - **Background renewal** that refreshes before expiry and falls back to a
//!   fresh login when the refresh token is dead
//! - **Rotation notifications** so the chat connection can reconnect with
//!   the new token
//!
//! Nothing is persisted; every process starts without credentials.
//!
//! # Architecture
//!
//! ```text
//! AuthService
//! ├── AuthFlowController  (browser + CallbackListener + state check)
//! ├── TokenExchanger      (token, validate and users endpoints)
//! ├── AuthSession         (tokens + identity, single mutation path)
//! │   └── RotationNotifier
//! └── TokenWatcher        (periodic refresh / re-authorization)
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cartagena_auth::{AuthConfig, AuthService, ClientSecret};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> cartagena_auth::Result<()> {
//! let config = AuthConfig::new("my-client-id", ClientSecret::new("my-secret"));
//! let service = AuthService::new(config)?;
//!
//! let session = service.run_auth_flow().await?;
//! println!("logged in as {}", session.user_login().unwrap_or_default());
//!
//! let watcher = service.start_watcher(CancellationToken::new())?;
//! // ...
//! watcher.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod clock;
pub mod config;
pub mod error;
pub mod exchange;
pub mod flow;
pub mod notifier;
pub mod service;
pub mod session;
pub mod watcher;

// Re-export key types at the crate root for convenience.
pub use callback::{CallbackListener, CallbackResult, await_callback};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuthConfig, ClientSecret};
pub use error::{AuthError, Result};
pub use exchange::{Identity, TokenEndpoint, TokenExchanger, TokenSet};
pub use flow::{AuthFlowController, Authorizer, BrowserLauncher, PendingAuthorization, SystemBrowser};
pub use notifier::{RegistrationHandle, RotationListener, RotationNotifier, TokenRotated};
pub use service::AuthService;
pub use session::{Activity, AuthSession, SessionSnapshot};
pub use watcher::{TickOutcome, TokenWatcher, WatcherHandle, WatcherState, next_wake_delay};

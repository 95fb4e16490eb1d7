//! The in-memory credential and identity record.
//!
//! [`AuthSession`] is the single source of truth for the current access
//! token, refresh token, expiry and resolved identity. Collaborators read it
//! through accessors or a [`SessionSnapshot`]; the only mutation path is
//! [`AuthSession::install`], which swaps tokens and identity in one write
//! and delivers the rotation before releasing the dispatch lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::error::{AuthError, Result};
use crate::exchange::{Identity, TokenEndpoint, TokenSet};
use crate::notifier::{RotationNotifier, TokenRotated};

// ---------------------------------------------------------------------------
// SessionSnapshot
// ---------------------------------------------------------------------------

/// A consistent copy of the session at one instant.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// `None` until the first acquisition; treated as already expired.
    pub expires_at: Option<DateTime<Utc>>,
    pub identity: Option<Identity>,
}

impl SessionSnapshot {
    pub fn user_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.user_id.as_str())
    }

    pub fn user_login(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.user_login.as_str())
    }

    pub fn display_name(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.display_name.as_str())
    }

    pub fn has_access_token(&self) -> bool {
        self.access_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Whether the token must be renewed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now,
            None => true,
        }
    }
}

impl std::fmt::Debug for SessionSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSnapshot")
            .field("access_token", &self.access_token.as_ref().map(|_| "****"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "****"))
            .field("expires_at", &self.expires_at)
            .field("identity", &self.identity)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// AuthSession
// ---------------------------------------------------------------------------

/// Work that at most one task may run per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    AuthorizationFlow,
    Watcher,
}

/// Owned credential state for one process.
pub struct AuthSession {
    state: RwLock<SessionSnapshot>,
    notifier: RotationNotifier,
    flow_active: AtomicBool,
    watcher_active: AtomicBool,
}

impl AuthSession {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SessionSnapshot::default()),
            notifier: RotationNotifier::new(),
            flow_active: AtomicBool::new(false),
            watcher_active: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.snapshot().access_token
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.snapshot().refresh_token
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot().expires_at
    }

    pub fn user_login(&self) -> Option<String> {
        self.snapshot().user_login().map(String::from)
    }

    /// The rotation callback slot.
    pub fn notifier(&self) -> &RotationNotifier {
        &self.notifier
    }

    pub fn is_active(&self, activity: Activity) -> bool {
        self.flag(activity).load(Ordering::SeqCst)
    }

    /// Claim `activity` for the lifetime of the returned guard.
    ///
    /// # Errors
    ///
    /// [`AuthError::FlowInProgress`] or [`AuthError::WatcherAlreadyRunning`]
    /// if it is already claimed.
    pub fn claim(self: &Arc<Self>, activity: Activity) -> Result<ActivityGuard> {
        self.flag(activity)
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| match activity {
                Activity::AuthorizationFlow => AuthError::FlowInProgress,
                Activity::Watcher => AuthError::WatcherAlreadyRunning,
            })?;
        Ok(ActivityGuard {
            session: Arc::clone(self),
            activity,
        })
    }

    fn flag(&self, activity: Activity) -> &AtomicBool {
        match activity {
            Activity::AuthorizationFlow => &self.flow_active,
            Activity::Watcher => &self.watcher_active,
        }
    }

    /// Resolve the identity for `tokens` and make both current.
    ///
    /// Nothing is written unless the identity lookup succeeds, so readers
    /// never see a new token paired with a stale identity. The rotation is
    /// delivered to the registered listener before this returns.
    pub(crate) async fn install(
        &self,
        tokens: TokenSet,
        endpoint: &dyn TokenEndpoint,
        clock: &dyn Clock,
    ) -> Result<SessionSnapshot> {
        let issued_at = clock.now();
        let identity = endpoint.fetch_identity(&tokens.access_token).await?;
        let expires_at = tokens.expires_at(issued_at);

        let mut committed = SessionSnapshot::default();
        self.notifier
            .commit_and_notify(|| {
                let next = SessionSnapshot {
                    access_token: Some(tokens.access_token.clone()),
                    refresh_token: tokens.refresh_token.clone(),
                    expires_at: Some(expires_at),
                    identity: Some(identity.clone()),
                };
                *self.state.write().unwrap_or_else(|e| e.into_inner()) = next.clone();
                committed = next;

                TokenRotated {
                    access_token: tokens.access_token,
                    user_id: identity.user_id,
                    user_login: identity.user_login,
                    display_name: identity.display_name,
                    expires_at,
                }
            })
            .await;

        tracing::info!(
            login = committed.user_login().unwrap_or_default(),
            expires_at = %expires_at,
            "session credentials updated"
        );
        Ok(committed)
    }

    /// Trade the held refresh token for new credentials.
    ///
    /// # Errors
    ///
    /// [`AuthError::RefreshInvalid`] if no refresh token is held or the
    /// provider rejects it; otherwise whatever the endpoint reports.
    pub(crate) async fn refresh(
        &self,
        endpoint: &dyn TokenEndpoint,
        clock: &dyn Clock,
    ) -> Result<SessionSnapshot> {
        let refresh_token = self
            .refresh_token()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::RefreshInvalid {
                reason: "no refresh token held".to_string(),
            })?;

        let tokens = endpoint.refresh(&refresh_token).await?;
        tracing::info!("token refreshed successfully");
        self.install(tokens, endpoint, clock).await
    }
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases a claimed [`Activity`] when dropped.
pub struct ActivityGuard {
    session: Arc<AuthSession>,
    activity: Activity,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.session
            .flag(self.activity)
            .store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Token rotation notifications.
//!
//! A session has at most one [`RotationListener`] at a time. Registration
//! hands back a [`RegistrationHandle`]; removing it is idempotent and a stale
//! handle can never remove a newer registration.
//!
//! Deliveries are serialized: the session commits new credentials and calls
//! the listener while holding the dispatch lock, so a listener never runs
//! concurrently with itself and always sees rotations in commit order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AuthError, Result};

/// Fresh credentials handed to the registered listener.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenRotated {
    pub access_token: String,
    pub user_id: String,
    pub user_login: String,
    pub display_name: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for TokenRotated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRotated")
            .field("access_token", &"****")
            .field("user_id", &self.user_id)
            .field("user_login", &self.user_login)
            .field("display_name", &self.display_name)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Consumer of rotation events, typically the chat connection.
#[async_trait]
pub trait RotationListener: Send + Sync {
    async fn on_token_rotated(&self, rotation: &TokenRotated);
}

/// Proof of registration, used to unregister.
#[derive(Debug, PartialEq, Eq)]
pub struct RegistrationHandle {
    id: u64,
}

/// The single rotation callback slot of a session.
pub struct RotationNotifier {
    slot: Mutex<Option<(u64, Arc<dyn RotationListener>)>>,
    dispatch: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
    delivered: AtomicU64,
}

impl RotationNotifier {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            dispatch: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
            delivered: AtomicU64::new(0),
        }
    }

    /// Register the rotation listener.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ListenerAlreadyRegistered`] if one is already
    /// in place; unregister it first.
    pub fn register(&self, listener: Arc<dyn RotationListener>) -> Result<RegistrationHandle> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(AuthError::ListenerAlreadyRegistered);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *slot = Some((id, listener));
        tracing::debug!(registration = id, "rotation listener registered");
        Ok(RegistrationHandle { id })
    }

    /// Remove the registration behind `handle`. Returns `true` if it was
    /// still active.
    pub fn unregister(&self, handle: &RegistrationHandle) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some((id, _)) if *id == handle.id => {
                *slot = None;
                tracing::debug!(registration = handle.id, "rotation listener removed");
                true
            }
            _ => false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Number of rotations delivered to a listener so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Run `commit` and deliver its rotation, all under the dispatch lock.
    pub(crate) async fn commit_and_notify<F>(&self, commit: F)
    where
        F: FnOnce() -> TokenRotated,
    {
        let _serial = self.dispatch.lock().await;
        let rotation = commit();

        let listener = self
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(_, listener)| Arc::clone(listener));

        match listener {
            Some(listener) => {
                tracing::info!(login = %rotation.user_login, "access token rotated, notifying listener");
                listener.on_token_rotated(&rotation).await;
                self.delivered.fetch_add(1, Ordering::SeqCst);
            }
            None => tracing::debug!("access token rotated, no listener registered"),
        }
    }
}

impl Default for RotationNotifier {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Background token renewal.
//!
//! The [`TokenWatcher`] loop wakes at least once a minute. When the session
//! has no token, or the token is past its (already shortened) expiry, it
//! refreshes; if the refresh token is unusable it falls back to a full
//! interactive flow. Transient failures are logged and retried on the next
//! wake, so the loop only ends on cancellation.
//!
//! Cancellation is honoured between iterations. A refresh that has started
//! always runs to completion, including delivery of its rotation; only the
//! wait for a browser callback during a fallback flow is cut short.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::Result;
use crate::exchange::TokenEndpoint;
use crate::flow::Authorizer;
use crate::session::{Activity, ActivityGuard, AuthSession};

/// How long before expiry the watcher aims to wake.
pub const RENEWAL_LEAD: Duration = Duration::from_secs(60);

/// Upper bound on any single sleep.
pub const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Sleep used when the computed delay is not positive.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// How long to sleep before the next check.
///
/// `min(expires_at - now - RENEWAL_LEAD, MAX_SLEEP)`, replaced by
/// [`RETRY_INTERVAL`] when that is zero or negative, or when there is no
/// expiry yet.
pub fn next_wake_delay(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    let Some(expires_at) = expires_at else {
        return RETRY_INTERVAL;
    };
    let until_lead = expires_at - now - chrono::Duration::seconds(RENEWAL_LEAD.as_secs() as i64);
    match until_lead.to_std() {
        Ok(delay) if !delay.is_zero() => delay.min(MAX_SLEEP),
        _ => RETRY_INTERVAL,
    }
}

/// Lifecycle of one watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Running,
    Stopped,
}

/// What a single check did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The token is still good; nothing was done.
    Fresh,
    Refreshed,
    Reauthorized,
}

/// Keeps the session's access token fresh until cancelled.
pub struct TokenWatcher {
    session: Arc<AuthSession>,
    endpoint: Arc<dyn TokenEndpoint>,
    authorizer: Arc<dyn Authorizer>,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<WatcherState>>,
}

impl TokenWatcher {
    pub fn new(
        session: Arc<AuthSession>,
        endpoint: Arc<dyn TokenEndpoint>,
        authorizer: Arc<dyn Authorizer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            session,
            endpoint,
            authorizer,
            clock,
            state: Arc::new(Mutex::new(WatcherState::Idle)),
        }
    }

    pub fn state(&self) -> WatcherState {
        read_state(&self.state)
    }

    /// Run one check: refresh if needed, re-authorize if refresh is hopeless.
    ///
    /// Rotation notification happens inside the session update, so this never
    /// notifies on its own. `cancel` only aborts a fallback flow that is still
    /// waiting for the browser.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickOutcome> {
        let snapshot = self.session.snapshot();
        if snapshot.has_access_token() && !snapshot.is_expired(self.clock.now()) {
            return Ok(TickOutcome::Fresh);
        }

        tracing::info!("access token expired or missing, refreshing");
        match self
            .session
            .refresh(self.endpoint.as_ref(), self.clock.as_ref())
            .await
        {
            Ok(_) => Ok(TickOutcome::Refreshed),
            Err(e) if e.escalates_to_reauthorization() => {
                tracing::warn!(error = %e, "refresh failed, starting full authorization");
                self.authorizer.authorize(cancel).await?;
                Ok(TickOutcome::Reauthorized)
            }
            Err(e) => Err(e),
        }
    }

    /// Spawn the renewal loop.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AuthError::WatcherAlreadyRunning`] if the session
    /// already has a live watcher.
    pub fn start(self, cancel: CancellationToken) -> Result<WatcherHandle> {
        let guard = self.session.claim(Activity::Watcher)?;
        set_state(&self.state, WatcherState::Running);

        let state = Arc::clone(&self.state);
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { self.run(task_cancel, guard).await });

        Ok(WatcherHandle {
            state,
            cancel,
            task,
        })
    }

    async fn run(self, cancel: CancellationToken, _guard: ActivityGuard) {
        tracing::info!("token watcher started");

        loop {
            match self.tick(&cancel).await {
                Ok(TickOutcome::Fresh) => {}
                Ok(outcome) => tracing::debug!(?outcome, "token watcher renewed credentials"),
                Err(e) if cancel.is_cancelled() => {
                    tracing::debug!(error = %e, "token check interrupted by shutdown");
                }
                Err(e) => tracing::error!(error = %e, "token check failed, retrying later"),
            }

            if cancel.is_cancelled() {
                break;
            }

            let delay = next_wake_delay(self.session.expires_at(), self.clock.now());
            tracing::trace!(delay_secs = delay.as_secs(), "token watcher sleeping");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => break,
            }
        }

        set_state(&self.state, WatcherState::Stopped);
        tracing::info!("token watcher stopped");
    }
}

/// Control over a spawned watcher.
pub struct WatcherHandle {
    state: Arc<Mutex<WatcherState>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn state(&self) -> WatcherState {
        read_state(&self.state)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "token watcher task failed");
        }
    }
}

fn read_state(state: &Mutex<WatcherState>) -> WatcherState {
    *state.lock().unwrap_or_else(|e| e.into_inner())
}

fn set_state(state: &Mutex<WatcherState>, next: WatcherState) {
    *state.lock().unwrap_or_else(|e| e.into_inner()) = next;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::AuthError;
    use crate::exchange::{Identity, TokenSet};
    use crate::session::SessionSnapshot;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn delay_is_capped_at_one_minute() {
        assert_eq!(next_wake_delay(Some(at(3600)), at(0)), MAX_SLEEP);
    }

    #[test]
    fn five_minutes_left_wakes_within_a_minute() {
        let delay = next_wake_delay(Some(at(300)), at(0));
        assert_eq!(delay, Duration::from_secs(60));
        assert!(delay < Duration::from_secs(300));
    }

    #[test]
    fn delay_shrinks_close_to_expiry() {
        assert_eq!(
            next_wake_delay(Some(at(90)), at(0)),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn non_positive_delay_becomes_retry_interval() {
        assert_eq!(next_wake_delay(Some(at(60)), at(0)), RETRY_INTERVAL);
        assert_eq!(next_wake_delay(Some(at(30)), at(0)), RETRY_INTERVAL);
        assert_eq!(next_wake_delay(Some(at(-500)), at(0)), RETRY_INTERVAL);
        assert_eq!(next_wake_delay(None, at(0)), RETRY_INTERVAL);
    }

    // -- tick ---------------------------------------------------------------

    struct ScriptedEndpoint {
        refresh_results: Mutex<Vec<Result<TokenSet>>>,
        refreshes: AtomicUsize,
    }

    impl ScriptedEndpoint {
        fn new(results: Vec<Result<TokenSet>>) -> Self {
            Self {
                refresh_results: Mutex::new(results),
                refreshes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TokenEndpoint for ScriptedEndpoint {
        async fn exchange_code(&self, _code: &str) -> Result<TokenSet> {
            unreachable!("not used")
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenSet> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            self.refresh_results.lock().unwrap().remove(0)
        }

        async fn validate(&self, _access_token: &str) -> bool {
            true
        }

        async fn fetch_identity(&self, _access_token: &str) -> Result<Identity> {
            Ok(Identity {
                user_id: "42".to_string(),
                user_login: "cartagena".to_string(),
                display_name: "Cartagena".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct CountingAuthorizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Authorizer for CountingAuthorizer {
        async fn authorize(&self, _cancel: &CancellationToken) -> Result<SessionSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SessionSnapshot::default())
        }
    }

    fn tokens(access: &str, expires_in: i64) -> TokenSet {
        TokenSet {
            access_token: access.to_string(),
            refresh_token: Some("rt".to_string()),
            expires_in,
        }
    }

    struct Harness {
        session: Arc<AuthSession>,
        endpoint: Arc<ScriptedEndpoint>,
        authorizer: Arc<CountingAuthorizer>,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new(refresh_results: Vec<Result<TokenSet>>) -> Self {
            Self {
                session: Arc::new(AuthSession::new()),
                endpoint: Arc::new(ScriptedEndpoint::new(refresh_results)),
                authorizer: Arc::new(CountingAuthorizer::default()),
                clock: Arc::new(ManualClock::new(at(0))),
            }
        }

        fn watcher(&self) -> TokenWatcher {
            TokenWatcher::new(
                self.session.clone(),
                self.endpoint.clone(),
                self.authorizer.clone(),
                self.clock.clone(),
            )
        }

        async fn seed(&self, expires_in: i64) {
            self.session
                .install(tokens("at-0", expires_in), self.endpoint.as_ref(), self.clock.as_ref())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn fresh_token_is_left_alone() {
        let h = Harness::new(vec![]);
        h.seed(3600).await;
        assert_eq!(h.watcher().tick(&CancellationToken::new()).await.unwrap(), TickOutcome::Fresh);
        assert_eq!(h.endpoint.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed() {
        let h = Harness::new(vec![Ok(tokens("at-1", 3600))]);
        h.seed(900).await;
        // 900s minus the 600s safety margin: stale after 300s.
        h.clock.advance(chrono::Duration::seconds(301));

        assert_eq!(h.watcher().tick(&CancellationToken::new()).await.unwrap(), TickOutcome::Refreshed);
        assert_eq!(h.session.access_token().as_deref(), Some("at-1"));
        assert_eq!(h.authorizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_refresh_falls_back_to_authorization() {
        let h = Harness::new(vec![Err(AuthError::RefreshInvalid {
            reason: "Invalid refresh token".to_string(),
        })]);
        h.seed(0).await;

        assert_eq!(h.watcher().tick(&CancellationToken::new()).await.unwrap(), TickOutcome::Reauthorized);
        assert_eq!(h.authorizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_session_goes_straight_to_authorization() {
        let h = Harness::new(vec![]);
        assert_eq!(h.watcher().tick(&CancellationToken::new()).await.unwrap(), TickOutcome::Reauthorized);
        assert_eq!(h.endpoint.refreshes.load(Ordering::SeqCst), 0);
        assert_eq!(h.authorizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failure_does_not_reauthorize() {
        let h = Harness::new(vec![Err(AuthError::IdentityFetchFailed {
            reason: "HTTP 503".to_string(),
        })]);
        h.seed(0).await;

        let err = h.watcher().tick(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AuthError::IdentityFetchFailed { .. }));
        assert_eq!(h.authorizer.calls.load(Ordering::SeqCst), 0);
        // Nothing was committed.
        assert_eq!(h.session.access_token().as_deref(), Some("at-0"));
    }

    #[tokio::test]
    async fn refresh_happens_before_expiry_is_overslept() {
        let h = Harness::new(vec![Ok(tokens("at-1", 3600))]);
        // Effective expiry 5 minutes out.
        h.seed(900).await;
        let expires_at = h.session.expires_at().unwrap();
        let watcher = h.watcher();
        let cancel = CancellationToken::new();

        loop {
            if watcher.tick(&cancel).await.unwrap() == TickOutcome::Refreshed {
                break;
            }
            let delay = next_wake_delay(h.session.expires_at(), h.clock.now());
            h.clock
                .advance(chrono::Duration::from_std(delay).unwrap());
        }

        // The refresh fires no later than one retry interval past expiry.
        let late = h.clock.now() - expires_at;
        assert!(late <= chrono::Duration::from_std(RETRY_INTERVAL).unwrap());
    }

    #[tokio::test]
    async fn second_watcher_is_rejected_and_stop_releases() {
        let h = Harness::new(vec![]);
        h.seed(3600).await;

        let handle = h.watcher().start(CancellationToken::new()).unwrap();
        assert_eq!(handle.state(), WatcherState::Running);

        let second = h.watcher().start(CancellationToken::new());
        assert!(matches!(second, Err(AuthError::WatcherAlreadyRunning)));

        let state = Arc::clone(&handle.state);
        handle.stop().await;
        assert_eq!(read_state(&state), WatcherState::Stopped);
        assert!(!h.session.is_active(Activity::Watcher));

        let again = h.watcher().start(CancellationToken::new()).unwrap();
        again.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn loop_keeps_going_after_transient_error() {
        let h = Harness::new(vec![
            Err(AuthError::IdentityFetchFailed {
                reason: "HTTP 503".to_string(),
            }),
            Ok(tokens("at-1", 3600)),
        ]);
        h.seed(0).await;

        let handle = h.watcher().start(CancellationToken::new()).unwrap();
        // First tick fails, the retry after RETRY_INTERVAL succeeds.
        tokio::time::sleep(RETRY_INTERVAL + Duration::from_secs(1)).await;

        assert_eq!(h.endpoint.refreshes.load(Ordering::SeqCst), 2);
        assert_eq!(h.session.access_token().as_deref(), Some("at-1"));
        handle.stop().await;
    }

    /// Takes a while to react to a rotation.
    #[derive(Default)]
    struct SlowListener {
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl crate::notifier::RotationListener for SlowListener {
        async fn on_token_rotated(&self, _rotation: &crate::notifier::TokenRotated) {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(500)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn stop_lets_an_in_flight_rotation_finish() {
        let h = Harness::new(vec![Ok(tokens("at-new", 3600))]);
        h.seed(0).await;
        let listener = Arc::new(SlowListener::default());
        let _registration = h.session.notifier().register(listener.clone()).unwrap();
        let delivered_before = h.session.notifier().delivered();

        let handle = h.watcher().start(CancellationToken::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;

        assert_eq!(h.session.access_token().as_deref(), Some("at-new"));
        assert_eq!(listener.started.load(Ordering::SeqCst), 1);
        assert_eq!(listener.finished.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.notifier().delivered(), delivered_before + 1);
        assert!(!h.session.is_active(Activity::Watcher));
    }

    /// Blocks until cancelled, like a login nobody completes.
    struct StuckAuthorizer;

    #[async_trait]
    impl Authorizer for StuckAuthorizer {
        async fn authorize(&self, cancel: &CancellationToken) -> Result<SessionSnapshot> {
            cancel.cancelled().await;
            Err(AuthError::FlowCancelled)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_a_pending_login() {
        let h = Harness::new(vec![]);
        let watcher = TokenWatcher::new(
            h.session.clone(),
            h.endpoint.clone(),
            Arc::new(StuckAuthorizer),
            h.clock.clone(),
        );

        let handle = watcher.start(CancellationToken::new()).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!handle.is_finished());

        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("watcher should stop while login is pending");
        assert!(!h.session.is_active(Activity::Watcher));
    }
}

//! A single persistent connection and its lifecycle state.
//!
//! ```text
//!             open ok                 borrow count -> 0
//! Connecting ---------> Connected <-------------------> Idle
//!     |                  |   ^         borrowed again     |
//!     | open failed      |   | reopen ok                  | idle sweep
//!     v        dead      v   |                            v
//!   Closed <------- Reconnecting <---------------------- (dead)
//!           reopen exhausted
//! ```
//!
//! `Closed` is terminal. The registry drops closed handles and creates a fresh
//! one on the next request for the same key.

use crate::config::{PersistentConnectionConfig, RetryConfig};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionKey, ConnectionParams};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, TryLockError, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Connecting,
    Connected,
    Idle,
    Reconnecting,
    Closed,
}

impl HandleState {
    /// States in which the session may be handed to a borrower.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Connected | Self::Idle)
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Idle => "idle",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a handle, for logging and the CLI's JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct HandleSnapshot {
    pub id: String,
    pub key: String,
    pub state: HandleState,
    pub borrow_count: usize,
    pub reconnects: u64,
    pub idle_ms: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
}

/// One live session plus the bookkeeping the registry needs to manage it.
///
/// The session sits behind an async mutex so that a health check can skip a
/// handle that is busy running an operation (`try_lock`) instead of queueing
/// behind it.
pub struct ConnectionHandle<S> {
    id: String,
    key: ConnectionKey,
    params: ConnectionParams,
    persistent: PersistentConnectionConfig,
    connection_retry: RetryConfig,
    session: Mutex<Option<S>>,
    state: watch::Sender<HandleState>,
    borrow_count: AtomicUsize,
    last_used: std::sync::RwLock<Instant>,
    created_at: DateTime<Utc>,
    reconnects: AtomicU64,
    close_reason: std::sync::Mutex<Option<String>>,
    /// Attempts and cause of the reopen that closed the handle, if that is how it closed.
    reopen_failure: std::sync::Mutex<Option<(u32, String)>>,
}

impl<S> ConnectionHandle<S> {
    /// New handle in `Connecting` with no session yet.
    pub(crate) fn new(
        params: ConnectionParams,
        persistent: PersistentConnectionConfig,
        connection_retry: RetryConfig,
    ) -> Self {
        let (state, _) = watch::channel(HandleState::Connecting);
        Self {
            id: format!("conn_{}", uuid::Uuid::new_v4().simple()),
            key: params.key(),
            params,
            persistent,
            connection_retry,
            session: Mutex::new(None),
            state,
            borrow_count: AtomicUsize::new(0),
            last_used: std::sync::RwLock::new(Instant::now()),
            created_at: Utc::now(),
            reconnects: AtomicU64::new(0),
            close_reason: std::sync::Mutex::new(None),
            reopen_failure: std::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    pub fn persistent(&self) -> &PersistentConnectionConfig {
        &self.persistent
    }

    pub fn connection_retry(&self) -> &RetryConfig {
        &self.connection_retry
    }

    pub fn state(&self) -> HandleState {
        *self.state.borrow()
    }

    pub fn borrow_count(&self) -> usize {
        self.borrow_count.load(Ordering::Acquire)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn last_used(&self) -> Instant {
        *self
            .last_used
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Stamp the last-used time.
    pub(crate) fn touch(&self) {
        *self
            .last_used
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Instant::now();
    }

    /// How long the handle has gone unused as of `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used())
    }

    /// True when nobody holds the handle and it has been unused past its idle timeout.
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.borrow_count() == 0
            && self.state().is_usable()
            && self.idle_for(now) >= self.persistent.idle_timeout
    }

    pub(crate) fn increment_active(&self) -> usize {
        self.borrow_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the borrow count, saturating at zero. Returns the new count.
    pub(crate) fn decrement_active(&self) -> usize {
        let result = self
            .borrow_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match result {
            Ok(previous) => previous - 1,
            Err(_) => {
                warn!(id = %self.id, key = %self.key, "Borrow count underflow prevented");
                0
            }
        }
    }

    /// Atomically move from one of `from` to `to`. Returns whether the transition happened.
    pub(crate) fn transition(&self, from: &[HandleState], to: HandleState) -> bool {
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Record a borrow: bump the count, wake an idle handle, stamp the time.
    pub(crate) fn mark_borrowed(&self) {
        self.transition(&[HandleState::Idle], HandleState::Connected);
        self.touch();
    }

    /// `Connected -> Idle`, but only while nobody holds the handle.
    ///
    /// The count is read under the state lock, so a borrow that lands between
    /// the decrement and the transition keeps the handle `Connected`.
    fn settle_idle(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == HandleState::Connected && self.borrow_count() == 0 {
                *state = HandleState::Idle;
                true
            } else {
                false
            }
        })
    }

    /// Record a release. A handle nobody holds any more goes idle.
    ///
    /// Returns the remaining borrow count.
    pub(crate) fn mark_released(&self) -> usize {
        self.touch();
        let remaining = self.decrement_active();
        if remaining == 0 {
            self.settle_idle();
        }
        debug!(id = %self.id, key = %self.key, borrow_count = remaining, "Released connection");
        remaining
    }

    /// Claim the right to reconnect. Only one caller wins.
    pub(crate) fn begin_reconnect(&self) -> bool {
        self.transition(
            &[HandleState::Connected, HandleState::Idle],
            HandleState::Reconnecting,
        )
    }

    /// Reopen succeeded: back to `Connected`, settling to `Idle` if unborrowed.
    pub(crate) fn finish_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.touch();
        self.transition(&[HandleState::Reconnecting], HandleState::Connected);
        self.settle_idle();
    }

    /// Reopen gave up: close the handle, keeping the attempt count for waiters.
    pub(crate) fn mark_reconnect_failed(&self, error: &DbError) -> bool {
        if let DbError::Connection { attempts, source, .. } = error {
            if self.state() != HandleState::Closed {
                self.reopen_failure
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .get_or_insert((*attempts, source.to_string()));
            }
        }
        self.mark_closed(format!("reconnect failed: {error}"))
    }

    /// Move to the terminal state, keeping the first reason given.
    pub(crate) fn mark_closed(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let changed = self.state.send_if_modified(|state| {
            if *state == HandleState::Closed {
                false
            } else {
                *state = HandleState::Closed;
                true
            }
        });
        if changed {
            let mut slot = self
                .close_reason
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            slot.get_or_insert(reason);
        }
        changed
    }

    /// Wait while the handle is `Connecting` or `Reconnecting`, up to `timeout`.
    ///
    /// Errors with `Timeout` if the wait runs out, and with `ConnectionClosed`
    /// if the handle ends up closed.
    pub(crate) async fn wait_ready(&self, timeout: Duration) -> DbResult<()> {
        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| !matches!(s, HandleState::Connecting | HandleState::Reconnecting)),
        )
        .await;

        let state = match waited {
            Ok(Ok(state)) => *state,
            // The sender lives in `self`, so the channel cannot close while we wait.
            Ok(Err(_)) => HandleState::Closed,
            Err(_) => {
                return Err(DbError::timeout(
                    format!("borrow {}", self.key),
                    timeout.as_millis() as u64,
                ));
            }
        };

        if state == HandleState::Closed {
            return Err(self.closed_error());
        }
        Ok(())
    }

    /// The error a borrower of a closed handle sees.
    ///
    /// A handle closed by a failed reopen reports that reopen's connection error.
    pub(crate) fn closed_error(&self) -> DbError {
        let reopen_failure = self
            .reopen_failure
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some((attempts, cause)) = reopen_failure {
            return DbError::connection(self.key.to_string(), attempts, cause);
        }
        DbError::connection_closed(
            self.key.to_string(),
            self.close_reason().unwrap_or_else(|| "closed".to_string()),
        )
    }

    pub(crate) async fn lock_session(&self) -> MutexGuard<'_, Option<S>> {
        self.session.lock().await
    }

    pub(crate) fn try_lock_session(&self) -> Result<MutexGuard<'_, Option<S>>, TryLockError> {
        self.session.try_lock()
    }

    pub fn snapshot(&self) -> HandleSnapshot {
        HandleSnapshot {
            id: self.id.clone(),
            key: self.key.to_string(),
            state: self.state(),
            borrow_count: self.borrow_count(),
            reconnects: self.reconnects(),
            idle_ms: self.idle_for(Instant::now()).as_millis() as u64,
            created_at: self.created_at,
            close_reason: self.close_reason(),
        }
    }
}

impl<S> fmt::Debug for ConnectionHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("borrow_count", &self.borrow_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BackendKind;

    fn handle() -> ConnectionHandle<()> {
        ConnectionHandle::new(
            ConnectionParams::new(BackendKind::PostgreSQL).with_database("orders"),
            PersistentConnectionConfig::default().with_idle_timeout(Duration::from_secs(10)),
            RetryConfig::connection(),
        )
    }

    #[test]
    fn test_new_handle_is_connecting() {
        let h = handle();
        assert_eq!(h.state(), HandleState::Connecting);
        assert!(h.id().starts_with("conn_"));
        assert_eq!(h.borrow_count(), 0);
    }

    #[test]
    fn test_decrement_active_saturates() {
        let h = handle();
        assert_eq!(h.decrement_active(), 0);
        assert_eq!(h.increment_active(), 1);
        assert_eq!(h.increment_active(), 2);
        assert_eq!(h.decrement_active(), 1);
        assert_eq!(h.decrement_active(), 0);
        assert_eq!(h.decrement_active(), 0);
    }

    #[test]
    fn test_release_to_zero_goes_idle() {
        let h = handle();
        assert!(h.transition(&[HandleState::Connecting], HandleState::Connected));
        h.increment_active();
        h.increment_active();
        h.mark_released();
        assert_eq!(h.state(), HandleState::Connected);
        h.mark_released();
        assert_eq!(h.state(), HandleState::Idle);

        h.increment_active();
        h.mark_borrowed();
        assert_eq!(h.state(), HandleState::Connected);
    }

    #[test]
    fn test_only_one_reconnect_wins() {
        let h = handle();
        h.transition(&[HandleState::Connecting], HandleState::Idle);
        assert!(h.begin_reconnect());
        assert!(!h.begin_reconnect());
        h.finish_reconnect();
        assert_eq!(h.state(), HandleState::Idle);
        assert_eq!(h.reconnects(), 1);
    }

    #[test]
    fn test_closed_is_terminal_and_keeps_first_reason() {
        let h = handle();
        assert!(h.mark_closed("idle timeout"));
        assert!(!h.mark_closed("registry closed"));
        assert!(!h.begin_reconnect());
        assert!(!h.transition(&[HandleState::Idle], HandleState::Connected));
        assert_eq!(h.close_reason().as_deref(), Some("idle timeout"));
        assert_eq!(h.snapshot().state, HandleState::Closed);
    }

    #[test]
    fn test_borrower_never_sees_idle_while_holding() {
        let h = handle();
        h.transition(&[HandleState::Connecting], HandleState::Idle);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..2_000 {
                        h.increment_active();
                        h.mark_borrowed();
                        assert_eq!(h.state(), HandleState::Connected);
                        h.mark_released();
                    }
                });
            }
        });

        assert_eq!(h.borrow_count(), 0);
        assert_eq!(h.state(), HandleState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_sees_failed_reopen_as_connection_error() {
        let h = handle();
        h.transition(&[HandleState::Connecting], HandleState::Connected);
        assert!(h.begin_reconnect());

        let waiter = h.wait_ready(Duration::from_secs(5));
        let fail = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.mark_reconnect_failed(&DbError::connection("orders", 3, "connection refused"));
        };
        let (result, ()) = tokio::join!(waiter, fail);

        let err = result.unwrap_err();
        assert!(matches!(err, DbError::Connection { attempts: 3, .. }), "{err:?}");
        assert_eq!(err.attempts(), Some(3));
        assert!(h.close_reason().unwrap().starts_with("reconnect failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_times_out_while_reconnecting() {
        let h = handle();
        h.transition(&[HandleState::Connecting], HandleState::Connected);
        h.begin_reconnect();
        let err = h.wait_ready(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, DbError::Timeout { elapsed_ms: 5_000, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_tracks_idle_timeout() {
        let h = handle();
        h.transition(&[HandleState::Connecting], HandleState::Idle);
        assert!(!h.is_expired(Instant::now()));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(h.is_expired(Instant::now()));
        h.increment_active();
        assert!(!h.is_expired(Instant::now()));
    }
}

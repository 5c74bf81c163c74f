//! Persistent connection registry keyed by [`ConnectionKey`].
//!
//! One live session per key, created lazily on first borrow, evicted after
//! sitting idle, health-checked in the background and reconnected when it dies.
//!
//! # Design Decisions
//!
//! - **`OnceCell` per key**: single-flight creation, so N concurrent borrows of a
//!   new key open exactly one session while other keys proceed independently
//! - **`AtomicUsize` borrow count**: incremented under the map's read lock, so
//!   eviction (which re-checks under the write lock) never removes a borrowed handle
//! - **`watch` channel for handle state**: borrowers of a reconnecting handle
//!   wait for the state to change instead of polling
//! - **`Weak` in the background task**: the maintenance loop never keeps the
//!   registry alive on its own
//!
//! # Concurrency Safety
//!
//! ## No Deadlocks
//! - The map lock is never held across an open, close, ping or operation
//! - Health checks use `try_lock` on the session and skip busy handles
//!
//! ## TOCTOU Safety
//! - Sweeps collect candidates under the read lock and re-check under the write lock
//! - A borrow that races with eviction sees its cell gone and starts over
//! - A creation that finishes after `close_all` closes its own session and
//!   reports `RegistryClosed`

use crate::config::{PersistentConnectionConfig, RegistryConfig, RetryConfig};
use crate::db::adapter::BackendAdapter;
use crate::db::global::{self, RegistryShutdown};
use crate::db::handle::{ConnectionHandle, HandleSnapshot, HandleState};
use crate::db::retry::{ErrorClass, OperationKind, RetryExecutor};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionKey, ConnectionParams};
use futures_util::future::{BoxFuture, join_all};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{MappedMutexGuard, MutexGuard, OnceCell, RwLock as TokioRwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

type Handle<A> = Arc<ConnectionHandle<<A as BackendAdapter>::Session>>;
type Cell<A> = Arc<OnceCell<Handle<A>>>;

/// Exclusive access to a leased session for the duration of one operation.
pub type SessionGuard<'a, S> = MappedMutexGuard<'a, S>;

/// Outcome counts from one pass of [`PersistentConnectionRegistry::health_check_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthCheckSummary {
    pub checked: usize,
    pub healthy: usize,
    /// Busy running an operation; left alone this round.
    pub skipped: usize,
    pub reconnected: usize,
    pub closed: usize,
}

pub(crate) struct RegistryInner<A: BackendAdapter> {
    adapter: A,
    config: RegistryConfig,
    handles: TokioRwLock<HashMap<ConnectionKey, Cell<A>>>,
    closed: AtomicBool,
    maintenance: std::sync::Mutex<Option<JoinHandle<()>>>,
    executor: RetryExecutor,
}

/// Registry of persistent connections for one backend adapter.
///
/// Cheap to clone; clones share the same map.
pub struct PersistentConnectionRegistry<A: BackendAdapter> {
    inner: Arc<RegistryInner<A>>,
}

impl<A: BackendAdapter> Clone for PersistentConnectionRegistry<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: BackendAdapter> PersistentConnectionRegistry<A> {
    /// Create a registry and start its maintenance task.
    ///
    /// The task only starts when called inside a tokio runtime; without one the
    /// registry still works but idle sweeps and health checks must be driven by hand.
    pub fn new(adapter: A, config: RegistryConfig) -> DbResult<Self> {
        Self::with_executor(adapter, config, RetryExecutor::new())
    }

    /// Like [`new`](Self::new), reporting retry attempts through `executor`.
    pub fn with_executor(adapter: A, config: RegistryConfig, executor: RetryExecutor) -> DbResult<Self> {
        config.validate()?;
        let interval = config.persistent.health_check_interval;

        let inner = Arc::new(RegistryInner {
            adapter,
            config,
            handles: TokioRwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            maintenance: std::sync::Mutex::new(None),
            executor,
        });

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let task = runtime.spawn(maintenance_task(Arc::downgrade(&inner), interval));
                *inner
                    .maintenance
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(task);
            }
            Err(_) => {
                warn!(
                    backend = %inner.adapter.kind(),
                    "No tokio runtime; registry maintenance must be driven manually"
                );
            }
        }

        let weak: Weak<dyn RegistryShutdown> = Arc::downgrade(&inner) as Weak<dyn RegistryShutdown>;
        global::register(weak);

        info!(
            backend = %inner.adapter.kind(),
            idle_timeout_secs = inner.config.persistent.idle_timeout.as_secs(),
            health_check_interval_secs = interval.as_secs(),
            "Created persistent connection registry"
        );

        Ok(Self { inner })
    }

    pub fn adapter(&self) -> &A {
        &self.inner.adapter
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Borrow the connection for `params`, creating it if needed, using the registry's defaults.
    pub async fn get_or_create(&self, params: &ConnectionParams) -> DbResult<HandleLease<A>> {
        self.get_or_create_with(
            params,
            self.inner.config.persistent.clone(),
            self.inner.config.connection_retry.clone(),
        )
        .await
    }

    /// Borrow the connection for `params`; a newly created handle uses the given configs.
    ///
    /// An existing handle keeps the configs it was created with.
    pub async fn get_or_create_with(
        &self,
        params: &ConnectionParams,
        persistent: PersistentConnectionConfig,
        connection_retry: RetryConfig,
    ) -> DbResult<HandleLease<A>> {
        persistent.validate()?;
        connection_retry.validate()?;
        let key = params.key();

        loop {
            self.inner.ensure_open(&key)?;

            let cell = self.inner.cell_for(&key).await;
            let handle = match cell
                .get_or_try_init(|| self.inner.open_handle(params, &persistent, &connection_retry))
                .await
            {
                Ok(handle) => handle.clone(),
                Err(e) => {
                    self.inner.forget_empty(&key, &cell).await;
                    return Err(e);
                }
            };

            // Count the borrow under the read lock so a concurrent sweep sees it.
            let current = {
                let handles = self.inner.handles.read().await;
                let current = handles.get(&key).is_some_and(|c| Arc::ptr_eq(c, &cell));
                if current && !self.is_closed() && handle.state() != HandleState::Closed {
                    handle.increment_active();
                    true
                } else {
                    false
                }
            };

            if !current {
                if self.is_closed() {
                    self.inner.retire(&handle, "registry closed").await;
                    return Err(DbError::registry_closed(key.to_string()));
                }
                debug!(key = %key, "Handle evicted while borrowing, retrying");
                self.inner.forget(&key, &handle).await;
                // A handle whose cell was dropped mid-creation is closed here; evicted ones already are.
                self.inner.retire(&handle, "superseded").await;
                continue;
            }

            let lease = HandleLease {
                registry: self.inner.clone(),
                handle,
                released: false,
            };
            // Dropping the lease on error releases the borrow.
            lease
                .handle
                .wait_ready(lease.handle.persistent().borrow_timeout)
                .await?;
            lease.handle.mark_borrowed();
            return Ok(lease);
        }
    }

    /// Give a borrow back. Equivalent to dropping the lease.
    pub fn release(&self, lease: HandleLease<A>) {
        lease.release();
    }

    /// Ping every usable handle that is not running an operation.
    ///
    /// Dead handles are reconnected when their config allows it, otherwise
    /// closed and removed. Failures are logged, never returned.
    pub async fn health_check_all(&self) -> HealthCheckSummary {
        self.inner.health_check_all().await
    }

    /// Close and remove every unborrowed handle idle past its idle timeout.
    pub async fn sweep_idle(&self) -> usize {
        self.inner.sweep_idle().await
    }

    /// Close every handle, clear the map and stop the maintenance task.
    ///
    /// Outstanding leases get `RegistryClosed` on their next use. The registry
    /// cannot be reopened.
    pub async fn close_all(&self) {
        self.inner.close_all().await;
    }

    /// Number of keys in the map.
    pub async fn len(&self) -> usize {
        self.inner.handles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshots of every created handle, ordered by key.
    pub async fn snapshot(&self) -> Vec<HandleSnapshot> {
        let mut snapshots: Vec<HandleSnapshot> = self
            .inner
            .handles
            .read()
            .await
            .values()
            .filter_map(|cell| cell.get().map(|h| h.snapshot()))
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }
}

impl<A: BackendAdapter> fmt::Debug for PersistentConnectionRegistry<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentConnectionRegistry")
            .field("backend", &self.inner.adapter.kind())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<A: BackendAdapter> RegistryInner<A> {
    fn ensure_open(&self, key: &ConnectionKey) -> DbResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(DbError::registry_closed(key.to_string()))
        } else {
            Ok(())
        }
    }

    /// The cell for `key`, replacing one whose handle has closed.
    async fn cell_for(&self, key: &ConnectionKey) -> Cell<A> {
        fn live<A: BackendAdapter>(cell: &Cell<A>) -> bool {
            cell.get().is_none_or(|h| h.state() != HandleState::Closed)
        }

        {
            let handles = self.handles.read().await;
            if let Some(cell) = handles.get(key).filter(|c| live::<A>(c)) {
                return cell.clone();
            }
        }

        let mut handles = self.handles.write().await;
        match handles.get(key) {
            Some(cell) if live::<A>(cell) => cell.clone(),
            _ => {
                let cell: Cell<A> = Arc::new(OnceCell::new());
                handles.insert(key.clone(), cell.clone());
                cell
            }
        }
    }

    /// Open a session with connection-level retry and wrap it in a handle.
    async fn open_handle(
        &self,
        params: &ConnectionParams,
        persistent: &PersistentConnectionConfig,
        connection_retry: &RetryConfig,
    ) -> DbResult<Handle<A>> {
        let handle = ConnectionHandle::new(params.clone(), persistent.clone(), connection_retry.clone());

        let session = match self.open_session(params, connection_retry).await {
            Ok(session) => session,
            Err(e) => {
                handle.mark_closed(e.to_string());
                return Err(e);
            }
        };

        if self.closed.load(Ordering::Acquire) {
            handle.mark_closed("registry closed");
            self.adapter.close(session).await;
            return Err(DbError::registry_closed(handle.key().to_string()));
        }

        *handle.lock_session().await = Some(session);
        handle.transition(&[HandleState::Connecting], HandleState::Connected);
        info!(id = %handle.id(), key = %handle.key(), "Opened persistent connection");
        Ok(Arc::new(handle))
    }

    async fn open_session(&self, params: &ConnectionParams, retry: &RetryConfig) -> DbResult<A::Session> {
        let key = params.key();
        self.executor
            .execute(
                "connect",
                retry,
                |e| self.adapter.classify_error(e),
                || self.adapter.open(params),
            )
            .await
            .map_err(|failure| DbError::connection(key.to_string(), failure.attempts, failure.error))
    }

    /// Replace the dead session in `slot` with a fresh one.
    ///
    /// Caller holds the session lock. On failure the handle is closed and removed.
    async fn reconnect(&self, handle: &Handle<A>, slot: &mut Option<A::Session>) -> DbResult<()> {
        if !handle.begin_reconnect() {
            return Err(handle.closed_error());
        }
        warn!(id = %handle.id(), key = %handle.key(), "Connection lost, reconnecting");

        if let Some(old) = slot.take() {
            self.adapter.close(old).await;
        }

        match self.open_session(handle.params(), handle.connection_retry()).await {
            Ok(session) => {
                if self.closed.load(Ordering::Acquire) {
                    self.adapter.close(session).await;
                    handle.mark_closed("registry closed");
                    return Err(DbError::registry_closed(handle.key().to_string()));
                }
                *slot = Some(session);
                handle.finish_reconnect();
                info!(
                    id = %handle.id(),
                    key = %handle.key(),
                    reconnects = handle.reconnects(),
                    "Reconnected persistent connection"
                );
                Ok(())
            }
            Err(e) => {
                error!(id = %handle.id(), key = %handle.key(), error = %e, "Reconnect failed, closing handle");
                handle.mark_reconnect_failed(&e);
                self.forget(handle.key(), handle).await;
                Err(e)
            }
        }
    }

    /// Remove `handle`'s cell from the map if it is still the current one.
    async fn forget(&self, key: &ConnectionKey, handle: &Handle<A>) {
        let mut handles = self.handles.write().await;
        let is_current = handles
            .get(key)
            .and_then(|cell| cell.get())
            .is_some_and(|h| Arc::ptr_eq(h, handle));
        if is_current {
            handles.remove(key);
        }
    }

    /// Drop a cell whose creation failed, unless someone has since filled or replaced it.
    async fn forget_empty(&self, key: &ConnectionKey, cell: &Cell<A>) {
        let mut handles = self.handles.write().await;
        let stale = handles
            .get(key)
            .is_some_and(|c| Arc::ptr_eq(c, cell) && c.get().is_none());
        if stale {
            handles.remove(key);
            debug!(key = %key, "Removed key after failed creation");
        }
    }

    /// Close a session left behind by `retire` once its last lease lets go.
    fn close_leftover(self: &Arc<Self>, handle: &Handle<A>) {
        let Ok(mut slot) = handle.try_lock_session() else {
            return;
        };
        let Some(session) = slot.take() else {
            return;
        };
        drop(slot);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let registry = self.clone();
                let id = handle.id().to_string();
                runtime.spawn(async move {
                    registry.adapter.close(session).await;
                    debug!(id = %id, "Closed session released after shutdown");
                });
            }
            Err(_) => {
                warn!(id = %handle.id(), key = %handle.key(), "Lease released outside a runtime; closing by drop");
                drop(session);
            }
        }
    }

    /// Close a handle that has already left the map.
    async fn retire(&self, handle: &Handle<A>, reason: &str) {
        if !handle.mark_closed(reason) {
            return;
        }
        // A lease may be mid-operation; its release then closes the session.
        match tokio::time::timeout(handle.persistent().borrow_timeout, handle.lock_session()).await {
            Ok(mut slot) => {
                if let Some(session) = slot.take() {
                    drop(slot);
                    self.adapter.close(session).await;
                }
            }
            Err(_) => {
                warn!(id = %handle.id(), key = %handle.key(), "Session busy at close, the last lease will close it");
            }
        }
        debug!(id = %handle.id(), key = %handle.key(), reason = reason, "Closed handle");
    }

    async fn health_check_all(&self) -> HealthCheckSummary {
        let mut summary = HealthCheckSummary::default();
        if self.closed.load(Ordering::Acquire) {
            return summary;
        }

        let handles: Vec<Handle<A>> = self
            .handles
            .read()
            .await
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect();

        for handle in handles {
            if !handle.state().is_usable() {
                continue;
            }
            summary.checked += 1;

            let Ok(mut slot) = handle.try_lock_session() else {
                summary.skipped += 1;
                continue;
            };
            let alive = match slot.as_mut() {
                Some(session) => self.adapter.ping(session).await,
                None => false,
            };
            if alive {
                summary.healthy += 1;
                continue;
            }

            warn!(id = %handle.id(), key = %handle.key(), "Health check failed");
            if handle.persistent().auto_reconnect {
                match self.reconnect(&handle, &mut slot).await {
                    Ok(()) => summary.reconnected += 1,
                    Err(_) => summary.closed += 1,
                }
            } else {
                let session = slot.take();
                handle.mark_closed("health check failed");
                drop(slot);
                self.forget(handle.key(), &handle).await;
                if let Some(session) = session {
                    self.adapter.close(session).await;
                }
                info!(id = %handle.id(), key = %handle.key(), "Closed dead connection");
                summary.closed += 1;
            }
        }

        debug!(
            checked = summary.checked,
            healthy = summary.healthy,
            skipped = summary.skipped,
            reconnected = summary.reconnected,
            closed = summary.closed,
            "Health check pass complete"
        );
        summary
    }

    async fn sweep_idle(&self) -> usize {
        let now = Instant::now();

        let candidates: Vec<ConnectionKey> = self
            .handles
            .read()
            .await
            .iter()
            .filter(|(_, cell)| cell.get().is_some_and(|h| h.is_expired(now)))
            .map(|(key, _)| key.clone())
            .collect();

        let mut evicted = Vec::new();
        for key in candidates {
            // Brief write lock per key, re-checking in case it was borrowed meanwhile.
            let mut handles = self.handles.write().await;
            let still_expired = handles
                .get(&key)
                .and_then(|cell| cell.get())
                .is_some_and(|h| h.is_expired(now));
            if still_expired {
                if let Some(handle) = handles.remove(&key).and_then(|cell| cell.get().cloned()) {
                    evicted.push(handle);
                }
            }
        }

        let count = evicted.len();
        for handle in evicted {
            info!(
                id = %handle.id(),
                key = %handle.key(),
                idle_secs = handle.idle_for(now).as_secs(),
                "Evicting idle connection"
            );
            self.retire(&handle, "idle timeout").await;
        }
        count
    }

    async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);

        if let Some(task) = self
            .maintenance
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        let cells: Vec<Cell<A>> = {
            let mut handles = self.handles.write().await;
            handles.drain().map(|(_, cell)| cell).collect()
        };

        // Busy sessions each wait up to their borrow timeout, so retire them together.
        let handles: Vec<Handle<A>> = cells.iter().filter_map(|cell| cell.get().cloned()).collect();
        let closed = handles.len();
        join_all(handles.iter().map(|handle| self.retire(handle, "registry closed"))).await;

        info!(backend = %self.adapter.kind(), closed = closed, "Closed all persistent connections");
    }
}

impl<A: BackendAdapter> RegistryShutdown for RegistryInner<A> {
    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.close_all())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Background loop: idle sweep then health check, every `interval`.
async fn maintenance_task<A: BackendAdapter>(registry: Weak<RegistryInner<A>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(inner) = registry.upgrade() else {
            debug!("Registry dropped, stopping maintenance task");
            break;
        };
        if inner.closed.load(Ordering::Acquire) {
            break;
        }

        let evicted = inner.sweep_idle().await;
        if evicted > 0 {
            debug!(evicted = evicted, "Idle sweep complete");
        }
        inner.health_check_all().await;
    }
}

/// Attempt-level failure inside [`HandleLease::run_with`].
enum AttemptError<E> {
    Lease(DbError),
    Driver(E),
}

impl<E: fmt::Display> fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lease(e) => write!(f, "{e}"),
            Self::Driver(e) => write!(f, "{e}"),
        }
    }
}

/// A borrowed persistent connection.
///
/// Dropping the lease releases the borrow on every exit path.
pub struct HandleLease<A: BackendAdapter> {
    registry: Arc<RegistryInner<A>>,
    handle: Handle<A>,
    released: bool,
}

impl<A: BackendAdapter> HandleLease<A> {
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn key(&self) -> &ConnectionKey {
        self.handle.key()
    }

    pub fn state(&self) -> HandleState {
        self.handle.state()
    }

    pub fn handle(&self) -> &ConnectionHandle<A::Session> {
        &self.handle
    }

    fn ensure_usable(&self) -> DbResult<()> {
        self.registry.ensure_open(self.handle.key())?;
        if self.handle.state() == HandleState::Closed {
            return Err(self.handle.closed_error());
        }
        Ok(())
    }

    /// Lock the session slot, waiting out any reconnect.
    async fn lock_slot(&self) -> DbResult<MutexGuard<'_, Option<A::Session>>> {
        self.ensure_usable()?;
        let borrow_timeout = self.handle.persistent().borrow_timeout;
        self.handle.wait_ready(borrow_timeout).await?;

        let slot = tokio::time::timeout(borrow_timeout, self.handle.lock_session())
            .await
            .map_err(|_| {
                DbError::timeout(format!("lock {}", self.handle.key()), borrow_timeout.as_millis() as u64)
            })?;
        self.ensure_usable()?;
        Ok(slot)
    }

    /// Exclusive access to the session for one operation.
    pub async fn session(&self) -> DbResult<SessionGuard<'_, A::Session>> {
        let slot = self.lock_slot().await?;
        MutexGuard::try_map(slot, |slot| slot.as_mut())
            .map_err(|_| DbError::connection_closed(self.handle.key().to_string(), "session unavailable"))
    }

    /// Run `f` against the session with the registry's operation-level retry.
    pub async fn run<T, F>(&self, operation: &str, kind: OperationKind, f: F) -> DbResult<T>
    where
        F: for<'s> Fn(&'s mut A::Session) -> BoxFuture<'s, Result<T, A::Error>>,
    {
        let config = self.registry.config.operation_retry.clone();
        self.run_with(operation, &config, kind, f).await
    }

    /// Run `f` with an explicit retry config.
    ///
    /// `OperationKind::Write` runs once regardless of `config`. A retryable
    /// failure on a session that then fails a ping triggers a reconnect before
    /// the next attempt, when the handle allows auto-reconnect.
    pub async fn run_with<T, F>(
        &self,
        operation: &str,
        config: &RetryConfig,
        kind: OperationKind,
        f: F,
    ) -> DbResult<T>
    where
        F: for<'s> Fn(&'s mut A::Session) -> BoxFuture<'s, Result<T, A::Error>>,
    {
        let config = if kind.is_retry_safe() {
            config.clone()
        } else {
            config.clone().with_enabled(false)
        };
        let adapter = &self.registry.adapter;
        let f = &f;

        let classify = |e: &AttemptError<A::Error>| match e {
            AttemptError::Driver(e) => adapter.classify_error(e),
            AttemptError::Lease(DbError::Timeout { .. }) => ErrorClass::Retryable,
            AttemptError::Lease(_) => ErrorClass::Fatal,
        };

        let result = self
            .registry
            .executor
            .execute(operation, &config, classify, || async move {
                let mut slot = self.lock_slot().await.map_err(AttemptError::Lease)?;
                let Some(session) = slot.as_mut() else {
                    return Err(AttemptError::Lease(self.handle.closed_error()));
                };

                let error = match f(session).await {
                    Ok(value) => return Ok(value),
                    Err(e) => e,
                };

                if adapter.classify_error(&error) == ErrorClass::Retryable
                    && self.handle.persistent().auto_reconnect
                {
                    let alive = match slot.as_mut() {
                        Some(session) => adapter.ping(session).await,
                        None => false,
                    };
                    if !alive {
                        self.registry
                            .reconnect(&self.handle, &mut slot)
                            .await
                            .map_err(AttemptError::Lease)?;
                    }
                }
                Err(AttemptError::Driver(error))
            })
            .await;

        result.map_err(|failure| match failure.error {
            AttemptError::Lease(e) => e,
            AttemptError::Driver(e) => {
                DbError::operation(operation, self.handle.key().to_string(), failure.attempts, e)
            }
        })
    }

    /// Give the borrow back now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            let remaining = self.handle.mark_released();
            if remaining == 0 && self.handle.state() == HandleState::Closed {
                self.registry.close_leftover(&self.handle);
            }
        }
    }
}

impl<A: BackendAdapter> Drop for HandleLease<A> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<A: BackendAdapter> fmt::Debug for HandleLease<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleLease")
            .field("id", &self.handle.id())
            .field("key", self.handle.key())
            .field("released", &self.released)
            .finish()
    }
}

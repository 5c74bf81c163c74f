//! Scripted in-memory backend shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use db_keepalive::config::{PersistentConnectionConfig, RegistryConfig, RetryConfig};
use db_keepalive::db::{AttemptEvent, BackendAdapter, ErrorClass, RetryObserver};
use db_keepalive::models::{BackendKind, ConnectionParams};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockError {
    pub retryable: bool,
    pub message: String,
}

impl MockError {
    pub fn transient(message: &str) -> Self {
        Self {
            retryable: true,
            message: message.to_string(),
        }
    }

    pub fn fatal(message: &str) -> Self {
        Self {
            retryable: false,
            message: message.to_string(),
        }
    }
}

impl fmt::Display for MockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for MockError {}

#[derive(Default)]
pub struct MockState {
    opens: AtomicU32,
    closes: AtomicU32,
    op_calls: AtomicU32,
    open_failures: Mutex<VecDeque<MockError>>,
    op_failures: Mutex<VecDeque<MockError>>,
    sessions: Mutex<Vec<Arc<AtomicBool>>>,
    open_delay: Mutex<Duration>,
    open_gate: Mutex<Option<Arc<Semaphore>>>,
}

/// A live mock session. Its id is the open call that produced it.
pub struct MockSession {
    pub id: u32,
    alive: Arc<AtomicBool>,
    state: Arc<MockState>,
}

impl fmt::Debug for MockSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSession")
            .field("id", &self.id)
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .finish()
    }
}

impl MockSession {
    /// A query that fails on a dead session or when a failure is scripted.
    pub async fn query(&mut self) -> Result<u32, MockError> {
        self.state.op_calls.fetch_add(1, Ordering::SeqCst);
        if !self.alive.load(Ordering::SeqCst) {
            return Err(MockError::transient("server closed the connection"));
        }
        if let Some(error) = self.state.op_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(self.id)
    }
}

#[derive(Clone, Default)]
pub struct MockAdapter {
    state: Arc<MockState>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opens(&self) -> u32 {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn op_calls(&self) -> u32 {
        self.state.op_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_opens(&self, count: usize, error: MockError) {
        let mut failures = self.state.open_failures.lock().unwrap();
        failures.extend(std::iter::repeat_n(error, count));
    }

    pub fn fail_next_ops(&self, count: usize, error: MockError) {
        let mut failures = self.state.op_failures.lock().unwrap();
        failures.extend(std::iter::repeat_n(error, count));
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.state.open_delay.lock().unwrap() = delay;
    }

    /// Make opens wait for a permit on the returned semaphore.
    pub fn gate_opens(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.state.open_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Mark every session opened so far as dead.
    pub fn kill_sessions(&self) {
        for alive in self.state.sessions.lock().unwrap().iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl BackendAdapter for MockAdapter {
    type Session = MockSession;
    type Error = MockError;

    fn kind(&self) -> BackendKind {
        BackendKind::PostgreSQL
    }

    async fn open(&self, _params: &ConnectionParams) -> Result<MockSession, MockError> {
        let id = self.state.opens.fetch_add(1, Ordering::SeqCst) + 1;

        let gate = self.state.open_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.map_err(|_| MockError::fatal("gate closed"))?;
        }
        let delay = *self.state.open_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self.state.open_failures.lock().unwrap().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        let alive = Arc::new(AtomicBool::new(true));
        self.state.sessions.lock().unwrap().push(alive.clone());
        Ok(MockSession {
            id,
            alive,
            state: self.state.clone(),
        })
    }

    async fn close(&self, _session: MockSession) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }

    async fn probe(&self, session: &mut MockSession) -> Result<(), MockError> {
        if session.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MockError::transient("connection reset by peer"))
        }
    }

    fn classify_error(&self, error: &MockError) -> ErrorClass {
        if error.retryable {
            ErrorClass::Retryable
        } else {
            ErrorClass::Fatal
        }
    }
}

/// Records every failed attempt's delay.
#[derive(Default)]
pub struct DelayRecorder {
    pub delays: Mutex<Vec<Option<Duration>>>,
}

impl DelayRecorder {
    pub fn delays(&self) -> Vec<Option<Duration>> {
        self.delays.lock().unwrap().clone()
    }
}

impl RetryObserver for DelayRecorder {
    fn on_failure(&self, event: &AttemptEvent<'_>) {
        self.delays.lock().unwrap().push(event.next_delay);
    }
}

pub fn params(database: &str) -> ConnectionParams {
    ConnectionParams::new(BackendKind::PostgreSQL)
        .with_host("db.internal")
        .with_user("app")
        .with_password("secret")
        .with_database(database)
}

/// Registry config with millisecond retry delays and no background interference.
pub fn fast_config() -> RegistryConfig {
    let retry = RetryConfig::connection()
        .with_max_retries(2)
        .with_delays(Duration::from_millis(1), Duration::from_millis(5));
    RegistryConfig {
        persistent: PersistentConnectionConfig::default()
            .with_idle_timeout(Duration::from_secs(10))
            .with_health_check_interval(Duration::from_secs(3600))
            .with_borrow_timeout(Duration::from_secs(5)),
        connection_retry: retry.clone(),
        operation_retry: retry,
    }
}

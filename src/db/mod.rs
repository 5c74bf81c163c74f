//! Connection lifecycle and retry.
//!
//! This module provides:
//! - Backoff delay computation and the retry executor
//! - The backend adapter capability and its sqlx implementations
//! - Persistent connection handles and the registry that owns them
//! - One-shot scoped sessions
//! - A blocking facade for thread-based callers
//! - Process-wide shutdown of every registry

pub mod adapter;
pub mod backends;
pub mod backoff;
pub mod blocking;
pub mod global;
pub mod handle;
pub mod registry;
pub mod retry;
pub mod session;

pub use adapter::BackendAdapter;
pub use backends::{MySqlAdapter, PostgresAdapter, SqliteAdapter, classify_sqlx_error};
pub use backoff::{next_delay, next_delay_with};
pub use blocking::{BlockingLease, BlockingRegistry};
pub use global::{close_all_persistent_connections, default_registry, open_registry_count};
pub use handle::{ConnectionHandle, HandleSnapshot, HandleState};
pub use registry::{HandleLease, HealthCheckSummary, PersistentConnectionRegistry, SessionGuard};
pub use retry::{
    AttemptEvent, ErrorClass, OperationKind, RetryExecutor, RetryFailure, RetryObserver, RetryStop,
};
pub use session::{ScopedSession, connect_once, connect_once_with, with_session};

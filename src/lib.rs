//! db-keepalive library
//!
//! Connection lifecycle and retry for SQL databases (SQLite, PostgreSQL, MySQL):
//! exponential-backoff retry around connects and operations, and a registry of
//! persistent connections with idle eviction, health checks and reconnects.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, PersistentConnectionConfig, RegistryConfig, RetryConfig};
pub use db::{BackendAdapter, PersistentConnectionRegistry, RetryExecutor, close_all_persistent_connections};
pub use error::{DbError, DbResult};

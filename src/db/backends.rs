//! sqlx-backed adapters for SQLite, PostgreSQL and MySQL.
//!
//! Each adapter opens a single `sqlx` connection per handle (no pool); the
//! registry is what keeps it alive.

use crate::db::adapter::BackendAdapter;
use crate::db::retry::ErrorClass;
use crate::models::{BackendKind, ConnectionParams};
use async_trait::async_trait;
use sqlx::error::DatabaseError;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// MySQL error numbers worth retrying: too many connections, lock wait timeout,
/// deadlock, can't connect (socket/TCP), server gone away, lost connection.
const MYSQL_RETRYABLE: &[u16] = &[1040, 1205, 1213, 2002, 2003, 2006, 2013];

/// PostgreSQL SQLSTATEs worth retrying besides class 08.
const PG_RETRYABLE: &[&str] = &["57P01", "57P02", "57P03", "53300", "40001", "40P01"];

/// SQLite primary result codes: SQLITE_BUSY, SQLITE_LOCKED.
const SQLITE_RETRYABLE: &[i64] = &[5, 6];

const CONNECTION_ERROR_KEYWORDS: &[&str] = &[
    "connection",
    "connect",
    "timeout",
    "timed out",
    "refused",
    "reset",
    "broken pipe",
    "network",
    "socket",
    "server closed",
    "lost connection",
    "server has gone away",
    "no route to host",
    "host unreachable",
    "name or service not known",
    "temporary failure",
    "eof",
    "handshake",
    "too many connections",
];

/// Map a `sqlx` error to retryable or fatal.
pub fn classify_sqlx_error(error: &sqlx::Error) -> ErrorClass {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorClass::Retryable,
        sqlx::Error::Database(db) => classify_database_error(db.as_ref()),
        sqlx::Error::Configuration(_)
        | sqlx::Error::RowNotFound
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::Encode(_) => ErrorClass::Fatal,
        other => classify_message(&other.to_string()),
    }
}

fn classify_database_error(db: &dyn DatabaseError) -> ErrorClass {
    if let Some(mysql) = db.try_downcast_ref::<MySqlDatabaseError>() {
        if MYSQL_RETRYABLE.contains(&mysql.number()) {
            return ErrorClass::Retryable;
        }
    }

    let Some(code) = db.code() else {
        return classify_message(db.message());
    };

    // SQLite reports numeric (possibly extended) result codes.
    if let Ok(numeric) = code.parse::<i64>() {
        return if SQLITE_RETRYABLE.contains(&(numeric & 0xff)) {
            ErrorClass::Retryable
        } else {
            ErrorClass::Fatal
        };
    }

    if code.starts_with("08") || PG_RETRYABLE.contains(&code.as_ref()) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

fn classify_message(message: &str) -> ErrorClass {
    let message = message.to_lowercase();
    if message.contains("authentication") || message.contains("password") {
        return ErrorClass::Fatal;
    }
    if CONNECTION_ERROR_KEYWORDS.iter().any(|k| message.contains(k)) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

/// Bound a connect future by the params' connect timeout, if any.
async fn connect_within<C, F>(timeout: Option<Duration>, connect: F) -> Result<C, sqlx::Error>
where
    F: Future<Output = Result<C, sqlx::Error>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
            sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect timed out after {}s", limit.as_secs()),
            ))
        })?,
        None => connect.await,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteAdapter;

#[async_trait]
impl BackendAdapter for SqliteAdapter {
    type Session = SqliteConnection;
    type Error = sqlx::Error;

    fn kind(&self) -> BackendKind {
        BackendKind::SQLite
    }

    async fn open(&self, params: &ConnectionParams) -> Result<SqliteConnection, sqlx::Error> {
        let options = if params.database == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(&params.database)
                .create_if_missing(true)
        };
        debug!(database = %params.database, "Opening SQLite connection");
        connect_within(params.connect_timeout, options.connect()).await
    }

    async fn close(&self, session: SqliteConnection) {
        if let Err(e) = session.close().await {
            debug!(error = %e, "Error closing SQLite connection");
        }
    }

    async fn probe(&self, session: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        session.ping().await
    }

    fn classify_error(&self, error: &sqlx::Error) -> ErrorClass {
        classify_sqlx_error(error)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresAdapter;

impl PostgresAdapter {
    fn options(params: &ConnectionParams) -> Result<PgConnectOptions, sqlx::Error> {
        let mut options = PgConnectOptions::new()
            .host(&params.host)
            .port(params.port)
            .username(&params.user)
            .database(&params.database);
        if let Some(password) = &params.password {
            options = options.password(password);
        }
        if let Some(ssl_mode) = &params.ssl_mode {
            options = options.ssl_mode(PgSslMode::from_str(ssl_mode)?);
        }
        Ok(options)
    }
}

#[async_trait]
impl BackendAdapter for PostgresAdapter {
    type Session = PgConnection;
    type Error = sqlx::Error;

    fn kind(&self) -> BackendKind {
        BackendKind::PostgreSQL
    }

    async fn open(&self, params: &ConnectionParams) -> Result<PgConnection, sqlx::Error> {
        let options = Self::options(params)?;
        debug!(key = %params.key(), "Opening PostgreSQL connection");
        connect_within(params.connect_timeout, options.connect()).await
    }

    async fn close(&self, session: PgConnection) {
        if let Err(e) = session.close().await {
            debug!(error = %e, "Error closing PostgreSQL connection");
        }
    }

    async fn probe(&self, session: &mut PgConnection) -> Result<(), sqlx::Error> {
        session.ping().await
    }

    fn classify_error(&self, error: &sqlx::Error) -> ErrorClass {
        classify_sqlx_error(error)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlAdapter;

impl MySqlAdapter {
    fn options(params: &ConnectionParams) -> Result<MySqlConnectOptions, sqlx::Error> {
        let mut options = MySqlConnectOptions::new()
            .host(&params.host)
            .port(params.port)
            .username(&params.user)
            .database(&params.database)
            .charset("utf8mb4");
        if let Some(password) = &params.password {
            options = options.password(password);
        }
        if let Some(ssl_mode) = &params.ssl_mode {
            options = options.ssl_mode(MySqlSslMode::from_str(ssl_mode)?);
        }
        Ok(options)
    }
}

#[async_trait]
impl BackendAdapter for MySqlAdapter {
    type Session = MySqlConnection;
    type Error = sqlx::Error;

    fn kind(&self) -> BackendKind {
        BackendKind::MySQL
    }

    async fn open(&self, params: &ConnectionParams) -> Result<MySqlConnection, sqlx::Error> {
        let options = Self::options(params)?;
        debug!(key = %params.key(), "Opening MySQL connection");
        connect_within(params.connect_timeout, options.connect()).await
    }

    async fn close(&self, session: MySqlConnection) {
        if let Err(e) = session.close().await {
            debug!(error = %e, "Error closing MySQL connection");
        }
    }

    async fn probe(&self, session: &mut MySqlConnection) -> Result<(), sqlx::Error> {
        session.ping().await
    }

    fn classify_error(&self, error: &sqlx::Error) -> ErrorClass {
        classify_sqlx_error(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_retryable() {
        let err = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert_eq!(classify_sqlx_error(&err), ErrorClass::Retryable);
        assert_eq!(classify_sqlx_error(&sqlx::Error::PoolTimedOut), ErrorClass::Retryable);
    }

    #[test]
    fn test_configuration_and_row_errors_are_fatal() {
        let err = sqlx::Error::Configuration("bad url".into());
        assert_eq!(classify_sqlx_error(&err), ErrorClass::Fatal);
        assert_eq!(classify_sqlx_error(&sqlx::Error::RowNotFound), ErrorClass::Fatal);
    }

    #[test]
    fn test_message_fallback() {
        assert_eq!(classify_message("Lost connection to MySQL server"), ErrorClass::Retryable);
        assert_eq!(classify_message("server has gone away"), ErrorClass::Retryable);
        assert_eq!(classify_message("password authentication failed"), ErrorClass::Fatal);
        assert_eq!(classify_message("syntax error at or near SELEC"), ErrorClass::Fatal);
    }

    #[test]
    fn test_postgres_options_from_params() {
        let params = ConnectionParams::new(BackendKind::PostgreSQL)
            .with_host("db")
            .with_user("app")
            .with_password("secret")
            .with_database("orders")
            .with_ssl_mode("require");
        let options = PostgresAdapter::options(&params).unwrap();
        assert_eq!(options.get_host(), "db");
        assert_eq!(options.get_port(), 5432);
        assert_eq!(options.get_username(), "app");
        assert_eq!(options.get_database(), Some("orders"));
    }

    #[test]
    fn test_invalid_ssl_mode_is_rejected() {
        let params = ConnectionParams::new(BackendKind::PostgreSQL).with_ssl_mode("sometimes");
        assert!(PostgresAdapter::options(&params).is_err());
        let params = ConnectionParams::new(BackendKind::MySQL).with_ssl_mode("sometimes");
        assert!(MySqlAdapter::options(&params).is_err());
    }

    #[tokio::test]
    async fn test_sqlite_memory_open_probe_close() {
        let adapter = SqliteAdapter;
        let mut session = adapter.open(&ConnectionParams::sqlite(":memory:")).await.unwrap();
        adapter.probe(&mut session).await.unwrap();
        assert!(adapter.ping(&mut session).await);
        adapter.close(session).await;
    }
}

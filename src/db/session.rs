//! One-shot sessions: open with connection-level retry, use, close.
//!
//! The non-persistent path. A [`ScopedSession`] is never shared and never
//! reconnected; it is closed by [`ScopedSession::close`] or, as a fallback,
//! when dropped.

use crate::config::{RegistryConfig, RetryConfig};
use crate::db::adapter::BackendAdapter;
use crate::db::retry::{OperationKind, RetryExecutor};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionKey, ConnectionParams};
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A session owned by exactly one caller.
pub struct ScopedSession<A: BackendAdapter> {
    adapter: Arc<A>,
    session: Option<A::Session>,
    key: ConnectionKey,
    operation_retry: RetryConfig,
    executor: RetryExecutor,
}

/// Open a one-shot session, retrying the open per `config.connection_retry`.
pub async fn connect_once<A: BackendAdapter>(
    adapter: Arc<A>,
    params: &ConnectionParams,
    config: &RegistryConfig,
) -> DbResult<ScopedSession<A>> {
    connect_once_with(adapter, params, config, RetryExecutor::new()).await
}

/// [`connect_once`] reporting attempts through `executor`.
pub async fn connect_once_with<A: BackendAdapter>(
    adapter: Arc<A>,
    params: &ConnectionParams,
    config: &RegistryConfig,
    executor: RetryExecutor,
) -> DbResult<ScopedSession<A>> {
    config.validate()?;
    let key = params.key();

    let session = executor
        .execute(
            "connect",
            &config.connection_retry,
            |e| adapter.classify_error(e),
            || adapter.open(params),
        )
        .await
        .map_err(|failure| DbError::connection(key.to_string(), failure.attempts, failure.error))?;

    debug!(key = %key, "Opened scoped session");
    Ok(ScopedSession {
        adapter,
        session: Some(session),
        key,
        operation_retry: config.operation_retry.clone(),
        executor,
    })
}

/// Open a session, hand it to `f`, and close it whatever `f` returns.
pub async fn with_session<A, T, F>(
    adapter: Arc<A>,
    params: &ConnectionParams,
    config: &RegistryConfig,
    f: F,
) -> DbResult<T>
where
    A: BackendAdapter,
    F: for<'s> FnOnce(&'s mut ScopedSession<A>) -> BoxFuture<'s, DbResult<T>>,
{
    let mut session = connect_once(adapter, params, config).await?;
    let result = f(&mut session).await;
    session.close().await;
    result
}

impl<A: BackendAdapter> ScopedSession<A> {
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// The underlying session.
    pub fn session(&mut self) -> DbResult<&mut A::Session> {
        self.session
            .as_mut()
            .ok_or_else(|| DbError::connection_closed(self.key.to_string(), "session closed"))
    }

    /// Run `f` with operation-level retry. `OperationKind::Write` runs once.
    pub async fn run<T, F>(&mut self, operation: &str, kind: OperationKind, f: F) -> DbResult<T>
    where
        F: for<'s> Fn(&'s mut A::Session) -> BoxFuture<'s, Result<T, A::Error>>,
    {
        let config = if kind.is_retry_safe() {
            self.operation_retry.clone()
        } else {
            self.operation_retry.clone().with_enabled(false)
        };

        let key = self.key.to_string();
        let Some(session) = self.session.as_mut() else {
            return Err(DbError::connection_closed(key, "session closed"));
        };
        let adapter = &self.adapter;
        let f = &f;

        // One-shot sessions are never reopened, so every attempt reuses the same session.
        let session = &tokio::sync::Mutex::new(session);
        self.executor
            .execute(
                operation,
                &config,
                |e| adapter.classify_error(e),
                || async move {
                    let mut session = session.lock().await;
                    f(&mut **session).await
                },
            )
            .await
            .map_err(|failure| DbError::operation(operation, key, failure.attempts, failure.error))
    }

    /// Close the session. Idempotent.
    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            self.adapter.close(session).await;
            debug!(key = %self.key, "Closed scoped session");
        }
    }
}

impl<A: BackendAdapter> Drop for ScopedSession<A> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        // Fallback for paths that never reached `close`.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let adapter = self.adapter.clone();
                let key = self.key.clone();
                runtime.spawn(async move {
                    adapter.close(session).await;
                    info!(key = %key, "Closed scoped session on drop");
                });
            }
            Err(_) => {
                warn!(key = %self.key, "Scoped session dropped outside a runtime; closing by drop");
                drop(session);
            }
        }
    }
}

impl<A: BackendAdapter> fmt::Debug for ScopedSession<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedSession")
            .field("key", &self.key)
            .field("open", &self.session.is_some())
            .finish()
    }
}

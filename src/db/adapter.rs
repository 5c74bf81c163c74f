//! The per-backend capability the registry is generic over.

use crate::db::retry::ErrorClass;
use crate::models::{BackendKind, ConnectionParams};
use async_trait::async_trait;

/// Opens, probes, and closes sessions for one database backend, and classifies its errors.
///
/// The registry, handles and retry executor only ever talk to a backend through
/// this trait, so adding a backend means adding one implementation.
#[async_trait]
pub trait BackendAdapter: Send + Sync + 'static {
    /// A single open connection to the backend.
    type Session: Send + 'static;
    /// Driver error type.
    type Error: std::error::Error + Send + Sync + 'static;

    fn kind(&self) -> BackendKind;

    /// Open a new session. Retrying is the caller's job.
    async fn open(&self, params: &ConnectionParams) -> Result<Self::Session, Self::Error>;

    /// Close a session. Failures are swallowed; the session is gone either way.
    async fn close(&self, session: Self::Session);

    /// Cheapest round trip that proves the session is usable.
    async fn probe(&self, session: &mut Self::Session) -> Result<(), Self::Error>;

    /// Liveness check used by health checks; any probe failure means dead.
    async fn ping(&self, session: &mut Self::Session) -> bool {
        self.probe(session).await.is_ok()
    }

    fn classify_error(&self, error: &Self::Error) -> ErrorClass;
}

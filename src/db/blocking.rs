//! Thread-based execution mode.
//!
//! [`BlockingRegistry`] owns a small multi-thread runtime that drives the
//! registry's maintenance task, and exposes the registry operations as plain
//! blocking calls for code that runs on ordinary threads. Keys created here use
//! [`ConnectionMode::Sync`], so they never collide with async-mode handles.
//!
//! None of these methods may be called from inside an async task.

use crate::config::{RegistryConfig, RetryConfig};
use crate::db::adapter::BackendAdapter;
use crate::db::handle::{HandleSnapshot, HandleState};
use crate::db::registry::{HandleLease, HealthCheckSummary, PersistentConnectionRegistry};
use crate::db::retry::{OperationKind, RetryExecutor};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionKey, ConnectionMode, ConnectionParams};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::runtime::Runtime;

const MAINTENANCE_THREADS: usize = 2;

pub struct BlockingRegistry<A: BackendAdapter> {
    runtime: Arc<Runtime>,
    registry: PersistentConnectionRegistry<A>,
}

impl<A: BackendAdapter> BlockingRegistry<A> {
    pub fn new(adapter: A, config: RegistryConfig) -> DbResult<Self> {
        Self::with_executor(adapter, config, RetryExecutor::new())
    }

    pub fn with_executor(adapter: A, config: RegistryConfig, executor: RetryExecutor) -> DbResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(MAINTENANCE_THREADS)
            .thread_name("db-keepalive-worker")
            .enable_all()
            .build()
            .map_err(|e| DbError::internal(format!("failed to start runtime: {e}")))?;

        // The maintenance task is spawned onto whichever runtime is entered.
        let registry = {
            let _guard = runtime.enter();
            PersistentConnectionRegistry::with_executor(adapter, config, executor)?
        };

        Ok(Self {
            runtime: Arc::new(runtime),
            registry,
        })
    }

    /// The async registry underneath, sharing the same map.
    pub fn registry(&self) -> &PersistentConnectionRegistry<A> {
        &self.registry
    }

    pub fn get_or_create(&self, params: &ConnectionParams) -> DbResult<BlockingLease<A>> {
        let params = params.clone().with_mode(ConnectionMode::Sync);
        let lease = self.runtime.block_on(self.registry.get_or_create(&params))?;
        Ok(BlockingLease {
            runtime: self.runtime.clone(),
            lease,
        })
    }

    pub fn release(&self, lease: BlockingLease<A>) {
        lease.release();
    }

    pub fn health_check_all(&self) -> HealthCheckSummary {
        self.runtime.block_on(self.registry.health_check_all())
    }

    pub fn sweep_idle(&self) -> usize {
        self.runtime.block_on(self.registry.sweep_idle())
    }

    pub fn close_all(&self) {
        self.runtime.block_on(self.registry.close_all());
    }

    pub fn len(&self) -> usize {
        self.runtime.block_on(self.registry.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<HandleSnapshot> {
        self.runtime.block_on(self.registry.snapshot())
    }
}

/// Blocking counterpart of [`HandleLease`].
pub struct BlockingLease<A: BackendAdapter> {
    runtime: Arc<Runtime>,
    lease: HandleLease<A>,
}

impl<A: BackendAdapter> BlockingLease<A> {
    pub fn id(&self) -> &str {
        self.lease.id()
    }

    pub fn key(&self) -> &ConnectionKey {
        self.lease.key()
    }

    pub fn state(&self) -> HandleState {
        self.lease.state()
    }

    pub fn run<T, F>(&self, operation: &str, kind: OperationKind, f: F) -> DbResult<T>
    where
        F: for<'s> Fn(&'s mut A::Session) -> BoxFuture<'s, Result<T, A::Error>>,
    {
        self.runtime.block_on(self.lease.run(operation, kind, f))
    }

    pub fn run_with<T, F>(&self, operation: &str, config: &RetryConfig, kind: OperationKind, f: F) -> DbResult<T>
    where
        F: for<'s> Fn(&'s mut A::Session) -> BoxFuture<'s, Result<T, A::Error>>,
    {
        self.runtime.block_on(self.lease.run_with(operation, config, kind, f))
    }

    pub fn release(self) {
        self.lease.release();
    }
}

//! Process-wide bookkeeping of registries.
//!
//! Every registry registers a weak reference here when it is created, so
//! [`close_all_persistent_connections`] can shut all of them down in one call.
//! Nothing here runs at process exit; shutdown is always explicit.

use crate::config::RegistryConfig;
use crate::db::adapter::BackendAdapter;
use crate::db::registry::PersistentConnectionRegistry;
use crate::error::DbResult;
use futures_util::future::BoxFuture;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, PoisonError, Weak};
use tracing::info;

/// Type-erased view of a registry for bulk shutdown.
pub(crate) trait RegistryShutdown: Send + Sync {
    fn shutdown(&self) -> BoxFuture<'_, ()>;

    fn is_closed(&self) -> bool;
}

static REGISTRIES: LazyLock<Mutex<Vec<Weak<dyn RegistryShutdown>>>> =
    LazyLock::new(|| Mutex::new(Vec::new()));

static DEFAULTS: LazyLock<Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

pub(crate) fn register(registry: Weak<dyn RegistryShutdown>) {
    let mut registries = REGISTRIES.lock().unwrap_or_else(PoisonError::into_inner);
    registries.retain(|r| r.strong_count() > 0);
    registries.push(registry);
}

/// Number of registries still alive and open.
pub fn open_registry_count() -> usize {
    REGISTRIES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .filter_map(Weak::upgrade)
        .filter(|r| !r.is_closed())
        .count()
}

/// Close every live registry in the process. Returns how many were closed.
///
/// Registries created afterwards are unaffected.
pub async fn close_all_persistent_connections() -> usize {
    let live: Vec<Arc<dyn RegistryShutdown>> = {
        let mut registries = REGISTRIES.lock().unwrap_or_else(PoisonError::into_inner);
        let live = registries
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|r| !r.is_closed())
            .collect();
        registries.retain(|r| r.strong_count() > 0);
        live
    };

    let count = live.len();
    for registry in live {
        registry.shutdown().await;
    }
    info!(registries = count, "Closed all persistent connection registries");
    count
}

/// The shared default registry for adapter type `A`, created on first use.
///
/// A default registry that has been closed is replaced by a fresh one.
pub fn default_registry<A>() -> DbResult<PersistentConnectionRegistry<A>>
where
    A: BackendAdapter + Default,
{
    let mut defaults = DEFAULTS.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(existing) = defaults
        .get(&TypeId::of::<A>())
        .and_then(|r| r.downcast_ref::<PersistentConnectionRegistry<A>>())
        .filter(|r| !r.is_closed())
    {
        return Ok(existing.clone());
    }

    let adapter = A::default();
    let config = RegistryConfig::for_backend(adapter.kind());
    let registry = PersistentConnectionRegistry::new(adapter, config)?;
    defaults.insert(TypeId::of::<A>(), Box::new(registry.clone()));
    Ok(registry)
}

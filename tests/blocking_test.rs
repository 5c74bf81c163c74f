//! Thread-based callers sharing one blocking registry.

mod common;

use common::{MockAdapter, fast_config, params};
use db_keepalive::db::{BlockingRegistry, HandleState, OperationKind};
use db_keepalive::models::ConnectionMode;
use std::sync::Arc;
use std::thread;

#[test]
fn test_threads_share_one_connection() {
    let adapter = MockAdapter::new();
    let registry = Arc::new(BlockingRegistry::new(adapter.clone(), fast_config()).unwrap());

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let registry = registry.clone();
            thread::spawn(move || {
                let lease = registry.get_or_create(&params("orders")).unwrap();
                let id = lease
                    .run("select", OperationKind::Read, |session| Box::pin(session.query()))
                    .unwrap();
                (lease.key().mode, id)
            })
        })
        .collect();

    for worker in workers {
        let (mode, id) = worker.join().unwrap();
        assert_eq!(mode, ConnectionMode::Sync);
        assert_eq!(id, 1);
    }

    assert_eq!(adapter.opens(), 1);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.snapshot()[0].state, HandleState::Idle);

    registry.close_all();
    assert!(registry.is_empty());
    assert_eq!(adapter.closes(), 1);
    assert!(registry.get_or_create(&params("orders")).is_err());
}

#[test]
fn test_sync_and_async_modes_are_distinct_keys() {
    let adapter = MockAdapter::new();
    let registry = BlockingRegistry::new(adapter.clone(), fast_config()).unwrap();

    let sync_lease = registry.get_or_create(&params("orders")).unwrap();
    let async_registry = registry.registry().clone();
    let handle = std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let lease = async_registry.get_or_create(&params("orders")).await.unwrap();
            lease.key().mode
        })
    });

    assert_eq!(handle.join().unwrap(), ConnectionMode::Async);
    assert_eq!(sync_lease.key().mode, ConnectionMode::Sync);
    assert_eq!(adapter.opens(), 2);
    assert_eq!(registry.health_check_all().healthy, 2);
    registry.release(sync_lease);
    registry.close_all();
}

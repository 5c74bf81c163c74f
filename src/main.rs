//! db-keepalive - Main entry point.
//!
//! Opens a persistent connection to one database, probes it a number of times
//! with operation-level retry, prints the registry state as JSON and shuts down.

use db_keepalive::config::{Config, RegistryConfig};
use db_keepalive::db::{
    BackendAdapter, MySqlAdapter, OperationKind, PersistentConnectionRegistry, PostgresAdapter,
    SqliteAdapter, close_all_persistent_connections,
};
use db_keepalive::models::{BackendKind, ConnectionParams};
use serde_json::json;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

/// Borrow the connection `probes` times, pinging through the lease each time.
async fn run_probes<A: BackendAdapter + Clone>(
    adapter: A,
    params: &ConnectionParams,
    config: RegistryConfig,
    probes: u32,
    interval: Duration,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let registry = PersistentConnectionRegistry::new(adapter.clone(), config)?;

    let mut succeeded = 0u32;
    for probe in 1..=probes {
        let lease = match registry.get_or_create(params).await {
            Ok(lease) => lease,
            Err(e) => {
                registry.close_all().await;
                return Err(e.into());
            }
        };
        let result = lease
            .run("probe", OperationKind::Read, |session| {
                let adapter = adapter.clone();
                Box::pin(async move { adapter.probe(session).await })
            })
            .await;
        lease.release();

        match result {
            Ok(()) => {
                succeeded += 1;
                info!(probe = probe, key = %params.key(), "Probe succeeded");
            }
            Err(e) => {
                error!(probe = probe, error = %e, suggestion = ?e.suggestion(), "Probe failed");
            }
        }

        if probe < probes {
            tokio::time::sleep(interval).await;
        }
    }

    let health = registry.health_check_all().await;
    let report = json!({
        "key": params.key(),
        "probes": probes,
        "succeeded": succeeded,
        "health": health,
        "handles": registry.snapshot().await,
    });
    registry.close_all().await;
    Ok(report)
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    let params = config.connection_params()?;
    let registry_config = config.registry_config(params.kind)?;

    info!(
        key = %params.key(),
        probes = config.probes,
        "Starting db-keepalive v{}",
        env!("CARGO_PKG_VERSION")
    );

    let interval = config.probe_interval_duration();
    let probes = async {
        match params.kind {
            BackendKind::SQLite => {
                run_probes(SqliteAdapter, &params, registry_config, config.probes, interval).await
            }
            BackendKind::PostgreSQL => {
                run_probes(PostgresAdapter, &params, registry_config, config.probes, interval).await
            }
            BackendKind::MySQL => {
                run_probes(MySqlAdapter, &params, registry_config, config.probes, interval).await
            }
        }
    };

    let report = tokio::select! {
        report = probes => Some(report),
        _ = wait_for_signal() => None,
    };

    let closed = close_all_persistent_connections().await;
    info!(registries = closed, "Shutdown complete");

    if let Some(report) = report {
        println!("{}", serde_json::to_string_pretty(&report?)?);
    }
    Ok(())
}

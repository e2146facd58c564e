#![forbid(unsafe_code)]

use anyhow::Result;
use std::sync::Arc;
use sync_stress::config::CoordinatorConfig;
use sync_stress::coordinator::api::{self, ControlState};
use sync_stress::coordinator::Coordinator;
use sync_stress::metrics::CoordinatorMetrics;
use sync_stress::sync::{BackendBehavior, MemoryBackend};
use sync_stress::worker::storage::{ActorStorage, MemoryStorage, SqliteStorage};
use sync_stress::worker::WorkerSettings;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sync_stress=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("sync-stress - Starting coordinator");

    let config = CoordinatorConfig::from_env()?;

    // Worker state survives restarts only with a database
    let storage: Arc<dyn ActorStorage> = match &config.state_db {
        Some(url) => Arc::new(SqliteStorage::connect(url).await?),
        None => {
            info!("STATE_DB not set, worker state is kept in memory");
            Arc::new(MemoryStorage::new())
        }
    };

    let backend = MemoryBackend::new(config.test_auth_secret.clone()).with_behavior(BackendBehavior {
        latency: config.sim_latency,
        ..Default::default()
    });
    info!("Using in-process sync backend ({}ms simulated latency)", config.sim_latency.as_millis());

    let coordinator = Arc::new(Coordinator::new(
        storage,
        Arc::new(backend),
        WorkerSettings {
            operation_timeout: config.operation_timeout,
            access_secret: config.test_auth_secret.clone(),
        },
        CoordinatorMetrics::new(),
        config.sync_origin.clone(),
        config.max_workers,
    ));

    let resumed = coordinator.recover().await?;
    if resumed > 0 {
        info!("Recovered {} pending workers", resumed);
    }

    let state = ControlState::new(coordinator.clone(), config.control_token.as_str());

    // Run server with graceful shutdown
    tokio::select! {
        result = api::serve(state, config.port) => {
            if let Err(e) = result {
                tracing::error!("Control API error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    coordinator.shutdown().await;
    info!("Coordinator shutdown complete");
    Ok(())
}

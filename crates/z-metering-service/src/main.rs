//! Z-Metering Service - settles metered ML jobs against the credits ledger.
//!
//! This is the main entry point: it opens the ledger and queue, then runs the
//! result consumer (and reconciler, if enabled) until interrupted.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use z_metering_queue::{MessageQueue, PgQueue, RocksQueue};
use z_metering_service::{AppState, ConfigError, QueueBackend, ServiceConfig, ServiceError};
use z_metering_store::RocksStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,z_metering=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Z-Metering Service");

    let config = ServiceConfig::from_env()?;

    tracing::info!(
        data_dir = %config.data_dir,
        queue_backend = ?config.queue_backend,
        task_topic = %config.task_topic,
        result_topic = %config.result_topic,
        reconcile_deadline_seconds = ?config.reconcile_deadline_seconds,
        "Service configuration loaded"
    );

    tracing::info!(path = %config.data_dir, "Opening RocksDB store");
    let store = Arc::new(RocksStore::open(&config.data_dir)?);

    let queue = open_queue(&config).await?;

    let state = AppState::new(store, queue, config);

    let shutdown = CancellationToken::new();
    let runners: Vec<_> = state
        .supervisors()
        .into_iter()
        .map(|supervisor| {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { supervisor.run(shutdown).await })
        })
        .collect();
    tracing::info!(tasks = runners.len(), "Background tasks started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    shutdown.cancel();

    for result in futures::future::join_all(runners).await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Supervisor ended abnormally");
        }
    }

    tracing::info!("Z-Metering Service stopped");
    Ok(())
}

async fn open_queue(config: &ServiceConfig) -> Result<Arc<dyn MessageQueue>, ServiceError> {
    match config.queue_backend {
        QueueBackend::Rocks => {
            tracing::info!(path = %config.queue_dir, "Opening RocksDB queue");
            Ok(Arc::new(RocksQueue::open(&config.queue_dir)?))
        }
        QueueBackend::Postgres => {
            let url = config.queue_database_url.as_deref().ok_or_else(|| {
                ServiceError::Config(ConfigError::Missing {
                    key: "QUEUE_DATABASE_URL",
                    context: " for the postgres queue",
                })
            })?;
            tracing::info!("Connecting to PostgreSQL queue");
            let queue = PgQueue::connect(url, config.queue_visibility_timeout()).await?;
            queue.migrate().await?;
            Ok(Arc::new(queue))
        }
    }
}

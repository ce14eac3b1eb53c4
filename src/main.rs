//! # Relay Hub Main Entry Point
//!
//! Wires configuration, telemetry, the database pool, the worker pool and
//! the HTTP server together, all hanging off one shutdown token.

use std::sync::Arc;

use migration::{Migrator, MigratorTrait};
use relay_hub::config::ConfigLoader;
use relay_hub::crypto::TokenGuard;
use relay_hub::db::init_pool;
use relay_hub::models::job::QueueName;
use relay_hub::notify::NotificationDispatchHandler;
use relay_hub::providers::{HttpBotClient, HttpCrmClient};
use relay_hub::queue::JobQueue;
use relay_hub::queue::worker::{HandlerRegistry, WorkerPool};
use relay_hub::rate_limit::RateLimiter;
use relay_hub::reconcile::{ExportHandler, ReconcileHandler, SyncHandler};
use relay_hub::server::{AppState, run_server};
use relay_hub::{store, telemetry};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration from layered env files and variables
    let config_loader = ConfigLoader::new();
    let config = config_loader.load()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::install_metrics_recorder()?;

    tracing::info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }
    if config.crypto_key_ephemeral {
        tracing::warn!(
            "RELAY_CRYPTO_KEY is not set; credentials encrypted with the ephemeral key will not survive a restart"
        );
    }

    let db = init_pool(&config).await?;
    Migrator::up(&db, None).await?;

    let config = Arc::new(config);
    let guard = Arc::new(TokenGuard::from_config(&config)?);
    let store = store::from_config(&config)?;
    let limiter = Arc::new(RateLimiter::new(store, config.rate_limit.clone()));
    let queues = Arc::new(JobQueue::new(db.clone(), &config));

    let state = AppState {
        config: Arc::clone(&config),
        db: db.clone(),
        queues: Arc::clone(&queues),
        limiter,
        guard: Arc::clone(&guard),
        metrics,
    };

    let shutdown = CancellationToken::new();

    // Ctrl-C flips the token; server and workers drain together.
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            signal_token.cancel();
        }
    });

    let worker_handle = if config.worker.enabled {
        let registry = Arc::new(
            HandlerRegistry::new()
                .register(
                    QueueName::WebhookProcessing,
                    Arc::new(ReconcileHandler::new(db.clone(), Arc::clone(&queues))),
                )
                .register(
                    QueueName::Notifications,
                    Arc::new(NotificationDispatchHandler::new(
                        db.clone(),
                        Arc::clone(&guard),
                        Arc::new(HttpBotClient::new(config.bot_api_base.clone())),
                    )),
                )
                .register(
                    QueueName::Sync,
                    Arc::new(SyncHandler::new(
                        db.clone(),
                        Arc::clone(&guard),
                        Arc::new(HttpCrmClient::new()),
                    )),
                )
                .register(QueueName::Exports, Arc::new(ExportHandler::new(db.clone()))),
        );
        let pool = WorkerPool::new(db.clone(), Arc::clone(&queues), registry, &config.worker);
        let worker_shutdown = shutdown.clone();
        Some(tokio::spawn(
            async move { pool.run(worker_shutdown).await },
        ))
    } else {
        tracing::warn!("Worker pool disabled; jobs will accumulate until a worker comes up");
        None
    };

    run_server(state, shutdown.clone()).await?;

    // The server only returns once the token fired, so just drain the pool.
    if let Some(handle) = worker_handle {
        handle.await?;
    }

    tracing::info!("Relay Hub stopped");
    Ok(())
}

// Main entry point for the Stepflow control plane server

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stepflow_core::kernel::{
    CoreDeps, HandlerRegistry, MemoryQueue, MemoryStore, OutboxRelay, OutboxRelayConfig,
    PostgresQueue, PostgresStore, QueueDriver, RedisQueue, StepWorker, StepWorkerConfig, Store,
};
use stepflow_core::kernel::queue::PostgresQueueConfig;
use stepflow_core::server::{build_app, AppState};
use stepflow_core::{Config, QueueDriverKind};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stepflow_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Stepflow control plane");

    let config = Arc::new(Config::from_env().context("Failed to load configuration")?);
    tracing::info!(driver = ?config.queue_driver, "Configuration loaded");

    let metrics_handle =
        stepflow_core::kernel::metrics::install().context("Failed to install metrics recorder")?;

    let shutdown = CancellationToken::new();

    // Connect Postgres when either the store or the queue driver needs it
    let pool = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("Failed to connect to database")?;

            tracing::info!("Running database migrations...");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run migrations")?;
            Some(pool)
        }
        None => None,
    };

    let store: Arc<dyn Store> = match &pool {
        Some(pool) => Arc::new(PostgresStore::new(pool.clone())),
        None => Arc::new(MemoryStore::new()),
    };

    let queue: Arc<dyn QueueDriver> = match config.queue_driver {
        QueueDriverKind::Memory => Arc::new(MemoryQueue::new(
            config.worker_concurrency,
            config.queue_soft_limit,
            shutdown.clone(),
        )),
        QueueDriverKind::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .context("REDIS_URL is required for the redis driver")?;
            Arc::new(
                RedisQueue::connect(
                    url,
                    config.worker_concurrency,
                    config.queue_soft_limit,
                    shutdown.clone(),
                )
                .await
                .context("Failed to connect to redis")?,
            )
        }
        QueueDriverKind::Postgres => {
            let pool = pool
                .clone()
                .context("DATABASE_URL is required for the postgres driver")?;
            let queue_config = PostgresQueueConfig {
                // The lease must outlive the slowest allowed handler.
                lock_duration: config.step_timeout() + Duration::from_secs(30),
                ..Default::default()
            };
            Arc::new(PostgresQueue::new(
                pool,
                queue_config,
                config.worker_concurrency,
                config.queue_soft_limit,
                shutdown.clone(),
            ))
        }
    };

    let registry = Arc::new(HandlerRegistry::with_builtins());
    let deps = Arc::new(CoreDeps::new(
        store.clone(),
        queue.clone(),
        registry,
        config.clone(),
    ));

    let worker = StepWorker::new(
        deps.clone(),
        StepWorkerConfig {
            step_timeout: config.step_timeout(),
            ..Default::default()
        },
    );
    worker.start().await.context("Failed to start step worker")?;

    if config.outbox_relay_interval_ms > 0 {
        let relay = OutboxRelay::new(
            store,
            queue,
            OutboxRelayConfig {
                interval: config.outbox_relay_interval(),
                batch: config.outbox_relay_batch,
            },
            shutdown.clone(),
        );
        tokio::spawn(relay.run());
    } else {
        tracing::info!("outbox relay disabled");
    }

    // Start server
    let app = build_app(AppState::new(deps, metrics_handle));
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received shutdown signal");
            server_shutdown.cancel();
        })
        .await
        .context("Server error")?;

    Ok(())
}

// Main entry point for the tutor jobs server

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tutor_jobs::{
    kernel::{
        jobs::JobStore, ConnectionManager, JobsKernel, JobsSettings, MemoryJobStore,
        PostgresJobStore, TutorClient, TutorHandlers,
    },
    server::build_app,
    Config, StoreBackend,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tutor_jobs=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting tutor jobs server");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(backend = ?config.backend, production = config.production, "Configuration loaded");

    let (store, connections): (Arc<dyn JobStore>, Option<Arc<ConnectionManager>>) =
        match config.backend {
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory job store; jobs are lost on restart");
                (Arc::new(MemoryJobStore::new()), None)
            }
            StoreBackend::Postgres => {
                tracing::info!("Connecting to job store...");
                let connections = Arc::new(ConnectionManager::new(config.store.clone()));
                let pool = connections
                    .get_connection()
                    .await
                    .context("Failed to connect to job store")?;
                tracing::info!("Job store connected");

                tracing::info!("Running database migrations...");
                sqlx::migrate!("./migrations")
                    .run(&pool)
                    .await
                    .context("Failed to run migrations")?;
                tracing::info!("Migrations complete");

                (
                    Arc::new(PostgresJobStore::new(connections.clone())),
                    Some(connections),
                )
            }
        };

    let handlers = Arc::new(TutorHandlers::new(TutorClient::from_config(&config.tutor)));
    let settings = JobsSettings {
        queues: config.queues.clone(),
        cache: config.cache.clone(),
        poll: config.poll.clone(),
    };

    let mut kernel = JobsKernel::new(store, handlers, settings);
    if let Some(connections) = connections {
        kernel = kernel.with_connections(connections);
    }
    let kernel = Arc::new(kernel);

    let workers = kernel.spawn_workers();
    let app = build_app(kernel.clone());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutting down job workers");
    kernel.shutdown();
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "worker task ended abnormally");
        }
    }
    kernel.close().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

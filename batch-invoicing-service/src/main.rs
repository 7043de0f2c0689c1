use batch_invoicing_service::config::BatchingConfig;
use batch_invoicing_service::services::{
    Database, DegradableBatchStore, HttpCustomerDirectory, HttpFieldExtractor,
    HttpInvoicingProvider, LocalStorage, PgFolioAllocator, RedisBatchStore, init_metrics,
};
use batch_invoicing_service::startup::{Application, Dependencies};
use service_core::observability::init_tracing;
use std::sync::Arc;
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize metrics recorder (must be before any metrics are recorded)
    init_metrics();

    let otlp_endpoint =
        std::env::var("OTLP_ENDPOINT").unwrap_or_else(|_| "http://tempo:4317".to_string());
    init_tracing("batch-invoicing-service", "info", &otlp_endpoint);

    let config = BatchingConfig::load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    // Postgres backs the folio counters; they must exist before any
    // confirmation can allocate.
    let db = Database::new(
        &config.database.url,
        config.database.max_connections,
        config.database.min_connections,
    )
    .await
    .map_err(|e| {
        tracing::error!("Failed to connect to PostgreSQL: {}", e);
        std::io::Error::other(format!("Database connection error: {}", e))
    })?;

    db.run_migrations().await.map_err(|e| {
        tracing::error!("Failed to run migrations: {}", e);
        std::io::Error::other(format!("Database migration error: {}", e))
    })?;

    let allocator = Arc::new(PgFolioAllocator::new(db.pool().clone()));

    // Redis outage is not fatal: the store degrades to in-process mode and
    // says so on every snapshot.
    let redis_store = match RedisBatchStore::connect(&config.redis.url).await {
        Ok(store) => Some(store),
        Err(e) => {
            tracing::warn!(error = %e, "Redis unavailable at startup, entering degraded mode");
            None
        }
    };
    let store = Arc::new(DegradableBatchStore::new(redis_store));

    let storage = Arc::new(
        LocalStorage::new(&config.storage.local_path)
            .await
            .map_err(|e| {
                tracing::error!(
                    "Failed to initialize local storage at {}: {}",
                    config.storage.local_path,
                    e
                );
                std::io::Error::other(format!("Storage initialization error: {}", e))
            })?,
    );

    let extractor = Arc::new(
        HttpFieldExtractor::new(config.extractor.endpoint.clone(), config.extractor.timeout())
            .map_err(|e| std::io::Error::other(format!("Extractor client error: {}", e)))?,
    );

    let provider = Arc::new(
        HttpInvoicingProvider::new(
            config.provider.base_url.clone(),
            config.provider.api_key.clone(),
            config.provider.timeout(),
        )
        .map_err(|e| std::io::Error::other(format!("Provider client error: {}", e)))?,
    );

    let directory = Arc::new(
        HttpCustomerDirectory::new(config.directory.base_url.clone(), config.directory.timeout())
            .map_err(|e| std::io::Error::other(format!("Directory client error: {}", e)))?,
    );

    let app = Application::build(
        config,
        Dependencies {
            db: Some(db),
            store,
            storage,
            extractor,
            provider,
            directory,
            allocator,
        },
    )
    .await
    .map_err(|e| {
        tracing::error!("Failed to build application: {}", e);
        std::io::Error::other(format!("Startup error: {}", e))
    })?;

    let shutdown = app.shutdown_token();

    tokio::select! {
        result = app.run_until_stopped() => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            shutdown.cancel();
        }
    }

    Ok(())
}

//! Application startup and lifecycle management.
//!
//! Collaborators are injected explicitly at construction; nothing is
//! resolved lazily or through process globals.

use axum::{
    Router,
    routing::{get, post},
};
use service_core::error::AppError;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::BatchingConfig;
use crate::handlers;
use crate::services::batch_store::{BatchStore, DegradableBatchStore};
use crate::services::calculator::TaxProfile;
use crate::services::database::Database;
use crate::services::directory::CustomerDirectory;
use crate::services::extractor::FieldExtractor;
use crate::services::folio::FolioAllocator;
use crate::services::packager::ArtifactPackager;
use crate::services::provider::InvoicingProvider;
use crate::services::storage::Storage;
use crate::workers::analysis::AnalysisPool;
use crate::workers::submission::{SubmissionQueue, SubmissionSettings, submission_queue};

/// Everything the pipeline talks to, wired by main (real backends) or by
/// tests (in-process mocks).
pub struct Dependencies {
    pub db: Option<Database>,
    pub store: Arc<DegradableBatchStore>,
    pub storage: Arc<dyn Storage>,
    pub extractor: Arc<dyn FieldExtractor>,
    pub provider: Arc<dyn InvoicingProvider>,
    pub directory: Arc<dyn CustomerDirectory>,
    pub allocator: Arc<dyn FolioAllocator>,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: BatchingConfig,
    pub db: Option<Database>,
    pub store: Arc<DegradableBatchStore>,
    pub storage: Arc<dyn Storage>,
    pub extractor: Arc<dyn FieldExtractor>,
    pub provider: Arc<dyn InvoicingProvider>,
    pub directory: Arc<dyn CustomerDirectory>,
    pub allocator: Arc<dyn FolioAllocator>,
    pub queue: SubmissionQueue,
    pub packager: Arc<ArtifactPackager>,
    pub analysis: AnalysisPool,
    pub tax_profile: TaxProfile,
}

pub struct Application {
    port: u16,
    server: Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + Unpin>,
    state: AppState,
    shutdown: CancellationToken,
}

impl Application {
    pub async fn build(config: BatchingConfig, deps: Dependencies) -> Result<Self, AppError> {
        let shutdown = CancellationToken::new();

        let settings = SubmissionSettings {
            max_in_flight: config.provider.max_in_flight,
            requests_per_minute: config.provider.requests_per_minute,
            max_attempts: config.provider.max_attempts,
            ..Default::default()
        };

        let store_dyn: Arc<dyn BatchStore> = deps.store.clone();
        let (queue, dispatcher) = submission_queue(
            store_dyn.clone(),
            deps.provider.clone(),
            settings,
            shutdown.clone(),
        );
        tokio::spawn(dispatcher.run());

        let packager = Arc::new(ArtifactPackager::new(
            deps.provider.clone(),
            deps.storage.clone(),
            config.storage.scratch_path.clone(),
            config.pipeline.artifact_grace(),
        ));

        let analysis = AnalysisPool::new(
            store_dyn,
            deps.storage.clone(),
            deps.extractor.clone(),
            config.pipeline.max_fan_out,
            config.pipeline.analysis_timeout(),
            config.extractor.min_confidence,
        );

        let state = AppState {
            config: config.clone(),
            db: deps.db,
            store: deps.store,
            storage: deps.storage,
            extractor: deps.extractor,
            provider: deps.provider,
            directory: deps.directory,
            allocator: deps.allocator,
            queue,
            packager,
            analysis,
            tax_profile: TaxProfile::default(),
        };

        let app = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/ready", get(handlers::readiness_check))
            .route("/metrics", get(handlers::metrics_endpoint))
            .route("/batches", post(handlers::create_batch))
            .route("/batches/:batch_id", get(handlers::get_batch))
            .route("/batches/:batch_id/confirm", post(handlers::confirm_batch))
            .route("/batches/:batch_id/cancel", post(handlers::cancel_batch))
            .route("/batches/:batch_id/artifacts", get(handlers::get_artifacts))
            .route("/invoices", post(handlers::create_invoice))
            .layer(TraceLayer::new_for_http())
            .with_state(state.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Listening on {}", port);

        let server = axum::serve(listener, app);

        Ok(Self {
            port,
            server: Box::new(server.into_future()),
            state,
            shutdown,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Token cancelling the submission dispatcher.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.server.await
    }
}

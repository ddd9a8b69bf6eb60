use axum::{middleware, routing::get, Router};
use domain::services::{ApplicationSource, ExportTaskStore};
use shared::jwt::{JwtConfig, JwtError};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::{Config, ExportConfig};
use crate::middleware::{
    metrics_handler, metrics_middleware, security_headers_middleware, trace_id,
};
use crate::routes::{exports, health};
use crate::services::export::{
    ArtifactStorage, ExportGenerator, ExportService, ExportWorkerPool, PoolSettings,
    ServiceSettings, StorageError,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub exports: ExportService,
    pub jwt: Arc<JwtConfig>,
}

impl AppState {
    pub fn new(config: Arc<Config>, exports: ExportService) -> Result<Self, JwtError> {
        let jwt = JwtConfig::from_public_key(&config.jwt.public_key, config.jwt.leeway_secs)?;
        Ok(Self {
            config,
            exports,
            jwt: Arc::new(jwt),
        })
    }
}

/// Wire storage, generator, worker pool and facade from configuration.
pub fn build_export_service(
    config: &ExportConfig,
    store: Arc<dyn ExportTaskStore>,
    source: Arc<dyn ApplicationSource>,
) -> Result<ExportService, StorageError> {
    let storage = ArtifactStorage::new(&config.storage_dir)?;
    let generator = ExportGenerator::new(
        source,
        store.clone(),
        storage.clone(),
        config.batch_size,
        config.max_rows,
    );
    let pool = ExportWorkerPool::new(
        store.clone(),
        generator,
        PoolSettings {
            capacity: config.worker_capacity,
            retention: config.retention(),
        },
    );

    Ok(ExportService::new(
        store,
        storage,
        pool,
        ServiceSettings {
            enabled_formats: config.formats(),
            max_pending: config.max_pending,
            stall_threshold: config.stall_threshold(),
            retry_after_secs: config.admission_interval_secs.max(1),
            record_retention: config.record_retention(),
            purge_batch: config.purge_batch_size,
        },
    ))
}

pub fn create_app(state: AppState) -> Router {
    let config = state.config.clone();

    let cors = if config.security.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .security
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    // Authentication is enforced per handler by the `UserAuth` extractor.
    let export_routes = Router::new().nest("/api/v1/exports", exports::router());

    let public_routes = Router::new()
        .route("/api/health", get(health::health_check))
        .route("/api/health/ready", get(health::ready))
        .route("/api/health/live", get(health::live))
        .route("/metrics", get(metrics_handler));

    Router::new()
        .merge(public_routes)
        .merge(export_routes)
        // Global middleware (order matters: bottom layers run first)
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.server.request_timeout_secs,
        )))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(trace_id))
        .layer(cors)
        .with_state(state)
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use jobtrack_api::app::{build_export_service, create_app, AppState};
use jobtrack_api::config::Config;
use jobtrack_api::jobs::{ExportAdmissionJob, ExportMetricsJob, ExportRetentionJob, JobScheduler};
use jobtrack_api::middleware::{init_metrics, logging::init_logging};
use persistence::repositories::{PgApplicationSource, PgExportTaskStore};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load().context("Failed to load configuration")?;
    init_logging(&config.logging).context("Failed to initialize logging")?;
    init_metrics().context("Failed to install metrics recorder")?;

    info!("Starting JobTrack export API v{}", env!("CARGO_PKG_VERSION"));

    let db_config: persistence::db::DatabaseConfig = (&config.database).into();
    let pool = persistence::db::create_pool(&db_config)
        .await
        .context("Database unreachable at startup")?;

    info!("Running database migrations...");
    persistence::db::run_migrations(&pool).await?;
    info!("Migrations completed");

    let store = Arc::new(PgExportTaskStore::new(pool.clone()));
    let source = Arc::new(PgApplicationSource::new(pool.clone()));
    let exports = build_export_service(&config.export, store, source).with_context(|| {
        format!(
            "Failed to open export storage at {}",
            config.export.storage_dir.display()
        )
    })?;

    // Must finish before the first admission pass.
    let recovered = exports.pool().recover().await?;
    if recovered > 0 {
        warn!(recovered = recovered, "Recovered interrupted export tasks");
    }

    let mut scheduler = JobScheduler::new();
    scheduler.register(ExportAdmissionJob::new(
        exports.clone(),
        config.export.admission_interval(),
    ));
    scheduler.register(ExportRetentionJob::new(
        exports.clone(),
        config.export.sweep_interval(),
    ));
    scheduler.register(ExportMetricsJob::new(exports.clone()).with_database(pool.clone()));
    scheduler.start();

    let config = Arc::new(config);
    let state = AppState::new(config.clone(), exports.clone()).context("Invalid JWT keys")?;
    let app = create_app(state);

    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    scheduler.shutdown();
    if !exports.pool().shutdown(grace).await {
        warn!("Some exports were still running at exit; they will be failed on restart");
    }
    scheduler.wait_for_shutdown(Duration::from_secs(5)).await;
    pool.close().await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining");
}

//! Health check endpoint handlers.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::app::AppState;
use crate::error::ApiError;

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: DatabaseHealth,
    pub workers: WorkerHealth,
}

/// Store connectivity.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseHealth {
    pub connected: bool,
    pub latency_ms: Option<u64>,
}

/// Export worker pool occupancy.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkerHealth {
    pub capacity: usize,
    pub busy: usize,
    pub shutting_down: bool,
}

/// Simple status response for liveness/readiness probes.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

/// Full health check: store connectivity and worker occupancy.
pub async fn health_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let pool = state.exports.pool();
    let start = std::time::Instant::now();
    let connected = pool.ping_stores().await.is_ok();
    let latency_ms = start.elapsed().as_millis() as u64;

    let response = HealthResponse {
        status: if connected { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: DatabaseHealth {
            connected,
            latency_ms: connected.then_some(latency_ms),
        },
        workers: WorkerHealth {
            capacity: pool.capacity(),
            busy: pool.running_count(),
            shutting_down: pool.is_shutting_down(),
        },
    };

    let status = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

/// Liveness probe: the process is running.
pub async fn live() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "alive".to_string(),
    })
}

/// Readiness probe: stores reachable and not draining.
pub async fn ready(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let pool = state.exports.pool();
    if pool.is_shutting_down() {
        return Err(ApiError::ServiceUnavailable("Export workers are draining".to_string()));
    }
    if let Err(e) = pool.ping_stores().await {
        tracing::warn!(error = %e, "Readiness check failed");
        return Err(ApiError::ServiceUnavailable("Storage is unreachable".to_string()));
    }
    Ok(Json(StatusResponse {
        status: "ready".to_string(),
    }))
}

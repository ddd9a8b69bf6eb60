//! Prometheus metrics.
//!
//! HTTP request metrics, the `/metrics` endpoint and the export engine's
//! business metrics.

use std::sync::OnceLock;
use std::time::Instant;

use axum::{
    body::Body,
    extract::MatchedPath,
    http::{header, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use domain::models::{ExportFormat, ExportStatus};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Records `http_requests_total{method,path,status}` and
/// `http_request_duration_seconds{method,path}`.
pub async fn metrics_middleware(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = method_to_str(req.method());
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    counter!(
        "http_requests_total",
        "method" => method,
        "path" => path.clone(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "http_request_duration_seconds",
        "method" => method,
        "path" => path
    )
    .record(start.elapsed().as_secs_f64());

    response
}

/// Convert HTTP method to string for metric labels.
fn method_to_str(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::DELETE => "DELETE",
        Method::PATCH => "PATCH",
        Method::HEAD => "HEAD",
        Method::OPTIONS => "OPTIONS",
        _ => "OTHER",
    }
}

pub fn record_export_created(format: ExportFormat) {
    counter!("export_tasks_created_total", "format" => format.as_str()).increment(1);
}

/// Count tasks reaching a terminal status.
pub fn record_export_finished(status: ExportStatus, count: u64) {
    counter!("export_tasks_total", "status" => status.as_str()).increment(count);
}

pub fn record_export_duration(format: ExportFormat, status: ExportStatus, secs: f64) {
    histogram!(
        "export_task_duration_seconds",
        "format" => format.as_str(),
        "status" => status.as_str()
    )
    .record(secs);
}

pub fn record_export_rows(format: ExportFormat, rows: u64) {
    counter!("export_rows_written_total", "format" => format.as_str()).increment(rows);
}

pub fn set_export_workers_busy(busy: usize) {
    gauge!("export_workers_busy").set(busy as f64);
}

pub fn set_export_backlog(pending: i64) {
    gauge!("export_tasks_pending").set(pending as f64);
}

pub fn record_artifacts_purged(count: u64) {
    if count > 0 {
        counter!("export_artifacts_purged_total").increment(count);
    }
}

/// Handler for `/metrics` in Prometheus text format.
pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain")],
            "Metrics not initialized".to_string(),
        ),
    }
}

/// Install the global Prometheus recorder. Call once at startup, before
/// any metric is recorded; later calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets(&[
            0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
        ])?
        .install_recorder()?;

    let _ = PROMETHEUS_HANDLE.set(handle);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_to_str() {
        assert_eq!(method_to_str(&Method::GET), "GET");
        assert_eq!(method_to_str(&Method::POST), "POST");
        assert_eq!(method_to_str(&Method::DELETE), "DELETE");
        assert_eq!(method_to_str(&Method::TRACE), "OTHER");
    }

    #[test]
    fn test_export_recorders_without_recorder_installed() {
        record_export_created(ExportFormat::Csv);
        record_export_finished(ExportStatus::Completed, 1);
        record_export_rows(ExportFormat::Json, 10);
        record_artifacts_purged(0);
        set_export_workers_busy(2);
    }
}

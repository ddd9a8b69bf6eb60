//! Export routes.
//!
//! All routes require a bearer token. Tasks belonging to another owner are
//! reported as not found.

use axum::{
    body::Body,
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use domain::models::{
    CancelExportResponse, CreateExportRequest, ExportHistoryQuery, ExportHistoryResponse,
    ExportTaskResponse, FieldsResponse, FormatsResponse, TemplateQuery, TemplateResponse,
};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::app::AppState;
use crate::error::ApiError;
use crate::extractors::UserAuth;

/// Create the exports router, mounted at `/api/v1/exports`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_exports).post(create_export))
        .route("/formats", get(list_formats))
        .route("/fields", get(list_fields))
        .route("/template", get(get_template))
        .route("/:task_id", get(get_export).delete(cancel_export))
        .route("/:task_id/download", get(download_export))
}

fn task_id(path: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, ApiError> {
    path.map(|Path(id)| id)
        .map_err(|_| ApiError::NotFound("Export task not found".to_string()))
}

/// Request a new export. The task starts `pending`.
pub async fn create_export(
    State(state): State<AppState>,
    auth: UserAuth,
    payload: Result<Json<CreateExportRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;
    let created = state.exports.create(auth.requester(), request).await?;
    Ok((StatusCode::ACCEPTED, Json(created)))
}

/// The caller's export history, newest first.
pub async fn list_exports(
    State(state): State<AppState>,
    auth: UserAuth,
    Query(query): Query<ExportHistoryQuery>,
) -> Result<Json<ExportHistoryResponse>, ApiError> {
    Ok(Json(state.exports.list(auth.requester(), query).await?))
}

pub async fn get_export(
    State(state): State<AppState>,
    auth: UserAuth,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<ExportTaskResponse>, ApiError> {
    let task_id = task_id(path)?;
    Ok(Json(state.exports.get(auth.requester(), task_id).await?))
}

/// Cancel an export. Repeating the request, or cancelling a finished task,
/// returns the current status.
pub async fn cancel_export(
    State(state): State<AppState>,
    auth: UserAuth,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<CancelExportResponse>, ApiError> {
    let task_id = task_id(path)?;
    Ok(Json(state.exports.cancel(auth.requester(), task_id).await?))
}

/// Stream a completed export's artifact.
pub async fn download_export(
    State(state): State<AppState>,
    auth: UserAuth,
    headers: HeaderMap,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Response, ApiError> {
    let task_id = task_id(path)?;
    let artifact = state.exports.download(auth.requester(), task_id).await?;

    let etag = artifact
        .sha256
        .as_deref()
        .and_then(|digest| HeaderValue::from_str(&format!("\"{}\"", digest)).ok());

    if let Some(ref etag) = etag {
        let not_modified = headers
            .get(header::IF_NONE_MATCH)
            .map(|value| value == etag)
            .unwrap_or(false);
        if not_modified {
            return Ok((StatusCode::NOT_MODIFIED, [(header::ETAG, etag.clone())]).into_response());
        }
    }

    let disposition = format!("attachment; filename=\"{}\"", artifact.file_name);
    let mut response = Response::new(Body::from_stream(ReaderStream::new(artifact.file)));
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(artifact.content_type),
    );
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(artifact.len));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        response_headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Some(etag) = etag {
        response_headers.insert(header::ETAG, etag);
    }
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private, no-cache"));

    Ok(response)
}

pub async fn list_formats(State(state): State<AppState>, _auth: UserAuth) -> Json<FormatsResponse> {
    Json(state.exports.formats())
}

pub async fn list_fields(State(state): State<AppState>, _auth: UserAuth) -> Json<FieldsResponse> {
    Json(state.exports.fields())
}

pub async fn get_template(
    State(state): State<AppState>,
    _auth: UserAuth,
    Query(query): Query<TemplateQuery>,
) -> Result<Json<TemplateResponse>, ApiError> {
    Ok(Json(state.exports.template(query.format.as_deref())?))
}

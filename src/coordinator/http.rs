//! HTTP API over the coordinator
//!
//! A thin adapter: every handler maps to one coordinator operation, and
//! errors render as `{ "error": ... }` with the status from
//! [`Error::to_http_status`]. Artifact bodies are streamed in both
//! directions, never buffered whole.

use crate::common::{content_disposition, Error};
use crate::coordinator::engine::{
    ArtifactDownload, ArtifactUpdate, Coordinator, ProjectUpdate, ProjectView,
};
use crate::coordinator::metadata::{Artifact, Project};
use crate::ops::{verify_store, RepairReport, VerifyReport};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures_util::TryStreamExt;
use http_body_util::LengthLimitError;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Header carrying the stored SHA-256 on downloads
pub const CHECKSUM_HEADER: &str = "x-checksum-sha256";

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

type ApiResult<T> = std::result::Result<T, Error>;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        if self.is_rejection() {
            tracing::debug!("Request rejected: {}", self);
        } else {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Creates the HTTP router with all public endpoints.
pub fn create_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/projects", get(list_projects).post(create_project))
        .route(
            "/projects/:key",
            get(get_project).put(update_project).delete(delete_project),
        )
        .route("/projects/:key/artifacts", get(list_artifacts))
        .route(
            "/projects/:key/artifacts/:version",
            post(upload_artifact)
                .get(get_artifact)
                .patch(update_artifact)
                .delete(delete_artifact),
        )
        .route(
            "/projects/:key/artifacts/:version/content",
            put(replace_artifact_content),
        )
        .route(
            "/projects/:key/artifacts/:version/download",
            get(download_artifact),
        )
        .route("/admin/verify", post(admin_verify))
        .route("/admin/repair", post(admin_repair))
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Adapt a request body into an `AsyncRead` for the content store
fn body_reader(body: Body) -> impl AsyncRead + Unpin {
    StreamReader::new(body.into_data_stream().map_err(std::io::Error::other))
}

/// Report a body cut off by the upload limit as 413 rather than an I/O failure
fn upload_error(err: Error) -> Error {
    match err {
        Error::Io(io) if exceeds_body_limit(&io) => {
            Error::PayloadTooLarge("upload exceeds the configured size limit".into())
        }
        other => other,
    }
}

fn exceeds_body_limit(err: &std::io::Error) -> bool {
    let mut current = err
        .get_ref()
        .map(|inner| inner as &(dyn std::error::Error + 'static));
    while let Some(e) = current {
        if e.is::<LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}

// === Projects ===

#[derive(Debug, Deserialize)]
struct NewProjectRequest {
    key: String,
    name: Option<String>,
    description: Option<String>,
}

async fn list_projects(State(state): State<AppState>) -> ApiResult<Json<Vec<ProjectView>>> {
    Ok(Json(state.coordinator.list_projects().await?))
}

async fn create_project(
    State(state): State<AppState>,
    Json(req): Json<NewProjectRequest>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let project = state
        .coordinator
        .new_project(&req.key, req.name, req.description)
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<ProjectView>> {
    Ok(Json(state.coordinator.get_project(&key).await?))
}

async fn update_project(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(update): Json<ProjectUpdate>,
) -> ApiResult<StatusCode> {
    state.coordinator.update_project(&key, update).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_project(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<StatusCode> {
    state.coordinator.delete_project(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Artifacts ===

#[derive(Debug, Deserialize)]
struct UploadQuery {
    file_name: Option<String>,
}

async fn list_artifacts(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<Vec<Artifact>>> {
    Ok(Json(state.coordinator.list_artifacts(&key).await?))
}

/// Upload a new version; the raw request body is the artifact
async fn upload_artifact(
    State(state): State<AppState>,
    Path((key, version)): Path<(String, String)>,
    Query(query): Query<UploadQuery>,
    body: Body,
) -> ApiResult<(StatusCode, Json<Artifact>)> {
    let file_name = query.file_name.unwrap_or_else(|| version.clone());
    let mut reader = body_reader(body);
    let artifact = state
        .coordinator
        .new_artifact(&key, &version, &file_name, &mut reader)
        .await
        .map_err(upload_error)?;
    Ok((StatusCode::CREATED, Json(artifact)))
}

async fn get_artifact(
    State(state): State<AppState>,
    Path((key, version)): Path<(String, String)>,
) -> ApiResult<Json<Artifact>> {
    Ok(Json(state.coordinator.get_artifact(&key, &version).await?))
}

async fn update_artifact(
    State(state): State<AppState>,
    Path((key, version)): Path<(String, String)>,
    Json(update): Json<ArtifactUpdate>,
) -> ApiResult<StatusCode> {
    state
        .coordinator
        .update_artifact(&key, &version, update)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Replace the binary; field changes ride along as query parameters
async fn replace_artifact_content(
    State(state): State<AppState>,
    Path((key, version)): Path<(String, String)>,
    Query(update): Query<ArtifactUpdate>,
    body: Body,
) -> ApiResult<StatusCode> {
    let mut reader = body_reader(body);
    state
        .coordinator
        .update_artifact_with_content(&key, &version, update, &mut reader)
        .await
        .map_err(upload_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn download_artifact(
    State(state): State<AppState>,
    Path((key, version)): Path<(String, String)>,
) -> ApiResult<Response> {
    let ArtifactDownload { artifact, file } =
        state.coordinator.download_artifact(&key, &version).await?;
    // The body is whatever is on disk, even if it disagrees with the record
    let len = file.metadata().await?.len();
    if len != artifact.file_size_bytes {
        tracing::warn!(
            project = %key,
            version = %artifact.version,
            recorded = artifact.file_size_bytes,
            on_disk = len,
            "Artifact size differs from metadata"
        );
    }

    let headers = [
        (
            header::CONTENT_TYPE,
            "application/octet-stream".to_string(),
        ),
        (
            header::CONTENT_LENGTH,
            len.to_string(),
        ),
        (
            header::CONTENT_DISPOSITION,
            content_disposition(&artifact.file_name),
        ),
        (
            header::HeaderName::from_static(CHECKSUM_HEADER),
            artifact.sha256.clone(),
        ),
    ];
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

async fn delete_artifact(
    State(state): State<AppState>,
    Path((key, version)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.coordinator.delete_artifact(&key, &version).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Admin ===

#[derive(Debug, Default, Deserialize)]
struct VerifyQuery {
    #[serde(default)]
    deep: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RepairQuery {
    #[serde(default)]
    dry_run: bool,
}

async fn admin_verify(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> ApiResult<Json<VerifyReport>> {
    let coordinator = &state.coordinator;
    let report = verify_store(
        coordinator.metadata().as_ref(),
        coordinator.content(),
        query.deep,
    )
    .await?;
    Ok(Json(report))
}

async fn admin_repair(
    State(state): State<AppState>,
    Query(query): Query<RepairQuery>,
) -> ApiResult<Json<RepairReport>> {
    let report = state.coordinator.repair_orphans(query.dry_run).await?;
    Ok(Json(report))
}

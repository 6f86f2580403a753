//! HTTP server for the daemon API.
//!
//! POST and DELETE requests carry JSON bodies, GET requests take query
//! parameters. Create and mount return a bare string (UUID, mount point or
//! backup URL) as `text/plain` unless the request asks for verbose output,
//! which is returned as JSON.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use convoy_storage::{escape_url, DriverInfo, StorageError};

use crate::api::{
    BackupCreateRequest, BackupDeleteRequest, BackupInspectQuery, BackupListQuery, DaemonInfo,
    SnapshotCreateRequest, SnapshotDeleteRequest, SnapshotInspectQuery, SnapshotResponse,
    VolumeCreateRequest, VolumeDeleteRequest, VolumeInspectQuery, VolumeListQuery,
    VolumeMountRequest, VolumeResponse, VolumeUmountRequest,
};
use crate::daemon::Daemon;
use crate::error::DaemonError;

/// Shared state for HTTP handlers.
pub struct AppState {
    pub daemon: Arc<Daemon>,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
    message: String,
}

impl ApiError {
    fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

fn status_of(err: &DaemonError) -> StatusCode {
    match err {
        DaemonError::Validation(_) => StatusCode::BAD_REQUEST,
        DaemonError::Conflict(_) => StatusCode::CONFLICT,
        DaemonError::NotFound(_) => StatusCode::NOT_FOUND,
        DaemonError::NotSupported(_) => StatusCode::NOT_IMPLEMENTED,
        DaemonError::Driver { source, .. } => match source {
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            StorageError::InvalidArgument(_) | StorageError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            StorageError::AlreadyExists(_) | StorageError::Busy(_) => StatusCode::CONFLICT,
            StorageError::NotSupported { .. } => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        DaemonError::Invariant(_) | DaemonError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(operation: &str, err: DaemonError) -> (StatusCode, Json<ApiError>) {
    let status = status_of(&err);
    if status.is_server_error() {
        error!(operation, error = %err, "Request failed");
    } else {
        warn!(operation, error = %err, "Request rejected");
    }
    (status, Json(ApiError::new(&format!("{}_failed", operation), &err.to_string())))
}

fn bare_or_verbose<T: Serialize>(verbose: bool, bare: String, full: T) -> Response {
    if verbose {
        Json(full).into_response()
    } else {
        bare.into_response()
    }
}

// ============================================================================
// Server
// ============================================================================

/// Serve the API on `addr` until the listener fails.
pub async fn run_http_server(addr: SocketAddr, daemon: Arc<Daemon>) -> anyhow::Result<()> {
    let app = build_router(daemon);

    info!(address = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Router with every API route.
pub fn build_router(daemon: Arc<Daemon>) -> Router {
    let state = Arc::new(AppState { daemon });

    Router::new()
        .route("/info", get(get_info))
        // Volume endpoints
        .route("/volumes/create", post(create_volume))
        .route("/volumes", axum::routing::delete(delete_volume))
        .route("/volumes/mount", post(mount_volume))
        .route("/volumes/umount", post(umount_volume))
        .route("/volumes/inspect", get(inspect_volume))
        .route("/volumes/list", get(list_volumes))
        // Snapshot endpoints
        .route("/snapshots/create", post(create_snapshot))
        .route("/snapshots", axum::routing::delete(delete_snapshot))
        .route("/snapshots/inspect", get(inspect_snapshot))
        // Backup endpoints
        .route("/backups/create", post(create_backup))
        .route("/backups", axum::routing::delete(delete_backup))
        .route("/backups/inspect", get(inspect_backup))
        .route("/backups/list", get(list_backups))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

async fn get_info(State(state): State<Arc<AppState>>) -> ApiResult<Json<DaemonInfo>> {
    state
        .daemon
        .info()
        .await
        .map(Json)
        .map_err(|e| api_error("info", e))
}

async fn create_volume(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VolumeCreateRequest>,
) -> ApiResult<Response> {
    let verbose = request.verbose;
    let volume = state
        .daemon
        .create_volume(request)
        .await
        .map_err(|e| api_error("create_volume", e))?;
    Ok(bare_or_verbose(verbose, volume.uuid.clone(), volume))
}

async fn delete_volume(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VolumeDeleteRequest>,
) -> ApiResult<StatusCode> {
    state
        .daemon
        .delete_volume(request)
        .await
        .map_err(|e| api_error("delete_volume", e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mount_volume(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VolumeMountRequest>,
) -> ApiResult<Response> {
    let verbose = request.verbose;
    let volume = state
        .daemon
        .mount_volume(request)
        .await
        .map_err(|e| api_error("mount_volume", e))?;
    Ok(bare_or_verbose(verbose, volume.mount_point.clone().unwrap_or_default(), volume))
}

async fn umount_volume(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VolumeUmountRequest>,
) -> ApiResult<StatusCode> {
    state
        .daemon
        .umount_volume(request)
        .await
        .map_err(|e| api_error("umount_volume", e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn inspect_volume(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VolumeInspectQuery>,
) -> ApiResult<Json<VolumeResponse>> {
    state
        .daemon
        .inspect_volume(&query.volume)
        .await
        .map(Json)
        .map_err(|e| api_error("inspect_volume", e))
}

async fn list_volumes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VolumeListQuery>,
) -> ApiResult<Json<BTreeMap<String, VolumeResponse>>> {
    state
        .daemon
        .list_volumes(query)
        .await
        .map(Json)
        .map_err(|e| api_error("list_volumes", e))
}

async fn create_snapshot(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SnapshotCreateRequest>,
) -> ApiResult<Response> {
    let verbose = request.verbose;
    let snapshot = state
        .daemon
        .create_snapshot(request)
        .await
        .map_err(|e| api_error("create_snapshot", e))?;
    Ok(bare_or_verbose(verbose, snapshot.uuid.clone(), snapshot))
}

async fn delete_snapshot(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SnapshotDeleteRequest>,
) -> ApiResult<StatusCode> {
    state
        .daemon
        .delete_snapshot(&request.snapshot)
        .await
        .map_err(|e| api_error("delete_snapshot", e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn inspect_snapshot(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SnapshotInspectQuery>,
) -> ApiResult<Json<SnapshotResponse>> {
    state
        .daemon
        .inspect_snapshot(&query.snapshot)
        .await
        .map(Json)
        .map_err(|e| api_error("inspect_snapshot", e))
}

async fn create_backup(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BackupCreateRequest>,
) -> ApiResult<Response> {
    let verbose = request.verbose;
    let backup = state
        .daemon
        .create_backup(request)
        .await
        .map_err(|e| api_error("create_backup", e))?;
    Ok(bare_or_verbose(verbose, escape_url(&backup.url), backup))
}

async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BackupDeleteRequest>,
) -> ApiResult<StatusCode> {
    state
        .daemon
        .delete_backup(&request.url)
        .await
        .map_err(|e| api_error("delete_backup", e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn inspect_backup(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BackupInspectQuery>,
) -> ApiResult<Json<DriverInfo>> {
    state
        .daemon
        .inspect_backup(&query.url)
        .await
        .map(Json)
        .map_err(|e| api_error("inspect_backup", e))
}

async fn list_backups(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BackupListQuery>,
) -> ApiResult<Json<BTreeMap<String, DriverInfo>>> {
    state
        .daemon
        .list_backups(query)
        .await
        .map(Json)
        .map_err(|e| api_error("list_backups", e))
}

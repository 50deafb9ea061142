use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use backup_engine::restore::RestoreOptions;
use backup_engine::service::RunStatus;
use backup_engine::transfer::BackupProgress;
use backup_engine::{BackupArchive, BackupJob, BackupResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_backups).post(start_backup))
        .route("/cancel", post(cancel_backup))
        .route("/status", get(backup_status))
        .route("/estimate", post(estimate_backup))
        .route("/{id}", delete(delete_backup))
        .route("/{id}/verify", post(verify_backup))
        .route("/{id}/restore", post(restore_backup))
}

#[derive(Deserialize)]
pub struct LocationQuery {
    pub location: Option<PathBuf>,
}

async fn list_backups(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LocationQuery>,
) -> Result<Json<Vec<BackupArchive>>, AppError> {
    let archives = state.service.get_backup_history(query.location.as_deref()).await?;
    Ok(Json(archives))
}

async fn start_backup(
    State(state): State<Arc<AppState>>,
    Json(job): Json<BackupJob>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let name = job.name.clone();
    let (_, handle) = state.service.spawn_backup(job, Some(state.observer.clone()))?;

    let last_result = state.last_result.clone();
    tokio::spawn(async move {
        match handle.await {
            Ok(result) => *last_result.lock().await = Some(result),
            Err(e) => tracing::error!("Backup task failed: {}", e),
        }
    });

    tracing::info!(job = %name, "Backup started via API");
    Ok((StatusCode::ACCEPTED, Json(json!({ "started": true, "job": name }))))
}

async fn cancel_backup(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let cancelled = state.service.cancel_active();
    Json(json!({ "cancelled": cancelled }))
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub running: Option<RunStatus>,
    pub progress: Option<BackupProgress>,
    pub last_result: Option<BackupResult>,
}

async fn backup_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        running: state.service.current_run(),
        progress: state.latest_progress(),
        last_result: state.last_result.lock().await.clone(),
    })
}

async fn estimate_backup(
    State(state): State<Arc<AppState>>,
    Json(job): Json<BackupJob>,
) -> Result<Json<serde_json::Value>, AppError> {
    let bytes = state.service.estimate_backup_size(&job).await?;
    Ok(Json(json!({ "job": job.name, "bytes": bytes })))
}

async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LocationQuery>,
) -> Result<Json<BackupResult>, AppError> {
    let archive = state.service.find_backup(query.location.as_deref(), &id).await?;
    Ok(Json(state.service.delete_backup(&archive).await?))
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct VerifyRequest {
    pub password: Option<String>,
}

async fn verify_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LocationQuery>,
    Json(body): Json<VerifyRequest>,
) -> Result<Json<BackupResult>, AppError> {
    let archive = state.service.find_backup(query.location.as_deref(), &id).await?;
    let result = state
        .service
        .verify_backup(&archive, Some(state.observer.clone()), body.password.as_deref())
        .await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
pub struct RestoreRequest {
    pub destination: PathBuf,
    #[serde(flatten)]
    pub options: RestoreOptions,
}

async fn restore_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LocationQuery>,
    Json(body): Json<RestoreRequest>,
) -> Result<Json<BackupResult>, AppError> {
    let archive = state.service.find_backup(query.location.as_deref(), &id).await?;
    let result = state
        .service
        .restore_backup(&archive, &body.destination, body.options, Some(state.observer.clone()), None)
        .await?;
    *state.last_result.lock().await = Some(result.clone());
    Ok(Json(result))
}

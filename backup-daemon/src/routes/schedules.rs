use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use backup_engine::schedule::BackupSchedule;
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_schedules).post(create_schedule))
        .route("/{id}", delete(delete_schedule))
}

async fn list_schedules(State(state): State<Arc<AppState>>) -> Json<Vec<BackupSchedule>> {
    Json(state.service.get_scheduled_backups().await)
}

async fn create_schedule(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BackupSchedule>,
) -> Result<(StatusCode, Json<BackupSchedule>), AppError> {
    let schedule = state.service.schedule_backup(body).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = Uuid::parse_str(&id).map_err(|_| AppError::BadRequest(format!("invalid schedule id: {}", id)))?;
    if state.service.remove_scheduled_backup(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("Schedule not found".into()))
    }
}

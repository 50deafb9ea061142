use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use backup_engine::fs::{DriveInfo, DriveSpace};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_drives))
        .route("/space", get(drive_space))
}

async fn list_drives(State(state): State<Arc<AppState>>) -> Result<Json<Vec<DriveInfo>>, AppError> {
    Ok(Json(state.service.get_available_drives().await?))
}

#[derive(Deserialize)]
pub struct SpaceQuery {
    pub path: Option<PathBuf>,
}

async fn drive_space(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SpaceQuery>,
) -> Result<Json<DriveSpace>, AppError> {
    let path = query
        .path
        .ok_or_else(|| AppError::BadRequest("path is required".into()))?;
    Ok(Json(state.service.get_drive_space(&path).await?))
}

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use backup_engine::EngineError;
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    /// Engine refusal with its stable error code
    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn engine_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::JobAlreadyRunning | EngineError::ArchiveInUse(_) => StatusCode::CONFLICT,
        EngineError::ArchiveNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidJob(_) | EngineError::Pattern(_) | EngineError::Schedule(_) => StatusCode::BAD_REQUEST,
        EngineError::InvalidPassword | EngineError::BrokenChain { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        EngineError::DestinationUnavailable { .. } | EngineError::SnapshotUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg, code) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone(), None),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone(), None),
            AppError::Engine(e) => {
                let status = engine_status(e);
                if status.is_server_error() {
                    tracing::error!(code = e.code(), "Engine error: {e}");
                }
                (status, e.to_string(), Some(e.code()))
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into(), None)
            }
        };
        let body = match code {
            Some(code) => json!({ "error": msg, "code": code }),
            None => json!({ "error": msg }),
        };
        (status, Json(body)).into_response()
    }
}

pub mod backups;
pub mod drives;
pub mod schedules;

use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/backups", backups::router())
        .nest("/api/schedules", schedules::router())
        .nest("/api/drives", drives::router())
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "busy": state.service.is_backup_in_progress(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;
    use crate::models::schedule::SqliteScheduleStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use backup_engine::{BackupService, EngineConfig};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(dir: &Path) -> Router {
        let pool = create_pool(&dir.join("daemon.db").to_string_lossy()).unwrap();
        migrate(&pool).unwrap();

        let mut engine = EngineConfig::default();
        engine.engine.default_destination = dir.join("dest");
        engine.transfer.workers = 2;
        let service = BackupService::new(engine).with_schedule_store(Arc::new(SqliteScheduleStore::new(pool.clone())));

        let config = AppConfig {
            port: 0,
            data_dir: dir.to_path_buf(),
            db_path: dir.join("daemon.db"),
            engine_config: None,
            schedule_tick: "0 * * * * *".into(),
            log_level: "info".into(),
        };
        create_router(Arc::new(AppState::new(pool, config, Arc::new(service))))
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn job(dir: &Path) -> serde_json::Value {
        serde_json::json!({
            "name": "docs",
            "source_paths": [dir.join("src")],
            "destination_path": dir.join("dest"),
        })
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let (status, body) = call(&app(dir.path()), Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["busy"], false);
    }

    #[tokio::test]
    async fn test_backup_runs_in_background() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.txt"), b"hello").unwrap();
        let app = app(dir.path());

        let (status, _) = call(&app, Method::POST, "/api/backups", Some(job(dir.path()))).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let mut finished = serde_json::Value::Null;
        for _ in 0..100 {
            let (_, body) = call(&app, Method::GET, "/api/backups/status", None).await;
            if !body["last_result"].is_null() {
                finished = body["last_result"].clone();
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(finished["status"], "completed");
        assert_eq!(finished["processed_files"], 1);

        let (status, history) = call(&app, Method::GET, "/api/backups", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history.as_array().map(Vec::len), Some(1));

        let id = history[0]["id"].as_str().unwrap().to_string();
        let (status, verified) =
            call(&app, Method::POST, &format!("/api/backups/{}/verify", id), Some(serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(verified["success"], true);

        let (status, _) = call(&app, Method::DELETE, "/api/backups/unknown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_job_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut body = job(dir.path());
        body["source_paths"] = serde_json::json!([]);
        let (status, error) = call(&app(dir.path()), Method::POST, "/api/backups", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error["code"], "INVALID_JOB");
    }

    #[tokio::test]
    async fn test_schedule_crud() {
        let dir = TempDir::new().unwrap();
        let app = app(dir.path());
        let schedule = serde_json::json!({
            "name": "nightly",
            "job": job(dir.path()),
            "frequency": "daily",
            "time_of_day": "02:00:00",
        });

        let (status, created) = call(&app, Method::POST, "/api/schedules", Some(schedule)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(!created["next_run"].is_null());

        let (_, list) = call(&app, Method::GET, "/api/schedules", None).await;
        assert_eq!(list.as_array().map(Vec::len), Some(1));

        let uri = format!("/api/schedules/{}", created["id"].as_str().unwrap());
        let (status, _) = call(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, Method::DELETE, "/api/schedules/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}

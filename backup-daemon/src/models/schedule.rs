use crate::db::connection::DbPool;
use async_trait::async_trait;
use backup_engine::schedule::{BackupSchedule, ScheduleStore};
use backup_engine::EngineError;
use rusqlite::{params, Connection};
use uuid::Uuid;

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<BackupSchedule>> {
    let mut stmt = conn.prepare("SELECT id, definition FROM schedules ORDER BY created_at")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

    let mut schedules = Vec::new();
    for r in rows {
        let (id, definition) = r?;
        match serde_json::from_str::<BackupSchedule>(&definition) {
            Ok(schedule) => schedules.push(schedule),
            Err(e) => tracing::warn!(schedule_id = %id, "Skipping unreadable schedule: {}", e),
        }
    }
    Ok(schedules)
}

pub fn upsert(conn: &Connection, schedule: &BackupSchedule) -> anyhow::Result<()> {
    let definition = serde_json::to_string(schedule)?;
    let last_status = schedule
        .last_result
        .as_ref()
        .and_then(|r| serde_json::to_value(r.status).ok())
        .and_then(|v| v.as_str().map(str::to_owned));

    conn.execute(
        "INSERT INTO schedules (id, name, enabled, definition, next_run, last_run, last_status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           enabled = excluded.enabled,
           definition = excluded.definition,
           next_run = excluded.next_run,
           last_run = excluded.last_run,
           last_status = excluded.last_status,
           updated_at = datetime('now')",
        params![
            schedule.id.to_string(),
            schedule.name,
            schedule.enabled as i32,
            definition,
            schedule.next_run.map(|t| t.to_rfc3339()),
            schedule.last_run.map(|t| t.to_rfc3339()),
            last_status,
        ],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, id: &Uuid) -> anyhow::Result<bool> {
    let changed = conn.execute("DELETE FROM schedules WHERE id = ?1", params![id.to_string()])?;
    Ok(changed > 0)
}

/// Schedule persistence for the engine, backed by the daemon database
pub struct SqliteScheduleStore {
    db: DbPool,
}

impl SqliteScheduleStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    async fn with_conn<T, F>(&self, f: F) -> backup_engine::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            f(&conn)
        })
        .await?
        .map_err(|e| EngineError::Schedule(format!("{e:#}")))
    }
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn load_all(&self) -> backup_engine::Result<Vec<BackupSchedule>> {
        self.with_conn(find_all).await
    }

    async fn upsert(&self, schedule: &BackupSchedule) -> backup_engine::Result<()> {
        let schedule = schedule.clone();
        self.with_conn(move |conn| upsert(conn, &schedule)).await
    }

    async fn remove(&self, id: Uuid) -> backup_engine::Result<bool> {
        self.with_conn(move |conn| delete(conn, &id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;
    use backup_engine::schedule::Frequency;
    use backup_engine::BackupJob;
    use chrono::NaiveTime;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_store_roundtrip() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let pool = create_pool(&dir.path().join("test.db").to_string_lossy())?;
        migrate(&pool)?;
        let store = SqliteScheduleStore::new(pool);

        let job = BackupJob::new("docs", vec![PathBuf::from("/data")], "/backups");
        let mut schedule = BackupSchedule::new("nightly", job, Frequency::Weekly, NaiveTime::from_hms_opt(1, 30, 0).unwrap());
        store.upsert(&schedule).await?;

        schedule.enabled = false;
        store.upsert(&schedule).await?;

        let loaded = store.load_all().await?;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, schedule.id);
        assert!(!loaded[0].enabled);
        assert_eq!(loaded[0].frequency, Frequency::Weekly);

        assert!(store.remove(schedule.id).await?);
        assert!(!store.remove(schedule.id).await?);
        assert!(store.load_all().await?.is_empty());
        Ok(())
    }
}

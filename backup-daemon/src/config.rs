use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /// Engine configuration file (TOML); engine defaults when unset
    pub engine_config: Option<PathBuf>,
    /// Cron expression (with seconds) of the due-schedule check
    pub schedule_tick: String,
    pub log_level: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(
            std::env::var("DATA_DIR").unwrap_or_else(|_| "/var/lib/backup-daemon".into()),
        );

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            db_path: data_dir.join("backup-daemon.db"),
            data_dir,
            engine_config: std::env::var("ENGINE_CONFIG").ok().map(PathBuf::from),
            schedule_tick: std::env::var("SCHEDULE_TICK").unwrap_or_else(|_| "0 * * * * *".into()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        }
    }
}

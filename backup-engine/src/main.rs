//! Backup Engine - command line entry point

use anyhow::{bail, Context, Result};
use backup_engine::restore::RestoreOptions;
use backup_engine::schedule::{parse_time_of_day, BackupSchedule, Frequency};
use backup_engine::transfer::{ProgressObserver, WatchObserver};
use backup_engine::{utils, BackupJob, BackupResult, BackupService, BackupType, EngineConfig};
use chrono::{NaiveTime, Utc, Weekday};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", env = "BACKUP_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a backup job described in a TOML or JSON file
    Backup {
        #[arg(short, long, value_name = "FILE")]
        job: PathBuf,

        /// Override the job's backup type
        #[arg(short = 't', long = "type")]
        backup_type: Option<TypeArg>,

        /// Password for encrypted jobs
        #[arg(long, env = "BACKUP_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Restore an archive and its chain
    Restore {
        /// Directory holding the archive
        #[arg(short = 'L', long)]
        location: Option<PathBuf>,

        #[arg(short, long)]
        archive: String,

        /// Restore root
        #[arg(long, value_name = "DIR")]
        to: PathBuf,

        #[arg(long)]
        overwrite: bool,

        #[arg(long)]
        preserve_permissions: bool,

        /// Write files back to their original absolute paths
        #[arg(long)]
        original: bool,

        /// Restore only these relative paths (files or directories)
        #[arg(long = "select", value_name = "PATH")]
        selection: Vec<String>,

        #[arg(long)]
        verify: bool,

        #[arg(long, env = "BACKUP_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// List archives, newest first
    History {
        #[arg(short = 'L', long)]
        location: Option<PathBuf>,
    },

    /// Re-hash an archive against its manifest
    Verify {
        #[arg(short = 'L', long)]
        location: Option<PathBuf>,

        #[arg(short, long)]
        archive: String,

        #[arg(long, env = "BACKUP_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Delete an archive and its payload
    Delete {
        #[arg(short = 'L', long)]
        location: Option<PathBuf>,

        #[arg(short, long)]
        archive: String,
    },

    /// Create a system image with the configured imaging program
    Image {
        #[arg(long, value_name = "DIR")]
        to: PathBuf,
    },

    /// Bytes the next run of a job would transfer
    Estimate {
        #[arg(short, long, value_name = "FILE")]
        job: PathBuf,
    },

    /// Drives that could hold a backup
    Drives,

    /// Free space at a path
    Space { path: PathBuf },

    #[command(subcommand)]
    Schedule(ScheduleCommand),
}

#[derive(Subcommand, Debug)]
enum ScheduleCommand {
    /// Add or replace a schedule
    Add {
        #[arg(short, long, value_name = "FILE")]
        job: PathBuf,

        #[arg(short, long)]
        name: String,

        #[arg(short, long)]
        frequency: FrequencyArg,

        /// Local time of day, HH:MM
        #[arg(long, value_parser = parse_time)]
        time: NaiveTime,

        #[arg(long, value_parser = parse_weekday)]
        day_of_week: Option<Weekday>,

        #[arg(long)]
        day_of_month: Option<u32>,

        #[arg(long)]
        interval_minutes: Option<u32>,
    },

    List,

    Remove { id: Uuid },

    /// Run every due schedule once, then exit
    RunDue,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TypeArg {
    Full,
    Incremental,
    Differential,
    Mirror,
}

impl From<TypeArg> for BackupType {
    fn from(arg: TypeArg) -> Self {
        match arg {
            TypeArg::Full => BackupType::Full,
            TypeArg::Incremental => BackupType::Incremental,
            TypeArg::Differential => BackupType::Differential,
            TypeArg::Mirror => BackupType::Mirror,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FrequencyArg {
    Once,
    Daily,
    Weekly,
    Monthly,
    Custom,
}

impl From<FrequencyArg> for Frequency {
    fn from(arg: FrequencyArg) -> Self {
        match arg {
            FrequencyArg::Once => Frequency::Once,
            FrequencyArg::Daily => Frequency::Daily,
            FrequencyArg::Weekly => Frequency::Weekly,
            FrequencyArg::Monthly => Frequency::Monthly,
            FrequencyArg::Custom => Frequency::Custom,
        }
    }
}

fn parse_time(value: &str) -> std::result::Result<NaiveTime, String> {
    parse_time_of_day(value).ok_or_else(|| format!("invalid time of day: {}", value))
}

fn parse_weekday(value: &str) -> std::result::Result<Weekday, String> {
    value
        .parse::<Weekday>()
        .map_err(|_| format!("invalid weekday: {}", value))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = EngineConfig::load(args.config.as_deref())?;
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!("backup-engine v{}", env!("CARGO_PKG_VERSION"));

    let service = BackupService::new(config);

    match args.command {
        Command::Backup {
            job,
            backup_type,
            password,
        } => {
            let mut job = load_job(&job)?;
            if let Some(backup_type) = backup_type {
                job.backup_type = backup_type.into();
            }
            if password.is_some() {
                job.password = password;
            }
            let (observer, cancel) = watch_run();
            let result = service.create_backup(&job, Some(observer), Some(cancel)).await?;
            finish(&result)
        }

        Command::Restore {
            location,
            archive,
            to,
            overwrite,
            preserve_permissions,
            original,
            selection,
            verify,
            password,
        } => {
            let archive = service.find_backup(location.as_deref(), &archive).await?;
            let options = RestoreOptions {
                overwrite_existing: overwrite,
                preserve_permissions,
                restore_to_original: original,
                alternate_destination: None,
                selective_files: (!selection.is_empty()).then_some(selection),
                verify_after_restore: verify,
                password,
            };
            let (observer, cancel) = watch_run();
            let result = service
                .restore_backup(&archive, &to, options, Some(observer), Some(cancel))
                .await?;
            finish(&result)
        }

        Command::History { location } => {
            print_json(&service.get_backup_history(location.as_deref()).await?)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Verify {
            location,
            archive,
            password,
        } => {
            let archive = service.find_backup(location.as_deref(), &archive).await?;
            let (observer, _) = watch_run();
            let result = service
                .verify_backup(&archive, Some(observer), password.as_deref())
                .await?;
            finish(&result)
        }

        Command::Delete { location, archive } => {
            let archive = service.find_backup(location.as_deref(), &archive).await?;
            let result = service.delete_backup(&archive).await?;
            finish(&result)
        }

        Command::Image { to } => {
            let (observer, cancel) = watch_run();
            let result = service.create_system_image(&to, Some(observer), Some(cancel)).await?;
            finish(&result)
        }

        Command::Estimate { job } => {
            let job = load_job(&job)?;
            let bytes = service.estimate_backup_size(&job).await?;
            print_json(&serde_json::json!({ "job": job.name, "bytes": bytes }))?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Drives => {
            print_json(&service.get_available_drives().await?)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Space { path } => {
            print_json(&service.get_drive_space(&path).await?)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Schedule(command) => {
            service.init().await.context("failed to load schedules")?;
            run_schedule_command(&service, command).await
        }
    }
}

async fn run_schedule_command(service: &BackupService, command: ScheduleCommand) -> Result<ExitCode> {
    match command {
        ScheduleCommand::Add {
            job,
            name,
            frequency,
            time,
            day_of_week,
            day_of_month,
            interval_minutes,
        } => {
            let mut schedule = BackupSchedule::new(name, load_job(&job)?, frequency.into(), time);
            schedule.day_of_week = day_of_week;
            schedule.day_of_month = day_of_month;
            schedule.interval_minutes = interval_minutes;
            print_json(&service.schedule_backup(schedule).await?)?;
        }
        ScheduleCommand::List => print_json(&service.get_scheduled_backups().await)?,
        ScheduleCommand::Remove { id } => {
            if !service.remove_scheduled_backup(id).await? {
                bail!("no schedule with id {}", id);
            }
        }
        ScheduleCommand::RunDue => {
            let ran = service.run_due_schedules(Utc::now()).await?;
            tracing::info!(count = ran.len(), "Due schedules processed");
            print_json(&ran)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Job files are TOML unless they end in `.json`
fn load_job(path: &Path) -> Result<BackupJob> {
    let text = std::fs::read_to_string(path).with_context(|| format!("cannot read job file {}", path.display()))?;
    let job = if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json")) {
        serde_json::from_str(&text)?
    } else {
        toml::from_str(&text)?
    };
    Ok(job)
}

/// Progress goes to the log; Ctrl-C cancels the run
fn watch_run() -> (Arc<dyn ProgressObserver>, CancellationToken) {
    let (observer, mut rx) = WatchObserver::new();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let latest = rx.borrow_and_update().clone();
            if let Some(p) = latest {
                tracing::info!(
                    phase = ?p.phase,
                    files = p.processed_files,
                    total = p.total_files,
                    "{:.1}% {}",
                    p.percent_complete,
                    p.current_file.as_deref().unwrap_or(&p.operation)
                );
            }
        }
    });

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            on_signal.cancel();
        }
    });
    (Arc::new(observer), cancel)
}

fn finish(result: &BackupResult) -> Result<ExitCode> {
    tracing::info!("{}", result.summary(10));
    print_json(result)?;
    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub mod backup_scheduler;

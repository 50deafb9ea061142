//! Byte-level progress tracking for backup, restore and verification runs.
//!
//! Counters only ever grow within a run. Throughput and ETA come from a moving
//! window of recent byte deltas rather than the run average.

use super::observer::ProgressObserver;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    #[default]
    Preparing,
    Scanning,
    Transferring,
    Verifying,
    Retention,
    Restoring,
    Imaging,
}

/// Point-in-time view of a run, emitted many times and never persisted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupProgress {
    pub phase: ProgressPhase,
    pub operation: String,

    /// Current file being processed
    pub current_file: Option<String>,
    pub current_file_bytes: u64,
    pub current_file_total: u64,

    pub total_files: usize,
    pub processed_files: usize,
    pub skipped_files: usize,
    pub failed_files: usize,

    pub total_bytes: u64,
    pub processed_bytes: u64,

    /// Percentage complete (0-100)
    pub percent_complete: f64,

    pub elapsed_seconds: u64,
    pub eta_seconds: Option<u64>,
    pub bytes_per_second: u64,
}

/// Progress tracker with windowed speed calculation and throttled delivery
pub struct ProgressTracker {
    observer: Option<Arc<dyn ProgressObserver>>,
    start_time: Instant,
    interval: Duration,
    window: Duration,
    last_emit: Option<Instant>,
    /// (time, bytes moved so far) samples inside the window
    samples: VecDeque<(Instant, u64)>,
    /// Every byte read or written, including files later rolled back
    moved_bytes: u64,
    progress: BackupProgress,
}

impl ProgressTracker {
    pub fn new(observer: Option<Arc<dyn ProgressObserver>>, interval: Duration, window: Duration) -> Self {
        let now = Instant::now();
        let mut samples = VecDeque::new();
        samples.push_back((now, 0));
        Self {
            observer,
            start_time: now,
            interval,
            window,
            last_emit: None,
            samples,
            moved_bytes: 0,
            progress: BackupProgress::default(),
        }
    }

    /// Enter a new phase; always emitted
    pub fn phase(&mut self, phase: ProgressPhase, operation: impl Into<String>) {
        self.progress.phase = phase;
        self.progress.operation = operation.into();
        self.progress.current_file = None;
        self.progress.current_file_bytes = 0;
        self.progress.current_file_total = 0;
        self.emit(true);
    }

    /// Set the totals of the current phase. Counters are kept; totals never shrink below them.
    pub fn set_totals(&mut self, total_files: usize, total_bytes: u64) {
        let p = &mut self.progress;
        p.total_files = total_files.max(p.processed_files + p.skipped_files + p.failed_files);
        p.total_bytes = total_bytes.max(p.processed_bytes);
        self.emit(true);
    }

    /// A file was discovered during enumeration (byte totals still unknown)
    pub fn scanned(&mut self, path: &str, size: u64) {
        self.progress.total_files += 1;
        self.progress.total_bytes += size;
        self.progress.current_file = Some(path.to_string());
        self.emit(false);
    }

    /// Work started on a file
    pub fn start_file(&mut self, path: &str, size: u64) {
        self.progress.current_file = Some(path.to_string());
        self.progress.current_file_bytes = 0;
        self.progress.current_file_total = size;
        self.emit(false);
    }

    /// A chunk of the current file was handled; throttled
    pub fn chunk(&mut self, bytes: u64) {
        self.progress.current_file_bytes += bytes;
        self.moved_bytes += bytes;
        self.emit(false);
    }

    /// A file was fully committed; always emitted
    pub fn file_done(&mut self, bytes: u64) {
        self.progress.processed_files += 1;
        self.progress.processed_bytes += bytes;
        self.progress.current_file_bytes = self.progress.current_file_total;
        self.emit(true);
    }

    pub fn file_failed(&mut self) {
        self.progress.failed_files += 1;
        self.emit(true);
    }

    pub fn file_skipped(&mut self) {
        self.progress.skipped_files += 1;
        self.emit(false);
    }

    /// Force delivery of the current state
    pub fn flush(&mut self) {
        self.emit(true);
    }

    /// Get total elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get current progress
    pub fn progress(&self) -> &BackupProgress {
        &self.progress
    }

    fn emit(&mut self, force: bool) {
        let now = Instant::now();
        self.record_sample(now);

        if !force {
            if let Some(last) = self.last_emit {
                if now.duration_since(last) < self.interval {
                    return;
                }
            }
        }
        self.last_emit = Some(now);

        self.update_rates(now);
        if let Some(observer) = &self.observer {
            observer.on_progress(&self.progress);
        }
    }

    fn record_sample(&mut self, now: Instant) {
        self.samples.push_back((now, self.moved_bytes));
        // Keep one sample older than the window as the delta baseline
        while self.samples.len() > 2
            && self
                .samples
                .get(1)
                .is_some_and(|(t, _)| now.duration_since(*t) >= self.window)
        {
            self.samples.pop_front();
        }
    }

    fn update_rates(&mut self, now: Instant) {
        let p = &mut self.progress;
        p.elapsed_seconds = now.duration_since(self.start_time).as_secs();

        if let (Some((t0, b0)), Some((t1, b1))) = (self.samples.front(), self.samples.back()) {
            let secs = t1.duration_since(*t0).as_secs_f64();
            if secs > 0.0 {
                p.bytes_per_second = (b1.saturating_sub(*b0) as f64 / secs) as u64;
            }
        }

        p.eta_seconds = if p.bytes_per_second > 0 {
            Some(p.total_bytes.saturating_sub(p.processed_bytes) / p.bytes_per_second)
        } else {
            None
        };

        // Byte ratio when bytes are known, file ratio otherwise
        let computed = if p.total_bytes > 0 {
            (p.processed_bytes + p.current_file_bytes.min(p.current_file_total)) as f64 / p.total_bytes as f64 * 100.0
        } else if p.total_files > 0 {
            (p.processed_files + p.skipped_files + p.failed_files) as f64 / p.total_files as f64 * 100.0
        } else {
            0.0
        };
        p.percent_complete = p.percent_complete.max(computed.min(100.0));
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

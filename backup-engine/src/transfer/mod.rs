//! Progress reporting shared by every long-running operation.

pub mod observer;
pub mod progress;

pub use observer::{BroadcastObserver, ProgressObserver, WatchObserver};
pub use progress::{BackupProgress, ProgressPhase, ProgressTracker};

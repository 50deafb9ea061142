//! Delivery of progress snapshots to callers.
//!
//! Observers are called synchronously from the pipeline and must not block.
//! The two channel adapters bound their buffering so a slow consumer can
//! never stall a run: the broadcast adapter drops the oldest ticks for a
//! lagging subscriber, the watch adapter keeps only the latest one.

use super::progress::BackupProgress;
use tokio::sync::{broadcast, watch};

pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: &BackupProgress);
}

impl<F> ProgressObserver for F
where
    F: Fn(&BackupProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &BackupProgress) {
        self(progress)
    }
}

/// Fan-out to any number of subscribers with drop-oldest lag handling
pub struct BroadcastObserver {
    tx: broadcast::Sender<BackupProgress>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<BackupProgress>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupProgress> {
        self.tx.subscribe()
    }
}

impl ProgressObserver for BroadcastObserver {
    fn on_progress(&self, progress: &BackupProgress) {
        // No subscribers is fine
        let _ = self.tx.send(progress.clone());
    }
}

/// Latest-value channel; intermediate ticks coalesce
pub struct WatchObserver {
    tx: watch::Sender<Option<BackupProgress>>,
}

impl WatchObserver {
    pub fn new() -> (Self, watch::Receiver<Option<BackupProgress>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<BackupProgress>> {
        self.tx.subscribe()
    }

    /// Latest snapshot delivered so far
    pub fn latest(&self) -> Option<BackupProgress> {
        self.tx.borrow().clone()
    }
}

impl ProgressObserver for WatchObserver {
    fn on_progress(&self, progress: &BackupProgress) {
        self.tx.send_replace(Some(progress.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(files: usize) -> BackupProgress {
        BackupProgress {
            processed_files: files,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_broadcast_drops_oldest_for_lagging_subscriber() {
        let (observer, mut rx) = BroadcastObserver::new(2);
        for i in 1..=5 {
            observer.on_progress(&tick(i));
        }

        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap().processed_files, 4);
        assert_eq!(rx.recv().await.unwrap().processed_files, 5);
    }

    #[tokio::test]
    async fn test_watch_coalesces_to_latest() {
        let (observer, mut rx) = WatchObserver::new();
        for i in 1..=5 {
            observer.on_progress(&tick(i));
        }

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().processed_files, 5);
        assert_eq!(observer.latest().unwrap().processed_files, 5);
    }

    #[test]
    fn test_closure_observer() {
        let count = std::sync::atomic::AtomicUsize::new(0);
        let observer = |_: &BackupProgress| {
            count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        };
        observer.on_progress(&tick(1));
        observer.on_progress(&tick(2));
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}

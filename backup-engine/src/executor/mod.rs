//! Transfer pipeline: moves selected files into an archive sink.
//!
//! A dispatcher walks the selected files in order and hands each one to a
//! blocking reader task, bounded by a semaphore. Readers hash, compress and
//! encrypt chunks and stream them through a small per-file channel. A single
//! writer task consumes files in dispatch order, so the destination only ever
//! sees one writer and the manifest keeps the enumeration order.
//!
//! Cancellation is checked before a file is dispatched and again before it
//! is committed. A file that fails to read is rolled back out of the sink and
//! recorded; a failing destination write aborts the whole transfer.

pub mod codec;
pub mod manifest;
pub mod strategy;
pub mod writer;

use crate::config::TransferConfig;
use crate::fs::walker::FileInfo;
use crate::result::{BackupError, BackupErrorKind};
use crate::transfer::progress::ProgressTracker;
use crate::utils::errors::{EngineError, Result};
use codec::FrameCodec;
use manifest::BackupFileEntry;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use writer::ArchiveSink;

/// A file to transfer and where its bytes are read from (snapshot or live path)
#[derive(Debug, Clone)]
pub struct TransferItem {
    pub info: FileInfo,
    pub read_path: PathBuf,
}

/// What the pipeline committed
#[derive(Debug, Default)]
pub struct TransferOutcome {
    pub entries: Vec<BackupFileEntry>,
    pub errors: Vec<BackupError>,
    pub cancelled: bool,
    /// Destination failure that stopped the transfer
    pub fatal: Option<EngineError>,
}

enum FileEvent {
    Frame { data: Vec<u8>, plain_len: u64 },
    Finished { hash: String, bytes: u64 },
    Failed(BackupError),
}

struct PendingFile {
    info: FileInfo,
    events: mpsc::Receiver<FileEvent>,
}

/// Main backup executor
pub struct BackupExecutor {
    config: TransferConfig,
    codec: FrameCodec,
    cancel_token: CancellationToken,
}

impl BackupExecutor {
    pub fn new(config: TransferConfig, codec: FrameCodec, cancel_token: CancellationToken) -> Self {
        Self {
            config,
            codec,
            cancel_token,
        }
    }

    /// Transfer `items` into `sink`. The sink and tracker are handed back so
    /// the caller can finalize the container and keep reporting.
    pub async fn execute(
        &self,
        items: Vec<TransferItem>,
        sink: ArchiveSink,
        tracker: ProgressTracker,
    ) -> Result<(TransferOutcome, ArchiveSink, ProgressTracker)> {
        let workers = self.config.workers.max(1);
        info!(files = items.len(), workers, "Starting transfer");

        let (pending_tx, pending_rx) = mpsc::channel::<PendingFile>(workers);
        let semaphore = Arc::new(Semaphore::new(workers));

        let dispatcher = {
            let cancel = self.cancel_token.clone();
            let codec = self.codec.clone();
            let chunk_size = self.config.chunk_size;
            let frame_buffer = self.config.frame_buffer.max(1);

            tokio::spawn(async move {
                let total = items.len();
                let mut dispatched = 0;
                for item in items {
                    if cancel.is_cancelled() {
                        break;
                    }

                    let permit = tokio::select! {
                        permit = semaphore.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                        _ = cancel.cancelled() => break,
                    };

                    let (tx, rx) = mpsc::channel(frame_buffer);
                    let codec = codec.clone();
                    let read_path = item.read_path.clone();
                    let source_path = item.info.path.clone();
                    tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        read_file(&read_path, &source_path, chunk_size, &codec, &tx);
                    });

                    let pending = PendingFile {
                        info: item.info,
                        events: rx,
                    };
                    if pending_tx.send(pending).await.is_err() {
                        // Writer stopped
                        break;
                    }
                    dispatched += 1;
                }
                dispatched == total
            })
        };

        let cancel = self.cancel_token.clone();
        let writer = tokio::task::spawn_blocking(move || write_files(pending_rx, sink, tracker, &cancel));

        let (mut outcome, sink, tracker) = writer.await?;
        let dispatched_all = dispatcher.await?;
        if !dispatched_all && self.cancel_token.is_cancelled() {
            outcome.cancelled = true;
        }

        info!(
            committed = outcome.entries.len(),
            failed = outcome.errors.len(),
            cancelled = outcome.cancelled,
            "Transfer finished"
        );
        Ok((outcome, sink, tracker))
    }
}

/// Reader side: runs on the blocking pool, one call per file.
/// Errors name `source_path` even when reading through a snapshot.
fn read_file(
    read_path: &Path,
    source_path: &Path,
    chunk_size: usize,
    codec: &FrameCodec,
    tx: &mpsc::Sender<FileEvent>,
) {
    let path = source_path;
    let mut file = match std::fs::File::open(read_path) {
        Ok(file) => file,
        Err(e) => {
            let _ = tx.blocking_send(FileEvent::Failed(BackupError::io(BackupErrorKind::Read, path, &e)));
            return;
        }
    };

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut total = 0u64;

    loop {
        let n = match read_chunk(&mut file, &mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = tx.blocking_send(FileEvent::Failed(BackupError::io(BackupErrorKind::Read, path, &e)));
                return;
            }
        };

        let chunk = &buf[..n];
        hasher.update(chunk);
        let data = match codec.encode(chunk) {
            Ok(data) => data,
            Err(e) => {
                let mut err = BackupError::new(BackupErrorKind::Write, Some(path), e.to_string());
                err.code = Some(e.code().to_string());
                let _ = tx.blocking_send(FileEvent::Failed(err));
                return;
            }
        };

        total += n as u64;
        if tx
            .blocking_send(FileEvent::Frame {
                data,
                plain_len: n as u64,
            })
            .is_err()
        {
            // Writer gave up on this file
            return;
        }
    }

    let _ = tx.blocking_send(FileEvent::Finished {
        hash: format!("{:x}", hasher.finalize()),
        bytes: total,
    });
}

/// Fill `buf` as far as possible; short only at end of file
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Writer side: the only code touching the sink
fn write_files(
    mut pending_rx: mpsc::Receiver<PendingFile>,
    mut sink: ArchiveSink,
    mut tracker: ProgressTracker,
    cancel: &CancellationToken,
) -> (TransferOutcome, ArchiveSink, ProgressTracker) {
    let mut outcome = TransferOutcome::default();
    let sink_path = sink.path().to_path_buf();

    while let Some(mut pending) = pending_rx.blocking_recv() {
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            break;
        }

        let info = &pending.info;
        tracker.start_file(&info.relative_path, info.size);
        if let Err(e) = sink.begin(info) {
            outcome.fatal = Some(EngineError::destination(&sink_path, e));
            break;
        }

        let mut finished = None;
        let mut write_error = None;
        while let Some(event) = pending.events.blocking_recv() {
            match event {
                FileEvent::Frame { data, plain_len } => {
                    if let Err(e) = sink.write(&data) {
                        write_error = Some(e);
                        break;
                    }
                    tracker.chunk(plain_len);
                }
                FileEvent::Finished { hash, bytes } => {
                    finished = Some(Ok((hash, bytes)));
                    break;
                }
                FileEvent::Failed(err) => {
                    finished = Some(Err(err));
                    break;
                }
            }
        }

        if let Some(e) = write_error {
            let _ = sink.rollback();
            outcome.fatal = Some(EngineError::destination(&sink_path, e));
            break;
        }

        match finished {
            Some(Ok((hash, bytes))) => {
                if cancel.is_cancelled() {
                    if let Err(e) = sink.rollback() {
                        outcome.fatal = Some(EngineError::destination(&sink_path, e));
                    }
                    outcome.cancelled = true;
                    break;
                }

                match sink.commit(info) {
                    Ok((location, stored_hash)) => {
                        debug!(path = %info.relative_path, bytes, "Committed file");
                        outcome.entries.push(BackupFileEntry {
                            relative_path: info.relative_path.clone(),
                            original_path: info.path.clone(),
                            size: bytes,
                            modified: info.modified,
                            hash,
                            attributes: info.attributes.clone(),
                            location,
                            stored_hash,
                        });
                        tracker.file_done(bytes);
                    }
                    Err(e) => {
                        let _ = sink.rollback();
                        outcome.fatal = Some(EngineError::destination(&sink_path, e));
                        break;
                    }
                }
            }
            Some(Err(err)) => {
                warn!(path = %info.path.display(), "Failed to back up file: {}", err.message);
                if let Err(e) = sink.rollback() {
                    outcome.fatal = Some(EngineError::destination(&sink_path, e));
                    break;
                }
                outcome.errors.push(err);
                tracker.file_failed();
            }
            None => {
                let _ = sink.rollback();
                outcome.errors.push(BackupError::new(
                    BackupErrorKind::Read,
                    Some(&info.path),
                    "reader stopped before the file was complete",
                ));
                tracker.file_failed();
            }
        }
    }

    (outcome, sink, tracker)
}

//! Single active run slot.

use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Backup,
    Restore,
    SystemImage,
}

/// Snapshot of the active run
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub kind: RunKind,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

struct ActiveRun {
    kind: RunKind,
    name: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    /// Archives read by a running restore
    protected: HashSet<String>,
}

#[derive(Clone, Default)]
pub(crate) struct ActiveSlot {
    inner: Arc<Mutex<Option<ActiveRun>>>,
}

impl ActiveSlot {
    fn slot(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        // A panic while holding the lock leaves plain data behind
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the slot or fail with `JobAlreadyRunning`
    pub fn acquire(&self, kind: RunKind, name: &str, cancel: Option<CancellationToken>) -> Result<RunGuard> {
        let mut slot = self.slot();
        if slot.is_some() {
            return Err(EngineError::JobAlreadyRunning);
        }
        let token = cancel.unwrap_or_default();
        *slot = Some(ActiveRun {
            kind,
            name: name.to_string(),
            started_at: Utc::now(),
            cancel: token.clone(),
            protected: HashSet::new(),
        });
        debug!(?kind, name, "Run slot acquired");
        Ok(RunGuard {
            slot: self.clone(),
            token,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.slot().is_some()
    }

    pub fn status(&self) -> Option<RunStatus> {
        self.slot().as_ref().map(|run| RunStatus {
            kind: run.kind,
            name: run.name.clone(),
            started_at: run.started_at,
            cancel_requested: run.cancel.is_cancelled(),
        })
    }

    pub fn cancel(&self) -> bool {
        match self.slot().as_ref() {
            Some(run) => {
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_protected(&self, archive_id: &str) -> bool {
        self.slot()
            .as_ref()
            .is_some_and(|run| run.protected.contains(archive_id))
    }
}

/// Holds the slot for one run; dropping it frees the slot
pub(crate) struct RunGuard {
    slot: ActiveSlot,
    token: CancellationToken,
}

impl RunGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Mark archives as in use until the run ends
    pub fn protect(&self, ids: impl IntoIterator<Item = String>) {
        if let Some(run) = self.slot.slot().as_mut() {
            run.protected.extend(ids);
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.slot.slot().take();
        debug!("Run slot released");
    }
}

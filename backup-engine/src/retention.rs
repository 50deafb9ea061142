//! Retention Manager: prunes old archives of a job by count and age.

use crate::job::BackupJob;
use crate::result::{BackupError, BackupErrorKind};
use crate::store::{ArchiveStore, BackupArchive};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_backups: Option<u32>,
    pub max_age_days: Option<u32>,
}

impl RetentionPolicy {
    pub fn for_job(job: &BackupJob) -> Self {
        Self {
            max_backups: job.max_backups_to_keep.filter(|n| *n > 0),
            max_age_days: job.max_age_days.filter(|d| *d > 0),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_backups.is_none() && self.max_age_days.is_none()
    }
}

/// Archives of `job_name` to delete.
///
/// The newest `max_backups` are kept, then survivors older than `max_age_days`
/// are dropped as well. Parents of retained incremental or differential
/// archives and ids in `protected` always stay. Mirror records share one tree
/// and are never pruned here.
pub fn plan(
    archives: &[BackupArchive],
    job_name: &str,
    policy: RetentionPolicy,
    now: DateTime<Utc>,
    protected: &HashSet<String>,
) -> Vec<BackupArchive> {
    let mut candidates: Vec<&BackupArchive> = archives
        .iter()
        .filter(|a| a.name == job_name && !a.is_mirror())
        .collect();
    candidates.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.id.cmp(&a.id)));

    let cutoff = policy.max_age_days.map(|days| now - Duration::days(i64::from(days)));
    let mut keep: HashSet<&str> = candidates
        .iter()
        .copied()
        .enumerate()
        .filter(|(rank, archive)| {
            let within_count = policy.max_backups.map_or(true, |max| *rank < max as usize);
            let within_age = cutoff.map_or(true, |cutoff| archive.created >= cutoff);
            within_count && within_age
        })
        .map(|(_, archive)| archive.id.as_str())
        .collect();
    keep.extend(protected.iter().map(String::as_str));

    // Pull in parents until every retained chain is complete
    let by_id: HashMap<&str, &BackupArchive> = archives.iter().map(|a| (a.id.as_str(), a)).collect();
    let mut pending: Vec<&str> = keep.iter().copied().collect();
    while let Some(id) = pending.pop() {
        let parent = by_id.get(id).and_then(|a| a.parent_id.as_deref());
        if let Some(parent) = parent {
            if keep.insert(parent) {
                pending.push(parent);
            }
        }
    }

    candidates
        .into_iter()
        .filter(|a| !keep.contains(a.id.as_str()))
        .cloned()
        .collect()
}

/// Apply the job's policy at its destination. Deletion failures become warnings.
pub async fn apply(
    store: &ArchiveStore,
    job: &BackupJob,
    protected: &HashSet<String>,
) -> (Vec<String>, Vec<BackupError>) {
    let policy = RetentionPolicy::for_job(job);
    if policy.is_unlimited() {
        return (Vec::new(), Vec::new());
    }

    let mut warnings = Vec::new();
    let archives = match store.list(&job.destination_path).await {
        Ok(archives) => archives,
        Err(e) => {
            warn!(job = %job.name, "Retention skipped, cannot list archives: {}", e);
            warnings.push(BackupError::new(
                BackupErrorKind::Retention,
                Some(&job.destination_path),
                e.to_string(),
            ));
            return (Vec::new(), warnings);
        }
    };

    let mut deleted = Vec::new();
    for archive in plan(&archives, &job.name, policy, Utc::now(), protected) {
        match store.delete(&archive).await {
            Ok(()) => {
                info!(job = %job.name, archive_id = %archive.id, "Retention removed archive");
                deleted.push(archive.id);
            }
            Err(e) => {
                warn!(archive_id = %archive.id, "Retention failed to delete archive: {}", e);
                warnings.push(BackupError::new(
                    BackupErrorKind::Retention,
                    Some(&archive.path),
                    e.to_string(),
                ));
            }
        }
    }
    (deleted, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{BackupCompression, BackupType};
    use crate::result::BackupStatus;
    use std::path::PathBuf;

    fn archive(id: &str, kind: BackupType, parent: Option<&str>, age_days: i64) -> BackupArchive {
        BackupArchive {
            id: id.into(),
            name: "job".into(),
            job_id: uuid::Uuid::nil(),
            backup_type: kind,
            destination: PathBuf::from("/dest"),
            path: PathBuf::from("/dest").join(id),
            created: Utc::now() - Duration::days(age_days) - Duration::minutes(1),
            total_size: 0,
            file_count: 0,
            stored_size: 0,
            compression: BackupCompression::None,
            is_encrypted: false,
            is_verified: false,
            status: BackupStatus::Completed,
            description: None,
            source_paths: Vec::new(),
            parent_id: parent.map(String::from),
            encryption: None,
            manifest: None,
        }
    }

    fn ids(archives: &[BackupArchive]) -> Vec<&str> {
        let mut ids: Vec<_> = archives.iter().map(|a| a.id.as_str()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_keep_newest_two_of_five() {
        let archives: Vec<_> = (0..5)
            .map(|i| archive(&format!("f{}", i), BackupType::Full, None, i))
            .collect();
        let policy = RetentionPolicy {
            max_backups: Some(2),
            max_age_days: None,
        };
        let doomed = plan(&archives, "job", policy, Utc::now(), &HashSet::new());
        assert_eq!(ids(&doomed), vec!["f2", "f3", "f4"]);
    }

    #[test]
    fn test_parents_of_retained_increments_survive() {
        let archives = vec![
            archive("i2", BackupType::Incremental, Some("i1"), 0),
            archive("i1", BackupType::Incremental, Some("f1"), 1),
            archive("f1", BackupType::Full, None, 2),
            archive("f0", BackupType::Full, None, 3),
        ];
        let policy = RetentionPolicy {
            max_backups: Some(1),
            max_age_days: None,
        };
        let doomed = plan(&archives, "job", policy, Utc::now(), &HashSet::new());
        assert_eq!(ids(&doomed), vec!["f0"]);
    }

    #[test]
    fn test_max_age_and_protected_set() {
        let archives = vec![
            archive("new", BackupType::Full, None, 0),
            archive("old", BackupType::Full, None, 40),
            archive("older", BackupType::Full, None, 50),
            archive("mirror", BackupType::Mirror, None, 90),
        ];
        let policy = RetentionPolicy {
            max_backups: None,
            max_age_days: Some(30),
        };
        let protected = HashSet::from(["older".to_string()]);
        let doomed = plan(&archives, "job", policy, Utc::now(), &protected);
        assert_eq!(ids(&doomed), vec!["old"]);
    }

    #[test]
    fn test_other_jobs_untouched() {
        let mut other = archive("x", BackupType::Full, None, 100);
        other.name = "other".into();
        let archives = vec![archive("a", BackupType::Full, None, 0), other];
        let policy = RetentionPolicy {
            max_backups: Some(1),
            max_age_days: Some(1),
        };
        assert!(plan(&archives, "job", policy, Utc::now(), &HashSet::new()).is_empty());
    }
}

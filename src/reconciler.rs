//! Merges usage snapshots into the accounting store.
//!
//! Each file is reconciled on its own: a missing project or allocation, an
//! unreadable file or a bad row only fails that file. Store errors halt the
//! batch. Upserts are keyed by (allocation, user), so replaying a file
//! leaves the store unchanged apart from history rows.

use crate::cache::UsageSnapshot;
use crate::error::{Notice, SyncError, SyncResult};
use crate::ledger::{MissingLedger, MissingRecord};
use crate::store::{AccountingStore, UpsertOutcome, UsageUpdate};
use chrono::NaiveDate;
use fs2::FileExt;
use regex::Regex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const LOCK_FILENAME: &str = ".reconcile.lock";

static USAGE_NUMBER: OnceLock<Option<Regex>> = OnceLock::new();

/// Splits a humanized size like `"12.5GB"` into `("12.5", "GB")`.
///
/// The number is the first `\d*\.?\d+` match; the unit is whatever remains
/// once it is removed, trimmed. `None` when there is no number.
pub fn split_usage(size_hum: &str) -> Option<(String, String)> {
    let re = USAGE_NUMBER
        .get_or_init(|| Regex::new(r"\d*\.?\d+").ok())
        .as_ref()?;
    let number = re.find(size_hum)?.as_str();
    let unit = size_hum.replace(number, "").trim().to_string();
    Some((number.to_string(), unit))
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub files: usize,
    pub created: usize,
    pub updated: usize,
    pub notices: Vec<Notice>,
    pub failures: Vec<(PathBuf, String)>,
    pub removed: Vec<PathBuf>,
}

/// Exclusive lock on `<data_dir>/.reconcile.lock`, released on drop.
pub struct ReconcileLock {
    file: File,
}

impl ReconcileLock {
    /// Blocks until no other reconciliation holds the lock.
    pub fn acquire(data_dir: &Path) -> SyncResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| SyncError::io(data_dir, e))?;
        let path = data_dir.join(LOCK_FILENAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| SyncError::io(&path, e))?;

        if file.try_lock_exclusive().is_err() {
            tracing::info!(path = %path.display(), "another reconciliation is running, waiting for lock");
            file.lock_exclusive()
                .map_err(|source| SyncError::Lock { path: path.clone(), source })?;
        }
        tracing::debug!(path = %path.display(), "reconciliation lock acquired");
        Ok(Self { file })
    }
}

impl Drop for ReconcileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Reconciles every file in `filepaths`, deleting each one after all of its
/// rows were applied when `cleanup_after` is set.
pub fn reconcile(
    store: &dyn AccountingStore,
    ledger: &MissingLedger,
    filepaths: &[PathBuf],
    cleanup_after: bool,
    today: NaiveDate,
) -> SyncResult<ReconcileReport> {
    let mut report = ReconcileReport::default();
    tracing::info!(files = filepaths.len(), cleanup_after, "reconciliation started");

    for path in filepaths {
        match reconcile_file(store, ledger, path, today, &mut report) {
            Ok(()) => {
                report.files += 1;
                if cleanup_after {
                    std::fs::remove_file(path).map_err(|e| SyncError::io(path, e))?;
                    tracing::debug!(path = %path.display(), "snapshot removed after reconciliation");
                    report.removed.push(path.clone());
                }
            }
            Err(e) if e.is_fatal_for_pass() => return Err(e),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "snapshot not reconciled");
                report.failures.push((path.clone(), e.to_string()));
            }
        }
    }

    tracing::info!(
        files = report.files,
        created = report.created,
        updated = report.updated,
        failures = report.failures.len(),
        "reconciliation complete"
    );
    Ok(report)
}

fn reconcile_file(
    store: &dyn AccountingStore,
    ledger: &MissingLedger,
    path: &Path,
    today: NaiveDate,
    report: &mut ReconcileReport,
) -> SyncResult<()> {
    let snapshot = UsageSnapshot::load(path)?;
    let usernames: Vec<String> = snapshot
        .contents
        .iter()
        .map(|row| row.username.clone())
        .collect();

    let (users, missing) = store.partition_users(&usernames)?;
    if !missing.is_empty() {
        let records: Vec<MissingRecord> = missing
            .iter()
            .map(|username| MissingRecord::User {
                username: username.clone(),
            })
            .collect();
        ledger.record(&records, today)?;
        for username in missing {
            let notice = Notice::MissingIdentity { username };
            tracing::warn!(project = %snapshot.project, "{}", notice);
            report.notices.push(notice);
        }
    }

    let Some(project) = store.find_project(&snapshot.project)? else {
        ledger.record(
            &[MissingRecord::Project {
                title: snapshot.project.clone(),
            }],
            today,
        )?;
        return Err(SyncError::MissingProject(snapshot.project));
    };

    let allocations = store.find_allocations(project.id, &snapshot.volume)?;
    let Some(&allocation_id) = allocations.first() else {
        ledger.record(
            &[MissingRecord::Allocation {
                resource_name: snapshot.volume.clone(),
                project_title: project.title.clone(),
                path: snapshot.path.clone(),
            }],
            today,
        )?;
        return Err(SyncError::MissingAllocation {
            project: project.title,
            resource: snapshot.volume,
        });
    };
    if allocations.len() > 1 {
        let notice = Notice::MultipleAllocations {
            project: project.title.clone(),
            resource: snapshot.volume.clone(),
            chosen: allocation_id,
            count: allocations.len(),
        };
        tracing::warn!("{}", notice);
        report.notices.push(notice);
    }

    tracing::debug!(
        project = %project.title,
        allocation_id,
        users = users.len(),
        path = %path.display(),
        "reconciling snapshot"
    );

    for user in users {
        // First row wins when a user appears more than once.
        let Some(row) = snapshot
            .contents
            .iter()
            .find(|row| row.username == user.username)
        else {
            continue;
        };
        let Some((usage, unit)) = split_usage(&row.size_sum_hum) else {
            tracing::warn!(username = %user.username, size = %row.size_sum_hum, "unparseable usage size, row skipped");
            continue;
        };
        let Ok(usage_bytes) = i64::try_from(row.size_sum) else {
            tracing::warn!(username = %user.username, size_sum = row.size_sum, "byte count out of range, row skipped");
            continue;
        };
        let usage: f64 = usage.parse().map_err(|_| {
            SyncError::Protocol(format!("usage '{}' is not a number", row.size_sum_hum))
        })?;

        let outcome = store.upsert_allocation_user(&UsageUpdate {
            allocation_id,
            user_id: user.id,
            usage_bytes,
            usage,
            unit,
        })?;
        match outcome {
            UpsertOutcome::Created => {
                tracing::info!(username = %user.username, allocation_id, "allocation user created");
                report.created += 1;
            }
            UpsertOutcome::Updated => report.updated += 1,
        }
        tracing::debug!(groupname = %row.groupname, username = %row.username, "usage entry saved");
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;

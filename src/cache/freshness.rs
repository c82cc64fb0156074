use super::snapshot::{date_stamp, snapshot_path};
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::LabPlan;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};

/// A (lab, resource) pair with no fresh snapshot, and where its new one goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectTarget {
    pub lab: String,
    pub volume: String,
    pub path: PathBuf,
}

/// A (lab, resource) pair already covered by one or two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatisfiedPair {
    pub lab: String,
    pub volume: String,
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreshnessReport {
    pub satisfied: Vec<SatisfiedPair>,
    pub to_collect: Vec<CollectTarget>,
}

impl FreshnessReport {
    /// Every existing snapshot path, yesterday's before today's per pair.
    pub fn filepaths(&self) -> Vec<PathBuf> {
        self.satisfied
            .iter()
            .flat_map(|pair| pair.paths.iter().cloned())
            .collect()
    }
}

/// Yesterday and today, in that order.
fn window(today: NaiveDate) -> [NaiveDate; 2] {
    [today.pred_opt().unwrap_or(today), today]
}

/// Splits every pair of `plan` into satisfied and to-collect.
///
/// When both yesterday's and today's file exist, both are reported.
pub fn check_freshness(plan: &LabPlan, today: NaiveDate, data_dir: &Path) -> FreshnessReport {
    let mut report = FreshnessReport::default();
    let dates = window(today);

    for (lab, resources) in plan {
        for resource in resources {
            let existing: Vec<PathBuf> = dates
                .iter()
                .map(|date| snapshot_path(data_dir, lab, resource, *date))
                .filter(|path| path.exists())
                .collect();

            if existing.is_empty() {
                tracing::debug!(lab = %lab, resource = %resource, "no fresh snapshot, collecting");
                report.to_collect.push(CollectTarget {
                    lab: lab.clone(),
                    volume: resource.clone(),
                    path: snapshot_path(data_dir, lab, resource, today),
                });
            } else {
                tracing::debug!(lab = %lab, resource = %resource, files = existing.len(), "fresh snapshot found");
                report.satisfied.push(SatisfiedPair {
                    lab: lab.clone(),
                    volume: resource.clone(),
                    paths: existing,
                });
            }
        }
    }

    tracing::info!(
        satisfied = report.satisfied.len(),
        to_collect = report.to_collect.len(),
        "freshness check complete"
    );
    report
}

/// Every snapshot in `data_dir` dated today or yesterday, sorted by path.
pub fn fresh_snapshots(data_dir: &Path, today: NaiveDate) -> SyncResult<Vec<PathBuf>> {
    let suffixes: Vec<String> = window(today)
        .iter()
        .map(|date| format!("_{}.json", date_stamp(*date)))
        .collect();

    let entries = match std::fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SyncError::io(data_dir, e)),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| SyncError::io(data_dir, e))?.path();
        let is_fresh = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| suffixes.iter().any(|suffix| name.ends_with(suffix.as_str())));
        if is_fresh && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
#[path = "tests/freshness_tests.rs"]
mod tests;

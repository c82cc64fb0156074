use crate::error::{SyncError, SyncResult};
use crate::orchestrator::Tier;
use crate::usage_service::types::UsageRow;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// `YYYYMMDD`, used in filenames and in the `date` field.
pub const DATE_FORMAT: &str = "%Y%m%d";

/// One lab's per-user usage on one volume tier, captured on `date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub server: String,
    pub volume: String,
    pub path: String,
    pub project: String,
    pub tier: Tier,
    pub date: String,
    pub contents: Vec<UsageRow>,
}

pub fn date_stamp(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn snapshot_filename(lab: &str, resource: &str, date: NaiveDate) -> String {
    format!("{}_{}_{}.json", lab, resource, date_stamp(date))
}

pub fn snapshot_path(data_dir: &Path, lab: &str, resource: &str, date: NaiveDate) -> PathBuf {
    data_dir.join(snapshot_filename(lab, resource, date))
}

impl UsageSnapshot {
    pub fn load(path: &Path) -> SyncResult<Self> {
        tracing::debug!(path = %path.display(), "reading snapshot");
        let content = fs::read_to_string(path).map_err(|e| SyncError::io(path, e))?;
        serde_json::from_str(&content)
            .map_err(|e| SyncError::json(format!("snapshot {}", path.display()), e))
    }

    /// Writes the snapshot to `path`, replacing any file already there.
    ///
    /// Keys are written sorted. The content goes to a sibling temp file first
    /// and is renamed into place, so readers only ever see complete files.
    pub fn persist(&self, path: &Path) -> SyncResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
                tracing::info!(dir = %parent.display(), "created data directory");
            }
        }

        // Going through Value sorts object keys.
        let value = serde_json::to_value(self)
            .map_err(|e| SyncError::json(format!("snapshot {}", path.display()), e))?;
        let content = serde_json::to_string_pretty(&value)
            .map_err(|e| SyncError::json(format!("snapshot {}", path.display()), e))?;

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, content).map_err(|e| SyncError::io(&temp_path, e))?;
        fs::rename(&temp_path, path).map_err(|e| SyncError::io(path, e))?;

        tracing::info!(
            path = %path.display(),
            project = %self.project,
            rows = self.contents.len(),
            "snapshot written"
        );
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/snapshot_tests.rs"]
mod tests;

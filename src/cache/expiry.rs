use crate::error::{SyncError, SyncResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Removes `*.json` files in `dir` older than `max_age` at `now`.
///
/// Age is taken from the creation time where the filesystem records one,
/// otherwise from the modification time. A missing directory is not an
/// error. Returns the removed paths.
pub fn expire(dir: &Path, max_age: Duration, now: SystemTime) -> SyncResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(dir = %dir.display(), "nothing to expire, directory missing");
            return Ok(Vec::new());
        }
        Err(e) => return Err(SyncError::io(dir, e)),
    };

    let mut removed = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| SyncError::io(dir, e))?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }

        let metadata = fs::metadata(&path).map_err(|e| SyncError::io(&path, e))?;
        if !metadata.is_file() {
            continue;
        }
        let stamp = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(|e| SyncError::io(&path, e))?;

        // A stamp in the future counts as brand new.
        let age = now.duration_since(stamp).unwrap_or(Duration::ZERO);
        if age > max_age {
            fs::remove_file(&path).map_err(|e| SyncError::io(&path, e))?;
            tracing::info!(path = %path.display(), age_secs = age.as_secs(), "expired snapshot removed");
            removed.push(path);
        }
    }

    removed.sort();
    Ok(removed)
}

#[cfg(test)]
#[path = "tests/expiry_tests.rs"]
mod tests;

//! Per-run log file setup.

use crate::cache::snapshot::date_stamp;
use crate::error::{SyncError, SyncResult};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,usage_sync=debug";

pub fn log_path(log_dir: &Path, today: NaiveDate) -> PathBuf {
    log_dir.join(format!("usage-sync-{}.log", date_stamp(today)))
}

/// Installs the global subscriber, writing to today's log file.
///
/// The file is truncated, so a second run on the same day replaces the
/// first run's log. `RUST_LOG` overrides the default filter.
pub fn init(log_dir: &Path, today: NaiveDate) -> SyncResult<PathBuf> {
    std::fs::create_dir_all(log_dir).map_err(|e| SyncError::io(log_dir, e))?;
    let path = log_path(log_dir, today);
    let file = std::fs::File::create(&path).map_err(|e| SyncError::io(&path, e))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false),
        )
        .try_init()
        .map_err(|e| SyncError::Config(format!("logging already initialised: {}", e)))?;
    Ok(path)
}

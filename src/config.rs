use crate::error::{SyncError, SyncResult};
use crate::usage_service::query::PollPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const USERNAME_ENV: &str = "USAGE_SYNC_USERNAME";
pub const PASSWORD_ENV: &str = "USAGE_SYNC_PASSWORD";

const SECS_PER_DAY: u64 = 86_400;

/// `days` as a duration, rejecting counts too large to represent.
pub fn days_to_duration(days: u64) -> SyncResult<Duration> {
    days.checked_mul(SECS_PER_DAY)
        .map(Duration::from_secs)
        .ok_or_else(|| SyncError::Config(format!("{} days is too long an age", days)))
}

/// Process-wide settings, loaded once at startup and passed explicitly.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Directory holding the dated usage snapshots.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory holding the missing-identity CSV ledgers.
    #[serde(default = "default_missing_dir")]
    pub missing_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Server registry JSON (server -> url + volumes).
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,
    /// SQLite accounting database.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Poll ceiling per query job. 0 polls forever.
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_snapshot_max_age_days")]
    pub snapshot_max_age_days: u64,
    /// Lab-name suffix selecting the archival subpath of a volume.
    #[serde(default = "default_archival_marker")]
    pub archival_marker: String,
    /// Skip labs whose group is not a member of the volume.
    #[serde(default)]
    pub validate_membership: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./local_data/usage/")
}

fn default_missing_dir() -> PathBuf {
    PathBuf::from("./local_data/missing/")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./local_data/logs/")
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("./servers.json")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./local_data/accounting.db")
}

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_max_polls() -> u32 {
    2400
}

fn default_http_timeout_secs() -> u64 {
    60
}

fn default_snapshot_max_age_days() -> u64 {
    7
}

fn default_archival_marker() -> String {
    "_l3".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            missing_dir: default_missing_dir(),
            log_dir: default_log_dir(),
            registry_path: default_registry_path(),
            database_path: default_database_path(),
            poll_interval_secs: default_poll_interval_secs(),
            max_polls: default_max_polls(),
            http_timeout_secs: default_http_timeout_secs(),
            snapshot_max_age_days: default_snapshot_max_age_days(),
            archival_marker: default_archival_marker(),
            validate_membership: false,
            username: None,
            password: None,
        }
    }
}

impl SyncConfig {
    /// Reads the YAML config at `path`, applies env overrides and validates.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SyncError::io(path, e))?;
        let mut config: Self = serde_yaml::from_str(&content).map_err(|e| {
            SyncError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus env overrides, for runs without a config file.
    pub fn from_env() -> SyncResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(username) = std::env::var(USERNAME_ENV) {
            self.username = Some(username);
        }
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            self.password = Some(password);
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.poll_interval_secs == 0 {
            return Err(SyncError::Config(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.snapshot_max_age_days == 0 {
            return Err(SyncError::Config(
                "snapshot_max_age_days must be at least 1".to_string(),
            ));
        }
        days_to_duration(self.snapshot_max_age_days)?;
        if self.archival_marker.trim().is_empty() {
            return Err(SyncError::Config(
                "archival_marker must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Username and password for the usage service.
    pub fn credentials(&self) -> SyncResult<(String, String)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Ok((u.clone(), p.clone())),
            _ => Err(SyncError::Config(format!(
                "usage service credentials missing; set {} and {}",
                USERNAME_ENV, PASSWORD_ENV
            ))),
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(self.poll_interval_secs),
            max_polls: (self.max_polls > 0).then_some(self.max_polls),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn snapshot_max_age(&self) -> SyncResult<Duration> {
        days_to_duration(self.snapshot_max_age_days)
    }
}

#[cfg(test)]
#[path = "tests/config_tests/sync_config_tests.rs"]
mod tests;

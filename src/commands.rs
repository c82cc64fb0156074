//! The CLI subcommands, run on a blocking thread.

use crate::cache::{self, FreshnessReport};
use crate::config::{days_to_duration, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::ledger::MissingLedger;
use crate::orchestrator::{self, LabPlan, Orchestrator, SyncOutcome, VolumeListing};
use crate::reconciler::{self, ReconcileLock, ReconcileReport};
use crate::registry::ServerRegistry;
use crate::store::AccountingDb;
use crate::usage_service::api_client::HttpConnector;
use crate::usage_service::query::CancelToken;
use chrono::NaiveDate;
use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Collect stale usage snapshots, then reconcile them into the store
    Sync {
        /// Only collect and reconcile this volume
        #[arg(long)]
        volume: Option<String>,

        /// Delete each snapshot once it has been reconciled
        #[arg(long)]
        clean: bool,
    },
    /// Collect stale usage snapshots without reconciling
    Pull {
        #[arg(long)]
        volume: Option<String>,
    },
    /// Reconcile snapshot files (default: every fresh snapshot)
    Push {
        #[arg(long)]
        clean: bool,

        files: Vec<PathBuf>,
    },
    /// Remove snapshots older than the configured age
    Expire {
        #[arg(long)]
        max_age_days: Option<u64>,
    },
    /// Show the lab/resource plan and which pairs need collecting
    Plan {
        #[arg(long)]
        volume: Option<String>,
    },
    /// List volumes and their top-level paths on a registry server
    Discover {
        #[arg(long)]
        server: String,
    },
}

/// Runs `command` to completion and returns the summary for stdout.
pub fn run(
    command: Command,
    config: &SyncConfig,
    today: NaiveDate,
    cancel: CancelToken,
) -> SyncResult<String> {
    tracing::info!(command = ?command, "command started");
    match command {
        Command::Sync { volume, clean } => {
            let store = AccountingDb::open(&config.database_path)?;
            let ledger = MissingLedger::new(config.missing_dir.clone());
            let outcome = pull(config, &store, &ledger, volume.as_deref(), today, cancel)?;
            let report = push(config, &store, &ledger, &outcome.filepaths, clean, today)?;
            Ok(format!(
                "{}\n{}",
                pull_summary(&outcome),
                reconcile_summary(&report)
            ))
        }
        Command::Pull { volume } => {
            let store = AccountingDb::open(&config.database_path)?;
            let ledger = MissingLedger::new(config.missing_dir.clone());
            let outcome = pull(config, &store, &ledger, volume.as_deref(), today, cancel)?;
            Ok(pull_summary(&outcome))
        }
        Command::Push { clean, files } => {
            let store = AccountingDb::open(&config.database_path)?;
            let ledger = MissingLedger::new(config.missing_dir.clone());
            let files = if files.is_empty() {
                cache::fresh_snapshots(&config.data_dir, today)?
            } else {
                files
            };
            let report = push(config, &store, &ledger, &files, clean, today)?;
            Ok(reconcile_summary(&report))
        }
        Command::Expire { max_age_days } => {
            let max_age = match max_age_days {
                Some(0) => {
                    return Err(SyncError::Config(
                        "--max-age-days must be at least 1".to_string(),
                    ))
                }
                Some(days) => days_to_duration(days)?,
                None => config.snapshot_max_age()?,
            };
            let removed = cache::expire(&config.data_dir, max_age, SystemTime::now())?;
            Ok(expire_summary(&config.data_dir, &removed))
        }
        Command::Plan { volume } => {
            let store = AccountingDb::open(&config.database_path)?;
            let plan = orchestrator::plan_lab_resources(&store, volume.as_deref())?;
            let freshness = cache::check_freshness(&plan, today, &config.data_dir);
            Ok(plan_summary(&plan, &freshness))
        }
        Command::Discover { server } => {
            let registry = ServerRegistry::load(&config.registry_path)?;
            let connector = connector(config)?;
            let listings = orchestrator::discover(&registry, &connector, &server)?;
            Ok(discover_summary(&server, &listings))
        }
    }
}

fn connector(config: &SyncConfig) -> SyncResult<HttpConnector> {
    let (username, password) = config.credentials()?;
    Ok(HttpConnector::new(username, password, config.http_timeout()))
}

fn pull(
    config: &SyncConfig,
    store: &AccountingDb,
    ledger: &MissingLedger,
    volume: Option<&str>,
    today: NaiveDate,
    cancel: CancelToken,
) -> SyncResult<SyncOutcome> {
    let registry = ServerRegistry::load(&config.registry_path)?;
    let connector = connector(config)?;
    Orchestrator::new(config, &registry, &connector, store, ledger, cancel).run_sync(volume, today)
}

fn push(
    config: &SyncConfig,
    store: &AccountingDb,
    ledger: &MissingLedger,
    files: &[PathBuf],
    clean: bool,
    today: NaiveDate,
) -> SyncResult<ReconcileReport> {
    let _lock = ReconcileLock::acquire(&config.data_dir)?;
    reconciler::reconcile(store, ledger, files, clean, today)
}

pub fn pull_summary(outcome: &SyncOutcome) -> String {
    let mut lines = vec![format!(
        "{} snapshot(s) ready, {} collected, {} pair(s) uncollected",
        outcome.filepaths.len(),
        outcome.collected.len(),
        outcome.skipped.len()
    )];
    lines.extend(outcome.filepaths.iter().map(|path| format!("  {}", path.display())));
    lines.extend(outcome.skipped.iter().map(|pair| {
        format!(
            "  skipped {} on {} ({}): {}",
            pair.lab, pair.volume, pair.tier, pair.reason
        )
    }));
    lines.join("\n")
}

pub fn reconcile_summary(report: &ReconcileReport) -> String {
    let mut lines = vec![format!(
        "{} file(s) reconciled: {} created, {} updated, {} failed",
        report.files,
        report.created,
        report.updated,
        report.failures.len()
    )];
    lines.extend(report.notices.iter().map(|notice| format!("  notice: {}", notice)));
    lines.extend(
        report
            .failures
            .iter()
            .map(|(path, reason)| format!("  failed {}: {}", path.display(), reason)),
    );
    if !report.removed.is_empty() {
        lines.push(format!("  {} snapshot(s) removed", report.removed.len()));
    }
    lines.join("\n")
}

fn expire_summary(data_dir: &Path, removed: &[PathBuf]) -> String {
    let mut lines = vec![format!(
        "{} expired snapshot(s) removed from {}",
        removed.len(),
        data_dir.display()
    )];
    lines.extend(removed.iter().map(|path| format!("  {}", path.display())));
    lines.join("\n")
}

pub fn plan_summary(plan: &LabPlan, freshness: &FreshnessReport) -> String {
    let mut lines = vec![format!(
        "{} lab(s): {} pair(s) fresh, {} to collect",
        plan.len(),
        freshness.satisfied.len(),
        freshness.to_collect.len()
    )];
    for pair in &freshness.satisfied {
        lines.push(format!("  fresh    {} {}", pair.lab, pair.volume));
    }
    for target in &freshness.to_collect {
        lines.push(format!("  collect  {} {}", target.lab, target.volume));
    }
    lines.join("\n")
}

fn discover_summary(server: &str, listings: &[VolumeListing]) -> String {
    let mut lines = vec![format!("{}: {} volume(s)", server, listings.len())];
    for listing in listings {
        lines.push(format!("  {}: {}", listing.volume, listing.subpaths.join(", ")));
    }
    lines.join("\n")
}

#[cfg(test)]
#[path = "tests/commands_tests.rs"]
mod tests;

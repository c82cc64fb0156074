//! Sync pass: decides which (lab, volume) pairs need fresh usage data,
//! queries the servers hosting them and writes the snapshots.
//!
//! Pairs are batched by volume so one authenticated connection serves every
//! lab on that volume. Each (lab, tier) gets its own query job; a failed or
//! empty job only leaves its own pair uncollected.

use crate::cache::{self, CollectTarget, UsageSnapshot};
use crate::config::SyncConfig;
use crate::error::{Notice, SyncError, SyncResult};
use crate::ledger::{MissingLedger, MissingRecord};
use crate::registry::ServerRegistry;
use crate::store::AccountingStore;
use crate::usage_service::query::{run_query, CancelToken};
use crate::usage_service::types::{MembershipType, QueryOutcome, QueryRequest};
use crate::usage_service::{ServiceConnector, UsageService};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::PathBuf;

/// Lab name -> resource (volume) names, both sorted.
pub type LabPlan = BTreeMap<String, Vec<String>>;

/// Times a pass is restarted after the token expires mid-pass.
const MAX_PASS_RESTARTS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Standard,
    Archival,
}

impl Tier {
    /// Labs whose name carries `marker` live on the archival subpath.
    pub fn for_lab(lab: &str, marker: &str) -> Self {
        if lab.contains(marker) {
            Tier::Archival
        } else {
            Tier::Standard
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Standard => "standard",
            Tier::Archival => "archival",
        }
    }

    /// Picks this tier's subpath from a volume's registry entry.
    pub fn select_subpath<'a>(&self, volume: &str, subpaths: &'a [String]) -> Option<&'a str> {
        match self {
            Tier::Standard => subpaths.first(),
            Tier::Archival => subpaths.get(1).or_else(|| {
                tracing::warn!(
                    volume = %volume,
                    "no archival subpath registered, using the default subpath"
                );
                subpaths.first()
            }),
        }
        .map(String::as_str)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    EmptyResult,
    ServiceError(String),
    QueryFailed(String),
    UnknownVolume,
    VolumeNotOnServer(String),
    ServerUnavailable(String),
    NotMember,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::EmptyResult => write!(f, "empty result"),
            SkipReason::ServiceError(detail) => write!(f, "service error: {}", detail),
            SkipReason::QueryFailed(detail) => write!(f, "query failed: {}", detail),
            SkipReason::UnknownVolume => write!(f, "volume not in server registry"),
            SkipReason::VolumeNotOnServer(server) => write!(f, "volume not listed by {}", server),
            SkipReason::ServerUnavailable(detail) => write!(f, "server unavailable: {}", detail),
            SkipReason::NotMember => write!(f, "group not a member of the volume"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPair {
    pub lab: String,
    pub volume: String,
    pub tier: Tier,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Existing fresh snapshots plus the ones written by this pass.
    pub filepaths: Vec<PathBuf>,
    pub collected: Vec<PathBuf>,
    pub skipped: Vec<SkippedPair>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeListing {
    pub volume: String,
    pub subpaths: Vec<String>,
}

/// How one pass ended, short of a fatal error.
enum PassEnd {
    Complete {
        filepaths: BTreeSet<PathBuf>,
        skipped: Vec<SkippedPair>,
    },
    TokenExpired(SyncError),
}

/// The lab -> resource plan from the store's allocations. With a filter, only
/// that volume's resources are kept and labs left without one are dropped.
pub fn plan_lab_resources(
    store: &dyn AccountingStore,
    volume_filter: Option<&str>,
) -> SyncResult<LabPlan> {
    let mut plan = LabPlan::new();
    for (lab, resource) in store.allocation_resources()? {
        if volume_filter.is_some_and(|volume| volume != resource) {
            continue;
        }
        let resources = plan.entry(lab).or_default();
        if !resources.contains(&resource) {
            resources.push(resource);
        }
    }
    for resources in plan.values_mut() {
        resources.sort();
    }
    tracing::debug!(labs = plan.len(), filter = ?volume_filter, "lab resources planned");
    Ok(plan)
}

pub struct Orchestrator<'a> {
    config: &'a SyncConfig,
    registry: &'a ServerRegistry,
    connector: &'a dyn ServiceConnector,
    store: &'a dyn AccountingStore,
    ledger: &'a MissingLedger,
    cancel: CancelToken,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a SyncConfig,
        registry: &'a ServerRegistry,
        connector: &'a dyn ServiceConnector,
        store: &'a dyn AccountingStore,
        ledger: &'a MissingLedger,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            registry,
            connector,
            store,
            ledger,
            cancel,
        }
    }

    /// Collects every stale pair and returns all snapshot paths to reconcile.
    ///
    /// A token rejected mid-pass restarts the pass with a fresh connection;
    /// snapshots already written count as fresh the second time round.
    pub fn run_sync(&self, volume_filter: Option<&str>, today: NaiveDate) -> SyncResult<SyncOutcome> {
        let mut collected = Vec::new();
        let mut restarts = 0;

        loop {
            match self.run_pass(volume_filter, today, &mut collected)? {
                PassEnd::Complete { filepaths, skipped } => {
                    let records: Vec<MissingRecord> = skipped
                        .iter()
                        .map(|pair| MissingRecord::Uncollected {
                            project: pair.lab.clone(),
                            volume: pair.volume.clone(),
                            tier: pair.tier,
                        })
                        .collect();
                    self.ledger.record(&records, today)?;

                    tracing::info!(
                        files = filepaths.len(),
                        collected = collected.len(),
                        skipped = skipped.len(),
                        "sync pass complete"
                    );
                    return Ok(SyncOutcome {
                        filepaths: filepaths.into_iter().collect(),
                        collected,
                        skipped,
                    });
                }
                PassEnd::TokenExpired(error) if restarts < MAX_PASS_RESTARTS => {
                    restarts += 1;
                    tracing::warn!(error = %error, restarts, "token rejected mid-pass, restarting pass");
                }
                PassEnd::TokenExpired(error) => return Err(error),
            }
        }
    }

    fn run_pass(
        &self,
        volume_filter: Option<&str>,
        today: NaiveDate,
        collected: &mut Vec<PathBuf>,
    ) -> SyncResult<PassEnd> {
        let plan = plan_lab_resources(self.store, volume_filter)?;
        let freshness = cache::check_freshness(&plan, today, &self.config.data_dir);

        let mut filepaths: BTreeSet<PathBuf> = freshness.filepaths().into_iter().collect();
        let mut skipped = Vec::new();

        let mut by_volume: BTreeMap<&str, Vec<&CollectTarget>> = BTreeMap::new();
        for target in &freshness.to_collect {
            by_volume.entry(target.volume.as_str()).or_default().push(target);
        }

        for (volume, targets) in by_volume {
            let skip_all = |reason: SkipReason, skipped: &mut Vec<SkippedPair>| {
                for target in &targets {
                    skipped.push(self.skipped(target, reason.clone()));
                }
            };

            let Some((server_name, entry)) = self.registry.server_for_volume(volume) else {
                tracing::warn!(volume = %volume, "volume not in server registry, skipping");
                skip_all(SkipReason::UnknownVolume, &mut skipped);
                continue;
            };
            let subpaths = self.registry.subpaths(volume).unwrap_or_default();

            tracing::info!(server = %server_name, volume = %volume, labs = targets.len(), "collecting volume");
            let service = match self.connector.connect(server_name, entry) {
                Ok(service) => service,
                Err(e) if e.is_fatal_for_pass() => return Err(e),
                Err(e) => {
                    tracing::warn!(server = %server_name, error = %e, "server unavailable, skipping volume");
                    skip_all(SkipReason::ServerUnavailable(e.to_string()), &mut skipped);
                    continue;
                }
            };

            let volumes = match service.list_volumes() {
                Ok(volumes) => volumes,
                Err(e @ SyncError::Auth { .. }) => return Ok(PassEnd::TokenExpired(e)),
                Err(e) if e.is_fatal_for_pass() => return Err(e),
                Err(e) => {
                    skip_all(SkipReason::ServerUnavailable(e.to_string()), &mut skipped);
                    continue;
                }
            };
            if !volumes.iter().any(|v| v == volume) {
                tracing::warn!(server = %server_name, volume = %volume, "server does not list volume, skipping");
                skip_all(SkipReason::VolumeNotOnServer(server_name.to_string()), &mut skipped);
                continue;
            }

            let members = if self.config.validate_membership {
                match group_members(service.as_ref(), volume) {
                    Ok(members) => Some(members),
                    Err(e @ SyncError::Auth { .. }) => return Ok(PassEnd::TokenExpired(e)),
                    Err(e) if e.is_fatal_for_pass() => return Err(e),
                    Err(e) => {
                        tracing::warn!(server = %server_name, volume = %volume, error = %e, "membership lookup failed, skipping volume");
                        skip_all(SkipReason::ServerUnavailable(e.to_string()), &mut skipped);
                        continue;
                    }
                }
            } else {
                None
            };

            for target in targets.iter().copied() {
                if self.cancel.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
                if members.as_ref().is_some_and(|m| !m.contains(&target.lab)) {
                    tracing::warn!(lab = %target.lab, volume = %volume, "group not a member of volume, skipping");
                    skipped.push(self.skipped(target, SkipReason::NotMember));
                    continue;
                }

                match self.collect_one(service.as_ref(), target, subpaths, today) {
                    Ok(Collected::Written(path)) => {
                        filepaths.insert(path.clone());
                        collected.push(path);
                    }
                    Ok(Collected::Skipped(reason)) => skipped.push(self.skipped(target, reason)),
                    Err(e @ SyncError::Auth { .. }) => return Ok(PassEnd::TokenExpired(e)),
                    Err(e) if e.is_fatal_for_pass() => return Err(e),
                    Err(e) => {
                        tracing::warn!(lab = %target.lab, volume = %volume, error = %e, "collection failed");
                        skipped.push(self.skipped(target, SkipReason::QueryFailed(e.to_string())));
                    }
                }
            }
        }

        Ok(PassEnd::Complete { filepaths, skipped })
    }

    /// Runs one lab's query and persists a snapshot when it has rows.
    fn collect_one(
        &self,
        service: &dyn UsageService,
        target: &CollectTarget,
        subpaths: &[String],
        today: NaiveDate,
    ) -> SyncResult<Collected> {
        let tier = Tier::for_lab(&target.lab, &self.config.archival_marker);
        let subpath = tier
            .select_subpath(&target.volume, subpaths)
            .ok_or_else(|| SyncError::Config(format!("volume {} has no subpaths", target.volume)))?;

        tracing::debug!(lab = %target.lab, tier = %tier, subpath = %subpath, path = %target.path.display(), "collecting lab");
        let request = QueryRequest::group_usage(&target.lab, &target.volume, subpath);
        let outcome = run_query(service, request, &self.config.poll_policy(), &self.cancel)?;

        let rows = match outcome {
            QueryOutcome::Rows(rows) => rows,
            QueryOutcome::Empty => {
                let notice = Notice::EmptyResult {
                    project: target.lab.clone(),
                    volume: target.volume.clone(),
                };
                tracing::warn!("{}", notice);
                return Ok(Collected::Skipped(SkipReason::EmptyResult));
            }
            QueryOutcome::ServiceError(detail) => {
                let notice = Notice::ServiceError {
                    project: target.lab.clone(),
                    volume: target.volume.clone(),
                    detail: detail.to_string(),
                };
                tracing::warn!("{}", notice);
                return Ok(Collected::Skipped(SkipReason::ServiceError(detail.to_string())));
            }
        };

        let snapshot = UsageSnapshot {
            server: service.server_name().to_string(),
            volume: target.volume.clone(),
            path: subpath.to_string(),
            project: target.lab.clone(),
            tier,
            date: cache::snapshot::date_stamp(today),
            contents: rows,
        };
        snapshot.persist(&target.path)?;
        Ok(Collected::Written(target.path.clone()))
    }

    fn skipped(&self, target: &CollectTarget, reason: SkipReason) -> SkippedPair {
        SkippedPair {
            lab: target.lab.clone(),
            volume: target.volume.clone(),
            tier: Tier::for_lab(&target.lab, &self.config.archival_marker),
            reason,
        }
    }
}

enum Collected {
    Written(PathBuf),
    Skipped(SkipReason),
}

fn group_members(service: &dyn UsageService, volume: &str) -> SyncResult<HashSet<String>> {
    let records = service.volume_membership(volume, MembershipType::Group)?;
    let members: HashSet<String> = records
        .iter()
        .filter_map(|record| record.member_name(MembershipType::Group))
        .map(String::from)
        .collect();
    tracing::debug!(volume = %volume, groups = members.len(), "volume membership fetched");
    Ok(members)
}

/// Volumes on a registry server and the directories directly under each.
pub fn discover(
    registry: &ServerRegistry,
    connector: &dyn ServiceConnector,
    server: &str,
) -> SyncResult<Vec<VolumeListing>> {
    let entry = registry
        .server(server)
        .ok_or_else(|| SyncError::Config(format!("server {} not in registry", server)))?;
    let service = connector.connect(server, entry)?;

    let mut listings = Vec::new();
    for volume in service.list_volumes()? {
        let subpaths = service.list_subpaths(&format!("{}:", volume))?;
        listings.push(VolumeListing { volume, subpaths });
    }
    Ok(listings)
}

#[cfg(test)]
#[path = "tests/orchestrator_tests.rs"]
mod tests;

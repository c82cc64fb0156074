use super::*;
use crate::cache::UsageSnapshot;
use crate::orchestrator::{SkipReason, SkippedPair, Tier};
use crate::usage_service::types::UsageRow;
use tempfile::TempDir;

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

fn config_in(dir: &Path) -> SyncConfig {
    SyncConfig {
        data_dir: dir.join("usage"),
        missing_dir: dir.join("missing"),
        log_dir: dir.join("logs"),
        registry_path: dir.join("servers.json"),
        database_path: dir.join("accounting.db"),
        ..SyncConfig::default()
    }
}

fn seed_smith_lab(config: &SyncConfig) {
    let db = AccountingDb::open(&config.database_path).unwrap();
    let project = db.add_project("smithlab");
    db.add_allocation(project, &["tier1"]);
    db.add_user("jdoe");
}

fn run_command(command: Command, config: &SyncConfig) -> SyncResult<String> {
    run(command, config, day(5), CancelToken::new())
}

#[test]
fn test_plan_lists_pairs_to_collect() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_in(temp_dir.path());
    seed_smith_lab(&config);

    let summary = run_command(Command::Plan { volume: None }, &config).unwrap();
    assert!(summary.starts_with("1 lab(s): 0 pair(s) fresh, 1 to collect"));
    assert!(summary.contains("collect  smithlab tier1"));
}

#[test]
fn test_push_without_files_reconciles_fresh_snapshots() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_in(temp_dir.path());
    seed_smith_lab(&config);
    UsageSnapshot {
        server: "holysfdb01".to_string(),
        volume: "tier1".to_string(),
        path: "labs".to_string(),
        project: "smithlab".to_string(),
        tier: Tier::Standard,
        date: "20240305".to_string(),
        contents: vec![UsageRow {
            username: "jdoe".to_string(),
            groupname: "smithlab".to_string(),
            size_sum: 500_000_000,
            size_sum_hum: "500MB".to_string(),
            extra: serde_json::Map::new(),
        }],
    }
    .persist(&config.data_dir.join("smithlab_tier1_20240305.json"))
    .unwrap();

    let summary = run_command(
        Command::Push {
            clean: true,
            files: Vec::new(),
        },
        &config,
    )
    .unwrap();
    assert!(summary.starts_with("1 file(s) reconciled: 1 created, 0 updated, 0 failed"));
    assert!(summary.contains("1 snapshot(s) removed"));
    assert!(!config.data_dir.join("smithlab_tier1_20240305.json").exists());
}

#[test]
fn test_push_with_nothing_fresh_is_a_no_op() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_in(temp_dir.path());

    let summary = run_command(
        Command::Push {
            clean: false,
            files: Vec::new(),
        },
        &config,
    )
    .unwrap();
    assert_eq!(summary, "0 file(s) reconciled: 0 created, 0 updated, 0 failed");
}

#[test]
fn test_expire_rejects_zero_age() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_in(temp_dir.path());
    let result = run_command(
        Command::Expire {
            max_age_days: Some(0),
        },
        &config,
    );
    assert!(matches!(result, Err(SyncError::Config(_))));
}

#[test]
fn test_expire_rejects_age_beyond_range() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_in(temp_dir.path());
    let result = run_command(
        Command::Expire {
            max_age_days: Some(u64::MAX / 2),
        },
        &config,
    );
    assert!(matches!(result, Err(SyncError::Config(_))));
}

#[test]
fn test_expire_keeps_recent_snapshots() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_in(temp_dir.path());
    std::fs::create_dir_all(&config.data_dir).unwrap();
    std::fs::write(config.data_dir.join("smithlab_tier1_20240305.json"), "{}").unwrap();

    let summary = run_command(Command::Expire { max_age_days: None }, &config).unwrap();
    assert!(summary.starts_with("0 expired snapshot(s) removed"));
    assert!(config.data_dir.join("smithlab_tier1_20240305.json").exists());
}

#[test]
fn test_sync_without_credentials_is_a_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let config = config_in(temp_dir.path());
    std::fs::write(&config.registry_path, "{}").unwrap();

    let result = run_command(
        Command::Sync {
            volume: None,
            clean: false,
        },
        &config,
    );
    assert!(matches!(result, Err(SyncError::Config(_))));
}

#[test]
fn test_pull_summary_names_skipped_pairs() {
    let outcome = SyncOutcome {
        filepaths: vec![PathBuf::from("/data/smithlab_tier1_20240305.json")],
        collected: vec![PathBuf::from("/data/smithlab_tier1_20240305.json")],
        skipped: vec![SkippedPair {
            lab: "jones_l3".to_string(),
            volume: "tier1".to_string(),
            tier: Tier::Archival,
            reason: SkipReason::EmptyResult,
        }],
    };

    assert_eq!(
        pull_summary(&outcome),
        "1 snapshot(s) ready, 1 collected, 1 pair(s) uncollected\n\
         \x20 /data/smithlab_tier1_20240305.json\n\
         \x20 skipped jones_l3 on tier1 (archival): empty result"
    );
}

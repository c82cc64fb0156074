use super::*;
use serial_test::serial;
use tempfile::TempDir;

#[test]
fn test_default_config_validates() {
    let config = SyncConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.archival_marker, "_l3");
    assert_eq!(config.poll_policy().interval, Duration::from_secs(3));
    assert_eq!(config.poll_policy().max_polls, Some(2400));
}

#[test]
fn test_yaml_parsing_fills_defaults() {
    let yaml = r#"
data_dir: /srv/usage/data
poll_interval_secs: 10
max_polls: 0
"#;
    let config: SyncConfig = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.data_dir, PathBuf::from("/srv/usage/data"));
    assert_eq!(config.poll_interval_secs, 10);
    // 0 means no ceiling
    assert_eq!(config.poll_policy().max_polls, None);
    assert_eq!(config.snapshot_max_age_days, 7);
    assert_eq!(config.missing_dir, PathBuf::from("./local_data/missing/"));
}

#[test]
fn test_unknown_field_rejected() {
    let yaml = "data_dirr: /tmp\n";
    assert!(serde_yaml::from_str::<SyncConfig>(yaml).is_err());
}

#[test]
fn test_validation_rejects_zero_interval() {
    let config = SyncConfig {
        poll_interval_secs: 0,
        ..SyncConfig::default()
    };
    assert!(matches!(config.validate(), Err(SyncError::Config(_))));
}

#[test]
fn test_validation_rejects_empty_marker() {
    let config = SyncConfig {
        archival_marker: "  ".to_string(),
        ..SyncConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_missing_credentials_is_config_error() {
    let config = SyncConfig {
        username: Some("svc".to_string()),
        password: None,
        ..SyncConfig::default()
    };
    assert!(matches!(config.credentials(), Err(SyncError::Config(_))));
}

#[test]
#[serial]
fn test_load_applies_env_overrides() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("usage-sync.yaml");
    std::fs::write(&path, "username: from-file\npassword: file-pass\n").unwrap();

    std::env::set_var(USERNAME_ENV, "from-env");
    std::env::remove_var(PASSWORD_ENV);
    let config = SyncConfig::load(&path);
    std::env::remove_var(USERNAME_ENV);

    let config = config.unwrap();
    let (user, pass) = config.credentials().unwrap();
    assert_eq!(user, "from-env");
    assert_eq!(pass, "file-pass");
}

#[test]
fn test_load_missing_file_is_io_error() {
    let temp_dir = TempDir::new().unwrap();
    let result = SyncConfig::load(&temp_dir.path().join("absent.yaml"));
    assert!(matches!(result, Err(SyncError::Io { .. })));
}

#[test]
fn test_validation_rejects_overflowing_max_age() {
    let config = SyncConfig {
        snapshot_max_age_days: u64::MAX,
        ..SyncConfig::default()
    };
    assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    assert!(config.snapshot_max_age().is_err());
    assert_eq!(
        SyncConfig::default().snapshot_max_age().unwrap(),
        Duration::from_secs(7 * 86_400)
    );
}

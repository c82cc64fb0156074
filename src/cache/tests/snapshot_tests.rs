use super::*;
use tempfile::TempDir;

fn sample(date: &str) -> UsageSnapshot {
    let mut extra = serde_json::Map::new();
    extra.insert("count".to_string(), serde_json::json!(12));
    UsageSnapshot {
        server: "holysfdb01".to_string(),
        volume: "tier1".to_string(),
        path: "labs".to_string(),
        project: "smithlab".to_string(),
        tier: Tier::Standard,
        date: date.to_string(),
        contents: vec![UsageRow {
            username: "jdoe".to_string(),
            groupname: "smithlab".to_string(),
            size_sum: 500_000_000,
            size_sum_hum: "500MB".to_string(),
            extra,
        }],
    }
}

#[test]
fn test_filename_convention() {
    let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
    assert_eq!(
        snapshot_filename("smithlab", "tier1", date),
        "smithlab_tier1_20240305.json"
    );
    assert_eq!(
        snapshot_path(Path::new("/data"), "smithlab", "tier1", date),
        PathBuf::from("/data/smithlab_tier1_20240305.json")
    );
}

#[test]
fn test_persist_creates_dir_and_reloads() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("usage").join("smithlab_tier1_20240305.json");
    let snapshot = sample("20240305");

    snapshot.persist(&path).unwrap();
    assert!(!path.with_extension("json.tmp").exists());
    assert_eq!(UsageSnapshot::load(&path).unwrap(), snapshot);
}

#[test]
fn test_persist_sorts_keys_and_keeps_extra_fields() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("smithlab_tier1_20240305.json");
    sample("20240305").persist(&path).unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let position = |key: &str| content.find(&format!("\"{}\"", key)).unwrap();
    assert!(position("contents") < position("date"));
    assert!(position("date") < position("project"));
    assert!(position("server") < position("tier"));
    assert!(content.contains("\"count\": 12"));
    assert!(content.contains("\"tier\": \"standard\""));
}

#[test]
fn test_persist_overwrites() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("smithlab_tier1_20240305.json");
    sample("20240305").persist(&path).unwrap();

    let mut second = sample("20240305");
    second.contents.clear();
    second.persist(&path).unwrap();
    assert!(UsageSnapshot::load(&path).unwrap().contents.is_empty());
}

#[test]
fn test_load_rejects_non_snapshot() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("other.json");
    std::fs::write(&path, r#"{"items": []}"#).unwrap();
    assert!(matches!(
        UsageSnapshot::load(&path),
        Err(SyncError::Json { .. })
    ));
    assert!(matches!(
        UsageSnapshot::load(&temp_dir.path().join("absent.json")),
        Err(SyncError::Io { .. })
    ));
}

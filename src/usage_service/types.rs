//! Wire types for the usage service.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Output columns requested for every async query.
pub const QUERY_FORMAT: &str = "parent_path fn type size blck ct mt at uid gid mode";

/// Row ceiling for every async query.
pub const QUERY_LIMIT: u32 = 100_000;

/// Group-by fields producing one row per user within a lab.
pub const USAGE_GROUP_BY: &str = "username, groupname";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipType {
    Group,
}

impl MembershipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipType::Group => "group",
        }
    }
}

/// One membership association returned by `/mapping/<type>_membership`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct MembershipRecord(pub Map<String, Value>);

impl MembershipRecord {
    /// The group name this record associates with the volume.
    pub fn member_name(&self, membership: MembershipType) -> Option<&str> {
        let keys: &[&str] = match membership {
            MembershipType::Group => &["groupname", "group_name", "name"],
        };
        keys.iter().find_map(|key| self.0.get(*key).and_then(Value::as_str))
    }
}

/// A fixed-shape aggregation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub query: String,
    pub group_by: String,
    /// `volume:path`
    pub volume_and_path: String,
}

impl QueryRequest {
    /// Regular files owned by `group`, summed per user and group.
    pub fn group_usage(group: &str, volume: &str, path: &str) -> Self {
        Self {
            query: format!("type=f groupname={}", group),
            group_by: USAGE_GROUP_BY.to_string(),
            volume_and_path: format!("{}:{}", volume, path),
        }
    }

    /// URL query parameters of `POST /async/query/`.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("volumes_and_paths", self.volume_and_path.clone()),
            ("queries", self.query.clone()),
            ("format", QUERY_FORMAT.to_string()),
            ("sort_by", self.group_by.clone()),
            ("group_by", self.group_by.clone()),
            ("limit", QUERY_LIMIT.to_string()),
            ("force_tag_inherit", "false".to_string()),
            ("output_format", "json".to_string()),
            ("delimiter", ",".to_string()),
            ("escape_paths", "false".to_string()),
            ("print_headers", "true".to_string()),
            ("size_unit", "B".to_string()),
            ("humanize_nested", "false".to_string()),
            ("mount_agent", "None".to_string()),
        ]
    }
}

/// One aggregate row of a usage query. Fields beyond the four the
/// reconciler reads are kept verbatim.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UsageRow {
    pub username: String,
    pub groupname: String,
    pub size_sum: u64,
    pub size_sum_hum: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Classified payload of a completed query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Rows(Vec<UsageRow>),
    Empty,
    ServiceError(Value),
}

impl QueryOutcome {
    /// Classifies a raw result payload. Rows that do not parse are dropped
    /// with a warning; a payload where no row parses is an error payload.
    pub fn classify(payload: Value) -> Self {
        match payload {
            Value::Null => QueryOutcome::Empty,
            Value::Array(ref items) if items.is_empty() => QueryOutcome::Empty,
            Value::Array(items) => {
                let mut rows = Vec::with_capacity(items.len());
                let mut rejected = Vec::new();
                for item in items {
                    match serde_json::from_value::<UsageRow>(item.clone()) {
                        Ok(row) => rows.push(row),
                        Err(e) => {
                            tracing::warn!(error = %e, row = %item, "unparseable usage row skipped");
                            rejected.push(item);
                        }
                    }
                }
                if rows.is_empty() {
                    QueryOutcome::ServiceError(serde_json::json!({
                        "error": "no parseable rows",
                        "payload": rejected,
                    }))
                } else {
                    QueryOutcome::Rows(rows)
                }
            }
            Value::Object(ref map) if map.is_empty() => QueryOutcome::Empty,
            other => QueryOutcome::ServiceError(other),
        }
    }
}

#[cfg(test)]
#[path = "tests/types_tests.rs"]
mod tests;

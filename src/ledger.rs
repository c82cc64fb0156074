//! CSV ledgers of things usage data referenced but the accounting store (or
//! the usage service) could not supply.
//!
//! One file per kind, `missing_<kind>s.csv`, with the identity columns
//! followed by `date`. Rows are keyed by their identity columns: a repeat
//! sighting replaces the old row with today's date. Files stay sorted by
//! date, newest first.

use crate::error::{SyncError, SyncResult};
use crate::orchestrator::Tier;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const DATE_COLUMN: &str = "date";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingRecord {
    User {
        username: String,
    },
    Project {
        title: String,
    },
    Allocation {
        resource_name: String,
        project_title: String,
        path: String,
    },
    /// A (lab, volume) pair the last pass could not collect.
    Uncollected {
        project: String,
        volume: String,
        tier: Tier,
    },
}

impl MissingRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            MissingRecord::User { .. } => "user",
            MissingRecord::Project { .. } => "project",
            MissingRecord::Allocation { .. } => "allocation",
            MissingRecord::Uncollected { .. } => "uncollected",
        }
    }

    fn columns(&self) -> &'static [&'static str] {
        match self {
            MissingRecord::User { .. } => &["username"],
            MissingRecord::Project { .. } => &["title"],
            MissingRecord::Allocation { .. } => &["resource_name", "project_title", "path"],
            MissingRecord::Uncollected { .. } => &["project", "volume", "tier"],
        }
    }

    fn values(&self) -> Vec<String> {
        match self {
            MissingRecord::User { username } => vec![username.clone()],
            MissingRecord::Project { title } => vec![title.clone()],
            MissingRecord::Allocation {
                resource_name,
                project_title,
                path,
            } => vec![resource_name.clone(), project_title.clone(), path.clone()],
            MissingRecord::Uncollected {
                project,
                volume,
                tier,
            } => vec![project.clone(), volume.clone(), tier.as_str().to_string()],
        }
    }
}

pub struct MissingLedger {
    dir: PathBuf,
}

impl MissingLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, kind: &str) -> PathBuf {
        self.dir.join(format!("missing_{}s.csv", kind))
    }

    /// Upserts `records` into their kind's ledger, dated `today`.
    pub fn record(&self, records: &[MissingRecord], today: NaiveDate) -> SyncResult<()> {
        let mut by_kind: BTreeMap<&'static str, Vec<&MissingRecord>> = BTreeMap::new();
        for record in records {
            by_kind.entry(record.kind()).or_default().push(record);
        }

        for (kind, records) in by_kind {
            let columns = records[0].columns();
            let path = self.path_for(kind);
            let mut rows = read_ledger(&path, columns)?;

            let date = today.format("%Y-%m-%d").to_string();
            for record in records {
                let key = record.values();
                rows.retain(|(existing, _)| *existing != key);
                rows.push((key, date.clone()));
            }
            // Stable: rows sharing a date keep first-seen order.
            rows.sort_by(|a, b| b.1.cmp(&a.1));

            write_ledger(&path, columns, &rows)?;
            tracing::info!(path = %path.display(), rows = rows.len(), "missing ledger updated");
        }
        Ok(())
    }

    /// Identity values and date of every row in `kind`'s ledger.
    #[cfg(test)]
    pub fn rows(&self, kind: &str) -> SyncResult<Vec<Vec<String>>> {
        let path = self.path_for(kind);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SyncError::io(&path, e)),
        };
        Ok(parse_records(&content).into_iter().skip(1).collect())
    }
}

type LedgerRow = (Vec<String>, String);

fn read_ledger(path: &Path, columns: &[&str]) -> SyncResult<Vec<LedgerRow>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SyncError::io(path, e)),
    };

    let mut records = parse_records(&content).into_iter();
    let header = records.next().unwrap_or_default();
    let mut expected: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
    expected.push(DATE_COLUMN.to_string());
    if !header.is_empty() && header != expected {
        return Err(SyncError::Config(format!(
            "ledger {} has columns {:?}, expected {:?}",
            path.display(),
            header,
            expected
        )));
    }

    let mut rows = Vec::new();
    for (index, mut fields) in records.enumerate() {
        if fields.len() != expected.len() {
            return Err(SyncError::Config(format!(
                "ledger {} record {} has {} fields, expected {}",
                path.display(),
                index + 1,
                fields.len(),
                expected.len()
            )));
        }
        let date = fields.pop().unwrap_or_default();
        rows.push((fields, date));
    }
    Ok(rows)
}

fn write_ledger(path: &Path, columns: &[&str], rows: &[LedgerRow]) -> SyncResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
    }

    let mut out = String::new();
    let header: Vec<&str> = columns.iter().copied().chain([DATE_COLUMN]).collect();
    out.push_str(&join_line(header.iter().copied()));
    for (values, date) in rows {
        out.push_str(&join_line(
            values.iter().map(String::as_str).chain([date.as_str()]),
        ));
    }

    let temp_path = path.with_extension("csv.tmp");
    fs::write(&temp_path, out).map_err(|e| SyncError::io(&temp_path, e))?;
    fs::rename(&temp_path, path).map_err(|e| SyncError::io(path, e))
}

fn join_line<'a>(fields: impl Iterator<Item = &'a str>) -> String {
    let mut line = fields.map(quote_field).collect::<Vec<_>>().join(",");
    line.push('\n');
    line
}

fn quote_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Splits CSV content into records. Quoted fields may hold commas, doubled
/// quotes and line breaks; blank lines are skipped.
fn parse_records(content: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => record.push(std::mem::take(&mut field)),
            '\r' if !in_quotes => {}
            '\n' if !in_quotes => {
                record.push(std::mem::take(&mut field));
                push_record(&mut records, std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        push_record(&mut records, record);
    }
    records
}

fn push_record(records: &mut Vec<Vec<String>>, record: Vec<String>) {
    if !matches!(record.as_slice(), [only] if only.is_empty()) {
        records.push(record);
    }
}

#[cfg(test)]
#[path = "tests/ledger_tests.rs"]
mod tests;

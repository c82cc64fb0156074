//! Accounting store: projects, allocations, users and per-user usage rows.
//!
//! The engine only needs a handful of lookups and one upsert, expressed by
//! [`AccountingStore`]. [`AccountingDb`] implements it on SQLite.

pub mod schema;
pub mod sqlite;

use crate::error::SyncResult;

pub use sqlite::AccountingDb;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: i64,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
}

/// New usage figures for one user under one allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageUpdate {
    pub allocation_id: i64,
    pub user_id: i64,
    pub usage_bytes: i64,
    pub usage: f64,
    pub unit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

pub trait AccountingStore {
    /// `(project title, resource name)` for every allocation resource, ordered
    /// by title, allocation id and resource name.
    fn allocation_resources(&self) -> SyncResult<Vec<(String, String)>>;

    fn find_project(&self, title: &str) -> SyncResult<Option<Project>>;

    /// Ids of the project's allocations on `resource`, lowest first.
    fn find_allocations(&self, project_id: i64, resource: &str) -> SyncResult<Vec<i64>>;

    /// Splits `usernames` into known users and unknown names. Unknown names
    /// keep their input order, without repeats.
    fn partition_users(&self, usernames: &[String]) -> SyncResult<(Vec<User>, Vec<String>)>;

    /// Creates the allocation-user row as `Active` or updates it in place,
    /// appending a history row either way.
    fn upsert_allocation_user(&self, update: &UsageUpdate) -> SyncResult<UpsertOutcome>;
}

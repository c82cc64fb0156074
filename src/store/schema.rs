//! SQLite DDL for the accounting store.

use rusqlite::Connection;

use crate::error::SyncResult;

/// Status given to allocation users created by reconciliation.
pub const ACTIVE_STATUS: &str = "Active";

/// Executed with `IF NOT EXISTS`, so replaying on an existing database is a
/// no-op.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS projects (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL UNIQUE
    );",
    "CREATE TABLE IF NOT EXISTS resources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    );",
    "CREATE TABLE IF NOT EXISTS allocations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id),
        created TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS allocation_resources (
        allocation_id INTEGER NOT NULL REFERENCES allocations(id),
        resource_id INTEGER NOT NULL REFERENCES resources(id),
        PRIMARY KEY (allocation_id, resource_id)
    );",
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE
    );",
    "CREATE TABLE IF NOT EXISTS allocation_users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        allocation_id INTEGER NOT NULL REFERENCES allocations(id),
        user_id INTEGER NOT NULL REFERENCES users(id),
        status TEXT NOT NULL,
        usage_bytes INTEGER NOT NULL DEFAULT 0,
        usage REAL NOT NULL DEFAULT 0,
        unit TEXT NOT NULL DEFAULT '',
        created TEXT NOT NULL,
        modified TEXT NOT NULL,
        UNIQUE(allocation_id, user_id)
    );",
    "CREATE TABLE IF NOT EXISTS allocation_user_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        allocation_user_id INTEGER NOT NULL REFERENCES allocation_users(id),
        status TEXT NOT NULL,
        usage_bytes INTEGER NOT NULL,
        usage REAL NOT NULL,
        unit TEXT NOT NULL,
        recorded_at TEXT NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_allocations_project ON allocations(project_id);",
    "CREATE INDEX IF NOT EXISTS idx_history_allocation_user
        ON allocation_user_history(allocation_user_id);",
];

pub fn init_schema(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    for statement in SCHEMA_STATEMENTS {
        conn.execute_batch(statement)?;
    }
    Ok(())
}

use super::schema::{self, ACTIVE_STATUS};
use super::{AccountingStore, Project, UpsertOutcome, UsageUpdate, User};
use crate::error::{SyncError, SyncResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;

/// SQLite-backed accounting store. One connection, owned for the pass.
pub struct AccountingDb {
    conn: Connection,
}

impl AccountingDb {
    /// Opens (creating if needed) the database at `path` and its schema.
    pub fn open(path: &Path) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
            }
        }
        let conn = Connection::open(path)?;
        schema::init_schema(&conn)?;
        tracing::debug!(path = %path.display(), "accounting database opened");
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;
        Ok(Self { conn })
    }
}

impl AccountingStore for AccountingDb {
    fn allocation_resources(&self) -> SyncResult<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.title, r.name
             FROM allocations a
             JOIN projects p ON p.id = a.project_id
             JOIN allocation_resources ar ON ar.allocation_id = a.id
             JOIN resources r ON r.id = ar.resource_id
             ORDER BY p.title, a.id, r.name",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn find_project(&self, title: &str) -> SyncResult<Option<Project>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, title FROM projects WHERE title = ?1",
                params![title],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        title: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    fn find_allocations(&self, project_id: i64, resource: &str) -> SyncResult<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT a.id
             FROM allocations a
             JOIN allocation_resources ar ON ar.allocation_id = a.id
             JOIN resources r ON r.id = ar.resource_id
             WHERE a.project_id = ?1 AND r.name = ?2
             ORDER BY a.id",
        )?;
        let ids = stmt.query_map(params![project_id, resource], |row| row.get(0))?;
        Ok(ids.collect::<Result<Vec<i64>, _>>()?)
    }

    fn partition_users(&self, usernames: &[String]) -> SyncResult<(Vec<User>, Vec<String>)> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id FROM users WHERE username = ?1")?;

        let mut known: HashSet<&str> = HashSet::new();
        let mut present = Vec::new();
        let mut missing: Vec<String> = Vec::new();
        for username in usernames {
            if known.contains(username.as_str()) || missing.contains(username) {
                continue;
            }
            match stmt
                .query_row(params![username], |row| row.get::<_, i64>(0))
                .optional()?
            {
                Some(id) => {
                    known.insert(username);
                    present.push(User {
                        id,
                        username: username.clone(),
                    });
                }
                None => missing.push(username.clone()),
            }
        }
        Ok((present, missing))
    }

    fn upsert_allocation_user(&self, update: &UsageUpdate) -> SyncResult<UpsertOutcome> {
        let now = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;

        let existed = tx
            .query_row(
                "SELECT 1 FROM allocation_users WHERE allocation_id = ?1 AND user_id = ?2",
                params![update.allocation_id, update.user_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        let (row_id, status): (i64, String) = tx.query_row(
            "INSERT INTO allocation_users
                 (allocation_id, user_id, status, usage_bytes, usage, unit, created, modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(allocation_id, user_id) DO UPDATE SET
                 usage_bytes = excluded.usage_bytes,
                 usage = excluded.usage,
                 unit = excluded.unit,
                 modified = excluded.modified
             RETURNING id, status",
            params![
                update.allocation_id,
                update.user_id,
                ACTIVE_STATUS,
                update.usage_bytes,
                update.usage,
                update.unit,
                now
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        tx.execute(
            "INSERT INTO allocation_user_history
                 (allocation_user_id, status, usage_bytes, usage, unit, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![row_id, status, update.usage_bytes, update.usage, update.unit, now],
        )?;
        tx.commit()?;

        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Created
        })
    }
}

/// One `allocation_users` row, as tests read it back.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationUserRow {
    pub id: i64,
    pub status: String,
    pub usage_bytes: i64,
    pub usage: f64,
    pub unit: String,
}

#[cfg(test)]
impl AccountingDb {
    pub fn add_project(&self, title: &str) -> i64 {
        self.conn
            .execute("INSERT INTO projects (title) VALUES (?1)", params![title])
            .unwrap();
        self.conn.last_insert_rowid()
    }

    pub fn add_user(&self, username: &str) -> i64 {
        self.conn
            .execute("INSERT INTO users (username) VALUES (?1)", params![username])
            .unwrap();
        self.conn.last_insert_rowid()
    }

    pub fn add_allocation(&self, project_id: i64, resources: &[&str]) -> i64 {
        self.conn
            .execute(
                "INSERT INTO allocations (project_id) VALUES (?1)",
                params![project_id],
            )
            .unwrap();
        let allocation_id = self.conn.last_insert_rowid();
        for name in resources {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO resources (name) VALUES (?1)",
                    params![name],
                )
                .unwrap();
            self.conn
                .execute(
                    "INSERT INTO allocation_resources (allocation_id, resource_id)
                     SELECT ?1, id FROM resources WHERE name = ?2",
                    params![allocation_id, name],
                )
                .unwrap();
        }
        allocation_id
    }

    pub fn allocation_users(&self, allocation_id: i64) -> Vec<(String, AllocationUserRow)> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT u.username, au.id, au.status, au.usage_bytes, au.usage, au.unit
                 FROM allocation_users au JOIN users u ON u.id = au.user_id
                 WHERE au.allocation_id = ?1 ORDER BY u.username",
            )
            .unwrap();
        stmt.query_map(params![allocation_id], |row| {
            Ok((
                row.get(0)?,
                AllocationUserRow {
                    id: row.get(1)?,
                    status: row.get(2)?,
                    usage_bytes: row.get(3)?,
                    usage: row.get(4)?,
                    unit: row.get(5)?,
                },
            ))
        })
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
    }

    pub fn history_len(&self, allocation_user_id: i64) -> i64 {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM allocation_user_history WHERE allocation_user_id = ?1",
                params![allocation_user_id],
                |row| row.get(0),
            )
            .unwrap()
    }
}

#[cfg(test)]
#[path = "tests/sqlite_tests.rs"]
mod tests;

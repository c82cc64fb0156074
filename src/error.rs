//! Error and notice types for the usage-sync engine.
//!
//! `SyncError` covers every condition that aborts work: a whole pass, one
//! query job, or one snapshot file. Conditions that are expected during a
//! normal pass (empty results, ambiguous allocations, unknown users) are not
//! errors; they are reported as [`Notice`]s and logged.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("authentication failed on {server}: {message}")]
    Auth { server: String, message: String },

    #[error("query submission rejected for {target}: {message}")]
    Submission { target: String, message: String },

    #[error("HTTP error from {url}: {message}")]
    Http { url: String, message: String },

    #[error("unexpected response from usage service: {0}")]
    Protocol(String),

    #[error("query {job_id} not done after {polls} polls")]
    PollLimit { job_id: String, polls: u32 },

    #[error("sync pass cancelled")]
    Cancelled,

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("accounting store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no project titled '{0}'")]
    MissingProject(String),

    #[error("no allocation for project '{project}' on resource '{resource}'")]
    MissingAllocation { project: String, resource: String },

    #[error("could not lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    /// Errors that halt the whole pass rather than a single job or file.
    pub fn is_fatal_for_pass(&self) -> bool {
        matches!(
            self,
            Self::Auth { .. } | Self::Cancelled | Self::Store(_) | Self::Config(_) | Self::Lock { .. }
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Expected, non-fatal conditions surfaced during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The query finished without rows; the pair stays uncollected.
    EmptyResult { project: String, volume: String },
    /// The query finished with an error payload; the pair stays uncollected.
    ServiceError {
        project: String,
        volume: String,
        detail: String,
    },
    /// More than one allocation matched; `chosen` was updated.
    MultipleAllocations {
        project: String,
        resource: String,
        chosen: i64,
        count: usize,
    },
    /// A usage row referenced a user the accounting store does not know.
    MissingIdentity { username: String },
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::EmptyResult { project, volume } => {
                write!(f, "no usage result for {} on {}", project, volume)
            }
            Notice::ServiceError {
                project,
                volume,
                detail,
            } => write!(f, "error result for {} on {}: {}", project, volume, detail),
            Notice::MultipleAllocations {
                project,
                resource,
                chosen,
                count,
            } => write!(
                f,
                "{} allocations for {} on {}, updating allocation {}",
                count, project, resource, chosen
            ),
            Notice::MissingIdentity { username } => write!(f, "unknown user {}", username),
        }
    }
}

#[cfg(test)]
#[path = "tests/error_tests.rs"]
mod tests;

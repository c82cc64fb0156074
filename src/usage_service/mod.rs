//! Client side of the remote file-indexing ("usage") service.
//!
//! This module provides:
//! - The `UsageService` trait, one implementation per service version
//! - `HttpUsageService`, the bearer-token HTTP implementation
//! - `AsyncQuery`, the submit/poll/fetch lifecycle of one aggregation job

pub mod api_client;
#[cfg(test)]
pub mod fake;
pub mod query;
pub mod types;

use crate::error::SyncResult;
use crate::registry::ServerEntry;
use types::{MembershipRecord, MembershipType, QueryRequest};

/// Raw calls against one usage-service server.
///
/// Every call except `authenticate` requires a token; a call made without
/// one, or with an expired one, fails with `SyncError::Auth` and is not
/// retried here.
pub trait UsageService {
    fn server_name(&self) -> &str;

    fn authenticate(&mut self) -> SyncResult<()>;

    /// Volume names exposed by the server, in service order.
    fn list_volumes(&self) -> SyncResult<Vec<String>>;

    /// Directory basenames directly under `volume_path` (`volume:path`).
    fn list_subpaths(&self, volume_path: &str) -> SyncResult<Vec<String>>;

    fn volume_membership(
        &self,
        volume: &str,
        membership: MembershipType,
    ) -> SyncResult<Vec<MembershipRecord>>;

    /// Posts an async query, returning the job id.
    fn submit_query(&self, request: &QueryRequest) -> SyncResult<String>;

    fn query_is_done(&self, job_id: &str) -> SyncResult<bool>;

    fn query_result(&self, job_id: &str) -> SyncResult<serde_json::Value>;
}

/// Builds an authenticated service for a registry server.
pub trait ServiceConnector: Send {
    fn connect(&self, server: &str, entry: &ServerEntry) -> SyncResult<Box<dyn UsageService>>;
}

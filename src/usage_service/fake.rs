//! Scripted in-memory usage service for tests.

use super::types::{MembershipRecord, MembershipType, QueryRequest};
use super::{ServiceConnector, UsageService};
use crate::error::{SyncError, SyncResult};
use crate::registry::ServerEntry;
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Scripted behaviour shared by every service a [`FakeConnector`] hands out.
#[derive(Debug, Default)]
pub struct FakeScript {
    pub volumes: Vec<String>,
    pub subpaths: HashMap<String, Vec<String>>,
    pub group_members: Vec<String>,
    /// Volumes whose membership lookup fails with HTTP 502.
    pub membership_failures: Vec<String>,
    /// Result payload per query string (`type=f groupname=<lab>`).
    pub results: HashMap<String, serde_json::Value>,
    /// Queries whose submission is rejected.
    pub rejected: Vec<String>,
    /// Status answers handed out in order; an empty queue answers done.
    pub statuses: VecDeque<bool>,
    pub fail_auth: bool,
    /// Expire each service's token after this many calls.
    pub token_lifetime: Option<usize>,
}

/// What the fake saw, for assertions.
#[derive(Debug, Default)]
pub struct FakeLog {
    pub connects: Vec<String>,
    pub submitted: Vec<QueryRequest>,
    pub status_polls: usize,
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    pub script: Arc<Mutex<FakeScript>>,
    pub log: Arc<Mutex<FakeLog>>,
}

impl FakeConnector {
    pub fn new(script: FakeScript) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            log: Arc::new(Mutex::new(FakeLog::default())),
        }
    }

    pub fn service(&self, server: &str) -> FakeService {
        FakeService {
            name: server.to_string(),
            authenticated: false,
            calls: Cell::new(0),
            script: self.script.clone(),
            log: self.log.clone(),
        }
    }
}

impl ServiceConnector for FakeConnector {
    fn connect(&self, server: &str, _entry: &ServerEntry) -> SyncResult<Box<dyn UsageService>> {
        self.log.lock().unwrap().connects.push(server.to_string());
        let mut service = self.service(server);
        service.authenticate()?;
        Ok(Box::new(service))
    }
}

pub struct FakeService {
    name: String,
    authenticated: bool,
    calls: Cell<usize>,
    script: Arc<Mutex<FakeScript>>,
    log: Arc<Mutex<FakeLog>>,
}

impl FakeService {
    fn check_token(&self) -> SyncResult<()> {
        self.calls.set(self.calls.get() + 1);
        let expired = self
            .script
            .lock()
            .unwrap()
            .token_lifetime
            .is_some_and(|lifetime| self.calls.get() > lifetime);
        if !self.authenticated || expired {
            return Err(SyncError::Auth {
                server: self.name.clone(),
                message: "token rejected".to_string(),
            });
        }
        Ok(())
    }
}

impl UsageService for FakeService {
    fn server_name(&self) -> &str {
        &self.name
    }

    fn authenticate(&mut self) -> SyncResult<()> {
        if self.script.lock().unwrap().fail_auth {
            return Err(SyncError::Auth {
                server: self.name.clone(),
                message: "HTTP 401".to_string(),
            });
        }
        self.authenticated = true;
        Ok(())
    }

    fn list_volumes(&self) -> SyncResult<Vec<String>> {
        self.check_token()?;
        Ok(self.script.lock().unwrap().volumes.clone())
    }

    fn list_subpaths(&self, volume_path: &str) -> SyncResult<Vec<String>> {
        self.check_token()?;
        Ok(self
            .script
            .lock()
            .unwrap()
            .subpaths
            .get(volume_path)
            .cloned()
            .unwrap_or_default())
    }

    fn volume_membership(
        &self,
        volume: &str,
        membership: MembershipType,
    ) -> SyncResult<Vec<MembershipRecord>> {
        self.check_token()?;
        if self.script.lock().unwrap().membership_failures.iter().any(|v| v == volume) {
            return Err(SyncError::Http {
                url: "mapping/group_membership".to_string(),
                message: "HTTP 502".to_string(),
            });
        }
        let key = match membership {
            MembershipType::Group => "groupname",
        };
        Ok(self
            .script
            .lock()
            .unwrap()
            .group_members
            .iter()
            .map(|name| {
                let mut map = serde_json::Map::new();
                map.insert(key.to_string(), serde_json::json!(name));
                MembershipRecord(map)
            })
            .collect())
    }

    fn submit_query(&self, request: &QueryRequest) -> SyncResult<String> {
        self.check_token()?;
        let mut log = self.log.lock().unwrap();
        log.submitted.push(request.clone());
        if self.script.lock().unwrap().rejected.contains(&request.query) {
            return Err(SyncError::Submission {
                target: request.volume_and_path.clone(),
                message: "HTTP 400".to_string(),
            });
        }
        Ok(format!("q{}", log.submitted.len()))
    }

    fn query_is_done(&self, _job_id: &str) -> SyncResult<bool> {
        self.check_token()?;
        self.log.lock().unwrap().status_polls += 1;
        Ok(self
            .script
            .lock()
            .unwrap()
            .statuses
            .pop_front()
            .unwrap_or(true))
    }

    fn query_result(&self, job_id: &str) -> SyncResult<serde_json::Value> {
        self.check_token()?;
        let log = self.log.lock().unwrap();
        let index: usize = job_id.trim_start_matches('q').parse().unwrap_or(0);
        let query = log
            .submitted
            .get(index.saturating_sub(1))
            .map(|request| request.query.clone())
            .unwrap_or_default();
        Ok(self
            .script
            .lock()
            .unwrap()
            .results
            .get(&query)
            .cloned()
            .unwrap_or(serde_json::Value::Array(Vec::new())))
    }
}

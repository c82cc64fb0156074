//! Bearer-token HTTP client for the usage service API.

use super::types::{MembershipRecord, MembershipType, QueryRequest};
use super::{ServiceConnector, UsageService};
use crate::error::{SyncError, SyncResult};
use crate::registry::ServerEntry;
use std::time::Duration;

pub struct HttpUsageService {
    name: String,
    api_url: String,
    username: String,
    password: String,
    token: Option<String>,
    agent: ureq::Agent,
}

impl HttpUsageService {
    pub fn new(name: &str, base_url: &str, username: &str, password: &str, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();

        Self {
            name: name.to_string(),
            api_url: api_url(base_url),
            username: username.to_string(),
            password: password.to_string(),
            token: None,
            agent,
        }
    }

    fn bearer(&self) -> SyncResult<String> {
        self.token
            .as_ref()
            .map(|token| format!("Bearer {}", token))
            .ok_or_else(|| SyncError::Auth {
                server: self.name.clone(),
                message: "not authenticated".to_string(),
            })
    }

    fn get_json(&self, path: &str, query: &[(&str, &str)]) -> SyncResult<serde_json::Value> {
        let url = format!("{}{}", self.api_url, path);
        let mut request = self
            .agent
            .get(&url)
            .header("accept", "application/json")
            .header("Authorization", &self.bearer()?);
        for (key, value) in query {
            request = request.query(*key, *value);
        }

        let body = request
            .call()
            .map_err(|e| self.classify_error(&url, e))?
            .body_mut()
            .read_to_string()
            .map_err(|e| self.classify_error(&url, e))?;

        serde_json::from_str(&body).map_err(|e| SyncError::json(format!("GET {}", url), e))
    }

    /// Maps transport failures onto the error taxonomy: 401/403 always mean
    /// the token is gone.
    fn classify_error(&self, url: &str, error: ureq::Error) -> SyncError {
        match error {
            ureq::Error::StatusCode(code @ (401 | 403)) => SyncError::Auth {
                server: self.name.clone(),
                message: format!("HTTP {} from {}", code, url),
            },
            other => SyncError::Http {
                url: url.to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl UsageService for HttpUsageService {
    fn server_name(&self) -> &str {
        &self.name
    }

    fn authenticate(&mut self) -> SyncResult<()> {
        let url = format!("{}auth/", self.api_url);
        tracing::debug!(server = %self.name, "requesting auth token");

        let request_body = serde_json::json!({
            "username": self.username,
            "password": self.password,
        });
        let request_body_str = serde_json::to_string(&request_body)
            .map_err(|e| SyncError::json("auth request", e))?;

        let auth_failure = |message: String| SyncError::Auth {
            server: self.name.clone(),
            message,
        };

        let body = self
            .agent
            .post(&url)
            .header("accept", "application/json")
            .header("Content-Type", "application/json")
            .send(&request_body_str)
            .map_err(|e| auth_failure(e.to_string()))?
            .body_mut()
            .read_to_string()
            .map_err(|e| auth_failure(e.to_string()))?;

        let token = parse_token(&body).ok_or_else(|| auth_failure("response has no token".to_string()))?;
        self.token = Some(token);
        tracing::info!(server = %self.name, "authenticated to usage service");
        Ok(())
    }

    fn list_volumes(&self) -> SyncResult<Vec<String>> {
        let response = self.get_json("storage/", &[])?;
        parse_items(&response, "name")
    }

    fn list_subpaths(&self, volume_path: &str) -> SyncResult<Vec<String>> {
        let response = self.get_json(&format!("storage/{}", volume_path), &[])?;
        parse_items(&response, "Basename")
    }

    fn volume_membership(
        &self,
        volume: &str,
        membership: MembershipType,
    ) -> SyncResult<Vec<MembershipRecord>> {
        let path = format!("mapping/{}_membership", membership.as_str());
        let response = self.get_json(&path, &[("volume_name", volume)])?;
        serde_json::from_value(response).map_err(|e| SyncError::json(path, e))
    }

    fn submit_query(&self, request: &QueryRequest) -> SyncResult<String> {
        let url = format!("{}async/query/", self.api_url);
        tracing::debug!(
            server = %self.name,
            volume_path = %request.volume_and_path,
            query = %request.query,
            "submitting async query"
        );

        let params = request.params();
        let response = self
            .agent
            .post(&url)
            .header("accept", "application/json")
            .header("Authorization", &self.bearer()?)
            .query_pairs(params.iter().map(|(k, v)| (*k, v.as_str())))
            .send_empty();

        let body = match response {
            Ok(mut response) => response
                .body_mut()
                .read_to_string()
                .map_err(|e| self.classify_error(&url, e))?,
            Err(ureq::Error::StatusCode(code)) if (400..500).contains(&code) && code != 401 && code != 403 => {
                return Err(SyncError::Submission {
                    target: request.volume_and_path.clone(),
                    message: format!("HTTP {}", code),
                });
            }
            Err(e) => return Err(self.classify_error(&url, e)),
        };

        let response: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| SyncError::json("async query submission", e))?;
        parse_query_id(&response).ok_or_else(|| SyncError::Submission {
            target: request.volume_and_path.clone(),
            message: format!("no query_id in response: {}", response),
        })
    }

    fn query_is_done(&self, job_id: &str) -> SyncResult<bool> {
        let response = self.get_json(&format!("async/query/{}", job_id), &[])?;
        parse_is_done(&response)
    }

    fn query_result(&self, job_id: &str) -> SyncResult<serde_json::Value> {
        self.get_json(&format!("async/query_result/{}", job_id), &[])
    }
}

/// Connects to registry servers over HTTP with one set of credentials.
pub struct HttpConnector {
    username: String,
    password: String,
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(username: String, password: String, timeout: Duration) -> Self {
        Self {
            username,
            password,
            timeout,
        }
    }
}

impl ServiceConnector for HttpConnector {
    fn connect(&self, server: &str, entry: &ServerEntry) -> SyncResult<Box<dyn UsageService>> {
        let mut service =
            HttpUsageService::new(server, &entry.url, &self.username, &self.password, self.timeout);
        service.authenticate()?;
        Ok(Box::new(service))
    }
}

/// `https://host` -> `https://host/api/`
fn api_url(base_url: &str) -> String {
    format!("{}/api/", base_url.trim_end_matches('/'))
}

fn parse_token(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value["token"]
        .as_str()
        .filter(|token| !token.is_empty())
        .map(String::from)
}

/// Pulls `field` out of every entry of an `{items: [...]}` listing.
fn parse_items(response: &serde_json::Value, field: &str) -> SyncResult<Vec<String>> {
    let items = response["items"]
        .as_array()
        .ok_or_else(|| SyncError::Protocol(format!("listing has no items array: {}", response)))?;
    items
        .iter()
        .map(|item| {
            item[field]
                .as_str()
                .map(String::from)
                .ok_or_else(|| SyncError::Protocol(format!("listing entry has no {}: {}", field, item)))
        })
        .collect()
}

fn parse_query_id(response: &serde_json::Value) -> Option<String> {
    match &response["query_id"] {
        serde_json::Value::String(id) if !id.is_empty() => Some(id.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_is_done(response: &serde_json::Value) -> SyncResult<bool> {
    response["is_done"]
        .as_bool()
        .ok_or_else(|| SyncError::Protocol(format!("query status has no is_done: {}", response)))
}

#[cfg(test)]
#[path = "tests/api_client_tests.rs"]
mod tests;

//! Static server registry: which usage-service server hosts which volume.
//!
//! ```json
//! {
//!   "holysfdb01": {
//!     "url": "https://holysfdb01.example.edu",
//!     "volumes": { "tier1": ["labs", "labs_l3"] }
//!   }
//! }
//! ```

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerEntry {
    pub url: String,
    /// Volume name -> subpaths, default tier first.
    pub volumes: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ServerRegistry {
    servers: BTreeMap<String, ServerEntry>,
}

impl ServerRegistry {
    pub fn load(path: &Path) -> SyncResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SyncError::io(path, e))?;
        let registry = Self::from_json(&content)
            .map_err(|e| SyncError::json(format!("server registry {}", path.display()), e))?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    fn validate(&self) -> SyncResult<()> {
        for (name, entry) in &self.servers {
            if entry.url.trim().is_empty() {
                return Err(SyncError::Config(format!("server {} has no url", name)));
            }
            if let Some((volume, _)) = entry.volumes.iter().find(|(_, paths)| paths.is_empty()) {
                return Err(SyncError::Config(format!(
                    "volume {} on server {} lists no subpaths",
                    volume, name
                )));
            }
        }
        Ok(())
    }

    pub fn server(&self, name: &str) -> Option<&ServerEntry> {
        self.servers.get(name)
    }

    /// The server hosting `volume`. When several servers list it, the first
    /// by name wins.
    pub fn server_for_volume(&self, volume: &str) -> Option<(&str, &ServerEntry)> {
        self.servers
            .iter()
            .find(|(_, entry)| entry.volumes.contains_key(volume))
            .map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn subpaths(&self, volume: &str) -> Option<&[String]> {
        self.server_for_volume(volume)
            .and_then(|(_, entry)| entry.volumes.get(volume))
            .map(Vec::as_slice)
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;

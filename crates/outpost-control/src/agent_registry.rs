//! Directory of agents the manager may queue work for and tunnel to
//!
//! The inventory itself lives elsewhere; the manager only needs to know which
//! agent ids exist and where their tunnel endpoint is. The registry is seeded
//! from a JSON file at startup and can be updated at runtime.

use async_trait::async_trait;
use dashmap::DashMap;
use outpost_queue::KnownAgents;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

fn default_target_address() -> String {
    "127.0.0.1:443".to_string()
}

/// Tunnel details for one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    /// SSH endpoint the tunnel process connects to (e.g. "fw-a7.example.net")
    pub tunnel_host: String,
    /// Service on the agent side that the tunnel forwards to
    #[serde(default = "default_target_address")]
    pub target_address: String,
}

/// Agent lookup used by the tunnel manager
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn lookup(&self, agent_id: &str) -> Option<AgentRecord>;
}

#[derive(Debug, Error)]
pub enum AgentFileError {
    #[error("Failed to read agent file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse agent file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid agent entry: {0}")]
    Invalid(String),
}

/// In-memory agent directory
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<DashMap<String, AgentRecord>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = AgentRecord>) -> Self {
        let registry = Self::new();
        for record in records {
            registry.register(record);
        }
        registry
    }

    /// Load a JSON array of [`AgentRecord`]s
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AgentFileError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let records: Vec<AgentRecord> = serde_json::from_str(&raw)?;

        for record in &records {
            if record.agent_id.trim().is_empty() {
                return Err(AgentFileError::Invalid("empty agent_id".to_string()));
            }
            if record.tunnel_host.trim().is_empty() {
                return Err(AgentFileError::Invalid(format!(
                    "agent {} has no tunnel_host",
                    record.agent_id
                )));
            }
        }

        info!(
            path = %path.as_ref().display(),
            agents = records.len(),
            "Loaded agent directory"
        );
        Ok(Self::from_records(records))
    }

    /// Add or replace an agent; returns the previous record
    pub fn register(&self, record: AgentRecord) -> Option<AgentRecord> {
        let previous = self.agents.insert(record.agent_id.clone(), record.clone());
        debug!(
            agent_id = %record.agent_id,
            tunnel_host = %record.tunnel_host,
            replaced = previous.is_some(),
            "Registered agent"
        );
        previous
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.get(agent_id).map(|entry| entry.value().clone())
    }

    pub fn count(&self) -> usize {
        self.agents.len()
    }
}

#[async_trait]
impl AgentDirectory for AgentRegistry {
    async fn lookup(&self, agent_id: &str) -> Option<AgentRecord> {
        self.get(agent_id)
    }
}

#[async_trait]
impl KnownAgents for AgentRegistry {
    async fn is_known(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn record(id: &str) -> AgentRecord {
        AgentRecord {
            agent_id: id.to_string(),
            tunnel_host: format!("{}.fw.example.net", id.to_lowercase()),
            target_address: default_target_address(),
        }
    }

    #[test]
    fn test_register_replaces() {
        let registry = AgentRegistry::new();
        assert!(registry.register(record("A7")).is_none());

        let mut updated = record("A7");
        updated.tunnel_host = "10.0.0.7".to_string();
        let previous = registry.register(updated).unwrap();

        assert_eq!(previous.tunnel_host, "a7.fw.example.net");
        assert_eq!(registry.get("A7").unwrap().tunnel_host, "10.0.0.7");
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_known_agents() {
        let registry = AgentRegistry::from_records([record("A1"), record("A2")]);
        assert!(registry.is_known("A1").await);
        assert!(!registry.is_known("A3").await);
        assert!(!registry.is_known("").await);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"agent_id": "A42", "tunnel_host": "fw42.example.net"}},
                {{"agent_id": "A7", "tunnel_host": "fw7.example.net", "target_address": "127.0.0.1:8443"}}
            ]"#
        )
        .unwrap();

        let registry = AgentRegistry::load(file.path()).unwrap();
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.get("A42").unwrap().target_address, "127.0.0.1:443");
        assert_eq!(registry.get("A7").unwrap().target_address, "127.0.0.1:8443");
    }

    #[test]
    fn test_load_rejects_missing_host() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"agent_id": "A1", "tunnel_host": " "}}]"#).unwrap();

        assert!(matches!(
            AgentRegistry::load(file.path()),
            Err(AgentFileError::Invalid(_))
        ));
    }
}

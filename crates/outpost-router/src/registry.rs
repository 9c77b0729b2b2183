//! Binding registry for tunnel sessions
//!
//! Each binding maps one public path to one local tunnel port. A port can be
//! bound at most once; binding ids are unique. The registry is in-memory only:
//! after a restart bindings are re-registered from the persisted sessions.

use crate::TUNNEL_PATH_PREFIX;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

/// A public endpoint bound to a local tunnel port
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyBinding {
    pub binding_id: String,
    /// Tunnel session owning this binding
    pub session_id: String,
    pub agent_id: String,
    pub local_port: u16,
    /// Full public URL, e.g. `https://manager.example.com/tunnel/3f2a.../`
    pub public_url: String,
    pub created_at: DateTime<Utc>,
}

impl ProxyBinding {
    /// Upstream address requests are forwarded to
    pub fn upstream_addr(&self) -> String {
        format!("127.0.0.1:{}", self.local_port)
    }
}

/// Binding registry errors
#[derive(Debug, Error)]
pub enum BindingError {
    #[error("Binding not found: {0}")]
    BindingNotFound(String),

    #[error("Binding already exists: {0}")]
    BindingAlreadyExists(String),

    #[error("Port {port} is already bound by {binding_id}")]
    PortAlreadyBound { port: u16, binding_id: String },
}

/// Registry of live proxy bindings
pub struct ProxyRegistry {
    public_base_url: String,
    bindings: Arc<DashMap<String, ProxyBinding>>,
    /// local_port -> binding_id
    ports: Arc<DashMap<u16, String>>,
}

impl ProxyRegistry {
    /// Create a registry that builds public URLs under `public_base_url`
    /// (e.g. `https://manager.example.com`).
    pub fn new(public_base_url: impl Into<String>) -> Self {
        let public_base_url = public_base_url.into().trim_end_matches('/').to_string();
        Self {
            public_base_url,
            bindings: Arc::new(DashMap::new()),
            ports: Arc::new(DashMap::new()),
        }
    }

    pub fn public_url_for(&self, binding_id: &str) -> String {
        format!(
            "{}{}/{}/",
            self.public_base_url, TUNNEL_PATH_PREFIX, binding_id
        )
    }

    /// Bind a fresh public endpoint to `local_port`
    pub fn bind(
        &self,
        session_id: &str,
        agent_id: &str,
        local_port: u16,
    ) -> Result<ProxyBinding, BindingError> {
        let binding_id = Uuid::new_v4().simple().to_string();
        self.restore(&binding_id, session_id, agent_id, local_port)
    }

    /// Re-register a binding under a known id (startup restore)
    pub fn restore(
        &self,
        binding_id: &str,
        session_id: &str,
        agent_id: &str,
        local_port: u16,
    ) -> Result<ProxyBinding, BindingError> {
        if self.bindings.contains_key(binding_id) {
            return Err(BindingError::BindingAlreadyExists(binding_id.to_string()));
        }

        match self.ports.entry(local_port) {
            Entry::Occupied(existing) => {
                return Err(BindingError::PortAlreadyBound {
                    port: local_port,
                    binding_id: existing.get().clone(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(binding_id.to_string());
            }
        }

        let binding = ProxyBinding {
            binding_id: binding_id.to_string(),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            local_port,
            public_url: self.public_url_for(binding_id),
            created_at: Utc::now(),
        };

        debug!(
            binding_id = %binding.binding_id,
            session_id = %session_id,
            local_port,
            "Registered proxy binding"
        );
        self.bindings
            .insert(binding.binding_id.clone(), binding.clone());
        Ok(binding)
    }

    pub fn lookup(&self, binding_id: &str) -> Result<ProxyBinding, BindingError> {
        trace!("Looking up proxy binding {}", binding_id);
        self.bindings
            .get(binding_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BindingError::BindingNotFound(binding_id.to_string()))
    }

    /// Remove a binding and free its port
    pub fn unbind(&self, binding_id: &str) -> Result<ProxyBinding, BindingError> {
        let (_, binding) = self
            .bindings
            .remove(binding_id)
            .ok_or_else(|| BindingError::BindingNotFound(binding_id.to_string()))?;

        self.ports
            .remove_if(&binding.local_port, |_, owner| owner == binding_id);

        debug!(
            binding_id = %binding_id,
            local_port = binding.local_port,
            "Removed proxy binding"
        );
        Ok(binding)
    }

    pub fn exists(&self, binding_id: &str) -> bool {
        self.bindings.contains_key(binding_id)
    }

    pub fn all_bindings(&self) -> Vec<ProxyBinding> {
        self.bindings
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.bindings.len()
    }
}

impl Default for ProxyRegistry {
    fn default() -> Self {
        Self::new("https://localhost")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_lookup() {
        let registry = ProxyRegistry::new("https://manager.example.com/");
        let binding = registry.bind("sess-1", "A7", 8100).unwrap();

        let found = registry.lookup(&binding.binding_id).unwrap();
        assert_eq!(found.session_id, "sess-1");
        assert_eq!(found.local_port, 8100);
        assert_eq!(found.upstream_addr(), "127.0.0.1:8100");
        assert_eq!(
            found.public_url,
            format!(
                "https://manager.example.com/tunnel/{}/",
                binding.binding_id
            )
        );
    }

    #[test]
    fn test_port_can_only_be_bound_once() {
        let registry = ProxyRegistry::default();
        registry.bind("sess-1", "A1", 8100).unwrap();

        let result = registry.bind("sess-2", "A2", 8100);
        assert!(matches!(
            result,
            Err(BindingError::PortAlreadyBound { port: 8100, .. })
        ));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_unbind_frees_port() {
        let registry = ProxyRegistry::default();
        let binding = registry.bind("sess-1", "A1", 8100).unwrap();

        registry.unbind(&binding.binding_id).unwrap();
        assert_eq!(registry.count(), 0);

        // Port is reusable afterwards
        assert!(registry.bind("sess-2", "A2", 8100).is_ok());
    }

    #[test]
    fn test_unbind_unknown() {
        let registry = ProxyRegistry::default();
        assert!(matches!(
            registry.unbind("missing"),
            Err(BindingError::BindingNotFound(_))
        ));
    }

    #[test]
    fn test_restore_keeps_binding_id() {
        let registry = ProxyRegistry::new("https://m.example.com");
        let restored = registry.restore("abc123", "sess-9", "A9", 8150).unwrap();

        assert_eq!(restored.binding_id, "abc123");
        assert_eq!(restored.public_url, "https://m.example.com/tunnel/abc123/");
        assert!(registry.exists("abc123"));

        let duplicate = registry.restore("abc123", "sess-9", "A9", 8151);
        assert!(matches!(
            duplicate,
            Err(BindingError::BindingAlreadyExists(_))
        ));
    }
}

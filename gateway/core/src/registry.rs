//! Service Registry
//!
//! Holds the set of known backend guards, their addresses, and declared
//! capabilities. Populated from static configuration at startup via an
//! explicit typed registration API; re-registration is rare and idempotent
//! by name (last write wins, first-seen order preserved).
//!
//! No network or blocking I/O happens here. The registry is read-mostly
//! after startup and hands out `Arc<GuardDescriptor>` snapshots so readers
//! never hold the lock across await points.
//!
//! Iteration order is registration order: fan-out ordering must be stable
//! for deterministic tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Guard Descriptor
// ============================================================================

/// Static description of one backend guard service.
///
/// Identity is the name. Health state lives in the Health Monitor, not
/// here; descriptors are immutable once registered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardDescriptor {
    /// Unique guard name
    pub name: String,
    /// Base URL of the guard service, e.g. `http://toxicity:8080`
    pub base_url: String,
    /// Declared request/response schema tag
    #[serde(default = "default_schema_tag")]
    pub schema_tag: String,
    /// Capabilities this guard serves, e.g. `["toxicity", "spam"]`
    pub capabilities: Vec<String>,
    /// Whether this guard must answer for a call to count as successful
    #[serde(default)]
    pub required: bool,
    /// Whether results from this guard may be cached and served from cache
    #[serde(default = "default_true")]
    pub cache_eligible: bool,
}

fn default_schema_tag() -> String {
    "v1".to_string()
}

fn default_true() -> bool {
    true
}

impl GuardDescriptor {
    /// Create a descriptor with defaults (optional, cache-eligible, `v1`)
    #[must_use]
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            schema_tag: default_schema_tag(),
            capabilities: Vec::new(),
            required: false,
            cache_eligible: true,
        }
    }

    /// Set the declared capabilities
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Mark the guard as required for overall success
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Disable caching for this guard
    #[must_use]
    pub fn no_cache(mut self) -> Self {
        self.cache_eligible = false;
        self
    }

    /// Whether this guard declares the given capability
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// URL of the guard's analysis endpoint
    #[must_use]
    pub fn dispatch_url(&self) -> String {
        format!("{}/analyze", self.base_url.trim_end_matches('/'))
    }

    /// URL of the guard's liveness endpoint polled by the Health Monitor
    #[must_use]
    pub fn probe_url(&self) -> String {
        format!("{}/healthz", self.base_url.trim_end_matches('/'))
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Registry errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// `get` was called with an unknown guard name
    #[error("guard not found: {0}")]
    NotFound(String),
}

struct RegistryInner {
    /// Guard names in first-registration order
    order: Vec<String>,
    /// Descriptors by name
    guards: HashMap<String, Arc<GuardDescriptor>>,
}

/// The set of known guards, in stable registration order
pub struct ServiceRegistry {
    inner: RwLock<RegistryInner>,
}

impl ServiceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                order: Vec::new(),
                guards: HashMap::new(),
            }),
        }
    }

    /// Register a guard.
    ///
    /// Idempotent by name: registering an existing name replaces the
    /// descriptor but keeps its original position in iteration order.
    pub fn register(&self, descriptor: GuardDescriptor) {
        let mut inner = self.inner.write();
        let name = descriptor.name.clone();
        if inner.guards.insert(name.clone(), Arc::new(descriptor)).is_none() {
            inner.order.push(name.clone());
        }
        tracing::debug!(guard = %name, "Registered guard");
    }

    /// Look up a guard by name
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for unknown names.
    pub fn get(&self, name: &str) -> Result<Arc<GuardDescriptor>, RegistryError> {
        self.inner
            .read()
            .guards
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// List guards, optionally filtered by capability, in registration order
    #[must_use]
    pub fn list(&self, capability: Option<&str>) -> Vec<Arc<GuardDescriptor>> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|name| inner.guards.get(name))
            .filter(|g| capability.is_none_or(|c| g.has_capability(c)))
            .cloned()
            .collect()
    }

    /// All registered guards in registration order
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<GuardDescriptor>> {
        self.list(None)
    }

    /// Number of registered guards
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(name: &str, caps: &[&str]) -> GuardDescriptor {
        GuardDescriptor::new(name, format!("http://{name}:9000"))
            .with_capabilities(caps.iter().map(ToString::to_string).collect())
    }

    #[test]
    fn test_register_and_get() {
        let registry = ServiceRegistry::new();
        registry.register(guard("toxicity", &["toxicity"]));

        let found = registry.get("toxicity").unwrap();
        assert_eq!(found.name, "toxicity");
        assert_eq!(found.dispatch_url(), "http://toxicity:9000/analyze");
        assert_eq!(found.probe_url(), "http://toxicity:9000/healthz");

        assert_eq!(
            registry.get("missing"),
            Err(RegistryError::NotFound("missing".to_string()))
        );
    }

    #[test]
    fn test_registration_order_is_stable() {
        let registry = ServiceRegistry::new();
        registry.register(guard("c", &["x"]));
        registry.register(guard("a", &["x"]));
        registry.register(guard("b", &["x"]));

        let names: Vec<_> = registry.snapshot().iter().map(|g| g.name.clone()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_reregistration_is_idempotent_and_keeps_order() {
        let registry = ServiceRegistry::new();
        registry.register(guard("a", &["x"]));
        registry.register(guard("b", &["x"]));

        // Re-register "a" with new capabilities; it must keep slot 0.
        registry.register(guard("a", &["y"]));

        assert_eq!(registry.len(), 2);
        let names: Vec<_> = registry.snapshot().iter().map(|g| g.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(registry.get("a").unwrap().has_capability("y"));
        assert!(!registry.get("a").unwrap().has_capability("x"));
    }

    #[test]
    fn test_list_filters_by_capability() {
        let registry = ServiceRegistry::new();
        registry.register(guard("a", &["toxicity", "spam"]));
        registry.register(guard("b", &["bias"]));
        registry.register(guard("c", &["toxicity"]));

        let toxic: Vec<_> = registry
            .list(Some("toxicity"))
            .iter()
            .map(|g| g.name.clone())
            .collect();
        assert_eq!(toxic, vec!["a", "c"]);

        assert!(registry.list(Some("nonexistent")).is_empty());
        assert_eq!(registry.list(None).len(), 3);
    }

    #[test]
    fn test_trailing_slash_normalized_in_urls() {
        let g = GuardDescriptor::new("a", "http://a:1/");
        assert_eq!(g.dispatch_url(), "http://a:1/analyze");
    }
}

//! Node-source handles and the source registry.
//!
//! A node source is a named pool of nodes backed by an infrastructure
//! provider and an acquisition policy. The coordinator owns every source
//! through the [`SourceRegistry`]; nodes refer back to their source by name
//! only, so the set of nodes a source owns is derived from the node
//! registry rather than stored twice.

use std::collections::HashMap;
use std::sync::Arc;

use crate::infrastructure::InfrastructureProvider;
use crate::policy::AcquisitionPolicy;

/// Name of the always-present source created at startup. It cannot be
/// removed except by whole-system shutdown.
pub const DEFAULT_SOURCE_NAME: &str = "default";

/// The coordinator's proxy to one node source.
pub struct NodeSourceHandle {
    name: String,

    /// Health-check interval handed to the source's pinger, in milliseconds.
    ping_frequency_ms: u32,

    provider: Arc<dyn InfrastructureProvider>,

    policy: Arc<dyn AcquisitionPolicy>,
}

impl NodeSourceHandle {
    pub fn new(
        name: impl Into<String>,
        ping_frequency_ms: u32,
        provider: Arc<dyn InfrastructureProvider>,
        policy: Arc<dyn AcquisitionPolicy>,
    ) -> Self {
        Self {
            name: name.into(),
            ping_frequency_ms,
            provider,
            policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ping_frequency(&self) -> u32 {
        self.ping_frequency_ms
    }

    pub fn set_ping_frequency(&mut self, frequency_ms: u32) {
        self.ping_frequency_ms = frequency_ms;
    }

    pub fn provider(&self) -> Arc<dyn InfrastructureProvider> {
        Arc::clone(&self.provider)
    }

    pub fn policy(&self) -> Arc<dyn AcquisitionPolicy> {
        Arc::clone(&self.policy)
    }
}

impl std::fmt::Debug for NodeSourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSourceHandle")
            .field("name", &self.name)
            .field("ping_frequency_ms", &self.ping_frequency_ms)
            .finish_non_exhaustive()
    }
}

/// Provider and policy instances for direct source construction, used when
/// the caller builds plugins itself instead of going through the type-name
/// factories.
pub struct SourcePlugins {
    pub provider: Arc<dyn InfrastructureProvider>,
    pub policy: Arc<dyn AcquisitionPolicy>,
}

impl std::fmt::Debug for SourcePlugins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourcePlugins").finish_non_exhaustive()
    }
}

/// The authoritative map of active node sources.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: HashMap<String, NodeSourceHandle>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source. Name uniqueness is checked by the coordinator before
    /// construction; a duplicate insert here replaces, which must not
    /// happen in practice.
    pub fn insert(&mut self, handle: NodeSourceHandle) {
        self.sources.insert(handle.name().to_string(), handle);
    }

    pub fn remove(&mut self, name: &str) -> Option<NodeSourceHandle> {
        self.sources.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&NodeSourceHandle> {
        self.sources.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut NodeSourceHandle> {
        self.sources.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeSourceHandle> {
        self.sources.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NodeSourceHandle> {
        self.sources.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::MockInfrastructure;
    use crate::policy::StaticPolicy;

    fn handle(name: &str) -> NodeSourceHandle {
        NodeSourceHandle::new(
            name,
            10_000,
            Arc::new(MockInfrastructure::new()),
            Arc::new(StaticPolicy),
        )
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut registry = SourceRegistry::new();
        registry.insert(handle("gcm-pool"));

        assert!(registry.contains("gcm-pool"));
        assert_eq!(registry.get("gcm-pool").unwrap().ping_frequency(), 10_000);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_returns_handle() {
        let mut registry = SourceRegistry::new();
        registry.insert(handle("gcm-pool"));

        let removed = registry.remove("gcm-pool").unwrap();
        assert_eq!(removed.name(), "gcm-pool");
        assert!(registry.is_empty());
        assert!(registry.remove("gcm-pool").is_none());
    }

    #[test]
    fn test_ping_frequency_update() {
        let mut registry = SourceRegistry::new();
        registry.insert(handle(DEFAULT_SOURCE_NAME));

        registry
            .get_mut(DEFAULT_SOURCE_NAME)
            .unwrap()
            .set_ping_frequency(2_500);
        assert_eq!(
            registry.get(DEFAULT_SOURCE_NAME).unwrap().ping_frequency(),
            2_500
        );
    }
}

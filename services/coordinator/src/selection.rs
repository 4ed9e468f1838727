//! Node selection interface.
//!
//! Allocation requests ("give me up to N nodes matching these predicates")
//! are forwarded verbatim to an external selector; the coordinator applies
//! no filtering or reordering of its own. Only the shutdown gate lives in
//! the coordinator: once shutdown is initiated no request reaches the
//! selector at all.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// An ordered selection predicate, opaque to the core.
///
/// Predicates are evaluated by the selector in list order; the core only
/// transports them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionPredicate {
    /// Predicate name, for logging and selector-side dispatch.
    pub name: String,

    /// Predicate parameters, interpreted by the selector.
    pub params: serde_json::Value,
}

impl SelectionPredicate {
    pub fn new(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

/// A set of node URLs handed to or excluded from an allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSet {
    urls: Vec<String>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_urls(urls: Vec<String>) -> Self {
        Self { urls }
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.urls.iter().any(|u| u == url)
    }
}

/// External selection collaborator.
#[async_trait]
pub trait NodeSelector: Send + Sync {
    /// Pick up to `count` nodes matching the ordered predicates, skipping
    /// everything in `exclusion`.
    async fn find_nodes(
        &self,
        count: usize,
        predicates: &[SelectionPredicate],
        exclusion: &NodeSet,
    ) -> NodeSet;

    /// Release selector resources at coordinator teardown.
    async fn shutdown(&self);
}

/// Selector for deployments with no scheduler attached: every allocation
/// comes back empty.
#[derive(Debug, Default)]
pub struct EmptySelector;

#[async_trait]
impl NodeSelector for EmptySelector {
    async fn find_nodes(
        &self,
        count: usize,
        predicates: &[SelectionPredicate],
        _exclusion: &NodeSet,
    ) -> NodeSet {
        debug!(count, predicates = predicates.len(), "No scheduler attached, selecting nothing");
        NodeSet::new()
    }

    async fn shutdown(&self) {}
}

/// Mock selector for testing: hands out seeded URLs in order, honoring the
/// count and exclusion set.
pub struct MockSelector {
    candidates: Vec<String>,
}

impl MockSelector {
    pub fn new(candidates: Vec<String>) -> Self {
        Self { candidates }
    }

    /// A selector with nothing to offer.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl NodeSelector for MockSelector {
    async fn find_nodes(
        &self,
        count: usize,
        predicates: &[SelectionPredicate],
        exclusion: &NodeSet,
    ) -> NodeSet {
        debug!(
            count,
            predicates = predicates.len(),
            excluded = exclusion.len(),
            "[MOCK] Selecting nodes"
        );
        let urls = self
            .candidates
            .iter()
            .filter(|url| !exclusion.contains(url))
            .take(count)
            .cloned()
            .collect();
        NodeSet::from_urls(urls)
    }

    async fn shutdown(&self) {
        debug!("[MOCK] Selector shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_selector_selects_nothing() {
        let selector = EmptySelector;

        let set = selector.find_nodes(3, &[], &NodeSet::new()).await;
        assert!(set.is_empty());
        selector.shutdown().await;
    }

    #[tokio::test]
    async fn test_mock_selector_honors_count() {
        let selector = MockSelector::new(vec![
            "rmi://a/n1".to_string(),
            "rmi://a/n2".to_string(),
            "rmi://a/n3".to_string(),
        ]);

        let set = selector.find_nodes(2, &[], &NodeSet::new()).await;
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn test_mock_selector_honors_exclusion() {
        let selector = MockSelector::new(vec![
            "rmi://a/n1".to_string(),
            "rmi://a/n2".to_string(),
        ]);
        let exclusion = NodeSet::from_urls(vec!["rmi://a/n1".to_string()]);

        let set = selector.find_nodes(5, &[], &exclusion).await;
        assert_eq!(set.urls(), ["rmi://a/n2".to_string()]);
    }

    #[test]
    fn test_node_set_serialization() {
        let set = NodeSet::from_urls(vec!["rmi://a/n1".to_string()]);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"{"urls":["rmi://a/n1"]}"#);
    }
}

//! Node descriptors and the node lifecycle state machine.
//!
//! A node is one allocatable compute resource, keyed everywhere by its URL.
//! The descriptor carries only the *name* of the owning source, never a
//! reference to it; ownership of source objects stays with the source
//! registry and the node/source graph stays tree-shaped.

use gridpool_events::NodeState;
use thiserror::Error;

/// A state transition that the lifecycle state machine forbids.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid node transition {from} -> {to} for {url}")]
pub struct InvalidTransition {
    pub url: String,
    pub from: NodeState,
    pub to: NodeState,
}

/// One compute resource tracked by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    /// Unique node URL, the sole lookup key.
    url: String,

    /// Name of the owning node source (lookup key into the source registry).
    source_name: String,

    /// Current lifecycle state.
    state: NodeState,
}

impl NodeDescriptor {
    /// Create a descriptor for a freshly acquired node. Nodes enter the
    /// registry in the `Free` state.
    pub fn new(url: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            source_name: source_name.into(),
            state: NodeState::Free,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_free(&self) -> bool {
        self.state == NodeState::Free
    }

    pub fn is_busy(&self) -> bool {
        self.state == NodeState::Busy
    }

    pub fn is_to_release(&self) -> bool {
        self.state == NodeState::ToRelease
    }

    pub fn is_down(&self) -> bool {
        self.state == NodeState::Down
    }

    /// Free -> Busy. The node starts executing work.
    pub fn set_busy(&mut self) -> Result<(), InvalidTransition> {
        self.transition(NodeState::Busy, |from| from == NodeState::Free)
    }

    /// Busy -> Free. The node finished its work and can be handed out again.
    pub fn set_free(&mut self) -> Result<(), InvalidTransition> {
        self.transition(NodeState::Free, |from| from == NodeState::Busy)
    }

    /// Busy -> ToRelease. Removal was requested while the node is busy;
    /// the physical release is deferred until the node is freed.
    pub fn set_to_release(&mut self) -> Result<(), InvalidTransition> {
        self.transition(NodeState::ToRelease, |from| from == NodeState::Busy)
    }

    /// Any state -> Down. Reported health failures win over everything;
    /// idempotent if the node is already down.
    pub fn set_down(&mut self) {
        self.state = NodeState::Down;
    }

    fn transition(
        &mut self,
        to: NodeState,
        precondition: impl FnOnce(NodeState) -> bool,
    ) -> Result<(), InvalidTransition> {
        if !precondition(self.state) {
            return Err(InvalidTransition {
                url: self.url.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_node_is_free() {
        let node = NodeDescriptor::new("rmi://host:1099/n1", "default");
        assert!(node.is_free());
        assert_eq!(node.source_name(), "default");
    }

    #[test]
    fn test_busy_free_cycle() {
        let mut node = NodeDescriptor::new("rmi://host:1099/n1", "default");
        node.set_busy().unwrap();
        assert!(node.is_busy());
        node.set_free().unwrap();
        assert!(node.is_free());
    }

    #[test]
    fn test_busy_requires_free() {
        let mut node = NodeDescriptor::new("rmi://host:1099/n1", "default");
        node.set_busy().unwrap();

        let err = node.set_busy().unwrap_err();
        assert_eq!(err.from, NodeState::Busy);
        assert_eq!(err.to, NodeState::Busy);
        // state untouched by the rejected transition
        assert!(node.is_busy());
    }

    #[test]
    fn test_to_release_only_from_busy() {
        let mut node = NodeDescriptor::new("rmi://host:1099/n1", "default");
        assert!(node.set_to_release().is_err());

        node.set_busy().unwrap();
        node.set_to_release().unwrap();
        assert!(node.is_to_release());
    }

    #[test]
    fn test_down_from_any_state_and_idempotent() {
        let mut node = NodeDescriptor::new("rmi://host:1099/n1", "default");
        node.set_down();
        assert!(node.is_down());

        // no error, no change
        node.set_down();
        assert!(node.is_down());

        // a down node cannot be busied or freed
        assert!(node.set_busy().is_err());
        assert!(node.set_free().is_err());
    }
}

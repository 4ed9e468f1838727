//! The authoritative node registry.
//!
//! Owns every [`NodeDescriptor`] known to the coordinator plus the derived
//! free list. Mutating operations return the event that must be broadcast,
//! so "exactly one event per mutation" is enforced by the return type
//! rather than by call-site discipline. The registry never talks to node
//! sources or the broadcaster itself.
//!
//! Unknown URLs are warnings, not errors: node callbacks and the scheduler
//! race against removals, so stale requests are expected traffic.

use std::collections::HashMap;

use gridpool_events::{event_types, NodeEvent, NodeState};
use tracing::{debug, warn};

use crate::node::NodeDescriptor;

/// Map of all known nodes plus the free subset.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    /// All nodes keyed by URL.
    all: HashMap<String, NodeDescriptor>,

    /// URLs of nodes in the `Free` state, in registration order.
    free: Vec<String>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly acquired node in the `Free` state.
    ///
    /// Re-registering a URL replaces the previous descriptor; ownership
    /// conflicts are checked by the coordinator before this point.
    pub fn add(&mut self, url: &str, source_name: &str) -> NodeEvent {
        // drop any stale free entry from a previous registration
        self.free.retain(|u| u != url);

        let node = NodeDescriptor::new(url, source_name);
        self.free.push(url.to_string());
        self.all.insert(url.to_string(), node);

        debug!(url, source = source_name, "Node registered");
        NodeEvent::new(event_types::NODE_ADDED, url, source_name, NodeState::Free)
    }

    /// Free -> Busy. Unknown URLs and invalid prior states are skipped with
    /// a warning.
    pub fn mark_busy(&mut self, url: &str) -> Option<NodeEvent> {
        let Some(node) = self.all.get_mut(url) else {
            warn!(url, "Attempt to mark unknown node busy");
            return None;
        };

        if let Err(e) = node.set_busy() {
            warn!(url, error = %e, "Rejected busy transition");
            return None;
        }

        self.free.retain(|u| u != url);
        Some(NodeEvent::new(
            event_types::NODE_STATE_CHANGED,
            url,
            node.source_name(),
            NodeState::Busy,
        ))
    }

    /// Busy -> Free. Returns `None` without warning only for states the
    /// coordinator handles separately (ToRelease, Down).
    pub fn mark_free(&mut self, url: &str) -> Option<NodeEvent> {
        let Some(node) = self.all.get_mut(url) else {
            warn!(url, "Attempt to free unknown node");
            return None;
        };

        if let Err(e) = node.set_free() {
            warn!(url, error = %e, "Rejected free transition");
            return None;
        }

        self.free.push(url.to_string());
        Some(NodeEvent::new(
            event_types::NODE_STATE_CHANGED,
            url,
            node.source_name(),
            NodeState::Free,
        ))
    }

    /// Busy -> ToRelease. Physical release is deferred until the node is
    /// freed.
    pub fn mark_to_release(&mut self, url: &str) -> Option<NodeEvent> {
        let Some(node) = self.all.get_mut(url) else {
            warn!(url, "Attempt to mark unknown node for release");
            return None;
        };

        if let Err(e) = node.set_to_release() {
            warn!(url, error = %e, "Rejected to-release transition");
            return None;
        }

        debug!(url, "Node marked for deferred release");
        Some(NodeEvent::new(
            event_types::NODE_STATE_CHANGED,
            url,
            node.source_name(),
            NodeState::ToRelease,
        ))
    }

    /// Any state -> Down. Idempotent: a node that is already down produces
    /// no event.
    pub fn mark_down(&mut self, url: &str) -> Option<NodeEvent> {
        let Some(node) = self.all.get_mut(url) else {
            // the node was removed asynchronously while the health check
            // was still observing it
            debug!(url, "Down report for unknown node, ignoring");
            return None;
        };

        if node.is_down() {
            return None;
        }

        node.set_down();
        self.free.retain(|u| u != url);
        Some(NodeEvent::new(
            event_types::NODE_STATE_CHANGED,
            url,
            node.source_name(),
            NodeState::Down,
        ))
    }

    /// Remove a node from the registry entirely, returning its descriptor
    /// and the removal event. The caller decides whether the owning source
    /// must be notified.
    pub fn remove(&mut self, url: &str) -> Option<(NodeDescriptor, NodeEvent)> {
        let node = self.all.remove(url)?;
        self.free.retain(|u| u != url);

        let event = NodeEvent::new(
            event_types::NODE_REMOVED,
            url,
            node.source_name(),
            node.state(),
        );
        Some((node, event))
    }

    pub fn get(&self, url: &str) -> Option<&NodeDescriptor> {
        self.all.get(url)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.all.contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// URLs of free nodes owned by the given source, in registration order.
    pub fn free_urls_of_source(&self, source_name: &str) -> Vec<String> {
        self.free
            .iter()
            .filter(|url| {
                self.all
                    .get(*url)
                    .is_some_and(|n| n.source_name() == source_name)
            })
            .cloned()
            .collect()
    }

    /// URLs of all nodes owned by the given source.
    pub fn urls_of_source(&self, source_name: &str) -> Vec<String> {
        self.all
            .values()
            .filter(|n| n.source_name() == source_name)
            .map(|n| n.url().to_string())
            .collect()
    }

    /// URLs of the source's nodes that are not down.
    pub fn alive_urls_of_source(&self, source_name: &str) -> Vec<String> {
        self.all
            .values()
            .filter(|n| n.source_name() == source_name && !n.is_down())
            .map(|n| n.url().to_string())
            .collect()
    }

    /// URLs of the source's down nodes.
    pub fn down_urls_of_source(&self, source_name: &str) -> Vec<String> {
        self.all
            .values()
            .filter(|n| n.source_name() == source_name && n.is_down())
            .map(|n| n.url().to_string())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.all.values()
    }

    /// Invariant check: the free list is exactly the set of free nodes.
    #[cfg(test)]
    pub fn free_list_consistent(&self) -> bool {
        let from_states: std::collections::HashSet<&str> = self
            .all
            .values()
            .filter(|n| n.is_free())
            .map(|n| n.url())
            .collect();
        let from_list: std::collections::HashSet<&str> =
            self.free.iter().map(|s| s.as_str()).collect();
        from_states == from_list && self.free.len() == from_list.len()
    }
}

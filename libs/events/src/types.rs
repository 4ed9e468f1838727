//! Event type definitions for the resource manager.
//!
//! Each event family has a payload struct with the event-specific data.
//! Event type names are string constants so that consumers can match on
//! them without depending on enum exhaustiveness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Node
    pub const NODE_ADDED: &str = "node.added";
    pub const NODE_STATE_CHANGED: &str = "node.state_changed";
    pub const NODE_REMOVED: &str = "node.removed";

    // Node source
    pub const SOURCE_CREATED: &str = "source.created";
    pub const SOURCE_REMOVED: &str = "source.removed";

    // System
    pub const SYSTEM_STARTED: &str = "system.started";
    pub const SYSTEM_SHUTTING_DOWN: &str = "system.shutting_down";
    pub const SYSTEM_SHUT_DOWN: &str = "system.shut_down";
}

// =============================================================================
// Node State
// =============================================================================

/// Node lifecycle state as seen by event consumers.
///
/// Mirrors the coordinator's state machine: a node is `Free` when it can be
/// handed out, `Busy` while executing work, `ToRelease` when its removal is
/// deferred until the current work completes, and `Down` when unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Free,
    Busy,
    ToRelease,
    Down,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Free => "free",
            NodeState::Busy => "busy",
            NodeState::ToRelease => "to_release",
            NodeState::Down => "down",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Event Payloads
// =============================================================================

/// Event concerning a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    /// Event type (one of the `node.*` constants).
    pub event_type: String,

    /// URL of the node the event is about.
    pub node_url: String,

    /// Name of the node source that owns the node.
    pub source_name: String,

    /// Node state after the event.
    pub state: NodeState,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

impl NodeEvent {
    /// Create a node event stamped with the current time.
    pub fn new(
        event_type: &str,
        node_url: impl Into<String>,
        source_name: impl Into<String>,
        state: NodeState,
    ) -> Self {
        Self {
            event_type: event_type.to_string(),
            node_url: node_url.into(),
            source_name: source_name.into(),
            state,
            occurred_at: Utc::now(),
        }
    }
}

/// Event concerning a node source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEvent {
    /// Event type (one of the `source.*` constants).
    pub event_type: String,

    /// Name of the node source.
    pub source_name: String,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

impl SourceEvent {
    /// Create a source event stamped with the current time.
    pub fn new(event_type: &str, source_name: impl Into<String>) -> Self {
        Self {
            event_type: event_type.to_string(),
            source_name: source_name.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// Event concerning the resource manager as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    /// Event type (one of the `system.*` constants).
    pub event_type: String,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

impl SystemEvent {
    /// Create a system event stamped with the current time.
    pub fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            occurred_at: Utc::now(),
        }
    }
}

/// Snapshot of the coordinator's topology for a newly attached monitor.
///
/// A monitor that starts consuming events mid-stream needs the current
/// state of the world first: every known node as a `node.added` event and
/// every registered source as a `source.created` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySnapshot {
    /// One `node.added` event per known node.
    pub nodes: Vec<NodeEvent>,

    /// One `source.created` event per registered source.
    pub sources: Vec<SourceEvent>,
}

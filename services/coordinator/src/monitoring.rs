//! Outbound event broadcasting.
//!
//! The coordinator emits one event per mutating operation to an external
//! monitoring collaborator. Emission is fire-and-forget: no return value is
//! consumed and the coordinator never waits for the consumer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use gridpool_events::{NodeEvent, SourceEvent, SystemEvent};
use tracing::info;

/// Monitoring collaborator contract.
pub trait EventBroadcaster: Send + Sync {
    fn node_event(&self, event: NodeEvent);

    fn source_event(&self, event: SourceEvent);

    fn system_event(&self, event: SystemEvent);

    /// Release broadcaster resources at coordinator teardown.
    fn shutdown(&self);
}

/// Broadcaster that writes every event to the structured log. Used by the
/// service binary when no monitoring transport is attached.
pub struct LogBroadcaster;

impl EventBroadcaster for LogBroadcaster {
    fn node_event(&self, event: NodeEvent) {
        info!(
            event_type = %event.event_type,
            url = %event.node_url,
            source = %event.source_name,
            state = %event.state,
            "Node event"
        );
    }

    fn source_event(&self, event: SourceEvent) {
        info!(
            event_type = %event.event_type,
            source = %event.source_name,
            "Source event"
        );
    }

    fn system_event(&self, event: SystemEvent) {
        info!(event_type = %event.event_type, "System event");
    }

    fn shutdown(&self) {
        info!("Event broadcaster shut down");
    }
}

/// Broadcaster that records every event for inspection in tests.
#[derive(Default)]
pub struct RecordingBroadcaster {
    node_events: Mutex<Vec<NodeEvent>>,
    source_events: Mutex<Vec<SourceEvent>>,
    system_events: Mutex<Vec<SystemEvent>>,
    shutdown_calls: AtomicUsize,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_events(&self) -> Vec<NodeEvent> {
        self.node_events.lock().unwrap().clone()
    }

    pub fn source_events(&self) -> Vec<SourceEvent> {
        self.source_events.lock().unwrap().clone()
    }

    pub fn system_events(&self) -> Vec<SystemEvent> {
        self.system_events.lock().unwrap().clone()
    }

    /// Count of system events with the given type.
    pub fn system_event_count(&self, event_type: &str) -> usize {
        self.system_events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }
}

impl EventBroadcaster for RecordingBroadcaster {
    fn node_event(&self, event: NodeEvent) {
        self.node_events.lock().unwrap().push(event);
    }

    fn source_event(&self, event: SourceEvent) {
        self.source_events.lock().unwrap().push(event);
    }

    fn system_event(&self, event: SystemEvent) {
        self.system_events.lock().unwrap().push(event);
    }

    fn shutdown(&self) {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridpool_events::{event_types, NodeState};

    #[test]
    fn test_recording_broadcaster_collects_events() {
        let broadcaster = RecordingBroadcaster::new();

        broadcaster.node_event(NodeEvent::new(
            event_types::NODE_ADDED,
            "rmi://a/n1",
            "default",
            NodeState::Free,
        ));
        broadcaster.system_event(SystemEvent::new(event_types::SYSTEM_STARTED));
        broadcaster.shutdown();

        assert_eq!(broadcaster.node_events().len(), 1);
        assert_eq!(broadcaster.system_event_count(event_types::SYSTEM_STARTED), 1);
        assert_eq!(broadcaster.shutdown_calls(), 1);
    }
}

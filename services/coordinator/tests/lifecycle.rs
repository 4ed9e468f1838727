//! End-to-end lifecycle tests driven through the coordinator handle.
//!
//! Every scenario talks to a real coordinator actor; sources are backed by
//! mock infrastructure so physical acquisition and release can be observed.
//! Delegated work lands through the mailbox, so tests settle briefly after
//! fire-and-forget operations before asserting.

use std::sync::Arc;
use std::time::Duration;

use gridpool_coordinator::actor::ActorRef;
use gridpool_coordinator::auth::CallerId;
use gridpool_coordinator::config::Config;
use gridpool_coordinator::coordinator::{Coordinator, CoordinatorHandle};
use gridpool_coordinator::error::CoreError;
use gridpool_coordinator::infrastructure::{InfrastructureProvider, MockInfrastructure};
use gridpool_coordinator::monitoring::RecordingBroadcaster;
use gridpool_coordinator::policy::StaticPolicy;
use gridpool_coordinator::selection::{MockSelector, NodeSet, NodeSelector};
use gridpool_coordinator::DEFAULT_SOURCE_NAME;
use gridpool_events::{event_types, NodeState};
use rstest::rstest;

/// Long enough for a spawned callback to land back in the mailbox.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn start() -> (CoordinatorHandle, ActorRef, Arc<RecordingBroadcaster>) {
    start_with_selector(Arc::new(MockSelector::empty())).await
}

async fn start_with_selector(
    selector: Arc<dyn NodeSelector>,
) -> (CoordinatorHandle, ActorRef, Arc<RecordingBroadcaster>) {
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let (handle, actor_ref) = Coordinator::start(&Config::default(), broadcaster.clone(), selector)
        .await
        .unwrap();
    (handle, actor_ref, broadcaster)
}

/// Create a source backed by the given mock infrastructure.
async fn add_mock_source(handle: &CoordinatorHandle, name: &str, infra: &Arc<MockInfrastructure>) {
    handle
        .create_node_source_with(
            CallerId::admin(),
            name,
            Arc::clone(infra) as Arc<dyn InfrastructureProvider>,
            Arc::new(StaticPolicy),
        )
        .await
        .unwrap();
}

/// Current lifecycle state of a node, if registered.
async fn state_of(handle: &CoordinatorHandle, url: &str) -> Option<NodeState> {
    let snapshot = handle.topology_snapshot(CallerId::monitoring()).await.unwrap();
    snapshot
        .nodes
        .iter()
        .find(|n| n.node_url == url)
        .map(|n| n.state)
}

// =============================================================================
// Startup and registration
// =============================================================================

#[tokio::test]
async fn startup_announces_itself_and_creates_default_source() {
    let (handle, _ref, broadcaster) = start().await;

    assert_eq!(broadcaster.system_event_count(event_types::SYSTEM_STARTED), 1);

    let sources = broadcaster.source_events();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].source_name, DEFAULT_SOURCE_NAME);

    assert_eq!(handle.node_count(CallerId::monitoring()).await.unwrap(), 0);
}

#[tokio::test]
async fn announced_node_is_registered_free() {
    let (handle, _ref, broadcaster) = start().await;

    assert!(handle.add_node("rmi://h1/n1").await.unwrap());
    settle().await;

    assert_eq!(handle.node_count(CallerId::monitoring()).await.unwrap(), 1);
    assert_eq!(handle.free_node_count(CallerId::monitoring()).await.unwrap(), 1);

    let events = broadcaster.node_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, event_types::NODE_ADDED);
    assert_eq!(events[0].state, NodeState::Free);
}

#[tokio::test]
async fn batch_deployment_registers_every_node() {
    let (handle, _ref, _broadcaster) = start().await;

    let params = serde_json::json!(["rmi://h1/n1", "rmi://h1/n2", "rmi://h2/n1"]);
    handle
        .add_nodes(CallerId::admin(), DEFAULT_SOURCE_NAME, params)
        .await
        .unwrap();
    settle().await;

    assert_eq!(handle.node_count(CallerId::monitoring()).await.unwrap(), 3);
}

#[tokio::test]
async fn node_cannot_move_between_sources() {
    let (handle, _ref, _broadcaster) = start().await;
    let infra = Arc::new(MockInfrastructure::new());
    add_mock_source(&handle, "extra", &infra).await;

    handle.add_node("rmi://h1/n1").await.unwrap();
    settle().await;

    let err = handle
        .add_node_to_source("rmi://h1/n1", "extra")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CoreError::NodeOwnershipConflict {
            url: "rmi://h1/n1".to_string(),
            owner: DEFAULT_SOURCE_NAME.to_string(),
        }
    );

    // re-announcing under the owning source is a plain re-registration
    handle.add_node("rmi://h1/n1").await.unwrap();
    settle().await;
    assert_eq!(handle.node_count(CallerId::monitoring()).await.unwrap(), 1);
}

#[tokio::test]
async fn failed_reacquisition_marks_the_node_down() {
    let (handle, _ref, _broadcaster) = start().await;
    let infra = Arc::new(MockInfrastructure::new());
    add_mock_source(&handle, "extra", &infra).await;

    handle.add_node_to_source("rmi://h1/n1", "extra").await.unwrap();
    settle().await;
    assert_eq!(state_of(&handle, "rmi://h1/n1").await, Some(NodeState::Free));

    infra.set_failing(true);
    handle.add_node_to_source("rmi://h1/n1", "extra").await.unwrap();
    settle().await;

    assert_eq!(state_of(&handle, "rmi://h1/n1").await, Some(NodeState::Down));
}

// =============================================================================
// Busy / free cycle
// =============================================================================

#[tokio::test]
async fn busy_free_cycle_emits_one_event_per_transition() {
    let (handle, _ref, broadcaster) = start().await;

    handle.add_node("rmi://h1/n1").await.unwrap();
    settle().await;

    handle.mark_busy(CallerId::allocation(), "rmi://h1/n1").await.unwrap();
    assert_eq!(state_of(&handle, "rmi://h1/n1").await, Some(NodeState::Busy));
    assert_eq!(handle.free_node_count(CallerId::monitoring()).await.unwrap(), 0);

    handle.mark_free(CallerId::allocation(), "rmi://h1/n1").await.unwrap();
    assert_eq!(state_of(&handle, "rmi://h1/n1").await, Some(NodeState::Free));
    assert_eq!(handle.free_node_count(CallerId::monitoring()).await.unwrap(), 1);

    // freeing an already-free node neither fails nor emits
    handle.mark_free(CallerId::allocation(), "rmi://h1/n1").await.unwrap();

    let events = broadcaster.node_events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].event_type, event_types::NODE_ADDED);
    assert_eq!(events[1].state, NodeState::Busy);
    assert_eq!(events[2].state, NodeState::Free);
}

#[tokio::test]
async fn batch_free_absorbs_unknown_and_already_free_urls() {
    let (handle, _ref, broadcaster) = start().await;

    handle.add_node("rmi://h1/n1").await.unwrap();
    handle.add_node("rmi://h1/n2").await.unwrap();
    settle().await;
    handle.mark_busy(CallerId::allocation(), "rmi://h1/n1").await.unwrap();
    let before = broadcaster.node_events().len();

    handle
        .mark_free_many(
            CallerId::allocation(),
            vec![
                "rmi://h1/n1".to_string(), // busy, comes back free
                "rmi://h1/n2".to_string(), // already free
                "rmi://h9/n9".to_string(), // never registered
            ],
        )
        .await
        .unwrap();

    assert_eq!(state_of(&handle, "rmi://h1/n1").await, Some(NodeState::Free));
    assert_eq!(state_of(&handle, "rmi://h1/n2").await, Some(NodeState::Free));
    assert_eq!(handle.node_count(CallerId::monitoring()).await.unwrap(), 2);
    assert_eq!(handle.free_node_count(CallerId::monitoring()).await.unwrap(), 2);

    // only the busy node actually transitioned
    assert_eq!(broadcaster.node_events().len(), before + 1);
    assert_eq!(broadcaster.node_events()[before].state, NodeState::Free);
}

#[rstest]
#[case::already_busy(NodeState::Busy)]
#[case::down(NodeState::Down)]
#[case::scheduled_for_removal(NodeState::ToRelease)]
#[tokio::test]
async fn marking_a_non_free_node_busy_is_skipped(#[case] state: NodeState) {
    let (handle, _ref, broadcaster) = start().await;

    handle.add_node("rmi://h1/n1").await.unwrap();
    settle().await;

    match state {
        NodeState::Busy => {
            handle.mark_busy(CallerId::allocation(), "rmi://h1/n1").await.unwrap();
        }
        NodeState::Down => {
            handle.mark_down(CallerId::monitoring(), "rmi://h1/n1").await.unwrap();
        }
        NodeState::ToRelease => {
            handle.mark_busy(CallerId::allocation(), "rmi://h1/n1").await.unwrap();
            handle
                .remove_node(CallerId::admin(), "rmi://h1/n1", false, false)
                .await
                .unwrap();
        }
        NodeState::Free => unreachable!(),
    }
    let before = broadcaster.node_events().len();

    handle.mark_busy(CallerId::allocation(), "rmi://h1/n1").await.unwrap();

    assert_eq!(state_of(&handle, "rmi://h1/n1").await, Some(state));
    assert_eq!(broadcaster.node_events().len(), before);
}

#[tokio::test]
async fn freeing_a_down_node_changes_nothing() {
    let (handle, _ref, broadcaster) = start().await;

    handle.add_node("rmi://h1/n1").await.unwrap();
    settle().await;

    handle.mark_down(CallerId::monitoring(), "rmi://h1/n1").await.unwrap();
    handle.mark_free(CallerId::allocation(), "rmi://h1/n1").await.unwrap();

    assert_eq!(state_of(&handle, "rmi://h1/n1").await, Some(NodeState::Down));
    assert_eq!(broadcaster.node_events().len(), 2);
}

#[tokio::test]
async fn mark_down_is_idempotent() {
    let (handle, _ref, broadcaster) = start().await;

    handle.add_node("rmi://h1/n1").await.unwrap();
    settle().await;

    handle.mark_down(CallerId::monitoring(), "rmi://h1/n1").await.unwrap();
    handle.mark_down(CallerId::monitoring(), "rmi://h1/n1").await.unwrap();

    assert_eq!(broadcaster.node_events().len(), 2);
}

// =============================================================================
// Removal
// =============================================================================

#[tokio::test]
async fn free_node_is_removed_and_released_immediately() {
    let (handle, _ref, _broadcaster) = start().await;
    let infra = Arc::new(MockInfrastructure::new());
    add_mock_source(&handle, "extra", &infra).await;

    handle.add_node_to_source("rmi://h1/n1", "extra").await.unwrap();
    settle().await;

    handle
        .remove_node(CallerId::admin(), "rmi://h1/n1", false, false)
        .await
        .unwrap();
    settle().await;

    assert_eq!(handle.node_count(CallerId::monitoring()).await.unwrap(), 0);
    assert_eq!(infra.released(), vec![("rmi://h1/n1".to_string(), false)]);
}

#[tokio::test]
async fn busy_node_removal_is_deferred_until_freed() {
    let (handle, _ref, _broadcaster) = start().await;
    let infra = Arc::new(MockInfrastructure::new());
    add_mock_source(&handle, "extra", &infra).await;

    handle.add_node_to_source("rmi://h1/n1", "extra").await.unwrap();
    settle().await;
    handle.mark_busy(CallerId::allocation(), "rmi://h1/n1").await.unwrap();

    handle
        .remove_node(CallerId::admin(), "rmi://h1/n1", false, false)
        .await
        .unwrap();

    // the node keeps running its workload
    assert_eq!(state_of(&handle, "rmi://h1/n1").await, Some(NodeState::ToRelease));
    assert!(infra.released().is_empty());

    // freeing fires the deferred removal
    handle.mark_free(CallerId::allocation(), "rmi://h1/n1").await.unwrap();
    settle().await;

    assert_eq!(handle.node_count(CallerId::monitoring()).await.unwrap(), 0);
    assert_eq!(infra.released(), vec![("rmi://h1/n1".to_string(), false)]);
}

#[tokio::test]
async fn preemptive_removal_evicts_a_busy_node() {
    let (handle, _ref, _broadcaster) = start().await;
    let infra = Arc::new(MockInfrastructure::new());
    add_mock_source(&handle, "extra", &infra).await;

    handle.add_node_to_source("rmi://h1/n1", "extra").await.unwrap();
    settle().await;
    handle.mark_busy(CallerId::allocation(), "rmi://h1/n1").await.unwrap();

    handle
        .remove_node(CallerId::admin(), "rmi://h1/n1", true, true)
        .await
        .unwrap();
    settle().await;

    assert_eq!(handle.node_count(CallerId::monitoring()).await.unwrap(), 0);
    assert_eq!(infra.released(), vec![("rmi://h1/n1".to_string(), true)]);
}

#[tokio::test]
async fn bulk_removal_prefers_free_nodes() {
    let (handle, _ref, _broadcaster) = start().await;
    let infra = Arc::new(MockInfrastructure::new());
    add_mock_source(&handle, "extra", &infra).await;

    for url in ["rmi://h1/n1", "rmi://h1/n2", "rmi://h1/n3"] {
        handle.add_node_to_source(url, "extra").await.unwrap();
    }
    settle().await;
    handle.mark_busy(CallerId::allocation(), "rmi://h1/n2").await.unwrap();

    let removed = handle
        .remove_nodes(CallerId::admin(), 2, "extra", true)
        .await
        .unwrap();
    settle().await;

    assert_eq!(removed, 2);
    // the busy node survived even preemptively, the free ones went first
    assert_eq!(state_of(&handle, "rmi://h1/n2").await, Some(NodeState::Busy));
    assert_eq!(handle.node_count(CallerId::monitoring()).await.unwrap(), 1);
}

#[tokio::test]
async fn bulk_removal_falls_back_to_busy_nodes() {
    let (handle, _ref, _broadcaster) = start().await;
    let infra = Arc::new(MockInfrastructure::new());
    add_mock_source(&handle, "extra", &infra).await;

    handle.add_node_to_source("rmi://h1/n1", "extra").await.unwrap();
    handle.add_node_to_source("rmi://h1/n2", "extra").await.unwrap();
    settle().await;
    handle.mark_busy(CallerId::allocation(), "rmi://h1/n2").await.unwrap();

    let removed = handle
        .remove_nodes(CallerId::admin(), 2, "extra", false)
        .await
        .unwrap();
    settle().await;

    assert_eq!(removed, 2);
    // the busy node was only scheduled, not evicted
    assert_eq!(state_of(&handle, "rmi://h1/n2").await, Some(NodeState::ToRelease));
}

#[tokio::test]
async fn bulk_removal_reports_shortfall() {
    let (handle, _ref, _broadcaster) = start().await;
    let infra = Arc::new(MockInfrastructure::new());
    add_mock_source(&handle, "extra", &infra).await;

    handle.add_node_to_source("rmi://h1/n1", "extra").await.unwrap();
    settle().await;

    let removed = handle
        .remove_nodes(CallerId::admin(), 5, "extra", false)
        .await
        .unwrap();
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn drain_removes_alive_and_down_nodes() {
    let (handle, _ref, _broadcaster) = start().await;
    let infra = Arc::new(MockInfrastructure::new());
    add_mock_source(&handle, "extra", &infra).await;

    handle.add_node_to_source("rmi://h1/n1", "extra").await.unwrap();
    handle.add_node_to_source("rmi://h1/n2", "extra").await.unwrap();
    settle().await;
    handle.mark_down(CallerId::monitoring(), "rmi://h1/n2").await.unwrap();

    handle
        .remove_all_nodes(CallerId::admin(), "extra", false)
        .await
        .unwrap();
    settle().await;

    assert_eq!(handle.node_count(CallerId::monitoring()).await.unwrap(), 0);
    assert_eq!(infra.released().len(), 2);
}

#[tokio::test]
async fn purge_removes_from_the_registry_only() {
    let (handle, _ref, _broadcaster) = start().await;
    let infra = Arc::new(MockInfrastructure::new());
    add_mock_source(&handle, "extra", &infra).await;

    handle.add_node_to_source("rmi://h1/n1", "extra").await.unwrap();
    settle().await;

    assert!(handle.purge_node(CallerId::admin(), "rmi://h1/n1").await.unwrap());
    settle().await;

    assert_eq!(handle.node_count(CallerId::monitoring()).await.unwrap(), 0);
    assert!(infra.released().is_empty());

    assert!(!handle.purge_node(CallerId::admin(), "rmi://h1/n1").await.unwrap());
}

// =============================================================================
// Allocation
// =============================================================================

#[tokio::test]
async fn allocation_honors_count_and_exclusion() {
    let selector = Arc::new(MockSelector::new(vec![
        "rmi://h1/n1".to_string(),
        "rmi://h1/n2".to_string(),
        "rmi://h1/n3".to_string(),
    ]));
    let (handle, _ref, _broadcaster) = start_with_selector(selector).await;

    let exclusion = NodeSet::from_urls(vec!["rmi://h1/n1".to_string()]);
    let set = handle
        .get_at_most_nodes(CallerId::allocation(), 2, Vec::new(), exclusion)
        .await
        .unwrap();

    assert_eq!(set.urls(), ["rmi://h1/n2".to_string(), "rmi://h1/n3".to_string()]);
}

#[tokio::test]
async fn allocation_is_empty_once_shutdown_begins() {
    let selector = Arc::new(MockSelector::new(vec!["rmi://h1/n1".to_string()]));
    let (handle, _ref, broadcaster) = start_with_selector(selector).await;

    // a slow source keeps the coordinator alive mid-shutdown
    let infra = Arc::new(MockInfrastructure::with_shutdown_delay(Duration::from_millis(200)));
    add_mock_source(&handle, "slow", &infra).await;

    assert!(handle.shutdown(CallerId::process(), false).await.unwrap());

    let set = handle
        .get_at_most_nodes(CallerId::allocation(), 1, Vec::new(), NodeSet::new())
        .await
        .unwrap();
    assert!(set.is_empty());

    // a second shutdown request does not replay phase one
    assert!(handle.shutdown(CallerId::process(), false).await.unwrap());
    assert_eq!(
        broadcaster.system_event_count(event_types::SYSTEM_SHUTTING_DOWN),
        1
    );
}

// =============================================================================
// Sources
// =============================================================================

#[tokio::test]
async fn removing_a_source_drains_and_shuts_it_down() {
    let (handle, _ref, broadcaster) = start().await;
    let infra = Arc::new(MockInfrastructure::new());
    add_mock_source(&handle, "extra", &infra).await;

    handle.add_node_to_source("rmi://h1/n1", "extra").await.unwrap();
    settle().await;

    handle
        .remove_node_source(CallerId::admin(), "extra", true)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(handle.node_count(CallerId::monitoring()).await.unwrap(), 0);
    assert!(infra.is_shut_down());

    let err = handle
        .ping_frequency(CallerId::admin(), "extra")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::UnknownSource(_)));

    let removals: Vec<_> = broadcaster
        .source_events()
        .into_iter()
        .filter(|e| e.event_type == event_types::SOURCE_REMOVED)
        .collect();
    assert_eq!(removals.len(), 1);
    assert_eq!(removals[0].source_name, "extra");
}

#[tokio::test]
async fn ping_frequency_applies_to_every_source() {
    let (handle, _ref, _broadcaster) = start().await;
    let infra = Arc::new(MockInfrastructure::new());
    add_mock_source(&handle, "extra", &infra).await;

    handle
        .set_all_ping_frequency(CallerId::admin(), 4_000)
        .await
        .unwrap();

    for name in [DEFAULT_SOURCE_NAME, "extra"] {
        assert_eq!(
            handle.ping_frequency(CallerId::admin(), name).await.unwrap(),
            4_000
        );
    }
}

// =============================================================================
// Authorization
// =============================================================================

#[tokio::test]
async fn untrusted_callers_cannot_reach_privileged_operations() {
    let (handle, _ref, broadcaster) = start().await;

    let err = handle
        .shutdown(CallerId::named("stranger"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Unauthorized(_)));
    assert_eq!(
        broadcaster.system_event_count(event_types::SYSTEM_SHUTTING_DOWN),
        0
    );

    let err = handle
        .remove_node(CallerId::named("stranger"), "rmi://h1/n1", true, true)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Unauthorized(_)));
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn full_shutdown_tears_down_exactly_once() {
    let (handle, actor_ref, broadcaster) = start().await;

    let infra_a = Arc::new(MockInfrastructure::new());
    let infra_b = Arc::new(MockInfrastructure::new());
    add_mock_source(&handle, "a", &infra_a).await;
    add_mock_source(&handle, "b", &infra_b).await;

    handle.add_node_to_source("rmi://h1/n1", "a").await.unwrap();
    handle.add_node_to_source("rmi://h2/n1", "b").await.unwrap();
    settle().await;

    assert!(handle.shutdown(CallerId::process(), true).await.unwrap());
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(!actor_ref.is_running());
    assert_eq!(broadcaster.system_event_count(event_types::SYSTEM_SHUTTING_DOWN), 1);
    assert_eq!(broadcaster.system_event_count(event_types::SYSTEM_SHUT_DOWN), 1);
    assert_eq!(broadcaster.shutdown_calls(), 1);

    assert!(infra_a.is_shut_down());
    assert!(infra_b.is_shut_down());
    assert_eq!(infra_a.released(), vec![("rmi://h1/n1".to_string(), false)]);
    assert_eq!(infra_b.released(), vec![("rmi://h2/n1".to_string(), false)]);

    // every source reported its removal exactly once
    let removals = broadcaster
        .source_events()
        .into_iter()
        .filter(|e| e.event_type == event_types::SOURCE_REMOVED)
        .count();
    assert_eq!(removals, 3);

    // the handle is dead from here on
    let err = handle.node_count(CallerId::monitoring()).await.unwrap_err();
    assert_eq!(err, CoreError::CoordinatorStopped);
}

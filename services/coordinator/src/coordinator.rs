//! The resource-manager coordinator actor.
//!
//! The coordinator is the single authority over the node and source
//! registries. Every entry point is a message on one mailbox, processed
//! one at a time against exclusively-owned state; there is no internal
//! locking. Delegated work (physical acquisition and release, selection,
//! event transport) is dispatched fire-and-forget so the coordinator's
//! loop never suspends on a collaborator.
//!
//! ## Entry points
//!
//! Callers use [`CoordinatorHandle`], a typed façade over the mailbox.
//! Every privileged entry point carries the caller's identity and is
//! checked against the trusted-caller whitelist before any state is
//! touched. `add_node` alone is public: started nodes announce themselves
//! by URL before any identity exists for them.
//!
//! ## Shutdown
//!
//! Phase 1 sets the monotonic shutdown flag and emits `system.shutting_down`.
//! Phase 2 drains every source (alive nodes, then down nodes) and asks it
//! to shut down. Phase 3 runs when the last source unregisters while the
//! flag is set: collaborators are torn down and the actor loop stops. A
//! terminated latch keeps phase 3 exactly-once under racing unregisters.

use std::sync::Arc;

use async_trait::async_trait;
use gridpool_events::{event_types, NodeEvent, SourceEvent, SystemEvent, TopologySnapshot};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::actor::{self, Actor, ActorError, ActorHandle, ActorRef};
use crate::auth::{CallerId, TrustedCallers};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::infrastructure::{create_provider, InfrastructureProvider, STATIC_INFRASTRUCTURE};
use crate::monitoring::EventBroadcaster;
use crate::policy::{create_policy, AcquisitionPolicy, STATIC_POLICY};
use crate::registry::NodeRegistry;
use crate::selection::{NodeSelector, NodeSet, SelectionPredicate};
use crate::source::{NodeSourceHandle, SourcePlugins, SourceRegistry, DEFAULT_SOURCE_NAME};

// =============================================================================
// Messages
// =============================================================================

/// Everything the coordinator can be asked to do. One variant per entry
/// point; operations that return a value carry a oneshot reply.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// Internal: completes construction once the actor can address itself.
    Bootstrap {
        handle: ActorHandle<CoordinatorMessage>,
        reply_to: oneshot::Sender<CoreResult<()>>,
    },
    AddNode {
        url: String,
        source_name: String,
        reply_to: oneshot::Sender<CoreResult<bool>>,
    },
    AddNodes {
        caller: CallerId,
        source_name: String,
        params: serde_json::Value,
        reply_to: oneshot::Sender<CoreResult<bool>>,
    },
    /// Callback from a source reporting a newly acquired node.
    RegisterNode {
        caller: CallerId,
        url: String,
        source_name: String,
    },
    RemoveNode {
        caller: CallerId,
        url: String,
        preempt: bool,
        forever: bool,
        reply_to: oneshot::Sender<CoreResult<()>>,
    },
    RemoveNodes {
        caller: CallerId,
        count: usize,
        source_name: String,
        preemptive: bool,
        reply_to: oneshot::Sender<CoreResult<usize>>,
    },
    RemoveAllNodes {
        caller: CallerId,
        source_name: String,
        preemptive: bool,
        reply_to: oneshot::Sender<CoreResult<()>>,
    },
    CreateNodeSource {
        caller: CallerId,
        name: String,
        infrastructure_type: String,
        infrastructure_params: serde_json::Value,
        policy_type: String,
        policy_params: serde_json::Value,
        reply_to: oneshot::Sender<CoreResult<()>>,
    },
    /// Create a source from caller-supplied plugin instances instead of
    /// factory type names.
    CreateNodeSourceWith {
        caller: CallerId,
        name: String,
        plugins: SourcePlugins,
        reply_to: oneshot::Sender<CoreResult<()>>,
    },
    RemoveNodeSource {
        caller: CallerId,
        name: String,
        preempt: bool,
        reply_to: oneshot::Sender<CoreResult<()>>,
    },
    /// Callback from a source that has finished shutting down.
    UnregisterSource {
        caller: CallerId,
        source_name: String,
        event: SourceEvent,
    },
    Shutdown {
        caller: CallerId,
        preempt: bool,
        reply_to: oneshot::Sender<CoreResult<bool>>,
    },
    MarkBusy {
        caller: CallerId,
        url: String,
        reply_to: oneshot::Sender<CoreResult<()>>,
    },
    MarkFree {
        caller: CallerId,
        url: String,
        reply_to: oneshot::Sender<CoreResult<()>>,
    },
    MarkFreeMany {
        caller: CallerId,
        urls: Vec<String>,
        reply_to: oneshot::Sender<CoreResult<()>>,
    },
    MarkDown {
        caller: CallerId,
        url: String,
        reply_to: oneshot::Sender<CoreResult<()>>,
    },
    GetAtMostNodes {
        caller: CallerId,
        count: usize,
        predicates: Vec<SelectionPredicate>,
        exclusion: NodeSet,
        reply_to: oneshot::Sender<CoreResult<NodeSet>>,
    },
    GetExactlyNodes {
        caller: CallerId,
        count: usize,
        predicate: Option<SelectionPredicate>,
        reply_to: oneshot::Sender<CoreResult<NodeSet>>,
    },
    GetTopologySnapshot {
        caller: CallerId,
        reply_to: oneshot::Sender<CoreResult<TopologySnapshot>>,
    },
    GetNodeCount {
        caller: CallerId,
        reply_to: oneshot::Sender<CoreResult<usize>>,
    },
    GetFreeNodeCount {
        caller: CallerId,
        reply_to: oneshot::Sender<CoreResult<usize>>,
    },
    GetPingFrequency {
        caller: CallerId,
        source_name: String,
        reply_to: oneshot::Sender<CoreResult<u32>>,
    },
    SetPingFrequency {
        caller: CallerId,
        frequency_ms: u32,
        source_name: Option<String>,
        reply_to: oneshot::Sender<CoreResult<()>>,
    },
    SetAllPingFrequency {
        caller: CallerId,
        frequency_ms: u32,
        reply_to: oneshot::Sender<CoreResult<()>>,
    },
    PurgeNode {
        caller: CallerId,
        url: String,
        reply_to: oneshot::Sender<CoreResult<bool>>,
    },
}

// =============================================================================
// Coordinator
// =============================================================================

/// The coordinator's exclusively-owned state.
pub struct Coordinator {
    nodes: NodeRegistry,
    sources: SourceRegistry,
    trusted: TrustedCallers,

    broadcaster: Arc<dyn EventBroadcaster>,
    selector: Arc<dyn NodeSelector>,

    /// Monotonic: set by the first shutdown request, never reset.
    to_shut_down: bool,

    /// Latch ensuring the terminal teardown runs exactly once.
    terminated: bool,

    default_ping_frequency_ms: u32,

    /// The coordinator's own mailbox, for callbacks from delegated tasks.
    /// Set by the bootstrap message.
    self_handle: Option<ActorHandle<CoordinatorMessage>>,
}

impl Coordinator {
    fn new(
        config: &Config,
        broadcaster: Arc<dyn EventBroadcaster>,
        selector: Arc<dyn NodeSelector>,
    ) -> Self {
        Self {
            nodes: NodeRegistry::new(),
            sources: SourceRegistry::new(),
            trusted: TrustedCallers::new(),
            broadcaster,
            selector,
            to_shut_down: false,
            terminated: false,
            default_ping_frequency_ms: config.default_ping_frequency_ms,
            self_handle: None,
        }
    }

    /// Spawn the coordinator actor and run its bootstrap: register the
    /// bootstrap collaborator identities, create the default source, and
    /// emit `system.started`.
    pub async fn start(
        config: &Config,
        broadcaster: Arc<dyn EventBroadcaster>,
        selector: Arc<dyn NodeSelector>,
    ) -> CoreResult<(CoordinatorHandle, ActorRef)> {
        let coordinator = Coordinator::new(config, broadcaster, selector);
        let (handle, actor_ref) = actor::spawn(coordinator, config.mailbox_capacity);

        let (tx, rx) = oneshot::channel();
        handle
            .send(CoordinatorMessage::Bootstrap {
                handle: handle.clone(),
                reply_to: tx,
            })
            .await
            .map_err(|_| CoreError::CoordinatorStopped)?;
        rx.await.map_err(|_| CoreError::CoordinatorStopped)??;

        Ok((CoordinatorHandle { inner: handle }, actor_ref))
    }

    // -------------------------------------------------------------------------
    // Authorization
    // -------------------------------------------------------------------------

    fn authorize(&self, caller: &CallerId) -> CoreResult<()> {
        if self.trusted.contains(caller) {
            Ok(())
        } else {
            warn!(caller = %caller, "Rejected unauthorized caller");
            Err(CoreError::Unauthorized(caller.to_string()))
        }
    }

    // -------------------------------------------------------------------------
    // Bootstrap
    // -------------------------------------------------------------------------

    fn bootstrap(&mut self, handle: ActorHandle<CoordinatorMessage>) -> CoreResult<()> {
        self.self_handle = Some(handle);

        // collaborators wired in at startup are trusted from the beginning
        for caller in [
            CallerId::admin(),
            CallerId::allocation(),
            CallerId::monitoring(),
            CallerId::selector(),
            CallerId::authentication(),
            CallerId::process(),
        ] {
            self.trusted.register(caller);
        }

        self.create_source_internal(
            DEFAULT_SOURCE_NAME,
            STATIC_INFRASTRUCTURE,
            &serde_json::Value::Null,
            STATIC_POLICY,
            &serde_json::Value::Null,
        )?;

        self.broadcaster
            .system_event(SystemEvent::new(event_types::SYSTEM_STARTED));
        info!("Coordinator started");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Node operations
    // -------------------------------------------------------------------------

    fn add_node(&mut self, url: &str, source_name: &str) -> CoreResult<bool> {
        if !self.sources.contains(source_name) {
            return Err(CoreError::UnknownSource(source_name.to_string()));
        }

        if let Some(existing) = self.nodes.get(url) {
            if existing.source_name() != source_name {
                // an attempt to move a registered node to another source
                return Err(CoreError::NodeOwnershipConflict {
                    url: url.to_string(),
                    owner: existing.source_name().to_string(),
                });
            }
            // same source: callback-driven re-registration, forward again
        }

        self.dispatch_acquire(source_name, url);
        Ok(true)
    }

    fn add_nodes(&mut self, caller: &CallerId, source_name: &str, params: serde_json::Value) -> CoreResult<bool> {
        self.authorize(caller)?;
        let Some(source) = self.sources.get(source_name) else {
            return Err(CoreError::UnknownSource(source_name.to_string()));
        };

        let provider = source.provider();
        let handle = self.self_handle.clone();
        let source_name = source_name.to_string();
        tokio::spawn(async move {
            match provider.acquire_nodes(&params).await {
                Ok(urls) => {
                    for url in urls {
                        let msg = CoordinatorMessage::RegisterNode {
                            caller: CallerId::source(&source_name),
                            url,
                            source_name: source_name.clone(),
                        };
                        if let Some(handle) = &handle {
                            let _ = handle.send(msg).await;
                        }
                    }
                }
                Err(e) => warn!(source = %source_name, error = %e, "Node batch acquisition failed"),
            }
        });
        Ok(true)
    }

    fn register_node(&mut self, caller: &CallerId, url: &str, source_name: &str) {
        if self.authorize(caller).is_err() {
            return;
        }
        if !self.sources.contains(source_name) {
            // the source was removed while the acquisition was in flight
            warn!(url, source = source_name, "Acquired node arrived for a removed source");
            return;
        }
        if let Some(existing) = self.nodes.get(url) {
            if existing.source_name() != source_name {
                warn!(
                    url,
                    owner = existing.source_name(),
                    claimant = source_name,
                    "Ignoring acquisition of a node owned by another source"
                );
                return;
            }
        }

        let event = self.nodes.add(url, source_name);
        self.broadcaster.node_event(event);
        info!(url, source = source_name, "New node added");
    }

    /// Shared removal path. Returns true if the request changed state:
    /// an immediate removal or a busy node scheduled for release.
    fn remove_node_internal(&mut self, url: &str, preempt: bool, forever: bool) -> bool {
        let Some(node) = self.nodes.get(url) else {
            warn!(url, "An attempt to remove a non existing node");
            return false;
        };

        if node.is_down() || preempt || node.is_free() {
            self.remove_and_release(url, forever);
            true
        } else if node.is_busy() {
            if let Some(event) = self.nodes.mark_to_release(url) {
                self.broadcaster.node_event(event);
                return true;
            }
            false
        } else {
            // already marked for release; the pending removal stands
            debug!(url, "Node already scheduled for release");
            false
        }
    }

    /// Remove from the registry and ask the owning source to physically
    /// release the node.
    fn remove_and_release(&mut self, url: &str, forever: bool) {
        let Some((node, event)) = self.nodes.remove(url) else {
            return;
        };
        info!(url, "Releasing node");
        self.broadcaster.node_event(event);
        self.dispatch_release(node.source_name(), url, forever);
    }

    fn remove_nodes(&mut self, caller: &CallerId, count: usize, source_name: &str, preemptive: bool) -> CoreResult<usize> {
        self.authorize(caller)?;
        if !self.sources.contains(source_name) {
            return Err(CoreError::UnknownSource(source_name.to_string()));
        }

        let mut removed = 0;

        // free nodes first, they cost nothing to give up
        for url in self.nodes.free_urls_of_source(source_name) {
            if removed == count {
                break;
            }
            if self.remove_node_internal(&url, preemptive, false) {
                removed += 1;
            }
        }

        if removed < count {
            for url in self.nodes.urls_of_source(source_name) {
                if removed == count {
                    break;
                }
                if self.remove_node_internal(&url, preemptive, false) {
                    removed += 1;
                }
            }
        }

        if removed < count {
            warn!(
                requested = count,
                removed,
                source = source_name,
                "Cannot remove the requested number of nodes"
            );
        }
        Ok(removed)
    }

    fn remove_all_nodes_internal(&mut self, source_name: &str, preemptive: bool) {
        for url in self.nodes.alive_urls_of_source(source_name) {
            self.remove_node_internal(&url, preemptive, false);
        }
        // down nodes too: the source no longer tracks them itself
        for url in self.nodes.down_urls_of_source(source_name) {
            self.remove_node_internal(&url, preemptive, false);
        }
    }

    fn remove_all_nodes(&mut self, caller: &CallerId, source_name: &str, preemptive: bool) -> CoreResult<()> {
        self.authorize(caller)?;
        if !self.sources.contains(source_name) {
            return Err(CoreError::UnknownSource(source_name.to_string()));
        }
        self.remove_all_nodes_internal(source_name, preemptive);
        Ok(())
    }

    fn mark_busy(&mut self, caller: &CallerId, url: &str) -> CoreResult<()> {
        self.authorize(caller)?;
        if let Some(event) = self.nodes.mark_busy(url) {
            self.broadcaster.node_event(event);
        }
        Ok(())
    }

    /// Free a node coming back from the scheduler. Faults and races are
    /// absorbed: the operation never fails, it only warns.
    fn free_node_internal(&mut self, url: &str) {
        let Some(node) = self.nodes.get(url) else {
            warn!(url, "Scheduler asked to free an unknown node");
            return;
        };

        if node.is_free() {
            warn!(url, "Scheduler tried to free a node already free");
        } else if node.is_down() {
            // detected down while busy; stays down until removed
            debug!(url, "Ignoring free of a down node");
        } else if node.is_to_release() {
            // the deferred removal fires now that the work is done
            self.remove_and_release(url, false);
        } else if let Some(event) = self.nodes.mark_free(url) {
            self.broadcaster.node_event(event);
        }
    }

    fn mark_free(&mut self, caller: &CallerId, url: &str) -> CoreResult<()> {
        self.authorize(caller)?;
        self.free_node_internal(url);
        Ok(())
    }

    fn mark_free_many(&mut self, caller: &CallerId, urls: &[String]) -> CoreResult<()> {
        self.authorize(caller)?;
        for url in urls {
            self.free_node_internal(url);
        }
        Ok(())
    }

    fn mark_down(&mut self, caller: &CallerId, url: &str) -> CoreResult<()> {
        self.authorize(caller)?;
        if let Some(event) = self.nodes.mark_down(url) {
            info!(url, "Node is down");
            self.broadcaster.node_event(event);
        }
        Ok(())
    }

    fn purge_node(&mut self, caller: &CallerId, url: &str) -> CoreResult<bool> {
        self.authorize(caller)?;
        // registry-only removal: the owning source is being torn down and
        // needs no release notification
        match self.nodes.remove(url) {
            Some((_, event)) => {
                self.broadcaster.node_event(event);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // -------------------------------------------------------------------------
    // Source operations
    // -------------------------------------------------------------------------

    fn create_source_internal(
        &mut self,
        name: &str,
        infrastructure_type: &str,
        infrastructure_params: &serde_json::Value,
        policy_type: &str,
        policy_params: &serde_json::Value,
    ) -> CoreResult<()> {
        if self.sources.contains(name) {
            return Err(CoreError::SourceAlreadyExists(name.to_string()));
        }

        info!(source = name, infrastructure = infrastructure_type, policy = policy_type, "Creating a node source");

        let provider = create_provider(infrastructure_type, infrastructure_params)?;
        let policy = create_policy(policy_type, policy_params)?;
        self.install_source(name, provider, policy)
    }

    /// Register a constructed source: insert, broadcast creation, trust its
    /// identities, and activate its policy.
    fn install_source(
        &mut self,
        name: &str,
        provider: Arc<dyn InfrastructureProvider>,
        policy: Arc<dyn AcquisitionPolicy>,
    ) -> CoreResult<()> {
        if self.sources.contains(name) {
            return Err(CoreError::SourceAlreadyExists(name.to_string()));
        }

        let handle = NodeSourceHandle::new(
            name,
            self.default_ping_frequency_ms,
            provider,
            Arc::clone(&policy),
        );
        self.sources.insert(handle);

        self.broadcaster
            .source_event(SourceEvent::new(event_types::SOURCE_CREATED, name));
        self.trusted.register(CallerId::source(name));
        self.trusted.register(CallerId::policy(name));

        let source_name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = policy.activate().await {
                warn!(source = %source_name, error = %e, "Policy activation failed");
            }
        });

        info!(source = name, "Node source created");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn create_node_source(
        &mut self,
        caller: &CallerId,
        name: &str,
        infrastructure_type: &str,
        infrastructure_params: &serde_json::Value,
        policy_type: &str,
        policy_params: &serde_json::Value,
    ) -> CoreResult<()> {
        self.authorize(caller)?;
        self.create_source_internal(
            name,
            infrastructure_type,
            infrastructure_params,
            policy_type,
            policy_params,
        )
    }

    fn remove_node_source(&mut self, caller: &CallerId, name: &str, preempt: bool) -> CoreResult<()> {
        self.authorize(caller)?;
        if name == DEFAULT_SOURCE_NAME {
            return Err(CoreError::DefaultSourceRemoval);
        }
        if !self.sources.contains(name) {
            return Err(CoreError::UnknownSource(name.to_string()));
        }

        // drain first: the source no longer tracks its down nodes itself
        self.remove_all_nodes_internal(name, preempt);
        self.dispatch_source_shutdown(name);
        Ok(())
    }

    /// Returns false when the terminal teardown ran and the actor loop
    /// must stop.
    async fn unregister_source(&mut self, caller: &CallerId, source_name: &str, event: SourceEvent) -> bool {
        if self.authorize(caller).is_err() {
            return true;
        }

        if self.sources.remove(source_name).is_none() {
            warn!(source = source_name, "Attempt to unregister a non-existing node source");
        } else {
            info!(source = source_name, "Node source removed");
        }

        self.broadcaster.source_event(event);
        self.trusted.revoke(&CallerId::source(source_name));
        self.trusted.revoke(&CallerId::policy(source_name));

        if self.sources.is_empty() && self.to_shut_down && !self.terminated {
            self.run_terminal_teardown().await;
            return false;
        }
        true
    }

    /// Phase 3: tear down the collaborators and stop. Guarded by the
    /// terminated latch so racing unregisters run it once.
    async fn run_terminal_teardown(&mut self) {
        self.terminated = true;
        info!("All node sources removed, finishing coordinator shutdown");

        self.selector.shutdown().await;
        self.broadcaster
            .system_event(SystemEvent::new(event_types::SYSTEM_SHUT_DOWN));
        self.broadcaster.shutdown();
    }

    /// Returns (reply, continue_running).
    async fn shutdown(&mut self, caller: &CallerId, preempt: bool) -> (CoreResult<bool>, bool) {
        if let Err(e) = self.authorize(caller) {
            return (Err(e), true);
        }

        info!("Coordinator shutdown request");
        if !self.to_shut_down {
            self.to_shut_down = true;
            self.broadcaster
                .system_event(SystemEvent::new(event_types::SYSTEM_SHUTTING_DOWN));

            for name in self.sources.names() {
                self.remove_all_nodes_internal(&name, preempt);
                self.dispatch_source_shutdown(&name);
            }
        }

        if self.sources.is_empty() && !self.terminated {
            self.run_terminal_teardown().await;
            return (Ok(true), false);
        }
        (Ok(true), true)
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    fn get_at_most_nodes(
        &mut self,
        caller: &CallerId,
        count: usize,
        predicates: Vec<SelectionPredicate>,
        exclusion: NodeSet,
        reply_to: oneshot::Sender<CoreResult<NodeSet>>,
    ) {
        if let Err(e) = self.authorize(caller) {
            let _ = reply_to.send(Err(e));
            return;
        }

        // once shutting down, no nodes are handed out, ever
        if self.to_shut_down {
            let _ = reply_to.send(Ok(NodeSet::new()));
            return;
        }

        info!(count, "Nodes requested");
        let selector = Arc::clone(&self.selector);
        tokio::spawn(async move {
            let set = selector.find_nodes(count, &predicates, &exclusion).await;
            let _ = reply_to.send(Ok(set));
        });
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    fn topology_snapshot(&self, caller: &CallerId) -> CoreResult<TopologySnapshot> {
        self.authorize(caller)?;

        let nodes = self
            .nodes
            .iter()
            .map(|n| {
                NodeEvent::new(event_types::NODE_ADDED, n.url(), n.source_name(), n.state())
            })
            .collect();
        let sources = self
            .sources
            .iter()
            .map(|s| SourceEvent::new(event_types::SOURCE_CREATED, s.name()))
            .collect();

        Ok(TopologySnapshot { nodes, sources })
    }

    fn ping_frequency(&self, caller: &CallerId, source_name: &str) -> CoreResult<u32> {
        self.authorize(caller)?;
        self.sources
            .get(source_name)
            .map(|s| s.ping_frequency())
            .ok_or_else(|| CoreError::UnknownSource(source_name.to_string()))
    }

    fn set_ping_frequency(
        &mut self,
        caller: &CallerId,
        frequency_ms: u32,
        source_name: Option<&str>,
    ) -> CoreResult<()> {
        self.authorize(caller)?;
        let name = source_name.unwrap_or(DEFAULT_SOURCE_NAME);
        match self.sources.get_mut(name) {
            Some(source) => {
                source.set_ping_frequency(frequency_ms);
                Ok(())
            }
            None => Err(CoreError::UnknownSource(name.to_string())),
        }
    }

    fn set_all_ping_frequency(&mut self, caller: &CallerId, frequency_ms: u32) -> CoreResult<()> {
        self.authorize(caller)?;
        for source in self.sources.iter_mut() {
            source.set_ping_frequency(frequency_ms);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Fire-and-forget delegation
    // -------------------------------------------------------------------------

    /// Ask the source to claim the node; on success the source reports the
    /// acquisition back through the mailbox. A fault during acquisition of
    /// an already-registered node demotes it to down.
    fn dispatch_acquire(&self, source_name: &str, url: &str) {
        let Some(source) = self.sources.get(source_name) else {
            return;
        };
        let provider = source.provider();
        let handle = self.self_handle.clone();
        let source_name = source_name.to_string();
        let url = url.to_string();
        let registered = self.nodes.contains(&url);

        tokio::spawn(async move {
            let caller = CallerId::source(&source_name);
            match provider.acquire_node(&url).await {
                Ok(true) => {
                    if let Some(handle) = &handle {
                        let _ = handle
                            .send(CoordinatorMessage::RegisterNode {
                                caller,
                                url,
                                source_name,
                            })
                            .await;
                    }
                }
                Ok(false) => {
                    warn!(url = %url, source = %source_name, "Source rejected node acquisition");
                }
                Err(e) => {
                    warn!(url = %url, source = %source_name, error = %e, "Node acquisition failed");
                    if registered {
                        if let Some(handle) = &handle {
                            let (tx, _rx) = oneshot::channel();
                            let _ = handle
                                .send(CoordinatorMessage::MarkDown {
                                    caller,
                                    url,
                                    reply_to: tx,
                                })
                                .await;
                        }
                    }
                }
            }
        });
    }

    fn dispatch_release(&self, source_name: &str, url: &str, forever: bool) {
        let Some(source) = self.sources.get(source_name) else {
            // source torn down before the release; nothing left to notify
            debug!(url, source = source_name, "No source to release node to");
            return;
        };
        let provider = source.provider();
        let url = url.to_string();
        let source_name = source_name.to_string();

        tokio::spawn(async move {
            if let Err(e) = provider.release_node(&url, forever).await {
                warn!(url = %url, source = %source_name, error = %e, "Node release failed");
            }
        });
    }

    /// Ask the source to shut down; when done it unregisters itself with
    /// its final removal event.
    fn dispatch_source_shutdown(&self, source_name: &str) {
        let Some(source) = self.sources.get(source_name) else {
            return;
        };
        let provider = source.provider();
        let policy = source.policy();
        let handle = self.self_handle.clone();
        let source_name = source_name.to_string();

        tokio::spawn(async move {
            if let Err(e) = provider.shutdown().await {
                warn!(source = %source_name, error = %e, "Infrastructure shutdown failed");
            }
            if let Err(e) = policy.shutdown().await {
                warn!(source = %source_name, error = %e, "Policy shutdown failed");
            }
            if let Some(handle) = &handle {
                let event = SourceEvent::new(event_types::SOURCE_REMOVED, &source_name);
                let _ = handle
                    .send(CoordinatorMessage::UnregisterSource {
                        caller: CallerId::source(&source_name),
                        source_name,
                        event,
                    })
                    .await;
            }
        });
    }
}

#[async_trait]
impl Actor for Coordinator {
    type Message = CoordinatorMessage;

    fn name(&self) -> &str {
        "coordinator"
    }

    async fn handle(&mut self, msg: CoordinatorMessage) -> Result<bool, ActorError> {
        match msg {
            CoordinatorMessage::Bootstrap { handle, reply_to } => {
                let _ = reply_to.send(self.bootstrap(handle));
            }
            CoordinatorMessage::AddNode { url, source_name, reply_to } => {
                let _ = reply_to.send(self.add_node(&url, &source_name));
            }
            CoordinatorMessage::AddNodes { caller, source_name, params, reply_to } => {
                let _ = reply_to.send(self.add_nodes(&caller, &source_name, params));
            }
            CoordinatorMessage::RegisterNode { caller, url, source_name } => {
                self.register_node(&caller, &url, &source_name);
            }
            CoordinatorMessage::RemoveNode { caller, url, preempt, forever, reply_to } => {
                let result = self.authorize(&caller).map(|_| {
                    self.remove_node_internal(&url, preempt, forever);
                });
                let _ = reply_to.send(result);
            }
            CoordinatorMessage::RemoveNodes { caller, count, source_name, preemptive, reply_to } => {
                let _ = reply_to.send(self.remove_nodes(&caller, count, &source_name, preemptive));
            }
            CoordinatorMessage::RemoveAllNodes { caller, source_name, preemptive, reply_to } => {
                let _ = reply_to.send(self.remove_all_nodes(&caller, &source_name, preemptive));
            }
            CoordinatorMessage::CreateNodeSource {
                caller,
                name,
                infrastructure_type,
                infrastructure_params,
                policy_type,
                policy_params,
                reply_to,
            } => {
                let _ = reply_to.send(self.create_node_source(
                    &caller,
                    &name,
                    &infrastructure_type,
                    &infrastructure_params,
                    &policy_type,
                    &policy_params,
                ));
            }
            CoordinatorMessage::CreateNodeSourceWith { caller, name, plugins, reply_to } => {
                let result = self
                    .authorize(&caller)
                    .and_then(|_| self.install_source(&name, plugins.provider, plugins.policy));
                let _ = reply_to.send(result);
            }
            CoordinatorMessage::RemoveNodeSource { caller, name, preempt, reply_to } => {
                let _ = reply_to.send(self.remove_node_source(&caller, &name, preempt));
            }
            CoordinatorMessage::UnregisterSource { caller, source_name, event } => {
                return Ok(self.unregister_source(&caller, &source_name, event).await);
            }
            CoordinatorMessage::Shutdown { caller, preempt, reply_to } => {
                let (result, keep_running) = self.shutdown(&caller, preempt).await;
                let _ = reply_to.send(result);
                return Ok(keep_running);
            }
            CoordinatorMessage::MarkBusy { caller, url, reply_to } => {
                let _ = reply_to.send(self.mark_busy(&caller, &url));
            }
            CoordinatorMessage::MarkFree { caller, url, reply_to } => {
                let _ = reply_to.send(self.mark_free(&caller, &url));
            }
            CoordinatorMessage::MarkFreeMany { caller, urls, reply_to } => {
                let _ = reply_to.send(self.mark_free_many(&caller, &urls));
            }
            CoordinatorMessage::MarkDown { caller, url, reply_to } => {
                let _ = reply_to.send(self.mark_down(&caller, &url));
            }
            CoordinatorMessage::GetAtMostNodes { caller, count, predicates, exclusion, reply_to } => {
                self.get_at_most_nodes(&caller, count, predicates, exclusion, reply_to);
            }
            CoordinatorMessage::GetExactlyNodes { caller, count, predicate, reply_to } => {
                let _ = (count, predicate);
                let result = self
                    .authorize(&caller)
                    .and_then(|_| Err(CoreError::Unsupported("get_exactly_nodes")));
                let _ = reply_to.send(result);
            }
            CoordinatorMessage::GetTopologySnapshot { caller, reply_to } => {
                let _ = reply_to.send(self.topology_snapshot(&caller));
            }
            CoordinatorMessage::GetNodeCount { caller, reply_to } => {
                let _ = reply_to.send(self.authorize(&caller).map(|_| self.nodes.len()));
            }
            CoordinatorMessage::GetFreeNodeCount { caller, reply_to } => {
                let _ = reply_to.send(self.authorize(&caller).map(|_| self.nodes.free_len()));
            }
            CoordinatorMessage::GetPingFrequency { caller, source_name, reply_to } => {
                let _ = reply_to.send(self.ping_frequency(&caller, &source_name));
            }
            CoordinatorMessage::SetPingFrequency { caller, frequency_ms, source_name, reply_to } => {
                let _ = reply_to.send(self.set_ping_frequency(
                    &caller,
                    frequency_ms,
                    source_name.as_deref(),
                ));
            }
            CoordinatorMessage::SetAllPingFrequency { caller, frequency_ms, reply_to } => {
                let _ = reply_to.send(self.set_all_ping_frequency(&caller, frequency_ms));
            }
            CoordinatorMessage::PurgeNode { caller, url, reply_to } => {
                let _ = reply_to.send(self.purge_node(&caller, &url));
            }
        }
        Ok(true)
    }

    async fn on_stop(&mut self) {
        info!("Coordinator loop stopped");
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Typed façade over the coordinator's mailbox.
#[derive(Clone)]
pub struct CoordinatorHandle {
    inner: ActorHandle<CoordinatorMessage>,
}

impl CoordinatorHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<CoreResult<T>>) -> CoordinatorMessage,
    ) -> CoreResult<T> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .send(build(tx))
            .await
            .map_err(|_| CoreError::CoordinatorStopped)?;
        rx.await.map_err(|_| CoreError::CoordinatorStopped)?
    }

    /// Register a node announced by URL under the default source.
    pub async fn add_node(&self, url: &str) -> CoreResult<bool> {
        self.add_node_to_source(url, DEFAULT_SOURCE_NAME).await
    }

    /// Register a node announced by URL under a named source.
    pub async fn add_node_to_source(&self, url: &str, source_name: &str) -> CoreResult<bool> {
        let url = url.to_string();
        let source_name = source_name.to_string();
        self.request(|reply_to| CoordinatorMessage::AddNode { url, source_name, reply_to })
            .await
    }

    /// Deploy a batch of nodes described by source-specific parameters.
    pub async fn add_nodes(
        &self,
        caller: CallerId,
        source_name: &str,
        params: serde_json::Value,
    ) -> CoreResult<bool> {
        let source_name = source_name.to_string();
        self.request(|reply_to| CoordinatorMessage::AddNodes {
            caller,
            source_name,
            params,
            reply_to,
        })
        .await
    }

    pub async fn remove_node(
        &self,
        caller: CallerId,
        url: &str,
        preempt: bool,
        forever: bool,
    ) -> CoreResult<()> {
        let url = url.to_string();
        self.request(|reply_to| CoordinatorMessage::RemoveNode {
            caller,
            url,
            preempt,
            forever,
            reply_to,
        })
        .await
    }

    /// Remove up to `count` nodes from a source; returns the number of
    /// nodes actually acted upon.
    pub async fn remove_nodes(
        &self,
        caller: CallerId,
        count: usize,
        source_name: &str,
        preemptive: bool,
    ) -> CoreResult<usize> {
        let source_name = source_name.to_string();
        self.request(|reply_to| CoordinatorMessage::RemoveNodes {
            caller,
            count,
            source_name,
            preemptive,
            reply_to,
        })
        .await
    }

    pub async fn remove_all_nodes(
        &self,
        caller: CallerId,
        source_name: &str,
        preemptive: bool,
    ) -> CoreResult<()> {
        let source_name = source_name.to_string();
        self.request(|reply_to| CoordinatorMessage::RemoveAllNodes {
            caller,
            source_name,
            preemptive,
            reply_to,
        })
        .await
    }

    pub async fn create_node_source(
        &self,
        caller: CallerId,
        name: &str,
        infrastructure_type: &str,
        infrastructure_params: serde_json::Value,
        policy_type: &str,
        policy_params: serde_json::Value,
    ) -> CoreResult<()> {
        let name = name.to_string();
        let infrastructure_type = infrastructure_type.to_string();
        let policy_type = policy_type.to_string();
        self.request(|reply_to| CoordinatorMessage::CreateNodeSource {
            caller,
            name,
            infrastructure_type,
            infrastructure_params,
            policy_type,
            policy_params,
            reply_to,
        })
        .await
    }

    /// Create a source from already-constructed plugin instances. This is
    /// the seam embedders and tests use to supply their own provider or
    /// policy implementations.
    pub async fn create_node_source_with(
        &self,
        caller: CallerId,
        name: &str,
        provider: Arc<dyn InfrastructureProvider>,
        policy: Arc<dyn AcquisitionPolicy>,
    ) -> CoreResult<()> {
        let name = name.to_string();
        self.request(|reply_to| CoordinatorMessage::CreateNodeSourceWith {
            caller,
            name,
            plugins: SourcePlugins { provider, policy },
            reply_to,
        })
        .await
    }

    pub async fn remove_node_source(
        &self,
        caller: CallerId,
        name: &str,
        preempt: bool,
    ) -> CoreResult<()> {
        let name = name.to_string();
        self.request(|reply_to| CoordinatorMessage::RemoveNodeSource {
            caller,
            name,
            preempt,
            reply_to,
        })
        .await
    }

    /// Initiate the multi-phase shutdown.
    pub async fn shutdown(&self, caller: CallerId, preempt: bool) -> CoreResult<bool> {
        self.request(|reply_to| CoordinatorMessage::Shutdown { caller, preempt, reply_to })
            .await
    }

    pub async fn mark_busy(&self, caller: CallerId, url: &str) -> CoreResult<()> {
        let url = url.to_string();
        self.request(|reply_to| CoordinatorMessage::MarkBusy { caller, url, reply_to })
            .await
    }

    pub async fn mark_free(&self, caller: CallerId, url: &str) -> CoreResult<()> {
        let url = url.to_string();
        self.request(|reply_to| CoordinatorMessage::MarkFree { caller, url, reply_to })
            .await
    }

    pub async fn mark_free_many(&self, caller: CallerId, urls: Vec<String>) -> CoreResult<()> {
        self.request(|reply_to| CoordinatorMessage::MarkFreeMany { caller, urls, reply_to })
            .await
    }

    pub async fn mark_down(&self, caller: CallerId, url: &str) -> CoreResult<()> {
        let url = url.to_string();
        self.request(|reply_to| CoordinatorMessage::MarkDown { caller, url, reply_to })
            .await
    }

    /// Request up to `count` nodes. Empty once shutdown has begun.
    pub async fn get_at_most_nodes(
        &self,
        caller: CallerId,
        count: usize,
        predicates: Vec<SelectionPredicate>,
        exclusion: NodeSet,
    ) -> CoreResult<NodeSet> {
        self.request(|reply_to| CoordinatorMessage::GetAtMostNodes {
            caller,
            count,
            predicates,
            exclusion,
            reply_to,
        })
        .await
    }

    /// Part of the contract surface but unsupported: always fails with an
    /// explicit signal.
    pub async fn get_exactly_nodes(
        &self,
        caller: CallerId,
        count: usize,
        predicate: Option<SelectionPredicate>,
    ) -> CoreResult<NodeSet> {
        self.request(|reply_to| CoordinatorMessage::GetExactlyNodes {
            caller,
            count,
            predicate,
            reply_to,
        })
        .await
    }

    pub async fn topology_snapshot(&self, caller: CallerId) -> CoreResult<TopologySnapshot> {
        self.request(|reply_to| CoordinatorMessage::GetTopologySnapshot { caller, reply_to })
            .await
    }

    pub async fn node_count(&self, caller: CallerId) -> CoreResult<usize> {
        self.request(|reply_to| CoordinatorMessage::GetNodeCount { caller, reply_to })
            .await
    }

    pub async fn free_node_count(&self, caller: CallerId) -> CoreResult<usize> {
        self.request(|reply_to| CoordinatorMessage::GetFreeNodeCount { caller, reply_to })
            .await
    }

    pub async fn ping_frequency(&self, caller: CallerId, source_name: &str) -> CoreResult<u32> {
        let source_name = source_name.to_string();
        self.request(|reply_to| CoordinatorMessage::GetPingFrequency {
            caller,
            source_name,
            reply_to,
        })
        .await
    }

    /// Set one source's ping frequency (the default source when none is
    /// named).
    pub async fn set_ping_frequency(
        &self,
        caller: CallerId,
        frequency_ms: u32,
        source_name: Option<&str>,
    ) -> CoreResult<()> {
        let source_name = source_name.map(|s| s.to_string());
        self.request(|reply_to| CoordinatorMessage::SetPingFrequency {
            caller,
            frequency_ms,
            source_name,
            reply_to,
        })
        .await
    }

    pub async fn set_all_ping_frequency(&self, caller: CallerId, frequency_ms: u32) -> CoreResult<()> {
        self.request(|reply_to| CoordinatorMessage::SetAllPingFrequency {
            caller,
            frequency_ms,
            reply_to,
        })
        .await
    }

    /// Registry-only removal, used when the owning source is being torn
    /// down and needs no notification. Returns whether the node existed.
    pub async fn purge_node(&self, caller: CallerId, url: &str) -> CoreResult<bool> {
        let url = url.to_string();
        self.request(|reply_to| CoordinatorMessage::PurgeNode { caller, url, reply_to })
            .await
    }

    /// Source callback: report a newly acquired node.
    pub async fn register_node(&self, source_name: &str, url: &str) -> CoreResult<()> {
        self.inner
            .send(CoordinatorMessage::RegisterNode {
                caller: CallerId::source(source_name),
                url: url.to_string(),
                source_name: source_name.to_string(),
            })
            .await
            .map_err(|_| CoreError::CoordinatorStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::RecordingBroadcaster;
    use crate::selection::MockSelector;

    async fn start_coordinator() -> (CoordinatorHandle, ActorRef, Arc<RecordingBroadcaster>) {
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let selector = Arc::new(MockSelector::empty());
        let (handle, actor_ref) =
            Coordinator::start(&Config::default(), broadcaster.clone(), selector)
                .await
                .unwrap();
        (handle, actor_ref, broadcaster)
    }

    #[tokio::test]
    async fn test_bootstrap_creates_default_source() {
        let (handle, _actor_ref, broadcaster) = start_coordinator().await;

        // default source present with the configured ping frequency
        let freq = handle
            .ping_frequency(CallerId::admin(), DEFAULT_SOURCE_NAME)
            .await
            .unwrap();
        assert_eq!(freq, 10_000);

        assert_eq!(broadcaster.system_event_count(event_types::SYSTEM_STARTED), 1);
        let sources = broadcaster.source_events();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].source_name, DEFAULT_SOURCE_NAME);
    }

    #[tokio::test]
    async fn test_unauthorized_caller_is_rejected() {
        let (handle, _actor_ref, _broadcaster) = start_coordinator().await;

        let err = handle
            .mark_busy(CallerId::named("stranger"), "rmi://a/n1")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));

        let err = handle
            .node_count(CallerId::named("stranger"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_add_node_unknown_source_fails() {
        let (handle, _actor_ref, _broadcaster) = start_coordinator().await;

        let err = handle
            .add_node_to_source("rmi://a/n1", "nowhere")
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::UnknownSource("nowhere".to_string()));
    }

    #[tokio::test]
    async fn test_get_exactly_nodes_is_unsupported() {
        let (handle, _actor_ref, _broadcaster) = start_coordinator().await;

        let err = handle
            .get_exactly_nodes(CallerId::allocation(), 3, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_create_duplicate_source_fails_without_mutation() {
        let (handle, _actor_ref, broadcaster) = start_coordinator().await;

        let err = handle
            .create_node_source(
                CallerId::admin(),
                DEFAULT_SOURCE_NAME,
                STATIC_INFRASTRUCTURE,
                serde_json::Value::Null,
                STATIC_POLICY,
                serde_json::Value::Null,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::SourceAlreadyExists(_)));

        // still exactly one source.created event
        assert_eq!(broadcaster.source_events().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_default_source_fails() {
        let (handle, _actor_ref, _broadcaster) = start_coordinator().await;

        let err = handle
            .remove_node_source(CallerId::admin(), DEFAULT_SOURCE_NAME, false)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::DefaultSourceRemoval);
    }

    #[tokio::test]
    async fn test_ping_frequency_roundtrip() {
        let (handle, _actor_ref, _broadcaster) = start_coordinator().await;

        handle
            .set_ping_frequency(CallerId::admin(), 2_500, None)
            .await
            .unwrap();
        let freq = handle
            .ping_frequency(CallerId::admin(), DEFAULT_SOURCE_NAME)
            .await
            .unwrap();
        assert_eq!(freq, 2_500);

        let err = handle
            .ping_frequency(CallerId::admin(), "nowhere")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownSource(_)));
    }
}

//! Infrastructure provider interface and implementations.
//!
//! The provider abstracts the physical side of a node source: claiming
//! announced nodes, deploying new ones from opaque parameters, and
//! releasing them. The coordinator only ever talks to providers through
//! fire-and-forget delegation; provider faults never cross the coordinator
//! boundary.
//!
//! Providers are constructed by type name through [`create_provider`], so
//! new infrastructures plug in without touching the coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::CoreError;

/// Type name of the built-in static infrastructure.
pub const STATIC_INFRASTRUCTURE: &str = "static";

/// Physical node acquisition and release for one node source.
#[async_trait]
pub trait InfrastructureProvider: Send + Sync {
    /// Claim a node announced by URL. `Ok(true)` if the provider accepts it.
    async fn acquire_node(&self, url: &str) -> Result<bool>;

    /// Deploy additional nodes described by opaque parameters; returns the
    /// URLs of the nodes acquired.
    async fn acquire_nodes(&self, params: &serde_json::Value) -> Result<Vec<String>>;

    /// Physically release a node. `forever` forbids later re-acquisition by
    /// a dynamic infrastructure.
    async fn release_node(&self, url: &str, forever: bool) -> Result<()>;

    /// Tear down infrastructure-level resources.
    async fn shutdown(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn InfrastructureProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn InfrastructureProvider")
    }
}

/// Construct a provider from its type name and opaque parameters.
pub fn create_provider(
    kind: &str,
    params: &serde_json::Value,
) -> Result<std::sync::Arc<dyn InfrastructureProvider>, CoreError> {
    match kind {
        STATIC_INFRASTRUCTURE => {
            let _ = params; // the static infrastructure takes no parameters
            Ok(std::sync::Arc::new(StaticInfrastructure::new()))
        }
        other => Err(CoreError::UnknownPluginType {
            kind: "infrastructure",
            name: other.to_string(),
        }),
    }
}

/// Infrastructure whose nodes are launched out of band and announce
/// themselves by URL. It accepts every announced node and releases are
/// purely bookkeeping.
pub struct StaticInfrastructure;

impl StaticInfrastructure {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StaticInfrastructure {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InfrastructureProvider for StaticInfrastructure {
    async fn acquire_node(&self, url: &str) -> Result<bool> {
        debug!(url, "Static infrastructure accepting announced node");
        Ok(true)
    }

    async fn acquire_nodes(&self, params: &serde_json::Value) -> Result<Vec<String>> {
        // parameters are the node URLs themselves
        let urls: Vec<String> = serde_json::from_value(params.clone())?;
        info!(count = urls.len(), "Static infrastructure acquiring node batch");
        Ok(urls)
    }

    async fn release_node(&self, url: &str, forever: bool) -> Result<()> {
        debug!(url, forever, "Static infrastructure releasing node");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        debug!("Static infrastructure shut down");
        Ok(())
    }
}

/// Mock provider for testing.
///
/// Records released nodes and can be switched to fail acquisitions or to
/// delay its shutdown so tests can observe the coordinator mid-drain.
pub struct MockInfrastructure {
    /// Released nodes as (url, forever) pairs, in call order.
    released: Mutex<Vec<(String, bool)>>,

    /// Whether acquisitions should fail.
    fail_acquires: AtomicBool,

    /// Artificial delay before shutdown completes.
    shutdown_delay: Option<Duration>,

    /// Whether shutdown has been called.
    shut_down: AtomicBool,
}

impl MockInfrastructure {
    pub fn new() -> Self {
        Self {
            released: Mutex::new(Vec::new()),
            fail_acquires: AtomicBool::new(false),
            shutdown_delay: None,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Create a mock that fails all acquisitions.
    pub fn failing() -> Self {
        Self {
            fail_acquires: AtomicBool::new(true),
            ..Self::new()
        }
    }

    /// Switch acquisition failures on or off.
    pub fn set_failing(&self, failing: bool) {
        self.fail_acquires.store(failing, Ordering::SeqCst);
    }

    /// Create a mock whose shutdown takes the given time to complete.
    pub fn with_shutdown_delay(delay: Duration) -> Self {
        Self {
            shutdown_delay: Some(delay),
            ..Self::new()
        }
    }

    /// Released nodes as (url, forever) pairs, in call order.
    pub fn released(&self) -> Vec<(String, bool)> {
        self.released.lock().unwrap().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Default for MockInfrastructure {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InfrastructureProvider for MockInfrastructure {
    async fn acquire_node(&self, url: &str) -> Result<bool> {
        if self.fail_acquires.load(Ordering::SeqCst) {
            anyhow::bail!("mock infrastructure configured to fail");
        }
        debug!(url, "[MOCK] Acquiring node");
        Ok(true)
    }

    async fn acquire_nodes(&self, params: &serde_json::Value) -> Result<Vec<String>> {
        if self.fail_acquires.load(Ordering::SeqCst) {
            anyhow::bail!("mock infrastructure configured to fail");
        }
        let urls: Vec<String> = serde_json::from_value(params.clone())?;
        debug!(count = urls.len(), "[MOCK] Acquiring node batch");
        Ok(urls)
    }

    async fn release_node(&self, url: &str, forever: bool) -> Result<()> {
        debug!(url, forever, "[MOCK] Releasing node");
        self.released
            .lock()
            .unwrap()
            .push((url.to_string(), forever));
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(delay) = self.shutdown_delay {
            tokio::time::sleep(delay).await;
        }
        self.shut_down.store(true, Ordering::SeqCst);
        debug!("[MOCK] Infrastructure shut down");
        Ok(())
    }
}

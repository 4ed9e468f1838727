//! Node acquisition policies.
//!
//! A policy decides *when* a source acquires and releases nodes. The
//! scoring and scheduling of acquisitions is outside the core; the
//! coordinator only drives the policy's lifecycle (activate on source
//! creation, shutdown on source removal) and registers it as a trusted
//! caller so it can post acquisition callbacks.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::error::CoreError;

/// Type name of the built-in static policy.
pub const STATIC_POLICY: &str = "static";

/// Acquisition policy lifecycle contract.
#[async_trait]
pub trait AcquisitionPolicy: Send + Sync {
    /// Start acquiring nodes. Called once after the source is registered.
    async fn activate(&self) -> Result<()>;

    /// Stop acquiring nodes and release policy-level resources.
    async fn shutdown(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn AcquisitionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn AcquisitionPolicy")
    }
}

/// Construct a policy from its type name and opaque parameters.
pub fn create_policy(
    kind: &str,
    params: &serde_json::Value,
) -> Result<Arc<dyn AcquisitionPolicy>, CoreError> {
    match kind {
        STATIC_POLICY => {
            let _ = params; // the static policy takes no parameters
            Ok(Arc::new(StaticPolicy))
        }
        other => Err(CoreError::UnknownPluginType {
            kind: "policy",
            name: other.to_string(),
        }),
    }
}

/// Policy that never acquires on its own: nodes are added explicitly
/// through the coordinator and stay until removed.
pub struct StaticPolicy;

#[async_trait]
impl AcquisitionPolicy for StaticPolicy {
    async fn activate(&self) -> Result<()> {
        debug!("Static policy activated");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        debug!("Static policy shut down");
        Ok(())
    }
}

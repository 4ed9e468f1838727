//! Coordinator error types.
//!
//! Only configuration, ownership, and authorization failures cross the
//! coordinator boundary. Node-level faults never do: they are absorbed by
//! the lifecycle state machine (the node goes `Down`) and the operation
//! returns normally.

use thiserror::Error;

/// Errors reported to callers of coordinator entry points.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A node source with this name is already registered.
    #[error("node source name {0} already exists")]
    SourceAlreadyExists(String),

    /// No node source with this name is registered.
    #[error("unknown node source: {0}")]
    UnknownSource(String),

    /// The default node source cannot be removed.
    #[error("default node source cannot be removed")]
    DefaultSourceRemoval,

    /// The node URL is already registered under a different source.
    #[error("node {url} is already registered under source {owner}")]
    NodeOwnershipConflict { url: String, owner: String },

    /// The caller is not in the trusted-caller whitelist.
    #[error("caller {0} is not authorized")]
    Unauthorized(String),

    /// The operation is part of the contract surface but has no defined
    /// semantics. Returned instead of a silent empty result.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// The infrastructure or policy type name is not known to any factory.
    #[error("unknown {kind} type: {name}")]
    UnknownPluginType { kind: &'static str, name: String },

    /// The coordinator actor is no longer accepting requests.
    #[error("coordinator stopped")]
    CoordinatorStopped,
}

/// Convenience alias for entry-point results.
pub type CoreResult<T> = Result<T, CoreError>;

//! gridpool Coordinator Library
//!
//! The coordinator is the resource-manager core of a gridpool deployment.
//! It owns the authoritative registry of compute nodes and node sources,
//! drives every node through the Free/Busy/ToRelease/Down lifecycle, and
//! serves allocation requests from the scheduler.
//!
//! ## Architecture
//!
//! All state lives inside one actor:
//!
//! ```text
//! Coordinator (single-writer actor)
//! ├── NodeRegistry      (node descriptors + free list)
//! ├── SourceRegistry    (node sources: provider + policy + ping frequency)
//! └── TrustedCallers    (whitelist gating privileged entry points)
//! ```
//!
//! Collaborators (infrastructure providers, acquisition policies, the node
//! selector, the event broadcaster) are reached through fire-and-forget
//! delegation; their callbacks return through the coordinator's mailbox.
//!
//! ## Modules
//!
//! - `coordinator`: The coordinator actor and its typed handle
//! - `registry`: Node descriptors, lifecycle transitions, free list
//! - `source`: Node-source handles and their registry
//! - `infrastructure` / `policy`: Per-source collaborator plugins
//! - `selection`: Allocation predicates and the selector seam
//! - `monitoring`: Event broadcasting
//! - `auth`: Caller identities, the trusted whitelist, login fallback

pub mod actor;
pub mod auth;
pub mod coordinator;
pub mod infrastructure;
pub mod monitoring;
pub mod node;
pub mod policy;
pub mod registry;
pub mod selection;
pub mod source;

// Internal modules exposed for integration tests
pub mod config;
pub mod error;

// Re-export commonly used types
pub use coordinator::{Coordinator, CoordinatorHandle};
pub use error::{CoreError, CoreResult};
pub use source::DEFAULT_SOURCE_NAME;

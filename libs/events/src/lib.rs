//! # gridpool-events
//!
//! Event type definitions and serialization for the gridpool resource
//! manager.
//!
//! ## Design Principles
//!
//! - Events are immutable records of state transitions that already happened
//! - Every mutating coordinator operation emits exactly one event
//! - Events carry lookup keys (node URLs, source names), never references
//!   into coordinator state
//!
//! ## Event Families
//!
//! - Node events (`node.*`): registration, state changes, removal
//! - Node-source events (`source.*`): creation and removal of node pools
//! - System events (`system.*`): coordinator lifecycle

mod error;
mod types;

pub use error::EventError;
pub use types::*;

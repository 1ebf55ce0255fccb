//! Nullable infrastructure for deterministic testing.
//!
//! The daemon reaches the outside world through two seams: the node
//! attribute interface and the fabric transport. This crate provides
//! in-memory implementations of both that:
//! - Record every write and connection for assertions
//! - Can be scripted to change state or fail on demand
//! - Never touch sysfs or the network
//!
//! Usage: build a daemon context with these instead of the real backends.

pub mod attributes;
pub mod fabric;

pub use attributes::{NullAttributes, RecordedWrite};
pub use fabric::{NullEndpoint, NullFabric};

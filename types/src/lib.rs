//! Fundamental types for the cardkeeper host daemon.
//!
//! This crate defines the types shared by every other crate in the workspace:
//! node identities and fabric addresses, the lifecycle state enum and the
//! commands written to a node's state attribute, and the per-user cookie.

pub mod cookie;
pub mod error;
pub mod node;
pub mod state;

pub use cookie::{Cookie, COOKIE_SIZE};
pub use error::TypesError;
pub use node::{FabricAddr, NodeId, HOST_FABRIC_NODE};
pub use state::{NodeState, RuntimeMode, StateCommand};

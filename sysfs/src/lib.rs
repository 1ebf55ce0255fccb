//! Node attribute access.
//!
//! The kernel driver exposes each card as a directory of small text
//! attributes (`state`, `mode`, `cmdline`, ...). The daemon only ever reads,
//! writes and waits on those attributes; [`NodeAttributes`] is that surface.

pub mod attributes;
pub mod error;
pub mod sysfs;

pub use attributes::{NodeAttributes, WaitOutcome};
pub use error::AttributeError;
pub use sysfs::SysfsAttributes;

//! Core of the cardkeeper host daemon.
//!
//! A [`DaemonContext`] holds the configuration, the card registry and the
//! shared job table. [`Daemon::start`] launches the per-card state watchers
//! and boot workers along with the monitor listener and the credential
//! broker; [`Daemon::shutdown`] drives every card to a reset.

pub mod boot;
pub mod cmdline;
pub mod config;
pub mod context;
pub mod cookie;
pub mod crash_dump;
pub mod credentials;
pub mod daemon;
pub mod error;
pub mod image;
pub mod jobs;
mod listener;
pub mod monitor;
pub mod registry;
pub mod shutdown;
pub mod state_watcher;
pub mod users;
pub mod workers;

pub use boot::{spawn_boot, BootOutcome, BootWorker};
pub use config::{CardConfig, DaemonConfig};
pub use context::DaemonContext;
pub use daemon::Daemon;
pub use error::{BootError, ConfigError, CookieError, CrashDumpError, HandshakeError, HostError};
pub use image::{BootImageValidator, BzImageValidator};
pub use jobs::JobTable;
pub use registry::{Node, NodeRegistry};
pub use shutdown::{ShutdownController, ShutdownSummary};
pub use workers::{Countdown, StopSignal, WorkerKind, Workers};

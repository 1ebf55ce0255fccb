use std::io;
use std::path::PathBuf;

use thiserror::Error;

use cardkeeper_network::NetworkError;
use cardkeeper_protocol::{Opcode, ProtocolError};
use cardkeeper_sysfs::AttributeError;
use cardkeeper_types::NodeState;

/// Daemon-level failures. Only startup surfaces these to the caller.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("no usable cards found")]
    NoNodes,

    #[error("attribute error: {0}")]
    Attribute(#[from] AttributeError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid value: {0}")]
    Invalid(String),
}

/// Why one boot attempt was abandoned.
#[derive(Debug, Error)]
pub enum BootError {
    #[error("{0} not configured")]
    NotConfigured(&'static str),

    #[error("{what} '{}' not found", path.display())]
    NotFound { what: &'static str, path: PathBuf },

    #[error("{} is not a valid Linux bzImage: {reason}", path.display())]
    InvalidImage { path: PathBuf, reason: String },

    #[error("{0}")]
    Cmdline(String),

    #[error("wait for {0} to complete timed out")]
    WaitTimedOut(NodeState),

    #[error("current state \"{0}\" cannot boot card")]
    NotReady(NodeState),

    #[error("stopped")]
    Stopped,

    #[error(transparent)]
    Attribute(#[from] AttributeError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum CookieError {
    #[error("cannot switch file-system identity to {id}")]
    Impersonate { id: u32 },

    #[error("cannot read random bytes: {0}")]
    Random(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cookie task failed: {0}")]
    Join(String),
}

#[derive(Debug, Error)]
pub enum CrashDumpError {
    #[error("dump directory {} usage {usage} exceeds limit {limit}", dir.display())]
    QuotaExceeded {
        dir: PathBuf,
        usage: u64,
        limit: u64,
    },

    #[error("free space {available} below required {required}")]
    InsufficientSpace { available: u64, required: u64 },

    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("capture cancelled")]
    Cancelled,

    #[error("dump task failed: {0}")]
    Join(String),
}

impl CrashDumpError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { op, path, source }
    }
}

/// Handshake failures on the monitor channel.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unexpected opcode {0:?} on monitor port")]
    UnexpectedOpcode(Opcode),

    #[error("node {0} does not seem to exist")]
    UnknownNode(u16),

    #[error("port or node mismatch (reported {reported}, observed {observed})")]
    Mismatch { reported: u16, observed: u16 },

    #[error("node is stopping")]
    Stopped,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

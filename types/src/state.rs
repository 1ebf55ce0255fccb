//! Node lifecycle states and the commands written to the state attribute.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The lifecycle state a node reports through its `state` attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Idle and able to accept a boot command.
    Ready,
    /// A boot command was accepted and the card OS is coming up.
    Booting,
    /// The card OS is running.
    Online,
    /// The card OS was shut down and awaits a reset.
    Shutdown,
    /// A reset is in progress.
    Resetting,
    /// The card stopped responding; its memory can be captured.
    Lost,
    /// The last reset did not bring the card back to ready.
    ResetFailed,
    /// Anything the daemon does not recognise.
    Unknown,
}

impl NodeState {
    /// Parse the (whitespace-trimmed) attribute text.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "ready" => Self::Ready,
            "booting" => Self::Booting,
            "online" => Self::Online,
            "shutdown" => Self::Shutdown,
            "resetting" => Self::Resetting,
            "lost" => Self::Lost,
            "reset failed" => Self::ResetFailed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Booting => "booting",
            Self::Online => "online",
            Self::Shutdown => "shutdown",
            Self::Resetting => "resetting",
            Self::Lost => "lost",
            Self::ResetFailed => "reset failed",
            Self::Unknown => "unknown",
        }
    }

    /// States in which the node needs no shutdown action from the daemon.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Ready | Self::Resetting)
    }

    /// States showing that something already brought the card back up.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Online | Self::Booting)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command written to a node's `state` attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateCommand {
    Boot {
        tag: String,
        image: String,
        root: String,
    },
    Reset,
    ResetForce,
    Shutdown,
}

impl StateCommand {
    /// Boot command for a Linux image with the given root source.
    pub fn boot_linux(image: impl Into<String>, root: impl Into<String>) -> Self {
        Self::Boot {
            tag: "linux".to_string(),
            image: image.into(),
            root: root.into(),
        }
    }
}

impl fmt::Display for StateCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boot { tag, image, root } => write!(f, "boot:{tag}:{image}:{root}"),
            Self::Reset => f.write_str("reset"),
            Self::ResetForce => f.write_str("reset:force"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// What the card is running, as reported by its `mode` attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuntimeMode {
    Linux,
    Other(String),
}

impl RuntimeMode {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "linux" => Self::Linux,
            other => Self::Other(other.to_string()),
        }
    }
}

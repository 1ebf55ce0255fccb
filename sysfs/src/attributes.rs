//! The attribute trait and its state-specific helpers.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use cardkeeper_types::{NodeState, RuntimeMode, StateCommand};

use crate::AttributeError;

/// Result of waiting for an attribute change notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Changed,
    TimedOut,
    /// The wait was interrupted by a signal and should be retried.
    Interrupted,
}

/// Read/write/wait access to per-node attributes.
#[async_trait]
pub trait NodeAttributes: Send + Sync {
    /// Read an attribute, trailing whitespace removed.
    async fn read(&self, node: &str, entry: &str) -> Result<String, AttributeError>;

    async fn write(&self, node: &str, entry: &str, value: &str) -> Result<(), AttributeError>;

    /// Block until the attribute signals a change or `timeout` elapses.
    async fn wait_change(
        &self,
        node: &str,
        entry: &str,
        timeout: Duration,
    ) -> Result<WaitOutcome, AttributeError>;

    /// Names of every node the driver currently exposes.
    async fn enumerate(&self) -> Result<Vec<String>, AttributeError>;

    /// Read an attribute that is not tied to one node.
    async fn read_global(&self, path: &Path) -> Result<String, AttributeError>;

    async fn read_state(&self, node: &str) -> Result<NodeState, AttributeError> {
        Ok(NodeState::parse(&self.read(node, "state").await?))
    }

    async fn write_command(&self, node: &str, cmd: &StateCommand) -> Result<(), AttributeError> {
        self.write(node, "state", &cmd.to_string()).await
    }

    async fn read_mode(&self, node: &str) -> Result<RuntimeMode, AttributeError> {
        Ok(RuntimeMode::parse(&self.read(node, "mode").await?))
    }
}

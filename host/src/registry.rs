//! The set of managed cards.
//!
//! Built once at startup and read-only afterwards; each [`Node`] owns its
//! mutable lifecycle fields behind its own locks.

use std::sync::{Arc, Mutex};

use cardkeeper_network::Connection;
use cardkeeper_sysfs::NodeAttributes;
use cardkeeper_types::{NodeId, NodeState};

use crate::config::{CardConfig, DaemonConfig};
use crate::workers::{StopSignal, Workers};
use crate::HostError;

/// One managed card.
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub config: CardConfig,
    pub workers: Arc<Workers>,
    pub stop: StopSignal,
    state: Mutex<NodeState>,
    broadcast: tokio::sync::Mutex<Option<Connection>>,
}

impl Node {
    pub fn new(id: NodeId, config: CardConfig, state: NodeState) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: config.name.clone(),
            config,
            workers: Workers::new(),
            stop: StopSignal::new(),
            state: Mutex::new(state),
            broadcast: tokio::sync::Mutex::new(None),
        })
    }

    /// Last state observed by the state watcher.
    pub fn last_state(&self) -> NodeState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a newly observed state, returning the previous one.
    pub(crate) fn observe_state(&self, state: NodeState) -> NodeState {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, state)
    }

    /// The host-to-card channel used for credential fan-out.
    pub fn broadcast(&self) -> &tokio::sync::Mutex<Option<Connection>> {
        &self.broadcast
    }

    pub async fn is_monitored(&self) -> bool {
        self.broadcast.lock().await.is_some()
    }
}

pub struct NodeRegistry {
    nodes: Vec<Arc<Node>>,
}

impl NodeRegistry {
    /// Join the cards the driver exposes with the configured ones.
    ///
    /// A card whose state cannot be read is ignored. Finding no usable card
    /// is fatal.
    pub async fn discover(
        config: &DaemonConfig,
        attrs: &dyn NodeAttributes,
    ) -> Result<Self, HostError> {
        let present = attrs.enumerate().await?;
        for card in &config.cards {
            if !present.contains(&card.name) {
                tracing::warn!(node = %card.name, "configured but not present - skipping");
            }
        }

        let mut nodes = Vec::new();
        for name in present {
            let Some(card) = config.card(&name) else {
                tracing::warn!(node = %name, "present but not configured - ignoring");
                continue;
            };
            let state = match attrs.read_state(&name).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::error!(node = %name, error = %e, "ignoring - critical failure reading state");
                    continue;
                }
            };
            let id = card.node_id()?;
            tracing::info!(node = %name, id = %id, state = %state, "card discovered");
            nodes.push(Node::new(id, card.clone(), state));
        }

        if nodes.is_empty() {
            return Err(HostError::NoNodes);
        }
        Ok(Self::from_nodes(nodes))
    }

    pub fn from_nodes(mut nodes: Vec<Arc<Node>>) -> Self {
        nodes.sort_by_key(|n| n.id);
        Self { nodes }
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn by_id(&self, id: NodeId) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardkeeper_nullables::NullAttributes;

    fn config(names: &[&str]) -> DaemonConfig {
        DaemonConfig {
            cards: names.iter().map(|n| CardConfig::new(n)).collect(),
            ..DaemonConfig::default()
        }
    }

    #[tokio::test]
    async fn discovers_configured_present_cards() {
        let attrs = NullAttributes::new();
        attrs.add_node("mic0", "ready");
        attrs.add_node("mic1", "online");
        attrs.add_node("mic7", "ready");

        let registry = NodeRegistry::discover(&config(&["mic0", "mic1", "mic2"]), &attrs)
            .await
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.by_name("mic1").unwrap().id, NodeId(1));
        assert_eq!(
            registry.by_id(NodeId(1)).unwrap().last_state(),
            NodeState::Online
        );
        assert!(registry.by_name("mic7").is_none());
    }

    #[tokio::test]
    async fn unreadable_state_is_skipped() {
        let attrs = NullAttributes::new();
        attrs.add_node("mic0", "ready");
        attrs.add_node("mic1", "ready");
        attrs.fail_reads("mic0", "state");

        let registry = NodeRegistry::discover(&config(&["mic0", "mic1"]), &attrs)
            .await
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.by_name("mic0").is_none());
    }

    #[tokio::test]
    async fn zero_nodes_is_fatal() {
        let attrs = NullAttributes::new();
        let err = NodeRegistry::discover(&config(&["mic0"]), &attrs)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HostError::NoNodes));
    }
}

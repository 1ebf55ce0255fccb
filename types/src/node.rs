//! Node identities and fabric addressing.
//!
//! Cards are numbered from zero (`mic0`, `mic1`, ...). On the fabric the host
//! occupies node 0 and card `n` answers at fabric node `n + 1`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::TypesError;

/// Fabric node number of the host itself.
pub const HOST_FABRIC_NODE: u16 = 0;

/// Zero-based identifier of one accelerator card.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u16);

impl NodeId {
    /// Highest card id that still has a fabric node of its own.
    pub const MAX: NodeId = NodeId(u16::MAX - 1);

    pub fn new(id: u16) -> Result<Self, TypesError> {
        if id > Self::MAX.0 {
            return Err(TypesError::NodeIdOutOfRange(id));
        }
        Ok(NodeId(id))
    }

    /// The fabric node number this card answers on. Ids past [`NodeId::MAX`]
    /// are refused by [`NodeId::new`]; they never map onto the host.
    pub fn fabric_node(self) -> u16 {
        self.0.saturating_add(1)
    }

    /// Map a fabric node number back to a card id. The host (node 0) has none.
    pub fn from_fabric_node(node: u16) -> Option<Self> {
        node.checked_sub(1).map(NodeId)
    }

    /// Derive the id from a conventional node name such as `mic3`.
    pub fn from_name(name: &str) -> Result<Self, TypesError> {
        let digits: String = name
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let id = digits
            .parse::<u16>()
            .map_err(|_| TypesError::InvalidNodeName(name.to_string()))?;
        Self::new(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One end of a fabric connection: a node number plus a port on that node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FabricAddr {
    pub node: u16,
    pub port: u16,
}

impl FabricAddr {
    pub fn new(node: u16, port: u16) -> Self {
        Self { node, port }
    }
}

impl fmt::Display for FabricAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fabric_numbering_skips_host() {
        assert_eq!(NodeId(0).fabric_node(), 1);
        assert_eq!(NodeId::from_fabric_node(3), Some(NodeId(2)));
        assert_eq!(NodeId::from_fabric_node(HOST_FABRIC_NODE), None);
    }

    #[test]
    fn id_from_name() {
        assert_eq!(NodeId::from_name("mic0"), Ok(NodeId(0)));
        assert_eq!(NodeId::from_name("mic12"), Ok(NodeId(12)));
        assert!(NodeId::from_name("card").is_err());
    }

    #[test]
    fn last_id_is_refused() {
        assert_eq!(NodeId::new(u16::MAX), Err(TypesError::NodeIdOutOfRange(u16::MAX)));
        assert_eq!(NodeId::from_name("mic65535"), Err(TypesError::NodeIdOutOfRange(u16::MAX)));
        assert_eq!(NodeId::new(u16::MAX - 1), Ok(NodeId::MAX));
        assert_eq!(NodeId::MAX.fabric_node(), u16::MAX);
        assert_ne!(NodeId(u16::MAX).fabric_node(), HOST_FABRIC_NODE);
    }
}

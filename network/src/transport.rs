//! Transport seam between daemon logic and the physical fabric.

use async_trait::async_trait;

use cardkeeper_types::FabricAddr;

use crate::{Connection, NetworkError};

/// Opens listeners and outbound connections on the fabric.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind a listener on a local port.
    async fn listen(&self, port: u16) -> Result<Box<dyn Listener>, NetworkError>;

    /// Connect to a port on a remote node.
    async fn connect(&self, peer: FabricAddr) -> Result<Connection, NetworkError>;
}

/// A bound accept point.
#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> Result<Connection, NetworkError>;

    fn local_port(&self) -> u16;
}

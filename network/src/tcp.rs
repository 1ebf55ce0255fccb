//! TCP rendition of the fabric.
//!
//! Each fabric node number maps to an IP address; fabric ports map to TCP
//! ports one to one. The peer port of an accepted connection is the TCP
//! source port, which the card agent can observe on its side and report
//! back during the monitor handshake.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use cardkeeper_types::FabricAddr;

use crate::{Connection, Listener, NetworkError, Transport};

#[derive(Clone, Debug)]
pub struct TcpTransportConfig {
    /// Local address listeners bind to.
    pub bind_address: IpAddr,
    /// Fabric node number to IP address.
    pub nodes: HashMap<u16, IpAddr>,
}

pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    fn node_for(nodes: &HashMap<u16, IpAddr>, ip: IpAddr) -> Option<u16> {
        nodes
            .iter()
            .find_map(|(node, addr)| (*addr == ip).then_some(*node))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, port: u16) -> Result<Box<dyn Listener>, NetworkError> {
        let addr = SocketAddr::new(self.config.bind_address, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::Bind { port, source })?;
        tracing::debug!(%addr, "fabric listener bound");
        Ok(Box::new(TcpFabricListener {
            listener,
            port,
            nodes: self.config.nodes.clone(),
        }))
    }

    async fn connect(&self, peer: FabricAddr) -> Result<Connection, NetworkError> {
        let ip = self
            .config
            .nodes
            .get(&peer.node)
            .copied()
            .ok_or(NetworkError::UnknownNode(peer.node))?;
        let stream = TcpStream::connect(SocketAddr::new(ip, peer.port))
            .await
            .map_err(|source| NetworkError::Connect { peer, source })?;
        stream.set_nodelay(true)?;
        let local_port = stream.local_addr()?.port();
        Ok(Connection::new(Box::new(stream), local_port, peer))
    }
}

struct TcpFabricListener {
    listener: TcpListener,
    port: u16,
    nodes: HashMap<u16, IpAddr>,
}

#[async_trait]
impl Listener for TcpFabricListener {
    async fn accept(&mut self) -> Result<Connection, NetworkError> {
        loop {
            let (stream, addr) = self.listener.accept().await.map_err(NetworkError::Accept)?;
            let Some(node) = TcpTransport::node_for(&self.nodes, addr.ip()) else {
                tracing::warn!(%addr, port = self.port, "rejecting connection from unknown address");
                continue;
            };
            stream.set_nodelay(true)?;
            let peer = FabricAddr::new(node, addr.port());
            return Ok(Connection::new(Box::new(stream), self.port, peer));
        }
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

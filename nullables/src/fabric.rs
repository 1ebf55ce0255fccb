//! Nullable fabric: in-memory connections between numbered nodes.
//!
//! Every endpoint is a node on a shared [`NullFabric`]. Connections are
//! tokio duplex pipes; each outbound connection draws an ephemeral local
//! port so handshake port checks behave as they do on a real fabric.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use cardkeeper_network::{Connection, Listener, NetworkError, Transport};
use cardkeeper_types::FabricAddr;

const PIPE_CAPACITY: usize = 64 * 1024;
const FIRST_EPHEMERAL_PORT: u16 = 40_000;

#[derive(Default)]
struct Switch {
    listeners: HashMap<(u16, u16), mpsc::UnboundedSender<Connection>>,
    next_port: HashMap<u16, u16>,
    connects: Vec<(u16, FabricAddr)>,
}

/// A shared in-memory fabric.
#[derive(Clone, Default)]
pub struct NullFabric {
    switch: Arc<Mutex<Switch>>,
}

impl NullFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Switch> {
        self.switch.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A transport bound to one fabric node.
    pub fn endpoint(&self, node: u16) -> NullEndpoint {
        NullEndpoint {
            fabric: self.clone(),
            node,
        }
    }

    /// Every outbound connection attempt as (from node, target).
    pub fn connects(&self) -> Vec<(u16, FabricAddr)> {
        self.lock().connects.clone()
    }

    pub fn is_listening(&self, node: u16, port: u16) -> bool {
        self.lock().listeners.contains_key(&(node, port))
    }
}

/// One node's view of the fabric.
#[derive(Clone)]
pub struct NullEndpoint {
    fabric: NullFabric,
    node: u16,
}

impl NullEndpoint {
    pub fn node(&self) -> u16 {
        self.node
    }
}

#[async_trait]
impl Transport for NullEndpoint {
    async fn listen(&self, port: u16) -> Result<Box<dyn Listener>, NetworkError> {
        let mut switch = self.fabric.lock();
        let key = (self.node, port);
        if switch.listeners.get(&key).is_some_and(|tx| !tx.is_closed()) {
            return Err(NetworkError::Bind {
                port,
                source: io::Error::from(io::ErrorKind::AddrInUse),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        switch.listeners.insert(key, tx);
        Ok(Box::new(NullListener { rx, port }))
    }

    async fn connect(&self, peer: FabricAddr) -> Result<Connection, NetworkError> {
        let mut switch = self.fabric.lock();
        switch.connects.push((self.node, peer));
        let refused = || NetworkError::Connect {
            peer,
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        let tx = switch
            .listeners
            .get(&(peer.node, peer.port))
            .cloned()
            .ok_or_else(refused)?;

        let next = switch.next_port.entry(self.node).or_insert(FIRST_EPHEMERAL_PORT);
        let local_port = *next;
        *next = next.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let remote = Connection::new(
            Box::new(far),
            peer.port,
            FabricAddr::new(self.node, local_port),
        );
        tx.send(remote).map_err(|_| refused())?;
        Ok(Connection::new(Box::new(near), local_port, peer))
    }
}

struct NullListener {
    rx: mpsc::UnboundedReceiver<Connection>,
    port: u16,
}

#[async_trait]
impl Listener for NullListener {
    async fn accept(&mut self) -> Result<Connection, NetworkError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| NetworkError::Accept(io::Error::from(io::ErrorKind::NotConnected)))
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

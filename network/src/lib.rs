//! Fabric transport for the cardkeeper daemon.
//!
//! The daemon talks to card agents over numbered (node, port) endpoints.
//! [`Transport`] abstracts the fabric so the daemon logic is independent of
//! whether frames travel over TCP or an in-memory test fabric.

pub mod connection;
pub mod error;
pub mod tcp;
pub mod transport;

pub use connection::{ByteStream, Connection};
pub use error::{is_peer_disconnect, NetworkError};
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use transport::{Listener, Transport};

use std::io;

use thiserror::Error;

use cardkeeper_types::FabricAddr;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("fabric node {0} has no configured address")]
    UnknownNode(u16),

    #[error("cannot listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("cannot connect to {peer}: {source}")]
    Connect {
        peer: FabricAddr,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl NetworkError {
    pub fn is_peer_disconnect(&self) -> bool {
        match self {
            Self::Io(e) | Self::Accept(e) => is_peer_disconnect(e),
            Self::Connect { source, .. } => is_peer_disconnect(source),
            _ => false,
        }
    }
}

/// Whether an I/O failure means the peer went away, as opposed to a local
/// or protocol fault.
pub fn is_peer_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_disconnects() {
        assert!(is_peer_disconnect(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_peer_disconnect(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(!is_peer_disconnect(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!NetworkError::UnknownNode(3).is_peer_disconnect());
    }
}

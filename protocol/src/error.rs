use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u32),

    #[error("unknown credential status: {0}")]
    UnknownStatus(u32),

    #[error("field too long: {len} > {max}")]
    FieldTooLong { len: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// The underlying I/O error, if this failure came from the transport.
    pub fn io_error(&self) -> Option<&std::io::Error> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

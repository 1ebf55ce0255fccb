//! Errors raised while parsing shared types.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypesError {
    #[error("cookie must be exactly {expected} bytes, got {actual}")]
    CookieLength { expected: usize, actual: usize },

    #[error("invalid node name: {0}")]
    InvalidNodeName(String),

    #[error("node id {0} is out of range")]
    NodeIdOutOfRange(u16),
}

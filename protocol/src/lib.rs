//! Wire protocol spoken between the host daemon and the agent on each card.
//!
//! Every frame starts with a 4-byte opcode in host byte order followed by
//! opcode-specific fixed or length-prefixed fields. There is no version
//! field; the opcode set is the protocol.

pub mod codec;
pub mod error;
pub mod opcode;
pub mod ports;

pub use codec::{
    read_opcode, read_u16, read_u32, read_u64, write_opcode, write_status, write_u16, write_u32,
    CredentialRequest, MAX_NAME_LEN,
};
pub use error::ProtocolError;
pub use opcode::{CredStatus, Opcode};
pub use ports::{DEFAULT_CREDENTIAL_PORT, DEFAULT_MONITOR_PORT, DEFAULT_MONITOR_REPLY_PORT};

//! Opcodes and credential status codes.

use crate::ProtocolError;

/// Frame opcodes exchanged on the monitor and broadcast channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    MonitorStart = 1,
    MonitorStartAck = 2,
    MonitorStartNack = 3,
    ReqCredential = 4,
    ReqCredentialAck = 5,
    ReqCredentialNack = 6,
    MonitorStopping = 7,
}

impl Opcode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::MonitorStart),
            2 => Ok(Self::MonitorStartAck),
            3 => Ok(Self::MonitorStartNack),
            4 => Ok(Self::ReqCredential),
            5 => Ok(Self::ReqCredentialAck),
            6 => Ok(Self::ReqCredentialNack),
            7 => Ok(Self::MonitorStopping),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// Single status word returned to a credential requester.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CredStatus {
    Success = 0,
    FailUnknownUid = 1,
    FailReadCookie = 2,
    FailMalloc = 3,
}

impl CredStatus {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for CredStatus {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(Self::FailUnknownUid),
            2 => Ok(Self::FailReadCookie),
            3 => Ok(Self::FailMalloc),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

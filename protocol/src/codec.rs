//! Frame codec.
//!
//! Integers are written in host byte order. Helpers are generic over tokio's
//! `AsyncRead`/`AsyncWrite` so the same code serves TCP streams and the
//! in-memory duplex pipes used in tests.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use cardkeeper_types::{Cookie, COOKIE_SIZE};

use crate::{CredStatus, Opcode, ProtocolError};

/// Longest user name accepted in a credential frame.
pub const MAX_NAME_LEN: usize = 256;

pub async fn read_u16<R: AsyncRead + Unpin>(r: &mut R) -> Result<u16, ProtocolError> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf).await?;
    Ok(u16::from_ne_bytes(buf))
}

pub async fn read_u32<R: AsyncRead + Unpin>(r: &mut R) -> Result<u32, ProtocolError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).await?;
    Ok(u32::from_ne_bytes(buf))
}

pub async fn read_u64<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64, ProtocolError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).await?;
    Ok(u64::from_ne_bytes(buf))
}

pub async fn write_u16<W: AsyncWrite + Unpin>(w: &mut W, v: u16) -> Result<(), ProtocolError> {
    w.write_all(&v.to_ne_bytes()).await?;
    w.flush().await?;
    Ok(())
}

pub async fn write_u32<W: AsyncWrite + Unpin>(w: &mut W, v: u32) -> Result<(), ProtocolError> {
    w.write_all(&v.to_ne_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Read the leading opcode of a frame.
pub async fn read_opcode<R: AsyncRead + Unpin>(r: &mut R) -> Result<Opcode, ProtocolError> {
    Opcode::try_from(read_u32(r).await?)
}

pub async fn write_opcode<W: AsyncWrite + Unpin>(
    w: &mut W,
    op: Opcode,
) -> Result<(), ProtocolError> {
    write_u32(w, op.as_u32()).await
}

pub async fn write_status<W: AsyncWrite + Unpin>(
    w: &mut W,
    status: CredStatus,
) -> Result<(), ProtocolError> {
    write_u32(w, status.as_u32()).await
}

/// A `REQ_CREDENTIAL` frame: opcode, job id, name length, name, cookie
/// length, cookie.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialRequest {
    pub job_id: u32,
    pub username: String,
    pub cookie: Cookie,
}

impl CredentialRequest {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let name = self.username.as_bytes();
        if name.len() > MAX_NAME_LEN {
            return Err(ProtocolError::FieldTooLong {
                len: name.len(),
                max: MAX_NAME_LEN,
            });
        }
        let mut buf = Vec::with_capacity(16 + name.len() + COOKIE_SIZE);
        buf.extend_from_slice(&Opcode::ReqCredential.as_u32().to_ne_bytes());
        buf.extend_from_slice(&self.job_id.to_ne_bytes());
        buf.extend_from_slice(&(name.len() as u32).to_ne_bytes());
        buf.extend_from_slice(name);
        buf.extend_from_slice(&(COOKIE_SIZE as u32).to_ne_bytes());
        buf.extend_from_slice(self.cookie.as_bytes());
        Ok(buf)
    }

    /// Write the whole frame. The frame is assembled first so a peer never
    /// sees a partial header followed by an error.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), ProtocolError> {
        let frame = self.encode()?;
        w.write_all(&frame).await?;
        w.flush().await?;
        Ok(())
    }

    /// Read the body of a frame whose opcode was already consumed.
    pub async fn read_body<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, ProtocolError> {
        let job_id = read_u32(r).await?;
        let name_len = read_u32(r).await? as usize;
        if name_len > MAX_NAME_LEN {
            return Err(ProtocolError::FieldTooLong {
                len: name_len,
                max: MAX_NAME_LEN,
            });
        }
        let mut name = vec![0u8; name_len];
        r.read_exact(&mut name).await?;
        let username = String::from_utf8(name)
            .map_err(|e| ProtocolError::Malformed(format!("user name: {e}")))?;
        let cookie_len = read_u32(r).await? as usize;
        if cookie_len != COOKIE_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "cookie length {cookie_len}"
            )));
        }
        let mut cookie = [0u8; COOKIE_SIZE];
        r.read_exact(&mut cookie).await?;
        Ok(Self {
            job_id,
            username,
            cookie: Cookie::new(cookie),
        })
    }
}

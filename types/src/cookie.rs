//! Per-user authentication cookie.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::TypesError;

/// Size of a cookie on disk and on the wire.
pub const COOKIE_SIZE: usize = 8;

/// An 8-byte per-user secret.
///
/// `Debug` is redacted and the bytes are zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Cookie([u8; COOKIE_SIZE]);

impl Cookie {
    pub fn new(bytes: [u8; COOKIE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypesError> {
        let arr: [u8; COOKIE_SIZE] = bytes.try_into().map_err(|_| TypesError::CookieLength {
            expected: COOKIE_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; COOKIE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cookie(..)")
    }
}

// src/core/crypt/sdek.rs

//! The Secret Data Encryption Key: the one piece of key material every
//! volume passphrase and control-store secret is ultimately wrapped under.

use zeroize::{Zeroize, ZeroizeOnDrop};

pub const SDEK_LEN: usize = 32;

/// A 32-byte key that zeroes its backing memory when dropped. Cloning is
/// intentionally explicit (`Sdek::clone_key`) rather than via `Clone`, so
/// copies aren't made accidentally by code that doesn't need the raw bytes.
#[derive(ZeroizeOnDrop)]
pub struct Sdek([u8; SDEK_LEN]);

impl Sdek {
    pub fn generate() -> Result<Self, getrandom::Error> {
        let mut bytes = [0u8; SDEK_LEN];
        getrandom::fill(&mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; SDEK_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SDEK_LEN] {
        &self.0
    }

    pub fn clone_key(&self) -> Self {
        Self(self.0)
    }
}

impl std::fmt::Debug for Sdek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Sdek(<redacted>)")
    }
}

/// A key-encryption key derived from a passphrase or recovery mnemonic. Also
/// zeroized on drop; only ever lives for the duration of a wrap/unwrap call.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Kek([u8; 32]);

impl Kek {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

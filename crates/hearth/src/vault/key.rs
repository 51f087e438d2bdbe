//! The 256-bit vault key

use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;

use crate::error::{HearthError, Result};

/// Key length in bytes
pub const KEY_LEN: usize = 32;

/// Raw AES-256 key, written out as 64 lowercase hex characters
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Parse a 64-character hex string; anything else is rejected, never padded
    pub fn from_hex(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.len() != KEY_LEN * 2 {
            return Err(HearthError::InvalidKeyFormat(format!(
                "expected {} hex characters, got {}",
                KEY_LEN * 2,
                value.len()
            )));
        }

        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(value, &mut bytes)
            .map_err(|e| HearthError::InvalidKeyFormat(format!("not valid hex: {e}")))?;
        Ok(Self(bytes))
    }

    /// Fresh key from the operating system RNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

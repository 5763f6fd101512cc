//! One-way identity hashing.
//!
//! Source user IDs never reach the store. Each is mapped to a stable
//! 12-character alias: the first 12 hex chars of `SHA-256(user_id || pepper)`.
//! The pepper is a process-wide 256-bit secret loaded at startup; changing it
//! (or the hash function) would orphan every alias already persisted.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of an alias in hex characters.
pub const ALIAS_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum PepperError {
    #[error("pepper must be 64 hex characters (256 bits), got {0} characters")]
    BadLength(usize),
    #[error("pepper is not valid hex: {0}")]
    BadHex(#[from] hex::FromHexError),
}

/// Deterministic mapper from source user IDs to public aliases.
#[derive(Clone)]
pub struct IdentityHasher {
    pepper: [u8; 32],
}

impl IdentityHasher {
    /// Build a hasher from a 64-hex-char pepper string.
    ///
    /// # Errors
    ///
    /// Returns an error if the pepper is not exactly 256 bits of hex.
    pub fn from_hex_pepper(pepper_hex: &str) -> Result<Self, PepperError> {
        let trimmed = pepper_hex.trim();
        if trimmed.len() != 64 {
            return Err(PepperError::BadLength(trimmed.len()));
        }
        let bytes = hex::decode(trimmed)?;
        let mut pepper = [0u8; 32];
        pepper.copy_from_slice(&bytes);
        Ok(Self { pepper })
    }

    /// Map a source user ID to its 12-character alias.
    ///
    /// Truncation collisions are theoretically possible but acceptable at
    /// forum scale; the hasher does not detect them.
    #[must_use]
    pub fn alias(&self, user_id: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(user_id.to_string().as_bytes());
        hasher.update(self.pepper);
        let digest = hex::encode(hasher.finalize());
        digest[..ALIAS_LEN].to_string()
    }
}

impl std::fmt::Debug for IdentityHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the pepper.
        f.debug_struct("IdentityHasher").finish_non_exhaustive()
    }
}

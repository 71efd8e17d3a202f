//! Cryptographic primitives for Sluice
//!
//! This module provides:
//! - XChaCha20-Poly1305 AEAD encryption of tunnel frames
//! - Per-client symmetric key material
//! - Secure random number generation

mod aead;
mod keys;

pub use aead::Cipher;
pub use keys::ClientKey;

use thiserror::Error;

/// Length of the per-client symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of the extended nonce in bytes
pub const NONCE_LEN: usize = 24;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Bytes added to every sealed message (nonce prefix + tag)
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length: expected {}, got {0}", KEY_LEN)]
    InvalidKeyLength(usize),

    #[error("Ciphertext truncated: {0} bytes is shorter than the nonce")]
    Truncated(usize),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Random source unavailable")]
    RandomUnavailable,
}

/// Fill `buf` from the operating system's secure random source
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| CryptoError::RandomUnavailable)
}

/// Generate a random nonce
pub fn generate_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    random_bytes(&mut nonce)?;
    Ok(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1).unwrap();
        random_bytes(&mut buf2).unwrap();
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_nonce_not_zero() {
        let nonce = generate_nonce().unwrap();
        assert_ne!(nonce, [0u8; NONCE_LEN]);
    }
}

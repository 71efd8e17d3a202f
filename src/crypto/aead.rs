//! AEAD encryption/decryption of tunnel messages
//!
//! Every sealed message is laid out as `nonce (24B) || ciphertext || tag (16B)`.
//! The nonce is drawn fresh from the system CSPRNG on each call; both peers
//! seal with the same key, so no counter nonces.

use super::{generate_nonce, CryptoError, KEY_LEN, NONCE_LEN, SEAL_OVERHEAD};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};

/// AEAD cipher bound to one client's key
#[derive(Clone)]
pub struct Cipher {
    aead: XChaCha20Poly1305,
}

impl Cipher {
    /// Create a new cipher from raw key bytes (must be exactly 32 bytes)
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }

        let aead = XChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;

        Ok(Self { aead })
    }

    /// Seal `plaintext`, returning `nonce || ciphertext || tag`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = generate_nonce()?;

        let sealed = self
            .aead
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open a message produced by [`Cipher::encrypt`]
    pub fn decrypt(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if message.len() < NONCE_LEN {
            return Err(CryptoError::Truncated(message.len()));
        }

        let (nonce, sealed) = message.split_at(NONCE_LEN);

        self.aead
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::AuthenticationFailed)
    }

    /// Size of the sealed message for a plaintext of `len` bytes
    pub fn sealed_len(len: usize) -> usize {
        len + SEAL_OVERHEAD
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher(XChaCha20Poly1305)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TAG_LEN;

    #[test]
    fn test_cipher_encrypt_decrypt() {
        let key = [0x42u8; KEY_LEN];
        let encrypt_cipher = Cipher::new(&key).unwrap();
        let decrypt_cipher = Cipher::new(&key).unwrap();

        let plaintext = b"Hello, World!";
        let sealed = encrypt_cipher.encrypt(plaintext).unwrap();
        let decrypted = decrypt_cipher.decrypt(&sealed).unwrap();

        assert_eq!(&decrypted, plaintext);
        assert_eq!(sealed.len(), Cipher::sealed_len(plaintext.len()));
    }

    #[test]
    fn test_empty_plaintext() {
        let cipher = Cipher::new(&[7u8; KEY_LEN]).unwrap();
        let sealed = cipher.encrypt(&[]).unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + TAG_LEN);
        assert!(cipher.decrypt(&sealed).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(matches!(
            Cipher::new(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        ));
        assert!(matches!(
            Cipher::new(&[0u8; 33]),
            Err(CryptoError::InvalidKeyLength(33))
        ));
    }

    #[test]
    fn test_nonce_freshness() {
        let cipher = Cipher::new(&[1u8; KEY_LEN]).unwrap();
        let a = cipher.encrypt(b"same plaintext").unwrap();
        let b = cipher.encrypt(b"same plaintext").unwrap();

        assert_ne!(a, b);
        assert_ne!(&a[..NONCE_LEN], &b[..NONCE_LEN]);
        assert_ne!(&a[..NONCE_LEN], &[0u8; NONCE_LEN][..]);
    }

    #[test]
    fn test_truncated_message() {
        let cipher = Cipher::new(&[1u8; KEY_LEN]).unwrap();
        assert!(matches!(
            cipher.decrypt(&[0u8; NONCE_LEN - 1]),
            Err(CryptoError::Truncated(23))
        ));
        // Nonce present but no tag
        assert!(matches!(
            cipher.decrypt(&[0u8; NONCE_LEN]),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_tamper_detection() {
        let cipher = Cipher::new(&[0x42u8; KEY_LEN]).unwrap();
        let plaintext = b"Hello, World!";
        let sealed = cipher.encrypt(plaintext).unwrap();

        // Flipping any single byte (nonce, body or tag) must be detected
        for i in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            assert!(
                matches!(cipher.decrypt(&tampered), Err(CryptoError::AuthenticationFailed)),
                "tampering at byte {} went undetected",
                i
            );
        }
    }

    #[test]
    fn test_wrong_key() {
        let a = Cipher::new(&[1u8; KEY_LEN]).unwrap();
        let b = Cipher::new(&[2u8; KEY_LEN]).unwrap();
        let sealed = a.encrypt(b"secret").unwrap();
        assert!(matches!(b.decrypt(&sealed), Err(CryptoError::AuthenticationFailed)));
    }
}

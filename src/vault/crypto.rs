//! Cryptographic operations for credential storage
//!
//! ChaCha20-Poly1305 with a process-wide 256-bit key and a fresh random
//! 96-bit nonce per record. Nonce reuse would be catastrophic for AEAD
//! security, so sealing never accepts a caller-provided nonce.

use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("master key must be {KEY_LEN} bytes")]
    InvalidKey,

    #[error("encryption failed")]
    EncryptionFailed,

    /// Wrong key, wrong nonce, or tampered ciphertext - indistinguishable by
    /// design, and never a partial plaintext.
    #[error("decryption failed: ciphertext does not authenticate")]
    DecryptionFailed,
}

/// Process-wide vault key. Not derived from user input; supplied by
/// deployment configuration and wiped from memory on drop.
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|_| CryptoError::InvalidKey)?,
        );
        let bytes: [u8; KEY_LEN] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self(bytes))
    }

    /// Generate a fresh random key (setup tooling and tests).
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Encrypt plaintext, returning the ciphertext (tag appended) and the nonce
/// the record must store alongside it.
pub fn seal(key: &MasterKey, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_LEN]), CryptoError> {
    let cipher =
        ChaCha20Poly1305::new_from_slice(&key.0).map_err(|_| CryptoError::InvalidKey)?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok((ciphertext, nonce))
}

/// Decrypt and authenticate a record's ciphertext.
pub fn open(
    key: &MasterKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher =
        ChaCha20Poly1305::new_from_slice(&key.0).map_err(|_| CryptoError::InvalidKey)?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    Ok(Zeroizing::new(plaintext))
}

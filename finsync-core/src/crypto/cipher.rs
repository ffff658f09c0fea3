//! AES-256-GCM content encryption for sync packages.
//!
//! Uses AES-256-GCM with:
//! - 256-bit content key, fresh per package
//! - 96-bit (12 byte) IV, transported next to the ciphertext
//! - 128-bit authentication tag appended to the ciphertext
//!
//! Plaintext is padded to a size bucket before encryption.

use crate::crypto::{CryptoError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroize;

/// Symmetric key protecting one package body.
///
/// The key itself travels sealed to each recipient's public key.
#[derive(Clone)]
pub struct ContentKey {
    key: [u8; 32],
}

impl ContentKey {
    /// Generate a new random content key
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self { key: key.into() }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                got: bytes.len(),
            })?;
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl Drop for ContentKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// IV plus `ciphertext || tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedContent {
    pub iv: [u8; 12],
    pub ciphertext: Vec<u8>,
}

/// Pad, then encrypt a package body under `key` with a random IV.
pub fn encrypt_content(key: &ContentKey, plaintext: &[u8]) -> Result<EncryptedContent> {
    if plaintext.is_empty() {
        return Err(CryptoError::EncryptionFailed(
            "Cannot encrypt empty payload".to_string(),
        ));
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut padded = pad_payload(plaintext);
    let ciphertext = cipher
        .encrypt(&nonce, padded.as_slice())
        .map_err(|e| CryptoError::EncryptionFailed(format!("Package encryption failed: {}", e)));
    padded.zeroize();

    Ok(EncryptedContent {
        iv: nonce.into(),
        ciphertext: ciphertext?,
    })
}

/// Decrypt and unpad a package body.
pub fn decrypt_content(key: &ContentKey, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let iv: [u8; 12] = iv
        .try_into()
        .map_err(|_| CryptoError::InvalidNonce(format!("expected 12 bytes, got {}", iv.len())))?;

    // 16-byte tag plus at least the 8-byte length prefix
    if ciphertext.len() < 24 {
        return Err(CryptoError::DecryptionFailed(
            "Ciphertext too short".to_string(),
        ));
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let mut padded = cipher
        .decrypt(&Nonce::from(iv), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    let plaintext = unpad_payload(&padded);
    padded.zeroize();
    plaintext
}

/// Pad payload to a size bucket to limit metadata leakage.
///
/// Buckets: 256, 512, 1024, 2048, 4096, 8192 bytes, then multiples of 8192.
/// Layout is an 8-byte little-endian length prefix, the data, then zeros.
pub fn pad_payload(data: &[u8]) -> Vec<u8> {
    let buckets = [256, 512, 1024, 2048, 4096, 8192];
    let total_needed = data.len() + 8;
    let bucket_size = buckets
        .iter()
        .find(|&&b| b >= total_needed)
        .copied()
        .unwrap_or(total_needed.div_ceil(8192) * 8192);

    let mut padded = Vec::with_capacity(bucket_size);
    padded.extend_from_slice(&(data.len() as u64).to_le_bytes());
    padded.extend_from_slice(data);
    padded.resize(bucket_size, 0u8);
    padded
}

/// Remove padding from a padded payload.
pub fn unpad_payload(padded: &[u8]) -> Result<Vec<u8>> {
    if padded.len() < 8 {
        return Err(CryptoError::DecryptionFailed(
            "Padded payload too short".to_string(),
        ));
    }

    let len_bytes: [u8; 8] = padded[..8]
        .try_into()
        .map_err(|_| CryptoError::DecryptionFailed("Invalid length prefix".to_string()))?;
    let original_len = u64::from_le_bytes(len_bytes) as usize;

    if original_len > padded.len() - 8 {
        return Err(CryptoError::DecryptionFailed(
            "Invalid padded payload length".to_string(),
        ));
    }

    Ok(padded[8..8 + original_len].to_vec())
}

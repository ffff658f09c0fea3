//! Cryptographic primitives for device sync.
//!
//! This module provides:
//! - X25519 installation key pairs
//! - Asymmetric sealing of small payloads (ephemeral X25519 + HKDF-SHA256 + AES-256-GCM)
//! - AES-256-GCM content encryption with size padding
//! - base64url codecs for everything that crosses the wire

pub mod cipher;
pub mod codec;
pub mod keys;
pub mod sealed;

pub use cipher::{decrypt_content, encrypt_content, ContentKey, EncryptedContent};
pub use codec::{decode_b64url, encode_b64url};
pub use keys::KeyPair;
pub use sealed::{decrypt_asymmetric, encrypt_asymmetric};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid nonce: {0}")]
    InvalidNonce(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Authentication failed - data may have been tampered with")]
    AuthenticationFailed,
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;

//! Asymmetric sealing to an X25519 public key.
//!
//! An ephemeral key pair is generated per message; the shared secret is
//! expanded with HKDF-SHA256 (salted with both public keys) into an
//! AES-256-GCM key. Wire format:
//! `ephemeral_public(32) || nonce(12) || ciphertext || tag(16)`

use crate::crypto::{CryptoError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

const SEAL_INFO: &[u8] = b"finsync-sealed-v1";
const HEADER_LEN: usize = 32 + 12;
const TAG_LEN: usize = 16;

fn derive_key(
    shared: &[u8; 32],
    ephemeral: &PublicKey,
    recipient: &PublicKey,
) -> Result<Zeroizing<[u8; 32]>> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt[..]), shared);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(SEAL_INFO, &mut okm[..])
        .map_err(|e| CryptoError::EncryptionFailed(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

/// Seal `plaintext` so that only the holder of `recipient`'s secret can open it.
pub fn encrypt_asymmetric(plaintext: &[u8], recipient: &PublicKey) -> Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPublicKey(
            "recipient key is a low-order point".to_string(),
        ));
    }

    let key = derive_key(shared.as_bytes(), &ephemeral_public, recipient)?;
    let key_bytes: &[u8; 32] = &key;
    let cipher = Aes256Gcm::new(key_bytes.into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(format!("Seal failed: {}", e)))?;

    let mut sealed = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a message produced by [`encrypt_asymmetric`].
pub fn decrypt_asymmetric(sealed: &[u8], secret: &StaticSecret) -> Result<Vec<u8>> {
    if sealed.len() < HEADER_LEN + TAG_LEN {
        return Err(CryptoError::DecryptionFailed(
            "Sealed message too short".to_string(),
        ));
    }

    let epk_bytes: [u8; 32] = sealed[..32]
        .try_into()
        .map_err(|_| CryptoError::DecryptionFailed("Invalid ephemeral key".to_string()))?;
    let nonce_bytes: [u8; 12] = sealed[32..HEADER_LEN]
        .try_into()
        .map_err(|_| CryptoError::InvalidNonce("Invalid nonce length".to_string()))?;

    let ephemeral_public = PublicKey::from(epk_bytes);
    let shared = secret.diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(CryptoError::AuthenticationFailed);
    }

    let recipient = PublicKey::from(secret);
    let key = derive_key(shared.as_bytes(), &ephemeral_public, &recipient)?;
    let key_bytes: &[u8; 32] = &key;
    let cipher = Aes256Gcm::new(key_bytes.into());
    cipher
        .decrypt(&Nonce::from(nonce_bytes), &sealed[HEADER_LEN..])
        .map_err(|_| CryptoError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn seal_open_roundtrip() {
        let recipient = KeyPair::generate();
        let sealed = encrypt_asymmetric(b"content key", recipient.public()).unwrap();
        let opened = decrypt_asymmetric(&sealed, recipient.secret()).unwrap();
        assert_eq!(opened, b"content key");
    }

    #[test]
    fn sealed_layout_has_header_and_tag() {
        let recipient = KeyPair::generate();
        let sealed = encrypt_asymmetric(&[0u8; 32], recipient.public()).unwrap();
        assert_eq!(sealed.len(), HEADER_LEN + 32 + TAG_LEN);
    }

    #[test]
    fn other_secret_cannot_open() {
        let recipient = KeyPair::generate();
        let intruder = KeyPair::generate();
        let sealed = encrypt_asymmetric(b"secret", recipient.public()).unwrap();
        assert!(matches!(
            decrypt_asymmetric(&sealed, intruder.secret()),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn tampered_ephemeral_key_fails() {
        let recipient = KeyPair::generate();
        let mut sealed = encrypt_asymmetric(b"secret", recipient.public()).unwrap();
        sealed[5] ^= 0x01;
        assert!(decrypt_asymmetric(&sealed, recipient.secret()).is_err());
    }

    #[test]
    fn tampered_body_fails() {
        let recipient = KeyPair::generate();
        let mut sealed = encrypt_asymmetric(b"secret", recipient.public()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(decrypt_asymmetric(&sealed, recipient.secret()).is_err());
    }

    #[test]
    fn truncated_message_fails() {
        let recipient = KeyPair::generate();
        assert!(matches!(
            decrypt_asymmetric(&[0u8; HEADER_LEN + TAG_LEN - 1], recipient.secret()),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn low_order_recipient_is_rejected() {
        let identity_point = PublicKey::from([0u8; 32]);
        assert!(matches!(
            encrypt_asymmetric(b"secret", &identity_point),
            Err(CryptoError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn each_seal_uses_fresh_ephemeral_key() {
        let recipient = KeyPair::generate();
        let a = encrypt_asymmetric(b"same", recipient.public()).unwrap();
        let b = encrypt_asymmetric(b"same", recipient.public()).unwrap();
        assert_ne!(&a[..32], &b[..32]);
    }
}

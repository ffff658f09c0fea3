//! X25519 installation key pairs.

use crate::crypto::codec::{decode_b64url_array, encode_b64url};
use crate::crypto::Result;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// An installation's asymmetric key pair. The secret half never leaves the device.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh key pair from OS randomness.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore from a base64url-encoded secret key.
    pub fn from_secret_b64(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(decode_b64url_array::<32>(encoded)?);
        Ok(Self::from_secret_bytes(*bytes))
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn public_key_b64(&self) -> String {
        encode_b64url(self.public.as_bytes())
    }

    pub fn secret_key_b64(&self) -> Zeroizing<String> {
        let bytes = Zeroizing::new(self.secret.to_bytes());
        Zeroizing::new(encode_b64url(&bytes[..]))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key_b64())
            .finish_non_exhaustive()
    }
}

/// Parse a base64url-encoded X25519 public key.
pub fn parse_public_key(encoded: &str) -> Result<PublicKey> {
    Ok(PublicKey::from(decode_b64url_array::<32>(encoded)?))
}

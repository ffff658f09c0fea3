//! base64url (no padding) codecs.

use crate::crypto::{CryptoError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

pub fn encode_b64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn decode_b64url(text: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(text.trim_end_matches('='))
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))
}

/// Decode into a fixed-size array, rejecting any other length.
pub fn decode_b64url_array<const N: usize>(text: &str) -> Result<[u8; N]> {
    let bytes = decode_b64url(text)?;
    let got = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength { expected: N, got })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_url_safe_without_padding() {
        let encoded = encode_b64url(&[0xfb, 0xff, 0xfe]);
        assert_eq!(encoded, "-__-");
        assert!(!encoded.contains('='));
    }

    #[test]
    fn decode_tolerates_trailing_padding() {
        assert_eq!(decode_b64url("YQ==").unwrap(), b"a");
        assert_eq!(decode_b64url("YQ").unwrap(), b"a");
    }

    #[test]
    fn decode_rejects_standard_alphabet() {
        assert!(decode_b64url("+/+/").is_err());
    }

    #[test]
    fn fixed_size_decode_checks_length() {
        let encoded = encode_b64url(&[7u8; 16]);
        assert!(decode_b64url_array::<16>(&encoded).is_ok());
        match decode_b64url_array::<32>(&encoded) {
            Err(CryptoError::InvalidKeyLength { expected, got }) => {
                assert_eq!(expected, 32);
                assert_eq!(got, 16);
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}

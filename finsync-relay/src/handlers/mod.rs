//! HTTP handlers.

pub mod init;
pub mod installations;
pub mod sync;

use crate::error::RelayError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Reject fields that are empty or not base64url.
pub(crate) fn require_b64url(field: &str, value: &str) -> Result<(), RelayError> {
    let decoded = URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| RelayError::BadRequest(format!("Invalid {}: {}", field, e)))?;
    if decoded.is_empty() {
        return Err(RelayError::BadRequest(format!("Empty {}", field)));
    }
    Ok(())
}

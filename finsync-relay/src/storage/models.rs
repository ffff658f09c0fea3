//! Relay storage model types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One recipient's copy of a pushed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPackage {
    pub package_id: String,
    pub recipient_id: Uuid,
    pub sender_id: Uuid,
    pub iv: String,
    pub ciphertext: String,
    pub wrapped_key: String,
    pub created_at: i64,
}

/// A pushed package before it is split per recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEnvelope {
    pub sender_id: Uuid,
    pub iv: String,
    pub ciphertext: String,
    pub recipient_keys: BTreeMap<Uuid, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredInit {
    pub id: String,
    pub target_uuid: Uuid,
    pub sender_uuid: Uuid,
    pub encrypted_payload: String,
    pub created_at: i64,
}

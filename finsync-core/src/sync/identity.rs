//! Installation identity: this device's id, relay token and X25519 key
//! pair, plus the set of linked installations it encrypts toward.

use crate::crypto::keys::parse_public_key;
use crate::crypto::KeyPair;
use crate::database::{row_str, LocalStore, SqlValue};
use crate::{DatabaseError, Result, SyncError};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};

/// This device's identity within the user's installation mesh.
#[derive(Clone)]
pub struct Installation {
    pub installation_id: Uuid,
    pub auth_token: String,
    pub key_pair: KeyPair,
}

impl std::fmt::Debug for Installation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installation")
            .field("installation_id", &self.installation_id)
            .field("public_key", &self.key_pair.public_key_b64())
            .finish_non_exhaustive()
    }
}

impl Installation {
    /// Create an identity with a fresh X25519 key pair.
    pub fn generate(installation_id: Uuid, auth_token: impl Into<String>) -> Self {
        Self {
            installation_id,
            auth_token: auth_token.into(),
            key_pair: KeyPair::generate(),
        }
    }

    /// Persist to the singleton `installation` row, replacing any previous one.
    pub fn save(&self, store: &dyn LocalStore) -> Result<()> {
        let secret = self.key_pair.secret_key_b64();
        store.execute(
            "INSERT INTO installation (id, installation_id, auth_token, secret_key, public_key, created_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                installation_id = excluded.installation_id,
                auth_token = excluded.auth_token,
                secret_key = excluded.secret_key,
                public_key = excluded.public_key",
            &[
                SqlValue::Text(self.installation_id.to_string()),
                SqlValue::Text(self.auth_token.clone()),
                SqlValue::Text(secret.to_string()),
                SqlValue::Text(self.key_pair.public_key_b64()),
                SqlValue::Integer(crate::now_ms()),
            ],
        )?;
        Ok(())
    }

    pub fn load(store: &dyn LocalStore) -> Result<Option<Self>> {
        let row = store.query_one(
            "SELECT installation_id, auth_token, secret_key FROM installation WHERE id = 1",
            &[],
        )?;
        let Some(row) = row else {
            return Ok(None);
        };

        let id = row_str(&row, "installation_id")
            .ok_or_else(|| DatabaseError::Other("installation row without id".to_string()))?;
        let installation_id = Uuid::parse_str(id)
            .map_err(|e| DatabaseError::Other(format!("Invalid installation_id: {}", e)))?;
        let auth_token = row_str(&row, "auth_token").unwrap_or_default().to_string();
        let secret = row_str(&row, "secret_key")
            .ok_or_else(|| SyncError::Identity("no key pair stored".to_string()))?;
        let key_pair = KeyPair::from_secret_b64(secret)?;

        Ok(Some(Self {
            installation_id,
            auth_token,
            key_pair,
        }))
    }
}

/// Another installation paired with this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedInstallation {
    pub installation_id: Uuid,
    /// base64url X25519 public key; `None` until an introduction arrives.
    pub public_key: Option<String>,
}

impl LinkedInstallation {
    pub fn parsed_key(&self) -> Option<PublicKey> {
        self.public_key
            .as_deref()
            .and_then(|k| parse_public_key(k).ok())
    }
}

/// The registered installation, failing with [`SyncError::Identity`] when
/// the device has not been set up.
pub fn require_identity(store: &dyn LocalStore) -> Result<Installation> {
    Installation::load(store)?
        .ok_or_else(|| SyncError::Identity("no installation registered".to_string()))
}

pub fn get_installation_identity(store: &dyn LocalStore) -> Result<Option<Uuid>> {
    Ok(Installation::load(store)?.map(|i| i.installation_id))
}

pub fn get_private_key(store: &dyn LocalStore) -> Result<StaticSecret> {
    Ok(require_identity(store)?.key_pair.secret().clone())
}

pub fn get_public_key(store: &dyn LocalStore) -> Result<String> {
    Ok(require_identity(store)?.key_pair.public_key_b64())
}

pub fn get_linked_installations(store: &dyn LocalStore) -> Result<Vec<LinkedInstallation>> {
    let rows = store.query_many(
        "SELECT installation_id, public_key FROM linked_installations ORDER BY linked_at, installation_id",
        &[],
    )?;

    let mut linked = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(id) = row_str(&row, "installation_id").and_then(|s| Uuid::parse_str(s).ok())
        else {
            tracing::warn!("Skipping linked installation with malformed id");
            continue;
        };
        linked.push(LinkedInstallation {
            installation_id: id,
            public_key: row_str(&row, "public_key").map(str::to_string),
        });
    }
    Ok(linked)
}

/// Upsert a linked installation keyed by uuid.
///
/// Returns `true` when the link is new or its public key changed.
pub fn save_linked_installation(
    store: &dyn LocalStore,
    installation_id: Uuid,
    public_key: &str,
) -> Result<bool> {
    parse_public_key(public_key)?;

    let existing = store.query_one(
        "SELECT public_key FROM linked_installations WHERE installation_id = ?1",
        &[SqlValue::Text(installation_id.to_string())],
    )?;
    let changed = match &existing {
        None => true,
        Some(row) => match row_str(row, "public_key") {
            Some(known) if known == public_key => false,
            Some(known) => {
                warn!(
                    "Public key of linked installation {} changed from {} to {}",
                    installation_id, known, public_key
                );
                true
            }
            None => true,
        },
    };

    store.execute(
        "INSERT INTO linked_installations (installation_id, public_key, linked_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(installation_id) DO UPDATE SET public_key = excluded.public_key",
        &[
            SqlValue::Text(installation_id.to_string()),
            SqlValue::Text(public_key.to_string()),
            SqlValue::Integer(crate::now_ms()),
        ],
    )?;
    Ok(changed)
}

pub fn remove_linked_installation(store: &dyn LocalStore, installation_id: Uuid) -> Result<bool> {
    let removed = store.execute(
        "DELETE FROM linked_installations WHERE installation_id = ?1",
        &[SqlValue::Text(installation_id.to_string())],
    )?;
    Ok(removed > 0)
}

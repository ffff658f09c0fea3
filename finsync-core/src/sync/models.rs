//! Sync data models: plaintext packages, relay wire format, import results.

use crate::sync::entities::EntityKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Version written into every package this build produces.
pub const PACKAGE_VERSION: u32 = 1;

/// Plaintext snapshot of everything that changed in `(since, created_at]`.
///
/// Records are kept as raw JSON and decoded one at a time during import,
/// so a single malformed record cannot reject the whole package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPackage {
    pub version: u32,
    pub sender_id: Uuid,
    pub created_at: i64,
    pub since: i64,
    /// Keyed by [`EntityKind::as_str`].
    #[serde(default)]
    pub changes: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub tombstones: Vec<Value>,
}

impl SyncPackage {
    pub fn new(sender_id: Uuid, since: i64, created_at: i64) -> Self {
        Self {
            version: PACKAGE_VERSION,
            sender_id,
            created_at,
            since,
            changes: BTreeMap::new(),
            tombstones: Vec::new(),
        }
    }

    /// True when there is nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.tombstones.is_empty() && self.changes.values().all(Vec::is_empty)
    }

    pub fn record_count(&self) -> usize {
        self.changes.values().map(Vec::len).sum::<usize>() + self.tombstones.len()
    }

    pub fn push_change(&mut self, kind: EntityKind, change: &EntityChange) -> serde_json::Result<()> {
        let value = serde_json::to_value(change)?;
        self.changes
            .entry(kind.as_str().to_string())
            .or_default()
            .push(value);
        Ok(())
    }

    pub fn push_tombstone(&mut self, tombstone: &Tombstone) -> serde_json::Result<()> {
        self.tombstones.push(serde_json::to_value(tombstone)?);
        Ok(())
    }
}

/// One entity row plus its association rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChange {
    /// UUID string, or integer for reference entities.
    pub id: Value,
    pub updated_at: i64,
    #[serde(default)]
    pub fields: Map<String, Value>,
    /// Association table name to its rows, parent column omitted.
    #[serde(default)]
    pub links: BTreeMap<String, Vec<Map<String, Value>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub deleted_at: i64,
}

/// A package after hybrid encryption, as sent to and received from the relay.
///
/// `ciphertext` is the package JSON under a one-off content key; each
/// `recipient_keys` entry is that content key sealed to one installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPackage {
    pub sender_id: Uuid,
    #[serde(with = "base64url_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64url_bytes")]
    pub ciphertext: Vec<u8>,
    pub recipient_keys: BTreeMap<Uuid, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub package: EncryptedPackage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub success: bool,
    pub package_id: String,
}

/// A package waiting in this installation's relay mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulledPackage {
    pub id: String,
    pub created_at: i64,
    #[serde(flatten)]
    pub package: EncryptedPackage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullResponse {
    pub packages: Vec<PulledPackage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRequest {
    pub package_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitPostRequest {
    pub target_uuid: Uuid,
    #[serde(with = "base64url_bytes")]
    pub encrypted_payload: Vec<u8>,
}

/// A pairing or introduction package addressed to this installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRecord {
    pub id: String,
    pub sender_uuid: Uuid,
    #[serde(with = "base64url_bytes")]
    pub encrypted_payload: Vec<u8>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitDeleteRequest {
    pub uuid: Uuid,
    pub ids: Vec<String>,
}

/// Plaintext of an init package: the installation being introduced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitPayload {
    pub sender_uuid: Uuid,
    pub public_key: String,
}

/// A record or package that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub package_id: Option<String>,
    pub entity_kind: Option<String>,
    pub entity_id: Option<String>,
    pub message: String,
}

impl RecordError {
    pub fn record(kind: &str, id: Option<&Value>, message: impl Into<String>) -> Self {
        Self {
            package_id: None,
            entity_kind: Some(kind.to_string()),
            entity_id: id.map(display_id),
            message: message.into(),
        }
    }

    pub fn package(package_id: &str, message: impl Into<String>) -> Self {
        Self {
            package_id: Some(package_id.to_string()),
            entity_kind: None,
            entity_id: None,
            message: message.into(),
        }
    }
}

fn display_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Outcome of merging one or more packages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResult {
    /// Inserted or updated rows per entity kind.
    pub imported: BTreeMap<EntityKind, usize>,
    /// Local rows removed by incoming tombstones.
    pub deleted: usize,
    /// Currency ids of accounts inserted by this import, in package order.
    pub new_account_currency_ids: Vec<i64>,
    /// Records skipped because the local copy was at least as new.
    pub conflicts: usize,
    pub errors: Vec<RecordError>,
}

impl ImportResult {
    pub fn record_import(&mut self, kind: EntityKind) {
        *self.imported.entry(kind).or_insert(0) += 1;
    }

    pub fn imported_count(&self, kind: EntityKind) -> usize {
        self.imported.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_imported(&self) -> usize {
        self.imported.values().sum()
    }

    pub fn transactions_imported(&self) -> usize {
        self.imported_count(EntityKind::Transaction)
    }

    /// True when the store was modified.
    pub fn changed_anything(&self) -> bool {
        self.total_imported() > 0 || self.deleted > 0
    }

    pub fn merge(&mut self, other: ImportResult) {
        for (kind, count) in other.imported {
            *self.imported.entry(kind).or_insert(0) += count;
        }
        self.deleted += other.deleted;
        self.new_account_currency_ids
            .extend(other.new_account_currency_ids);
        self.conflicts += other.conflicts;
        self.errors.extend(other.errors);
    }
}

/// Snapshot of this device's sync health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub enabled: bool,
    pub installation_id: Option<Uuid>,
    pub relay_url: Option<String>,
    pub last_sync_at: i64,
    pub last_push_at: i64,
    pub linked_installations: usize,
    pub pending_changes: u64,
}

mod base64url_bytes {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        URL_SAFE_NO_PAD
            .decode(s.trim_end_matches('='))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_package_reports_empty() {
        let mut package = SyncPackage::new(Uuid::new_v4(), 0, 10);
        assert!(package.is_empty());

        package.changes.insert("account".to_string(), Vec::new());
        assert!(package.is_empty());

        package
            .push_tombstone(&Tombstone {
                entity_kind: EntityKind::Tag,
                entity_id: "t1".to_string(),
                deleted_at: 5,
            })
            .unwrap();
        assert!(!package.is_empty());
        assert_eq!(package.record_count(), 1);
    }

    #[test]
    fn package_decodes_without_optional_lists() {
        let raw = json!({
            "version": 1,
            "sender_id": Uuid::nil(),
            "created_at": 20,
            "since": 10,
        });
        let package: SyncPackage = serde_json::from_value(raw).unwrap();
        assert!(package.is_empty());
        assert_eq!(package.since, 10);
    }

    #[test]
    fn encrypted_package_uses_base64url_strings() {
        let recipient = Uuid::new_v4();
        let package = EncryptedPackage {
            sender_id: Uuid::new_v4(),
            iv: vec![0xfb; 12],
            ciphertext: vec![0xff, 0xfe],
            recipient_keys: BTreeMap::from([(recipient, "a2V5".to_string())]),
        };

        let value = serde_json::to_value(&package).unwrap();
        assert_eq!(value["ciphertext"], json!("__4"));
        assert_eq!(value["recipient_keys"][recipient.to_string()], json!("a2V5"));

        let decoded: EncryptedPackage = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, package);
    }

    #[test]
    fn pulled_package_flattens_envelope() {
        let raw = json!({
            "id": "pkg-1",
            "created_at": 1700000000000i64,
            "sender_id": Uuid::nil(),
            "iv": "AAAAAAAAAAAAAAAA",
            "ciphertext": "AQID",
            "recipient_keys": {},
        });
        let pulled: PulledPackage = serde_json::from_value(raw).unwrap();
        assert_eq!(pulled.id, "pkg-1");
        assert_eq!(pulled.package.iv.len(), 12);
        assert_eq!(pulled.package.ciphertext, vec![1, 2, 3]);
    }

    #[test]
    fn import_results_merge() {
        let mut total = ImportResult::default();
        let mut first = ImportResult::default();
        first.record_import(EntityKind::Account);
        first.new_account_currency_ids.push(5);
        let mut second = ImportResult::default();
        second.record_import(EntityKind::Account);
        second.record_import(EntityKind::Transaction);
        second.new_account_currency_ids.push(8);
        second.conflicts = 2;

        total.merge(first);
        total.merge(second);

        assert_eq!(total.imported_count(EntityKind::Account), 2);
        assert_eq!(total.transactions_imported(), 1);
        assert_eq!(total.total_imported(), 3);
        assert_eq!(total.new_account_currency_ids, vec![5, 8]);
        assert_eq!(total.conflicts, 2);
        assert!(total.changed_anything());
    }

    #[test]
    fn record_error_renders_ids() {
        let err = RecordError::record("currency", Some(&json!(5)), "bad");
        assert_eq!(err.entity_id.as_deref(), Some("5"));
        let err = RecordError::record("tag", Some(&json!("t1")), "bad");
        assert_eq!(err.entity_id.as_deref(), Some("t1"));
    }
}

//! Push path: snapshot local changes into a package and seal it.

use crate::crypto::{
    decode_b64url, decrypt_asymmetric, decrypt_content, encode_b64url, encrypt_asymmetric,
    encrypt_content, ContentKey, CryptoError,
};
use crate::database::{row_i64, row_str, LocalStore, Row, SqlValue};
use crate::sync::entities::{EntityKind, TableSpec, CATALOGUE};
use crate::sync::identity::LinkedInstallation;
use crate::sync::models::{EncryptedPackage, EntityChange, SyncPackage, Tombstone};
use crate::{Result, SyncError};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use uuid::Uuid;
use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

/// Collect every row and tombstone stamped in `(since, created_at]`.
pub fn build_package(
    store: &dyn LocalStore,
    sender_id: Uuid,
    since: i64,
    created_at: i64,
) -> Result<SyncPackage> {
    let mut package = SyncPackage::new(sender_id, since, created_at);

    for spec in CATALOGUE.iter() {
        for row in changed_rows(store, spec, since, created_at)? {
            let change = row_to_change(store, spec, row)?;
            package.push_change(spec.kind, &change)?;
        }
    }

    let rows = store.query_many(
        "SELECT entity_kind, entity_id, deleted_at FROM tombstones
         WHERE deleted_at > ?1 AND deleted_at <= ?2
         ORDER BY deleted_at, entity_kind, entity_id",
        &[SqlValue::Integer(since), SqlValue::Integer(created_at)],
    )?;
    for row in rows {
        let kind = row_str(&row, "entity_kind").and_then(EntityKind::parse);
        let (Some(entity_kind), Some(entity_id), Some(deleted_at)) = (
            kind,
            row_str(&row, "entity_id"),
            row_i64(&row, "deleted_at"),
        ) else {
            warn!("Skipping malformed tombstone row: {:?}", row);
            continue;
        };
        package.push_tombstone(&Tombstone {
            entity_kind,
            entity_id: entity_id.to_string(),
            deleted_at,
        })?;
    }

    debug!(
        "Built package since {} at {} with {} records",
        since,
        created_at,
        package.record_count()
    );
    Ok(package)
}

fn changed_rows(
    store: &dyn LocalStore,
    spec: &TableSpec,
    since: i64,
    until: i64,
) -> Result<Vec<Row>> {
    let columns = spec.column_names().collect::<Vec<_>>().join(", ");
    store.query_many(
        &format!(
            "SELECT id, updated_at, {} FROM {} WHERE updated_at > ?1 AND updated_at <= ?2
             ORDER BY updated_at, id",
            columns, spec.table
        ),
        &[SqlValue::Integer(since), SqlValue::Integer(until)],
    )
}

fn row_to_change(store: &dyn LocalStore, spec: &TableSpec, mut row: Row) -> Result<EntityChange> {
    let id = row.remove("id").unwrap_or(Value::Null);
    let updated_at = row_i64(&row, "updated_at").unwrap_or(0);
    row.remove("updated_at");

    let mut links = BTreeMap::new();
    for assoc in spec.associations {
        let columns = assoc
            .columns
            .iter()
            .map(|c| c.name)
            .collect::<Vec<_>>()
            .join(", ");
        let rows = store.query_many(
            &format!(
                "SELECT {cols} FROM {table} WHERE {fk} = ?1 ORDER BY {cols}",
                cols = columns,
                table = assoc.table,
                fk = assoc.parent_column
            ),
            &[crate::database::json_to_sql(&id)],
        )?;
        links.insert(assoc.table.to_string(), rows);
    }

    Ok(EntityChange {
        id,
        updated_at,
        fields: row,
        links,
    })
}

/// Encrypt `package` once under a fresh content key and seal that key to
/// every recipient with a usable public key.
pub fn seal_package(
    package: &SyncPackage,
    recipients: &[LinkedInstallation],
) -> Result<EncryptedPackage> {
    let content_key = ContentKey::generate();
    let plaintext = Zeroizing::new(serde_json::to_vec(package)?);
    let encrypted = encrypt_content(&content_key, &plaintext)?;

    let mut recipient_keys = BTreeMap::new();
    for recipient in recipients {
        let Some(public_key) = recipient.parsed_key() else {
            warn!(
                "No usable public key for {}, not sealing to it",
                recipient.installation_id
            );
            continue;
        };
        let sealed = encrypt_asymmetric(content_key.as_bytes(), &public_key)?;
        recipient_keys.insert(recipient.installation_id, encode_b64url(&sealed));
    }

    if recipient_keys.is_empty() {
        return Err(SyncError::InvalidInput(
            "package has no recipient with a public key".to_string(),
        ));
    }

    Ok(EncryptedPackage {
        sender_id: package.sender_id,
        iv: encrypted.iv.to_vec(),
        ciphertext: encrypted.ciphertext,
        recipient_keys,
    })
}

/// Recover the plaintext package addressed to `me`.
pub fn open_package(
    encrypted: &EncryptedPackage,
    me: Uuid,
    secret: &StaticSecret,
) -> Result<SyncPackage> {
    let wrapped = encrypted.recipient_keys.get(&me).ok_or_else(|| {
        CryptoError::DecryptionFailed("package carries no key for this installation".to_string())
    })?;
    let sealed = decode_b64url(wrapped)?;
    let key_bytes = Zeroizing::new(decrypt_asymmetric(&sealed, secret)?);
    let content_key = ContentKey::from_slice(&key_bytes)?;

    let plaintext = Zeroizing::new(decrypt_content(
        &content_key,
        &encrypted.iv,
        &encrypted.ciphertext,
    )?);
    let package: SyncPackage = serde_json::from_slice(&plaintext)?;

    if package.sender_id != encrypted.sender_id {
        return Err(SyncError::InvalidInput(format!(
            "envelope sender {} does not match package sender {}",
            encrypted.sender_id, package.sender_id
        )));
    }
    Ok(package)
}

/// Decode one change record, keeping decode failures local to it.
pub(crate) fn decode_change(value: &Value) -> std::result::Result<EntityChange, String> {
    serde_json::from_value(value.clone()).map_err(|e| format!("malformed record: {}", e))
}

#[cfg(test)]
pub(crate) fn fields(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::database::Database;
    use serde_json::json;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        db
    }

    fn linked(pair: &KeyPair) -> LinkedInstallation {
        LinkedInstallation {
            installation_id: Uuid::new_v4(),
            public_key: Some(pair.public_key_b64()),
        }
    }

    #[test]
    fn fresh_store_builds_empty_package() {
        let db = setup_db();
        let package = build_package(&db, Uuid::new_v4(), 0, crate::now_ms()).unwrap();
        assert!(package.is_empty());
    }

    #[test]
    fn package_carries_rows_links_and_tombstones() {
        let db = setup_db();
        db.execute_batch(
            "INSERT INTO tags (id, name) VALUES ('t1', 'rent');
             INSERT INTO accounts (id, name, currency_id) VALUES ('a1', 'Checking', 5);
             INSERT INTO account_tags (account_id, tag_id) VALUES ('a1', 't1');
             INSERT INTO wallets (id, name) VALUES ('w1', 'Old');
             DELETE FROM wallets WHERE id = 'w1';",
        )
        .unwrap();

        let package = build_package(&db, Uuid::new_v4(), 0, crate::now_ms() + 1_000).unwrap();

        let accounts = &package.changes["account"];
        assert_eq!(accounts.len(), 1);
        let account = decode_change(&accounts[0]).unwrap();
        assert_eq!(account.id, json!("a1"));
        assert_eq!(account.fields["currency_id"], json!(5));
        assert!(!account.fields.contains_key("updated_at"));
        assert_eq!(account.links["account_tags"], vec![fields(&[("tag_id", json!("t1"))])]);
        assert!(account.updated_at > 0);

        assert_eq!(package.changes["tag"].len(), 1);
        assert!(!package.changes.contains_key("wallet"));

        assert_eq!(package.tombstones.len(), 1);
        let tombstone: Tombstone = serde_json::from_value(package.tombstones[0].clone()).unwrap();
        assert_eq!(tombstone.entity_kind, EntityKind::Wallet);
        assert_eq!(tombstone.entity_id, "w1");
    }

    #[test]
    fn window_is_exclusive_then_inclusive() {
        let db = setup_db();
        let guard = crate::sync::change_tracker::CaptureSuspension::acquire(&db).unwrap();
        db.execute_batch(
            "INSERT INTO icons (id, name, updated_at) VALUES ('i1', 'a', 100);
             INSERT INTO icons (id, name, updated_at) VALUES ('i2', 'b', 200);
             INSERT INTO icons (id, name, updated_at) VALUES ('i3', 'c', 300);",
        )
        .unwrap();
        guard.restore().unwrap();

        let package = build_package(&db, Uuid::new_v4(), 100, 200).unwrap();
        let ids: Vec<Value> = package.changes["icon"]
            .iter()
            .map(|v| decode_change(v).unwrap().id)
            .collect();
        assert_eq!(ids, vec![json!("i2")]);
    }

    #[test]
    fn seeded_currencies_are_not_pushed() {
        let db = setup_db();
        let package = build_package(&db, Uuid::new_v4(), 0, crate::now_ms()).unwrap();
        assert!(!package.changes.contains_key("currency"));
    }

    #[test]
    fn sealed_package_opens_for_each_recipient() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let recipients = vec![linked(&a), linked(&b)];

        let mut package = SyncPackage::new(Uuid::new_v4(), 0, 10);
        package
            .push_change(
                EntityKind::Tag,
                &EntityChange {
                    id: json!("t1"),
                    updated_at: 5,
                    fields: fields(&[("name", json!("food"))]),
                    links: BTreeMap::new(),
                },
            )
            .unwrap();

        let sealed = seal_package(&package, &recipients).unwrap();
        assert_eq!(sealed.recipient_keys.len(), 2);
        assert_eq!(sealed.iv.len(), 12);

        let opened_a = open_package(&sealed, recipients[0].installation_id, a.secret()).unwrap();
        let opened_b = open_package(&sealed, recipients[1].installation_id, b.secret()).unwrap();
        assert_eq!(opened_a, package);
        assert_eq!(opened_b, package);
    }

    #[test]
    fn wrong_recipient_cannot_open() {
        let a = KeyPair::generate();
        let recipient = linked(&a);
        let package = SyncPackage::new(Uuid::new_v4(), 0, 10);
        let sealed = seal_package(&package, &[recipient.clone()]).unwrap();

        let stranger = KeyPair::generate();
        assert!(open_package(&sealed, Uuid::new_v4(), a.secret()).is_err());
        assert!(open_package(&sealed, recipient.installation_id, stranger.secret()).is_err());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let a = KeyPair::generate();
        let recipient = linked(&a);
        let package = SyncPackage::new(Uuid::new_v4(), 0, 10);
        let mut sealed = seal_package(&package, &[recipient.clone()]).unwrap();
        sealed.ciphertext[0] ^= 0xff;

        assert!(open_package(&sealed, recipient.installation_id, a.secret()).is_err());
    }

    #[test]
    fn sealing_without_keys_fails() {
        let package = SyncPackage::new(Uuid::new_v4(), 0, 10);
        let keyless = LinkedInstallation {
            installation_id: Uuid::new_v4(),
            public_key: None,
        };
        assert!(matches!(
            seal_package(&package, &[keyless]),
            Err(SyncError::InvalidInput(_))
        ));
    }
}

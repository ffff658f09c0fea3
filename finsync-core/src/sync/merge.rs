//! Pull path: merge a decrypted package into the local store.
//!
//! Records are applied in catalogue order with change capture suspended, so
//! every row keeps the remote `updated_at` verbatim. Each record runs in its
//! own savepoint; a failure rolls back that record alone and is reported in
//! the [`ImportResult`].

use crate::database::{json_to_sql, row_i64, LocalStore, SqlValue};
use crate::sync::builder::decode_change;
use crate::sync::change_tracker::CaptureSuspension;
use crate::sync::conflict::{ConflictResolver, Resolution};
use crate::sync::entities::{
    Association, EntityKind, IdType, Lifecycle, LinkPolicy, TableSpec, CATALOGUE,
};
use crate::sync::models::{EntityChange, ImportResult, RecordError, SyncPackage, Tombstone};
use crate::{Result, SyncError};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

const SAVEPOINT: &str = "merge_record";

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Inserted { account_currency: Option<i64> },
    Updated,
    Deleted,
    /// Local copy (or local tombstone) was at least as new.
    Conflict,
    /// Nothing to do: unknown reference row, or a tombstone for a row we never had.
    Skipped,
}

/// Merge `package` into `store`.
///
/// An empty package returns an all-zero result without touching the store.
pub fn import_package(store: &dyn LocalStore, package: &SyncPackage) -> Result<ImportResult> {
    let mut result = ImportResult::default();
    if package.is_empty() {
        return Ok(result);
    }

    for kind in package.changes.keys() {
        if EntityKind::parse(kind).is_none() {
            warn!("Package {} carries unknown entity kind {}", package.sender_id, kind);
            result
                .errors
                .push(RecordError::record(kind, None, "unknown entity kind"));
        }
    }

    let capture = CaptureSuspension::acquire(store)?;

    for spec in CATALOGUE.iter() {
        let Some(records) = package.changes.get(spec.kind.as_str()) else {
            continue;
        };
        for raw in records {
            let outcome = in_savepoint(store, || apply_change(store, spec, raw))?;
            record_outcome(&mut result, spec.kind.as_str(), raw.get("id"), outcome);
        }
    }

    for raw in &package.tombstones {
        let outcome = in_savepoint(store, || apply_tombstone(store, raw))?;
        let kind = raw
            .get("entity_kind")
            .and_then(Value::as_str)
            .unwrap_or("tombstone");
        record_outcome(&mut result, kind, raw.get("entity_id"), outcome);
    }

    capture.restore()?;

    info!(
        "Merged package from {}: {} imported, {} deleted, {} conflicts, {} errors",
        package.sender_id,
        result.total_imported(),
        result.deleted,
        result.conflicts,
        result.errors.len()
    );
    Ok(result)
}

/// Run `apply` inside a savepoint.
///
/// The outer `Result` fails only when the savepoint itself cannot be managed;
/// a record-level failure is returned in the inner one after rolling back.
fn in_savepoint<F>(store: &dyn LocalStore, apply: F) -> Result<std::result::Result<Outcome, String>>
where
    F: FnOnce() -> Result<Outcome>,
{
    store.execute_batch(&format!("SAVEPOINT {};", SAVEPOINT))?;
    match apply() {
        Ok(outcome) => {
            store.execute_batch(&format!("RELEASE {};", SAVEPOINT))?;
            Ok(Ok(outcome))
        }
        Err(e) => {
            store.execute_batch(&format!(
                "ROLLBACK TO {sp}; RELEASE {sp};",
                sp = SAVEPOINT
            ))?;
            Ok(Err(e.to_string()))
        }
    }
}

fn record_outcome(
    result: &mut ImportResult,
    kind: &str,
    id: Option<&Value>,
    outcome: std::result::Result<Outcome, String>,
) {
    match outcome {
        Ok(Outcome::Inserted { account_currency }) => {
            if let Some(kind) = EntityKind::parse(kind) {
                result.record_import(kind);
            }
            if let Some(currency_id) = account_currency {
                result.new_account_currency_ids.push(currency_id);
            }
        }
        Ok(Outcome::Updated) => {
            if let Some(kind) = EntityKind::parse(kind) {
                result.record_import(kind);
            }
        }
        Ok(Outcome::Deleted) => result.deleted += 1,
        Ok(Outcome::Conflict) => result.conflicts += 1,
        Ok(Outcome::Skipped) => {}
        Err(message) => {
            warn!("Skipping {} record {:?}: {}", kind, id, message);
            result.errors.push(RecordError::record(kind, id, message));
        }
    }
}

fn invalid(message: impl Into<String>) -> SyncError {
    SyncError::InvalidInput(message.into())
}

/// Bindable id plus its text form as stored in `tombstones.entity_id`.
fn parse_id(spec: &TableSpec, id: &Value) -> Result<(SqlValue, String)> {
    match spec.id_type {
        IdType::Uuid => {
            let text = id
                .as_str()
                .ok_or_else(|| invalid(format!("{} id must be a string", spec.kind)))?;
            uuid::Uuid::parse_str(text)
                .map_err(|e| invalid(format!("{} id is not a UUID: {}", spec.kind, e)))?;
            Ok((SqlValue::Text(text.to_string()), text.to_string()))
        }
        IdType::Integer => {
            let n = id
                .as_i64()
                .ok_or_else(|| invalid(format!("{} id must be an integer", spec.kind)))?;
            Ok((SqlValue::Integer(n), n.to_string()))
        }
    }
}

fn validate(change: &EntityChange, spec: &TableSpec) -> Result<()> {
    for column in spec.columns {
        let value = change.fields.get(column.name).unwrap_or(&Value::Null);
        if !column.accepts(value) {
            return Err(invalid(format!(
                "invalid value for {}.{}: {}",
                spec.table, column.name, value
            )));
        }
    }
    for (table, rows) in &change.links {
        let assoc = spec
            .association(table)
            .ok_or_else(|| invalid(format!("unknown association {} for {}", table, spec.kind)))?;
        for row in rows {
            validate_link(assoc, row)?;
        }
    }
    Ok(())
}

fn validate_link(assoc: &Association, row: &Map<String, Value>) -> Result<()> {
    for column in assoc.columns {
        let value = row.get(column.name).unwrap_or(&Value::Null);
        if !column.accepts(value) {
            return Err(invalid(format!(
                "invalid value for {}.{}: {}",
                assoc.table, column.name, value
            )));
        }
    }
    Ok(())
}

fn local_updated_at(store: &dyn LocalStore, spec: &TableSpec, id: &SqlValue) -> Result<Option<i64>> {
    let row = store.query_one(
        &format!("SELECT updated_at FROM {} WHERE id = ?1", spec.table),
        &[id.clone()],
    )?;
    Ok(row.map(|r| row_i64(&r, "updated_at").unwrap_or(0)))
}

fn local_tombstone(store: &dyn LocalStore, kind: EntityKind, id: &str) -> Result<Option<i64>> {
    let row = store.query_one(
        "SELECT deleted_at FROM tombstones WHERE entity_kind = ?1 AND entity_id = ?2",
        &[
            SqlValue::Text(kind.as_str().to_string()),
            SqlValue::Text(id.to_string()),
        ],
    )?;
    Ok(row.and_then(|r| row_i64(&r, "deleted_at")))
}

fn apply_change(store: &dyn LocalStore, spec: &TableSpec, raw: &Value) -> Result<Outcome> {
    let change = decode_change(raw).map_err(invalid)?;
    let (id, id_text) = parse_id(spec, &change.id)?;
    validate(&change, spec)?;

    let local = local_updated_at(store, spec, &id)?;

    if local.is_none() {
        if spec.lifecycle == Lifecycle::Reference {
            debug!("Ignoring unknown {} {}", spec.kind, id_text);
            return Ok(Outcome::Skipped);
        }
        if let Some(deleted_at) = local_tombstone(store, spec.kind, &id_text)? {
            if ConflictResolver::tombstone_wins(deleted_at, change.updated_at) {
                debug!("{} {} stays deleted", spec.kind, id_text);
                return Ok(Outcome::Conflict);
            }
        }
    }

    match ConflictResolver::resolve(local, change.updated_at) {
        Resolution::KeepLocal => Ok(Outcome::Conflict),
        Resolution::AcceptRemote if local.is_none() => {
            insert_row(store, spec, &id, &change)?;
            for assoc in spec.associations {
                if let Some(rows) = change.links.get(assoc.table) {
                    insert_links(store, assoc, &id, rows)?;
                }
            }
            store.execute(
                "DELETE FROM tombstones WHERE entity_kind = ?1 AND entity_id = ?2",
                &[
                    SqlValue::Text(spec.kind.as_str().to_string()),
                    SqlValue::Text(id_text),
                ],
            )?;
            let account_currency = match spec.kind {
                EntityKind::Account => change.fields.get("currency_id").and_then(Value::as_i64),
                _ => None,
            };
            Ok(Outcome::Inserted { account_currency })
        }
        Resolution::AcceptRemote => {
            update_row(store, spec, &id, &change)?;
            for assoc in spec.associations {
                // Associations absent from the record are left as they are.
                let Some(rows) = change.links.get(assoc.table) else {
                    continue;
                };
                if assoc.policy == LinkPolicy::Replace {
                    store.execute(
                        &format!("DELETE FROM {} WHERE {} = ?1", assoc.table, assoc.parent_column),
                        &[id.clone()],
                    )?;
                }
                insert_links(store, assoc, &id, rows)?;
            }
            Ok(Outcome::Updated)
        }
    }
}

fn insert_row(
    store: &dyn LocalStore,
    spec: &TableSpec,
    id: &SqlValue,
    change: &EntityChange,
) -> Result<()> {
    let columns = spec.column_names().collect::<Vec<_>>();
    let placeholders = (1..=columns.len() + 2)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");

    let mut params = Vec::with_capacity(columns.len() + 2);
    params.push(id.clone());
    for column in &columns {
        params.push(json_to_sql(change.fields.get(*column).unwrap_or(&Value::Null)));
    }
    params.push(SqlValue::Integer(change.updated_at));

    store.execute(
        &format!(
            "INSERT INTO {} (id, {}, updated_at) VALUES ({})",
            spec.table,
            columns.join(", "),
            placeholders
        ),
        &params,
    )?;
    Ok(())
}

fn update_row(
    store: &dyn LocalStore,
    spec: &TableSpec,
    id: &SqlValue,
    change: &EntityChange,
) -> Result<()> {
    let columns = spec.column_names().collect::<Vec<_>>();
    let assignments = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", c, i + 1))
        .collect::<Vec<_>>()
        .join(", ");

    let mut params = Vec::with_capacity(columns.len() + 2);
    for column in &columns {
        params.push(json_to_sql(change.fields.get(*column).unwrap_or(&Value::Null)));
    }
    params.push(SqlValue::Integer(change.updated_at));
    params.push(id.clone());

    store.execute(
        &format!(
            "UPDATE {} SET {}, updated_at = ?{} WHERE id = ?{}",
            spec.table,
            assignments,
            columns.len() + 1,
            columns.len() + 2
        ),
        &params,
    )?;
    Ok(())
}

/// Insert link rows, silently keeping any row that already exists.
fn insert_links(
    store: &dyn LocalStore,
    assoc: &Association,
    parent: &SqlValue,
    rows: &[Map<String, Value>],
) -> Result<()> {
    let columns = assoc.columns.iter().map(|c| c.name).collect::<Vec<_>>();
    let placeholders = (1..=columns.len() + 1)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT OR IGNORE INTO {} ({}, {}) VALUES ({})",
        assoc.table,
        assoc.parent_column,
        columns.join(", "),
        placeholders
    );

    for row in rows {
        let mut params = Vec::with_capacity(columns.len() + 1);
        params.push(parent.clone());
        for column in &columns {
            params.push(json_to_sql(row.get(*column).unwrap_or(&Value::Null)));
        }
        store.execute(&sql, &params)?;
    }
    Ok(())
}

fn apply_tombstone(store: &dyn LocalStore, raw: &Value) -> Result<Outcome> {
    let tombstone: Tombstone = serde_json::from_value(raw.clone())
        .map_err(|e| invalid(format!("malformed tombstone: {}", e)))?;
    let spec = tombstone.entity_kind.spec();
    if spec.lifecycle == Lifecycle::Reference {
        return Ok(Outcome::Skipped);
    }

    let id = match spec.id_type {
        IdType::Uuid => SqlValue::Text(tombstone.entity_id.clone()),
        IdType::Integer => SqlValue::Integer(
            tombstone
                .entity_id
                .parse()
                .map_err(|_| invalid(format!("{} id must be an integer", spec.kind)))?,
        ),
    };

    let outcome = match local_updated_at(store, spec, &id)? {
        Some(local) if ConflictResolver::accept_tombstone(local, tombstone.deleted_at) => {
            store.execute(
                &format!("DELETE FROM {} WHERE id = ?1", spec.table),
                &[id],
            )?;
            Outcome::Deleted
        }
        Some(_) => return Ok(Outcome::Conflict),
        None => Outcome::Skipped,
    };

    // Kept even when the row was never seen, so a late copy cannot resurrect it.
    store.execute(
        "INSERT INTO tombstones (entity_kind, entity_id, deleted_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(entity_kind, entity_id)
         DO UPDATE SET deleted_at = MAX(deleted_at, excluded.deleted_at)",
        &[
            SqlValue::Text(tombstone.entity_kind.as_str().to_string()),
            SqlValue::Text(tombstone.entity_id),
            SqlValue::Integer(tombstone.deleted_at),
        ],
    )?;
    Ok(outcome)
}

//! Change capture: store-level triggers that stamp `updated_at` and record
//! tombstones, plus the scoped suspension used while importing.

use crate::database::{row_i64, LocalStore, SqlValue};
use crate::sync::entities::{Association, Lifecycle, TableSpec, CATALOGUE};
use crate::Result;
use tracing::{debug, warn};

/// Current time in epoch milliseconds, evaluated by SQLite.
const NOW_MS: &str = "CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)";

fn trigger_name(table: &str, event: &str) -> String {
    format!("capture_{}_{}", table, event)
}

fn entity_triggers(spec: &TableSpec, out: &mut Vec<(String, String)>) {
    let table = spec.table;
    let data_columns = spec.column_names().collect::<Vec<_>>().join(", ");

    let name = trigger_name(table, "insert");
    out.push((
        name.clone(),
        format!(
            "CREATE TRIGGER IF NOT EXISTS {name}
             AFTER INSERT ON {table}
             FOR EACH ROW
             BEGIN
                 UPDATE {table} SET updated_at = {NOW_MS} WHERE id = NEW.id;
             END;"
        ),
    ));

    let name = trigger_name(table, "update");
    out.push((
        name.clone(),
        format!(
            "CREATE TRIGGER IF NOT EXISTS {name}
             AFTER UPDATE OF {data_columns} ON {table}
             FOR EACH ROW
             BEGIN
                 UPDATE {table} SET updated_at = MAX({NOW_MS}, OLD.updated_at + 1)
                 WHERE id = NEW.id;
             END;"
        ),
    ));

    if spec.lifecycle == Lifecycle::Owned {
        let name = trigger_name(table, "delete");
        let kind = spec.kind.as_str();
        out.push((
            name.clone(),
            format!(
                "CREATE TRIGGER IF NOT EXISTS {name}
                 AFTER DELETE ON {table}
                 FOR EACH ROW
                 BEGIN
                     INSERT INTO tombstones (entity_kind, entity_id, deleted_at)
                     VALUES ('{kind}', CAST(OLD.id AS TEXT), MAX({NOW_MS}, OLD.updated_at + 1))
                     ON CONFLICT(entity_kind, entity_id)
                     DO UPDATE SET deleted_at = MAX(deleted_at, excluded.deleted_at);
                 END;"
            ),
        ));
    }
}

fn association_triggers(
    parent: &TableSpec,
    assoc: &Association,
    out: &mut Vec<(String, String)>,
) {
    let table = assoc.table;
    let parent_table = parent.table;
    let fk = assoc.parent_column;
    let stamp = format!("UPDATE {parent_table} SET updated_at = MAX({NOW_MS}, updated_at + 1)");

    let name = trigger_name(table, "insert");
    out.push((
        name.clone(),
        format!(
            "CREATE TRIGGER IF NOT EXISTS {name}
             AFTER INSERT ON {table}
             FOR EACH ROW
             BEGIN
                 {stamp} WHERE id = NEW.{fk};
             END;"
        ),
    ));

    let name = trigger_name(table, "update");
    out.push((
        name.clone(),
        format!(
            "CREATE TRIGGER IF NOT EXISTS {name}
             AFTER UPDATE ON {table}
             FOR EACH ROW
             BEGIN
                 {stamp} WHERE id IN (OLD.{fk}, NEW.{fk});
             END;"
        ),
    ));

    let name = trigger_name(table, "delete");
    out.push((
        name.clone(),
        format!(
            "CREATE TRIGGER IF NOT EXISTS {name}
             AFTER DELETE ON {table}
             FOR EACH ROW
             BEGIN
                 {stamp} WHERE id = OLD.{fk};
             END;"
        ),
    ));
}

/// Every capture trigger as `(name, CREATE statement)`, in a stable order.
pub fn capture_triggers() -> Vec<(String, String)> {
    let mut out = Vec::new();
    for spec in CATALOGUE.iter() {
        entity_triggers(spec, &mut out);
        for assoc in spec.associations {
            association_triggers(spec, assoc, &mut out);
        }
    }
    out
}

pub fn capture_trigger_names() -> Vec<String> {
    capture_triggers().into_iter().map(|(name, _)| name).collect()
}

/// Create any capture trigger that is missing. Idempotent.
pub fn install_capture_triggers(store: &dyn LocalStore) -> Result<()> {
    let sql = capture_triggers()
        .into_iter()
        .map(|(_, create)| create)
        .collect::<Vec<_>>()
        .join("\n");
    store.execute_batch(&sql)
}

pub fn remove_capture_triggers(store: &dyn LocalStore) -> Result<()> {
    let sql = capture_trigger_names()
        .into_iter()
        .map(|name| format!("DROP TRIGGER IF EXISTS {};", name))
        .collect::<Vec<_>>()
        .join("\n");
    store.execute_batch(&sql)
}

/// Change capture switched off for the lifetime of the guard.
///
/// While held, writes keep whatever `updated_at` they supply and deletes
/// leave no tombstone. The triggers are recreated by [`restore`] or, if the
/// guard is dropped without it (early return, panic), by `Drop`.
///
/// [`restore`]: CaptureSuspension::restore
pub struct CaptureSuspension<'a> {
    store: &'a dyn LocalStore,
    active: bool,
}

impl<'a> CaptureSuspension<'a> {
    pub fn acquire(store: &'a dyn LocalStore) -> Result<Self> {
        remove_capture_triggers(store)?;
        debug!("Change capture suspended");
        Ok(Self {
            store,
            active: true,
        })
    }

    /// Reinstall the triggers, reporting failure to the caller.
    pub fn restore(mut self) -> Result<()> {
        self.active = false;
        install_capture_triggers(self.store)?;
        debug!("Change capture restored");
        Ok(())
    }
}

impl Drop for CaptureSuspension<'_> {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = install_capture_triggers(self.store) {
                warn!("Failed to restore change capture triggers: {}", e);
            }
        }
    }
}

/// Number of rows and tombstones changed after `since`.
pub fn count_pending_changes(store: &dyn LocalStore, since: i64) -> Result<u64> {
    let mut total = 0u64;
    for spec in CATALOGUE.iter() {
        let row = store.query_one(
            &format!("SELECT COUNT(*) AS n FROM {} WHERE updated_at > ?1", spec.table),
            &[SqlValue::Integer(since)],
        )?;
        total += row.and_then(|r| row_i64(&r, "n")).unwrap_or(0) as u64;
    }
    let row = store.query_one(
        "SELECT COUNT(*) AS n FROM tombstones WHERE deleted_at > ?1",
        &[SqlValue::Integer(since)],
    )?;
    total += row.and_then(|r| row_i64(&r, "n")).unwrap_or(0) as u64;
    Ok(total)
}

//! Per-installation sync cursors.

use crate::database::{row_i64, LocalStore, SqlValue};
use crate::Result;
use uuid::Uuid;

/// Progress markers for one installation, in epoch milliseconds.
///
/// `last_sync_at` moves only after a pull has been merged and acknowledged;
/// `last_push_at` only after every submission of a push was accepted. Both
/// are upserted with `MAX`, so they never move backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncState {
    pub installation_id: Uuid,
    pub last_sync_at: i64,
    pub last_push_at: i64,
}

impl SyncState {
    /// Load cursors, defaulting to zero when no row exists.
    pub fn load(store: &dyn LocalStore, installation_id: Uuid) -> Result<Self> {
        let row = store.query_one(
            "SELECT last_sync_at, last_push_at FROM sync_state WHERE installation_id = ?1",
            &[SqlValue::Text(installation_id.to_string())],
        )?;

        Ok(match row {
            Some(row) => Self {
                installation_id,
                last_sync_at: row_i64(&row, "last_sync_at").unwrap_or(0),
                last_push_at: row_i64(&row, "last_push_at").unwrap_or(0),
            },
            None => Self {
                installation_id,
                last_sync_at: 0,
                last_push_at: 0,
            },
        })
    }

    pub fn advance_sync(store: &dyn LocalStore, installation_id: Uuid, at: i64) -> Result<()> {
        store.execute(
            "INSERT INTO sync_state (installation_id, last_sync_at, last_push_at)
             VALUES (?1, ?2, 0)
             ON CONFLICT(installation_id) DO UPDATE SET
                last_sync_at = MAX(last_sync_at, excluded.last_sync_at)",
            &[
                SqlValue::Text(installation_id.to_string()),
                SqlValue::Integer(at),
            ],
        )?;
        Ok(())
    }

    pub fn advance_push(store: &dyn LocalStore, installation_id: Uuid, at: i64) -> Result<()> {
        store.execute(
            "INSERT INTO sync_state (installation_id, last_sync_at, last_push_at)
             VALUES (?1, 0, ?2)
             ON CONFLICT(installation_id) DO UPDATE SET
                last_push_at = MAX(last_push_at, excluded.last_push_at)",
            &[
                SqlValue::Text(installation_id.to_string()),
                SqlValue::Integer(at),
            ],
        )?;
        Ok(())
    }
}

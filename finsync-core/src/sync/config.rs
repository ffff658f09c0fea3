//! Sync configuration stored in the local database.

use crate::database::{row_i64, row_str, LocalStore, SqlValue};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_PULL_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_PULL_THROTTLE_SECS: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Sync configuration for this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub sync_enabled: bool,
    pub relay_url: Option<String>,
    pub pull_interval_secs: u64,
    pub pull_throttle_secs: u64,
    pub request_timeout_secs: u64,
    /// Set after install or pairing until the first pull brings in data.
    pub initial_sync_pending: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_enabled: false,
            relay_url: None,
            pull_interval_secs: DEFAULT_PULL_INTERVAL_SECS,
            pull_throttle_secs: DEFAULT_PULL_THROTTLE_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            initial_sync_pending: false,
        }
    }
}

impl SyncConfig {
    /// Load sync config from the database. Returns default if no row exists.
    pub fn load(store: &dyn LocalStore) -> Result<Self> {
        let row = store.query_one(
            "SELECT sync_enabled, relay_url, pull_interval_secs, pull_throttle_secs,
                    request_timeout_secs, initial_sync_pending
             FROM sync_settings WHERE id = 1",
            &[],
        )?;

        let Some(row) = row else {
            return Ok(Self::default());
        };

        let defaults = Self::default();
        let secs = |col: &str, fallback: u64| {
            row_i64(&row, col)
                .filter(|v| *v > 0)
                .map(|v| v as u64)
                .unwrap_or(fallback)
        };

        Ok(Self {
            sync_enabled: row_i64(&row, "sync_enabled").unwrap_or(0) != 0,
            relay_url: row_str(&row, "relay_url").map(str::to_string),
            pull_interval_secs: secs("pull_interval_secs", defaults.pull_interval_secs),
            pull_throttle_secs: secs("pull_throttle_secs", defaults.pull_throttle_secs),
            request_timeout_secs: secs("request_timeout_secs", defaults.request_timeout_secs),
            initial_sync_pending: row_i64(&row, "initial_sync_pending").unwrap_or(0) != 0,
        })
    }

    /// Save sync config to the database (upsert).
    pub fn save(&self, store: &dyn LocalStore) -> Result<()> {
        store.execute(
            "INSERT INTO sync_settings (id, sync_enabled, relay_url, pull_interval_secs,
                                        pull_throttle_secs, request_timeout_secs, initial_sync_pending)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                sync_enabled = excluded.sync_enabled,
                relay_url = excluded.relay_url,
                pull_interval_secs = excluded.pull_interval_secs,
                pull_throttle_secs = excluded.pull_throttle_secs,
                request_timeout_secs = excluded.request_timeout_secs,
                initial_sync_pending = excluded.initial_sync_pending",
            &[
                SqlValue::Integer(i64::from(self.sync_enabled)),
                self.relay_url
                    .clone()
                    .map(SqlValue::Text)
                    .unwrap_or(SqlValue::Null),
                SqlValue::Integer(self.pull_interval_secs as i64),
                SqlValue::Integer(self.pull_throttle_secs as i64),
                SqlValue::Integer(self.request_timeout_secs as i64),
                SqlValue::Integer(i64::from(self.initial_sync_pending)),
            ],
        )?;
        Ok(())
    }

    /// Persist only the initial-sync flag, leaving other settings untouched.
    pub fn set_initial_sync_pending(store: &dyn LocalStore, pending: bool) -> Result<()> {
        let mut config = Self::load(store)?;
        config.initial_sync_pending = pending;
        config.save(store)
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.pull_interval_secs)
    }

    pub fn pull_throttle(&self) -> Duration {
        Duration::from_secs(self.pull_throttle_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

//! Database schema and connection management.

use crate::sync::change_tracker::install_capture_triggers;
use crate::{DatabaseError, Result, SyncError};
use rusqlite::Connection;
use std::path::Path;

/// Current schema version, stored in `PRAGMA user_version`.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Fixed currency reference set: `(id, code, name, symbol, decimals)`.
pub(crate) const SEEDED_CURRENCIES: &[(i64, &str, &str, &str, i64)] = &[
    (1, "USD", "US Dollar", "$", 2),
    (2, "EUR", "Euro", "€", 2),
    (3, "GBP", "Pound Sterling", "£", 2),
    (4, "JPY", "Japanese Yen", "¥", 0),
    (5, "CHF", "Swiss Franc", "Fr", 2),
    (6, "CAD", "Canadian Dollar", "$", 2),
    (7, "AUD", "Australian Dollar", "$", 2),
    (8, "CNY", "Chinese Yuan", "¥", 2),
    (9, "SEK", "Swedish Krona", "kr", 2),
    (10, "NZD", "New Zealand Dollar", "$", 2),
    (11, "INR", "Indian Rupee", "₹", 2),
    (12, "BRL", "Brazilian Real", "R$", 2),
];

/// Main database connection and schema manager
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the specified path and bring its schema up to date
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(DatabaseError::Sqlite)?;

        // Enable foreign key constraints
        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(DatabaseError::Sqlite)?;

        let db = Self { conn };
        db.initialize_schema()?;
        Ok(db)
    }

    /// Create a new in-memory database for testing
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::Sqlite)?;

        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(DatabaseError::Sqlite)?;

        Ok(Self { conn })
    }

    /// Create every table, seed the currency reference set and install the
    /// capture triggers. Safe to run on an existing store.
    pub fn initialize_schema(&self) -> Result<()> {
        self.validate_schema_version()?;
        self.create_entity_tables()?;
        self.create_association_tables()?;
        self.create_sync_tables()?;
        self.create_indexes()?;
        self.seed_currencies()?;
        install_capture_triggers(self)?;
        self.conn
            .pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_entity_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS icons (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    glyph TEXT,
                    updated_at INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS tags (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    color TEXT,
                    icon_id TEXT,
                    updated_at INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS wallets (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    icon_id TEXT,
                    archived INTEGER NOT NULL DEFAULT 0,
                    updated_at INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS currencies (
                    id INTEGER PRIMARY KEY,
                    code TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    symbol TEXT,
                    decimals INTEGER NOT NULL DEFAULT 2,
                    updated_at INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS accounts (
                    id TEXT PRIMARY KEY,
                    wallet_id TEXT,
                    name TEXT NOT NULL,
                    currency_id INTEGER NOT NULL,
                    icon_id TEXT,
                    opening_balance INTEGER NOT NULL DEFAULT 0,
                    archived INTEGER NOT NULL DEFAULT 0,
                    updated_at INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS counterparties (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    icon_id TEXT,
                    updated_at INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS transactions (
                    id TEXT PRIMARY KEY,
                    account_id TEXT NOT NULL,
                    counterparty_id TEXT,
                    amount INTEGER NOT NULL,
                    currency_id INTEGER NOT NULL,
                    occurred_at INTEGER NOT NULL,
                    description TEXT,
                    updated_at INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS budgets (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    amount INTEGER NOT NULL,
                    currency_id INTEGER NOT NULL,
                    period TEXT NOT NULL,
                    starts_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL DEFAULT 0
                );",
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_association_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS account_tags (
                    account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                    tag_id TEXT NOT NULL,
                    PRIMARY KEY (account_id, tag_id)
                );

                CREATE TABLE IF NOT EXISTS counterparty_tags (
                    counterparty_id TEXT NOT NULL REFERENCES counterparties(id) ON DELETE CASCADE,
                    tag_id TEXT NOT NULL,
                    PRIMARY KEY (counterparty_id, tag_id)
                );

                CREATE TABLE IF NOT EXISTS counterparty_notes (
                    counterparty_id TEXT NOT NULL REFERENCES counterparties(id) ON DELETE CASCADE,
                    note TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (counterparty_id, created_at, note)
                );

                CREATE TABLE IF NOT EXISTS currency_tags (
                    currency_id INTEGER NOT NULL REFERENCES currencies(id) ON DELETE CASCADE,
                    tag_id TEXT NOT NULL,
                    PRIMARY KEY (currency_id, tag_id)
                );

                CREATE TABLE IF NOT EXISTS currency_rates (
                    currency_id INTEGER PRIMARY KEY REFERENCES currencies(id) ON DELETE CASCADE,
                    rate REAL NOT NULL,
                    base_code TEXT NOT NULL,
                    fetched_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS transaction_tags (
                    transaction_id TEXT NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
                    tag_id TEXT NOT NULL,
                    PRIMARY KEY (transaction_id, tag_id)
                );

                CREATE TABLE IF NOT EXISTS budget_tags (
                    budget_id TEXT NOT NULL REFERENCES budgets(id) ON DELETE CASCADE,
                    tag_id TEXT NOT NULL,
                    PRIMARY KEY (budget_id, tag_id)
                );",
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_sync_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS tombstones (
                    entity_kind TEXT NOT NULL,
                    entity_id TEXT NOT NULL,
                    deleted_at INTEGER NOT NULL,
                    PRIMARY KEY (entity_kind, entity_id)
                );

                CREATE TABLE IF NOT EXISTS sync_state (
                    installation_id TEXT PRIMARY KEY,
                    last_sync_at INTEGER NOT NULL DEFAULT 0,
                    last_push_at INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS sync_settings (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    sync_enabled INTEGER NOT NULL DEFAULT 0,
                    relay_url TEXT,
                    pull_interval_secs INTEGER NOT NULL,
                    pull_throttle_secs INTEGER NOT NULL,
                    request_timeout_secs INTEGER NOT NULL,
                    initial_sync_pending INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS installation (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    installation_id TEXT NOT NULL,
                    auth_token TEXT NOT NULL,
                    secret_key TEXT NOT NULL,
                    public_key TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS linked_installations (
                    installation_id TEXT PRIMARY KEY,
                    public_key TEXT,
                    linked_at INTEGER NOT NULL
                );",
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_indexes(&self) -> Result<()> {
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_icons_updated_at ON icons(updated_at)",
            "CREATE INDEX IF NOT EXISTS idx_tags_updated_at ON tags(updated_at)",
            "CREATE INDEX IF NOT EXISTS idx_wallets_updated_at ON wallets(updated_at)",
            "CREATE INDEX IF NOT EXISTS idx_currencies_updated_at ON currencies(updated_at)",
            "CREATE INDEX IF NOT EXISTS idx_accounts_updated_at ON accounts(updated_at)",
            "CREATE INDEX IF NOT EXISTS idx_counterparties_updated_at ON counterparties(updated_at)",
            "CREATE INDEX IF NOT EXISTS idx_transactions_updated_at ON transactions(updated_at)",
            "CREATE INDEX IF NOT EXISTS idx_transactions_account_id ON transactions(account_id)",
            "CREATE INDEX IF NOT EXISTS idx_budgets_updated_at ON budgets(updated_at)",
            "CREATE INDEX IF NOT EXISTS idx_tombstones_deleted_at ON tombstones(deleted_at)",
        ];
        for sql in &indexes {
            self.conn.execute(sql, []).map_err(DatabaseError::Sqlite)?;
        }
        Ok(())
    }

    /// Seeded rows carry `updated_at = 0` so they never appear in a push
    /// until a device edits them. Runs before the insert triggers exist on
    /// a fresh store; on an existing store the rows are already present.
    fn seed_currencies(&self) -> Result<()> {
        for (id, code, name, symbol, decimals) in SEEDED_CURRENCIES {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO currencies (id, code, name, symbol, decimals, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                    rusqlite::params![id, code, name, symbol, decimals],
                )
                .map_err(DatabaseError::Sqlite)?;
        }
        Ok(())
    }

    /// Reject stores written by a newer schema.
    pub fn validate_schema_version(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(DatabaseError::Sqlite)?;

        if version > CURRENT_SCHEMA_VERSION {
            return Err(SyncError::from(DatabaseError::SchemaMismatch {
                expected: CURRENT_SCHEMA_VERSION,
                found: version,
            }));
        }
        Ok(())
    }

    /// Get a reference to the underlying connection
    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(db: &Database, kind: &str) -> Vec<String> {
        db.conn
            .prepare("SELECT name FROM sqlite_master WHERE type = ?1")
            .unwrap()
            .query_map([kind], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_in_memory_database() {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();

        let table_names = names(&db, "table");
        for table in [
            "icons",
            "tags",
            "wallets",
            "currencies",
            "accounts",
            "counterparties",
            "transactions",
            "budgets",
            "account_tags",
            "counterparty_tags",
            "counterparty_notes",
            "currency_tags",
            "currency_rates",
            "transaction_tags",
            "budget_tags",
            "tombstones",
            "sync_state",
            "sync_settings",
            "installation",
            "linked_installations",
        ] {
            assert!(table_names.contains(&table.to_string()), "missing {}", table);
        }

        let index_names = names(&db, "index");
        assert!(index_names.contains(&"idx_transactions_updated_at".to_string()));
        assert!(index_names.contains(&"idx_tombstones_deleted_at".to_string()));

        let trigger_names = names(&db, "trigger");
        assert!(trigger_names.contains(&"capture_accounts_insert".to_string()));
        assert!(trigger_names.contains(&"capture_accounts_update".to_string()));
        assert!(trigger_names.contains(&"capture_accounts_delete".to_string()));
        assert!(trigger_names.contains(&"capture_account_tags_insert".to_string()));
    }

    #[test]
    fn currencies_are_seeded_without_timestamps() {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();

        let (count, max_updated): (i64, i64) = db
            .conn
            .query_row(
                "SELECT COUNT(*), MAX(updated_at) FROM currencies",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, SEEDED_CURRENCIES.len() as i64);
        assert_eq!(max_updated, 0);
    }

    #[test]
    fn initialize_schema_is_idempotent() {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        db.initialize_schema().unwrap();

        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM currencies", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, SEEDED_CURRENCIES.len() as i64);
    }

    #[test]
    fn reopening_file_restores_missing_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");

        {
            let db = Database::open(&path).unwrap();
            db.conn
                .execute_batch("DROP TRIGGER capture_transactions_update;")
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert!(names(&db, "trigger").contains(&"capture_transactions_update".to_string()));
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let db = Database::in_memory().unwrap();
        db.conn
            .pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION + 1)
            .unwrap();

        match db.initialize_schema() {
            Err(SyncError::Database(DatabaseError::SchemaMismatch { expected, found })) => {
                assert_eq!(expected, CURRENT_SCHEMA_VERSION);
                assert_eq!(found, CURRENT_SCHEMA_VERSION + 1);
            }
            other => panic!("expected schema mismatch, got {:?}", other),
        }
    }
}

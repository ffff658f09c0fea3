//! SQLite storage backend for the relay.
//!
//! The relay only ever sees ciphertext, wrapped keys and installation ids.

pub mod models;

use crate::error::RelayError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use models::{PackageEnvelope, StoredInit, StoredPackage};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Thread-safe relay storage.
#[derive(Clone)]
pub struct RelayStorage {
    conn: Arc<Mutex<Connection>>,
}

impl RelayStorage {
    pub fn open(path: &Path) -> Result<Self, anyhow::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    pub fn in_memory() -> Result<Self, anyhow::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&self) -> Result<(), anyhow::Error> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS installations (
                installation_id TEXT PRIMARY KEY,
                token_hash TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS packages (
                package_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                iv TEXT NOT NULL,
                ciphertext TEXT NOT NULL,
                wrapped_key TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (package_id, recipient_id)
            );

            CREATE TABLE IF NOT EXISTS init_packages (
                id TEXT PRIMARY KEY,
                target_uuid TEXT NOT NULL,
                sender_uuid TEXT NOT NULL,
                encrypted_payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS relay_clock (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_packages_recipient
                ON packages(recipient_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_init_target
                ON init_packages(target_uuid, created_at);",
        )?;
        Ok(())
    }

    pub fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RelayError> {
        self.conn
            .lock()
            .map_err(|e| RelayError::Internal(format!("Lock error: {}", e)))
    }

    /// Create an installation and return it with a fresh bearer token.
    ///
    /// Only the token hash is stored. An id that is already registered is
    /// refused.
    pub fn register_installation(
        &self,
        requested: Option<Uuid>,
        now: i64,
    ) -> Result<(Uuid, String), RelayError> {
        let installation_id = requested.unwrap_or_else(Uuid::new_v4);
        let mut raw = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let token = URL_SAFE_NO_PAD.encode(raw);

        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO installations (installation_id, token_hash, created_at)
             VALUES (?1, ?2, ?3)",
            params![installation_id.to_string(), hash_token(&token), now],
        )?;
        if inserted == 0 {
            return Err(RelayError::Conflict(
                "Installation already registered".to_string(),
            ));
        }
        Ok((installation_id, token))
    }

    /// Resolve a bearer token to its installation.
    pub fn authenticate(&self, token: &str) -> Result<Option<Uuid>, RelayError> {
        let conn = self.conn()?;
        let id: Option<String> = conn
            .query_row(
                "SELECT installation_id FROM installations WHERE token_hash = ?1",
                [hash_token(token)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.and_then(|s| Uuid::parse_str(&s).ok()))
    }

    /// Store one copy of `envelope` per recipient. Returns the package id and
    /// the relay timestamp, which is strictly increasing across pushes.
    pub fn insert_package(
        &self,
        envelope: &PackageEnvelope,
        now: i64,
    ) -> Result<(String, i64), RelayError> {
        let package_id = Uuid::new_v4().to_string();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let created_at = next_timestamp(&tx, now)?;
        for (recipient, wrapped_key) in &envelope.recipient_keys {
            tx.execute(
                "INSERT INTO packages (package_id, recipient_id, sender_id, iv, ciphertext,
                                       wrapped_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    package_id,
                    recipient.to_string(),
                    envelope.sender_id.to_string(),
                    envelope.iv,
                    envelope.ciphertext,
                    wrapped_key,
                    created_at,
                ],
            )?;
        }
        tx.commit()?;
        Ok((package_id, created_at))
    }

    /// Packages addressed to `recipient` newer than `since`, oldest first.
    pub fn packages_for(
        &self,
        recipient: Uuid,
        since: i64,
    ) -> Result<Vec<StoredPackage>, RelayError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT package_id, recipient_id, sender_id, iv, ciphertext, wrapped_key, created_at
             FROM packages
             WHERE recipient_id = ?1 AND created_at > ?2
             ORDER BY created_at, package_id",
        )?;
        let rows = stmt.query_map(params![recipient.to_string(), since], |row| {
            Ok(StoredPackage {
                package_id: row.get(0)?,
                recipient_id: parse_uuid(row, 1)?,
                sender_id: parse_uuid(row, 2)?,
                iv: row.get(3)?,
                ciphertext: row.get(4)?,
                wrapped_key: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete `recipient`'s copies of the given packages.
    pub fn ack_packages(&self, recipient: Uuid, package_ids: &[String]) -> Result<usize, RelayError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for id in package_ids {
            deleted += tx.execute(
                "DELETE FROM packages WHERE package_id = ?1 AND recipient_id = ?2",
                params![id, recipient.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    pub fn pending_init_count(&self, target: Uuid) -> Result<usize, RelayError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM init_packages WHERE target_uuid = ?1",
            [target.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn insert_init(
        &self,
        target: Uuid,
        sender: Uuid,
        encrypted_payload: &str,
        now: i64,
    ) -> Result<String, RelayError> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO init_packages (id, target_uuid, sender_uuid, encrypted_payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, target.to_string(), sender.to_string(), encrypted_payload, now],
        )?;
        Ok(id)
    }

    pub fn inits_for(&self, target: Uuid) -> Result<Vec<StoredInit>, RelayError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, target_uuid, sender_uuid, encrypted_payload, created_at
             FROM init_packages
             WHERE target_uuid = ?1
             ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([target.to_string()], |row| {
            Ok(StoredInit {
                id: row.get(0)?,
                target_uuid: parse_uuid(row, 1)?,
                sender_uuid: parse_uuid(row, 2)?,
                encrypted_payload: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete init packages addressed to `target`; others' ids are ignored.
    pub fn delete_inits(&self, target: Uuid, ids: &[String]) -> Result<usize, RelayError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for id in ids {
            deleted += tx.execute(
                "DELETE FROM init_packages WHERE id = ?1 AND target_uuid = ?2",
                params![id, target.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Drop packages created before `package_cutoff` and inits created
    /// before `init_cutoff`.
    pub fn prune(&self, package_cutoff: i64, init_cutoff: i64) -> Result<(usize, usize), RelayError> {
        let conn = self.conn()?;
        let packages = conn.execute("DELETE FROM packages WHERE created_at < ?1", [package_cutoff])?;
        let inits = conn.execute(
            "DELETE FROM init_packages WHERE created_at < ?1",
            [init_cutoff],
        )?;
        Ok((packages, inits))
    }
}

fn hash_token(token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()))
}

fn next_timestamp(conn: &Connection, now: i64) -> Result<i64, RelayError> {
    let last: Option<i64> = conn
        .query_row("SELECT last_ms FROM relay_clock WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    let next = last.map_or(now, |last| now.max(last + 1));
    conn.execute(
        "INSERT INTO relay_clock (id, last_ms) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET last_ms = excluded.last_ms",
        [next],
    )?;
    Ok(next)
}

fn parse_uuid(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

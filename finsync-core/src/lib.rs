//! Finsync Core Library
//!
//! This library provides the encrypted multi-device sync engine for the
//! finance tracker: the local store and its change-capture triggers, the
//! package builder and merge engine, the pairing protocol and the sync
//! orchestrator.

pub mod crypto;
pub mod database;
pub mod sync;

pub use crypto::{CryptoError, KeyPair};
pub use database::{Database, LocalStore, Row};
#[cfg(feature = "sync")]
pub use sync::RelayClient;
pub use sync::{
    EventBus, ImportResult, Installation, LinkedInstallation, Relay, SyncConfig, SyncEngine,
    SyncEvent, SyncOrchestrator, SyncState,
};

use thiserror::Error;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised by the local store layer
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Schema version mismatch: expected at most {expected}, found {found}")]
    SchemaMismatch { expected: i32, found: i32 },

    #[error("{0}")]
    Other(String),
}

/// A relay call that failed at the transport level.
///
/// Rendered as `Sync <operation> failed: <status> <reason>`. The status is
/// absent when the request never produced a response (network error or
/// timeout).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Sync {operation} failed: {}", display_status(.status, .reason))]
pub struct RelayFailure {
    pub operation: &'static str,
    pub status: Option<u16>,
    pub reason: String,
}

fn display_status(status: &Option<u16>, reason: &str) -> String {
    match status {
        Some(code) => format!("{} {}", code, reason),
        None => reason.to_string(),
    }
}

impl RelayFailure {
    pub fn new(operation: &'static str, status: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            operation,
            status,
            reason: reason.into(),
        }
    }

    pub fn timed_out(operation: &'static str) -> Self {
        Self::new(operation, None, "timed out")
    }
}

/// General error type for sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Relay(#[from] RelayFailure),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sync orchestrator stopped")]
    Stopped,
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Database(DatabaseError::Sqlite(e))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Database(DatabaseError::Serialization(e.to_string()))
    }
}

impl SyncError {
    /// Transport failures are retried on the next scheduled cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Relay(_))
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

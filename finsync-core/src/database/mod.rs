//! Local store for the finance tracker.
//!
//! This module handles schema management for the finance tables and the
//! sync bookkeeping tables, and exposes the store to the sync layer through
//! the [`LocalStore`] primitives.

pub mod schema;
pub mod store;

pub use schema::{Database, CURRENT_SCHEMA_VERSION};
pub use store::{json_to_sql, row_i64, row_str, LocalStore, Row, SqlValue};

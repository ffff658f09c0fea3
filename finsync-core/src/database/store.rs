//! Statement-level access to the local store.
//!
//! The sync layer never touches a `rusqlite::Connection` directly; it goes
//! through three primitives (execute, query one, query many) so that the
//! store can be wrapped or substituted.

use crate::crypto::encode_b64url;
use crate::database::Database;
use crate::{DatabaseError, Result};
use rusqlite::params_from_iter;
use rusqlite::types::ValueRef;
use serde_json::Value;

/// Bound statement parameter.
pub type SqlValue = rusqlite::types::Value;

/// One result row keyed by column name.
pub type Row = serde_json::Map<String, Value>;

pub trait LocalStore {
    /// Run a single statement, returning the number of affected rows.
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    /// Run a query and return its first row, if any.
    fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>>;

    /// Run a query and return every row.
    fn query_many(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Run several parameterless statements (DDL, savepoints).
    fn execute_batch(&self, sql: &str) -> Result<()>;
}

impl LocalStore for Database {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let changed = self
            .conn()
            .execute(sql, params_from_iter(params.iter()))
            .map_err(DatabaseError::Sqlite)?;
        Ok(changed)
    }

    fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        Ok(self.query_many(sql, params)?.into_iter().next())
    }

    fn query_many(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let mut stmt = self.conn().prepare(sql).map_err(DatabaseError::Sqlite)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                let mut out = Row::new();
                for (idx, name) in names.iter().enumerate() {
                    out.insert(name.clone(), value_to_json(row.get_ref(idx)?));
                }
                Ok(out)
            })
            .map_err(DatabaseError::Sqlite)?;

        let rows = rows
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(DatabaseError::Sqlite)?;
        Ok(rows)
    }

    fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn()
            .execute_batch(sql)
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(encode_b64url(b)),
    }
}

/// Convert a decoded JSON value into a bindable parameter.
pub fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

pub fn row_i64(row: &Row, column: &str) -> Option<i64> {
    row.get(column).and_then(Value::as_i64)
}

pub fn row_str<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
    row.get(column).and_then(Value::as_str)
}

//! SQLite executor: bound statements, typed row decoding and atomic blocks.
//!
//! # Responsibility
//! - Open and configure SQLite connections (see `open`).
//! - Run built queries with named parameters and decode rows into records.
//! - Run a block of operations atomically.
//!
//! # Invariants
//! - Every parameter a statement references must be supplied; supplied
//!   parameters the statement does not reference are never bound.
//! - Undecodable persisted data is an error, never a silently coerced value.
//! - `run_atomic` commits only when its body returns `Ok`.
//! - At most one caller holds the transaction gate; everyone sharing the
//!   connection waits on it before touching data outside their own
//!   transaction.

pub mod crypto;
mod open;

use chrono::{TimeZone, Utc};
use futures::lock::{Mutex, MutexGuard};
use log::warn;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, Statement, Transaction, TransactionBehavior};
use std::cell::Cell;
use std::future::Future;
use thiserror::Error;

use crate::codec::{deescape_from_json, escape_for_json, format_timestamp, parse_timestamp};
use crate::schema::FieldType;
use crate::sql::{BuiltQuery, Params};
use crate::value::{Record, Value};

pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("expected {expected} row(s), got {actual}")]
    RowCount { expected: &'static str, actual: usize },
    #[error("statement parameter `{0}` was not supplied")]
    MissingParameter(String),
    #[error("cannot decode column `{column}`: {message}")]
    Decode { column: String, message: String },
}

/// One SQLite connection plus a count of executed statements.
pub struct Database {
    conn: Connection,
    statements: Cell<u64>,
    gate: Mutex<()>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("statements", &self.statements.get())
            .finish_non_exhaustive()
    }
}

impl Database {
    pub(crate) fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            statements: Cell::new(0),
            gate: Mutex::new(()),
        }
    }

    /// Waits until no other caller holds an open transaction on this
    /// connection, then holds the gate until the guard drops.
    pub async fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Number of statements run through the executor methods so far.
    pub fn statements_executed(&self) -> u64 {
        self.statements.get()
    }

    /// Runs raw SQL (DDL, fixtures) outside the executor bookkeeping.
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Returns every row.
    pub fn any(&self, query: &BuiltQuery, params: &Params) -> DbResult<Vec<Record>> {
        let mut stmt = self.conn.prepare_cached(&query.sql)?;
        bind_params(&mut stmt, query, params)?;
        self.statements.set(self.statements.get() + 1);

        let names: Vec<(String, FieldType)> = stmt
            .column_names()
            .into_iter()
            .map(|name| {
                let kind = query.column_type(name).unwrap_or_default();
                (name.to_string(), kind)
            })
            .collect();

        let mut rows = stmt.raw_query();
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Record::new();
            for (index, (name, kind)) in names.iter().enumerate() {
                let value = decode_value(name, *kind, row.get_ref(index)?)?;
                record.insert(name.clone(), value);
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Returns exactly one row.
    pub fn one(&self, query: &BuiltQuery, params: &Params) -> DbResult<Record> {
        let mut rows = self.any(query, params)?;
        if rows.len() != 1 {
            return Err(DbError::RowCount {
                expected: "exactly 1",
                actual: rows.len(),
            });
        }
        Ok(rows.remove(0))
    }

    /// Returns zero or one row.
    pub fn one_or_none(&self, query: &BuiltQuery, params: &Params) -> DbResult<Option<Record>> {
        let mut rows = self.any(query, params)?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            actual => Err(DbError::RowCount {
                expected: "at most 1",
                actual,
            }),
        }
    }

    /// Executes a statement and discards its rows; returns the changed row count.
    pub fn none(&self, query: &BuiltQuery, params: &Params) -> DbResult<usize> {
        let mut stmt = self.conn.prepare_cached(&query.sql)?;
        bind_params(&mut stmt, query, params)?;
        self.statements.set(self.statements.get() + 1);
        Ok(stmt.raw_execute()?)
    }

    /// Runs `body` inside one IMMEDIATE transaction.
    ///
    /// Commits when `body` resolves to `Ok`; rolls back and propagates the
    /// error otherwise. Nested calls fail because SQLite does not nest
    /// transactions. Callers sharing the connection hold `exclusive` across
    /// this call so no other reader observes uncommitted rows.
    pub async fn run_atomic<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(DbError::from)?;
        match body().await {
            Ok(value) => {
                tx.commit().map_err(DbError::from)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(
                        "event=db_rollback module=db status=error error_code=rollback_failed error={}",
                        rollback_err
                    );
                }
                Err(err)
            }
        }
    }
}

fn bind_params(stmt: &mut Statement<'_>, query: &BuiltQuery, params: &Params) -> DbResult<()> {
    for index in 1..=stmt.parameter_count() {
        let Some(placeholder) = stmt.parameter_name(index) else {
            return Err(DbError::MissingParameter(format!("?{index}")));
        };
        let name = placeholder.trim_start_matches([':', '@', '$']).to_string();
        let value = query
            .bound
            .get(&name)
            .or_else(|| params.get(&name))
            .ok_or_else(|| DbError::MissingParameter(name.clone()))?;
        let as_json = query.json_params.contains(&name);
        stmt.raw_bind_parameter(index, encode_value(value, as_json))?;
    }
    Ok(())
}

/// Converts a value to its SQLite storage form.
///
/// Composite values, and every value bound to a JSON column (null included,
/// as the text `null`), are stored as escaped JSON text.
pub(crate) fn encode_value(value: &Value, as_json: bool) -> SqlValue {
    if as_json {
        return SqlValue::Text(escape_for_json(value).to_string());
    }
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Int(number) => SqlValue::Integer(*number),
        Value::Float(number) => SqlValue::Real(*number),
        Value::Text(text) => SqlValue::Text(text.clone()),
        Value::Date(when) => SqlValue::Text(format_timestamp(when)),
        Value::Binary(bytes) => SqlValue::Blob(bytes.clone()),
        Value::Set(_) | Value::Map(_) | Value::Sequence(_) | Value::Mapping(_) => {
            SqlValue::Text(escape_for_json(value).to_string())
        }
    }
}

fn decode_value(column: &str, kind: FieldType, raw: ValueRef<'_>) -> DbResult<Value> {
    let mismatch = |message: String| DbError::Decode {
        column: column.to_string(),
        message,
    };
    let text = |bytes: &[u8]| {
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|err| mismatch(format!("invalid utf-8: {err}")))
    };

    Ok(match (kind, raw) {
        (_, ValueRef::Null) => Value::Null,
        (FieldType::Text, ValueRef::Text(bytes)) => Value::Text(text(bytes)?),
        (FieldType::Integer, ValueRef::Integer(number)) => Value::Int(number),
        (FieldType::Real, ValueRef::Real(number)) => Value::Float(number),
        (FieldType::Real, ValueRef::Integer(number)) => Value::Float(number as f64),
        (FieldType::Boolean, ValueRef::Integer(0)) => Value::Bool(false),
        (FieldType::Boolean, ValueRef::Integer(1)) => Value::Bool(true),
        (FieldType::DateTime, ValueRef::Text(bytes)) => {
            let raw = text(bytes)?;
            let parsed = parse_timestamp(&raw)
                .ok_or_else(|| mismatch(format!("invalid timestamp `{raw}`")))?;
            Value::Date(parsed)
        }
        (FieldType::DateTime, ValueRef::Integer(millis)) => {
            let parsed = Utc
                .timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| mismatch(format!("timestamp out of range: {millis}")))?;
            Value::Date(parsed)
        }
        (FieldType::Binary, ValueRef::Blob(bytes)) => Value::Binary(bytes.to_vec()),
        (FieldType::Json, ValueRef::Text(bytes)) => {
            let parsed = serde_json::from_str(&text(bytes)?)
                .map_err(|err| mismatch(format!("invalid json: {err}")))?;
            deescape_from_json(parsed)
        }
        (FieldType::Any, ValueRef::Integer(number)) => Value::Int(number),
        (FieldType::Any, ValueRef::Real(number)) => Value::Float(number),
        (FieldType::Any, ValueRef::Text(bytes)) => Value::Text(text(bytes)?),
        (FieldType::Any, ValueRef::Blob(bytes)) => Value::Binary(bytes.to_vec()),
        (kind, other) => {
            return Err(mismatch(format!(
                "expected {kind:?}, found sqlite {:?}",
                other.data_type()
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::{decode_value, encode_value, open_db_in_memory, DbError};
    use crate::schema::FieldType;
    use crate::value::Value;
    use chrono::{TimeZone, Utc};
    use futures::executor::block_on;
    use rusqlite::types::{Value as SqlValue, ValueRef};

    #[test]
    fn transaction_gate_has_one_holder_at_a_time() {
        let db = open_db_in_memory().unwrap();
        let guard = block_on(db.exclusive());
        assert!(db.gate.try_lock().is_none());
        drop(guard);
        assert!(db.gate.try_lock().is_some());
    }

    #[test]
    fn encode_stores_composites_and_json_columns_as_text() {
        let list = Value::Sequence(vec![Value::from("a")]);
        assert_eq!(encode_value(&list, false), SqlValue::Text("[\"a\"]".to_string()));
        assert_eq!(encode_value(&Value::from("x"), true), SqlValue::Text("\"x\"".to_string()));
        assert_eq!(encode_value(&Value::Null, true), SqlValue::Text("null".to_string()));
        assert_eq!(encode_value(&Value::Null, false), SqlValue::Null);
        assert_eq!(encode_value(&Value::Bool(true), false), SqlValue::Integer(1));
    }

    #[test]
    fn decode_reads_timestamps_from_text_and_epoch_millis() {
        let when = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let from_text =
            decode_value("when", FieldType::DateTime, ValueRef::Text(b"2024-01-02T03:04:05Z"))
                .unwrap();
        assert_eq!(from_text, Value::Date(when));
        let from_millis = decode_value(
            "when",
            FieldType::DateTime,
            ValueRef::Integer(when.timestamp_millis()),
        )
        .unwrap();
        assert_eq!(from_millis, Value::Date(when));
    }

    #[test]
    fn decode_rejects_mismatched_storage() {
        let err = decode_value("amount", FieldType::Integer, ValueRef::Text(b"one")).unwrap_err();
        assert!(matches!(err, DbError::Decode { column, .. } if column == "amount"));
        assert!(decode_value("flag", FieldType::Boolean, ValueRef::Integer(2)).is_err());
        assert!(decode_value("meta", FieldType::Json, ValueRef::Text(b"{oops")).is_err());
    }

    #[test]
    fn decode_json_restores_escaped_values() {
        let raw = br#"{"__typename":"EscapedSet","values":["a","b"]}"#;
        let decoded = decode_value("tags", FieldType::Json, ValueRef::Text(raw)).unwrap();
        assert_eq!(decoded, Value::set(vec![Value::from("a"), Value::from("b")]));
    }
}

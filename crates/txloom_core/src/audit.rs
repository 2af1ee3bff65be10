//! Transaction log (audit trail) tables: layout, writes and reads.
//!
//! # Responsibility
//! - Describe the header/detail table pair through ordinary `TableDef`s.
//! - Append one header per transaction and one detail row per mutation.
//! - Read transactions, their changes, and per-record history back.
//!
//! # Invariants
//! - Detail rows are read back in insertion (rowid) order, which is call
//!   order within a transaction.
//! - Payloads are stored as escaped JSON and de-escaped on read.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{Database, DbError};
use crate::error::DataResult;
use crate::model::change::ChangeKind;
use crate::schema::{FieldDef, SchemaError, TableDef};
use crate::sql::{build_insert, build_select, parametrize, Expr, Params, SelectShape};
use crate::value::{Record, RecordId, Value};

/// Log id handed to transaction bodies when audit logging is disabled.
pub const NO_TRANSACTION_LOG_ID: &str = "NOTRANSACTIONS";

const HEADER_FIELDS: [&str; 3] = ["_id", "operation", "when"];
const DETAIL_FIELDS: [&str; 6] = [
    "_id",
    "txLogId",
    "recordType",
    "recordId",
    "changeType",
    "dataChange",
];

/// Header and detail table declarations of the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditTables {
    pub header: TableDef,
    pub detail: TableDef,
}

impl AuditTables {
    pub fn new(header: TableDef, detail: TableDef) -> Self {
        Self { header, detail }
    }

    /// The conventional `tx_log` / `tx_details` layout.
    pub fn default_layout() -> Self {
        Self {
            header: default_header(),
            detail: default_detail(),
        }
    }

    /// Checks both tables declare every logical field the trail writes.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for (table, required) in [
            (&self.header, &HEADER_FIELDS[..]),
            (&self.detail, &DETAIL_FIELDS[..]),
        ] {
            table.validate()?;
            if let Some(missing) = required.iter().find(|field| !table.has_field(field)) {
                return Err(SchemaError::MissingAuditField {
                    table: table.name().to_string(),
                    field: (*missing).to_string(),
                });
            }
        }
        Ok(())
    }
}

pub(crate) fn default_header() -> TableDef {
    TableDef::new("tx_log", "tx_log")
        .field(FieldDef::text("_id", "tx_log_id"))
        .field(FieldDef::json("operation", "tx_log_operation"))
        .field(FieldDef::datetime("when", "tx_log_when"))
}

pub(crate) fn default_detail() -> TableDef {
    TableDef::new("tx_details", "tx_details")
        .field(FieldDef::text("_id", "tx_details_id"))
        .field(FieldDef::text("txLogId", "tx_details_tx_log_id"))
        .field(FieldDef::text("recordType", "tx_record_type"))
        .field(FieldDef::text("recordId", "tx_record_id"))
        .field(FieldDef::text("changeType", "tx_change_type"))
        .field(FieldDef::json("dataChange", "tx_data_change"))
}

/// One detail row about to be appended.
pub(crate) struct ChangeRow<'a> {
    pub tx_log_id: &'a str,
    pub record_type: &'a str,
    pub record_id: &'a str,
    pub kind: ChangeKind,
    pub payload: Value,
}

fn insert_row(db: &Database, table: &TableDef, record: Record) -> DataResult<()> {
    let query = build_insert(table, &parametrize(&record), false)?;
    db.none(&query, &Params::from(record))?;
    Ok(())
}

pub(crate) fn insert_header(
    db: &Database,
    tables: &AuditTables,
    log_id: &str,
    operation: Value,
    when: DateTime<Utc>,
) -> DataResult<()> {
    let record = Record::new()
        .with("_id", log_id)
        .with("operation", operation)
        .with("when", when);
    insert_row(db, &tables.header, record)
}

pub(crate) fn insert_change(
    db: &Database,
    tables: &AuditTables,
    detail_id: &str,
    row: ChangeRow<'_>,
) -> DataResult<()> {
    let record = Record::new()
        .with("_id", detail_id)
        .with("txLogId", row.tx_log_id)
        .with("recordType", row.record_type)
        .with("recordId", row.record_id)
        .with("changeType", row.kind.as_str())
        .with("dataChange", row.payload);
    insert_row(db, &tables.detail, record)
}

/// One transaction header as read back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxLogEntry {
    pub id: RecordId,
    pub operation: Value,
    pub when: Option<DateTime<Utc>>,
}

/// One change-detail row as read back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    pub id: RecordId,
    pub tx_log_id: RecordId,
    pub record_type: String,
    pub record_id: RecordId,
    pub change_type: ChangeKind,
    pub data_change: Value,
}

/// Read access to the audit trail.
pub struct AuditLog<'db> {
    db: &'db Database,
    tables: AuditTables,
}

impl<'db> AuditLog<'db> {
    pub fn new(db: &'db Database, tables: AuditTables) -> Self {
        Self { db, tables }
    }

    /// Most recent transactions first.
    pub fn transactions(&self, limit: u32) -> DataResult<Vec<TxLogEntry>> {
        let shape = SelectShape::new().order_by_raw("rowid", true).limit(limit);
        let query = build_select(&self.tables.header, &shape)?;
        self.db
            .any(&query, &Params::new())?
            .into_iter()
            .map(|row| -> DataResult<TxLogEntry> {
                Ok(TxLogEntry {
                    id: text_field(&row, "_id")?,
                    when: row.get("when").and_then(Value::as_date),
                    operation: row.get("operation").cloned().unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Changes of one transaction, in call order.
    pub fn changes(&self, tx_log_id: &str) -> DataResult<Vec<ChangeEntry>> {
        self.select_changes(Expr::field("txLogId").equals(Expr::value(tx_log_id)))
    }

    /// Every change recorded against one record, oldest first.
    pub fn history(&self, record_type: &str, record_id: &str) -> DataResult<Vec<ChangeEntry>> {
        self.select_changes(Expr::and(vec![
            Expr::field("recordType").equals(Expr::value(record_type)),
            Expr::field("recordId").equals(Expr::value(record_id)),
        ]))
    }

    fn select_changes(&self, filter: Expr) -> DataResult<Vec<ChangeEntry>> {
        let shape = SelectShape::new().filter(filter).order_by_raw("rowid", false);
        let query = build_select(&self.tables.detail, &shape)?;
        self.db
            .any(&query, &Params::new())?
            .into_iter()
            .map(|row| change_entry(&row))
            .collect()
    }
}

fn change_entry(row: &Record) -> DataResult<ChangeEntry> {
    let raw_kind = text_field(row, "changeType")?;
    let change_type = raw_kind.parse::<ChangeKind>().map_err(|message| DbError::Decode {
        column: "changeType".to_string(),
        message,
    })?;
    Ok(ChangeEntry {
        id: text_field(row, "_id")?,
        tx_log_id: text_field(row, "txLogId")?,
        record_type: text_field(row, "recordType")?,
        record_id: text_field(row, "recordId")?,
        change_type,
        data_change: row.get("dataChange").cloned().unwrap_or_default(),
    })
}

fn text_field(row: &Record, field: &str) -> DataResult<String> {
    row.get(field).and_then(Value::to_id).ok_or_else(|| {
        DbError::Decode {
            column: field.to_string(),
            message: "expected a non-null text value".to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::AuditTables;
    use crate::schema::{FieldDef, SchemaError, TableDef};

    #[test]
    fn default_layout_is_valid() {
        AuditTables::default_layout().validate().unwrap();
    }

    #[test]
    fn validate_reports_missing_logical_fields() {
        let header = TableDef::new("log", "log")
            .field(FieldDef::text("_id", "log_id"))
            .field(FieldDef::json("operation", "log_op"));
        let tables = AuditTables::new(header, AuditTables::default_layout().detail);
        let err = tables.validate().unwrap_err();
        assert!(matches!(
            err,
            SchemaError::MissingAuditField { table, field } if table == "log" && field == "when"
        ));
    }
}

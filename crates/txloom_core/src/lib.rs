//! Typed, audited data access over SQLite.
//!
//! Entity tables are declared once (`schema`); reads are batched and cached
//! per session (`api::DataApi`); writes run inside audited transactions
//! (`api::TxApi`) that log one change-detail row per mutation.

pub mod api;
pub mod audit;
pub mod codec;
pub mod db;
pub mod error;
pub mod loader;
pub mod logging;
pub mod model;
pub mod schema;
pub mod sql;
pub mod value;

pub use api::{DataApi, DataApiConfig, IdStrategy, TxApi};
pub use audit::{AuditLog, AuditTables, ChangeEntry, TxLogEntry, NO_TRANSACTION_LOG_ID};
pub use db::{open_db, open_db_in_memory, Database, DbError, DbResult};
pub use error::{DataError, DataResult};
pub use logging::{default_log_level, init_logging, init_stderr_logging, logging_status};
pub use model::change::{ChangeKind, LinkChange};
pub use model::status::RecordStatus;
pub use schema::link::{LinkConfigError, LinkTableDef};
pub use schema::manifest::SchemaManifest;
pub use schema::{ComputedField, FieldDef, FieldType, Schema, SchemaError, TableDef};
pub use sql::{Expr, Params, SelectShape};
pub use value::{Record, RecordId, Value};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

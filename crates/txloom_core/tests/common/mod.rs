#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::rc::Rc;
use txloom_core::{
    open_db_in_memory, AuditTables, ComputedField, DataApi, DataApiConfig, Database, FieldDef,
    FieldType, LinkTableDef, Schema, TableDef,
};

pub const TEST_KEY: &str = "test-key";

pub const DDL: &str = "
CREATE TABLE tst (
    tst_id TEXT PRIMARY KEY,
    tst_name BLOB,
    tst_amount INTEGER,
    tst_when TEXT,
    tst_status TEXT NOT NULL,
    tst_blob BLOB,
    tst_tags TEXT
);
CREATE TABLE tst_doc (
    tst_doc_id TEXT PRIMARY KEY,
    tst_doc_title TEXT,
    tst_doc_status TEXT NOT NULL
);
CREATE TABLE plain (
    plain_id TEXT PRIMARY KEY,
    plain_label TEXT NOT NULL
);
CREATE TABLE tst_log (
    tst_log_id TEXT NOT NULL REFERENCES tst(tst_id),
    tst_doc_id TEXT NOT NULL REFERENCES tst_doc(tst_doc_id),
    PRIMARY KEY (tst_log_id, tst_doc_id)
);
CREATE TABLE tx_log (
    tx_log_id TEXT PRIMARY KEY,
    tx_log_operation TEXT NOT NULL,
    tx_log_when TEXT NOT NULL
);
CREATE TABLE tx_details (
    tx_details_id TEXT PRIMARY KEY,
    tx_details_tx_log_id TEXT NOT NULL REFERENCES tx_log(tx_log_id),
    tx_record_type TEXT NOT NULL,
    tx_record_id TEXT NOT NULL,
    tx_change_type TEXT NOT NULL,
    tx_data_change TEXT
);
";

const DOCS_IDS_SQL: &str = "SELECT json_group_array(l.tst_doc_id) FROM tst_log l \
     JOIN tst_doc d ON d.tst_doc_id = l.tst_doc_id \
     WHERE l.tst_log_id = tst.tst_id AND d.tst_doc_status <> 'DELETED'";

pub fn tst_table() -> TableDef {
    TableDef::new("tst", "tst")
        .field(FieldDef::text("_id", "tst_id"))
        .field(FieldDef::text("name", "tst_name").encrypted())
        .field(FieldDef::integer("amount", "tst_amount"))
        .field(FieldDef::datetime("when", "tst_when"))
        .field(FieldDef::text("status", "tst_status"))
        .field(FieldDef::binary("blob", "tst_blob"))
        .field(FieldDef::json("tags", "tst_tags"))
        .computed(ComputedField::new("docsIds", FieldType::Json, DOCS_IDS_SQL))
}

pub fn doc_table() -> TableDef {
    TableDef::new("tst_doc", "tst_doc")
        .field(FieldDef::text("_id", "tst_doc_id"))
        .field(FieldDef::text("title", "tst_doc_title"))
        .field(FieldDef::text("status", "tst_doc_status"))
}

pub fn plain_table() -> TableDef {
    TableDef::new("plain", "plain")
        .field(FieldDef::text("_id", "plain_id"))
        .field(FieldDef::text("label", "plain_label").required())
}

fn schema_builder() -> txloom_core::schema::SchemaBuilder {
    Schema::builder()
        .entity("Tst", tst_table())
        .entity("TstDoc", doc_table())
        .entity("Plain", plain_table())
        .link(
            "Tst",
            "docsIds",
            "TstDoc",
            LinkTableDef::new("tst_log", "tst_log_id", "tst_doc_id"),
        )
}

pub fn schema() -> Schema {
    schema_builder()
        .audit(AuditTables::default_layout())
        .build()
        .unwrap()
}

pub fn schema_without_audit() -> Schema {
    schema_builder().build().unwrap()
}

pub fn open() -> Rc<Database> {
    let db = open_db_in_memory().unwrap();
    db.execute_batch(DDL).unwrap();
    Rc::new(db)
}

pub fn config(schema: Schema) -> Rc<DataApiConfig> {
    Rc::new(DataApiConfig::new(schema).with_encryption_key(|| TEST_KEY.to_string()))
}

/// Database with audited schema plus one session over it.
pub fn setup() -> (Rc<Database>, Rc<DataApiConfig>, DataApi) {
    let db = open();
    let config = config(schema());
    let api = DataApi::new(Rc::clone(&db), Rc::clone(&config));
    (db, config, api)
}

pub fn count(db: &Database, table: &str) -> i64 {
    db.connection()
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .unwrap()
}

pub fn when() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

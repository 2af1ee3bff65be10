mod common;

use common::{config, count, open, schema, setup, when};
use futures::executor::block_on;
use serde_json::json;
use std::rc::Rc;
use txloom_core::{
    DataApi, DataApiConfig, DataError, Expr, IdStrategy, Params, Record, SelectShape, Value,
};

fn insert(api: &DataApi, entity: &str, data: Record) -> Record {
    block_on(api.tx(&json!({ "op": "insert" }), |tx| async move {
        tx.insert_record(entity, data).await
    }))
    .unwrap()
}

fn update(api: &DataApi, entity: &str, id: &str, data: Record) -> Result<Record, DataError> {
    block_on(api.tx(&json!({ "op": "update" }), |tx| async move {
        tx.update_record(entity, id, data).await
    }))
}

fn delete(api: &DataApi, entity: &str, id: &str) -> Result<Record, DataError> {
    block_on(api.tx(&json!({ "op": "delete" }), |tx| async move {
        tx.delete_record(entity, id).await
    }))
}

fn sample() -> Record {
    Record::new()
        .with("name", "test")
        .with("amount", 1_i64)
        .with("when", when())
}

#[test]
fn insert_then_get_record_round_trips_with_generated_id() {
    let (db, config, api) = setup();
    let inserted = insert(&api, "Tst", sample());

    let id = inserted.id("_id").unwrap();
    assert_eq!(id.len(), 16);
    assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    assert!(inserted.matches(&sample()));
    assert_eq!(inserted.get("status"), Some(&Value::from("ACTIVE")));
    assert_eq!(inserted.get("docsIds"), Some(&Value::Sequence(vec![])));

    let fresh = DataApi::new(db, config);
    let loaded = block_on(fresh.get_record("Tst", &id)).unwrap();
    assert!(loaded.matches(&sample()));
    assert_eq!(loaded, inserted);
}

#[test]
fn supplied_ids_and_statuses_are_kept() {
    let (_db, _config, api) = setup();
    let data = Record::new()
        .with("_id", "fixed-id")
        .with("title", "doc")
        .with("status", "ARCHIVED");
    let inserted = insert(&api, "TstDoc", data);
    assert_eq!(inserted.id("_id").as_deref(), Some("fixed-id"));
    assert_eq!(inserted.get("status"), Some(&Value::from("ARCHIVED")));
}

#[test]
fn uuid_strategy_generates_uuid_ids() {
    let db = open();
    let config = Rc::new(DataApiConfig::new(schema()).with_id_strategy(IdStrategy::Uuid));
    let api = DataApi::new(db, config);
    let inserted = insert(&api, "TstDoc", Record::new().with("title", "doc"));
    let id = inserted.id("_id").unwrap();
    assert!(uuid::Uuid::parse_str(&id).is_ok());
}

#[test]
fn json_fields_keep_tagged_values() {
    let (db, config, api) = setup();
    let tags = Value::set(vec![Value::from("a"), Value::from("b")]);
    let inserted = insert(&api, "Tst", sample().with("tags", tags.clone()));

    let fresh = DataApi::new(db, config);
    let loaded = block_on(fresh.get_record("Tst", &inserted.id("_id").unwrap())).unwrap();
    assert_eq!(loaded.get("tags"), Some(&tags));
}

#[test]
fn encrypted_fields_are_stored_as_ciphertext() {
    let (db, _config, api) = setup();
    let id = insert(&api, "Tst", sample()).id("_id").unwrap();

    let stored: Vec<u8> = db
        .connection()
        .query_row("SELECT tst_name FROM tst WHERE tst_id = ?1", [&id], |row| row.get(0))
        .unwrap();
    assert!(!stored.windows(4).any(|window| window == b"test"));

    let wrong_key = Rc::new(DataApiConfig::new(schema()).with_encryption_key(|| "other".to_string()));
    let other = DataApi::new(Rc::clone(&db), wrong_key);
    let err = block_on(other.get_record("Tst", &id)).unwrap_err();
    assert!(matches!(err, DataError::Batch(_)));
    assert!(!err.is_not_found());
}

#[test]
fn update_changes_only_supplied_fields_and_is_visible_to_new_sessions() {
    let (db, config, api) = setup();
    let id = insert(&api, "Tst", sample()).id("_id").unwrap();

    let updated = update(&api, "Tst", &id, Record::new().with("amount", 2_i64)).unwrap();
    assert_eq!(updated.get("amount"), Some(&Value::Int(2)));
    assert_eq!(updated.get("name"), Some(&Value::from("test")));
    assert_eq!(updated.get("when"), Some(&Value::Date(when())));

    let fresh = DataApi::new(db, config);
    let loaded = block_on(fresh.get_record("Tst", &id)).unwrap();
    assert_eq!(loaded.get("amount"), Some(&Value::Int(2)));
}

#[test]
fn update_treats_nulls_as_unchanged() {
    let (_db, _config, api) = setup();
    let id = insert(&api, "Tst", sample()).id("_id").unwrap();

    let data = Record::new()
        .with("amount", Value::Null)
        .with("name", "renamed");
    let updated = update(&api, "Tst", &id, data).unwrap();
    assert_eq!(updated.get("amount"), Some(&Value::Int(1)));
    assert_eq!(updated.get("name"), Some(&Value::from("renamed")));
}

#[test]
fn update_with_nothing_to_change_returns_current_row_and_logs_it() {
    let (db, _config, api) = setup();
    let inserted = insert(&api, "Tst", sample());
    let id = inserted.id("_id").unwrap();
    let details_before = count(&db, "tx_details");

    let same = update(&api, "Tst", &id, Record::new().with("amount", Value::Null)).unwrap();
    assert_eq!(same, inserted);
    assert_eq!(count(&db, "tx_details"), details_before + 1);

    let err = update(&api, "Tst", "missing", Record::new()).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn update_rejects_identity_changes() {
    let (_db, _config, api) = setup();
    let id = insert(&api, "Tst", sample()).id("_id").unwrap();

    let err = update(&api, "Tst", &id, Record::new().with("_id", "other")).unwrap_err();
    assert!(matches!(err, DataError::ImmutableField { field, .. } if field == "_id"));

    let same_id = Record::new().with("_id", id.as_str()).with("amount", 3_i64);
    let updated = update(&api, "Tst", &id, same_id).unwrap();
    assert_eq!(updated.get("amount"), Some(&Value::Int(3)));
}

#[test]
fn update_of_missing_record_is_not_found_and_rolls_back() {
    let (db, _config, api) = setup();
    let err = update(&api, "Tst", "missing", Record::new().with("amount", 2_i64)).unwrap_err();
    assert!(matches!(err, DataError::NotFound { ref id, .. } if id == "missing"));
    assert_eq!(count(&db, "tx_log"), 0);
}

#[test]
fn insert_validates_fields() {
    let (_db, _config, api) = setup();
    let run = |entity: &'static str, data: Record| {
        block_on(api.tx(&json!(null), |tx| async move { tx.insert_record(entity, data).await }))
    };

    let err = run("Tst", sample().with("nope", 1_i64)).unwrap_err();
    assert!(matches!(err, DataError::UnknownField { field, .. } if field == "nope"));

    let err = run("Tst", sample().with("docsIds", Value::Sequence(vec![]))).unwrap_err();
    assert!(matches!(err, DataError::ReadOnlyField { field, .. } if field == "docsIds"));

    let err = run("Plain", Record::new()).unwrap_err();
    assert!(matches!(err, DataError::MissingField { field, .. } if field == "label"));

    let err = run("Nope", Record::new()).unwrap_err();
    assert!(matches!(err, DataError::UnknownEntity(ref name) if name == "Nope"));
    assert!(err.is_configuration());
}

#[test]
fn soft_delete_keeps_row_with_deleted_status() {
    let (db, _config, api) = setup();
    let id = insert(&api, "Tst", sample()).id("_id").unwrap();

    let deleted = delete(&api, "Tst", &id).unwrap();
    assert_eq!(deleted.get("status"), Some(&Value::from("DELETED")));
    assert_eq!(count(&db, "tst"), 1);

    let shape = SelectShape::new().filter(Expr::field("_id").equals(Expr::value(id.as_str())));
    let rows = block_on(api.bulk_select("Tst", Some(shape), Params::new())).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some(&Value::from("DELETED")));

    assert!(delete(&api, "Tst", "missing").unwrap_err().is_not_found());
}

#[test]
fn hard_delete_removes_row_and_cache_entry() {
    let (db, _config, api) = setup();
    let inserted = insert(&api, "Plain", Record::new().with("label", "x"));
    let id = inserted.id("_id").unwrap();
    assert_eq!(block_on(api.get_record("Plain", &id)).unwrap(), inserted);

    let deleted = delete(&api, "Plain", &id).unwrap();
    assert_eq!(deleted, inserted);
    assert_eq!(count(&db, "plain"), 0);
    assert!(block_on(api.get_record("Plain", &id)).unwrap_err().is_not_found());
    assert!(delete(&api, "Plain", &id).unwrap_err().is_not_found());
}

#[test]
fn bulk_select_orders_by_requested_field() {
    let (_db, _config, api) = setup();
    let b = insert(&api, "Tst", sample().with("name", "b")).id("_id").unwrap();
    let a = insert(&api, "Tst", sample().with("name", "a")).id("_id").unwrap();

    let shape = SelectShape::new()
        .filter(Expr::field("_id").in_list(vec![Expr::param("first"), Expr::param("second")]))
        .order_by("name");
    let params = Params::new().with("first", a.as_str()).with("second", b.as_str());
    let rows = block_on(api.bulk_select("Tst", Some(shape), params)).unwrap();

    let ids: Vec<_> = rows.iter().map(|row| row.id("_id").unwrap()).collect();
    assert_eq!(ids, vec![a, b]);
}

#[test]
fn bulk_select_primes_point_reads() {
    let (db, config, api) = setup();
    let id = insert(&api, "Tst", sample()).id("_id").unwrap();

    let fresh = DataApi::new(Rc::clone(&db), config);
    let rows = block_on(fresh.bulk_select("Tst", None, Params::new())).unwrap();
    assert_eq!(rows.len(), 1);

    let before = db.statements_executed();
    let loaded = block_on(fresh.get_record("Tst", &id)).unwrap();
    assert_eq!(loaded, rows[0]);
    assert_eq!(db.statements_executed(), before);
}

#[test]
fn transaction_api_is_unusable_after_commit() {
    let (_db, _config, api) = setup();
    let leaked = block_on(api.tx(&json!(null), |tx| async move { Ok(tx.clone()) })).unwrap();
    let err = block_on(leaked.insert_record("Tst", sample())).unwrap_err();
    assert!(matches!(err, DataError::TransactionClosed));
}

#[test]
fn sessions_without_encryption_key_source_use_placeholder_key() {
    let db = open();
    let api = DataApi::new(Rc::clone(&db), Rc::new(DataApiConfig::new(schema())));
    let id = insert(&api, "Tst", sample()).id("_id").unwrap();

    let keyed = DataApi::new(db, config(schema()));
    assert!(block_on(keyed.get_record("Tst", &id)).is_err());
}

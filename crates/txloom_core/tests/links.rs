mod common;

use common::{count, setup};
use futures::executor::block_on;
use serde_json::json;
use txloom_core::{
    DataApi, DataError, Expr, LinkConfigError, Params, Record, SelectShape, Value,
};

fn create_pair(api: &DataApi) -> (String, String) {
    block_on(api.tx(&json!({ "op": "seed" }), |tx| async move {
        let parent = tx
            .insert_record("Tst", Record::new().with("name", "parent"))
            .await?;
        let doc = tx
            .insert_record("TstDoc", Record::new().with("title", "doc"))
            .await?;
        Ok::<_, DataError>((parent.id("_id").unwrap(), doc.id("_id").unwrap()))
    }))
    .unwrap()
}

fn docs_ids(record: &Record) -> Vec<Value> {
    record
        .get("docsIds")
        .and_then(Value::as_list)
        .map(<[Value]>::to_vec)
        .unwrap()
}

#[test]
fn add_then_remove_link_updates_parent_aggregate() {
    let (db, _config, api) = setup();
    let (parent, doc) = create_pair(&api);
    let (p, d) = (parent.as_str(), doc.as_str());

    let linked = block_on(api.tx(&json!({ "op": "link" }), |tx| async move {
        tx.add_link("Tst", p, "docsIds", "TstDoc", d).await
    }))
    .unwrap();
    assert_eq!(docs_ids(&linked), vec![Value::from(d)]);
    assert_eq!(count(&db, "tst_log"), 1);

    let before = db.statements_executed();
    let cached = block_on(api.get_record("Tst", p)).unwrap();
    assert_eq!(docs_ids(&cached), vec![Value::from(d)]);
    assert_eq!(db.statements_executed(), before);

    let unlinked = block_on(api.tx(&json!({ "op": "unlink" }), |tx| async move {
        tx.remove_link("Tst", p, "docsIds", "TstDoc", d).await
    }))
    .unwrap();
    assert!(docs_ids(&unlinked).is_empty());
    assert!(docs_ids(&block_on(api.get_record("Tst", p)).unwrap()).is_empty());
    assert_eq!(count(&db, "tst_log"), 0);
}

#[test]
fn removing_an_absent_edge_succeeds_and_is_logged() {
    let (db, _config, api) = setup();
    let (parent, doc) = create_pair(&api);
    let (p, d) = (parent.as_str(), doc.as_str());
    let details_before = count(&db, "tx_details");

    let record = block_on(api.tx(&json!(null), |tx| async move {
        tx.remove_link("Tst", p, "docsIds", "TstDoc", d).await
    }))
    .unwrap();
    assert!(docs_ids(&record).is_empty());
    assert_eq!(count(&db, "tx_details"), details_before + 1);
}

#[test]
fn soft_deleted_children_drop_out_of_the_aggregate() {
    let (db, _config, api) = setup();
    let (parent, doc) = create_pair(&api);
    let (p, d) = (parent.as_str(), doc.as_str());

    block_on(api.tx(&json!(null), |tx| async move {
        tx.add_link("Tst", p, "docsIds", "TstDoc", d).await?;
        tx.delete_record("TstDoc", d).await
    }))
    .unwrap();

    let shape = SelectShape::new().filter(Expr::field("_id").equals(Expr::param("parent")));
    let rows = block_on(api.bulk_select("Tst", Some(shape), Params::new().with("parent", p))).unwrap();
    assert!(docs_ids(&rows[0]).is_empty());
    assert_eq!(count(&db, "tst_log"), 1);
}

#[test]
fn undeclared_links_are_configuration_errors() {
    let (db, _config, api) = setup();
    let (parent, doc) = create_pair(&api);
    let (p, d) = (parent.as_str(), doc.as_str());
    let headers_before = count(&db, "tx_log");

    let attempt = |parent_type: &'static str, field: &'static str, child_type: &'static str| {
        block_on(api.tx(&json!(null), |tx| async move {
            tx.add_link(parent_type, p, field, child_type, d).await
        }))
        .unwrap_err()
    };

    let err = attempt("TstDoc", "docsIds", "Tst");
    assert!(err.is_configuration());
    assert!(matches!(err, DataError::Link(LinkConfigError::UnknownParent { .. })));

    let err = attempt("Tst", "docsIds", "Plain");
    assert!(matches!(err, DataError::Link(LinkConfigError::UnknownRelation { .. })));

    let err = attempt("Tst", "otherIds", "TstDoc");
    assert!(matches!(err, DataError::Link(LinkConfigError::UnknownField { .. })));

    assert_eq!(count(&db, "tx_log"), headers_before);
}

#[test]
fn failed_link_insert_rolls_back_the_transaction() {
    let (db, _config, api) = setup();
    let (parent, _doc) = create_pair(&api);
    let p = parent.as_str();
    let headers_before = count(&db, "tx_log");

    let err = block_on(api.tx(&json!(null), |tx| async move {
        tx.update_record("Tst", p, Record::new().with("amount", 9_i64))
            .await?;
        tx.add_link("Tst", p, "docsIds", "TstDoc", "no-such-doc").await
    }))
    .unwrap_err();
    assert!(matches!(err, DataError::Db(_)));

    assert_eq!(count(&db, "tx_log"), headers_before);
    assert_eq!(count(&db, "tst_log"), 0);
    let reloaded = block_on(api.get_record("Tst", p)).unwrap();
    assert_eq!(reloaded.get("amount"), Some(&Value::Null));
}

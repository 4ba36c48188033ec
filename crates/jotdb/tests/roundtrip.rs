//! End-to-end behavior through the fake engine: CRUD, transactions,
//! indexes, both query front ends, bulk writes and maintenance.

use jotdb::{Engine, Error, QueryOptions};
use serde_json::json;

fn open() -> (Engine, jotdb::Database) {
    let engine = Engine::from_api(jotdb_testkit::api());
    let db = engine.open("/tmp/roundtrip.jot").unwrap();
    (engine, db)
}

#[test]
fn insert_then_find_by_id_round_trips() {
    let (_engine, db) = open();
    let users = db.collection("users").unwrap();

    let id = users.insert(&json!({"name": "Alice", "age": 30})).unwrap();
    let doc = users.find_by_id(&id).unwrap().expect("document must exist");

    assert_eq!(doc["name"], json!("Alice"));
    assert_eq!(doc["age"], json!(30));
    assert_eq!(doc["_id"], json!(id));
}

#[test]
fn find_by_id_miss_is_none_not_error() {
    let (_engine, db) = open();
    let users = db.collection("users").unwrap();
    assert!(users.find_by_id("missing").unwrap().is_none());
}

#[test]
fn rolled_back_insert_is_invisible_to_committed_view() {
    let (_engine, db) = open();

    let tx = db.begin().unwrap();
    tx.insert("docs", &json!({"_id": "doc1", "value": 1})).unwrap();
    assert!(tx.find_by_id("docs", "doc1").unwrap().is_some());
    tx.rollback().unwrap();

    let docs = db.collection("docs").unwrap();
    assert!(docs.find_by_id("doc1").unwrap().is_none());
}

#[test]
fn committed_insert_is_visible() {
    let (_engine, db) = open();

    let tx = db.begin().unwrap();
    let id = tx.insert("docs", &json!({"value": 42})).unwrap();
    tx.commit().unwrap();

    let docs = db.collection("docs").unwrap();
    let doc = docs.find_by_id(&id).unwrap().expect("committed doc");
    assert_eq!(doc["value"], json!(42));
}

#[test]
fn transaction_update_and_delete() {
    let (_engine, db) = open();
    let tx = db.begin().unwrap();
    assert!(tx.is_active().unwrap());
    let id = tx.insert("docs", &json!({"v": 1})).unwrap();
    tx.update_by_id("docs", &id, &json!({"v": 2})).unwrap();
    assert_eq!(tx.find_by_id("docs", &id).unwrap().unwrap()["v"], json!(2));
    tx.delete_by_id("docs", &id).unwrap();
    assert!(tx.find_by_id("docs", &id).unwrap().is_none());
    assert_eq!(tx.count("docs").unwrap(), 0);
    tx.commit().unwrap();
    assert!(!tx.is_active().unwrap());
}

#[test]
fn transaction_collection_management() {
    let (_engine, db) = open();
    let tx = db.begin().unwrap();
    tx.create_collection("a").unwrap();
    assert!(matches!(
        tx.create_collection("a"),
        Err(Error::Native { .. })
    ));
    tx.rename_collection("a", "b").unwrap();
    tx.drop_collection("b").unwrap();
    assert!(matches!(tx.drop_collection("b"), Err(Error::Native { .. })));
    tx.commit().unwrap();
}

#[test]
fn unique_index_rejects_second_insert_and_keeps_first() {
    let (_engine, db) = open();
    let users = db.collection("users").unwrap();

    users.insert(&json!({"email": "seed@x.com"})).unwrap();
    db.create_index("users", "by_email", "email", true).unwrap();

    let first = users.insert(&json!({"email": "a@x.com"})).unwrap();
    let err = users.insert(&json!({"email": "a@x.com"})).unwrap_err();
    assert_eq!(err.native_code(), Some(4));

    // The first insert's effect persists.
    let doc = users.find_by_id(&first).unwrap().unwrap();
    assert_eq!(doc["email"], json!("a@x.com"));
    assert_eq!(users.count().unwrap(), 2);
}

#[test]
fn index_management_round_trip() {
    let (_engine, db) = open();
    let users = db.collection("users").unwrap();
    users.insert(&json!({"a": 1, "b": 2})).unwrap();

    db.create_index("users", "by_a", "a", false).unwrap();
    db.create_compound_index("users", "by_ab", &["a", "b"], true)
        .unwrap();
    db.create_text_index("users", "text_b", "b").unwrap();

    let indexes = db.list_indexes("users").unwrap();
    let names: Vec<&str> = indexes.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, ["by_a", "by_ab", "text_b"]);
    assert!(indexes[1].unique);
    assert_eq!(indexes[1].fields, ["a", "b"]);

    db.drop_index("users", "by_a").unwrap();
    assert_eq!(db.list_indexes("users").unwrap().len(), 2);
    assert!(matches!(
        db.drop_index("users", "by_a"),
        Err(Error::Native { .. })
    ));
}

#[test]
fn raw_filter_front_end() {
    let (_engine, db) = open();
    let users = db.collection("users").unwrap();
    users.insert(&json!({"name": "a", "age": 30})).unwrap();
    users.insert(&json!({"name": "b", "age": 30})).unwrap();
    users.insert(&json!({"name": "c", "age": 40})).unwrap();

    assert_eq!(users.find(r#"{"age": 30}"#).unwrap().len(), 2);
    assert_eq!(users.count_with_query(r#"{"age": 40}"#).unwrap(), 1);

    let one = users.find_one(r#"{"age": 40}"#).unwrap().unwrap();
    assert_eq!(one["name"], json!("c"));
    assert!(users.find_one(r#"{"age": 99}"#).unwrap().is_none());

    let modified = users
        .update(r#"{"age": 30}"#, &json!({"$set": {"flag": true}}))
        .unwrap();
    assert_eq!(modified, 2);
    assert!(users
        .update_one(r#"{"age": 40}"#, &json!({"$set": {"flag": true}}))
        .unwrap());

    assert!(users.delete_one(r#"{"age": 40}"#).unwrap());
    assert_eq!(users.delete(r#"{"age": 30}"#).unwrap(), 2);
    assert_eq!(users.count().unwrap(), 0);
}

#[test]
fn structured_front_end_sorts_pages_and_projects() {
    let (_engine, db) = open();
    let nums = db.collection("nums").unwrap();
    for v in [3, 1, 4, 1, 5, 9, 2, 6] {
        nums.insert(&json!({"v": v, "noise": "x"})).unwrap();
    }

    let docs = nums
        .query(
            &QueryOptions::new()
                .sort("v", false)
                .skip(1)
                .limit(3)
                .project(["v"]),
        )
        .unwrap();
    let values: Vec<i64> = docs.iter().map(|d| d["v"].as_i64().unwrap()).collect();
    assert_eq!(values, [6, 5, 4]);
    assert!(docs.iter().all(|d| d.get("noise").is_none()));
    assert!(docs.iter().all(|d| d.get("_id").is_some()));

    let filtered = nums
        .query(&QueryOptions::new().filter(r#"{"v": 1}"#))
        .unwrap();
    assert_eq!(filtered.len(), 2);

    let excluded = nums
        .query(&QueryOptions::new().limit(1).exclude(["noise"]))
        .unwrap();
    assert!(excluded[0].get("noise").is_none());
    assert!(excluded[0].get("v").is_some());

    assert_eq!(nums.query_count(None, 2, 0).unwrap(), 6);
    assert_eq!(nums.query_count(Some(r#"{"v": 1}"#), 0, 1).unwrap(), 1);

    let first = nums.query_first(None, Some("v"), true).unwrap().unwrap();
    assert_eq!(first["v"], json!(1));
    assert!(nums
        .query_first(Some(r#"{"v": 777}"#), None, true)
        .unwrap()
        .is_none());
}

#[test]
fn upserts_report_insert_vs_update() {
    let (_engine, db) = open();
    let users = db.collection("users").unwrap();

    let outcome = users.upsert_by_id("u1", &json!({"name": "a"})).unwrap();
    assert!(outcome.inserted);
    assert_eq!(outcome.id, "u1");

    let outcome = users.upsert_by_id("u1", &json!({"name": "b"})).unwrap();
    assert!(!outcome.inserted);
    assert_eq!(users.find_by_id("u1").unwrap().unwrap()["name"], json!("b"));

    let outcome = users
        .upsert(r#"{"name": "zz"}"#, &json!({"name": "zz"}))
        .unwrap();
    assert!(outcome.inserted);
    let outcome = users
        .upsert(r#"{"name": "zz"}"#, &json!({"name": "zz", "n": 1}))
        .unwrap();
    assert!(!outcome.inserted);
}

#[test]
fn insert_many_returns_ids_in_order() {
    let (_engine, db) = open();
    let users = db.collection("users").unwrap();
    let ids = users
        .insert_many(&[json!({"n": 1}), json!({"n": 2}), json!({"n": 3})])
        .unwrap();
    assert_eq!(ids.len(), 3);
    for (i, id) in ids.iter().enumerate() {
        let doc = users.find_by_id(id).unwrap().unwrap();
        assert_eq!(doc["n"], json!(i as i64 + 1));
    }
}

#[test]
fn distinct_search_and_aggregate() {
    let (_engine, db) = open();
    let posts = db.collection("posts").unwrap();
    posts.insert(&json!({"tag": "rust", "title": "Hello World"})).unwrap();
    posts.insert(&json!({"tag": "rust", "title": "Borrowing"})).unwrap();
    posts.insert(&json!({"tag": "db", "title": "B-trees"})).unwrap();

    let tags = posts.distinct("tag").unwrap();
    assert_eq!(tags, vec![json!("db"), json!("rust")]);
    assert_eq!(posts.count_distinct("tag").unwrap(), 2);

    let hits = posts.search("world").unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["title"], json!("Hello World"));

    let out = posts
        .aggregate(&[json!({"$match": {"tag": "rust"}}), json!({"$count": "n"})])
        .unwrap();
    assert_eq!(out, vec![json!({"n": 2})]);
}

#[test]
fn bulk_write_reports_per_item_outcomes_in_success_payload() {
    let (_engine, db) = open();
    let users = db.collection("users").unwrap();
    users.insert(&json!({"_id": "u1", "n": 1})).unwrap();

    let report = users
        .bulk_write(
            &[
                json!({"op": "insert", "doc": {"n": 2}}),
                json!({"op": "delete_one", "query": {"n": 999}}),
                json!({"op": "update_one", "query": {"_id": "u1"}, "update": {"$set": {"n": 10}}}),
            ],
            false,
        )
        .unwrap();

    assert_eq!(report.inserted_count, 1);
    assert_eq!(report.updated_count, 1);
    assert_eq!(report.deleted_count, 0);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].operation_index, 1);
    assert_eq!(users.find_by_id("u1").unwrap().unwrap()["n"], json!(10));
}

#[test]
fn ordered_bulk_write_stops_at_first_failure() {
    let (_engine, db) = open();
    let users = db.collection("users").unwrap();

    let report = users
        .bulk_write(
            &[
                json!({"op": "delete_one", "query": {"missing": true}}),
                json!({"op": "insert", "doc": {"n": 1}}),
            ],
            true,
        )
        .unwrap();

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].operation_index, 0);
    assert_eq!(report.inserted_count, 0);
    assert_eq!(users.count().unwrap(), 0);
}

#[test]
fn schema_set_get_remove() {
    let (_engine, db) = open();
    let schema = json!({"required": ["email"], "properties": {"email": {"type": "string"}}});

    assert!(db.schema("users").unwrap().is_none());
    db.set_schema("users", &schema).unwrap();
    assert_eq!(db.schema("users").unwrap(), Some(schema));
    db.remove_schema("users").unwrap();
    assert!(db.schema("users").unwrap().is_none());
}

#[test]
fn maintenance_surface() {
    let (_engine, db) = open();
    let users = db.collection("users").unwrap();
    users.insert(&json!({"n": 1})).unwrap();
    users.insert(&json!({"n": 2})).unwrap();

    assert!(db.frame_count().unwrap() > 0);
    db.checkpoint().unwrap();
    assert_eq!(db.frame_count().unwrap(), 0);

    let metrics = db.metrics().unwrap();
    assert!(metrics["writes"].as_u64().unwrap() >= 2);

    users.insert(&json!({"n": 3})).unwrap();
    let report = db.garbage_collect().unwrap();
    assert!(report.reclaimed_frames > 0);

    let dir = tempfile::tempdir().unwrap();
    let backup_path = dir.path().join("backup.jot");
    let backup_path = backup_path.to_str().unwrap();
    db.backup(backup_path).unwrap();
    let verify = db.verify_backup(backup_path).unwrap();
    assert!(verify.valid);
    assert!(verify.file_size > 0);
}

#[test]
fn introspection_surface() {
    let (engine, db) = open();
    let users = db.collection("users").unwrap();
    users.insert(&json!({"n": 1})).unwrap();
    db.collection("posts").unwrap().insert(&json!({"t": "x"})).unwrap();

    assert_eq!(db.path().unwrap(), "/tmp/roundtrip.jot");
    assert!(!db.is_read_only().unwrap());
    assert_eq!(db.list_collections().unwrap(), ["posts", "users"]);

    let stats = db.collection_stats("users").unwrap();
    assert_eq!(stats.name, "users");
    assert_eq!(stats.document_count, 1);

    let info = db.info().unwrap();
    assert_eq!(info.total_documents, 2);
    assert_eq!(info.collections.len(), 2);
    assert!(!info.read_only);

    let defaults = engine.default_database_options();
    assert_eq!(db.max_bulk_operations().unwrap(), defaults.max_bulk_operations);
    assert_eq!(db.max_document_size().unwrap(), defaults.max_document_size);
    assert_eq!(
        db.max_request_body_size().unwrap(),
        defaults.max_request_body_size
    );
    assert_eq!(users.name().unwrap(), "users");
}

#[test]
fn transaction_options_read_modify_write() {
    let (engine, db) = open();

    let defaults = engine.default_transaction_options();
    assert_eq!(db.transaction_options().unwrap(), defaults);

    let tuned = defaults.max_retries(2).retry_backoff_base_ms(5);
    db.set_transaction_options(tuned).unwrap();
    assert_eq!(db.transaction_options().unwrap(), tuned);

    db.set_auto_checkpoint_threshold(17).unwrap();
}

#[test]
fn read_only_database_rejects_writes_natively() {
    let engine = Engine::from_api(jotdb_testkit::api());
    let options = engine.default_database_options().read_only(true);
    let db = engine.open_with_options("/tmp/ro.jot", options).unwrap();
    assert!(db.is_read_only().unwrap());

    let coll = db.collection("users").unwrap();
    let err = coll.insert(&json!({"n": 1})).unwrap_err();
    assert_eq!(err.native_code(), Some(5));
}

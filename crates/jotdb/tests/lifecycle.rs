//! Handle lifecycle and buffer ownership properties, driven against the
//! counting fake engine.

use jotdb::{Engine, Error};
use serde_json::json;

fn engine() -> Engine {
    Engine::from_api(jotdb_testkit::api())
}

#[test]
fn closed_database_rejects_locally_with_zero_native_calls() {
    let _guard = jotdb_testkit::exclusive();
    let engine = engine();
    let db = engine.open("/tmp/lifecycle.jot").unwrap();
    db.close().unwrap();

    let before = jotdb_testkit::counters();
    assert!(matches!(db.begin(), Err(Error::DatabaseClosed)));
    assert!(matches!(db.path(), Err(Error::DatabaseClosed)));
    assert!(matches!(db.checkpoint(), Err(Error::DatabaseClosed)));
    assert!(matches!(db.list_collections(), Err(Error::DatabaseClosed)));
    let after = jotdb_testkit::counters();

    assert_eq!(
        after.native_calls, before.native_calls,
        "rejected operations must not reach the engine"
    );
}

#[test]
fn double_close_is_a_usage_error() {
    let engine = engine();
    let db = engine.open("/tmp/double-close.jot").unwrap();
    db.close().unwrap();
    assert!(matches!(db.close(), Err(Error::DatabaseClosed)));
}

#[test]
fn drop_after_explicit_close_releases_nothing() {
    let _guard = jotdb_testkit::exclusive();
    let engine = engine();
    let db = engine.open("/tmp/drop-after-close.jot").unwrap();
    db.close().unwrap();

    let before = jotdb_testkit::counters();
    drop(db);
    let after = jotdb_testkit::counters();
    assert_eq!(after.native_calls, before.native_calls);
}

#[test]
fn finished_transaction_rejects_data_operations() {
    let _guard = jotdb_testkit::exclusive();
    let engine = engine();
    let db = engine.open("/tmp/tx-finished.jot").unwrap();

    let tx = db.begin().unwrap();
    tx.insert("users", &json!({"name": "a"})).unwrap();
    tx.commit().unwrap();

    let before = jotdb_testkit::counters();
    assert!(matches!(
        tx.insert("users", &json!({"name": "b"})),
        Err(Error::TransactionCommitted)
    ));
    assert!(matches!(
        tx.find_by_id("users", "x"),
        Err(Error::TransactionCommitted)
    ));
    assert!(matches!(tx.commit(), Err(Error::TransactionCommitted)));
    assert!(matches!(tx.rollback(), Err(Error::TransactionCommitted)));
    let after = jotdb_testkit::counters();
    assert_eq!(after.native_calls, before.native_calls);

    let tx = db.begin().unwrap();
    tx.rollback().unwrap();
    assert!(matches!(
        tx.count("users"),
        Err(Error::TransactionRolledBack)
    ));
    assert!(matches!(tx.rollback(), Err(Error::TransactionRolledBack)));
}

#[test]
fn closed_collection_rejects_locally() {
    let _guard = jotdb_testkit::exclusive();
    let engine = engine();
    let db = engine.open("/tmp/coll-closed.jot").unwrap();
    let users = db.collection("users").unwrap();
    users.close().unwrap();

    let before = jotdb_testkit::counters();
    assert!(matches!(
        users.insert(&json!({"name": "a"})),
        Err(Error::CollectionClosed)
    ));
    assert!(matches!(users.count(), Err(Error::CollectionClosed)));
    assert!(matches!(users.close(), Err(Error::CollectionClosed)));
    let after = jotdb_testkit::counters();
    assert_eq!(after.native_calls, before.native_calls);
}

#[test]
fn server_stop_is_terminal() {
    let engine = engine();
    let db = engine.open("/tmp/server.jot").unwrap();
    let mut server = db.start_server("127.0.0.1:8080").unwrap();
    assert!(server.is_running());
    server.stop().unwrap();
    assert!(!server.is_running());
    assert!(matches!(server.stop(), Err(Error::ServerStopped)));
}

#[test]
fn every_owned_buffer_is_released_exactly_once() {
    let _guard = jotdb_testkit::exclusive();
    let before = jotdb_testkit::counters();

    let engine = engine();
    let db = engine.open("/tmp/buffers.jot").unwrap();
    let users = db.collection("users").unwrap();

    // Exercise a spread of buffer-returning calls.
    let id = users.insert(&json!({"name": "Alice", "age": 30})).unwrap();
    let _ = users.find_by_id(&id).unwrap();
    let _ = users.find_all().unwrap();
    let _ = users.name().unwrap();
    let _ = db.path().unwrap();
    let _ = db.list_collections().unwrap();
    let _ = db.info().unwrap();
    let _ = db.metrics().unwrap();
    let _ = users.insert_many(&[json!({"a": 1}), json!({"b": 2})]).unwrap();
    let _ = users.query(&jotdb::QueryOptions::new().limit(2)).unwrap();

    let after = jotdb_testkit::counters();
    assert!(after.strings_allocated > before.strings_allocated);
    assert_eq!(
        after.live_strings(),
        before.live_strings(),
        "every engine buffer must be released after being copied out"
    );
    assert_eq!(after.string_double_frees, before.string_double_frees);
}

#[test]
fn native_error_carries_code_and_releases_its_message() {
    let _guard = jotdb_testkit::exclusive();
    let before = jotdb_testkit::counters();

    let engine = engine();
    let db = engine.open("/tmp/errors.jot").unwrap();
    let users = db.collection("users").unwrap();
    users.insert(&json!({"_id": "u1"})).unwrap();

    let err = users.insert(&json!({"_id": "u1"})).unwrap_err();
    match &err {
        Error::Native { code, message } => {
            assert_eq!(*code, 4, "duplicate id is a conflict");
            assert!(!message.is_empty());
        }
        other => panic!("expected native error, got {other:?}"),
    }
    assert_eq!(err.native_code(), Some(4));

    let after = jotdb_testkit::counters();
    assert!(after.errors_allocated > before.errors_allocated);
    assert_eq!(
        after.live_errors(),
        before.live_errors(),
        "error messages must be released exactly once"
    );
    assert_eq!(after.error_double_frees, before.error_double_frees);
}

#[test]
fn interior_nul_in_a_name_never_crosses_the_boundary() {
    let _guard = jotdb_testkit::exclusive();
    let engine = engine();
    let db = engine.open("/tmp/nul.jot").unwrap();

    let before = jotdb_testkit::counters();
    assert!(matches!(
        db.collection("bad\0name"),
        Err(Error::InteriorNul(_))
    ));
    let after = jotdb_testkit::counters();
    assert_eq!(after.native_calls, before.native_calls);
}

#[test]
fn load_failure_surfaces_as_error() {
    let err = Engine::load("/definitely/not/libjotdb.so").unwrap_err();
    assert!(matches!(err, Error::Load(_)));
}

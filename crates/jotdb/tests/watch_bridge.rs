//! Callback bridge behavior: delivery, stop semantics, containment.

use jotdb::{ChangeKind, Engine};
use serde_json::json;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn open() -> jotdb::Database {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("jotdb=debug")
        .try_init();
    Engine::from_api(jotdb_testkit::api())
        .open("/tmp/watch.jot")
        .unwrap()
}

#[test]
fn insert_fires_exactly_one_event_with_content() {
    let db = open();
    let users = db.collection("users").unwrap();

    let (tx, rx) = mpsc::channel();
    let mut handle = users
        .watch(None, move |event| {
            tx.send(event).unwrap();
        })
        .unwrap();

    let id = users.insert(&json!({"name": "Alice", "age": 30})).unwrap();

    let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event.collection, "users");
    assert_eq!(event.operation, ChangeKind::Insert);
    assert_eq!(event.id, id);
    let doc = event.document.expect("insert carries the document");
    assert_eq!(doc["name"], json!("Alice"));
    assert_eq!(doc["age"], json!(30));

    // Exactly once.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    handle.stop().unwrap();
    users.insert(&json!({"name": "Bob"})).unwrap();
    assert!(
        rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "no delivery after stop returned"
    );
}

#[test]
fn update_and_delete_events() {
    let db = open();
    let users = db.collection("users").unwrap();

    let (tx, rx) = mpsc::channel();
    let _handle = users
        .watch(None, move |event| {
            tx.send(event).unwrap();
        })
        .unwrap();

    let id = users.insert(&json!({"n": 1})).unwrap();
    users.update_by_id(&id, &json!({"n": 2})).unwrap();
    users.delete_by_id(&id).unwrap();

    let insert = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(insert.operation, ChangeKind::Insert);

    let update = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(update.operation, ChangeKind::Update);
    assert_eq!(update.document.unwrap()["n"], json!(2));

    let delete = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(delete.operation, ChangeKind::Delete);
    assert_eq!(delete.id, id);
    assert!(delete.document.is_none(), "deletes carry no document");
}

#[test]
fn filtered_watch_only_sees_matches() {
    let db = open();
    let users = db.collection("users").unwrap();

    let (tx, rx) = mpsc::channel();
    let _handle = users
        .watch(Some(r#"{"vip": true}"#), move |event| {
            tx.send(event).unwrap();
        })
        .unwrap();

    users.insert(&json!({"name": "plain"})).unwrap();
    users.insert(&json!({"name": "gold", "vip": true})).unwrap();

    let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event.document.unwrap()["name"], json!("gold"));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn stop_cuts_off_queued_notifications() {
    let db = open();
    let users = db.collection("users").unwrap();

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&delivered);
    let mut handle = users
        .watch(None, move |event| {
            // Slow handler so events queue up behind it.
            std::thread::sleep(Duration::from_millis(20));
            sink.lock().unwrap().push(event.id);
        })
        .unwrap();

    for i in 0..20 {
        users.insert(&json!({"n": i})).unwrap();
    }
    handle.stop().unwrap();

    let count_at_stop = delivered.lock().unwrap().len();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(
        delivered.lock().unwrap().len(),
        count_at_stop,
        "nothing may be delivered after stop has returned"
    );
    assert!(count_at_stop < 20, "stop must cut off the queued backlog");

    users.insert(&json!({"late": true})).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(delivered.lock().unwrap().len(), count_at_stop);
}

#[test]
fn double_stop_is_a_usage_error() {
    let db = open();
    let users = db.collection("users").unwrap();
    let mut handle = users.watch(None, |_| {}).unwrap();
    assert!(handle.is_active());
    handle.stop().unwrap();
    assert!(!handle.is_active());
    assert!(matches!(handle.stop(), Err(jotdb::Error::WatchStopped)));
}

#[test]
fn handler_panic_is_contained_and_delivery_continues() {
    let db = open();
    let users = db.collection("users").unwrap();

    let seen = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&seen);
    let _handle = users
        .watch(None, move |event| {
            if event.document.as_ref().is_some_and(|d| d["boom"] == json!(true)) {
                panic!("handler failure");
            }
            *sink.lock().unwrap() += 1;
        })
        .unwrap();

    users.insert(&json!({"boom": true})).unwrap();
    users.insert(&json!({"ok": 1})).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while *seen.lock().unwrap() < 1 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(
        *seen.lock().unwrap(),
        1,
        "the panicking event is discarded, the next one is delivered"
    );
}

#[test]
fn dropping_the_handle_stops_delivery() {
    let db = open();
    let users = db.collection("users").unwrap();

    let (tx, rx) = mpsc::channel();
    let handle = users
        .watch(None, move |event| {
            tx.send(event).unwrap();
        })
        .unwrap();
    drop(handle);

    users.insert(&json!({"n": 1})).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn two_watches_deliver_independently() {
    let db = open();
    let users = db.collection("users").unwrap();
    let posts = db.collection("posts").unwrap();

    let (tx_users, rx_users) = mpsc::channel();
    let (tx_posts, rx_posts) = mpsc::channel();
    let _u = users.watch(None, move |e| tx_users.send(e).unwrap()).unwrap();
    let _p = posts.watch(None, move |e| tx_posts.send(e).unwrap()).unwrap();

    users.insert(&json!({"u": 1})).unwrap();
    posts.insert(&json!({"p": 1})).unwrap();

    let ue = rx_users.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(ue.collection, "users");
    let pe = rx_posts.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(pe.collection, "posts");
    assert!(rx_users.recv_timeout(Duration::from_millis(100)).is_err());
}

//! In-memory engine state.
//!
//! Deliberately small semantics: equality filters, `$set`-or-merge
//! updates, a handful of aggregation stages. The binding under test
//! performs no semantic validation, so the fake only needs enough
//! behavior to exercise the boundary contract.

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use uuid::Uuid;

pub(crate) const CODE_GENERIC: i32 = 1;
pub(crate) const CODE_INVALID_ARGUMENT: i32 = 2;
pub(crate) const CODE_NOT_FOUND: i32 = 3;
pub(crate) const CODE_CONFLICT: i32 = 4;
pub(crate) const CODE_READ_ONLY: i32 = 5;

/// Engine-internal failure, surfaced through the error record.
#[derive(Debug)]
pub(crate) struct EngineError {
    pub(crate) code: i32,
    pub(crate) message: String,
}

impl EngineError {
    pub(crate) fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::new(CODE_INVALID_ARGUMENT, message)
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::new(CODE_NOT_FOUND, message)
    }

    pub(crate) fn conflict(message: impl Into<String>) -> Self {
        Self::new(CODE_CONFLICT, message)
    }
}

pub(crate) type EResult<T> = Result<T, EngineError>;

/// One index definition.
#[derive(Debug, Clone)]
pub(crate) struct IndexDef {
    pub(crate) name: String,
    pub(crate) fields: Vec<String>,
    pub(crate) unique: bool,
    pub(crate) text: bool,
}

/// One collection: documents keyed by id, plus metadata.
#[derive(Debug, Clone, Default)]
pub(crate) struct Coll {
    pub(crate) docs: BTreeMap<String, Value>,
    pub(crate) indexes: Vec<IndexDef>,
    pub(crate) schema: Option<Value>,
}

/// The whole data store. Cloned wholesale for transaction snapshots.
#[derive(Debug, Clone, Default)]
pub(crate) struct Store {
    pub(crate) collections: BTreeMap<String, Coll>,
}

/// A change notification queued for delivery.
#[derive(Debug, Clone)]
pub(crate) struct WatchEvent {
    pub(crate) collection: String,
    pub(crate) operation: &'static str,
    pub(crate) id: String,
    pub(crate) doc: Option<Value>,
}

/// One registered watcher and its delivery machinery.
pub(crate) struct Watcher {
    pub(crate) collection: String,
    pub(crate) filter: Option<Value>,
    pub(crate) sender: Mutex<Option<Sender<WatchEvent>>>,
    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) thread: Mutex<Option<JoinHandle<()>>>,
}

/// A fake database instance.
pub(crate) struct Db {
    pub(crate) path: String,
    pub(crate) options: jotdb_abi::RawDatabaseOptions,
    pub(crate) tx_options: Mutex<jotdb_abi::RawTransactionOptions>,
    pub(crate) auto_checkpoint_threshold: AtomicU64,
    pub(crate) store: Mutex<Store>,
    pub(crate) watchers: Mutex<Vec<Arc<Watcher>>>,
    pub(crate) frames: AtomicU64,
    pub(crate) checkpoints: AtomicU64,
    pub(crate) reads: AtomicU64,
    pub(crate) writes: AtomicU64,
}

impl Db {
    pub(crate) fn new(path: String, options: jotdb_abi::RawDatabaseOptions) -> Self {
        Self {
            path,
            auto_checkpoint_threshold: AtomicU64::new(options.auto_checkpoint_threshold),
            options,
            tx_options: Mutex::new(default_transaction_options()),
            store: Mutex::new(Store::default()),
            watchers: Mutex::new(Vec::new()),
            frames: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub(crate) fn ensure_writable(&self) -> EResult<()> {
        if self.options.read_only {
            Err(EngineError::new(CODE_READ_ONLY, "database is read-only"))
        } else {
            Ok(())
        }
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Fans a batch of committed events out to matching watchers.
    pub(crate) fn emit(&self, events: Vec<WatchEvent>) {
        let watchers = self.watchers.lock();
        for event in events {
            for watcher in watchers.iter() {
                if watcher.collection != event.collection {
                    continue;
                }
                if let (Some(filter), Some(doc)) = (&watcher.filter, &event.doc) {
                    if !matches_filter(doc, filter) {
                        continue;
                    }
                }
                if let Some(sender) = watcher.sender.lock().as_ref() {
                    let _ = sender.send(event.clone());
                }
            }
        }
    }
}

/// Engine-default database options.
pub(crate) fn default_database_options() -> jotdb_abi::RawDatabaseOptions {
    jotdb_abi::RawDatabaseOptions {
        cache_size: 1024,
        auto_checkpoint_threshold: 1000,
        file_permissions: 0o600,
        read_only: false,
        max_bulk_operations: 1000,
        max_document_size: 16 * 1024 * 1024,
        max_request_body_size: 32 * 1024 * 1024,
    }
}

/// Engine-default transaction options.
pub(crate) fn default_transaction_options() -> jotdb_abi::RawTransactionOptions {
    jotdb_abi::RawTransactionOptions {
        max_retries: 5,
        retry_backoff_base_ms: 10,
        max_retry_backoff_ms: 1000,
    }
}

impl Store {
    pub(crate) fn coll(&self, name: &str) -> Option<&Coll> {
        self.collections.get(name)
    }

    pub(crate) fn coll_mut(&mut self, name: &str) -> &mut Coll {
        self.collections.entry(name.to_string()).or_default()
    }

    pub(crate) fn total_documents(&self) -> u64 {
        self.collections.values().map(|c| c.docs.len() as u64).sum()
    }
}

/// Inserts a document, assigning `_id` when absent.
pub(crate) fn insert(store: &mut Store, coll_name: &str, mut doc: Value) -> EResult<(String, Value)> {
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| EngineError::invalid("document must be a JSON object"))?;

    let id = match obj.get("_id") {
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(EngineError::invalid("_id must be a string")),
        None => {
            let id = Uuid::new_v4().to_string();
            obj.insert("_id".to_string(), Value::String(id.clone()));
            id
        }
    };

    let coll = store.coll_mut(coll_name);
    if coll.docs.contains_key(&id) {
        return Err(EngineError::conflict(format!(
            "duplicate _id `{id}` in collection `{coll_name}`"
        )));
    }
    check_unique(coll, &doc, None)?;
    coll.docs.insert(id.clone(), doc.clone());
    Ok((id, doc))
}

/// Replaces a document's content, keeping its id.
pub(crate) fn update_by_id(
    store: &mut Store,
    coll_name: &str,
    id: &str,
    doc: Value,
) -> EResult<Value> {
    let mut doc = doc;
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| EngineError::invalid("document must be a JSON object"))?;
    obj.insert("_id".to_string(), Value::String(id.to_string()));

    let coll = store.coll_mut(coll_name);
    if !coll.docs.contains_key(id) {
        return Err(EngineError::not_found(format!(
            "document `{id}` not found in collection `{coll_name}`"
        )));
    }
    check_unique(coll, &doc, Some(id))?;
    coll.docs.insert(id.to_string(), doc.clone());
    Ok(doc)
}

/// Removes a document.
pub(crate) fn delete_by_id(store: &mut Store, coll_name: &str, id: &str) -> EResult<()> {
    let coll = store.coll_mut(coll_name);
    if coll.docs.remove(id).is_none() {
        return Err(EngineError::not_found(format!(
            "document `{id}` not found in collection `{coll_name}`"
        )));
    }
    Ok(())
}

/// Verifies unique indexes against the rest of the collection.
pub(crate) fn check_unique(coll: &Coll, doc: &Value, exclude_id: Option<&str>) -> EResult<()> {
    for index in coll.indexes.iter().filter(|i| i.unique) {
        let key: Vec<&Value> = index
            .fields
            .iter()
            .map(|f| doc.get(f).unwrap_or(&Value::Null))
            .collect();
        for (other_id, other) in &coll.docs {
            if exclude_id == Some(other_id.as_str()) {
                continue;
            }
            let other_key: Vec<&Value> = index
                .fields
                .iter()
                .map(|f| other.get(f).unwrap_or(&Value::Null))
                .collect();
            if key == other_key {
                return Err(EngineError::conflict(format!(
                    "unique index `{}` violated on fields {:?}",
                    index.name, index.fields
                )));
            }
        }
    }
    Ok(())
}

/// Top-level equality match.
pub(crate) fn matches_filter(doc: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields
            .iter()
            .all(|(k, v)| doc.get(k).unwrap_or(&Value::Null) == v),
        None => false,
    }
}

/// Applies an update document: `$set` contents when present, otherwise
/// a field merge. `_id` is never touched.
pub(crate) fn apply_update(doc: &mut Value, update: &Value) {
    let source = update
        .get("$set")
        .and_then(Value::as_object)
        .or_else(|| update.as_object());
    let Some(source) = source else { return };
    let Some(target) = doc.as_object_mut() else {
        return;
    };
    for (k, v) in source {
        if k == "_id" || k.starts_with('$') {
            continue;
        }
        target.insert(k.clone(), v.clone());
    }
}

/// Total order over JSON values for sorting.
pub(crate) fn cmp_values(a: &Value, b: &Value) -> CmpOrdering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)).then_with(|| {
            a.to_string().cmp(&b.to_string())
        }),
    }
}

/// The structured query path: filter, sort, skip, limit, projection.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_query(
    coll: &Coll,
    filter: Option<&Value>,
    sort_field: Option<&str>,
    sort_ascending: bool,
    limit: u64,
    skip: u64,
    projection: Option<&[String]>,
    exclusion: Option<&[String]>,
) -> Vec<Value> {
    let mut docs: Vec<Value> = coll
        .docs
        .values()
        .filter(|doc| filter.is_none_or(|f| matches_filter(doc, f)))
        .cloned()
        .collect();

    if let Some(field) = sort_field {
        docs.sort_by(|a, b| {
            let ord = cmp_values(
                a.get(field).unwrap_or(&Value::Null),
                b.get(field).unwrap_or(&Value::Null),
            );
            if sort_ascending {
                ord
            } else {
                ord.reverse()
            }
        });
    }

    let mut docs: Vec<Value> = docs.into_iter().skip(skip as usize).collect();
    if limit > 0 {
        docs.truncate(limit as usize);
    }

    if let Some(fields) = projection {
        for doc in &mut docs {
            if let Some(obj) = doc.as_object() {
                let mut projected = Map::new();
                if let Some(id) = obj.get("_id") {
                    projected.insert("_id".to_string(), id.clone());
                }
                for field in fields {
                    if let Some(v) = obj.get(field) {
                        projected.insert(field.clone(), v.clone());
                    }
                }
                *doc = Value::Object(projected);
            }
        }
    }
    if let Some(fields) = exclusion {
        for doc in &mut docs {
            if let Some(obj) = doc.as_object_mut() {
                for field in fields {
                    obj.remove(field);
                }
            }
        }
    }
    docs
}

/// A very small aggregation interpreter.
pub(crate) fn aggregate(coll: &Coll, pipeline: &[Value]) -> EResult<Vec<Value>> {
    let mut docs: Vec<Value> = coll.docs.values().cloned().collect();
    for stage in pipeline {
        let obj = stage
            .as_object()
            .ok_or_else(|| EngineError::invalid("pipeline stage must be an object"))?;
        let (op, arg) = obj
            .iter()
            .next()
            .ok_or_else(|| EngineError::invalid("empty pipeline stage"))?;
        match op.as_str() {
            "$match" => docs.retain(|doc| matches_filter(doc, arg)),
            "$count" => {
                let name = arg.as_str().unwrap_or("count");
                let n = docs.len();
                docs = vec![json!({ name: n })];
            }
            "$limit" => {
                let n = arg.as_u64().unwrap_or(0) as usize;
                docs.truncate(n);
            }
            "$skip" => {
                let n = arg.as_u64().unwrap_or(0) as usize;
                docs = docs.into_iter().skip(n).collect();
            }
            "$sort" => {
                if let Some((field, dir)) = arg.as_object().and_then(|o| o.iter().next()) {
                    let ascending = dir.as_i64().unwrap_or(1) >= 0;
                    docs.sort_by(|a, b| {
                        let ord = cmp_values(
                            a.get(field).unwrap_or(&Value::Null),
                            b.get(field).unwrap_or(&Value::Null),
                        );
                        if ascending {
                            ord
                        } else {
                            ord.reverse()
                        }
                    });
                }
            }
            other => {
                return Err(EngineError::invalid(format!(
                    "unsupported pipeline stage `{other}`"
                )))
            }
        }
    }
    Ok(docs)
}

/// Case-insensitive substring search.
///
/// Restricted to text-indexed fields when the collection has any text
/// index, otherwise over all string fields.
pub(crate) fn search(coll: &Coll, query: &str) -> Vec<Value> {
    let needle = query.to_lowercase();
    let text_fields: Vec<&str> = coll
        .indexes
        .iter()
        .filter(|i| i.text)
        .flat_map(|i| i.fields.iter().map(String::as_str))
        .collect();
    coll.docs
        .values()
        .filter(|doc| {
            doc.as_object().is_some_and(|obj| {
                obj.iter().any(|(field, value)| {
                    (text_fields.is_empty() || text_fields.contains(&field.as_str()))
                        && value
                            .as_str()
                            .is_some_and(|s| s.to_lowercase().contains(&needle))
                })
            })
        })
        .cloned()
        .collect()
}

/// Distinct values of one field, in sorted order.
pub(crate) fn distinct(coll: &Coll, field: &str) -> Vec<Value> {
    let mut values: Vec<Value> = Vec::new();
    for doc in coll.docs.values() {
        if let Some(v) = doc.get(field) {
            if !values.contains(v) {
                values.push(v.clone());
            }
        }
    }
    values.sort_by(cmp_values);
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(coll: &str, docs: &[Value]) -> Store {
        let mut store = Store::default();
        for doc in docs {
            insert(&mut store, coll, doc.clone()).unwrap();
        }
        store
    }

    #[test]
    fn insert_assigns_id() {
        let mut store = Store::default();
        let (id, doc) = insert(&mut store, "users", json!({"name": "a"})).unwrap();
        assert!(!id.is_empty());
        assert_eq!(doc["_id"], Value::String(id));
    }

    #[test]
    fn insert_keeps_explicit_id() {
        let mut store = Store::default();
        let (id, _) = insert(&mut store, "users", json!({"_id": "u1", "name": "a"})).unwrap();
        assert_eq!(id, "u1");

        let dup = insert(&mut store, "users", json!({"_id": "u1"}));
        assert_eq!(dup.unwrap_err().code, CODE_CONFLICT);
    }

    #[test]
    fn unique_index_rejects_duplicates() {
        let mut store = store_with("users", &[json!({"email": "a@x.com"})]);
        store.coll_mut("users").indexes.push(IndexDef {
            name: "by_email".into(),
            fields: vec!["email".into()],
            unique: true,
            text: false,
        });
        let err = insert(&mut store, "users", json!({"email": "a@x.com"})).unwrap_err();
        assert_eq!(err.code, CODE_CONFLICT);
        assert!(insert(&mut store, "users", json!({"email": "b@x.com"})).is_ok());
    }

    #[test]
    fn filter_matches_on_equality() {
        let doc = json!({"a": 1, "b": "x"});
        assert!(matches_filter(&doc, &json!({"a": 1})));
        assert!(matches_filter(&doc, &json!({"a": 1, "b": "x"})));
        assert!(!matches_filter(&doc, &json!({"a": 2})));
        assert!(!matches_filter(&doc, &json!({"missing": 1})));
    }

    #[test]
    fn apply_update_honors_set() {
        let mut doc = json!({"_id": "1", "a": 1, "b": 2});
        apply_update(&mut doc, &json!({"$set": {"a": 9, "_id": "nope"}}));
        assert_eq!(doc, json!({"_id": "1", "a": 9, "b": 2}));

        apply_update(&mut doc, &json!({"c": 3}));
        assert_eq!(doc["c"], json!(3));
    }

    #[test]
    fn query_sorts_skips_and_limits() {
        let store = store_with(
            "n",
            &[json!({"v": 3}), json!({"v": 1}), json!({"v": 2}), json!({"v": 4})],
        );
        let coll = store.coll("n").unwrap();
        let docs = run_query(coll, None, Some("v"), true, 2, 1, None, None);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["v"], json!(2));
        assert_eq!(docs[1]["v"], json!(3));
    }

    #[test]
    fn query_projection_keeps_id() {
        let store = store_with("n", &[json!({"_id": "1", "a": 1, "b": 2})]);
        let coll = store.coll("n").unwrap();
        let projection = vec!["a".to_string()];
        let docs = run_query(coll, None, None, true, 0, 0, Some(&projection), None);
        assert_eq!(docs[0], json!({"_id": "1", "a": 1}));
    }

    #[test]
    fn aggregate_match_and_count() {
        let store = store_with("n", &[json!({"v": 1}), json!({"v": 1}), json!({"v": 2})]);
        let coll = store.coll("n").unwrap();
        let out = aggregate(coll, &[json!({"$match": {"v": 1}}), json!({"$count": "n"})]).unwrap();
        assert_eq!(out, vec![json!({"n": 2})]);
    }

    #[test]
    fn aggregate_rejects_unknown_stage() {
        let coll = Coll::default();
        let err = aggregate(&coll, &[json!({"$facet": {}})]).unwrap_err();
        assert_eq!(err.code, CODE_INVALID_ARGUMENT);
    }

    #[test]
    fn search_is_case_insensitive() {
        let store = store_with("n", &[json!({"t": "Hello World"}), json!({"t": "other"})]);
        let coll = store.coll("n").unwrap();
        assert_eq!(search(coll, "hello").len(), 1);
    }

    #[test]
    fn search_respects_text_indexes() {
        let mut store = store_with(
            "n",
            &[json!({"title": "rust", "body": "also rust"}), json!({"body": "rust only"})],
        );
        store.coll_mut("n").indexes.push(IndexDef {
            name: "text_title".into(),
            fields: vec!["title".into()],
            unique: false,
            text: true,
        });
        // Only the title field is searched once a text index exists.
        assert_eq!(search(store.coll("n").unwrap(), "rust").len(), 1);
    }

    #[test]
    fn distinct_sorts_and_dedupes() {
        let store = store_with("n", &[json!({"v": 2}), json!({"v": 1}), json!({"v": 2})]);
        let coll = store.coll("n").unwrap();
        assert_eq!(distinct(coll, "v"), vec![json!(1), json!(2)]);
    }
}

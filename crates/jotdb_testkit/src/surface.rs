//! The fake engine's C surface.
//!
//! One function per entry point, assembled into a [`NativeApi`] by
//! [`api`]. Handles are heap boxes cast to the opaque ABI types, exactly
//! as a native engine would hand out pointers to internal state.

use crate::alloc;
use crate::engine::{
    self, Coll, Db, EngineError, IndexDef, Store, WatchEvent, Watcher, CODE_GENERIC,
};
use jotdb_abi::{
    NativeApi, RawCollection, RawDatabase, RawDatabaseOptions, RawError, RawServer,
    RawTransaction, RawTransactionOptions, RawWatch, SymbolTable, WatchCallback,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

struct DbHandle {
    db: Arc<Db>,
}

struct CollHandle {
    db: Arc<Db>,
    name: String,
}

struct TxState {
    store: Store,
    events: Vec<WatchEvent>,
}

struct TxHandle {
    db: Arc<Db>,
    staged: Mutex<TxState>,
}

struct WatchReg {
    db: Arc<Db>,
    watcher: Arc<Watcher>,
}

struct ServerReg {
    #[allow(dead_code)]
    addr: String,
}

type EResult<T> = Result<T, EngineError>;

unsafe fn fail(err_out: *mut RawError, e: EngineError) -> i32 {
    if !err_out.is_null() {
        *err_out = alloc::give_error(e.code, &e.message);
    }
    -1
}

unsafe fn cstr<'a>(ptr: *const c_char, what: &str) -> EResult<&'a str> {
    if ptr.is_null() {
        return Err(EngineError::invalid(format!("null {what}")));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| EngineError::invalid(format!("invalid UTF-8 in {what}")))
}

unsafe fn opt_cstr<'a>(ptr: *const c_char, what: &str) -> EResult<Option<&'a str>> {
    if ptr.is_null() {
        Ok(None)
    } else {
        cstr(ptr, what).map(Some)
    }
}

unsafe fn parse_json(ptr: *const c_char, what: &str) -> EResult<Value> {
    let text = cstr(ptr, what)?;
    serde_json::from_str(text).map_err(|e| EngineError::invalid(format!("invalid {what}: {e}")))
}

unsafe fn opt_parse_json(ptr: *const c_char, what: &str) -> EResult<Option<Value>> {
    match opt_cstr(ptr, what)? {
        Some(text) => serde_json::from_str(text)
            .map(Some)
            .map_err(|e| EngineError::invalid(format!("invalid {what}: {e}"))),
        None => Ok(None),
    }
}

unsafe fn out_text(out: *mut *mut c_char, s: &str) {
    if !out.is_null() {
        *out = alloc::give_string(s);
    }
}

unsafe fn out_null(out: *mut *mut c_char) {
    if !out.is_null() {
        *out = ptr::null_mut();
    }
}

unsafe fn db_ref<'a>(db: *mut RawDatabase) -> &'a DbHandle {
    &*(db as *const DbHandle)
}

unsafe fn coll_ref<'a>(coll: *mut RawCollection) -> &'a CollHandle {
    &*(coll as *const CollHandle)
}

unsafe fn tx_ref<'a>(tx: *mut RawTransaction) -> &'a TxHandle {
    &*(tx as *const TxHandle)
}

fn string_fields(value: &Value, what: &str) -> EResult<Vec<String>> {
    value
        .as_array()
        .and_then(|a| {
            a.iter()
                .map(|v| v.as_str().map(str::to_owned))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| EngineError::invalid(format!("{what} must be a JSON array of strings")))
}

// ---------------------------------------------------------------------------
// Database management
// ---------------------------------------------------------------------------

unsafe extern "C" fn open(path: *const c_char, err_out: *mut RawError) -> *mut RawDatabase {
    open_with_options(path, engine::default_database_options(), err_out)
}

unsafe extern "C" fn open_with_options(
    path: *const c_char,
    options: RawDatabaseOptions,
    err_out: *mut RawError,
) -> *mut RawDatabase {
    alloc::count_call();
    let path = match cstr(path, "path") {
        Ok(p) => p.to_owned(),
        Err(e) => {
            fail(err_out, e);
            return ptr::null_mut();
        }
    };
    if path.is_empty() {
        fail(err_out, EngineError::invalid("empty database path"));
        return ptr::null_mut();
    }
    let handle = DbHandle {
        db: Arc::new(Db::new(path, options)),
    };
    Box::into_raw(Box::new(handle)) as *mut RawDatabase
}

unsafe extern "C" fn close(db: *mut RawDatabase) {
    alloc::count_call();
    if !db.is_null() {
        drop(Box::from_raw(db as *mut DbHandle));
    }
}

unsafe extern "C" fn default_database_options() -> RawDatabaseOptions {
    alloc::count_call();
    engine::default_database_options()
}

unsafe extern "C" fn default_transaction_options() -> RawTransactionOptions {
    alloc::count_call();
    engine::default_transaction_options()
}

unsafe extern "C" fn set_transaction_options(
    db: *mut RawDatabase,
    options: RawTransactionOptions,
    _err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    *db_ref(db).db.tx_options.lock() = options;
    0
}

unsafe extern "C" fn get_transaction_options(
    db: *mut RawDatabase,
    options_out: *mut RawTransactionOptions,
    _err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    if !options_out.is_null() {
        *options_out = *db_ref(db).db.tx_options.lock();
    }
    0
}

unsafe extern "C" fn set_auto_checkpoint_threshold(
    db: *mut RawDatabase,
    frames: u64,
    _err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    db_ref(db)
        .db
        .auto_checkpoint_threshold
        .store(frames, Ordering::Relaxed);
    0
}

unsafe extern "C" fn get_path(
    db: *mut RawDatabase,
    path_out: *mut *mut c_char,
    _err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    out_text(path_out, &db_ref(db).db.path);
    0
}

unsafe extern "C" fn is_read_only(
    db: *mut RawDatabase,
    value_out: *mut bool,
    _err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    if !value_out.is_null() {
        *value_out = db_ref(db).db.options.read_only;
    }
    0
}

unsafe extern "C" fn max_bulk_operations(db: *mut RawDatabase, _err_out: *mut RawError) -> usize {
    alloc::count_call();
    db_ref(db).db.options.max_bulk_operations
}

unsafe extern "C" fn max_document_size(db: *mut RawDatabase, _err_out: *mut RawError) -> usize {
    alloc::count_call();
    db_ref(db).db.options.max_document_size
}

unsafe extern "C" fn max_request_body_size(db: *mut RawDatabase, _err_out: *mut RawError) -> usize {
    alloc::count_call();
    db_ref(db).db.options.max_request_body_size
}

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

fn stats_json(name: &str, coll: &Coll) -> Value {
    json!({
        "name": name,
        "document_count": coll.docs.len() as u64,
        "indexes": coll.indexes.iter().map(index_json).collect::<Vec<_>>(),
    })
}

fn index_json(index: &IndexDef) -> Value {
    json!({
        "name": index.name,
        "fields": index.fields,
        "unique": index.unique,
    })
}

unsafe extern "C" fn list_collections(
    db: *mut RawDatabase,
    json_out: *mut *mut c_char,
    _err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let handle = db_ref(db);
    handle.db.record_read();
    let store = handle.db.store.lock();
    let names: Vec<&String> = store.collections.keys().collect();
    out_text(json_out, &serde_json::to_string(&names).unwrap_or_default());
    0
}

unsafe extern "C" fn collection_stats(
    db: *mut RawDatabase,
    name: *const c_char,
    json_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let handle = db_ref(db);
    let name = match cstr(name, "collection name") {
        Ok(n) => n,
        Err(e) => return fail(err_out, e),
    };
    let store = handle.db.store.lock();
    match store.coll(name) {
        Some(coll) => {
            out_text(json_out, &stats_json(name, coll).to_string());
            0
        }
        None => fail(
            err_out,
            EngineError::not_found(format!("collection `{name}` not found")),
        ),
    }
}

unsafe extern "C" fn database_info(
    db: *mut RawDatabase,
    json_out: *mut *mut c_char,
    _err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let handle = db_ref(db);
    let store = handle.db.store.lock();
    let info = json!({
        "path": handle.db.path,
        "version": "1.0.0",
        "total_documents": store.total_documents(),
        "read_only": handle.db.options.read_only,
        "collections": store
            .collections
            .iter()
            .map(|(name, coll)| stats_json(name, coll))
            .collect::<Vec<_>>(),
    });
    out_text(json_out, &info.to_string());
    0
}

unsafe extern "C" fn list_indexes(
    db: *mut RawDatabase,
    name: *const c_char,
    json_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let handle = db_ref(db);
    let name = match cstr(name, "collection name") {
        Ok(n) => n,
        Err(e) => return fail(err_out, e),
    };
    let store = handle.db.store.lock();
    let indexes: Vec<Value> = store
        .coll(name)
        .map(|c| c.indexes.iter().map(index_json).collect())
        .unwrap_or_default();
    out_text(
        json_out,
        &serde_json::to_string(&indexes).unwrap_or_default(),
    );
    0
}

// ---------------------------------------------------------------------------
// Index management
// ---------------------------------------------------------------------------

fn add_index(db: &Db, coll_name: &str, def: IndexDef) -> EResult<()> {
    db.ensure_writable()?;
    let mut store = db.store.lock();
    let coll = store.coll_mut(coll_name);
    if coll.indexes.iter().any(|i| i.name == def.name) {
        return Err(EngineError::invalid(format!(
            "index `{}` already exists",
            def.name
        )));
    }
    if def.unique {
        let mut seen: Vec<Vec<&Value>> = Vec::new();
        for doc in coll.docs.values() {
            let key: Vec<&Value> = def
                .fields
                .iter()
                .map(|f| doc.get(f).unwrap_or(&Value::Null))
                .collect();
            if seen.contains(&key) {
                return Err(EngineError::conflict(format!(
                    "existing documents violate unique index `{}`",
                    def.name
                )));
            }
            seen.push(key);
        }
    }
    coll.indexes.push(def);
    Ok(())
}

unsafe extern "C" fn create_index(
    db: *mut RawDatabase,
    coll_name: *const c_char,
    index_name: *const c_char,
    field: *const c_char,
    unique: bool,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let coll_name = cstr(coll_name, "collection name")?;
        let index_name = cstr(index_name, "index name")?;
        let field = cstr(field, "field")?;
        add_index(
            &db_ref(db).db,
            coll_name,
            IndexDef {
                name: index_name.to_owned(),
                fields: vec![field.to_owned()],
                unique,
                text: false,
            },
        )
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn create_compound_index(
    db: *mut RawDatabase,
    coll_name: *const c_char,
    index_name: *const c_char,
    fields_json: *const c_char,
    unique: bool,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let coll_name = cstr(coll_name, "collection name")?;
        let index_name = cstr(index_name, "index name")?;
        let fields = string_fields(&parse_json(fields_json, "fields")?, "fields")?;
        if fields.is_empty() {
            return Err(EngineError::invalid("compound index needs at least one field"));
        }
        add_index(
            &db_ref(db).db,
            coll_name,
            IndexDef {
                name: index_name.to_owned(),
                fields,
                unique,
                text: false,
            },
        )
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn create_text_index(
    db: *mut RawDatabase,
    coll_name: *const c_char,
    index_name: *const c_char,
    field: *const c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let coll_name = cstr(coll_name, "collection name")?;
        let index_name = cstr(index_name, "index name")?;
        let field = cstr(field, "field")?;
        add_index(
            &db_ref(db).db,
            coll_name,
            IndexDef {
                name: index_name.to_owned(),
                fields: vec![field.to_owned()],
                unique: false,
                text: true,
            },
        )
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn drop_index(
    db: *mut RawDatabase,
    coll_name: *const c_char,
    index_name: *const c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let coll_name = cstr(coll_name, "collection name")?;
        let index_name = cstr(index_name, "index name")?;
        let handle = db_ref(db);
        handle.db.ensure_writable()?;
        let mut store = handle.db.store.lock();
        let coll = store.coll_mut(coll_name);
        let before = coll.indexes.len();
        coll.indexes.retain(|i| i.name != index_name);
        if coll.indexes.len() == before {
            return Err(EngineError::not_found(format!(
                "index `{index_name}` not found"
            )));
        }
        Ok(())
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(err_out, e),
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

unsafe extern "C" fn set_schema(
    db: *mut RawDatabase,
    coll_name: *const c_char,
    schema_json: *const c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let coll_name = cstr(coll_name, "collection name")?;
        let schema = parse_json(schema_json, "schema")?;
        let handle = db_ref(db);
        handle.db.ensure_writable()?;
        handle.db.store.lock().coll_mut(coll_name).schema = Some(schema);
        Ok(())
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn get_schema(
    db: *mut RawDatabase,
    coll_name: *const c_char,
    schema_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let coll_name = match cstr(coll_name, "collection name") {
        Ok(n) => n,
        Err(e) => return fail(err_out, e),
    };
    let store = db_ref(db).db.store.lock();
    match store.coll(coll_name).and_then(|c| c.schema.as_ref()) {
        Some(schema) => {
            out_text(schema_out, &schema.to_string());
            0
        }
        None => {
            out_null(schema_out);
            1
        }
    }
}

unsafe extern "C" fn remove_schema(
    db: *mut RawDatabase,
    coll_name: *const c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let coll_name = cstr(coll_name, "collection name")?;
        let handle = db_ref(db);
        handle.db.ensure_writable()?;
        handle.db.store.lock().coll_mut(coll_name).schema = None;
        Ok(())
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(err_out, e),
    }
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

unsafe extern "C" fn checkpoint(db: *mut RawDatabase, _err_out: *mut RawError) -> i32 {
    alloc::count_call();
    let handle = db_ref(db);
    handle.db.frames.store(0, Ordering::Relaxed);
    handle.db.checkpoints.fetch_add(1, Ordering::Relaxed);
    0
}

unsafe extern "C" fn backup(
    db: *mut RawDatabase,
    dest: *const c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let dest = cstr(dest, "backup path")?;
        let handle = db_ref(db);
        let store = handle.db.store.lock();
        let dump = json!({
            "path": handle.db.path,
            "collections": store
                .collections
                .iter()
                .map(|(name, coll)| (name.clone(), Value::Array(coll.docs.values().cloned().collect())))
                .collect::<serde_json::Map<_, _>>(),
        });
        std::fs::write(dest, dump.to_string())
            .map_err(|e| EngineError::new(CODE_GENERIC, format!("backup failed: {e}")))
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn verify_backup(
    db: *mut RawDatabase,
    path: *const c_char,
    json_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let _ = db;
    let result = (|| {
        let path = cstr(path, "backup path")?;
        let bytes = std::fs::read(path)
            .map_err(|e| EngineError::new(CODE_GENERIC, format!("cannot read backup: {e}")))?;
        let valid = serde_json::from_slice::<Value>(&bytes).is_ok();
        Ok(json!({ "valid": valid, "file_size": bytes.len() as u64 }))
    })();
    match result {
        Ok(report) => {
            out_text(json_out, &report.to_string());
            0
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn garbage_collect(
    db: *mut RawDatabase,
    json_out: *mut *mut c_char,
    _err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let handle = db_ref(db);
    let reclaimed = handle.db.frames.swap(0, Ordering::Relaxed);
    out_text(json_out, &json!({ "reclaimed_frames": reclaimed }).to_string());
    0
}

unsafe extern "C" fn metrics(
    db: *mut RawDatabase,
    json_out: *mut *mut c_char,
    _err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let handle = db_ref(db);
    let metrics = json!({
        "reads": handle.db.reads.load(Ordering::Relaxed),
        "writes": handle.db.writes.load(Ordering::Relaxed),
        "checkpoints": handle.db.checkpoints.load(Ordering::Relaxed),
        "frames": handle.db.frames.load(Ordering::Relaxed),
        "watchers": handle.db.watchers.lock().len() as u64,
    });
    out_text(json_out, &metrics.to_string());
    0
}

unsafe extern "C" fn frame_count(
    db: *mut RawDatabase,
    count_out: *mut u64,
    _err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    if !count_out.is_null() {
        *count_out = db_ref(db).db.frames.load(Ordering::Relaxed);
    }
    0
}

// ---------------------------------------------------------------------------
// Web console
// ---------------------------------------------------------------------------

unsafe extern "C" fn start_server(
    db: *mut RawDatabase,
    addr: *const c_char,
    err_out: *mut RawError,
) -> *mut RawServer {
    alloc::count_call();
    let _ = db;
    let addr = match cstr(addr, "listen address") {
        Ok(a) => a.to_owned(),
        Err(e) => {
            fail(err_out, e);
            return ptr::null_mut();
        }
    };
    if addr.is_empty() {
        fail(err_out, EngineError::invalid("empty listen address"));
        return ptr::null_mut();
    }
    Box::into_raw(Box::new(ServerReg { addr })) as *mut RawServer
}

unsafe extern "C" fn stop_server(server: *mut RawServer) {
    alloc::count_call();
    if !server.is_null() {
        drop(Box::from_raw(server as *mut ServerReg));
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

unsafe extern "C" fn begin_transaction(
    db: *mut RawDatabase,
    _err_out: *mut RawError,
) -> *mut RawTransaction {
    alloc::count_call();
    let handle = db_ref(db);
    let snapshot = handle.db.store.lock().clone();
    let tx = TxHandle {
        db: Arc::clone(&handle.db),
        staged: Mutex::new(TxState {
            store: snapshot,
            events: Vec::new(),
        }),
    };
    Box::into_raw(Box::new(tx)) as *mut RawTransaction
}

unsafe extern "C" fn commit(tx: *mut RawTransaction, _err_out: *mut RawError) -> i32 {
    alloc::count_call();
    let tx = Box::from_raw(tx as *mut TxHandle);
    let staged = tx.staged.into_inner();
    {
        let mut store = tx.db.store.lock();
        *store = staged.store;
    }
    tx.db.record_write();
    tx.db.emit(staged.events);
    0
}

unsafe extern "C" fn rollback(tx: *mut RawTransaction) {
    alloc::count_call();
    drop(Box::from_raw(tx as *mut TxHandle));
}

unsafe extern "C" fn transaction_is_active(
    tx: *mut RawTransaction,
    _err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let _ = tx;
    1
}

unsafe extern "C" fn tx_insert(
    tx: *mut RawTransaction,
    coll_name: *const c_char,
    doc_json: *const c_char,
    id_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let handle = tx_ref(tx);
        handle.db.ensure_writable()?;
        let coll_name = cstr(coll_name, "collection name")?;
        let doc = parse_json(doc_json, "document")?;
        let mut staged = handle.staged.lock();
        let (id, doc) = engine::insert(&mut staged.store, coll_name, doc)?;
        staged.events.push(WatchEvent {
            collection: coll_name.to_owned(),
            operation: "insert",
            id: id.clone(),
            doc: Some(doc),
        });
        Ok(id)
    })();
    match result {
        Ok(id) => {
            out_text(id_out, &id);
            0
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn tx_find_by_id(
    tx: *mut RawTransaction,
    coll_name: *const c_char,
    id: *const c_char,
    json_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let coll_name = cstr(coll_name, "collection name")?;
        let id = cstr(id, "document id")?;
        let handle = tx_ref(tx);
        handle.db.record_read();
        let staged = handle.staged.lock();
        Ok(staged
            .store
            .coll(coll_name)
            .and_then(|c| c.docs.get(id).cloned()))
    })();
    match result {
        Ok(Some(doc)) => {
            out_text(json_out, &doc.to_string());
            0
        }
        Ok(None) => {
            out_null(json_out);
            1
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn tx_update_by_id(
    tx: *mut RawTransaction,
    coll_name: *const c_char,
    id: *const c_char,
    doc_json: *const c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let handle = tx_ref(tx);
        handle.db.ensure_writable()?;
        let coll_name = cstr(coll_name, "collection name")?;
        let id = cstr(id, "document id")?;
        let doc = parse_json(doc_json, "document")?;
        let mut staged = handle.staged.lock();
        let doc = engine::update_by_id(&mut staged.store, coll_name, id, doc)?;
        staged.events.push(WatchEvent {
            collection: coll_name.to_owned(),
            operation: "update",
            id: id.to_owned(),
            doc: Some(doc),
        });
        Ok(())
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn tx_delete_by_id(
    tx: *mut RawTransaction,
    coll_name: *const c_char,
    id: *const c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let handle = tx_ref(tx);
        handle.db.ensure_writable()?;
        let coll_name = cstr(coll_name, "collection name")?;
        let id = cstr(id, "document id")?;
        let mut staged = handle.staged.lock();
        engine::delete_by_id(&mut staged.store, coll_name, id)?;
        staged.events.push(WatchEvent {
            collection: coll_name.to_owned(),
            operation: "delete",
            id: id.to_owned(),
            doc: None,
        });
        Ok(())
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn tx_find_all(
    tx: *mut RawTransaction,
    coll_name: *const c_char,
    json_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let coll_name = cstr(coll_name, "collection name")?;
        let handle = tx_ref(tx);
        handle.db.record_read();
        let staged = handle.staged.lock();
        let docs: Vec<Value> = staged
            .store
            .coll(coll_name)
            .map(|c| c.docs.values().cloned().collect())
            .unwrap_or_default();
        Ok(Value::Array(docs))
    })();
    match result {
        Ok(docs) => {
            out_text(json_out, &docs.to_string());
            0
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn tx_count(
    tx: *mut RawTransaction,
    coll_name: *const c_char,
    count_out: *mut u64,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let coll_name = cstr(coll_name, "collection name")?;
        let handle = tx_ref(tx);
        let staged = handle.staged.lock();
        Ok(staged
            .store
            .coll(coll_name)
            .map_or(0, |c| c.docs.len() as u64))
    })();
    match result {
        Ok(count) => {
            if !count_out.is_null() {
                *count_out = count;
            }
            0
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn create_collection(
    tx: *mut RawTransaction,
    name: *const c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let handle = tx_ref(tx);
        handle.db.ensure_writable()?;
        let name = cstr(name, "collection name")?;
        let mut staged = handle.staged.lock();
        if staged.store.collections.contains_key(name) {
            return Err(EngineError::invalid(format!(
                "collection `{name}` already exists"
            )));
        }
        staged.store.collections.insert(name.to_owned(), Coll::default());
        Ok(())
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn drop_collection(
    tx: *mut RawTransaction,
    name: *const c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let handle = tx_ref(tx);
        handle.db.ensure_writable()?;
        let name = cstr(name, "collection name")?;
        let mut staged = handle.staged.lock();
        if staged.store.collections.remove(name).is_none() {
            return Err(EngineError::not_found(format!(
                "collection `{name}` not found"
            )));
        }
        Ok(())
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn rename_collection(
    tx: *mut RawTransaction,
    old_name: *const c_char,
    new_name: *const c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let handle = tx_ref(tx);
        handle.db.ensure_writable()?;
        let old_name = cstr(old_name, "collection name")?;
        let new_name = cstr(new_name, "collection name")?;
        let mut staged = handle.staged.lock();
        if staged.store.collections.contains_key(new_name) {
            return Err(EngineError::invalid(format!(
                "collection `{new_name}` already exists"
            )));
        }
        match staged.store.collections.remove(old_name) {
            Some(coll) => {
                staged.store.collections.insert(new_name.to_owned(), coll);
                Ok(())
            }
            None => Err(EngineError::not_found(format!(
                "collection `{old_name}` not found"
            ))),
        }
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(err_out, e),
    }
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

unsafe extern "C" fn get_collection(
    db: *mut RawDatabase,
    name: *const c_char,
    err_out: *mut RawError,
) -> *mut RawCollection {
    alloc::count_call();
    let name = match cstr(name, "collection name") {
        Ok(n) => n.to_owned(),
        Err(e) => {
            fail(err_out, e);
            return ptr::null_mut();
        }
    };
    let handle = CollHandle {
        db: Arc::clone(&db_ref(db).db),
        name,
    };
    Box::into_raw(Box::new(handle)) as *mut RawCollection
}

unsafe extern "C" fn collection_free(coll: *mut RawCollection) {
    alloc::count_call();
    if !coll.is_null() {
        drop(Box::from_raw(coll as *mut CollHandle));
    }
}

unsafe extern "C" fn collection_name(
    coll: *mut RawCollection,
    name_out: *mut *mut c_char,
    _err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    out_text(name_out, &coll_ref(coll).name);
    0
}

unsafe extern "C" fn collection_insert(
    coll: *mut RawCollection,
    doc_json: *const c_char,
    id_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let handle = coll_ref(coll);
        handle.db.ensure_writable()?;
        let doc = parse_json(doc_json, "document")?;
        let (id, stored) = {
            let mut store = handle.db.store.lock();
            engine::insert(&mut store, &handle.name, doc)?
        };
        handle.db.record_write();
        handle.db.emit(vec![WatchEvent {
            collection: handle.name.clone(),
            operation: "insert",
            id: id.clone(),
            doc: Some(stored),
        }]);
        Ok(id)
    })();
    match result {
        Ok(id) => {
            out_text(id_out, &id);
            0
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn collection_insert_many(
    coll: *mut RawCollection,
    docs_json: *const c_char,
    ids_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let handle = coll_ref(coll);
        handle.db.ensure_writable()?;
        let docs = parse_json(docs_json, "documents")?;
        let docs = docs
            .as_array()
            .ok_or_else(|| EngineError::invalid("documents must be a JSON array"))?;
        if docs.len() > handle.db.options.max_bulk_operations {
            return Err(EngineError::invalid(format!(
                "batch of {} exceeds the bulk operation limit",
                docs.len()
            )));
        }
        // All-or-nothing: stage on a copy, publish only on full success.
        let mut staged = handle.db.store.lock().clone();
        let mut ids = Vec::with_capacity(docs.len());
        let mut events = Vec::with_capacity(docs.len());
        for doc in docs {
            let (id, stored) = engine::insert(&mut staged, &handle.name, doc.clone())?;
            events.push(WatchEvent {
                collection: handle.name.clone(),
                operation: "insert",
                id: id.clone(),
                doc: Some(stored),
            });
            ids.push(id);
        }
        *handle.db.store.lock() = staged;
        handle.db.record_write();
        handle.db.emit(events);
        Ok(serde_json::to_string(&ids).unwrap_or_default())
    })();
    match result {
        Ok(ids) => {
            out_text(ids_out, &ids);
            0
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn collection_find_by_id(
    coll: *mut RawCollection,
    id: *const c_char,
    json_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let id = cstr(id, "document id")?;
        let handle = coll_ref(coll);
        handle.db.record_read();
        let store = handle.db.store.lock();
        Ok(store
            .coll(&handle.name)
            .and_then(|c| c.docs.get(id).cloned()))
    })();
    match result {
        Ok(Some(doc)) => {
            out_text(json_out, &doc.to_string());
            0
        }
        Ok(None) => {
            out_null(json_out);
            1
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn collection_update_by_id(
    coll: *mut RawCollection,
    id: *const c_char,
    doc_json: *const c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let handle = coll_ref(coll);
        handle.db.ensure_writable()?;
        let id = cstr(id, "document id")?;
        let doc = parse_json(doc_json, "document")?;
        let stored = {
            let mut store = handle.db.store.lock();
            engine::update_by_id(&mut store, &handle.name, id, doc)?
        };
        handle.db.record_write();
        handle.db.emit(vec![WatchEvent {
            collection: handle.name.clone(),
            operation: "update",
            id: id.to_owned(),
            doc: Some(stored),
        }]);
        Ok(())
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn collection_delete_by_id(
    coll: *mut RawCollection,
    id: *const c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let handle = coll_ref(coll);
        handle.db.ensure_writable()?;
        let id = cstr(id, "document id")?;
        {
            let mut store = handle.db.store.lock();
            engine::delete_by_id(&mut store, &handle.name, id)?;
        }
        handle.db.record_write();
        handle.db.emit(vec![WatchEvent {
            collection: handle.name.clone(),
            operation: "delete",
            id: id.to_owned(),
            doc: None,
        }]);
        Ok(())
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn collection_find_all(
    coll: *mut RawCollection,
    json_out: *mut *mut c_char,
    _err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let handle = coll_ref(coll);
    handle.db.record_read();
    let store = handle.db.store.lock();
    let docs: Vec<Value> = store
        .coll(&handle.name)
        .map(|c| c.docs.values().cloned().collect())
        .unwrap_or_default();
    out_text(json_out, &Value::Array(docs).to_string());
    0
}

unsafe extern "C" fn collection_count(
    coll: *mut RawCollection,
    count_out: *mut u64,
    _err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let handle = coll_ref(coll);
    let store = handle.db.store.lock();
    if !count_out.is_null() {
        *count_out = store.coll(&handle.name).map_or(0, |c| c.docs.len() as u64);
    }
    0
}

unsafe extern "C" fn collection_find(
    coll: *mut RawCollection,
    filter: *const c_char,
    json_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let filter = parse_json(filter, "filter")?;
        let handle = coll_ref(coll);
        handle.db.record_read();
        let store = handle.db.store.lock();
        let docs: Vec<Value> = store
            .coll(&handle.name)
            .map(|c| {
                c.docs
                    .values()
                    .filter(|doc| engine::matches_filter(doc, &filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(Value::Array(docs))
    })();
    match result {
        Ok(docs) => {
            out_text(json_out, &docs.to_string());
            0
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn collection_find_one(
    coll: *mut RawCollection,
    filter: *const c_char,
    json_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let filter = parse_json(filter, "filter")?;
        let handle = coll_ref(coll);
        handle.db.record_read();
        let store = handle.db.store.lock();
        Ok(store.coll(&handle.name).and_then(|c| {
            c.docs
                .values()
                .find(|doc| engine::matches_filter(doc, &filter))
                .cloned()
        }))
    })();
    match result {
        Ok(Some(doc)) => {
            out_text(json_out, &doc.to_string());
            0
        }
        Ok(None) => {
            out_null(json_out);
            1
        }
        Err(e) => fail(err_out, e),
    }
}

/// Applies an update to every matching document, emitting update events.
unsafe fn update_matching(
    coll: *mut RawCollection,
    filter: *const c_char,
    update_json: *const c_char,
    first_only: bool,
) -> EResult<u64> {
    let handle = coll_ref(coll);
    handle.db.ensure_writable()?;
    let filter = parse_json(filter, "filter")?;
    let update = parse_json(update_json, "update")?;
    let mut events = Vec::new();
    {
        let mut store = handle.db.store.lock();
        let coll = store.coll_mut(&handle.name);
        let ids: Vec<String> = coll
            .docs
            .iter()
            .filter(|(_, doc)| engine::matches_filter(doc, &filter))
            .map(|(id, _)| id.clone())
            .take(if first_only { 1 } else { usize::MAX })
            .collect();
        for id in ids {
            if let Some(doc) = coll.docs.get_mut(&id) {
                engine::apply_update(doc, &update);
                events.push(WatchEvent {
                    collection: handle.name.clone(),
                    operation: "update",
                    id,
                    doc: Some(doc.clone()),
                });
            }
        }
    }
    let modified = events.len() as u64;
    if modified > 0 {
        handle.db.record_write();
        handle.db.emit(events);
    }
    Ok(modified)
}

unsafe extern "C" fn collection_update(
    coll: *mut RawCollection,
    filter: *const c_char,
    update_json: *const c_char,
    modified_out: *mut u64,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    match update_matching(coll, filter, update_json, false) {
        Ok(modified) => {
            if !modified_out.is_null() {
                *modified_out = modified;
            }
            0
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn collection_update_one(
    coll: *mut RawCollection,
    filter: *const c_char,
    update_json: *const c_char,
    updated_out: *mut bool,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    match update_matching(coll, filter, update_json, true) {
        Ok(modified) => {
            if !updated_out.is_null() {
                *updated_out = modified > 0;
            }
            0
        }
        Err(e) => fail(err_out, e),
    }
}

/// Deletes matching documents, emitting delete events.
unsafe fn delete_matching(
    coll: *mut RawCollection,
    filter: *const c_char,
    first_only: bool,
) -> EResult<u64> {
    let handle = coll_ref(coll);
    handle.db.ensure_writable()?;
    let filter = parse_json(filter, "filter")?;
    let mut events = Vec::new();
    {
        let mut store = handle.db.store.lock();
        let coll = store.coll_mut(&handle.name);
        let ids: Vec<String> = coll
            .docs
            .iter()
            .filter(|(_, doc)| engine::matches_filter(doc, &filter))
            .map(|(id, _)| id.clone())
            .take(if first_only { 1 } else { usize::MAX })
            .collect();
        for id in ids {
            coll.docs.remove(&id);
            events.push(WatchEvent {
                collection: handle.name.clone(),
                operation: "delete",
                id,
                doc: None,
            });
        }
    }
    let deleted = events.len() as u64;
    if deleted > 0 {
        handle.db.record_write();
        handle.db.emit(events);
    }
    Ok(deleted)
}

unsafe extern "C" fn collection_delete(
    coll: *mut RawCollection,
    filter: *const c_char,
    deleted_out: *mut u64,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    match delete_matching(coll, filter, false) {
        Ok(deleted) => {
            if !deleted_out.is_null() {
                *deleted_out = deleted;
            }
            0
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn collection_delete_one(
    coll: *mut RawCollection,
    filter: *const c_char,
    deleted_out: *mut bool,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    match delete_matching(coll, filter, true) {
        Ok(deleted) => {
            if !deleted_out.is_null() {
                *deleted_out = deleted > 0;
            }
            0
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn collection_upsert_by_id(
    coll: *mut RawCollection,
    id: *const c_char,
    doc_json: *const c_char,
    inserted_out: *mut i32,
    id_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let handle = coll_ref(coll);
        handle.db.ensure_writable()?;
        let id = cstr(id, "document id")?;
        let mut doc = parse_json(doc_json, "document")?;
        let (inserted, stored) = {
            let mut store = handle.db.store.lock();
            let exists = store
                .coll(&handle.name)
                .is_some_and(|c| c.docs.contains_key(id));
            if exists {
                (false, engine::update_by_id(&mut store, &handle.name, id, doc)?)
            } else {
                if let Some(obj) = doc.as_object_mut() {
                    obj.insert("_id".to_string(), Value::String(id.to_owned()));
                }
                let (_, stored) = engine::insert(&mut store, &handle.name, doc)?;
                (true, stored)
            }
        };
        handle.db.record_write();
        handle.db.emit(vec![WatchEvent {
            collection: handle.name.clone(),
            operation: if inserted { "insert" } else { "update" },
            id: id.to_owned(),
            doc: Some(stored),
        }]);
        Ok((id.to_owned(), inserted))
    })();
    match result {
        Ok((id, inserted)) => {
            if !inserted_out.is_null() {
                *inserted_out = i32::from(inserted);
            }
            out_text(id_out, &id);
            0
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn collection_upsert(
    coll: *mut RawCollection,
    filter: *const c_char,
    doc_json: *const c_char,
    inserted_out: *mut i32,
    id_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let handle = coll_ref(coll);
        handle.db.ensure_writable()?;
        let filter = parse_json(filter, "filter")?;
        let doc = parse_json(doc_json, "document")?;
        let existing = {
            let store = handle.db.store.lock();
            store.coll(&handle.name).and_then(|c| {
                c.docs
                    .iter()
                    .find(|(_, d)| engine::matches_filter(d, &filter))
                    .map(|(id, _)| id.clone())
            })
        };
        let (id, inserted, stored) = match existing {
            Some(id) => {
                let stored = {
                    let mut store = handle.db.store.lock();
                    engine::update_by_id(&mut store, &handle.name, &id, doc)?
                };
                (id, false, stored)
            }
            None => {
                let (id, stored) = {
                    let mut store = handle.db.store.lock();
                    engine::insert(&mut store, &handle.name, doc)?
                };
                (id, true, stored)
            }
        };
        handle.db.record_write();
        handle.db.emit(vec![WatchEvent {
            collection: handle.name.clone(),
            operation: if inserted { "insert" } else { "update" },
            id: id.clone(),
            doc: Some(stored),
        }]);
        Ok((id, inserted))
    })();
    match result {
        Ok((id, inserted)) => {
            if !inserted_out.is_null() {
                *inserted_out = i32::from(inserted);
            }
            out_text(id_out, &id);
            0
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn collection_distinct(
    coll: *mut RawCollection,
    field: *const c_char,
    json_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let field = cstr(field, "field")?;
        let handle = coll_ref(coll);
        handle.db.record_read();
        let store = handle.db.store.lock();
        let values = store
            .coll(&handle.name)
            .map(|c| engine::distinct(c, field))
            .unwrap_or_default();
        Ok(Value::Array(values))
    })();
    match result {
        Ok(values) => {
            out_text(json_out, &values.to_string());
            0
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn collection_count_distinct(
    coll: *mut RawCollection,
    field: *const c_char,
    count_out: *mut u64,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let field = cstr(field, "field")?;
        let handle = coll_ref(coll);
        let store = handle.db.store.lock();
        Ok(store
            .coll(&handle.name)
            .map_or(0, |c| engine::distinct(c, field).len() as u64))
    })();
    match result {
        Ok(count) => {
            if !count_out.is_null() {
                *count_out = count;
            }
            0
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn collection_search(
    coll: *mut RawCollection,
    query: *const c_char,
    json_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let query = cstr(query, "search query")?;
        let handle = coll_ref(coll);
        handle.db.record_read();
        let store = handle.db.store.lock();
        let docs = store
            .coll(&handle.name)
            .map(|c| engine::search(c, query))
            .unwrap_or_default();
        Ok(Value::Array(docs))
    })();
    match result {
        Ok(docs) => {
            out_text(json_out, &docs.to_string());
            0
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn collection_count_with_query(
    coll: *mut RawCollection,
    filter: *const c_char,
    count_out: *mut u64,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let filter = parse_json(filter, "filter")?;
        let handle = coll_ref(coll);
        let store = handle.db.store.lock();
        Ok(store.coll(&handle.name).map_or(0, |c| {
            c.docs
                .values()
                .filter(|doc| engine::matches_filter(doc, &filter))
                .count() as u64
        }))
    })();
    match result {
        Ok(count) => {
            if !count_out.is_null() {
                *count_out = count;
            }
            0
        }
        Err(e) => fail(err_out, e),
    }
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn collection_query_with_options(
    coll: *mut RawCollection,
    filter: *const c_char,
    sort_field: *const c_char,
    sort_ascending: bool,
    limit: u64,
    skip: u64,
    projection: *const c_char,
    exclusion: *const c_char,
    json_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let filter = opt_parse_json(filter, "filter")?;
        let sort_field = opt_cstr(sort_field, "sort field")?;
        let projection = match opt_parse_json(projection, "projection")? {
            Some(v) => Some(string_fields(&v, "projection")?),
            None => None,
        };
        let exclusion = match opt_parse_json(exclusion, "exclusion")? {
            Some(v) => Some(string_fields(&v, "exclusion")?),
            None => None,
        };
        let handle = coll_ref(coll);
        handle.db.record_read();
        let store = handle.db.store.lock();
        let docs = store
            .coll(&handle.name)
            .map(|c| {
                engine::run_query(
                    c,
                    filter.as_ref(),
                    sort_field,
                    sort_ascending,
                    limit,
                    skip,
                    projection.as_deref(),
                    exclusion.as_deref(),
                )
            })
            .unwrap_or_default();
        Ok(Value::Array(docs))
    })();
    match result {
        Ok(docs) => {
            out_text(json_out, &docs.to_string());
            0
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn collection_query_count(
    coll: *mut RawCollection,
    filter: *const c_char,
    skip: usize,
    limit: usize,
    count_out: *mut usize,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let filter = opt_parse_json(filter, "filter")?;
        let handle = coll_ref(coll);
        let store = handle.db.store.lock();
        let matched = store.coll(&handle.name).map_or(0, |c| {
            c.docs
                .values()
                .filter(|doc| filter.as_ref().is_none_or(|f| engine::matches_filter(doc, f)))
                .count()
        });
        let mut count = matched.saturating_sub(skip);
        if limit > 0 {
            count = count.min(limit);
        }
        Ok(count)
    })();
    match result {
        Ok(count) => {
            if !count_out.is_null() {
                *count_out = count;
            }
            0
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn collection_query_first(
    coll: *mut RawCollection,
    filter: *const c_char,
    sort_field: *const c_char,
    sort_ascending: bool,
    json_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let filter = opt_parse_json(filter, "filter")?;
        let sort_field = opt_cstr(sort_field, "sort field")?;
        let handle = coll_ref(coll);
        handle.db.record_read();
        let store = handle.db.store.lock();
        let docs = store
            .coll(&handle.name)
            .map(|c| {
                engine::run_query(c, filter.as_ref(), sort_field, sort_ascending, 1, 0, None, None)
            })
            .unwrap_or_default();
        Ok(docs.into_iter().next())
    })();
    match result {
        Ok(Some(doc)) => {
            out_text(json_out, &doc.to_string());
            0
        }
        Ok(None) => {
            out_null(json_out);
            1
        }
        Err(e) => fail(err_out, e),
    }
}

unsafe extern "C" fn collection_bulk_write(
    coll: *mut RawCollection,
    ops_json: *const c_char,
    ordered: bool,
    json_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let handle = coll_ref(coll);
        handle.db.ensure_writable()?;
        let ops = parse_json(ops_json, "operations")?;
        let ops = ops
            .as_array()
            .ok_or_else(|| EngineError::invalid("operations must be a JSON array"))?;
        if ops.len() > handle.db.options.max_bulk_operations {
            return Err(EngineError::invalid(format!(
                "batch of {} exceeds the bulk operation limit",
                ops.len()
            )));
        }

        let mut inserted = 0usize;
        let mut updated = 0usize;
        let mut deleted = 0usize;
        let mut item_errors: Vec<Value> = Vec::new();
        let mut events = Vec::new();

        {
            let mut store = handle.db.store.lock();
            for (index, op) in ops.iter().enumerate() {
                let outcome = apply_bulk_op(
                    &mut store,
                    &handle.name,
                    op,
                    &mut inserted,
                    &mut updated,
                    &mut deleted,
                    &mut events,
                );
                if let Err(e) = outcome {
                    item_errors.push(json!({
                        "operation_index": index,
                        "message": e.message,
                    }));
                    if ordered {
                        break;
                    }
                }
            }
        }

        if inserted + updated + deleted > 0 {
            handle.db.record_write();
            handle.db.emit(events);
        }
        Ok(json!({
            "inserted_count": inserted,
            "updated_count": updated,
            "deleted_count": deleted,
            "errors": item_errors,
        }))
    })();
    match result {
        Ok(report) => {
            out_text(json_out, &report.to_string());
            0
        }
        Err(e) => fail(err_out, e),
    }
}

/// One bulk operation. The `query` field may be JSON text or an inline
/// object; both shapes appear in the wild.
fn apply_bulk_op(
    store: &mut Store,
    coll_name: &str,
    op: &Value,
    inserted: &mut usize,
    updated: &mut usize,
    deleted: &mut usize,
    events: &mut Vec<WatchEvent>,
) -> EResult<()> {
    let obj = op
        .as_object()
        .ok_or_else(|| EngineError::invalid("operation must be an object"))?;
    let kind = obj
        .get("op")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::invalid("operation missing `op` field"))?;

    let query = |field: &str| -> EResult<Value> {
        match obj.get(field) {
            Some(Value::String(s)) => serde_json::from_str(s)
                .map_err(|e| EngineError::invalid(format!("invalid `{field}`: {e}"))),
            Some(v) => Ok(v.clone()),
            None => Err(EngineError::invalid(format!("operation missing `{field}`"))),
        }
    };

    match kind {
        "insert" => {
            let doc = obj
                .get("doc")
                .cloned()
                .ok_or_else(|| EngineError::invalid("insert missing `doc`"))?;
            let (id, stored) = engine::insert(store, coll_name, doc)?;
            *inserted += 1;
            events.push(WatchEvent {
                collection: coll_name.to_owned(),
                operation: "insert",
                id,
                doc: Some(stored),
            });
            Ok(())
        }
        "update_one" | "update_many" => {
            let filter = query("query")?;
            let update = obj
                .get("update")
                .cloned()
                .ok_or_else(|| EngineError::invalid("update missing `update`"))?;
            let coll = store.coll_mut(coll_name);
            let ids: Vec<String> = coll
                .docs
                .iter()
                .filter(|(_, doc)| engine::matches_filter(doc, &filter))
                .map(|(id, _)| id.clone())
                .take(if kind == "update_one" { 1 } else { usize::MAX })
                .collect();
            if ids.is_empty() {
                return Err(EngineError::not_found("no document matches the query"));
            }
            for id in ids {
                if let Some(doc) = coll.docs.get_mut(&id) {
                    engine::apply_update(doc, &update);
                    *updated += 1;
                    events.push(WatchEvent {
                        collection: coll_name.to_owned(),
                        operation: "update",
                        id,
                        doc: Some(doc.clone()),
                    });
                }
            }
            Ok(())
        }
        "delete_one" | "delete_many" => {
            let filter = query("query")?;
            let coll = store.coll_mut(coll_name);
            let ids: Vec<String> = coll
                .docs
                .iter()
                .filter(|(_, doc)| engine::matches_filter(doc, &filter))
                .map(|(id, _)| id.clone())
                .take(if kind == "delete_one" { 1 } else { usize::MAX })
                .collect();
            if ids.is_empty() {
                return Err(EngineError::not_found("no document matches the query"));
            }
            for id in ids {
                coll.docs.remove(&id);
                *deleted += 1;
                events.push(WatchEvent {
                    collection: coll_name.to_owned(),
                    operation: "delete",
                    id,
                    doc: None,
                });
            }
            Ok(())
        }
        other => Err(EngineError::invalid(format!("unknown operation `{other}`"))),
    }
}

unsafe extern "C" fn collection_aggregate(
    coll: *mut RawCollection,
    pipeline_json: *const c_char,
    json_out: *mut *mut c_char,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let pipeline = parse_json(pipeline_json, "pipeline")?;
        let pipeline = pipeline
            .as_array()
            .ok_or_else(|| EngineError::invalid("pipeline must be a JSON array"))?;
        let handle = coll_ref(coll);
        handle.db.record_read();
        let store = handle.db.store.lock();
        let docs = match store.coll(&handle.name) {
            Some(c) => engine::aggregate(c, pipeline)?,
            None => engine::aggregate(&Coll::default(), pipeline)?,
        };
        Ok(Value::Array(docs))
    })();
    match result {
        Ok(docs) => {
            out_text(json_out, &docs.to_string());
            0
        }
        Err(e) => fail(err_out, e),
    }
}

// ---------------------------------------------------------------------------
// Watch
// ---------------------------------------------------------------------------

unsafe extern "C" fn collection_watch_start(
    coll: *mut RawCollection,
    filter: *const c_char,
    callback: WatchCallback,
    user_data: *mut c_void,
    handle_out: *mut *mut RawWatch,
    err_out: *mut RawError,
) -> i32 {
    alloc::count_call();
    let result = (|| {
        let filter = match opt_cstr(filter, "filter")? {
            Some(text) => Some(
                serde_json::from_str::<Value>(text)
                    .map_err(|e| EngineError::invalid(format!("invalid filter: {e}")))?,
            ),
            None => None,
        };
        if handle_out.is_null() {
            return Err(EngineError::invalid("null handle out-pointer"));
        }
        let handle = coll_ref(coll);

        let (sender, receiver) = mpsc::channel::<WatchEvent>();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        // The pointer value is what crosses threads, never the pointee.
        let user_data_addr = user_data as usize;

        let thread = thread::spawn(move || {
            loop {
                if stop_for_thread.load(Ordering::Acquire) {
                    break;
                }
                match receiver.recv_timeout(Duration::from_millis(10)) {
                    Ok(event) => {
                        if stop_for_thread.load(Ordering::Acquire) {
                            break;
                        }
                        deliver(&event, callback, user_data_addr);
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        let watcher = Arc::new(Watcher {
            collection: handle.name.clone(),
            filter,
            sender: Mutex::new(Some(sender)),
            stop,
            thread: Mutex::new(Some(thread)),
        });
        handle.db.watchers.lock().push(Arc::clone(&watcher));

        let reg = Box::new(WatchReg {
            db: Arc::clone(&handle.db),
            watcher,
        });
        *handle_out = Box::into_raw(reg) as *mut RawWatch;
        Ok(())
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(err_out, e),
    }
}

fn deliver(event: &WatchEvent, callback: WatchCallback, user_data_addr: usize) {
    let collection = CString::new(event.collection.clone()).unwrap_or_default();
    let operation = CString::new(event.operation).unwrap_or_default();
    let id = CString::new(event.id.clone()).unwrap_or_default();
    let doc = event
        .doc
        .as_ref()
        .and_then(|d| CString::new(d.to_string()).ok());
    // Safety: the buffers live for the duration of the call, matching
    // the callback contract. user_data is the caller's opaque pointer.
    unsafe {
        callback(
            collection.as_ptr(),
            operation.as_ptr(),
            id.as_ptr(),
            doc.as_ref().map_or(ptr::null(), |d| d.as_ptr()),
            user_data_addr as *mut c_void,
        );
    }
}

unsafe extern "C" fn watch_stop(handle: *mut RawWatch) {
    alloc::count_call();
    if handle.is_null() {
        return;
    }
    let reg = Box::from_raw(handle as *mut WatchReg);
    reg.watcher.stop.store(true, Ordering::Release);
    // Disconnect the channel so the delivery thread wakes promptly.
    reg.watcher.sender.lock().take();
    if let Some(thread) = reg.watcher.thread.lock().take() {
        let _ = thread.join();
    }
    reg.db
        .watchers
        .lock()
        .retain(|w| !Arc::ptr_eq(w, &reg.watcher));
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

unsafe extern "C" fn free_string(s: *mut c_char) {
    alloc::count_call();
    alloc::take_string(s);
}

unsafe extern "C" fn free_error(err: RawError) {
    alloc::count_call();
    alloc::take_error(err);
}

/// Assembles the fake engine's call surface.
///
/// Every [`NativeApi`] from this function shares the global allocation
/// counters but nothing else; each `open` produces an independent
/// database.
#[must_use]
pub fn api() -> NativeApi {
    NativeApi::from_table(SymbolTable {
        open,
        open_with_options,
        close,
        default_database_options,
        default_transaction_options,
        set_transaction_options,
        get_transaction_options,
        set_auto_checkpoint_threshold,
        get_path,
        is_read_only,
        max_bulk_operations,
        max_document_size,
        max_request_body_size,
        list_collections,
        collection_stats,
        database_info,
        list_indexes,
        create_index,
        create_compound_index,
        create_text_index,
        drop_index,
        set_schema,
        get_schema,
        remove_schema,
        checkpoint,
        backup,
        verify_backup,
        garbage_collect,
        metrics,
        frame_count,
        start_server,
        stop_server,
        begin_transaction,
        commit,
        rollback,
        transaction_is_active,
        insert: tx_insert,
        find_by_id: tx_find_by_id,
        update_by_id: tx_update_by_id,
        delete_by_id: tx_delete_by_id,
        find_all: tx_find_all,
        count: tx_count,
        create_collection,
        drop_collection,
        rename_collection,
        get_collection,
        collection_free,
        collection_name,
        collection_insert,
        collection_find_by_id,
        collection_update_by_id,
        collection_delete_by_id,
        collection_find_all,
        collection_count,
        collection_find,
        collection_find_one,
        collection_update,
        collection_update_one,
        collection_delete,
        collection_delete_one,
        collection_upsert_by_id,
        collection_upsert,
        collection_insert_many,
        collection_distinct,
        collection_count_distinct,
        collection_search,
        collection_count_with_query,
        collection_query_with_options,
        collection_query_count,
        collection_query_first,
        collection_bulk_write,
        collection_aggregate,
        collection_watch_start,
        watch_stop,
        free_string,
        free_error,
    })
}

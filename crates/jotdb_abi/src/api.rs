//! The resolved call surface: one typed function pointer per entry point.

use crate::types::{
    RawCollection, RawDatabase, RawDatabaseOptions, RawError, RawServer, RawTransaction,
    RawTransactionOptions, RawWatch, WatchCallback,
};
use libloading::Library;
use std::ffi::{c_char, c_void};
use std::ops::Deref;
use std::path::Path;
use thiserror::Error;

/// Failure to bind the native call surface.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The shared library could not be opened at all.
    #[error("failed to load native library: {0}")]
    Library(#[source] libloading::Error),

    /// The library loaded but an expected entry point is missing.
    #[error("native library is missing symbol `{symbol}`")]
    MissingSymbol {
        /// Name of the unresolved entry point.
        symbol: &'static str,
        /// Underlying loader error.
        #[source]
        source: libloading::Error,
    },
}

/// Every entry point of the engine, as typed function pointers.
///
/// Each field corresponds to one exported symbol, `jotdb_` plus the field
/// name. Argument order and widths mirror the engine headers exactly.
/// Every fallible entry point takes a trailing `*mut RawError`; a zero
/// return (or non-null handle, for constructors) leaves the record empty.
#[allow(missing_docs)]
#[derive(Clone, Copy)]
pub struct SymbolTable {
    // Database management
    pub open: unsafe extern "C" fn(*const c_char, *mut RawError) -> *mut RawDatabase,
    pub open_with_options:
        unsafe extern "C" fn(*const c_char, RawDatabaseOptions, *mut RawError) -> *mut RawDatabase,
    pub close: unsafe extern "C" fn(*mut RawDatabase),
    pub default_database_options: unsafe extern "C" fn() -> RawDatabaseOptions,
    pub default_transaction_options: unsafe extern "C" fn() -> RawTransactionOptions,
    pub set_transaction_options:
        unsafe extern "C" fn(*mut RawDatabase, RawTransactionOptions, *mut RawError) -> i32,
    pub get_transaction_options:
        unsafe extern "C" fn(*mut RawDatabase, *mut RawTransactionOptions, *mut RawError) -> i32,
    pub set_auto_checkpoint_threshold:
        unsafe extern "C" fn(*mut RawDatabase, u64, *mut RawError) -> i32,
    pub get_path:
        unsafe extern "C" fn(*mut RawDatabase, *mut *mut c_char, *mut RawError) -> i32,
    pub is_read_only: unsafe extern "C" fn(*mut RawDatabase, *mut bool, *mut RawError) -> i32,
    pub max_bulk_operations: unsafe extern "C" fn(*mut RawDatabase, *mut RawError) -> usize,
    pub max_document_size: unsafe extern "C" fn(*mut RawDatabase, *mut RawError) -> usize,
    pub max_request_body_size: unsafe extern "C" fn(*mut RawDatabase, *mut RawError) -> usize,

    // Introspection
    pub list_collections:
        unsafe extern "C" fn(*mut RawDatabase, *mut *mut c_char, *mut RawError) -> i32,
    pub collection_stats: unsafe extern "C" fn(
        *mut RawDatabase,
        *const c_char,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,
    pub database_info:
        unsafe extern "C" fn(*mut RawDatabase, *mut *mut c_char, *mut RawError) -> i32,
    pub list_indexes: unsafe extern "C" fn(
        *mut RawDatabase,
        *const c_char,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,

    // Index management
    pub create_index: unsafe extern "C" fn(
        *mut RawDatabase,
        *const c_char,
        *const c_char,
        *const c_char,
        bool,
        *mut RawError,
    ) -> i32,
    pub create_compound_index: unsafe extern "C" fn(
        *mut RawDatabase,
        *const c_char,
        *const c_char,
        *const c_char, // fields as a JSON array of strings
        bool,
        *mut RawError,
    ) -> i32,
    pub create_text_index: unsafe extern "C" fn(
        *mut RawDatabase,
        *const c_char,
        *const c_char,
        *const c_char,
        *mut RawError,
    ) -> i32,
    pub drop_index: unsafe extern "C" fn(
        *mut RawDatabase,
        *const c_char,
        *const c_char,
        *mut RawError,
    ) -> i32,

    // Schema
    pub set_schema: unsafe extern "C" fn(
        *mut RawDatabase,
        *const c_char,
        *const c_char,
        *mut RawError,
    ) -> i32,
    pub get_schema: unsafe extern "C" fn(
        *mut RawDatabase,
        *const c_char,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,
    pub remove_schema:
        unsafe extern "C" fn(*mut RawDatabase, *const c_char, *mut RawError) -> i32,

    // Maintenance
    pub checkpoint: unsafe extern "C" fn(*mut RawDatabase, *mut RawError) -> i32,
    pub backup: unsafe extern "C" fn(*mut RawDatabase, *const c_char, *mut RawError) -> i32,
    pub verify_backup: unsafe extern "C" fn(
        *mut RawDatabase,
        *const c_char,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,
    pub garbage_collect:
        unsafe extern "C" fn(*mut RawDatabase, *mut *mut c_char, *mut RawError) -> i32,
    pub metrics: unsafe extern "C" fn(*mut RawDatabase, *mut *mut c_char, *mut RawError) -> i32,
    pub frame_count: unsafe extern "C" fn(*mut RawDatabase, *mut u64, *mut RawError) -> i32,

    // Web console
    pub start_server:
        unsafe extern "C" fn(*mut RawDatabase, *const c_char, *mut RawError) -> *mut RawServer,
    pub stop_server: unsafe extern "C" fn(*mut RawServer),

    // Transactions
    pub begin_transaction:
        unsafe extern "C" fn(*mut RawDatabase, *mut RawError) -> *mut RawTransaction,
    pub commit: unsafe extern "C" fn(*mut RawTransaction, *mut RawError) -> i32,
    pub rollback: unsafe extern "C" fn(*mut RawTransaction),
    pub transaction_is_active:
        unsafe extern "C" fn(*mut RawTransaction, *mut RawError) -> i32,
    pub insert: unsafe extern "C" fn(
        *mut RawTransaction,
        *const c_char,
        *const c_char,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,
    pub find_by_id: unsafe extern "C" fn(
        *mut RawTransaction,
        *const c_char,
        *const c_char,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,
    pub update_by_id: unsafe extern "C" fn(
        *mut RawTransaction,
        *const c_char,
        *const c_char,
        *const c_char,
        *mut RawError,
    ) -> i32,
    pub delete_by_id: unsafe extern "C" fn(
        *mut RawTransaction,
        *const c_char,
        *const c_char,
        *mut RawError,
    ) -> i32,
    pub find_all: unsafe extern "C" fn(
        *mut RawTransaction,
        *const c_char,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,
    pub count: unsafe extern "C" fn(
        *mut RawTransaction,
        *const c_char,
        *mut u64,
        *mut RawError,
    ) -> i32,
    pub create_collection:
        unsafe extern "C" fn(*mut RawTransaction, *const c_char, *mut RawError) -> i32,
    pub drop_collection:
        unsafe extern "C" fn(*mut RawTransaction, *const c_char, *mut RawError) -> i32,
    pub rename_collection: unsafe extern "C" fn(
        *mut RawTransaction,
        *const c_char,
        *const c_char,
        *mut RawError,
    ) -> i32,

    // Collections
    pub get_collection:
        unsafe extern "C" fn(*mut RawDatabase, *const c_char, *mut RawError) -> *mut RawCollection,
    pub collection_free: unsafe extern "C" fn(*mut RawCollection),
    pub collection_name:
        unsafe extern "C" fn(*mut RawCollection, *mut *mut c_char, *mut RawError) -> i32,
    pub collection_insert: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,
    pub collection_find_by_id: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,
    pub collection_update_by_id: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        *const c_char,
        *mut RawError,
    ) -> i32,
    pub collection_delete_by_id:
        unsafe extern "C" fn(*mut RawCollection, *const c_char, *mut RawError) -> i32,
    pub collection_find_all:
        unsafe extern "C" fn(*mut RawCollection, *mut *mut c_char, *mut RawError) -> i32,
    pub collection_count:
        unsafe extern "C" fn(*mut RawCollection, *mut u64, *mut RawError) -> i32,
    pub collection_find: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,
    pub collection_find_one: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,
    pub collection_update: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        *const c_char,
        *mut u64,
        *mut RawError,
    ) -> i32,
    pub collection_update_one: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        *const c_char,
        *mut bool,
        *mut RawError,
    ) -> i32,
    pub collection_delete: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        *mut u64,
        *mut RawError,
    ) -> i32,
    pub collection_delete_one: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        *mut bool,
        *mut RawError,
    ) -> i32,
    pub collection_upsert_by_id: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        *const c_char,
        *mut i32,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,
    pub collection_upsert: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        *const c_char,
        *mut i32,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,
    pub collection_insert_many: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,
    pub collection_distinct: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,
    pub collection_count_distinct: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        *mut u64,
        *mut RawError,
    ) -> i32,
    pub collection_search: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,
    pub collection_count_with_query: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        *mut u64,
        *mut RawError,
    ) -> i32,
    pub collection_query_with_options: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char, // filter, null for none
        *const c_char, // sort field, null for none
        bool,          // sort ascending
        u64,           // limit, 0 for none
        u64,           // skip
        *const c_char, // projection as a JSON array of field names
        *const c_char, // exclusion as a JSON array of field names
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,
    pub collection_query_count: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        usize,
        usize,
        *mut usize,
        *mut RawError,
    ) -> i32,
    pub collection_query_first: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        *const c_char,
        bool,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,
    pub collection_bulk_write: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        bool,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,
    pub collection_aggregate: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        *mut *mut c_char,
        *mut RawError,
    ) -> i32,

    // Watch
    pub collection_watch_start: unsafe extern "C" fn(
        *mut RawCollection,
        *const c_char,
        WatchCallback,
        *mut c_void,
        *mut *mut RawWatch,
        *mut RawError,
    ) -> i32,
    pub watch_stop: unsafe extern "C" fn(*mut RawWatch),

    // Memory
    pub free_string: unsafe extern "C" fn(*mut c_char),
    pub free_error: unsafe extern "C" fn(RawError),
}

/// A bound call surface: the symbol table plus whatever keeps it alive.
///
/// Obtained either by [`NativeApi::load`]ing the engine's shared library,
/// or from [`NativeApi::from_table`] when an in-process engine (such as the
/// testkit fake) supplies its own entry points.
pub struct NativeApi {
    table: SymbolTable,
    // Dropping the library would invalidate every pointer in `table`.
    _library: Option<Library>,
}

impl std::fmt::Debug for NativeApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeApi").finish_non_exhaustive()
    }
}

impl NativeApi {
    /// Resolves the full call surface from the engine's shared library.
    ///
    /// The library must already be present at `path`; locating or fetching
    /// it is the platform layer's job, not this crate's.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        // Safety: `libjotdb` has no load-time initializers with side effects.
        let library = unsafe { Library::new(path) }.map_err(LoadError::Library)?;

        macro_rules! sym {
            ($name:literal) => {
                unsafe {
                    *library
                        .get(concat!($name, "\0").as_bytes())
                        .map_err(|source| LoadError::MissingSymbol {
                            symbol: $name,
                            source,
                        })?
                }
            };
        }

        let table = SymbolTable {
            open: sym!("jotdb_open"),
            open_with_options: sym!("jotdb_open_with_options"),
            close: sym!("jotdb_close"),
            default_database_options: sym!("jotdb_default_database_options"),
            default_transaction_options: sym!("jotdb_default_transaction_options"),
            set_transaction_options: sym!("jotdb_set_transaction_options"),
            get_transaction_options: sym!("jotdb_get_transaction_options"),
            set_auto_checkpoint_threshold: sym!("jotdb_set_auto_checkpoint_threshold"),
            get_path: sym!("jotdb_get_path"),
            is_read_only: sym!("jotdb_is_read_only"),
            max_bulk_operations: sym!("jotdb_max_bulk_operations"),
            max_document_size: sym!("jotdb_max_document_size"),
            max_request_body_size: sym!("jotdb_max_request_body_size"),
            list_collections: sym!("jotdb_list_collections"),
            collection_stats: sym!("jotdb_collection_stats"),
            database_info: sym!("jotdb_database_info"),
            list_indexes: sym!("jotdb_list_indexes"),
            create_index: sym!("jotdb_create_index"),
            create_compound_index: sym!("jotdb_create_compound_index"),
            create_text_index: sym!("jotdb_create_text_index"),
            drop_index: sym!("jotdb_drop_index"),
            set_schema: sym!("jotdb_set_schema"),
            get_schema: sym!("jotdb_get_schema"),
            remove_schema: sym!("jotdb_remove_schema"),
            checkpoint: sym!("jotdb_checkpoint"),
            backup: sym!("jotdb_backup"),
            verify_backup: sym!("jotdb_verify_backup"),
            garbage_collect: sym!("jotdb_garbage_collect"),
            metrics: sym!("jotdb_metrics"),
            frame_count: sym!("jotdb_frame_count"),
            start_server: sym!("jotdb_start_server"),
            stop_server: sym!("jotdb_stop_server"),
            begin_transaction: sym!("jotdb_begin_transaction"),
            commit: sym!("jotdb_commit"),
            rollback: sym!("jotdb_rollback"),
            transaction_is_active: sym!("jotdb_transaction_is_active"),
            insert: sym!("jotdb_insert"),
            find_by_id: sym!("jotdb_find_by_id"),
            update_by_id: sym!("jotdb_update_by_id"),
            delete_by_id: sym!("jotdb_delete_by_id"),
            find_all: sym!("jotdb_find_all"),
            count: sym!("jotdb_count"),
            create_collection: sym!("jotdb_create_collection"),
            drop_collection: sym!("jotdb_drop_collection"),
            rename_collection: sym!("jotdb_rename_collection"),
            get_collection: sym!("jotdb_get_collection"),
            collection_free: sym!("jotdb_collection_free"),
            collection_name: sym!("jotdb_collection_name"),
            collection_insert: sym!("jotdb_collection_insert"),
            collection_find_by_id: sym!("jotdb_collection_find_by_id"),
            collection_update_by_id: sym!("jotdb_collection_update_by_id"),
            collection_delete_by_id: sym!("jotdb_collection_delete_by_id"),
            collection_find_all: sym!("jotdb_collection_find_all"),
            collection_count: sym!("jotdb_collection_count"),
            collection_find: sym!("jotdb_collection_find"),
            collection_find_one: sym!("jotdb_collection_find_one"),
            collection_update: sym!("jotdb_collection_update"),
            collection_update_one: sym!("jotdb_collection_update_one"),
            collection_delete: sym!("jotdb_collection_delete"),
            collection_delete_one: sym!("jotdb_collection_delete_one"),
            collection_upsert_by_id: sym!("jotdb_collection_upsert_by_id"),
            collection_upsert: sym!("jotdb_collection_upsert"),
            collection_insert_many: sym!("jotdb_collection_insert_many"),
            collection_distinct: sym!("jotdb_collection_distinct"),
            collection_count_distinct: sym!("jotdb_collection_count_distinct"),
            collection_search: sym!("jotdb_collection_search"),
            collection_count_with_query: sym!("jotdb_collection_count_with_query"),
            collection_query_with_options: sym!("jotdb_collection_query_with_options"),
            collection_query_count: sym!("jotdb_collection_query_count"),
            collection_query_first: sym!("jotdb_collection_query_first"),
            collection_bulk_write: sym!("jotdb_collection_bulk_write"),
            collection_aggregate: sym!("jotdb_collection_aggregate"),
            collection_watch_start: sym!("jotdb_collection_watch_start"),
            watch_stop: sym!("jotdb_watch_stop"),
            free_string: sym!("jotdb_free_string"),
            free_error: sym!("jotdb_free_error"),
        };

        Ok(Self {
            table,
            _library: Some(library),
        })
    }

    /// Wraps a table whose entry points live in the current process.
    pub fn from_table(table: SymbolTable) -> Self {
        Self {
            table,
            _library: None,
        }
    }

    /// The resolved entry points.
    pub fn table(&self) -> &SymbolTable {
        &self.table
    }
}

impl Deref for NativeApi {
    type Target = SymbolTable;

    fn deref(&self) -> &SymbolTable {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_reports_missing_library() {
        let err = NativeApi::load(Path::new("/nonexistent/libjotdb.so")).unwrap_err();
        assert!(matches!(err, LoadError::Library(_)));
    }
}

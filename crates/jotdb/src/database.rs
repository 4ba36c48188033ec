//! The database handle.

use crate::buffer::{check, consume_error, expect_text, to_cstring};
use crate::collection::Collection;
use crate::error::{Error, Result};
use crate::marshal::{self, BackupReport, CollectionStats, DatabaseInfo, GcReport, IndexInfo};
use crate::options::TransactionOptions;
use crate::server::ServerHandle;
use crate::transaction::Transaction;
use jotdb_abi::{NativeApi, RawDatabase, RawError, RawTransactionOptions};
use serde_json::Value;
use std::ffi::c_char;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use tracing::debug;

/// An open database.
///
/// Exactly one `Database` owns each native reference; the handle is not
/// clonable, only movable. Operations after [`Database::close`] are
/// rejected locally without reaching the engine. The binding adds no
/// locking of its own: callers serialize operations per handle, or rely
/// on the engine's internal locking.
pub struct Database {
    api: Arc<NativeApi>,
    ptr: AtomicPtr<RawDatabase>,
}

impl Database {
    pub(crate) fn new(api: Arc<NativeApi>, ptr: *mut RawDatabase) -> Self {
        Self {
            api,
            ptr: AtomicPtr::new(ptr),
        }
    }

    fn ptr(&self) -> Result<*mut RawDatabase> {
        let p = self.ptr.load(Ordering::Acquire);
        if p.is_null() {
            Err(Error::DatabaseClosed)
        } else {
            Ok(p)
        }
    }

    /// Whether the handle is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.ptr.load(Ordering::Acquire).is_null()
    }

    /// Closes the database, releasing the native reference.
    ///
    /// The release happens at most once even when close attempts race;
    /// a second explicit call is a usage error.
    pub fn close(&self) -> Result<()> {
        let p = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if p.is_null() {
            return Err(Error::DatabaseClosed);
        }
        // Safety: we won exclusive ownership of the reference in the swap.
        unsafe { (self.api.close)(p) };
        debug!("database closed");
        Ok(())
    }

    /// Begins a transaction.
    pub fn begin(&self) -> Result<Transaction> {
        let db = self.ptr()?;
        let mut err = RawError::empty();
        // Safety: `db` is a live handle; `err` is a valid out-parameter.
        let tx = unsafe { (self.api.begin_transaction)(db, &mut err) };
        if tx.is_null() {
            return Err(consume_error(&self.api, err));
        }
        Ok(Transaction::new(Arc::clone(&self.api), tx))
    }

    /// Opens a collection handle for non-transactional operations.
    ///
    /// The collection is created on first write if it does not exist.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        let db = self.ptr()?;
        let c_name = to_cstring(name)?;
        let mut err = RawError::empty();
        // Safety: as above.
        let coll = unsafe { (self.api.get_collection)(db, c_name.as_ptr(), &mut err) };
        if coll.is_null() {
            return Err(consume_error(&self.api, err));
        }
        Ok(Collection::new(Arc::clone(&self.api), coll))
    }

    /// Starts the embedded web console on `addr`.
    pub fn start_server(&self, addr: &str) -> Result<ServerHandle> {
        let db = self.ptr()?;
        let c_addr = to_cstring(addr)?;
        let mut err = RawError::empty();
        // Safety: as above.
        let srv = unsafe { (self.api.start_server)(db, c_addr.as_ptr(), &mut err) };
        if srv.is_null() {
            return Err(consume_error(&self.api, err));
        }
        debug!(addr, "web console started");
        Ok(ServerHandle::new(Arc::clone(&self.api), srv))
    }

    // Configuration

    /// Replaces the transaction retry options.
    pub fn set_transaction_options(&self, options: TransactionOptions) -> Result<()> {
        let db = self.ptr()?;
        let mut err = RawError::empty();
        // Safety: the record crosses by value.
        let status = unsafe { (self.api.set_transaction_options)(db, options.to_raw(), &mut err) };
        check(&self.api, status, err)?;
        Ok(())
    }

    /// Reads the active transaction retry options.
    pub fn transaction_options(&self) -> Result<TransactionOptions> {
        let db = self.ptr()?;
        let mut raw = RawTransactionOptions {
            max_retries: 0,
            retry_backoff_base_ms: 0,
            max_retry_backoff_ms: 0,
        };
        let mut err = RawError::empty();
        // Safety: `raw` is a valid out-parameter; the engine fully
        // populates it on success.
        let status = unsafe { (self.api.get_transaction_options)(db, &mut raw, &mut err) };
        check(&self.api, status, err)?;
        Ok(TransactionOptions::from_raw(raw))
    }

    /// Adjusts the automatic checkpoint threshold.
    pub fn set_auto_checkpoint_threshold(&self, frames: u64) -> Result<()> {
        let db = self.ptr()?;
        let mut err = RawError::empty();
        // Safety: plain integer argument.
        let status = unsafe { (self.api.set_auto_checkpoint_threshold)(db, frames, &mut err) };
        check(&self.api, status, err)?;
        Ok(())
    }

    // Introspection

    /// Filesystem path of the primary store.
    pub fn path(&self) -> Result<String> {
        let db = self.ptr()?;
        let mut out: *mut c_char = ptr::null_mut();
        let mut err = RawError::empty();
        // Safety: `out` receives an engine-allocated buffer on success.
        let status = unsafe { (self.api.get_path)(db, &mut out, &mut err) };
        check(&self.api, status, err)?;
        expect_text(&self.api, out)
    }

    /// Whether the database was opened read-only.
    pub fn is_read_only(&self) -> Result<bool> {
        let db = self.ptr()?;
        let mut value = false;
        let mut err = RawError::empty();
        // Safety: `value` is a valid bool out-parameter.
        let status = unsafe { (self.api.is_read_only)(db, &mut value, &mut err) };
        check(&self.api, status, err)?;
        Ok(value)
    }

    /// Configured bulk operation limit.
    pub fn max_bulk_operations(&self) -> Result<usize> {
        let db = self.ptr()?;
        let mut err = RawError::empty();
        // Safety: value-returning call with an error out-parameter.
        let value = unsafe { (self.api.max_bulk_operations)(db, &mut err) };
        if err.code != 0 {
            return Err(consume_error(&self.api, err));
        }
        Ok(value)
    }

    /// Configured maximum document size in bytes.
    pub fn max_document_size(&self) -> Result<usize> {
        let db = self.ptr()?;
        let mut err = RawError::empty();
        // Safety: as above.
        let value = unsafe { (self.api.max_document_size)(db, &mut err) };
        if err.code != 0 {
            return Err(consume_error(&self.api, err));
        }
        Ok(value)
    }

    /// Configured maximum request body size in bytes.
    pub fn max_request_body_size(&self) -> Result<usize> {
        let db = self.ptr()?;
        let mut err = RawError::empty();
        // Safety: as above.
        let value = unsafe { (self.api.max_request_body_size)(db, &mut err) };
        if err.code != 0 {
            return Err(consume_error(&self.api, err));
        }
        Ok(value)
    }

    /// Names of all collections, sorted.
    pub fn list_collections(&self) -> Result<Vec<String>> {
        let json = self.fetch_text(|db, out, err| unsafe {
            (self.api.list_collections)(db, out, err)
        })?;
        marshal::parse(&json)
    }

    /// Statistics for one collection.
    pub fn collection_stats(&self, name: &str) -> Result<CollectionStats> {
        let c_name = to_cstring(name)?;
        let json = self.fetch_text(|db, out, err| unsafe {
            (self.api.collection_stats)(db, c_name.as_ptr(), out, err)
        })?;
        marshal::parse(&json)
    }

    /// Database-wide introspection snapshot.
    pub fn info(&self) -> Result<DatabaseInfo> {
        let json = self.fetch_text(|db, out, err| unsafe {
            (self.api.database_info)(db, out, err)
        })?;
        marshal::parse(&json)
    }

    /// Indexes defined on a collection.
    pub fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>> {
        let c_name = to_cstring(collection)?;
        let json = self.fetch_text(|db, out, err| unsafe {
            (self.api.list_indexes)(db, c_name.as_ptr(), out, err)
        })?;
        marshal::parse(&json)
    }

    // Index management

    /// Creates a single-field index.
    pub fn create_index(
        &self,
        collection: &str,
        index: &str,
        field: &str,
        unique: bool,
    ) -> Result<()> {
        let db = self.ptr()?;
        let c_coll = to_cstring(collection)?;
        let c_index = to_cstring(index)?;
        let c_field = to_cstring(field)?;
        let mut err = RawError::empty();
        // Safety: all strings are valid NUL-terminated buffers.
        let status = unsafe {
            (self.api.create_index)(
                db,
                c_coll.as_ptr(),
                c_index.as_ptr(),
                c_field.as_ptr(),
                unique,
                &mut err,
            )
        };
        check(&self.api, status, err)?;
        Ok(())
    }

    /// Creates a compound index over several fields.
    pub fn create_compound_index(
        &self,
        collection: &str,
        index: &str,
        fields: &[&str],
        unique: bool,
    ) -> Result<()> {
        let db = self.ptr()?;
        let c_coll = to_cstring(collection)?;
        let c_index = to_cstring(index)?;
        let c_fields = marshal::encode_list(fields)?;
        let mut err = RawError::empty();
        // Safety: as above; field list crosses as JSON text.
        let status = unsafe {
            (self.api.create_compound_index)(
                db,
                c_coll.as_ptr(),
                c_index.as_ptr(),
                c_fields.as_ptr(),
                unique,
                &mut err,
            )
        };
        check(&self.api, status, err)?;
        Ok(())
    }

    /// Creates a full-text index on one field.
    pub fn create_text_index(&self, collection: &str, index: &str, field: &str) -> Result<()> {
        let db = self.ptr()?;
        let c_coll = to_cstring(collection)?;
        let c_index = to_cstring(index)?;
        let c_field = to_cstring(field)?;
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe {
            (self.api.create_text_index)(
                db,
                c_coll.as_ptr(),
                c_index.as_ptr(),
                c_field.as_ptr(),
                &mut err,
            )
        };
        check(&self.api, status, err)?;
        Ok(())
    }

    /// Drops an index.
    pub fn drop_index(&self, collection: &str, index: &str) -> Result<()> {
        let db = self.ptr()?;
        let c_coll = to_cstring(collection)?;
        let c_index = to_cstring(index)?;
        let mut err = RawError::empty();
        // Safety: as above.
        let status =
            unsafe { (self.api.drop_index)(db, c_coll.as_ptr(), c_index.as_ptr(), &mut err) };
        check(&self.api, status, err)?;
        Ok(())
    }

    // Schema

    /// Attaches a validation schema to a collection.
    ///
    /// The schema is passed through as opaque JSON; validation semantics
    /// live in the engine.
    pub fn set_schema(&self, collection: &str, schema: &Value) -> Result<()> {
        let db = self.ptr()?;
        let c_coll = to_cstring(collection)?;
        let c_schema = marshal::encode(schema)?;
        let mut err = RawError::empty();
        // Safety: as above.
        let status =
            unsafe { (self.api.set_schema)(db, c_coll.as_ptr(), c_schema.as_ptr(), &mut err) };
        check(&self.api, status, err)?;
        Ok(())
    }

    /// Reads a collection's schema, if one is set.
    pub fn schema(&self, collection: &str) -> Result<Option<Value>> {
        let db = self.ptr()?;
        let c_coll = to_cstring(collection)?;
        let mut out: *mut c_char = ptr::null_mut();
        let mut err = RawError::empty();
        // Safety: as above; status 1 means no schema and a null buffer.
        let status =
            unsafe { (self.api.get_schema)(db, c_coll.as_ptr(), &mut out, &mut err) };
        if check(&self.api, status, err)? == 1 {
            return Ok(None);
        }
        let json = expect_text(&self.api, out)?;
        Ok(Some(marshal::parse(&json)?))
    }

    /// Removes a collection's schema.
    pub fn remove_schema(&self, collection: &str) -> Result<()> {
        let db = self.ptr()?;
        let c_coll = to_cstring(collection)?;
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe { (self.api.remove_schema)(db, c_coll.as_ptr(), &mut err) };
        check(&self.api, status, err)?;
        Ok(())
    }

    // Maintenance

    /// Flushes buffered WAL content into the primary store.
    pub fn checkpoint(&self) -> Result<()> {
        let db = self.ptr()?;
        let mut err = RawError::empty();
        // Safety: handle plus error out-parameter only.
        let status = unsafe { (self.api.checkpoint)(db, &mut err) };
        check(&self.api, status, err)?;
        Ok(())
    }

    /// Writes a consistent backup to `dest`.
    pub fn backup(&self, dest: &str) -> Result<()> {
        let db = self.ptr()?;
        let c_dest = to_cstring(dest)?;
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe { (self.api.backup)(db, c_dest.as_ptr(), &mut err) };
        check(&self.api, status, err)?;
        Ok(())
    }

    /// Verifies a backup file.
    pub fn verify_backup(&self, path: &str) -> Result<BackupReport> {
        let c_path = to_cstring(path)?;
        let json = self.fetch_text(|db, out, err| unsafe {
            (self.api.verify_backup)(db, c_path.as_ptr(), out, err)
        })?;
        marshal::parse(&json)
    }

    /// Runs a garbage collection pass.
    pub fn garbage_collect(&self) -> Result<GcReport> {
        let json = self.fetch_text(|db, out, err| unsafe {
            (self.api.garbage_collect)(db, out, err)
        })?;
        marshal::parse(&json)
    }

    /// Engine metrics as free-form JSON.
    pub fn metrics(&self) -> Result<Value> {
        let json = self.fetch_text(|db, out, err| unsafe { (self.api.metrics)(db, out, err) })?;
        marshal::parse(&json)
    }

    /// Number of WAL frames not yet checkpointed.
    pub fn frame_count(&self) -> Result<u64> {
        let db = self.ptr()?;
        let mut count = 0u64;
        let mut err = RawError::empty();
        // Safety: `count` is a valid out-parameter.
        let status = unsafe { (self.api.frame_count)(db, &mut count, &mut err) };
        check(&self.api, status, err)?;
        Ok(count)
    }

    /// Runs a text-returning native call and copies out the buffer.
    fn fetch_text(
        &self,
        call: impl FnOnce(*mut RawDatabase, *mut *mut c_char, *mut RawError) -> i32,
    ) -> Result<String> {
        let db = self.ptr()?;
        let mut out: *mut c_char = ptr::null_mut();
        let mut err = RawError::empty();
        let status = call(db, &mut out, &mut err);
        check(&self.api, status, err)?;
        expect_text(&self.api, out)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let p = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if !p.is_null() {
            // Safety: the swap guarantees single release.
            unsafe { (self.api.close)(p) };
        }
    }
}

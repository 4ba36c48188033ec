//! The transaction handle.

use crate::buffer::{check, expect_text, to_cstring};
use crate::error::{Error, Result};
use crate::marshal::{self, Document};
use jotdb_abi::{NativeApi, RawError, RawTransaction};
use std::ffi::c_char;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::sync::Arc;

const ACTIVE: u8 = 0;
const COMMITTED: u8 = 1;
const ROLLED_BACK: u8 = 2;

/// An active transaction.
///
/// State machine: Active, then exactly one of Committed or RolledBack.
/// Both terminal states release the native reference exactly once; any
/// data operation afterwards is rejected locally. Dropping an active
/// transaction rolls it back.
pub struct Transaction {
    api: Arc<NativeApi>,
    ptr: AtomicPtr<RawTransaction>,
    state: AtomicU8,
}

impl Transaction {
    pub(crate) fn new(api: Arc<NativeApi>, ptr: *mut RawTransaction) -> Self {
        Self {
            api,
            ptr: AtomicPtr::new(ptr),
            state: AtomicU8::new(ACTIVE),
        }
    }

    fn ptr(&self) -> Result<*mut RawTransaction> {
        match self.state.load(Ordering::Acquire) {
            ACTIVE => Ok(self.ptr.load(Ordering::Acquire)),
            COMMITTED => Err(Error::TransactionCommitted),
            _ => Err(Error::TransactionRolledBack),
        }
    }

    /// Claims the native reference for a terminal transition.
    ///
    /// The compare-exchange is the single point deciding which close
    /// attempt wins; the loser gets a usage error and the native release
    /// function runs exactly once.
    fn finish(&self, next: u8) -> Result<*mut RawTransaction> {
        match self
            .state
            .compare_exchange(ACTIVE, next, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(self.ptr.swap(ptr::null_mut(), Ordering::AcqRel)),
            Err(COMMITTED) => Err(Error::TransactionCommitted),
            Err(_) => Err(Error::TransactionRolledBack),
        }
    }

    /// Whether the transaction is still active, as seen by the engine.
    ///
    /// Returns `false` without a native call once the transaction has
    /// finished locally.
    pub fn is_active(&self) -> Result<bool> {
        if self.state.load(Ordering::Acquire) != ACTIVE {
            return Ok(false);
        }
        let tx = self.ptr()?;
        let mut err = RawError::empty();
        // Safety: `tx` is live; positive status means active.
        let status = unsafe { (self.api.transaction_is_active)(tx, &mut err) };
        Ok(check(&self.api, status, err)? > 0)
    }

    /// Commits the transaction. Terminal.
    ///
    /// The native reference is released whether or not the commit
    /// succeeds; a conflict surfaces as a native error.
    pub fn commit(&self) -> Result<()> {
        let tx = self.finish(COMMITTED)?;
        let mut err = RawError::empty();
        // Safety: `finish` granted exclusive ownership of the reference.
        let status = unsafe { (self.api.commit)(tx, &mut err) };
        check(&self.api, status, err)?;
        Ok(())
    }

    /// Rolls the transaction back. Terminal.
    pub fn rollback(&self) -> Result<()> {
        let tx = self.finish(ROLLED_BACK)?;
        // Safety: as in `commit`; rollback reports no errors.
        unsafe { (self.api.rollback)(tx) };
        Ok(())
    }

    /// Inserts a document, returning its assigned id.
    ///
    /// If the document has no `_id`, the engine assigns one.
    pub fn insert(&self, collection: &str, doc: &Document) -> Result<String> {
        let tx = self.ptr()?;
        let c_coll = to_cstring(collection)?;
        let c_doc = marshal::encode(doc)?;
        let mut id_out: *mut c_char = ptr::null_mut();
        let mut err = RawError::empty();
        // Safety: valid strings in, engine-allocated id out.
        let status =
            unsafe { (self.api.insert)(tx, c_coll.as_ptr(), c_doc.as_ptr(), &mut id_out, &mut err) };
        check(&self.api, status, err)?;
        expect_text(&self.api, id_out)
    }

    /// Fetches a document by id.
    pub fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let tx = self.ptr()?;
        let c_coll = to_cstring(collection)?;
        let c_id = to_cstring(id)?;
        let mut out: *mut c_char = ptr::null_mut();
        let mut err = RawError::empty();
        // Safety: as above; status 1 plus a null buffer means not found.
        let status = unsafe {
            (self.api.find_by_id)(tx, c_coll.as_ptr(), c_id.as_ptr(), &mut out, &mut err)
        };
        if check(&self.api, status, err)? == 1 {
            return Ok(None);
        }
        let json = expect_text(&self.api, out)?;
        Ok(Some(marshal::parse(&json)?))
    }

    /// Replaces a document's content by id.
    pub fn update_by_id(&self, collection: &str, id: &str, doc: &Document) -> Result<()> {
        let tx = self.ptr()?;
        let c_coll = to_cstring(collection)?;
        let c_id = to_cstring(id)?;
        let c_doc = marshal::encode(doc)?;
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe {
            (self.api.update_by_id)(tx, c_coll.as_ptr(), c_id.as_ptr(), c_doc.as_ptr(), &mut err)
        };
        check(&self.api, status, err)?;
        Ok(())
    }

    /// Deletes a document by id.
    pub fn delete_by_id(&self, collection: &str, id: &str) -> Result<()> {
        let tx = self.ptr()?;
        let c_coll = to_cstring(collection)?;
        let c_id = to_cstring(id)?;
        let mut err = RawError::empty();
        // Safety: as above.
        let status =
            unsafe { (self.api.delete_by_id)(tx, c_coll.as_ptr(), c_id.as_ptr(), &mut err) };
        check(&self.api, status, err)?;
        Ok(())
    }

    /// All documents in a collection, as seen by this transaction.
    pub fn find_all(&self, collection: &str) -> Result<Vec<Document>> {
        let tx = self.ptr()?;
        let c_coll = to_cstring(collection)?;
        let mut out: *mut c_char = ptr::null_mut();
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe { (self.api.find_all)(tx, c_coll.as_ptr(), &mut out, &mut err) };
        check(&self.api, status, err)?;
        let json = expect_text(&self.api, out)?;
        marshal::parse(&json)
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> Result<u64> {
        let tx = self.ptr()?;
        let c_coll = to_cstring(collection)?;
        let mut count = 0u64;
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe { (self.api.count)(tx, c_coll.as_ptr(), &mut count, &mut err) };
        check(&self.api, status, err)?;
        Ok(count)
    }

    /// Creates a collection.
    pub fn create_collection(&self, name: &str) -> Result<()> {
        let tx = self.ptr()?;
        let c_name = to_cstring(name)?;
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe { (self.api.create_collection)(tx, c_name.as_ptr(), &mut err) };
        check(&self.api, status, err)?;
        Ok(())
    }

    /// Drops a collection and its documents.
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        let tx = self.ptr()?;
        let c_name = to_cstring(name)?;
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe { (self.api.drop_collection)(tx, c_name.as_ptr(), &mut err) };
        check(&self.api, status, err)?;
        Ok(())
    }

    /// Renames a collection.
    pub fn rename_collection(&self, old_name: &str, new_name: &str) -> Result<()> {
        let tx = self.ptr()?;
        let c_old = to_cstring(old_name)?;
        let c_new = to_cstring(new_name)?;
        let mut err = RawError::empty();
        // Safety: as above.
        let status =
            unsafe { (self.api.rename_collection)(tx, c_old.as_ptr(), c_new.as_ptr(), &mut err) };
        check(&self.api, status, err)?;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Ok(tx) = self.finish(ROLLED_BACK) {
            // Safety: `finish` granted exclusive ownership.
            unsafe { (self.api.rollback)(tx) };
        }
    }
}

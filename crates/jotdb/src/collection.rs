//! The collection handle and its two query front ends.
//!
//! A collection exposes a raw path (filter and update documents as free
//! text) and a structured path ([`QueryOptions`]: sort, skip, limit,
//! projection). They are independent entries into the engine; the
//! binding does not assume they are equivalent.

use crate::buffer::{check, expect_text, opt_cstring, opt_ptr, to_cstring};
use crate::error::{Error, Result};
use crate::marshal::{self, BulkWriteReport, Document, UpsertOutcome};
use crate::watch::{ChangeEvent, WatchHandle};
use jotdb_abi::{NativeApi, RawCollection, RawError};
use serde_json::Value;
use std::ffi::c_char;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

/// Options for the structured query path.
///
/// `limit == 0` means unlimited, matching the wire contract.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    filter: Option<String>,
    sort_field: Option<String>,
    sort_ascending: bool,
    limit: u64,
    skip: u64,
    projection: Option<Vec<String>>,
    exclusion: Option<Vec<String>>,
}

impl QueryOptions {
    /// Creates empty options: no filter, no sort, no paging.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sort_ascending: true,
            ..Self::default()
        }
    }

    /// Sets the filter document as JSON text.
    #[must_use]
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Sorts by a field.
    #[must_use]
    pub fn sort(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.sort_field = Some(field.into());
        self.sort_ascending = ascending;
        self
    }

    /// Limits the number of returned documents.
    #[must_use]
    pub const fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Skips leading documents.
    #[must_use]
    pub const fn skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    /// Returns only the named fields (plus `_id`).
    #[must_use]
    pub fn project(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.projection = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Drops the named fields from returned documents.
    #[must_use]
    pub fn exclude(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exclusion = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

/// A collection handle for non-transactional operations.
///
/// Each operation is its own atomic commit in the engine. The handle is
/// not clonable; operations after [`Collection::close`] are rejected
/// locally.
pub struct Collection {
    api: Arc<NativeApi>,
    ptr: AtomicPtr<RawCollection>,
}

impl Collection {
    pub(crate) fn new(api: Arc<NativeApi>, ptr: *mut RawCollection) -> Self {
        Self {
            api,
            ptr: AtomicPtr::new(ptr),
        }
    }

    fn ptr(&self) -> Result<*mut RawCollection> {
        let p = self.ptr.load(Ordering::Acquire);
        if p.is_null() {
            Err(Error::CollectionClosed)
        } else {
            Ok(p)
        }
    }

    /// Releases the native collection reference.
    pub fn close(&self) -> Result<()> {
        let p = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if p.is_null() {
            return Err(Error::CollectionClosed);
        }
        // Safety: the swap grants exclusive ownership of the reference.
        unsafe { (self.api.collection_free)(p) };
        Ok(())
    }

    /// The collection's name.
    pub fn name(&self) -> Result<String> {
        self.fetch_text(|coll, out, err| unsafe { (self.api.collection_name)(coll, out, err) })
    }

    /// Inserts a document, returning its assigned id.
    pub fn insert(&self, doc: &Document) -> Result<String> {
        let coll = self.ptr()?;
        let c_doc = marshal::encode(doc)?;
        let mut id_out: *mut c_char = ptr::null_mut();
        let mut err = RawError::empty();
        // Safety: valid document text in, engine-allocated id out.
        let status =
            unsafe { (self.api.collection_insert)(coll, c_doc.as_ptr(), &mut id_out, &mut err) };
        check(&self.api, status, err)?;
        expect_text(&self.api, id_out)
    }

    /// Inserts several documents, returning their ids in order.
    pub fn insert_many(&self, docs: &[Document]) -> Result<Vec<String>> {
        let c_docs = marshal::encode_list(docs)?;
        let json = self.fetch_text(|coll, out, err| unsafe {
            (self.api.collection_insert_many)(coll, c_docs.as_ptr(), out, err)
        })?;
        marshal::parse(&json)
    }

    /// Fetches a document by id.
    pub fn find_by_id(&self, id: &str) -> Result<Option<Document>> {
        let coll = self.ptr()?;
        let c_id = to_cstring(id)?;
        let mut out: *mut c_char = ptr::null_mut();
        let mut err = RawError::empty();
        // Safety: status 1 plus a null buffer means not found.
        let status = unsafe {
            (self.api.collection_find_by_id)(coll, c_id.as_ptr(), &mut out, &mut err)
        };
        if check(&self.api, status, err)? == 1 {
            return Ok(None);
        }
        let json = expect_text(&self.api, out)?;
        Ok(Some(marshal::parse(&json)?))
    }

    /// Replaces a document's content by id.
    pub fn update_by_id(&self, id: &str, doc: &Document) -> Result<()> {
        let coll = self.ptr()?;
        let c_id = to_cstring(id)?;
        let c_doc = marshal::encode(doc)?;
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe {
            (self.api.collection_update_by_id)(coll, c_id.as_ptr(), c_doc.as_ptr(), &mut err)
        };
        check(&self.api, status, err)?;
        Ok(())
    }

    /// Deletes a document by id.
    pub fn delete_by_id(&self, id: &str) -> Result<()> {
        let coll = self.ptr()?;
        let c_id = to_cstring(id)?;
        let mut err = RawError::empty();
        // Safety: as above.
        let status =
            unsafe { (self.api.collection_delete_by_id)(coll, c_id.as_ptr(), &mut err) };
        check(&self.api, status, err)?;
        Ok(())
    }

    /// All documents in the collection.
    pub fn find_all(&self) -> Result<Vec<Document>> {
        let json = self
            .fetch_text(|coll, out, err| unsafe { (self.api.collection_find_all)(coll, out, err) })?;
        marshal::parse(&json)
    }

    /// Number of documents in the collection.
    pub fn count(&self) -> Result<u64> {
        let coll = self.ptr()?;
        let mut count = 0u64;
        let mut err = RawError::empty();
        // Safety: `count` is a valid out-parameter.
        let status = unsafe { (self.api.collection_count)(coll, &mut count, &mut err) };
        check(&self.api, status, err)?;
        Ok(count)
    }

    // Raw filter/update front end

    /// Documents matching a filter given as JSON text.
    pub fn find(&self, filter: &str) -> Result<Vec<Document>> {
        let c_filter = to_cstring(filter)?;
        let json = self.fetch_text(|coll, out, err| unsafe {
            (self.api.collection_find)(coll, c_filter.as_ptr(), out, err)
        })?;
        marshal::parse(&json)
    }

    /// First document matching a filter, if any.
    pub fn find_one(&self, filter: &str) -> Result<Option<Document>> {
        let coll = self.ptr()?;
        let c_filter = to_cstring(filter)?;
        let mut out: *mut c_char = ptr::null_mut();
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe {
            (self.api.collection_find_one)(coll, c_filter.as_ptr(), &mut out, &mut err)
        };
        if check(&self.api, status, err)? == 1 {
            return Ok(None);
        }
        let json = expect_text(&self.api, out)?;
        Ok(Some(marshal::parse(&json)?))
    }

    /// Applies an update document to every match; returns the count.
    pub fn update(&self, filter: &str, update: &Document) -> Result<u64> {
        let coll = self.ptr()?;
        let c_filter = to_cstring(filter)?;
        let c_update = marshal::encode(update)?;
        let mut modified = 0u64;
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe {
            (self.api.collection_update)(
                coll,
                c_filter.as_ptr(),
                c_update.as_ptr(),
                &mut modified,
                &mut err,
            )
        };
        check(&self.api, status, err)?;
        Ok(modified)
    }

    /// Applies an update document to the first match; true if one existed.
    pub fn update_one(&self, filter: &str, update: &Document) -> Result<bool> {
        let coll = self.ptr()?;
        let c_filter = to_cstring(filter)?;
        let c_update = marshal::encode(update)?;
        let mut updated = false;
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe {
            (self.api.collection_update_one)(
                coll,
                c_filter.as_ptr(),
                c_update.as_ptr(),
                &mut updated,
                &mut err,
            )
        };
        check(&self.api, status, err)?;
        Ok(updated)
    }

    /// Deletes every match; returns the count.
    pub fn delete(&self, filter: &str) -> Result<u64> {
        let coll = self.ptr()?;
        let c_filter = to_cstring(filter)?;
        let mut deleted = 0u64;
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe {
            (self.api.collection_delete)(coll, c_filter.as_ptr(), &mut deleted, &mut err)
        };
        check(&self.api, status, err)?;
        Ok(deleted)
    }

    /// Deletes the first match; true if one existed.
    pub fn delete_one(&self, filter: &str) -> Result<bool> {
        let coll = self.ptr()?;
        let c_filter = to_cstring(filter)?;
        let mut deleted = false;
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe {
            (self.api.collection_delete_one)(coll, c_filter.as_ptr(), &mut deleted, &mut err)
        };
        check(&self.api, status, err)?;
        Ok(deleted)
    }

    /// Inserts or replaces the document with the given id.
    pub fn upsert_by_id(&self, id: &str, doc: &Document) -> Result<UpsertOutcome> {
        let coll = self.ptr()?;
        let c_id = to_cstring(id)?;
        let c_doc = marshal::encode(doc)?;
        let mut inserted = 0i32;
        let mut id_out: *mut c_char = ptr::null_mut();
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe {
            (self.api.collection_upsert_by_id)(
                coll,
                c_id.as_ptr(),
                c_doc.as_ptr(),
                &mut inserted,
                &mut id_out,
                &mut err,
            )
        };
        check(&self.api, status, err)?;
        Ok(UpsertOutcome {
            id: expect_text(&self.api, id_out)?,
            inserted: inserted != 0,
        })
    }

    /// Inserts or replaces the first document matching a filter.
    pub fn upsert(&self, filter: &str, doc: &Document) -> Result<UpsertOutcome> {
        let coll = self.ptr()?;
        let c_filter = to_cstring(filter)?;
        let c_doc = marshal::encode(doc)?;
        let mut inserted = 0i32;
        let mut id_out: *mut c_char = ptr::null_mut();
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe {
            (self.api.collection_upsert)(
                coll,
                c_filter.as_ptr(),
                c_doc.as_ptr(),
                &mut inserted,
                &mut id_out,
                &mut err,
            )
        };
        check(&self.api, status, err)?;
        Ok(UpsertOutcome {
            id: expect_text(&self.api, id_out)?,
            inserted: inserted != 0,
        })
    }

    /// Distinct values of a field across the collection.
    pub fn distinct(&self, field: &str) -> Result<Vec<Value>> {
        let c_field = to_cstring(field)?;
        let json = self.fetch_text(|coll, out, err| unsafe {
            (self.api.collection_distinct)(coll, c_field.as_ptr(), out, err)
        })?;
        marshal::parse(&json)
    }

    /// Number of distinct values of a field.
    pub fn count_distinct(&self, field: &str) -> Result<u64> {
        let coll = self.ptr()?;
        let c_field = to_cstring(field)?;
        let mut count = 0u64;
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe {
            (self.api.collection_count_distinct)(coll, c_field.as_ptr(), &mut count, &mut err)
        };
        check(&self.api, status, err)?;
        Ok(count)
    }

    /// Full-text search over text-indexed fields.
    pub fn search(&self, query: &str) -> Result<Vec<Document>> {
        let c_query = to_cstring(query)?;
        let json = self.fetch_text(|coll, out, err| unsafe {
            (self.api.collection_search)(coll, c_query.as_ptr(), out, err)
        })?;
        marshal::parse(&json)
    }

    /// Number of documents matching a filter.
    pub fn count_with_query(&self, filter: &str) -> Result<u64> {
        let coll = self.ptr()?;
        let c_filter = to_cstring(filter)?;
        let mut count = 0u64;
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe {
            (self.api.collection_count_with_query)(coll, c_filter.as_ptr(), &mut count, &mut err)
        };
        check(&self.api, status, err)?;
        Ok(count)
    }

    // Structured front end

    /// Runs a query through the structured options path.
    pub fn query(&self, options: &QueryOptions) -> Result<Vec<Document>> {
        let coll = self.ptr()?;
        let c_filter = opt_cstring(options.filter.as_deref())?;
        let c_sort = opt_cstring(options.sort_field.as_deref())?;
        let c_project = options
            .projection
            .as_deref()
            .map(marshal::encode_list)
            .transpose()?;
        let c_exclude = options
            .exclusion
            .as_deref()
            .map(marshal::encode_list)
            .transpose()?;
        let mut out: *mut c_char = ptr::null_mut();
        let mut err = RawError::empty();
        // Safety: optional strings cross as null pointers.
        let status = unsafe {
            (self.api.collection_query_with_options)(
                coll,
                opt_ptr(&c_filter),
                opt_ptr(&c_sort),
                options.sort_ascending,
                options.limit,
                options.skip,
                opt_ptr(&c_project),
                opt_ptr(&c_exclude),
                &mut out,
                &mut err,
            )
        };
        check(&self.api, status, err)?;
        let json = expect_text(&self.api, out)?;
        marshal::parse(&json)
    }

    /// Counts matches through the structured path, honoring skip/limit.
    pub fn query_count(&self, filter: Option<&str>, skip: usize, limit: usize) -> Result<usize> {
        let coll = self.ptr()?;
        let c_filter = opt_cstring(filter)?;
        let mut count = 0usize;
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe {
            (self.api.collection_query_count)(
                coll,
                opt_ptr(&c_filter),
                skip,
                limit,
                &mut count,
                &mut err,
            )
        };
        check(&self.api, status, err)?;
        Ok(count)
    }

    /// First document under an optional filter and sort.
    pub fn query_first(
        &self,
        filter: Option<&str>,
        sort_field: Option<&str>,
        sort_ascending: bool,
    ) -> Result<Option<Document>> {
        let coll = self.ptr()?;
        let c_filter = opt_cstring(filter)?;
        let c_sort = opt_cstring(sort_field)?;
        let mut out: *mut c_char = ptr::null_mut();
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe {
            (self.api.collection_query_first)(
                coll,
                opt_ptr(&c_filter),
                opt_ptr(&c_sort),
                sort_ascending,
                &mut out,
                &mut err,
            )
        };
        if check(&self.api, status, err)? == 1 {
            return Ok(None);
        }
        let json = expect_text(&self.api, out)?;
        Ok(Some(marshal::parse(&json)?))
    }

    /// Executes a list of operations in one engine transaction.
    ///
    /// Per-operation failures are reported inside the returned
    /// [`BulkWriteReport`]; only a failure of the call as a whole
    /// surfaces as an error.
    pub fn bulk_write(&self, operations: &[Value], ordered: bool) -> Result<BulkWriteReport> {
        let coll = self.ptr()?;
        let c_ops = marshal::encode_list(operations)?;
        let mut out: *mut c_char = ptr::null_mut();
        let mut err = RawError::empty();
        // Safety: as above.
        let status = unsafe {
            (self.api.collection_bulk_write)(coll, c_ops.as_ptr(), ordered, &mut out, &mut err)
        };
        check(&self.api, status, err)?;
        let json = expect_text(&self.api, out)?;
        marshal::parse(&json)
    }

    /// Runs an aggregation pipeline.
    pub fn aggregate(&self, pipeline: &[Value]) -> Result<Vec<Document>> {
        let c_pipeline = marshal::encode_list(pipeline)?;
        let json = self.fetch_text(|coll, out, err| unsafe {
            (self.api.collection_aggregate)(coll, c_pipeline.as_ptr(), out, err)
        })?;
        marshal::parse(&json)
    }

    /// Registers a change-notification handler for this collection.
    ///
    /// The handler runs on an engine-controlled thread for every
    /// matching mutation until [`WatchHandle::stop`] is called. Failures
    /// inside the handler are contained at the bridge and never reach
    /// the engine.
    pub fn watch<F>(&self, filter: Option<&str>, handler: F) -> Result<WatchHandle>
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let coll = self.ptr()?;
        WatchHandle::register(Arc::clone(&self.api), coll, filter, handler)
    }

    /// Runs a text-returning native call and copies out the buffer.
    fn fetch_text(
        &self,
        call: impl FnOnce(*mut RawCollection, *mut *mut c_char, *mut RawError) -> i32,
    ) -> Result<String> {
        let coll = self.ptr()?;
        let mut out: *mut c_char = ptr::null_mut();
        let mut err = RawError::empty();
        let status = call(coll, &mut out, &mut err);
        check(&self.api, status, err)?;
        expect_text(&self.api, out)
    }
}

impl Drop for Collection {
    fn drop(&mut self) {
        let p = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if !p.is_null() {
            // Safety: the swap guarantees single release.
            unsafe { (self.api.collection_free)(p) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_options_builder() {
        let opts = QueryOptions::new()
            .filter(r#"{"age": 30}"#)
            .sort("name", false)
            .limit(10)
            .skip(5)
            .project(["name", "age"]);

        assert_eq!(opts.filter.as_deref(), Some(r#"{"age": 30}"#));
        assert_eq!(opts.sort_field.as_deref(), Some("name"));
        assert!(!opts.sort_ascending);
        assert_eq!(opts.limit, 10);
        assert_eq!(opts.skip, 5);
        assert_eq!(opts.projection.as_deref().unwrap(), ["name", "age"]);
    }

    #[test]
    fn new_options_sort_ascending_by_default() {
        let opts = QueryOptions::new().sort("age", true);
        assert!(opts.sort_ascending);
    }
}

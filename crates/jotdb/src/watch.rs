//! Change-notification bridge.
//!
//! The engine delivers mutations asynchronously, from a thread the host
//! does not control, through a C function pointer. The bridge pins the
//! registered handler for the whole registration lifetime, marshals the
//! native buffers into host values before the handler runs, and contains
//! every handler failure so nothing unwinds into the native call frame.

use crate::buffer::{check, opt_cstring, opt_ptr};
use crate::error::{Error, Result};
use crate::marshal::Document;
use jotdb_abi::{NativeApi, RawCollection, RawError, RawWatch};
use parking_lot::Mutex;
use std::ffi::{c_char, c_void, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Kind of mutation a change event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A new document was inserted.
    Insert,
    /// An existing document was replaced or modified.
    Update,
    /// A document was removed.
    Delete,
}

impl ChangeKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// The wire name of this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// One change notification, fully marshalled into host values.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Collection the mutation happened in.
    pub collection: String,
    /// What happened.
    pub operation: ChangeKind,
    /// Id of the affected document.
    pub id: String,
    /// Document content; absent for deletes.
    pub document: Option<Document>,
}

type Handler = Box<dyn FnMut(ChangeEvent) + Send>;

/// Heap-pinned state shared with the engine as `user_data`.
///
/// The engine holds the raw pointer from registration until `watch_stop`
/// returns, so this box must outlive every possible invocation.
struct Trampoline {
    handler: Mutex<Handler>,
}

unsafe extern "C" fn deliver(
    collection: *const c_char,
    operation: *const c_char,
    doc_id: *const c_char,
    doc_json: *const c_char,
    user_data: *mut c_void,
) {
    // Marshal everything into host values first; the native buffers are
    // only valid for the duration of this call.
    let event = match marshal_event(collection, operation, doc_id, doc_json) {
        Some(event) => event,
        None => {
            warn!("malformed change notification dropped at bridge");
            return;
        }
    };

    let trampoline = &*(user_data as *const Trampoline);
    // A handler failure must never cross back into the native frame.
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        (trampoline.handler.lock())(event);
    }));
    if outcome.is_err() {
        warn!("watch handler panicked; notification discarded");
    }
}

unsafe fn marshal_event(
    collection: *const c_char,
    operation: *const c_char,
    doc_id: *const c_char,
    doc_json: *const c_char,
) -> Option<ChangeEvent> {
    if collection.is_null() || operation.is_null() || doc_id.is_null() {
        return None;
    }
    let collection = CStr::from_ptr(collection).to_str().ok()?.to_owned();
    let operation = ChangeKind::parse(CStr::from_ptr(operation).to_str().ok()?)?;
    let id = CStr::from_ptr(doc_id).to_str().ok()?.to_owned();
    let document = if doc_json.is_null() {
        None
    } else {
        let text = CStr::from_ptr(doc_json).to_str().ok()?;
        Some(serde_json::from_str(text).ok()?)
    };
    Some(ChangeEvent {
        collection,
        operation,
        id,
        document,
    })
}

/// An active watch registration.
///
/// Holds the native token and the pinned handler. [`WatchHandle::stop`]
/// releases the token first (the engine guarantees no delivery is in
/// flight once `watch_stop` returns) and only then lets go of the
/// handler, so no invocation can observe a released callable. Dropping
/// the handle stops it implicitly.
pub struct WatchHandle {
    api: Arc<NativeApi>,
    ptr: AtomicPtr<RawWatch>,
    trampoline: Option<Box<Trampoline>>,
}

impl WatchHandle {
    pub(crate) fn register<F>(
        api: Arc<NativeApi>,
        coll: *mut RawCollection,
        filter: Option<&str>,
        handler: F,
    ) -> Result<Self>
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let c_filter = opt_cstring(filter)?;
        let trampoline = Box::new(Trampoline {
            handler: Mutex::new(Box::new(handler) as Handler),
        });
        let user_data = &*trampoline as *const Trampoline as *mut c_void;

        let mut handle: *mut RawWatch = ptr::null_mut();
        let mut err = RawError::empty();
        // Safety: `user_data` points into the boxed trampoline, which
        // this handle keeps alive until after `watch_stop` returns.
        let status = unsafe {
            (api.collection_watch_start)(
                coll,
                opt_ptr(&c_filter),
                deliver,
                user_data,
                &mut handle,
                &mut err,
            )
        };
        check(&api, status, err)?;
        if handle.is_null() {
            return Err(Error::contract("watch registration returned no handle"));
        }
        debug!(filter = filter.unwrap_or(""), "watch registered");
        Ok(Self {
            api,
            ptr: AtomicPtr::new(handle),
            trampoline: Some(trampoline),
        })
    }

    /// Stops the watch.
    ///
    /// Blocks until the engine guarantees no further delivery; at most
    /// one already-dispatched notification completes during the call.
    /// A second explicit stop is a usage error.
    pub fn stop(&mut self) -> Result<()> {
        let p = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if p.is_null() {
            return Err(Error::WatchStopped);
        }
        // Safety: exclusive ownership via the swap. watch_stop joins the
        // delivery path, so dropping the trampoline afterwards is safe.
        unsafe { (self.api.watch_stop)(p) };
        self.trampoline = None;
        debug!("watch stopped");
        Ok(())
    }

    /// Whether the registration is still delivering.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.ptr.load(Ordering::Acquire).is_null()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        let p = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if !p.is_null() {
            // Safety: as in `stop`; trampoline drops after the join.
            unsafe { (self.api.watch_stop)(p) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_kind_wire_names() {
        assert_eq!(ChangeKind::parse("insert"), Some(ChangeKind::Insert));
        assert_eq!(ChangeKind::parse("update"), Some(ChangeKind::Update));
        assert_eq!(ChangeKind::parse("delete"), Some(ChangeKind::Delete));
        assert_eq!(ChangeKind::parse("upsert"), None);
        assert_eq!(ChangeKind::Delete.as_str(), "delete");
    }

    #[test]
    fn marshal_event_requires_mandatory_fields() {
        let collection = std::ffi::CString::new("users").unwrap();
        let operation = std::ffi::CString::new("insert").unwrap();
        let id = std::ffi::CString::new("doc1").unwrap();
        let body = std::ffi::CString::new(r#"{"a":1}"#).unwrap();

        let event = unsafe {
            marshal_event(
                collection.as_ptr(),
                operation.as_ptr(),
                id.as_ptr(),
                body.as_ptr(),
            )
        }
        .unwrap();
        assert_eq!(event.collection, "users");
        assert_eq!(event.operation, ChangeKind::Insert);
        assert_eq!(event.id, "doc1");
        assert!(event.document.is_some());

        let none = unsafe {
            marshal_event(
                std::ptr::null(),
                operation.as_ptr(),
                id.as_ptr(),
                std::ptr::null(),
            )
        };
        assert!(none.is_none());
    }

    #[test]
    fn delete_event_has_no_document() {
        let collection = std::ffi::CString::new("users").unwrap();
        let operation = std::ffi::CString::new("delete").unwrap();
        let id = std::ffi::CString::new("doc1").unwrap();

        let event = unsafe {
            marshal_event(
                collection.as_ptr(),
                operation.as_ptr(),
                id.as_ptr(),
                std::ptr::null(),
            )
        }
        .unwrap();
        assert_eq!(event.operation, ChangeKind::Delete);
        assert!(event.document.is_none());
    }
}

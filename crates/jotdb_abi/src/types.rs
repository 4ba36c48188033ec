//! Fixed-layout records and opaque handle types.
//!
//! Field order and width in the records below are part of the boundary
//! contract, not incidental. Reordering a field is an ABI break.

use std::ffi::{c_char, c_void};

/// An opaque database handle.
///
/// Points at engine-owned state. Never dereference or modify directly;
/// only pass it back to entry points that accept it.
#[repr(C)]
pub struct RawDatabase {
    _private: [u8; 0],
}

/// An opaque transaction handle.
#[repr(C)]
pub struct RawTransaction {
    _private: [u8; 0],
}

/// An opaque collection handle.
#[repr(C)]
pub struct RawCollection {
    _private: [u8; 0],
}

/// An opaque watch registration handle.
#[repr(C)]
pub struct RawWatch {
    _private: [u8; 0],
}

/// An opaque handle to the engine's embedded web console.
#[repr(C)]
pub struct RawServer {
    _private: [u8; 0],
}

/// Out-of-band error record populated by fallible entry points.
///
/// The engine guarantees `code == 0` if and only if `message` is null.
/// A non-null message is allocated by the engine and must be handed back
/// to `jotdb_free_error` exactly once.
#[repr(C)]
#[derive(Debug)]
pub struct RawError {
    /// Status code; zero means the record is empty.
    pub code: i32,
    /// Engine-allocated UTF-8 message, null on success.
    pub message: *mut c_char,
}

impl RawError {
    /// An empty record, ready to be passed as an out-parameter.
    pub fn empty() -> Self {
        Self {
            code: 0,
            message: std::ptr::null_mut(),
        }
    }
}

/// Database open options, passed by value.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawDatabaseOptions {
    /// Page cache size in pages.
    pub cache_size: usize,
    /// WAL frames accumulated before an automatic checkpoint.
    pub auto_checkpoint_threshold: u64,
    /// Unix permission bits applied to newly created database files.
    pub file_permissions: u32,
    /// Open the database in read-only mode.
    pub read_only: bool,
    /// Upper bound on operations in a single bulk write.
    pub max_bulk_operations: usize,
    /// Upper bound on a single document's encoded size in bytes.
    pub max_document_size: usize,
    /// Upper bound on a request body accepted by the web console.
    pub max_request_body_size: usize,
}

/// Transaction retry options, passed by value.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawTransactionOptions {
    /// Maximum commit retries on conflict.
    pub max_retries: usize,
    /// Base backoff between retries, milliseconds.
    pub retry_backoff_base_ms: u64,
    /// Backoff ceiling, milliseconds.
    pub max_retry_backoff_ms: u64,
}

/// Change-notification callback registered through `jotdb_collection_watch_start`.
///
/// Invoked by the engine, possibly from a thread the host does not control,
/// once per matching mutation. `doc_json` is null for deletes. All pointer
/// arguments are valid only for the duration of the call; the receiver must
/// copy anything it wants to keep.
pub type WatchCallback = unsafe extern "C" fn(
    collection: *const c_char,
    operation: *const c_char,
    doc_id: *const c_char,
    doc_json: *const c_char,
    user_data: *mut c_void,
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    #[test]
    fn error_record_layout() {
        // i32 + pointer, padded to pointer alignment.
        assert_eq!(
            size_of::<RawError>(),
            2 * size_of::<*mut c_char>().max(size_of::<i32>())
        );
        assert_eq!(align_of::<RawError>(), align_of::<*mut c_char>());
    }

    #[test]
    fn empty_error_is_clean() {
        let err = RawError::empty();
        assert_eq!(err.code, 0);
        assert!(err.message.is_null());
    }

    #[test]
    fn options_are_plain_old_data() {
        fn assert_copy<T: Copy>() {}
        assert_copy::<RawDatabaseOptions>();
        assert_copy::<RawTransactionOptions>();
    }
}

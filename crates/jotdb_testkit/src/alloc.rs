//! Counting allocator for boundary buffers.
//!
//! Every string the fake engine hands across the boundary is registered
//! here, and every release is checked against the registry. Tests use
//! the counters to prove the exactly-one-release property: never zero,
//! never two.

use jotdb_abi::RawError;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::ffi::{c_char, CString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

static LIVE_STRINGS: LazyLock<Mutex<HashSet<usize>>> = LazyLock::new(|| Mutex::new(HashSet::new()));
static LIVE_ERRORS: LazyLock<Mutex<HashSet<usize>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

static STRINGS_ALLOCATED: AtomicU64 = AtomicU64::new(0);
static STRINGS_FREED: AtomicU64 = AtomicU64::new(0);
static STRING_DOUBLE_FREES: AtomicU64 = AtomicU64::new(0);
static ERRORS_ALLOCATED: AtomicU64 = AtomicU64::new(0);
static ERRORS_FREED: AtomicU64 = AtomicU64::new(0);
static ERROR_DOUBLE_FREES: AtomicU64 = AtomicU64::new(0);
static NATIVE_CALLS: AtomicU64 = AtomicU64::new(0);

/// Records one native entry-point invocation.
pub(crate) fn count_call() {
    NATIVE_CALLS.fetch_add(1, Ordering::Relaxed);
}

/// Allocates an engine-owned string buffer and registers it.
pub(crate) fn give_string(s: &str) -> *mut c_char {
    // Interior NUL cannot cross; the fake mirrors an engine that
    // truncates rather than aborts.
    let cstring = CString::new(s.replace('\0', "")).unwrap_or_default();
    let ptr = cstring.into_raw();
    LIVE_STRINGS.lock().insert(ptr as usize);
    STRINGS_ALLOCATED.fetch_add(1, Ordering::Relaxed);
    ptr
}

/// Releases a string buffer previously produced by [`give_string`].
pub(crate) fn take_string(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    if LIVE_STRINGS.lock().remove(&(ptr as usize)) {
        // Safety: the registry proves this pointer came from give_string
        // and has not been freed yet.
        drop(unsafe { CString::from_raw(ptr) });
        STRINGS_FREED.fetch_add(1, Ordering::Relaxed);
    } else {
        STRING_DOUBLE_FREES.fetch_add(1, Ordering::Relaxed);
    }
}

/// Builds a populated error record with a registered message buffer.
pub(crate) fn give_error(code: i32, message: &str) -> RawError {
    let cstring = CString::new(message.replace('\0', "")).unwrap_or_default();
    let ptr = cstring.into_raw();
    LIVE_ERRORS.lock().insert(ptr as usize);
    ERRORS_ALLOCATED.fetch_add(1, Ordering::Relaxed);
    RawError { code, message: ptr }
}

/// Releases an error record's message buffer.
pub(crate) fn take_error(err: RawError) {
    if err.message.is_null() {
        return;
    }
    if LIVE_ERRORS.lock().remove(&(err.message as usize)) {
        // Safety: as in take_string.
        drop(unsafe { CString::from_raw(err.message) });
        ERRORS_FREED.fetch_add(1, Ordering::Relaxed);
    } else {
        ERROR_DOUBLE_FREES.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of the boundary accounting counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    /// String buffers handed across the boundary.
    pub strings_allocated: u64,
    /// String buffers released through `jotdb_free_string`.
    pub strings_freed: u64,
    /// Attempts to release a string that was not live.
    pub string_double_frees: u64,
    /// Error messages handed across the boundary.
    pub errors_allocated: u64,
    /// Error messages released through `jotdb_free_error`.
    pub errors_freed: u64,
    /// Attempts to release an error message that was not live.
    pub error_double_frees: u64,
    /// Total native entry-point invocations.
    pub native_calls: u64,
}

impl Counters {
    /// String buffers currently live (allocated, not yet freed).
    #[must_use]
    pub fn live_strings(&self) -> u64 {
        self.strings_allocated - self.strings_freed
    }

    /// Error messages currently live.
    #[must_use]
    pub fn live_errors(&self) -> u64 {
        self.errors_allocated - self.errors_freed
    }
}

/// Reads the current counter values.
#[must_use]
pub fn counters() -> Counters {
    Counters {
        strings_allocated: STRINGS_ALLOCATED.load(Ordering::Relaxed),
        strings_freed: STRINGS_FREED.load(Ordering::Relaxed),
        string_double_frees: STRING_DOUBLE_FREES.load(Ordering::Relaxed),
        errors_allocated: ERRORS_ALLOCATED.load(Ordering::Relaxed),
        errors_freed: ERRORS_FREED.load(Ordering::Relaxed),
        error_double_frees: ERROR_DOUBLE_FREES.load(Ordering::Relaxed),
        native_calls: NATIVE_CALLS.load(Ordering::Relaxed),
    }
}

static EXCLUSIVE: Mutex<()> = Mutex::new(());

/// Serializes counter-sensitive tests.
///
/// The registry is process-global; tests asserting counter deltas hold
/// this guard so parallel tests do not interleave allocations.
#[must_use]
pub fn exclusive() -> parking_lot::MutexGuard<'static, ()> {
    EXCLUSIVE.lock()
}

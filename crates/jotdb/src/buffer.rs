//! Buffer ownership protocol.
//!
//! Every text output crossing the boundary is allocated by the engine.
//! The binding copies the bytes into host-owned strings immediately and
//! returns the original pointer to the matching engine release function,
//! never to a general-purpose deallocator. A buffer is read before
//! release, never after, and released exactly once.

use crate::error::{Error, Result};
use jotdb_abi::{NativeApi, RawError};
use std::ffi::{c_char, CStr, CString};

/// An engine-allocated text buffer, released on drop.
struct OwnedText<'a> {
    api: &'a NativeApi,
    ptr: *mut c_char,
}

impl<'a> OwnedText<'a> {
    fn copy_out(&self) -> Result<String> {
        // Safety: the engine handed us a valid NUL-terminated buffer and
        // will not touch it until we release it.
        let bytes = unsafe { CStr::from_ptr(self.ptr) };
        match bytes.to_str() {
            Ok(s) => Ok(s.to_owned()),
            Err(_) => Err(Error::contract("engine returned a non-UTF-8 buffer")),
        }
    }
}

impl<'a> Drop for OwnedText<'a> {
    fn drop(&mut self) {
        // Safety: `ptr` came from the engine and has not been released.
        unsafe { (self.api.free_string)(self.ptr) };
    }
}

/// Copies an optional engine buffer into a host string and releases it.
///
/// A null pointer is a legitimate "no value" and yields `None`.
pub(crate) fn take_text(api: &NativeApi, ptr: *mut c_char) -> Result<Option<String>> {
    if ptr.is_null() {
        return Ok(None);
    }
    let owned = OwnedText { api, ptr };
    owned.copy_out().map(Some)
}

/// Like [`take_text`], but a null pointer breaks the success contract.
pub(crate) fn expect_text(api: &NativeApi, ptr: *mut c_char) -> Result<String> {
    take_text(api, ptr)?
        .ok_or_else(|| Error::contract("engine returned success but no output buffer"))
}

/// Converts a call status plus error record into a host-level result.
///
/// Negative status means failure: the record's message is copied out and
/// the record handed back to `jotdb_free_error` exactly once. Zero and
/// positive statuses pass through so callers can distinguish secondary
/// success codes (for example "not found").
pub(crate) fn check(api: &NativeApi, status: i32, err: RawError) -> Result<i32> {
    if status >= 0 {
        Ok(status)
    } else {
        Err(consume_error(api, err))
    }
}

/// Converts a populated error record into [`Error::Native`], releasing
/// the message buffer.
pub(crate) fn consume_error(api: &NativeApi, err: RawError) -> Error {
    if err.message.is_null() {
        // code!=0 guarantees a message; its absence is the engine's bug.
        return Error::contract(format!(
            "native call failed with code {} but no message",
            err.code
        ));
    }
    let code = err.code;
    // Safety: non-null message is a valid engine-allocated string.
    let message = unsafe { CStr::from_ptr(err.message) }
        .to_string_lossy()
        .into_owned();
    // Safety: the record is consumed here and never touched again.
    unsafe { (api.free_error)(err) };
    Error::Native { code, message }
}

/// Prepares a host string for the boundary.
pub(crate) fn to_cstring(s: &str) -> Result<CString> {
    Ok(CString::new(s)?)
}

/// Prepares an optional host string; `None` crosses as a null pointer.
pub(crate) fn opt_cstring(s: Option<&str>) -> Result<Option<CString>> {
    s.map(to_cstring).transpose()
}

/// Pointer for an optional C string, null when absent.
pub(crate) fn opt_ptr(s: &Option<CString>) -> *const c_char {
    s.as_ref().map_or(std::ptr::null(), |c| c.as_ptr())
}

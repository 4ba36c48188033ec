//! Handle for the engine's embedded web console.

use crate::error::{Error, Result};
use jotdb_abi::{NativeApi, RawServer};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A running web console.
///
/// The console serves until [`ServerHandle::stop`] is called or the
/// handle is dropped. A second explicit stop is a usage error.
pub struct ServerHandle {
    api: Arc<NativeApi>,
    ptr: AtomicPtr<RawServer>,
}

impl ServerHandle {
    pub(crate) fn new(api: Arc<NativeApi>, ptr: *mut RawServer) -> Self {
        Self {
            api,
            ptr: AtomicPtr::new(ptr),
        }
    }

    /// Stops the console and releases the native reference.
    pub fn stop(&mut self) -> Result<()> {
        let p = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if p.is_null() {
            return Err(Error::ServerStopped);
        }
        // Safety: the swap grants exclusive ownership.
        unsafe { (self.api.stop_server)(p) };
        debug!("web console stopped");
        Ok(())
    }

    /// Whether the console is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.ptr.load(Ordering::Acquire).is_null()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let p = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if !p.is_null() {
            // Safety: the swap guarantees single release.
            unsafe { (self.api.stop_server)(p) };
        }
    }
}

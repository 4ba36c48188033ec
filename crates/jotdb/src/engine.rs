//! Entry point binding the native engine into the host process.

use crate::buffer::{consume_error, to_cstring};
use crate::database::Database;
use crate::error::Result;
use crate::options::{DatabaseOptions, TransactionOptions};
use jotdb_abi::{NativeApi, RawError};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// A bound native engine.
///
/// Holds the resolved call surface and hands out [`Database`] handles.
/// Cloning is cheap; all clones share one symbol table.
#[derive(Clone)]
pub struct Engine {
    api: Arc<NativeApi>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Binds the engine from its shared library.
    ///
    /// The library must already exist at `path`; locating or downloading
    /// it is a packaging concern outside this crate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let api = NativeApi::load(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "native engine bound");
        Ok(Self { api: Arc::new(api) })
    }

    /// Wraps an already-resolved call surface.
    ///
    /// Used by in-process engines, notably the testkit fake.
    pub fn from_api(api: NativeApi) -> Self {
        Self { api: Arc::new(api) }
    }

    /// Opens a database with engine-default options.
    pub fn open(&self, path: &str) -> Result<Database> {
        let c_path = to_cstring(path)?;
        let mut err = RawError::empty();
        // Safety: arguments match the declared signature; `err` is a valid
        // out-parameter for the duration of the call.
        let ptr = unsafe { (self.api.open)(c_path.as_ptr(), &mut err) };
        if ptr.is_null() {
            return Err(consume_error(&self.api, err));
        }
        debug!(path, "database opened");
        Ok(Database::new(Arc::clone(&self.api), ptr))
    }

    /// Opens a database with explicit options.
    ///
    /// `options` must have originated from [`Engine::default_database_options`];
    /// partially populated records never cross the boundary.
    pub fn open_with_options(&self, path: &str, options: DatabaseOptions) -> Result<Database> {
        let c_path = to_cstring(path)?;
        let mut err = RawError::empty();
        // Safety: as in `open`; the options record crosses by value.
        let ptr = unsafe { (self.api.open_with_options)(c_path.as_ptr(), options.to_raw(), &mut err) };
        if ptr.is_null() {
            return Err(consume_error(&self.api, err));
        }
        debug!(path, read_only = options.read_only, "database opened");
        Ok(Database::new(Arc::clone(&self.api), ptr))
    }

    /// Returns the engine's default database options.
    ///
    /// A pure factory call: no process-wide state is read or written.
    #[must_use]
    pub fn default_database_options(&self) -> DatabaseOptions {
        // Safety: no arguments, returns a record by value.
        DatabaseOptions::from_raw(unsafe { (self.api.default_database_options)() })
    }

    /// Returns the engine's default transaction options.
    #[must_use]
    pub fn default_transaction_options(&self) -> TransactionOptions {
        // Safety: no arguments, returns a record by value.
        TransactionOptions::from_raw(unsafe { (self.api.default_transaction_options)() })
    }

    pub(crate) fn api(&self) -> &Arc<NativeApi> {
        &self.api
    }
}

//! # JotDB
//!
//! Safe Rust binding for the JotDB native document database engine.
//!
//! The engine is a C library with manual memory management; this crate
//! reconciles that with Rust's ownership model:
//! - every fallible call reports failure through an out-of-band error
//!   record, converted into [`Error`] synchronously at the call site;
//! - every engine-allocated buffer is copied into host memory and
//!   released through the matching engine deallocator exactly once;
//! - every native reference is owned by exactly one handle with a
//!   tracked open/closed state, so use-after-close is rejected locally
//!   and double release cannot happen even under racing close attempts;
//! - change notifications cross through a pinned trampoline that keeps
//!   the handler alive for the registration's lifetime and contains its
//!   failures.
//!
//! # Example
//!
//! ```rust,ignore
//! use jotdb::Engine;
//! use serde_json::json;
//!
//! let engine = Engine::load("path/to/libjotdb.so")?;
//! let db = engine.open("./app.jot")?;
//! let users = db.collection("users")?;
//!
//! let id = users.insert(&json!({"name": "Alice", "age": 30}))?;
//! let doc = users.find_by_id(&id)?;
//!
//! let handle = users.watch(None, |event| {
//!     println!("{} {}", event.operation.as_str(), event.id);
//! })?;
//! // ... later
//! # let mut handle = handle;
//! handle.stop()?;
//! ```

mod buffer;
mod collection;
mod database;
mod engine;
mod error;
mod marshal;
mod options;
mod server;
mod transaction;
mod watch;

pub use jotdb_abi as abi;

pub use collection::{Collection, QueryOptions};
pub use database::Database;
pub use engine::Engine;
pub use error::{Error, Result};
pub use marshal::{
    BackupReport, BulkWriteItemError, BulkWriteReport, CollectionStats, DatabaseInfo, Document,
    GcReport, IndexInfo, UpsertOutcome,
};
pub use options::{DatabaseOptions, TransactionOptions};
pub use server::ServerHandle;
pub use transaction::Transaction;
pub use watch::{ChangeEvent, ChangeKind, WatchHandle};

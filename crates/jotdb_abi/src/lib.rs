//! # JotDB ABI
//!
//! Raw C call surface of the JotDB native engine (`libjotdb`).
//!
//! This crate is the single place where the boundary contract is written
//! down: every entry point's name, argument order, widths and signedness,
//! and every fixed-layout record that crosses by value or by reference.
//! There is no run-time negotiation: if the engine's signatures change,
//! this declaration must change in lock-step, or calls through a stale
//! table are undefined behavior.
//!
//! The crate deliberately contains no policy: ownership conventions,
//! error mapping and handle state live in the `jotdb` crate on top.

mod api;
mod types;

pub use api::{LoadError, NativeApi, SymbolTable};
pub use types::{
    RawCollection, RawDatabase, RawDatabaseOptions, RawError, RawServer, RawTransaction,
    RawTransactionOptions, RawWatch, WatchCallback,
};

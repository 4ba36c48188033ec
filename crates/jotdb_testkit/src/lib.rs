//! # JotDB Testkit
//!
//! A counting, in-process fake of the JotDB native engine.
//!
//! The fake implements the full call surface declared in `jotdb_abi`
//! and is wired into the binding through [`api`], so the binding layer
//! can be exercised without a native library. On top of plausible
//! engine behavior it keeps a global ledger of every buffer handed
//! across the boundary, making the ownership protocol testable:
//!
//! ```rust,ignore
//! let _guard = jotdb_testkit::exclusive();
//! let before = jotdb_testkit::counters();
//! // ... drive the binding ...
//! let after = jotdb_testkit::counters();
//! assert_eq!(after.live_strings(), before.live_strings());
//! assert_eq!(after.string_double_frees, before.string_double_frees);
//! ```
//!
//! Error codes the fake reports: 1 generic, 2 invalid argument,
//! 3 not found, 4 conflict (duplicate id, unique index violation),
//! 5 read-only.
//!
//! Semantics are intentionally small (equality filters, `$set`-or-merge
//! updates, `$match`/`$count`/`$sort`/`$skip`/`$limit` aggregation)
//! since the binding under test never interprets payloads itself.

mod alloc;
mod engine;
mod surface;

pub use alloc::{counters, exclusive, Counters};
pub use surface::api;

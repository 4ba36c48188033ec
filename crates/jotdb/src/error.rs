//! Error types for the binding layer.
//!
//! Three failure families cross here, per the boundary design:
//! native errors reported through the out-of-band error record, usage
//! errors detected locally without touching the engine, and contract
//! violations where the engine broke its own guarantees.

use thiserror::Error;

/// Result type for binding operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the binding layer.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine reported a failure through the error record.
    ///
    /// The message text is informational only; match on `code` when a
    /// stable distinction is needed.
    #[error("native error {code}: {message}")]
    Native {
        /// Engine status code, never zero.
        code: i32,
        /// Engine-supplied message.
        message: String,
    },

    /// Operation attempted on a closed database handle.
    #[error("database is closed")]
    DatabaseClosed,

    /// Operation attempted on a closed collection handle.
    #[error("collection is closed")]
    CollectionClosed,

    /// Data operation attempted after the transaction committed.
    #[error("transaction already committed")]
    TransactionCommitted,

    /// Data operation attempted after the transaction rolled back.
    #[error("transaction already rolled back")]
    TransactionRolledBack,

    /// `stop` called on a watch registration that was already stopped.
    #[error("watch already stopped")]
    WatchStopped,

    /// `stop` called on a server handle that was already stopped.
    #[error("server already stopped")]
    ServerStopped,

    /// The engine violated the boundary contract (for example a null
    /// buffer where success guarantees a value). Never silently
    /// substituted with a default.
    #[error("boundary contract violation: {message}")]
    Contract {
        /// What the engine did wrong.
        message: String,
    },

    /// A payload could not be serialized or parsed as JSON.
    #[error("payload error: {0}")]
    Json(#[from] serde_json::Error),

    /// A host string cannot cross the boundary because it contains an
    /// interior NUL byte.
    #[error("string contains an interior NUL byte")]
    InteriorNul(#[from] std::ffi::NulError),

    /// The native call surface could not be bound.
    #[error(transparent)]
    Load(#[from] jotdb_abi::LoadError),
}

impl Error {
    /// Creates a contract-violation error.
    pub(crate) fn contract(message: impl Into<String>) -> Self {
        Self::Contract {
            message: message.into(),
        }
    }

    /// Returns the engine status code if this is a native error.
    #[must_use]
    pub fn native_code(&self) -> Option<i32> {
        match self {
            Self::Native { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True for errors raised locally without any native call.
    #[must_use]
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::DatabaseClosed
                | Self::CollectionClosed
                | Self::TransactionCommitted
                | Self::TransactionRolledBack
                | Self::WatchStopped
                | Self::ServerStopped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_code_accessor() {
        let err = Error::Native {
            code: 4,
            message: "conflict".into(),
        };
        assert_eq!(err.native_code(), Some(4));
        assert!(!err.is_usage());
    }

    #[test]
    fn usage_errors_are_flagged() {
        assert!(Error::DatabaseClosed.is_usage());
        assert!(Error::TransactionCommitted.is_usage());
        assert!(!Error::contract("x").is_usage());
    }
}

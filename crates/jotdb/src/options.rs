//! Database and transaction options.
//!
//! Options follow a strict read-modify-write pattern: the engine's
//! default-options factory produces a fully populated record, selected
//! fields are overridden, and the whole record is passed back by value.
//! There is deliberately no `Default` impl on the host side: a record
//! that did not originate from the engine factory must never cross the
//! boundary.

use jotdb_abi::{RawDatabaseOptions, RawTransactionOptions};

/// Options controlling how a database is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseOptions {
    /// Page cache size in pages.
    pub cache_size: usize,
    /// WAL frames accumulated before an automatic checkpoint.
    pub auto_checkpoint_threshold: u64,
    /// Unix permission bits for newly created database files.
    pub file_permissions: u32,
    /// Open in read-only mode.
    pub read_only: bool,
    /// Upper bound on operations in a single bulk write.
    pub max_bulk_operations: usize,
    /// Upper bound on a single document's encoded size in bytes.
    pub max_document_size: usize,
    /// Upper bound on a web console request body in bytes.
    pub max_request_body_size: usize,
}

impl DatabaseOptions {
    pub(crate) fn from_raw(raw: RawDatabaseOptions) -> Self {
        Self {
            cache_size: raw.cache_size,
            auto_checkpoint_threshold: raw.auto_checkpoint_threshold,
            file_permissions: raw.file_permissions,
            read_only: raw.read_only,
            max_bulk_operations: raw.max_bulk_operations,
            max_document_size: raw.max_document_size,
            max_request_body_size: raw.max_request_body_size,
        }
    }

    pub(crate) fn to_raw(self) -> RawDatabaseOptions {
        RawDatabaseOptions {
            cache_size: self.cache_size,
            auto_checkpoint_threshold: self.auto_checkpoint_threshold,
            file_permissions: self.file_permissions,
            read_only: self.read_only,
            max_bulk_operations: self.max_bulk_operations,
            max_document_size: self.max_document_size,
            max_request_body_size: self.max_request_body_size,
        }
    }

    /// Sets the page cache size.
    #[must_use]
    pub const fn cache_size(mut self, pages: usize) -> Self {
        self.cache_size = pages;
        self
    }

    /// Sets the automatic checkpoint threshold in WAL frames.
    #[must_use]
    pub const fn auto_checkpoint_threshold(mut self, frames: u64) -> Self {
        self.auto_checkpoint_threshold = frames;
        self
    }

    /// Opens the database read-only.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets the bulk operation limit.
    #[must_use]
    pub const fn max_bulk_operations(mut self, limit: usize) -> Self {
        self.max_bulk_operations = limit;
        self
    }

    /// Sets the maximum encoded document size.
    #[must_use]
    pub const fn max_document_size(mut self, bytes: usize) -> Self {
        self.max_document_size = bytes;
        self
    }
}

/// Options controlling transaction retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Maximum commit retries on conflict.
    pub max_retries: usize,
    /// Base backoff between retries, in milliseconds.
    pub retry_backoff_base_ms: u64,
    /// Backoff ceiling, in milliseconds.
    pub max_retry_backoff_ms: u64,
}

impl TransactionOptions {
    pub(crate) fn from_raw(raw: RawTransactionOptions) -> Self {
        Self {
            max_retries: raw.max_retries,
            retry_backoff_base_ms: raw.retry_backoff_base_ms,
            max_retry_backoff_ms: raw.max_retry_backoff_ms,
        }
    }

    pub(crate) fn to_raw(self) -> RawTransactionOptions {
        RawTransactionOptions {
            max_retries: self.max_retries,
            retry_backoff_base_ms: self.retry_backoff_base_ms,
            max_retry_backoff_ms: self.max_retry_backoff_ms,
        }
    }

    /// Sets the maximum number of commit retries.
    #[must_use]
    pub const fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base retry backoff in milliseconds.
    #[must_use]
    pub const fn retry_backoff_base_ms(mut self, ms: u64) -> Self {
        self.retry_backoff_base_ms = ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_options_round_trip() {
        let raw = RawDatabaseOptions {
            cache_size: 512,
            auto_checkpoint_threshold: 100,
            file_permissions: 0o600,
            read_only: false,
            max_bulk_operations: 1000,
            max_document_size: 1 << 20,
            max_request_body_size: 1 << 22,
        };
        let opts = DatabaseOptions::from_raw(raw).read_only(true).cache_size(64);
        let back = opts.to_raw();
        assert!(back.read_only);
        assert_eq!(back.cache_size, 64);
        assert_eq!(back.auto_checkpoint_threshold, 100);
    }

    #[test]
    fn transaction_options_round_trip() {
        let raw = RawTransactionOptions {
            max_retries: 5,
            retry_backoff_base_ms: 10,
            max_retry_backoff_ms: 1000,
        };
        let opts = TransactionOptions::from_raw(raw).max_retries(2);
        assert_eq!(opts.to_raw().max_retries, 2);
        assert_eq!(opts.to_raw().max_retry_backoff_ms, 1000);
    }
}

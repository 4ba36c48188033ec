//! Command and document marshalling.
//!
//! Structured payloads cross the boundary as UTF-8 JSON text. This module
//! only serializes before the call and parses after the return; query,
//! update and aggregation semantics belong entirely to the engine, and
//! document content is treated as opaque.

use crate::buffer::to_cstring;
use crate::error::Result;
use serde::Deserialize;
use serde_json::Value;
use std::ffi::CString;

/// A document is an unordered field-to-value mapping. The reserved `_id`
/// field is the primary key.
pub type Document = Value;

/// Serializes a JSON value into boundary text.
pub(crate) fn encode(value: &Value) -> Result<CString> {
    to_cstring(&serde_json::to_string(value)?)
}

/// Serializes a list (field names, documents, operations) into boundary text.
pub(crate) fn encode_list<T: serde::Serialize>(items: &[T]) -> Result<CString> {
    to_cstring(&serde_json::to_string(items)?)
}

/// Parses boundary text into a typed value.
pub(crate) fn parse<'a, T: Deserialize<'a>>(json: &'a str) -> Result<T> {
    Ok(serde_json::from_str(json)?)
}

/// Outcome of an upsert: the affected id and whether a new document was
/// created rather than an existing one replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Id of the inserted or updated document.
    pub id: String,
    /// True when the upsert inserted a new document.
    pub inserted: bool,
}

/// Per-operation accounting for a bulk write.
///
/// A partially failed bulk write is a success payload, not a boundary
/// error: individual failures are listed in `errors` while the call
/// itself returns normally.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BulkWriteReport {
    /// Documents inserted.
    pub inserted_count: usize,
    /// Documents updated.
    pub updated_count: usize,
    /// Documents deleted.
    pub deleted_count: usize,
    /// Operations that failed, by position.
    pub errors: Vec<BulkWriteItemError>,
}

/// A single failed operation inside a bulk write.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BulkWriteItemError {
    /// Zero-based index of the failed operation.
    pub operation_index: usize,
    /// Engine-supplied description.
    pub message: String,
}

/// Description of one index on a collection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IndexInfo {
    /// Index name, unique per collection.
    pub name: String,
    /// Indexed field paths, in index order.
    pub fields: Vec<String>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
}

/// Statistics snapshot for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CollectionStats {
    /// Collection name.
    pub name: String,
    /// Number of live documents.
    pub document_count: u64,
    /// Indexes defined on the collection.
    pub indexes: Vec<IndexInfo>,
}

/// Database-wide introspection snapshot.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatabaseInfo {
    /// Filesystem path of the primary store.
    pub path: String,
    /// Engine format version.
    pub version: String,
    /// Total live documents across collections.
    pub total_documents: u64,
    /// Whether the database was opened read-only.
    pub read_only: bool,
    /// Per-collection statistics.
    pub collections: Vec<CollectionStats>,
}

/// Result of verifying a backup file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackupReport {
    /// Whether the backup passed verification.
    pub valid: bool,
    /// Size of the backup file in bytes.
    pub file_size: u64,
}

/// Result of a garbage collection pass.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GcReport {
    /// Frames returned to the free list.
    pub reclaimed_frames: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_escapes_control_characters() {
        // JSON escapes U+0000, so the boundary text never carries a raw
        // NUL even when the document does.
        let doc = json!({"name": "a\u{0}b"});
        let text = encode(&doc).unwrap();
        assert!(text.to_str().unwrap().contains("\\u0000"));
    }

    #[test]
    fn bulk_report_parses_partial_failure() {
        let json = r#"{
            "inserted_count": 2,
            "updated_count": 0,
            "deleted_count": 1,
            "errors": [{"operation_index": 3, "message": "duplicate key"}]
        }"#;
        let report: BulkWriteReport = parse(json).unwrap();
        assert_eq!(report.inserted_count, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].operation_index, 3);
    }

    #[test]
    fn index_info_parses() {
        let json = r#"[{"name": "by_email", "fields": ["email"], "unique": true}]"#;
        let indexes: Vec<IndexInfo> = parse(json).unwrap();
        assert_eq!(indexes[0].name, "by_email");
        assert!(indexes[0].unique);
    }
}

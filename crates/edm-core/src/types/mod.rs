//! # Core Type Definitions
//!
//! This module contains the shared types of the EDM engine:
//! - Object identifiers (`ObjectId`, `BlobId`)
//! - Stored documents (`Document`)
//! - Error types (`EdmError`)
//!
//! ## Identifier Format
//!
//! Object ids are 24-character lowercase hexadecimal strings. The format is
//! significant: while creating nested objects, a link value that looks like
//! an object id is treated as a reference to an existing object, and any
//! other string is treated as a relative path (see `tracker`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Length of the textual form of an [`ObjectId`].
pub const OBJECT_ID_LEN: usize = 24;

/// Identifier of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Build the id for the given store counter value.
    #[must_use]
    pub fn from_counter(n: u64) -> Self {
        Self(format!("{:0width$x}", n, width = OBJECT_ID_LEN))
    }

    /// Parse an id, returning `None` unless `s` has the object id format.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        if Self::is_object_id(s) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    /// Whether `s` is the string form of an object id.
    #[must_use]
    pub fn is_object_id(s: &str) -> bool {
        s.len() == OBJECT_ID_LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content hash identifying a stored blob (BLAKE3, hex).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(pub String);

impl BlobId {
    /// Compute the id of the given content.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(blake3::hash(data).to_hex().to_string())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// DOCUMENT
// =============================================================================

/// A stored object: its id plus the attribute record.
///
/// `fields` holds the stored attribute values in insertion order, including
/// the stored part of `meta` (tags, upstream, ...). The derived meta keys
/// (`id`, `type`, `parent`) are never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// The object id.
    pub id: ObjectId,
    /// Attribute name -> stored value.
    pub fields: Map<String, Value>,
}

impl Document {
    /// Create a new document.
    #[must_use]
    pub fn new(id: ObjectId, fields: Map<String, Value>) -> Self {
        Self { id, fields }
    }

    /// Get a stored attribute value.
    #[must_use]
    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.fields.get(attr)
    }

    /// Stored meta record (empty when none was stored).
    #[must_use]
    pub fn stored_meta(&self) -> Map<String, Value> {
        match self.fields.get(crate::primitives::META_ATTR) {
            Some(Value::Object(m)) => m.clone(),
            _ => Map::new(),
        }
    }

    /// The meta record as reported to callers: stored meta plus `id`, `type`
    /// and (when known) `parent`.
    #[must_use]
    pub fn api_meta(&self, type_name: &str, parent: Option<&ObjectId>) -> Map<String, Value> {
        let mut meta = self.stored_meta();
        meta.insert("id".to_string(), Value::String(self.id.to_string()));
        meta.insert("type".to_string(), Value::String(type_name.to_string()));
        if let Some(p) = parent {
            meta.insert("parent".to_string(), Value::String(p.to_string()));
        }
        meta
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the EDM engine.
///
/// - No silent failures
/// - Use `Result<T, EdmError>` for fallible operations
/// - The engine never retries; store failures propagate immediately
#[derive(Debug, Error)]
pub enum EdmError {
    /// Malformed schema, undefined link target, `meta` conflict.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Malformed path, filter expression or unit string.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A path could not be resolved against the schema or the stored objects.
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// A value does not conform to its schema item (dtype, shape, unit).
    #[error("Validation error: {0}")]
    Validation(String),

    /// The requested object or blob does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An operation precondition does not hold.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// The storage adapter failed (I/O, encoding).
    #[error("Storage error: {0}")]
    Storage(String),
}

// =============================================================================
// TESTS
// =============================================================================

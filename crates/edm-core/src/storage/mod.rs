//! # Storage Adapters
//!
//! The engine is built over two collaborator interfaces:
//!
//! - [`ObjectStore`]: documents grouped by space and type, plus the raw
//!   schema document of each space.
//! - [`BlobStore`]: opaque byte content addressed by its BLAKE3 hash.
//!
//! Two adapters implement both: [`MemoryStore`] (volatile, `BTreeMap`) and
//! [`RedbStore`] (persistent, redb). [`StorageBackend`] dispatches over them.
//! Every write is atomic for a single document only.

pub mod memory;
pub mod redb_store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

use crate::{BlobId, Document, EdmError, ObjectId};
use serde_json::{Map, Value};
use std::path::Path;

// =============================================================================
// TRAITS
// =============================================================================

/// Document store scoped by space and type.
pub trait ObjectStore {
    /// Fetch a document.
    fn get(&self, space: &str, type_name: &str, id: &ObjectId)
    -> Result<Option<Document>, EdmError>;

    /// Ids of documents whose top-level attributes equal every key of
    /// `query`, in id order. An empty query matches every document.
    fn find(
        &self,
        space: &str,
        type_name: &str,
        query: &Map<String, Value>,
    ) -> Result<Vec<ObjectId>, EdmError>;

    /// Store a new document and return its freshly allocated id.
    fn insert_one(
        &mut self,
        space: &str,
        type_name: &str,
        fields: Map<String, Value>,
    ) -> Result<ObjectId, EdmError>;

    /// Replace one attribute of a stored document; returns the updated
    /// document.
    fn update_attribute(
        &mut self,
        space: &str,
        type_name: &str,
        id: &ObjectId,
        attr: &str,
        value: Value,
    ) -> Result<Document, EdmError>;

    /// The raw schema document of a space, if defined.
    fn load_schema(&self, space: &str) -> Result<Option<Value>, EdmError>;

    /// Store the raw schema document of a space.
    fn save_schema(&mut self, space: &str, doc: &Value) -> Result<(), EdmError>;

    /// Names of spaces that have a schema.
    fn spaces(&self) -> Result<Vec<String>, EdmError>;

    /// Fetch a document, failing when it does not exist.
    fn require(&self, space: &str, type_name: &str, id: &ObjectId) -> Result<Document, EdmError> {
        self.get(space, type_name, id)?.ok_or_else(|| {
            EdmError::NotFound(format!("{} object {} in space {}", type_name, id, space))
        })
    }
}

/// Content-addressed blob store.
pub trait BlobStore {
    /// Store bytes; storing identical content twice yields the same id.
    fn put_blob(&mut self, space: &str, data: &[u8]) -> Result<BlobId, EdmError>;

    /// Fetch stored bytes.
    fn get_blob(&self, space: &str, id: &BlobId) -> Result<Vec<u8>, EdmError>;
}

/// Whether a document's top-level attributes match a `find` query.
pub(crate) fn matches_query(fields: &Map<String, Value>, query: &Map<String, Value>) -> bool {
    query.iter().all(|(k, v)| fields.get(k) == Some(v))
}

// =============================================================================
// BACKEND
// =============================================================================

/// Storage backend of an engine instance.
#[derive(Debug)]
pub enum StorageBackend {
    /// In-memory store (fast, volatile).
    InMemory(MemoryStore),
    /// Disk-backed store using redb (persistent).
    Persistent(RedbStore),
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::InMemory(MemoryStore::new())
    }
}

impl StorageBackend {
    /// Open or create a redb-backed store.
    pub fn open_redb(path: impl AsRef<Path>) -> Result<Self, EdmError> {
        Ok(Self::Persistent(RedbStore::open(path)?))
    }

    /// Whether the backend persists to disk.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::Persistent(_))
    }
}

impl ObjectStore for StorageBackend {
    fn get(
        &self,
        space: &str,
        type_name: &str,
        id: &ObjectId,
    ) -> Result<Option<Document>, EdmError> {
        match self {
            Self::InMemory(s) => s.get(space, type_name, id),
            Self::Persistent(s) => s.get(space, type_name, id),
        }
    }

    fn find(
        &self,
        space: &str,
        type_name: &str,
        query: &Map<String, Value>,
    ) -> Result<Vec<ObjectId>, EdmError> {
        match self {
            Self::InMemory(s) => s.find(space, type_name, query),
            Self::Persistent(s) => s.find(space, type_name, query),
        }
    }

    fn insert_one(
        &mut self,
        space: &str,
        type_name: &str,
        fields: Map<String, Value>,
    ) -> Result<ObjectId, EdmError> {
        match self {
            Self::InMemory(s) => s.insert_one(space, type_name, fields),
            Self::Persistent(s) => s.insert_one(space, type_name, fields),
        }
    }

    fn update_attribute(
        &mut self,
        space: &str,
        type_name: &str,
        id: &ObjectId,
        attr: &str,
        value: Value,
    ) -> Result<Document, EdmError> {
        match self {
            Self::InMemory(s) => s.update_attribute(space, type_name, id, attr, value),
            Self::Persistent(s) => s.update_attribute(space, type_name, id, attr, value),
        }
    }

    fn load_schema(&self, space: &str) -> Result<Option<Value>, EdmError> {
        match self {
            Self::InMemory(s) => s.load_schema(space),
            Self::Persistent(s) => s.load_schema(space),
        }
    }

    fn save_schema(&mut self, space: &str, doc: &Value) -> Result<(), EdmError> {
        match self {
            Self::InMemory(s) => s.save_schema(space, doc),
            Self::Persistent(s) => s.save_schema(space, doc),
        }
    }

    fn spaces(&self) -> Result<Vec<String>, EdmError> {
        match self {
            Self::InMemory(s) => s.spaces(),
            Self::Persistent(s) => s.spaces(),
        }
    }
}

impl BlobStore for StorageBackend {
    fn put_blob(&mut self, space: &str, data: &[u8]) -> Result<BlobId, EdmError> {
        match self {
            Self::InMemory(s) => s.put_blob(space, data),
            Self::Persistent(s) => s.put_blob(space, data),
        }
    }

    fn get_blob(&self, space: &str, id: &BlobId) -> Result<Vec<u8>, EdmError> {
        match self {
            Self::InMemory(s) => s.get_blob(space, id),
            Self::Persistent(s) => s.get_blob(space, id),
        }
    }
}

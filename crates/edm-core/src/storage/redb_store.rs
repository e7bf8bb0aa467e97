//! # redb-backed Object Storage
//!
//! A disk-backed document store using the redb embedded database.
//!
//! Layout:
//! - `objects`: `(space, type, id)` -> JSON document bytes
//! - `schemas`: `space` -> postcard-encoded [`SchemaRecord`]
//! - `blobs`: `(space, hash)` -> raw bytes
//! - `metadata`: `next_object_id`
//!
//! Every write runs in its own redb transaction, so a single document
//! update is atomic and crash safe. Nothing spans more than one document.

use super::{BlobStore, ObjectStore, matches_query};
use crate::{BlobId, Document, EdmError, ObjectId};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Table for objects: (space, type, id) -> serialized attribute map
const OBJECTS: TableDefinition<(&str, &str, &str), &[u8]> = TableDefinition::new("objects");

/// Table for schemas: space -> postcard-encoded `SchemaRecord`
const SCHEMAS: TableDefinition<&str, &[u8]> = TableDefinition::new("schemas");

/// Table for blobs: (space, content hash) -> bytes
const BLOBS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("blobs");

/// Table for metadata: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

/// Upper bound for id range scans; object ids are lowercase alphanumeric.
const ID_RANGE_END: &str = "~";

/// Current layout of [`SchemaRecord`].
const SCHEMA_FORMAT: u32 = 1;

/// Stored schema of one space.
///
/// Type definitions are kept as JSON text in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SchemaRecord {
    format: u32,
    types: Vec<(String, String)>,
}

impl SchemaRecord {
    fn from_value(doc: &Value) -> Result<Self, EdmError> {
        let Value::Object(types) = doc else {
            return Err(EdmError::Schema("schema document must be an object".to_string()));
        };
        Ok(Self {
            format: SCHEMA_FORMAT,
            types: types
                .iter()
                .map(|(name, def)| (name.clone(), def.to_string()))
                .collect(),
        })
    }

    fn into_value(self) -> Result<Value, EdmError> {
        if self.format != SCHEMA_FORMAT {
            return Err(EdmError::Storage(format!(
                "unsupported schema record format {}",
                self.format
            )));
        }
        self.types
            .into_iter()
            .map(|(name, text)| serde_json::from_str(&text).map(|def| (name, def)))
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object)
            .map_err(|e| EdmError::Storage(e.to_string()))
    }
}

/// A disk-backed object store using redb.
pub struct RedbStore {
    /// The redb database handle.
    db: Database,
    /// Next available object counter.
    next_object_id: u64,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore")
            .field("next_object_id", &self.next_object_id)
            .finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EdmError> {
        let db = Database::create(path.as_ref()).map_err(|e| EdmError::Storage(e.to_string()))?;

        // Initialize tables if they don't exist
        {
            let write_txn = db
                .begin_write()
                .map_err(|e| EdmError::Storage(e.to_string()))?;
            let _ = write_txn
                .open_table(OBJECTS)
                .map_err(|e| EdmError::Storage(e.to_string()))?;
            let _ = write_txn
                .open_table(SCHEMAS)
                .map_err(|e| EdmError::Storage(e.to_string()))?;
            let _ = write_txn
                .open_table(BLOBS)
                .map_err(|e| EdmError::Storage(e.to_string()))?;
            let _ = write_txn
                .open_table(METADATA)
                .map_err(|e| EdmError::Storage(e.to_string()))?;
            write_txn
                .commit()
                .map_err(|e| EdmError::Storage(e.to_string()))?;
        }

        let next_object_id = {
            let read_txn = db
                .begin_read()
                .map_err(|e| EdmError::Storage(e.to_string()))?;
            let table = read_txn
                .open_table(METADATA)
                .map_err(|e| EdmError::Storage(e.to_string()))?;
            table
                .get("next_object_id")
                .map_err(|e| EdmError::Storage(e.to_string()))?
                .map(|v| v.value())
                .unwrap_or(0)
        };

        Ok(Self { db, next_object_id })
    }

    fn decode_fields(bytes: &[u8]) -> Result<Map<String, Value>, EdmError> {
        serde_json::from_slice(bytes).map_err(|e| EdmError::Storage(e.to_string()))
    }

    fn encode_fields(fields: &Map<String, Value>) -> Result<Vec<u8>, EdmError> {
        serde_json::to_vec(fields).map_err(|e| EdmError::Storage(e.to_string()))
    }
}

impl ObjectStore for RedbStore {
    fn get(
        &self,
        space: &str,
        type_name: &str,
        id: &ObjectId,
    ) -> Result<Option<Document>, EdmError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| EdmError::Storage(e.to_string()))?;
        let table = read_txn
            .open_table(OBJECTS)
            .map_err(|e| EdmError::Storage(e.to_string()))?;

        match table
            .get((space, type_name, id.as_str()))
            .map_err(|e| EdmError::Storage(e.to_string()))?
        {
            Some(data) => {
                let fields = Self::decode_fields(data.value())?;
                Ok(Some(Document::new(id.clone(), fields)))
            }
            None => Ok(None),
        }
    }

    fn find(
        &self,
        space: &str,
        type_name: &str,
        query: &Map<String, Value>,
    ) -> Result<Vec<ObjectId>, EdmError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| EdmError::Storage(e.to_string()))?;
        let table = read_txn
            .open_table(OBJECTS)
            .map_err(|e| EdmError::Storage(e.to_string()))?;

        let mut ids = Vec::new();
        for entry in table
            .range((space, type_name, "")..=(space, type_name, ID_RANGE_END))
            .map_err(|e| EdmError::Storage(e.to_string()))?
        {
            let (key, data) = entry.map_err(|e| EdmError::Storage(e.to_string()))?;
            let (_space, _type, id) = key.value();
            let Some(id) = ObjectId::parse(id) else {
                continue;
            };
            if query.is_empty() || matches_query(&Self::decode_fields(data.value())?, query) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn insert_one(
        &mut self,
        space: &str,
        type_name: &str,
        fields: Map<String, Value>,
    ) -> Result<ObjectId, EdmError> {
        let counter = self.next_object_id.saturating_add(1);
        let id = ObjectId::from_counter(counter);
        let bytes = Self::encode_fields(&fields)?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| EdmError::Storage(e.to_string()))?;
        {
            let mut objects = write_txn
                .open_table(OBJECTS)
                .map_err(|e| EdmError::Storage(e.to_string()))?;
            objects
                .insert((space, type_name, id.as_str()), bytes.as_slice())
                .map_err(|e| EdmError::Storage(e.to_string()))?;
        }
        {
            let mut meta = write_txn
                .open_table(METADATA)
                .map_err(|e| EdmError::Storage(e.to_string()))?;
            meta.insert("next_object_id", counter)
                .map_err(|e| EdmError::Storage(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| EdmError::Storage(e.to_string()))?;

        self.next_object_id = counter;
        Ok(id)
    }

    fn update_attribute(
        &mut self,
        space: &str,
        type_name: &str,
        id: &ObjectId,
        attr: &str,
        value: Value,
    ) -> Result<Document, EdmError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| EdmError::Storage(e.to_string()))?;
        let fields = {
            let mut objects = write_txn
                .open_table(OBJECTS)
                .map_err(|e| EdmError::Storage(e.to_string()))?;
            let current = objects
                .get((space, type_name, id.as_str()))
                .map_err(|e| EdmError::Storage(e.to_string()))?
                .map(|data| Self::decode_fields(data.value()))
                .transpose()?;
            let Some(mut fields) = current else {
                return Err(EdmError::NotFound(format!(
                    "{} object {} in space {}",
                    type_name, id, space
                )));
            };
            fields.insert(attr.to_string(), value);
            let bytes = Self::encode_fields(&fields)?;
            objects
                .insert((space, type_name, id.as_str()), bytes.as_slice())
                .map_err(|e| EdmError::Storage(e.to_string()))?;
            fields
        };
        write_txn
            .commit()
            .map_err(|e| EdmError::Storage(e.to_string()))?;
        Ok(Document::new(id.clone(), fields))
    }

    fn load_schema(&self, space: &str) -> Result<Option<Value>, EdmError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| EdmError::Storage(e.to_string()))?;
        let table = read_txn
            .open_table(SCHEMAS)
            .map_err(|e| EdmError::Storage(e.to_string()))?;

        match table
            .get(space)
            .map_err(|e| EdmError::Storage(e.to_string()))?
        {
            Some(data) => {
                let record: SchemaRecord = postcard::from_bytes(data.value())
                    .map_err(|e| EdmError::Storage(e.to_string()))?;
                record.into_value().map(Some)
            }
            None => Ok(None),
        }
    }

    fn save_schema(&mut self, space: &str, doc: &Value) -> Result<(), EdmError> {
        let record = SchemaRecord::from_value(doc)?;
        let bytes = postcard::to_allocvec(&record).map_err(|e| EdmError::Storage(e.to_string()))?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| EdmError::Storage(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(SCHEMAS)
                .map_err(|e| EdmError::Storage(e.to_string()))?;
            table
                .insert(space, bytes.as_slice())
                .map_err(|e| EdmError::Storage(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| EdmError::Storage(e.to_string()))?;
        Ok(())
    }

    fn spaces(&self) -> Result<Vec<String>, EdmError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| EdmError::Storage(e.to_string()))?;
        let table = read_txn
            .open_table(SCHEMAS)
            .map_err(|e| EdmError::Storage(e.to_string()))?;

        let mut spaces = Vec::new();
        for entry in table
            .iter()
            .map_err(|e| EdmError::Storage(e.to_string()))?
        {
            let (key, _) = entry.map_err(|e| EdmError::Storage(e.to_string()))?;
            spaces.push(key.value().to_string());
        }
        Ok(spaces)
    }
}

impl BlobStore for RedbStore {
    fn put_blob(&mut self, space: &str, data: &[u8]) -> Result<BlobId, EdmError> {
        let id = BlobId::of(data);
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| EdmError::Storage(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(BLOBS)
                .map_err(|e| EdmError::Storage(e.to_string()))?;
            table
                .insert((space, id.as_str()), data)
                .map_err(|e| EdmError::Storage(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| EdmError::Storage(e.to_string()))?;
        Ok(id)
    }

    fn get_blob(&self, space: &str, id: &BlobId) -> Result<Vec<u8>, EdmError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| EdmError::Storage(e.to_string()))?;
        let table = read_txn
            .open_table(BLOBS)
            .map_err(|e| EdmError::Storage(e.to_string()))?;
        table
            .get((space, id.as_str()))
            .map_err(|e| EdmError::Storage(e.to_string()))?
            .map(|data| data.value().to_vec())
            .ok_or_else(|| EdmError::NotFound(format!("blob {} in space {}", id, space)))
    }
}

// =============================================================================
// TESTS
// =============================================================================

//! # In-Memory Store
//!
//! `BTreeMap`-backed implementation of [`ObjectStore`] and [`BlobStore`].
//! Ids come from a counter, so runs are reproducible.

use super::{BlobStore, ObjectStore, matches_query};
use crate::{BlobId, Document, EdmError, ObjectId};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
struct SpaceData {
    schema: Option<Value>,
    collections: BTreeMap<String, BTreeMap<ObjectId, Map<String, Value>>>,
    blobs: BTreeMap<BlobId, Vec<u8>>,
}

/// Volatile store keeping every space in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    spaces: BTreeMap<String, SpaceData>,
    next_object_id: u64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored objects across spaces.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.spaces
            .values()
            .flat_map(|s| s.collections.values())
            .map(BTreeMap::len)
            .sum()
    }

    fn allocate_id(&mut self) -> ObjectId {
        self.next_object_id = self.next_object_id.saturating_add(1);
        ObjectId::from_counter(self.next_object_id)
    }
}

impl ObjectStore for MemoryStore {
    fn get(
        &self,
        space: &str,
        type_name: &str,
        id: &ObjectId,
    ) -> Result<Option<Document>, EdmError> {
        Ok(self
            .spaces
            .get(space)
            .and_then(|s| s.collections.get(type_name))
            .and_then(|c| c.get(id))
            .map(|fields| Document::new(id.clone(), fields.clone())))
    }

    fn find(
        &self,
        space: &str,
        type_name: &str,
        query: &Map<String, Value>,
    ) -> Result<Vec<ObjectId>, EdmError> {
        Ok(self
            .spaces
            .get(space)
            .and_then(|s| s.collections.get(type_name))
            .map(|c| {
                c.iter()
                    .filter(|(_, fields)| matches_query(fields, query))
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn insert_one(
        &mut self,
        space: &str,
        type_name: &str,
        fields: Map<String, Value>,
    ) -> Result<ObjectId, EdmError> {
        let id = self.allocate_id();
        self.spaces
            .entry(space.to_string())
            .or_default()
            .collections
            .entry(type_name.to_string())
            .or_default()
            .insert(id.clone(), fields);
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
        let fields = self
            .spaces
            .get_mut(space)
            .and_then(|s| s.collections.get_mut(type_name))
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| {
                EdmError::NotFound(format!("{} object {} in space {}", type_name, id, space))
            })?;
        fields.insert(attr.to_string(), value);
        Ok(Document::new(id.clone(), fields.clone()))
    }

    fn load_schema(&self, space: &str) -> Result<Option<Value>, EdmError> {
        Ok(self.spaces.get(space).and_then(|s| s.schema.clone()))
    }

    fn save_schema(&mut self, space: &str, doc: &Value) -> Result<(), EdmError> {
        self.spaces.entry(space.to_string()).or_default().schema = Some(doc.clone());
        Ok(())
    }

    fn spaces(&self) -> Result<Vec<String>, EdmError> {
        Ok(self
            .spaces
            .iter()
            .filter(|(_, s)| s.schema.is_some())
            .map(|(name, _)| name.clone())
            .collect())
    }
}

impl BlobStore for MemoryStore {
    fn put_blob(&mut self, space: &str, data: &[u8]) -> Result<BlobId, EdmError> {
        let id = BlobId::of(data);
        self.spaces
            .entry(space.to_string())
            .or_default()
            .blobs
            .insert(id.clone(), data.to_vec());
        Ok(id)
    }

    fn get_blob(&self, space: &str, id: &BlobId) -> Result<Vec<u8>, EdmError> {
        self.spaces
            .get(space)
            .and_then(|s| s.blobs.get(id))
            .cloned()
            .ok_or_else(|| EdmError::NotFound(format!("blob {} in space {}", id, space)))
    }
}

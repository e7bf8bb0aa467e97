//! # Engine
//!
//! [`Edm`] is the caller-facing surface. It combines a [`StorageBackend`]
//! with the [`SchemaRegistry`] and implements every operation on top of the
//! resolver, the quantity codec, the tracker and the link graph.
//!
//! ## Write discipline
//!
//! Every operation validates its complete input before the first store
//! write. A failing create or patch leaves the store untouched; a store
//! failure in the middle of a multi-document write is surfaced as a
//! `Storage` error without rollback.

mod create;
mod export;

use crate::linkgraph::LinkGraph;
use crate::path::Path;
use crate::primitives::{DERIVED_META_KEYS, META_ATTR};
use crate::quantity;
use crate::resolve::Resolver;
use crate::schema::{Schema, SchemaRegistry};
use crate::storage::{BlobStore, ObjectStore, StorageBackend};
use crate::tracker::ObjectTracker;
use crate::{BlobId, Document, EdmError, ObjectId};
use export::Exporter;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// OPTIONS AND RESULTS
// =============================================================================

/// Options of [`Edm::get_object`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOptions {
    /// Path below the root object; empty selects the root itself.
    pub path: String,
    /// Links deeper than this are left out; `None` follows all links.
    pub max_depth: Option<usize>,
    /// Replace repeat visits of an object with a relative path.
    pub tracking: bool,
    /// Emit the `meta` attribute.
    pub include_meta: bool,
    /// Objects emitted as their raw id instead of being expanded.
    pub shallow: Vec<ObjectId>,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            path: String::new(),
            max_depth: None,
            tracking: false,
            include_meta: true,
            shallow: Vec::new(),
        }
    }
}

impl GetOptions {
    /// Options reading `path` with defaults otherwise.
    #[must_use]
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Result of a read: a single value for plain paths, a list otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    One(Value),
    Many(Vec<Value>),
}

impl Selection {
    /// The JSON form: the value itself, or an array of values.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::One(v) => v,
            Self::Many(vs) => Value::Array(vs),
        }
    }

    /// Number of values selected.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(vs) => vs.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// Entity data model engine over one storage backend.
#[derive(Debug, Default)]
pub struct Edm {
    backend: StorageBackend,
    registry: SchemaRegistry,
}

impl Edm {
    /// Create an engine over a fresh in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine over a redb database, creating it if needed.
    pub fn with_redb(path: impl AsRef<std::path::Path>) -> Result<Self, EdmError> {
        Ok(Self::with_backend(StorageBackend::open_redb(path)?))
    }

    /// Create an engine over an existing backend.
    #[must_use]
    pub fn with_backend(backend: StorageBackend) -> Self {
        Self {
            backend,
            registry: SchemaRegistry::new(),
        }
    }

    /// The storage backend.
    #[must_use]
    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    /// Whether the engine persists to disk.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.backend.is_persistent()
    }

    /// The schema cache.
    #[must_use]
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    fn schema(&self, space: &str) -> Result<Arc<Schema>, EdmError> {
        self.registry.get(&self.backend, space)
    }

    // -------------------------------------------------------------------------
    // Schema
    // -------------------------------------------------------------------------

    /// Define the schema of a space.
    ///
    /// Redefinition requires `force`. Existing objects are not migrated.
    pub fn define_schema(&mut self, space: &str, doc: &Value, force: bool) -> Result<(), EdmError> {
        let schema = Schema::from_value(doc)?;
        if !force && self.backend.load_schema(space)?.is_some() {
            return Err(EdmError::Schema(format!(
                "space {:?} already has a schema; pass force to replace it",
                space
            )));
        }
        self.backend.save_schema(space, &schema.to_value())?;
        self.registry.invalidate(space);
        info!(space, types = schema.type_names().count(), force, "schema defined");
        Ok(())
    }

    /// The stored schema of a space, including the implicit `meta` items.
    pub fn get_schema(&self, space: &str) -> Result<Value, EdmError> {
        Ok(self.schema(space)?.to_value())
    }

    /// Spaces that have a schema.
    pub fn spaces(&self) -> Result<Vec<String>, EdmError> {
        self.backend.spaces()
    }

    /// Type names of a space, in schema order.
    pub fn list_types(&self, space: &str) -> Result<Vec<String>, EdmError> {
        Ok(self.schema(space)?.type_names().map(str::to_string).collect())
    }

    /// Ids of all objects of a type, in id order.
    pub fn list_objects(&self, space: &str, type_name: &str) -> Result<Vec<ObjectId>, EdmError> {
        self.find_objects(space, type_name, &Map::new())
    }

    /// Ids of objects whose stored top-level attributes equal `query`.
    pub fn find_objects(
        &self,
        space: &str,
        type_name: &str,
        query: &Map<String, Value>,
    ) -> Result<Vec<ObjectId>, EdmError> {
        self.schema(space)?.require_type(type_name)?;
        self.backend.find(space, type_name, query)
    }

    // -------------------------------------------------------------------------
    // Objects
    // -------------------------------------------------------------------------

    /// Create an object, and every object nested in its link attributes.
    ///
    /// Nested link values may be objects (created), object ids (existing
    /// objects) or relative paths to objects created earlier in the same
    /// call. Returns the id of the root object.
    pub fn create_object(
        &mut self,
        space: &str,
        type_name: &str,
        payload: &Value,
    ) -> Result<ObjectId, EdmError> {
        let schema = self.schema(space)?;
        let pending = create::prepare(&self.backend, &schema, space, type_name, payload)?;
        let objects = pending.object_count();
        let mut tracker = ObjectTracker::new();
        let id = create::insert(&mut self.backend, space, pending, &Path::root(), &mut tracker)?;
        info!(space, type_name, id = %id, objects, "object created");
        Ok(id)
    }

    /// Read an object, or the locations a path below it resolves to.
    pub fn get_object(
        &self,
        space: &str,
        type_name: &str,
        id: &ObjectId,
        opts: &GetOptions,
    ) -> Result<Selection, EdmError> {
        let schema = self.schema(space)?;
        let path = Path::parse(&opts.path)?;
        let resolved = Resolver::new(&self.backend, &schema, space).resolve(type_name, id, &path)?;
        let shallow: HashSet<ObjectId> = opts.shallow.iter().cloned().collect();

        let mut values = Vec::with_capacity(resolved.paths.len());
        for rp in &resolved.paths {
            let value = match &rp.tail {
                Some(entry) => export::attribute(&schema, &rp.type_name, &rp.doc, entry)?,
                None => Exporter::new(&self.backend, &schema, space, opts, &shallow).object(
                    &rp.type_name,
                    &rp.doc,
                    rp.parent.as_ref(),
                    &Path::root(),
                    0,
                )?,
            };
            values.push(value);
        }
        debug!(space, type_name, id = %id, path = %path, results = values.len(), "object read");
        if resolved.is_plain {
            Ok(Selection::One(values.into_iter().next().unwrap_or(Value::Null)))
        } else {
            Ok(Selection::Many(values))
        }
    }

    /// Overwrite the attributes a path resolves to.
    ///
    /// A plain path takes a single value; any other path takes a list with
    /// one value per resolved location. Values for `meta` are merged into
    /// the stored meta record. Returns the number of attributes written.
    pub fn patch_object(
        &mut self,
        space: &str,
        type_name: &str,
        id: &ObjectId,
        path: &str,
        data: &Value,
    ) -> Result<usize, EdmError> {
        let schema = self.schema(space)?;
        let parsed = Path::parse(path)?;
        let resolved =
            Resolver::new(&self.backend, &schema, space).resolve(type_name, id, &parsed)?;

        let values: Vec<&Value> = if resolved.is_plain {
            vec![data]
        } else {
            match data {
                Value::Array(items) if items.len() == resolved.paths.len() => items.iter().collect(),
                Value::Array(items) => {
                    return Err(EdmError::Precondition(format!(
                        "{:?} resolves to {} locations but {} values were given",
                        path,
                        resolved.paths.len(),
                        items.len()
                    )));
                }
                _ => {
                    return Err(EdmError::Precondition(format!(
                        "{:?} is not a plain path; expected a list of values",
                        path
                    )));
                }
            }
        };

        let mut writes = Vec::with_capacity(values.len());
        for (rp, value) in resolved.paths.iter().zip(values) {
            let entry = rp.tail.as_ref().ok_or_else(|| {
                EdmError::Validation(format!(
                    "{:?} designates an object of type {}, not an attribute",
                    path, rp.type_name
                ))
            })?;
            let item = schema.require_type(&rp.type_name)?.require_attr(&entry.attr)?;
            let stored = if entry.attr == META_ATTR {
                merged_meta(&rp.doc, value)?
            } else {
                quantity::encode(item, &entry.attr, value)?
            };
            writes.push((rp.type_name.as_str(), rp.id(), entry.attr.as_str(), stored));
        }

        let count = writes.len();
        for (t, oid, attr, stored) in writes {
            self.backend.update_attribute(space, t, oid, attr, stored)?;
        }
        info!(space, type_name, id = %id, path, count, "object patched");
        Ok(count)
    }

    /// Deep-copy an object graph, sharing the objects listed in `shallow`.
    ///
    /// Objects reachable along several links are copied once. Each copy
    /// records the id it was copied from as `meta.upstream`.
    pub fn clone_object(
        &mut self,
        space: &str,
        type_name: &str,
        id: &ObjectId,
        shallow: &[ObjectId],
    ) -> Result<ObjectId, EdmError> {
        let opts = GetOptions {
            tracking: true,
            shallow: shallow.to_vec(),
            ..GetOptions::default()
        };
        let exported = self.get_object(space, type_name, id, &opts)?.into_value();
        let copy = self.create_object(space, type_name, &exported)?;
        info!(space, type_name, source = %id, copy = %copy, shared = shallow.len(), "object cloned");
        Ok(copy)
    }

    /// Objects of the graph below `id` that no path in `paths` can reach
    /// through, i.e. that a clone may share when only those paths change.
    pub fn safe_links(
        &self,
        space: &str,
        type_name: &str,
        id: &ObjectId,
        paths: &[String],
    ) -> Result<Vec<ObjectId>, EdmError> {
        let schema = self.schema(space)?;
        let resolver = Resolver::new(&self.backend, &schema, space);
        let mut targets = BTreeSet::new();
        for p in paths {
            let resolved = resolver.resolve(type_name, id, &Path::parse(p)?)?;
            targets.extend(resolved.paths.iter().map(|rp| rp.id().clone()));
        }
        LinkGraph::build(&self.backend, &schema, space, type_name, id)?.safe_nodes(&targets)
    }

    /// The link graph reachable from an object.
    pub fn link_graph(
        &self,
        space: &str,
        type_name: &str,
        id: &ObjectId,
    ) -> Result<LinkGraph, EdmError> {
        let schema = self.schema(space)?;
        LinkGraph::build(&self.backend, &schema, space, type_name, id)
    }

    // -------------------------------------------------------------------------
    // Blobs
    // -------------------------------------------------------------------------

    /// Store opaque content; identical content yields the same id.
    pub fn put_blob(&mut self, space: &str, data: &[u8]) -> Result<BlobId, EdmError> {
        let id = self.backend.put_blob(space, data)?;
        debug!(space, blob = %id, bytes = data.len(), "blob stored");
        Ok(id)
    }

    /// Fetch stored content.
    pub fn get_blob(&self, space: &str, id: &BlobId) -> Result<Vec<u8>, EdmError> {
        self.backend.get_blob(space, id)
    }
}

/// Stored meta after merging a patch record into it.
fn merged_meta(doc: &Document, patch: &Value) -> Result<Value, EdmError> {
    let Value::Object(fields) = patch else {
        return Err(EdmError::Validation(format!(
            "meta patch must be an object, got {}",
            patch
        )));
    };
    let mut meta = doc.stored_meta();
    for (k, v) in fields {
        if DERIVED_META_KEYS.contains(&k.as_str()) {
            return Err(EdmError::Validation(format!("meta.{} is not writable", k)));
        }
        meta.insert(k.clone(), v.clone());
    }
    Ok(Value::Object(meta))
}

// =============================================================================
// TESTS
// =============================================================================

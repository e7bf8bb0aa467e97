//! # Path Resolver
//!
//! Descends a parsed [`Path`] from a root object through link attributes.
//!
//! Each entry either names a link, in which case the subscript selects the
//! child ids to descend into, or names a plain attribute, which must then be
//! the last entry and becomes the `tail` of the result. Filters are applied
//! per entry to the candidates its subscript selected, preserving order.
//!
//! Resolution is a pure recursive function returning result vectors; the
//! only side effects are store reads.

use crate::filter::{AttributeSource, Datum, Filter};
use crate::path::{Path, PathEntry};
use crate::primitives::META_ATTR;
use crate::quantity;
use crate::schema::{ItemSchema, Schema};
use crate::storage::ObjectStore;
use crate::{Document, EdmError, ObjectId};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

// =============================================================================
// RESULT TYPES
// =============================================================================

/// One location a path resolved to.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
    /// Snapshot of the object the location is in.
    pub doc: Document,
    /// Type of `doc`.
    pub type_name: String,
    /// Attribute of `doc` addressed by the path, if the path did not end at
    /// the object itself.
    pub tail: Option<PathEntry>,
    /// The object whose link led here (the owner itself when `tail` is set).
    pub parent: Option<ObjectId>,
}

impl ResolvedPath {
    /// Id of the object the location is in.
    #[must_use]
    pub fn id(&self) -> &ObjectId {
        &self.doc.id
    }
}

/// All locations a path resolved to.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPaths {
    pub paths: Vec<ResolvedPath>,
    /// `true` when the path was plain and therefore has exactly one result.
    pub is_plain: bool,
}

// =============================================================================
// RESOLVER
// =============================================================================

/// Resolves paths within one space.
pub struct Resolver<'a> {
    store: &'a dyn ObjectStore,
    schema: &'a Schema,
    space: &'a str,
}

impl<'a> Resolver<'a> {
    /// Create a resolver over a store and the space's schema.
    #[must_use]
    pub fn new(store: &'a dyn ObjectStore, schema: &'a Schema, space: &'a str) -> Self {
        Self {
            store,
            schema,
            space,
        }
    }

    /// Fetch an object, checking its type exists.
    pub fn fetch(&self, type_name: &str, id: &ObjectId) -> Result<Document, EdmError> {
        self.schema.require_type(type_name)?;
        self.store.require(self.space, type_name, id)
    }

    /// Resolve `path` starting at object `id` of type `type_name`.
    pub fn resolve(
        &self,
        type_name: &str,
        id: &ObjectId,
        path: &Path,
    ) -> Result<ResolvedPaths, EdmError> {
        let root = self.fetch(type_name, id)?;
        let paths = self.descend(type_name, root, path.entries(), None)?;
        debug!(
            space = self.space,
            type_name,
            path = %path,
            results = paths.len(),
            "path resolved"
        );
        Ok(ResolvedPaths {
            paths,
            is_plain: path.is_plain(),
        })
    }

    fn descend(
        &self,
        type_name: &str,
        doc: Document,
        entries: &[PathEntry],
        parent: Option<ObjectId>,
    ) -> Result<Vec<ResolvedPath>, EdmError> {
        let Some((entry, rest)) = entries.split_first() else {
            return Ok(vec![ResolvedPath {
                doc,
                type_name: type_name.to_string(),
                tail: None,
                parent,
            }]);
        };
        let item = self.schema.require_type(type_name)?.require_attr(&entry.attr)?;

        let Some(target) = &item.link else {
            if !rest.is_empty() {
                return Err(EdmError::Resolution(format!(
                    "{}.{} is not a link; cannot resolve further",
                    type_name, entry.attr
                )));
            }
            if entry.subscript.is_some() {
                return Err(EdmError::Resolution(format!(
                    "{}.{} is not subscriptable",
                    type_name, entry.attr
                )));
            }
            let owner = doc.id.clone();
            return Ok(vec![ResolvedPath {
                doc,
                type_name: type_name.to_string(),
                tail: Some(entry.clone()),
                parent: Some(owner),
            }]);
        };

        let ids = link_ids(type_name, &doc, entry, item)?;
        let mut children = Vec::with_capacity(ids.len());
        for id in &ids {
            children.push(self.fetch(target, id)?);
        }
        if let Some(text) = &entry.filter {
            let filter = Filter::parse(text)?;
            let before = children.len();
            let mut kept = Vec::with_capacity(before);
            for child in children {
                if filter.matches(self.proxy(target, child.clone(), Some(doc.id.clone())))? {
                    kept.push(child);
                }
            }
            debug!(filter = text.as_str(), before, after = kept.len(), "filter applied");
            children = kept;
        }

        let mut out = Vec::new();
        for child in children {
            out.extend(self.descend(target, child, rest, Some(doc.id.clone()))?);
        }
        Ok(out)
    }

    fn proxy(
        &self,
        type_name: &str,
        doc: Document,
        parent: Option<ObjectId>,
    ) -> Rc<dyn AttributeSource<'a> + 'a> {
        let env = Rc::new(ProxyEnv {
            store: self.store,
            schema: self.schema,
            space: self.space,
            cache: RefCell::new(HashMap::new()),
        });
        let doc = Rc::new(doc);
        env.cache
            .borrow_mut()
            .insert((type_name.to_string(), doc.id.clone()), Rc::clone(&doc));
        Rc::new(ObjectProxy {
            env,
            type_name: type_name.to_string(),
            doc,
            parent,
        })
    }
}

/// Ids selected by `entry` on link attribute `item` of `doc`.
///
/// Scalar links must not be subscripted; array links must be.
pub fn link_ids(
    type_name: &str,
    doc: &Document,
    entry: &PathEntry,
    item: &ItemSchema,
) -> Result<Vec<ObjectId>, EdmError> {
    let value = doc.get(&entry.attr).ok_or_else(|| {
        EdmError::Resolution(format!(
            "{}.{} is not set on object {}",
            type_name, entry.attr, doc.id
        ))
    })?;
    if item.shape.is_empty() {
        if let Some(sub) = &entry.subscript {
            return Err(EdmError::Resolution(format!(
                "{}.{} is a scalar link but is subscripted with {:?}",
                type_name, entry.attr, sub
            )));
        }
        return Ok(vec![stored_link(type_name, &entry.attr, value)?]);
    }
    let Some(sub) = &entry.subscript else {
        return Err(EdmError::Resolution(format!(
            "{}.{} is a list and must be subscripted (use [:] to select all)",
            type_name, entry.attr
        )));
    };
    let Value::Array(items) = value else {
        return Err(EdmError::Resolution(format!(
            "{}.{} does not hold a list of links",
            type_name, entry.attr
        )));
    };
    sub.select(items.len())?
        .into_iter()
        .map(|i| stored_link(type_name, &entry.attr, &items[i]))
        .collect()
}

/// Parse one stored link value.
pub fn stored_link(type_name: &str, attr: &str, value: &Value) -> Result<ObjectId, EdmError> {
    value
        .as_str()
        .and_then(ObjectId::parse)
        .ok_or_else(|| {
            EdmError::Resolution(format!(
                "{}.{} holds {} instead of an object id",
                type_name, attr, value
            ))
        })
}

// =============================================================================
// ATTRIBUTE PROXY
// =============================================================================

/// State shared by all proxies of one filter evaluation.
struct ProxyEnv<'a> {
    store: &'a dyn ObjectStore,
    schema: &'a Schema,
    space: &'a str,
    cache: RefCell<HashMap<(String, ObjectId), Rc<Document>>>,
}

impl ProxyEnv<'_> {
    fn load(&self, type_name: &str, id: &ObjectId) -> Result<Rc<Document>, EdmError> {
        let key = (type_name.to_string(), id.clone());
        if let Some(doc) = self.cache.borrow().get(&key) {
            return Ok(Rc::clone(doc));
        }
        let doc = Rc::new(self.store.require(self.space, type_name, id)?);
        self.cache.borrow_mut().insert(key, Rc::clone(&doc));
        Ok(doc)
    }
}

/// Lazy view of one stored object for filter evaluation.
struct ObjectProxy<'a> {
    env: Rc<ProxyEnv<'a>>,
    type_name: String,
    doc: Rc<Document>,
    parent: Option<ObjectId>,
}

impl<'a> ObjectProxy<'a> {
    fn linked(&self, target: &str, value: &Value, attr: &str) -> Result<Datum<'a>, EdmError> {
        let id = stored_link(&self.type_name, attr, value)?;
        let doc = self.env.load(target, &id)?;
        Ok(Datum::Object(Rc::new(ObjectProxy {
            env: Rc::clone(&self.env),
            type_name: target.to_string(),
            doc,
            parent: Some(self.doc.id.clone()),
        })))
    }
}

impl<'a> AttributeSource<'a> for ObjectProxy<'a> {
    fn get(&self, name: &str) -> Result<Datum<'a>, EdmError> {
        let item = self
            .env
            .schema
            .require_type(&self.type_name)?
            .require_attr(name)?;
        if name == META_ATTR {
            return Ok(Datum::Dict(
                self.doc.api_meta(&self.type_name, self.parent.as_ref()),
            ));
        }
        let Some(value) = self.doc.get(name) else {
            return Err(EdmError::Resolution(format!(
                "{}.{} is absent from object {}",
                self.type_name, name, self.doc.id
            )));
        };
        match (&item.link, value) {
            (_, Value::Null) => Ok(Datum::None),
            (Some(target), Value::Array(items)) if !item.shape.is_empty() => items
                .iter()
                .map(|v| self.linked(target, v, name))
                .collect::<Result<Vec<_>, _>>()
                .map(Datum::List),
            (Some(target), v) => self.linked(target, v, name),
            (None, v) => Ok(Datum::from_json(&quantity::decode(item, name, v)?)),
        }
    }

    fn id(&self) -> Option<&str> {
        Some(self.doc.id.as_str())
    }
}

// =============================================================================
// TESTS
// =============================================================================

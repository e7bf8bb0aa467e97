//! Object export: stored documents to caller-facing JSON trees.

use super::GetOptions;
use crate::path::{Path, PathEntry};
use crate::primitives::{MAX_LINK_DEPTH, META_ATTR};
use crate::quantity;
use crate::resolve::stored_link;
use crate::schema::{ItemSchema, Schema};
use crate::storage::ObjectStore;
use crate::tracker::ObjectTracker;
use crate::{Document, EdmError, ObjectId};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Walks links below one exported object.
pub(super) struct Exporter<'a> {
    store: &'a dyn ObjectStore,
    schema: &'a Schema,
    space: &'a str,
    opts: &'a GetOptions,
    shallow: &'a HashSet<ObjectId>,
    tracker: Option<ObjectTracker>,
}

impl<'a> Exporter<'a> {
    pub(super) fn new(
        store: &'a dyn ObjectStore,
        schema: &'a Schema,
        space: &'a str,
        opts: &'a GetOptions,
        shallow: &'a HashSet<ObjectId>,
    ) -> Self {
        Self {
            store,
            schema,
            space,
            opts,
            shallow,
            tracker: opts.tracking.then(ObjectTracker::new),
        }
    }

    /// Export an object found at `path`, `level` links below the query root.
    pub(super) fn object(
        &mut self,
        type_name: &str,
        doc: &Document,
        parent: Option<&ObjectId>,
        path: &Path,
        level: usize,
    ) -> Result<Value, EdmError> {
        if let Some(tracker) = &mut self.tracker {
            tracker.record(path, &doc.id);
        }
        let schema = self.schema;
        let mut out = Map::new();
        for (attr, item) in schema.require_type(type_name)?.attrs() {
            if attr == META_ATTR {
                if self.opts.include_meta {
                    out.insert(attr.to_string(), Value::Object(doc.api_meta(type_name, parent)));
                }
                continue;
            }
            let Some(stored) = doc.get(attr) else { continue };
            let value = match &item.link {
                None => quantity::decode(item, attr, stored)?,
                Some(_) if self.opts.max_depth.is_some_and(|d| level >= d) => continue,
                Some(target) => self.links(type_name, doc, attr, item, target, stored, path, level)?,
            };
            out.insert(attr.to_string(), value);
        }
        Ok(Value::Object(out))
    }

    fn links(
        &mut self,
        type_name: &str,
        owner: &Document,
        attr: &str,
        item: &ItemSchema,
        target: &str,
        stored: &Value,
        path: &Path,
        level: usize,
    ) -> Result<Value, EdmError> {
        match stored {
            Value::Null => Ok(Value::Null),
            Value::Array(items) if !item.shape.is_empty() => {
                let mut out = Vec::with_capacity(items.len());
                for (i, v) in items.iter().enumerate() {
                    let index = i64::try_from(i).map_err(|_| {
                        EdmError::Resolution(format!("{}.{}: list too long", type_name, attr))
                    })?;
                    let id = stored_link(type_name, attr, v)?;
                    let at = path.child(PathEntry::indexed(attr, index));
                    out.push(self.link(target, &id, owner, &at, level)?);
                }
                Ok(Value::Array(out))
            }
            v => {
                let id = stored_link(type_name, attr, v)?;
                self.link(target, &id, owner, &path.child(PathEntry::attr(attr)), level)
            }
        }
    }

    fn link(
        &mut self,
        target: &str,
        id: &ObjectId,
        owner: &Document,
        at: &Path,
        level: usize,
    ) -> Result<Value, EdmError> {
        if self.shallow.contains(id) {
            return Ok(Value::String(id.as_str().to_string()));
        }
        if let Some(rel) = self
            .tracker
            .as_ref()
            .and_then(|t| t.relative_path(at, id))
        {
            return Ok(Value::String(rel));
        }
        if level >= MAX_LINK_DEPTH {
            return Err(EdmError::Resolution(format!(
                "links below {} nest deeper than {} levels",
                owner.id, MAX_LINK_DEPTH
            )));
        }
        let child = self.store.require(self.space, target, id)?;
        self.object(target, &child, Some(&owner.id), at, level + 1)
    }
}

/// Read out a single non-link attribute addressed by a path tail.
pub(super) fn attribute(
    schema: &Schema,
    type_name: &str,
    doc: &Document,
    entry: &PathEntry,
) -> Result<Value, EdmError> {
    let item = schema.require_type(type_name)?.require_attr(&entry.attr)?;
    if entry.attr == META_ATTR {
        return Ok(Value::Object(doc.api_meta(type_name, None)));
    }
    match doc.get(&entry.attr) {
        None => Ok(Value::Null),
        Some(stored) => quantity::decode(item, &entry.attr, stored),
    }
}

//! Nested object creation.
//!
//! Creation runs in two passes. [`prepare`] validates the whole payload and
//! produces a [`PendingObject`] tree without writing anything; [`insert`]
//! then stores it children first, so every nested object has an id before
//! its owner links to it.
//!
//! Relative links may only point at objects stored earlier in that order.
//! `prepare` replays the same order over positions to reject forward
//! references before the first write.

use crate::path::{Path, PathEntry};
use crate::primitives::{DERIVED_META_KEYS, META_ATTR, UPSTREAM_META_KEY};
use crate::quantity;
use crate::schema::{ItemSchema, Schema};
use crate::storage::ObjectStore;
use crate::tracker::{ObjectTracker, relative_target};
use crate::{EdmError, ObjectId};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// A validated link value.
#[derive(Debug)]
enum LinkValue {
    Null,
    Existing(ObjectId),
    Relative(String),
    Nested(Box<PendingObject>),
}

#[derive(Debug)]
enum Pending {
    Plain(Value),
    Link(LinkValue),
    Links(Vec<LinkValue>),
}

/// A validated object awaiting insertion.
#[derive(Debug)]
pub(super) struct PendingObject {
    type_name: String,
    attrs: Vec<(String, Pending)>,
}

impl PendingObject {
    /// Number of objects the tree will create.
    pub(super) fn object_count(&self) -> usize {
        let nested = |l: &LinkValue| match l {
            LinkValue::Nested(o) => o.object_count(),
            _ => 0,
        };
        1 + self
            .attrs
            .iter()
            .map(|(_, p)| match p {
                Pending::Plain(_) => 0,
                Pending::Link(l) => nested(l),
                Pending::Links(ls) => ls.iter().map(nested).sum(),
            })
            .sum::<usize>()
    }
}

struct Preparer<'a> {
    store: &'a dyn ObjectStore,
    schema: &'a Schema,
    space: &'a str,
    created: HashSet<Path>,
}

/// Validate a creation payload.
pub(super) fn prepare(
    store: &dyn ObjectStore,
    schema: &Schema,
    space: &str,
    type_name: &str,
    payload: &Value,
) -> Result<PendingObject, EdmError> {
    let mut p = Preparer {
        store,
        schema,
        space,
        created: HashSet::new(),
    };
    p.object(type_name, payload, &Path::root())
}

impl Preparer<'_> {
    fn object(
        &mut self,
        type_name: &str,
        payload: &Value,
        path: &Path,
    ) -> Result<PendingObject, EdmError> {
        let schema = self.schema;
        let ty = schema.require_type(type_name)?;
        let Value::Object(fields) = payload else {
            return Err(EdmError::Validation(format!(
                "{} at {:?}: expected an object, got {}",
                type_name,
                path.to_string(),
                payload
            )));
        };
        let mut attrs = Vec::with_capacity(fields.len());
        for (attr, value) in fields {
            let item = ty.attr(attr).ok_or_else(|| {
                EdmError::Validation(format!("{} has no attribute {:?}", type_name, attr))
            })?;
            let pending = if attr == META_ATTR {
                match stored_meta(type_name, value)? {
                    Some(meta) => Pending::Plain(meta),
                    None => continue,
                }
            } else if let Some(target) = &item.link {
                self.link(type_name, attr, item, target, value, path)?
            } else if value.is_null() {
                continue;
            } else {
                Pending::Plain(quantity::encode(item, attr, value)?)
            };
            attrs.push((attr.clone(), pending));
        }
        self.created.insert(path.clone());
        Ok(PendingObject {
            type_name: type_name.to_string(),
            attrs,
        })
    }

    fn link(
        &mut self,
        type_name: &str,
        attr: &str,
        item: &ItemSchema,
        target: &str,
        value: &Value,
        path: &Path,
    ) -> Result<Pending, EdmError> {
        if item.shape.is_empty() {
            let at = path.child(PathEntry::attr(attr));
            return Ok(Pending::Link(self.link_value(target, value, &at)?));
        }
        let Value::Array(items) = value else {
            return Err(EdmError::Validation(format!(
                "{}.{}: expected a list of links, got {}",
                type_name, attr, value
            )));
        };
        if let Some(&n) = item.shape.first() {
            if n > 0 && usize::try_from(n).ok() != Some(items.len()) {
                return Err(EdmError::Validation(format!(
                    "{}.{}: expected {} links, got {}",
                    type_name,
                    attr,
                    n,
                    items.len()
                )));
            }
        }
        let mut out = Vec::with_capacity(items.len());
        for (i, v) in items.iter().enumerate() {
            let index = i64::try_from(i)
                .map_err(|_| EdmError::Validation(format!("{}.{}: list too long", type_name, attr)))?;
            let at = path.child(PathEntry::indexed(attr, index));
            out.push(self.link_value(target, v, &at)?);
        }
        Ok(Pending::Links(out))
    }

    fn link_value(&mut self, target: &str, value: &Value, at: &Path) -> Result<LinkValue, EdmError> {
        match value {
            Value::Null => Ok(LinkValue::Null),
            Value::Object(_) => Ok(LinkValue::Nested(Box::new(self.object(target, value, at)?))),
            Value::String(s) => match ObjectId::parse(s) {
                Some(id) => {
                    self.store.require(self.space, target, &id)?;
                    Ok(LinkValue::Existing(id))
                }
                None => {
                    let dest = relative_target(at, s)?;
                    if !self.created.contains(&dest) {
                        return Err(EdmError::Resolution(format!(
                            "relative link {:?} at {:?} refers to an object not created before it",
                            s,
                            at.to_string()
                        )));
                    }
                    Ok(LinkValue::Relative(s.clone()))
                }
            },
            other => Err(EdmError::Validation(format!(
                "link to {} at {:?}: expected an object, an id or a relative path, got {}",
                target,
                at.to_string(),
                other
            ))),
        }
    }
}

/// The stored part of a `meta` payload: derived keys dropped, `id` kept as
/// `upstream`.
fn stored_meta(type_name: &str, value: &Value) -> Result<Option<Value>, EdmError> {
    let meta = match value {
        Value::Null => return Ok(None),
        Value::Object(m) => m,
        other => {
            return Err(EdmError::Validation(format!(
                "{}.meta must be an object, got {}",
                type_name, other
            )));
        }
    };
    let mut stored: Map<String, Value> = meta
        .iter()
        .filter(|(k, _)| !DERIVED_META_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if let Some(id) = meta.get("id") {
        stored.insert(UPSTREAM_META_KEY.to_string(), id.clone());
    }
    Ok(Some(Value::Object(stored)))
}

/// Store a validated tree, children first; returns the root id.
pub(super) fn insert(
    store: &mut dyn ObjectStore,
    space: &str,
    pending: PendingObject,
    path: &Path,
    tracker: &mut ObjectTracker,
) -> Result<ObjectId, EdmError> {
    let mut fields = Map::new();
    for (attr, value) in pending.attrs {
        let stored = match value {
            Pending::Plain(v) => v,
            Pending::Link(l) => {
                let at = path.child(PathEntry::attr(attr.as_str()));
                insert_link(store, space, l, &at, tracker)?
            }
            Pending::Links(ls) => {
                let mut out = Vec::with_capacity(ls.len());
                for (i, l) in ls.into_iter().enumerate() {
                    let index = i64::try_from(i).map_err(|_| {
                        EdmError::Validation(format!("{}: list too long", attr))
                    })?;
                    let at = path.child(PathEntry::indexed(attr.as_str(), index));
                    out.push(insert_link(store, space, l, &at, tracker)?);
                }
                Value::Array(out)
            }
        };
        fields.insert(attr, stored);
    }
    let id = store.insert_one(space, &pending.type_name, fields)?;
    tracker.record(path, &id);
    Ok(id)
}

fn insert_link(
    store: &mut dyn ObjectStore,
    space: &str,
    link: LinkValue,
    at: &Path,
    tracker: &mut ObjectTracker,
) -> Result<Value, EdmError> {
    let id = match link {
        LinkValue::Null => return Ok(Value::Null),
        LinkValue::Existing(id) => id,
        LinkValue::Relative(rel) => tracker.resolve_relative(at, &rel)?,
        LinkValue::Nested(obj) => insert(store, space, *obj, at, tracker)?,
    };
    Ok(Value::String(id.as_str().to_string()))
}

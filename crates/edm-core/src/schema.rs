//! # Schema Registry
//!
//! Per-space type definitions. A schema document maps type names to
//! attribute definitions:
//!
//! ```json
//! {
//!   "Beam": { "length": {"unit": "m"}, "cs": {"link": "CrossSection"} },
//!   "CrossSection": { "rve": {"link": "RVE"} },
//!   "RVE": { "origin": {"shape": [3]} }
//! }
//! ```
//!
//! Construction validates every item, injects the implicit opaque `meta`
//! attribute and checks link targets. Parsed schemas are immutable and are
//! cached by [`SchemaRegistry`] until explicitly invalidated.

use crate::primitives::{MAX_SHAPE_RANK, META_ATTR};
use crate::storage::ObjectStore;
use crate::units::Unit;
use crate::EdmError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

// =============================================================================
// ITEM SCHEMA
// =============================================================================

/// Element type of an attribute.
///
/// Serialized with the short codes; the long names are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DType {
    #[default]
    #[serde(rename = "f", alias = "float")]
    Float,
    #[serde(rename = "i", alias = "int")]
    Int,
    #[serde(rename = "?", alias = "bool")]
    Bool,
    #[serde(rename = "str", alias = "string")]
    Str,
    #[serde(rename = "bytes")]
    Bytes,
    #[serde(rename = "object", alias = "opaque")]
    Opaque,
}

impl DType {
    /// Whether values of this dtype are quantities (numbers, optionally with
    /// a unit).
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, DType::Float | DType::Int | DType::Bool)
    }
}

/// Definition of one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItemSchema {
    #[serde(default)]
    pub dtype: DType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Dimension sizes; non-positive entries are wildcards, empty is scalar.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shape: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl ItemSchema {
    /// The definition of the implicit `meta` attribute.
    #[must_use]
    pub fn meta() -> Self {
        Self {
            dtype: DType::Opaque,
            ..Self::default()
        }
    }

    /// Whether this attribute is a link.
    #[must_use]
    pub fn is_link(&self) -> bool {
        self.link.is_some()
    }

    /// Whether this is an array-shaped link.
    #[must_use]
    pub fn is_array_link(&self) -> bool {
        self.link.is_some() && self.shape.len() == 1
    }

    fn validate(&mut self, type_name: &str, attr: &str) -> Result<(), EdmError> {
        if self.unit.as_deref().is_some_and(|u| u.trim().is_empty()) {
            self.unit = None;
        }
        if self.shape.len() > MAX_SHAPE_RANK {
            return Err(EdmError::Schema(format!(
                "{}.{}: shape has {} dimensions, at most {} allowed",
                type_name,
                attr,
                self.shape.len(),
                MAX_SHAPE_RANK
            )));
        }
        if self.link.is_some() {
            if self.shape.len() > 1 {
                return Err(EdmError::Schema(format!(
                    "{}.{}: link attributes have at most one dimension",
                    type_name, attr
                )));
            }
            if self.unit.is_some() {
                return Err(EdmError::Schema(format!(
                    "{}.{}: link attributes cannot carry a unit",
                    type_name, attr
                )));
            }
        }
        if let Some(unit) = &self.unit {
            if !self.dtype.is_numeric() {
                return Err(EdmError::Schema(format!(
                    "{}.{}: unit given for non-numeric dtype",
                    type_name, attr
                )));
            }
            Unit::parse(unit)
                .map_err(|e| EdmError::Schema(format!("{}.{}: {}", type_name, attr, e)))?;
        }
        Ok(())
    }
}

// =============================================================================
// SCHEMA
// =============================================================================

/// Attribute definitions of one type, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSchema {
    name: String,
    attrs: Vec<(String, ItemSchema)>,
}

impl TypeSchema {
    /// The type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up an attribute definition.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&ItemSchema> {
        self.attrs.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    /// Look up an attribute, failing with a resolution error.
    pub fn require_attr(&self, name: &str) -> Result<&ItemSchema, EdmError> {
        self.attr(name).ok_or_else(|| {
            EdmError::Resolution(format!("type {} has no attribute \"{}\"", self.name, name))
        })
    }

    /// Iterate attributes in declaration order (including `meta`).
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &ItemSchema)> {
        self.attrs.iter().map(|(n, s)| (n.as_str(), s))
    }

    /// Iterate link attributes in declaration order.
    pub fn links(&self) -> impl Iterator<Item = (&str, &ItemSchema)> {
        self.attrs().filter(|(_, s)| s.is_link())
    }
}

/// A validated schema for one space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    types: Vec<TypeSchema>,
}

impl Schema {
    /// Build and validate a schema from its JSON document.
    pub fn from_value(doc: &Value) -> Result<Self, EdmError> {
        let Value::Object(types_doc) = doc else {
            return Err(EdmError::Schema("schema must be an object".to_string()));
        };
        let mut types = Vec::with_capacity(types_doc.len());
        for (type_name, attrs_doc) in types_doc {
            if !is_identifier(type_name) {
                return Err(EdmError::Schema(format!(
                    "invalid type name \"{}\"",
                    type_name
                )));
            }
            let Value::Object(attrs_doc) = attrs_doc else {
                return Err(EdmError::Schema(format!(
                    "type {} must map attribute names to definitions",
                    type_name
                )));
            };
            let mut attrs = Vec::with_capacity(attrs_doc.len() + 1);
            for (attr, item_doc) in attrs_doc {
                if !is_identifier(attr) {
                    return Err(EdmError::Schema(format!(
                        "{}: invalid attribute name \"{}\"",
                        type_name, attr
                    )));
                }
                let mut item: ItemSchema = serde_json::from_value(item_doc.clone())
                    .map_err(|e| EdmError::Schema(format!("{}.{}: {}", type_name, attr, e)))?;
                item.validate(type_name, attr)?;
                attrs.push((attr.clone(), item));
            }
            inject_meta(type_name, &mut attrs)?;
            types.push(TypeSchema {
                name: type_name.clone(),
                attrs,
            });
        }
        let schema = Self { types };
        schema.check_links()?;
        Ok(schema)
    }

    /// The canonical JSON document (short dtype codes, `meta` included).
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut doc = Map::new();
        for t in &self.types {
            let mut attrs = Map::new();
            for (name, item) in &t.attrs {
                attrs.insert(
                    name.clone(),
                    serde_json::to_value(item).unwrap_or(Value::Null),
                );
            }
            doc.insert(t.name.clone(), Value::Object(attrs));
        }
        Value::Object(doc)
    }

    /// Look up a type.
    #[must_use]
    pub fn get_type(&self, name: &str) -> Option<&TypeSchema> {
        self.types.iter().find(|t| t.name == name)
    }

    /// Look up a type, failing with a resolution error.
    pub fn require_type(&self, name: &str) -> Result<&TypeSchema, EdmError> {
        self.get_type(name)
            .ok_or_else(|| EdmError::Resolution(format!("unknown type \"{}\"", name)))
    }

    /// Type names in declaration order.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.iter().map(|t| t.name.as_str())
    }

    fn check_links(&self) -> Result<(), EdmError> {
        for t in &self.types {
            for (attr, item) in t.links() {
                if let Some(target) = &item.link
                    && self.get_type(target).is_none()
                {
                    return Err(EdmError::Schema(format!(
                        "{}.{}: link to undefined type \"{}\"",
                        t.name, attr, target
                    )));
                }
            }
        }
        Ok(())
    }
}

fn inject_meta(type_name: &str, attrs: &mut Vec<(String, ItemSchema)>) -> Result<(), EdmError> {
    match attrs.iter().find(|(n, _)| n == META_ATTR) {
        Some((_, existing)) if *existing == ItemSchema::meta() => Ok(()),
        Some(_) => Err(EdmError::Schema(format!(
            "{}: attribute \"{}\" is reserved",
            type_name, META_ATTR
        ))),
        None => {
            attrs.push((META_ATTR.to_string(), ItemSchema::meta()));
            Ok(())
        }
    }
}

/// Whether `s` matches `[A-Za-z_][A-Za-z0-9_]*`.
#[must_use]
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Cache of parsed schemas, keyed by space.
///
/// Entries are loaded from the store on first use and stay until
/// [`invalidate`](Self::invalidate) is called for the space.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    cache: RwLock<HashMap<String, Arc<Schema>>>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the schema of a space, loading it from the store if not cached.
    pub fn get<S: ObjectStore + ?Sized>(
        &self,
        store: &S,
        space: &str,
    ) -> Result<Arc<Schema>, EdmError> {
        if let Some(schema) = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(space)
        {
            return Ok(Arc::clone(schema));
        }
        let doc = store
            .load_schema(space)?
            .ok_or_else(|| EdmError::Schema(format!("no schema defined for space \"{}\"", space)))?;
        let schema = Arc::new(Schema::from_value(&doc)?);
        debug!(space, "schema loaded into registry");
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(space.to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    /// Drop the cached schema of a space.
    pub fn invalidate(&self, space: &str) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(space);
    }

    /// Drop every cached schema.
    pub fn invalidate_all(&self) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Whether a space's schema is currently cached.
    #[must_use]
    pub fn is_cached(&self, space: &str) -> bool {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(space)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn beam_schema() -> Value {
        json!({
            "Beam": {"length": {"unit": "m"}, "cs": {"link": "CrossSection"}},
            "CrossSection": {"rve": {"link": "RVE"}},
            "RVE": {"origin": {"shape": [3]}}
        })
    }

    #[test]
    fn meta_is_injected() {
        let schema = Schema::from_value(&beam_schema()).expect("valid");
        let beam = schema.get_type("Beam").expect("Beam");
        assert_eq!(beam.attr("meta"), Some(&ItemSchema::meta()));
        assert_eq!(beam.attrs().count(), 3);
    }

    #[test]
    fn defaults_and_aliases() {
        let schema = Schema::from_value(&json!({
            "T": {"a": {}, "b": {"dtype": "int"}, "c": {"dtype": "?"}, "d": {"dtype": "string"}}
        }))
        .expect("valid");
        let t = schema.get_type("T").expect("T");
        assert_eq!(t.attr("a").map(|s| s.dtype), Some(DType::Float));
        assert_eq!(t.attr("b").map(|s| s.dtype), Some(DType::Int));
        assert_eq!(t.attr("c").map(|s| s.dtype), Some(DType::Bool));
        assert_eq!(t.attr("d").map(|s| s.dtype), Some(DType::Str));
        assert_eq!(schema.to_value()["T"]["b"]["dtype"], "i");
    }

    #[test]
    fn canonical_document_reloads_unchanged() {
        let schema = Schema::from_value(&beam_schema()).expect("valid");
        let again = Schema::from_value(&schema.to_value()).expect("reload");
        assert_eq!(schema, again);
    }

    #[test]
    fn meta_conflict_is_rejected() {
        let err = Schema::from_value(&json!({"T": {"meta": {"dtype": "f"}}}));
        assert!(matches!(err, Err(EdmError::Schema(_))));
    }

    #[test]
    fn undefined_link_target_is_rejected() {
        let err = Schema::from_value(&json!({"T": {"x": {"link": "Nope"}}}));
        assert!(matches!(err, Err(EdmError::Schema(_))));
    }

    #[test]
    fn link_shape_and_unit_rules() {
        assert!(Schema::from_value(&json!({"T": {"x": {"link": "T", "shape": [2, 2]}}})).is_err());
        assert!(Schema::from_value(&json!({"T": {"x": {"link": "T", "unit": "m"}}})).is_err());
        assert!(Schema::from_value(&json!({"T": {"x": {"link": "T", "shape": [-1]}}})).is_ok());
    }

    #[test]
    fn shape_rank_and_units_are_checked() {
        assert!(Schema::from_value(&json!({"T": {"x": {"shape": [1, 1, 1, 1, 1, 1]}}})).is_err());
        assert!(Schema::from_value(&json!({"T": {"x": {"unit": "furlong"}}})).is_err());
        assert!(Schema::from_value(&json!({"T": {"x": {"dtype": "str", "unit": "m"}}})).is_err());
        assert!(Schema::from_value(&json!({"T": {"x": {"bogus": 1}}})).is_err());
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("_a1"));
        assert!(!is_identifier("1a"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("a-b"));
    }
}

//! # edm-core
//!
//! The Entity Data Model engine: typed, unit-aware documents linked into a
//! queryable object graph.
//!
//! Each *space* holds a schema and the objects created under it. The schema
//! declares, per type, attributes with a dtype, an optional physical unit,
//! an optional shape, or a link to another type. On top of that the engine
//! offers:
//!
//! - nested creation of linked object trees in one call
//! - a path language (`a.b[1:].c[:|expr]`) to read and patch deep
//!   attributes, with slicing and sandboxed filter expressions
//! - unit conversion on write and read
//! - deep cloning that shares chosen sub-objects, and the safe-links
//!   analysis that tells which sub-objects may be shared
//!
//! ## Architectural Constraints
//!
//! - Synchronous, no async and no network dependencies
//! - All persistence goes through the [`ObjectStore`] and [`BlobStore`]
//!   traits; the engine keeps no state besides the schema cache
//! - Every operation validates its complete input before the first write

// =============================================================================
// MODULES
// =============================================================================

pub mod engine;
pub mod filter;
pub mod linkgraph;
pub mod path;
pub mod primitives;
pub mod quantity;
pub mod resolve;
pub mod schema;
pub mod storage;
pub mod tracker;
pub mod types;
pub mod units;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{BlobId, Document, EdmError, OBJECT_ID_LEN, ObjectId};

// =============================================================================
// RE-EXPORTS: Engine
// =============================================================================

pub use engine::{Edm, GetOptions, Selection};
pub use filter::{AttributeSource, Datum, Filter};
pub use linkgraph::{LinkEdge, LinkGraph};
pub use path::{Path, PathEntry, Subscript};
pub use resolve::{ResolvedPath, ResolvedPaths, Resolver};
pub use schema::{DType, ItemSchema, Schema, SchemaRegistry, TypeSchema};
pub use tracker::ObjectTracker;
pub use units::Unit;

// =============================================================================
// RE-EXPORTS: Storage
// =============================================================================

pub use storage::{BlobStore, MemoryStore, ObjectStore, RedbStore, StorageBackend};

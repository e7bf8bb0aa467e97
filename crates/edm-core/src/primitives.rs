//! # Engine Primitives
//!
//! Fixed constants of the EDM engine. These are compiled into the binary
//! and are immutable at runtime.

/// Name of the implicit opaque attribute every type carries.
///
/// Injected by schema construction; schema authors may not redefine it.
pub const META_ATTR: &str = "meta";

/// Keys of the meta record that are derived on read and never stored.
pub const DERIVED_META_KEYS: [&str; 3] = ["id", "type", "parent"];

/// Meta key under which a re-imported object remembers the id it was
/// exported from.
pub const UPSTREAM_META_KEY: &str = "upstream";

/// Maximum number of dimensions of an attribute shape.
pub const MAX_SHAPE_RANK: usize = 5;

/// Maximum link depth the resolver and exporter descend before giving up.
///
/// Link cycles reachable through plain paths are bounded by this limit.
pub const MAX_LINK_DEPTH: usize = 256;

/// Maximum nesting of brackets and parentheses in a filter expression.
pub const MAX_FILTER_DEPTH: usize = 64;

/// Relative tolerance used when an integer attribute is unit-converted.
pub const INTEGRAL_TOLERANCE: f64 = 1e-9;

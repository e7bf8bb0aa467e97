//! # CLI Command Implementations
//!
//! Each command runs one engine operation and returns its result as JSON;
//! [`print_output`] renders it.

use super::CliError;
use edm_core::{BlobId, Edm, GetOptions, ObjectId};
use serde_json::{Map, Value, json};
use std::path::Path;

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum size of a JSON input file (100 MB).
const MAX_JSON_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Maximum size of a blob input file (1 GB).
const MAX_BLOB_FILE_SIZE: u64 = 1024 * 1024 * 1024;

fn io_error(path: &Path, source: std::io::Error) -> CliError {
    CliError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read a file after checking its size.
fn read_limited(path: &Path, max_size: u64) -> Result<Vec<u8>, CliError> {
    let metadata = std::fs::metadata(path).map_err(|e| io_error(path, e))?;
    if !metadata.is_file() {
        return Err(CliError::InvalidArgument(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    if metadata.len() > max_size {
        return Err(CliError::InvalidArgument(format!(
            "{}: size {} bytes exceeds maximum allowed {} bytes",
            path.display(),
            metadata.len(),
            max_size
        )));
    }
    std::fs::read(path).map_err(|e| io_error(path, e))
}

/// Read and parse a JSON input file.
pub fn read_json(path: &Path) -> Result<Value, CliError> {
    let data = read_limited(path, MAX_JSON_FILE_SIZE)?;
    serde_json::from_slice(&data).map_err(|source| CliError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse an object id argument.
pub fn parse_id(text: &str) -> Result<ObjectId, CliError> {
    ObjectId::parse(text)
        .ok_or_else(|| CliError::InvalidArgument(format!("{:?} is not an object id", text)))
}

fn parse_ids(texts: &[String]) -> Result<Vec<ObjectId>, CliError> {
    texts.iter().map(|t| parse_id(t)).collect()
}

fn ids_json(ids: &[ObjectId]) -> Value {
    Value::Array(ids.iter().map(|id| json!(id.as_str())).collect())
}

// =============================================================================
// SCHEMA COMMANDS
// =============================================================================

/// Define the schema of a space from a JSON file.
pub fn cmd_schema_define(
    edm: &mut Edm,
    space: &str,
    file: &Path,
    force: bool,
) -> Result<Value, CliError> {
    let doc = read_json(file)?;
    edm.define_schema(space, &doc, force)?;
    Ok(json!({
        "space": space,
        "types": edm.list_types(space)?,
    }))
}

/// The schema of a space.
pub fn cmd_schema_show(edm: &Edm, space: &str) -> Result<Value, CliError> {
    Ok(edm.get_schema(space)?)
}

/// Type names of a space.
pub fn cmd_types(edm: &Edm, space: &str) -> Result<Value, CliError> {
    Ok(json!(edm.list_types(space)?))
}

// =============================================================================
// OBJECT COMMANDS
// =============================================================================

/// Ids of the objects of a type, optionally restricted by a query file.
pub fn cmd_list(
    edm: &Edm,
    space: &str,
    type_name: &str,
    query: Option<&Path>,
) -> Result<Value, CliError> {
    let ids = match query {
        None => edm.list_objects(space, type_name)?,
        Some(path) => match read_json(path)? {
            Value::Object(q) => edm.find_objects(space, type_name, &q)?,
            _ => {
                return Err(CliError::InvalidArgument(format!(
                    "{}: query must be a JSON object",
                    path.display()
                )));
            }
        },
    };
    Ok(ids_json(&ids))
}

/// Create an object tree from a JSON file.
pub fn cmd_create(
    edm: &mut Edm,
    space: &str,
    type_name: &str,
    file: &Path,
) -> Result<Value, CliError> {
    let payload = read_json(file)?;
    let id = edm.create_object(space, type_name, &payload)?;
    Ok(json!({"id": id.as_str()}))
}

/// Read an object or a path below it.
pub fn cmd_get(
    edm: &Edm,
    space: &str,
    type_name: &str,
    id: &str,
    path: &str,
    max_depth: Option<usize>,
    tracking: bool,
    include_meta: bool,
    shallow: &[String],
) -> Result<Value, CliError> {
    let opts = GetOptions {
        path: path.to_string(),
        max_depth,
        tracking,
        include_meta,
        shallow: parse_ids(shallow)?,
    };
    Ok(edm
        .get_object(space, type_name, &parse_id(id)?, &opts)?
        .into_value())
}

/// Overwrite the attributes a path selects.
pub fn cmd_patch(
    edm: &mut Edm,
    space: &str,
    type_name: &str,
    id: &str,
    path: &str,
    file: &Path,
) -> Result<Value, CliError> {
    let data = read_json(file)?;
    let written = edm.patch_object(space, type_name, &parse_id(id)?, path, &data)?;
    Ok(json!({"written": written}))
}

/// Deep-copy an object graph.
pub fn cmd_clone(
    edm: &mut Edm,
    space: &str,
    type_name: &str,
    id: &str,
    shallow: &[String],
) -> Result<Value, CliError> {
    let copy = edm.clone_object(space, type_name, &parse_id(id)?, &parse_ids(shallow)?)?;
    Ok(json!({"id": copy.as_str()}))
}

/// Objects a clone may share when only `paths` change.
pub fn cmd_safe_links(
    edm: &Edm,
    space: &str,
    type_name: &str,
    id: &str,
    paths: &[String],
) -> Result<Value, CliError> {
    let safe = edm.safe_links(space, type_name, &parse_id(id)?, paths)?;
    Ok(ids_json(&safe))
}

/// The link graph reachable from an object.
pub fn cmd_graph(edm: &Edm, space: &str, type_name: &str, id: &str) -> Result<Value, CliError> {
    let graph = edm.link_graph(space, type_name, &parse_id(id)?)?;
    serde_json::to_value(&graph)
        .map_err(|e| CliError::InvalidArgument(format!("cannot serialize graph: {}", e)))
}

// =============================================================================
// BLOB COMMANDS
// =============================================================================

/// Store a file's content.
pub fn cmd_blob_put(edm: &mut Edm, space: &str, file: &Path) -> Result<Value, CliError> {
    let data = read_limited(file, MAX_BLOB_FILE_SIZE)?;
    let id = edm.put_blob(space, &data)?;
    Ok(json!({"id": id.as_str(), "bytes": data.len()}))
}

/// Write stored content to a file.
pub fn cmd_blob_get(
    edm: &Edm,
    space: &str,
    id: &str,
    output: &Path,
) -> Result<Value, CliError> {
    let data = edm.get_blob(space, &BlobId(id.to_string()))?;
    std::fs::write(output, &data).map_err(|e| io_error(output, e))?;
    Ok(json!({"output": output.display().to_string(), "bytes": data.len()}))
}

// =============================================================================
// OUTPUT
// =============================================================================

/// Print a command result: one compact JSON line in JSON mode, otherwise
/// pretty JSON, with id lists one per line.
pub fn print_output(output: &Value, json_mode: bool) {
    if json_mode {
        println!("{}", output);
        return;
    }
    match output {
        Value::Array(items) if items.iter().all(Value::is_string) => {
            for item in items {
                println!("{}", item.as_str().unwrap_or_default());
            }
        }
        Value::Object(map) if is_flat(map) => {
            for (k, v) in map {
                match v {
                    Value::String(s) => println!("{:<8} {}", k, s),
                    other => println!("{:<8} {}", k, other),
                }
            }
        }
        other => println!(
            "{}",
            serde_json::to_string_pretty(other).unwrap_or_default()
        ),
    }
}

fn is_flat(map: &Map<String, Value>) -> bool {
    map.values()
        .all(|v| !matches!(v, Value::Object(_) | Value::Array(_)))
}

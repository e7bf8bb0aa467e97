//! # Object Tracker
//!
//! Bidirectional map between objects and the position where a traversal
//! first met them. Export uses it to replace repeat visits with relative
//! paths; import uses it to turn those relative paths back into ids.
//!
//! A relative path is `k` dots followed by a plain path: the dots climb
//! `k` levels from the current position, the suffix descends from there.

use crate::path::{Path, PathEntry};
use crate::{EdmError, ObjectId};
use std::collections::HashMap;

/// Position <-> object bookkeeping for one traversal.
#[derive(Debug, Clone, Default)]
pub struct ObjectTracker {
    path2id: HashMap<Path, ObjectId>,
    id2path: HashMap<ObjectId, Path>,
}

impl ObjectTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `id` sits at `path`. The first position seen for an
    /// object is the one relative paths refer to.
    pub fn record(&mut self, path: &Path, id: &ObjectId) {
        self.path2id.insert(path.clone(), id.clone());
        self.id2path
            .entry(id.clone())
            .or_insert_with(|| path.clone());
    }

    /// First recorded position of an object.
    #[must_use]
    pub fn path_of(&self, id: &ObjectId) -> Option<&Path> {
        self.id2path.get(id)
    }

    /// Object recorded at a position.
    #[must_use]
    pub fn id_at(&self, path: &Path) -> Option<&ObjectId> {
        self.path2id.get(path)
    }

    /// Relative path from `current` to the recorded position of `id`.
    #[must_use]
    pub fn relative_path(&self, current: &Path, id: &ObjectId) -> Option<String> {
        let target = self.id2path.get(id)?;
        let common = current
            .entries()
            .iter()
            .zip(target.entries())
            .take_while(|(a, b)| a == b)
            .count();
        let suffix = Path::from(target.entries()[common..].to_vec());
        Some(format!(
            "{}{}",
            ".".repeat(current.len() - common),
            suffix
        ))
    }

    /// Resolve a relative path written at `current` to a recorded object.
    pub fn resolve_relative(&self, current: &Path, rel: &str) -> Result<ObjectId, EdmError> {
        let target = relative_target(current, rel)?;
        self.path2id.get(&target).cloned().ok_or_else(|| {
            EdmError::Resolution(format!(
                "relative link {:?} at {:?} does not refer to an already created object",
                rel,
                current.to_string()
            ))
        })
    }
}

/// The absolute position a relative path written at `current` points to.
pub fn relative_target(current: &Path, rel: &str) -> Result<Path, EdmError> {
    let up = rel.chars().take_while(|&c| c == '.').count();
    if up == 0 {
        return Err(EdmError::Parse(format!(
            "relative link {:?} must start with '.'",
            rel
        )));
    }
    if up > current.len() {
        return Err(EdmError::Resolution(format!(
            "relative link {:?} climbs {} levels above {:?}",
            rel,
            up,
            current.to_string()
        )));
    }
    let suffix = Path::parse(&rel[up..])?;
    if !suffix.is_plain() {
        return Err(EdmError::Parse(format!(
            "relative link {:?} must be a plain path",
            rel
        )));
    }
    let mut entries: Vec<PathEntry> = current.entries()[..current.len() - up].to_vec();
    entries.extend(suffix.entries().iter().cloned());
    Ok(Path::from(entries))
}

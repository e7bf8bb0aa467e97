//! # Link Graph
//!
//! The directed graph of objects reachable from a root through link
//! attributes, and the safe-links computation over it.
//!
//! An object is *safe* to share when altering a designated attribute of the
//! clone cannot reach it: it lies on no simple path from the root to any of
//! the targeted objects. Enumerating simple paths is exponential in the worst
//! case; real hierarchies are shallow trees with few shared nodes.

use crate::resolve::stored_link;
use crate::schema::Schema;
use crate::storage::ObjectStore;
use crate::{EdmError, ObjectId};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use tracing::debug;

/// One link from an object to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkEdge {
    pub from: ObjectId,
    pub to: ObjectId,
    /// Link attribute of `from`.
    pub attr: String,
    /// Position within an array link.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

/// Objects reachable from a root, with the links between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkGraph {
    pub root: ObjectId,
    pub nodes: BTreeSet<ObjectId>,
    pub edges: Vec<LinkEdge>,
}

impl LinkGraph {
    /// Walk every link reachable from `root`.
    ///
    /// Each object is expanded once, so shared objects and cycles terminate.
    pub fn build(
        store: &dyn ObjectStore,
        schema: &Schema,
        space: &str,
        type_name: &str,
        root: &ObjectId,
    ) -> Result<Self, EdmError> {
        let mut nodes = BTreeSet::new();
        let mut edges = Vec::new();
        let mut queue = VecDeque::from([(type_name.to_string(), root.clone())]);
        nodes.insert(root.clone());

        while let Some((type_name, id)) = queue.pop_front() {
            let doc = store.require(space, &type_name, &id)?;
            for (attr, item) in schema.require_type(&type_name)?.links() {
                let Some(target) = &item.link else { continue };
                let targets: Vec<(Option<usize>, ObjectId)> = match doc.get(attr) {
                    None | Some(Value::Null) => continue,
                    Some(Value::Array(items)) => items
                        .iter()
                        .enumerate()
                        .map(|(i, v)| Ok((Some(i), stored_link(&type_name, attr, v)?)))
                        .collect::<Result<_, EdmError>>()?,
                    Some(v) => vec![(None, stored_link(&type_name, attr, v)?)],
                };
                for (index, to) in targets {
                    if nodes.insert(to.clone()) {
                        queue.push_back((target.clone(), to.clone()));
                    }
                    edges.push(LinkEdge {
                        from: id.clone(),
                        to,
                        attr: attr.to_string(),
                        index,
                    });
                }
            }
        }
        debug!(
            root = %root,
            nodes = nodes.len(),
            edges = edges.len(),
            "link graph built"
        );
        Ok(Self {
            root: root.clone(),
            nodes,
            edges,
        })
    }

    fn successors(&self) -> BTreeMap<&ObjectId, BTreeSet<&ObjectId>> {
        let mut adj: BTreeMap<&ObjectId, BTreeSet<&ObjectId>> = BTreeMap::new();
        for e in &self.edges {
            adj.entry(&e.from).or_default().insert(&e.to);
        }
        adj
    }

    /// Whether every node is connected to the root ignoring edge direction.
    #[must_use]
    pub fn is_weakly_connected(&self) -> bool {
        let mut adj: BTreeMap<&ObjectId, Vec<&ObjectId>> = BTreeMap::new();
        for e in &self.edges {
            adj.entry(&e.from).or_default().push(&e.to);
            adj.entry(&e.to).or_default().push(&e.from);
        }
        let mut seen: HashSet<&ObjectId> = HashSet::from([&self.root]);
        let mut stack = vec![&self.root];
        while let Some(n) = stack.pop() {
            for &m in adj.get(n).into_iter().flatten() {
                if seen.insert(m) {
                    stack.push(m);
                }
            }
        }
        self.nodes.iter().all(|n| seen.contains(n))
    }

    /// Nodes lying on some simple path from the root to one of `targets`.
    ///
    /// A target equal to the root puts the root in the result.
    #[must_use]
    pub fn nodes_on_paths_to(&self, targets: &BTreeSet<ObjectId>) -> BTreeSet<ObjectId> {
        let adj = self.successors();
        let empty = BTreeSet::new();
        let mut found: BTreeSet<ObjectId> = BTreeSet::new();
        if targets.contains(&self.root) {
            found.insert(self.root.clone());
        }

        // Explicit DFS over simple paths: one successor iterator per frame.
        let mut path: Vec<&ObjectId> = vec![&self.root];
        let mut on_path: HashSet<&ObjectId> = HashSet::from([&self.root]);
        let mut frames = vec![adj.get(&self.root).unwrap_or(&empty).iter()];
        while let Some(frame) = frames.last_mut() {
            let Some(&next) = frame.next() else {
                frames.pop();
                if let Some(n) = path.pop() {
                    on_path.remove(n);
                }
                continue;
            };
            if on_path.contains(next) {
                continue;
            }
            path.push(next);
            on_path.insert(next);
            if targets.contains(next) {
                found.extend(path.iter().map(|&n| n.clone()));
            }
            frames.push(adj.get(next).unwrap_or(&empty).iter());
        }
        found
    }

    /// Nodes on no simple path from the root to any target, in id order.
    pub fn safe_nodes(&self, targets: &BTreeSet<ObjectId>) -> Result<Vec<ObjectId>, EdmError> {
        if !self.is_weakly_connected() {
            return Err(EdmError::Precondition(format!(
                "link graph of {} is not weakly connected",
                self.root
            )));
        }
        let unsafe_nodes = self.nodes_on_paths_to(targets);
        debug!(
            nodes = self.nodes.len(),
            targets = targets.len(),
            unsafe_nodes = unsafe_nodes.len(),
            "safe links computed"
        );
        Ok(self
            .nodes
            .iter()
            .filter(|n| !unsafe_nodes.contains(*n))
            .cloned()
            .collect())
    }
}

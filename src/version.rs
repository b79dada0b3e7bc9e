use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Process-local numeric id for a version node in the repository DAG.
pub type VersionId = u32;

/// Stable global identifier for a version node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid(pub String);

impl Uuid {
    pub fn new(s: impl Into<String>) -> Self {
        Uuid(s.into())
    }
}

impl std::fmt::Display for Uuid {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Contract over the repository's version DAG bookkeeping.
///
/// `ancestry(v)` returns the chain `[v, parent(v), ..., root]`. Ancestor
/// nodes are immutable once they have children, so the returned chain for a
/// given version never changes.
pub trait AncestryProvider: Send + Sync {
    fn ancestry(&self, v: VersionId) -> Result<Vec<VersionId>>;
}

/// A minimal in-process version DAG for embedders and tests.
///
/// Nodes get dense VersionIds starting at the root. Branching is allowed;
/// each node records its parent and the full ancestry is recovered by
/// walking parent links.
pub struct VersionDag {
    inner: RwLock<DagInner>,
}

struct DagInner {
    parents: HashMap<VersionId, Option<VersionId>>,
    next: VersionId,
}

impl VersionDag {
    /// Creates a DAG containing only a root node with id 0.
    pub fn new() -> Self {
        let mut parents = HashMap::new();
        parents.insert(0, None);
        Self {
            inner: RwLock::new(DagInner { parents, next: 1 }),
        }
    }

    pub fn root(&self) -> VersionId {
        0
    }

    /// Adds a child of the given parent, returning the new version id.
    pub fn new_child(&self, parent: VersionId) -> Result<VersionId> {
        let mut inner = self.inner.write().unwrap();
        if !inner.parents.contains_key(&parent) {
            return Err(Error::BadRequest(format!("unknown parent version {parent}")));
        }
        let v = inner.next;
        inner.next += 1;
        inner.parents.insert(v, Some(parent));
        Ok(v)
    }
}

impl Default for VersionDag {
    fn default() -> Self {
        Self::new()
    }
}

impl AncestryProvider for VersionDag {
    fn ancestry(&self, v: VersionId) -> Result<Vec<VersionId>> {
        let inner = self.inner.read().unwrap();
        let mut chain = Vec::new();
        let mut cur = Some(v);
        while let Some(node) = cur {
            let parent = inner
                .parents
                .get(&node)
                .ok_or_else(|| Error::BadRequest(format!("unknown version {node}")))?;
            chain.push(node);
            cur = *parent;
        }
        Ok(chain)
    }
}

//! Tree nodes: leaves wrapped as ground truth, parents synthesized above them.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::canonical::canonical_hash_hex;
use super::leaf::{Leaf, LeafId};

/// Identifier of a node in an explanation tree.
///
/// Leaf nodes reuse their leaf id verbatim; parent ids are content-derived
/// via [`ParentNode::derive_id`], so an unchanged child set always yields the
/// same id across rebuilds.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&LeafId> for NodeId {
    fn from(id: &LeafId) -> Self {
        Self(id.as_str().to_string())
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A synthesized parent whose statement is claimed to follow from its
/// children's statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentNode {
    /// Content-derived id, stable across rebuilds for an unchanged child set.
    pub id: NodeId,
    /// The synthesized statement.
    pub statement: String,
    /// Ordered child node ids (2..=max_children_per_parent).
    pub children: Vec<NodeId>,
    /// 1 + max(child depth).
    pub depth: u32,
    /// Complexity score reported by the summarization provider.
    pub complexity_score: f32,
    /// Abstraction score reported by the summarization provider.
    pub abstraction_score: f32,
    /// Provider confidence in the synthesized statement.
    pub confidence: f32,
    /// Why the statement follows from the children.
    pub justification: String,
    /// Terms the statement introduces that do not appear in any child.
    pub new_terms: Vec<String>,
    /// Transitive union of descendant leaf ids.
    pub evidence_refs: BTreeSet<LeafId>,
}

impl ParentNode {
    /// Derive the stable id for a parent at `depth` over `children`.
    ///
    /// The child list is sorted before hashing so the id depends only on the
    /// child *set*, not the sibling order the builder happened to use.
    pub fn derive_id(depth: u32, children: &[NodeId]) -> NodeId {
        let mut sorted: Vec<&NodeId> = children.iter().collect();
        sorted.sort();
        let payload = (depth, sorted);
        NodeId::new(format!("p{}", canonical_hash_hex(&payload)))
    }

    /// Hash of the child id set alone, ignoring depth.
    ///
    /// Used by the cache's reuse matcher: a parent that migrated to a
    /// different depth still matches on this hash.
    pub fn child_set_hash(&self) -> String {
        let mut sorted: Vec<&NodeId> = self.children.iter().collect();
        sorted.sort();
        canonical_hash_hex(&sorted)
    }
}

/// A node in an explanation tree: ground-truth leaf or synthesized parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeNode {
    /// A wrapped leaf declaration, depth 0, evidence = its own id.
    Leaf(Leaf),
    /// A synthesized parent.
    Parent(ParentNode),
}

impl TreeNode {
    /// The node id.
    pub fn id(&self) -> NodeId {
        match self {
            TreeNode::Leaf(leaf) => NodeId::from(&leaf.id),
            TreeNode::Parent(parent) => parent.id.clone(),
        }
    }

    /// The node depth (0 for leaves).
    pub fn depth(&self) -> u32 {
        match self {
            TreeNode::Leaf(_) => 0,
            TreeNode::Parent(parent) => parent.depth,
        }
    }

    /// The statement this node asserts.
    pub fn statement(&self) -> &str {
        match self {
            TreeNode::Leaf(leaf) => &leaf.statement,
            TreeNode::Parent(parent) => &parent.statement,
        }
    }

    /// The leaf ids this node's claim is ultimately grounded in.
    pub fn evidence_refs(&self) -> BTreeSet<LeafId> {
        match self {
            TreeNode::Leaf(leaf) => {
                let mut set = BTreeSet::new();
                set.insert(leaf.id.clone());
                set
            }
            TreeNode::Parent(parent) => parent.evidence_refs.clone(),
        }
    }

    /// Child node ids (empty for leaves).
    pub fn children(&self) -> &[NodeId] {
        match self {
            TreeNode::Leaf(_) => &[],
            TreeNode::Parent(parent) => &parent.children,
        }
    }

    /// Whether this is a leaf node.
    pub fn is_leaf(&self) -> bool {
        matches!(self, TreeNode::Leaf(_))
    }
}

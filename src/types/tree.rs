//! The explanation tree and its build-time audit trail.
//!
//! An [`ExplanationTree`] is built once per (leaf set, config) pair and then
//! either replaced wholesale by a full rebuild or spliced in place by the
//! incremental cache, which keeps unaffected nodes byte-identical. Everything
//! the builder decided — every grouping, every repartition, every policy
//! decision — is recorded on the tree so downstream consumers can audit how
//! the hierarchy came to be.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::canonical::canonical_hash_hex;
use crate::policy::{PolicyDecision, ViolationCode};
use super::leaf::{Leaf, LeafId};
use super::node::{NodeId, TreeNode};

/// Why a group was repartitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepartitionReason {
    /// The group failed the pre-summary policy check.
    PreSummaryPolicy,
    /// The group's summary failed the post-summary policy check.
    PostSummaryPolicy,
}

/// Record of one deterministic repartition of a non-compliant group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepartitionEvent {
    /// Which policy check triggered the split.
    pub reason: RepartitionReason,
    /// Retry round (1-based) within the repartition budget.
    pub round: u32,
    /// Depth layer the group belonged to.
    pub depth: u32,
    /// The group as it was before the split.
    pub input_ids: Vec<NodeId>,
    /// The sub-groups the split produced.
    pub output_groups: Vec<Vec<NodeId>>,
    /// The violation codes that forced the split.
    pub violation_codes: Vec<ViolationCode>,
}

/// One grouping decision in the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDecision {
    /// Depth layer the inputs came from.
    pub depth: u32,
    /// Slot in the layer's group-index sequence. Passthrough singletons
    /// reserve a slot so sibling output ids stay stable across rebuilds.
    pub group_index: u32,
    /// Input node ids in layer order.
    pub input_ids: Vec<NodeId>,
    /// The produced parent id, or the singleton itself for passthrough.
    pub output_id: NodeId,
    /// max − min complexity hint across the inputs that carried one.
    pub complexity_spread: u32,
    /// Whether this slot was a singleton passed through unchanged.
    pub passthrough: bool,
}

/// Per-depth grouping diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupingDiagnostics {
    /// Depth layer these diagnostics describe.
    pub depth: u32,
    /// Number of parent-producing groups at this depth.
    pub group_count: u32,
    /// Number of singleton passthroughs at this depth.
    pub passthrough_count: u32,
    /// Every repartition that happened at this depth, in order.
    pub repartition_events: Vec<RepartitionEvent>,
}

/// A fully built, audience-calibrated explanation hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplanationTree {
    /// Id of the single root node.
    pub root_id: NodeId,
    /// Sorted input leaf ids.
    pub leaf_ids: Vec<LeafId>,
    /// Hash of the config the tree was built under.
    pub config_hash: String,
    /// All nodes by id.
    pub nodes: BTreeMap<NodeId, TreeNode>,
    /// Every grouping decision, in (depth, group_index) order.
    pub group_plan: Vec<GroupDecision>,
    /// Per-depth grouping diagnostics.
    pub grouping_diagnostics: Vec<GroupingDiagnostics>,
    /// Final policy decision per synthesized parent.
    pub policy_diagnostics: BTreeMap<NodeId, PolicyDecision>,
    /// Depth of the root.
    pub max_depth: u32,
}

impl ExplanationTree {
    /// Look up a node by id.
    pub fn node(&self, id: &NodeId) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    /// The root node.
    pub fn root(&self) -> Option<&TreeNode> {
        self.nodes.get(&self.root_id)
    }

    /// Number of synthesized parents.
    pub fn parent_count(&self) -> usize {
        self.nodes.values().filter(|n| !n.is_leaf()).count()
    }

    /// All repartition events across depths, in order.
    pub fn repartition_events(&self) -> Vec<&RepartitionEvent> {
        self.grouping_diagnostics
            .iter()
            .flat_map(|d| d.repartition_events.iter())
            .collect()
    }

    /// Deterministic hash of the exported tree plus its leaves.
    ///
    /// The config hash is part of the tree, so the snapshot hash pins
    /// (tree shape, node content, leaves, config) all at once.
    pub fn snapshot_hash(&self, leaves: &[Leaf]) -> String {
        canonical_hash_hex(&(self, leaves))
    }

    /// Validate the invariants the builder is supposed to guarantee.
    ///
    /// Independent of the builder by design: walks the node graph from the
    /// root with a visited set (shared descendants are expected, not a bug)
    /// and checks that every input leaf is reachable and every stored node is
    /// connected.
    pub fn validate(&self) -> TreeValidation {
        let mut issues = Vec::new();
        let mut visited: BTreeSet<NodeId> = BTreeSet::new();
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        queue.push_back(self.root_id.clone());

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            match self.nodes.get(&id) {
                Some(node) => {
                    for child in node.children() {
                        queue.push_back(child.clone());
                    }
                }
                None => issues.push(TreeIssue {
                    code: TreeIssueCode::NotConnected,
                    message: format!("Node {id} referenced but not stored"),
                }),
            }
        }

        for leaf_id in &self.leaf_ids {
            if !visited.contains(&NodeId::from(leaf_id)) {
                issues.push(TreeIssue {
                    code: TreeIssueCode::LeafNotPreserved,
                    message: format!("Leaf {leaf_id} not reachable from root"),
                });
            }
        }

        for id in self.nodes.keys() {
            if !visited.contains(id) {
                issues.push(TreeIssue {
                    code: TreeIssueCode::NotConnected,
                    message: format!("Node {id} not reachable from root"),
                });
            }
        }

        TreeValidation {
            ok: issues.is_empty(),
            issues,
        }
    }
}

/// Stable validation issue codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeIssueCode {
    /// An input leaf id is not reachable from the root.
    LeafNotPreserved,
    /// A stored or referenced node is not connected to the root.
    NotConnected,
}

/// One validation issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeIssue {
    /// Machine-readable issue code.
    pub code: TreeIssueCode,
    /// Human-readable description.
    pub message: String,
}

/// Result of [`ExplanationTree::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeValidation {
    /// True iff every leaf is preserved and the graph is connected.
    pub ok: bool,
    /// Itemized issues (empty when ok).
    pub issues: Vec<TreeIssue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::leaf::SourceSpan;
    use crate::types::node::ParentNode;

    fn make_leaf(id: &str) -> Leaf {
        Leaf::new(
            id,
            format!("Decl.{id}"),
            format!("statement {id}"),
            Some(1),
            vec![],
            SourceSpan::new("Main.lean", 1, 1),
        )
    }

    fn two_leaf_tree() -> ExplanationTree {
        let l1 = make_leaf("l1");
        let l2 = make_leaf("l2");
        let children = vec![NodeId::new("l1"), NodeId::new("l2")];
        let parent_id = ParentNode::derive_id(1, &children);
        let parent = ParentNode {
            id: parent_id.clone(),
            statement: "both statements hold".to_string(),
            children,
            depth: 1,
            complexity_score: 1.0,
            abstraction_score: 0.5,
            confidence: 0.9,
            justification: "follows from l1 and l2".to_string(),
            new_terms: vec![],
            evidence_refs: [LeafId::new("l1"), LeafId::new("l2")].into_iter().collect(),
        };

        let mut nodes = BTreeMap::new();
        nodes.insert(NodeId::new("l1"), TreeNode::Leaf(l1));
        nodes.insert(NodeId::new("l2"), TreeNode::Leaf(l2));
        nodes.insert(parent_id.clone(), TreeNode::Parent(parent));

        ExplanationTree {
            root_id: parent_id,
            leaf_ids: vec![LeafId::new("l1"), LeafId::new("l2")],
            config_hash: "cfg".to_string(),
            nodes,
            group_plan: vec![],
            grouping_diagnostics: vec![],
            policy_diagnostics: BTreeMap::new(),
            max_depth: 1,
        }
    }

    #[test]
    fn test_validate_ok() {
        let tree = two_leaf_tree();
        let validation = tree.validate();
        assert!(validation.ok, "{:?}", validation.issues);
    }

    #[test]
    fn test_validate_detects_missing_leaf() {
        let mut tree = two_leaf_tree();
        tree.leaf_ids.push(LeafId::new("l3"));

        let validation = tree.validate();
        assert!(!validation.ok);
        assert!(validation
            .issues
            .iter()
            .any(|i| i.code == TreeIssueCode::LeafNotPreserved));
    }

    #[test]
    fn test_validate_detects_disconnected_node() {
        let mut tree = two_leaf_tree();
        tree.nodes
            .insert(NodeId::new("orphan"), TreeNode::Leaf(make_leaf("orphan")));

        let validation = tree.validate();
        assert!(!validation.ok);
        assert!(validation
            .issues
            .iter()
            .any(|i| i.code == TreeIssueCode::NotConnected));
    }

    #[test]
    fn test_snapshot_hash_changes_with_content() {
        let tree = two_leaf_tree();
        let leaves = vec![make_leaf("l1"), make_leaf("l2")];
        let h1 = tree.snapshot_hash(&leaves);

        let mut edited = tree.clone();
        edited.config_hash = "other".to_string();
        assert_ne!(h1, edited.snapshot_hash(&leaves));
        assert_eq!(h1, tree.snapshot_hash(&leaves));
    }
}

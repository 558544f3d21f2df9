//! Classifies an edit between two leaf snapshots of the same proof.
//!
//! The classification decides how much of a cached tree survives:
//! formatting-only edits keep everything, content edits keep every subtree
//! outside the blocked set, and id or edge changes fall back to fuzzy parent
//! reuse.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::graph::{DependencyGraph, RebuildBatch};
use crate::types::{ExplanationTree, Leaf, LeafId, NodeId, TreeNode};

/// How the new leaves relate to the cached ones.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeClass {
    /// Same ids, same edges, same content hashes. Only raw text differs.
    SemanticNoop,
    /// Same ids and edges; listed leaves changed semantically.
    Localized {
        /// Leaves whose content hash changed.
        changed: BTreeSet<LeafId>,
    },
    /// Ids were added or removed, or prerequisite edges changed.
    Topology {
        /// Surviving leaves whose content hash changed.
        changed: BTreeSet<LeafId>,
        /// Ids present only in the new snapshot.
        added: BTreeSet<LeafId>,
        /// Ids present only in the cached snapshot.
        removed: BTreeSet<LeafId>,
    },
}

/// Compare cached leaves against new ones. Both slices must be id-sorted,
/// which [`crate::LeafSet`] and cache entries guarantee.
pub fn classify_change(old: &[Leaf], new: &[Leaf]) -> ChangeClass {
    let old_by_id: BTreeMap<&LeafId, &Leaf> = old.iter().map(|l| (&l.id, l)).collect();
    let new_by_id: BTreeMap<&LeafId, &Leaf> = new.iter().map(|l| (&l.id, l)).collect();

    let added: BTreeSet<LeafId> = new_by_id
        .keys()
        .filter(|id| !old_by_id.contains_key(*id))
        .map(|id| (*id).clone())
        .collect();
    let removed: BTreeSet<LeafId> = old_by_id
        .keys()
        .filter(|id| !new_by_id.contains_key(*id))
        .map(|id| (*id).clone())
        .collect();

    let mut edges_changed = false;
    let mut changed: BTreeSet<LeafId> = BTreeSet::new();
    for (id, new_leaf) in &new_by_id {
        let Some(old_leaf) = old_by_id.get(id) else {
            continue;
        };
        if old_leaf.prerequisites != new_leaf.prerequisites {
            edges_changed = true;
        }
        if old_leaf.content_hash() != new_leaf.content_hash() {
            changed.insert((*id).clone());
        }
    }

    if !added.is_empty() || !removed.is_empty() || edges_changed {
        return ChangeClass::Topology {
            changed,
            added,
            removed,
        };
    }
    if changed.is_empty() {
        ChangeClass::SemanticNoop
    } else {
        ChangeClass::Localized { changed }
    }
}

/// The leaves a rebuild may not reuse cached summaries over, with the
/// dependency-ordered batches a driver would re-verify them in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedSubtreePlan {
    /// Directly changed (or added) leaves.
    pub changed: BTreeSet<LeafId>,
    /// Changed leaves plus their transitive dependents.
    pub blocked: BTreeSet<LeafId>,
    /// Blocked leaves grouped into dependency layers.
    pub batches: Vec<RebuildBatch>,
}

impl BlockedSubtreePlan {
    /// Expand changed leaves through the dependent closure of the new graph.
    pub fn compute(graph: &DependencyGraph, changed: &BTreeSet<LeafId>) -> Self {
        let mut blocked: BTreeSet<LeafId> = changed.clone();
        for id in changed {
            blocked.extend(graph.transitive_dependents(id));
        }
        let batches = graph.rebuild_batches(&blocked);
        Self {
            changed: changed.clone(),
            blocked,
            batches,
        }
    }

    /// Whether the blocked set invalidates every leaf.
    pub fn covers_everything(&self, leaf_count: usize) -> bool {
        self.blocked.len() >= leaf_count
    }
}

/// Greedy cover of the blocked set by cached depth-1 subtrees.
///
/// Picks, repeatedly, the first-level parent whose leaf evidence covers the
/// most still-uncovered blocked leaves. The result is the set of subtrees a
/// localized rebuild regenerates; everything outside them is reusable. If
/// the cover ends up spanning every leaf of the cached tree, reuse buys
/// nothing and the caller should fall back to a full rebuild.
pub fn invalidated_subtrees(tree: &ExplanationTree, blocked: &BTreeSet<LeafId>) -> Vec<NodeId> {
    let mut candidates: Vec<(NodeId, BTreeSet<LeafId>)> = tree
        .nodes
        .values()
        .filter_map(|node| match node {
            TreeNode::Parent(p) if p.depth == 1 => {
                Some((p.id.clone(), p.evidence_refs.iter().cloned().collect()))
            }
            _ => None,
        })
        .collect();
    candidates.sort_by(|a, b| a.0.cmp(&b.0));

    let mut uncovered: BTreeSet<&LeafId> = blocked
        .iter()
        .filter(|id| tree.leaf_ids.binary_search(*id).is_ok())
        .collect();
    let mut picked = Vec::new();

    while !uncovered.is_empty() {
        let best = candidates
            .iter()
            .map(|(id, evidence)| {
                let gain = uncovered.iter().filter(|l| evidence.contains(**l)).count();
                (gain, id.clone())
            })
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)));
        match best {
            Some((gain, id)) if gain > 0 => {
                if let Some((_, evidence)) = candidates.iter().find(|(cid, _)| *cid == id) {
                    uncovered.retain(|l| !evidence.contains(*l));
                }
                picked.push(id);
            }
            // Blocked leaves that sit directly under the root (passthrough
            // chains) are not under any depth-1 parent; they regenerate with
            // the layers above them.
            _ => break,
        }
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceSpan;

    fn leaf(id: &str, statement: &str, prereqs: &[&str]) -> Leaf {
        Leaf::new(
            id,
            format!("Decl.{id}"),
            statement,
            Some(1),
            prereqs.iter().map(|p| LeafId::new(*p)).collect(),
            SourceSpan::new("Main.lean", 1, 1),
        )
    }

    #[test]
    fn test_whitespace_only_edit_is_semantic_noop() {
        let old = vec![leaf("l1", "n + 0 = n", &[]), leaf("l2", "0 + n = n", &["l1"])];
        let new = vec![
            leaf("l1", "n   +  0 =\tn", &[]),
            leaf("l2", "0 + n = n", &["l1"]),
        ];
        assert_eq!(classify_change(&old, &new), ChangeClass::SemanticNoop);
    }

    #[test]
    fn test_statement_edit_is_localized() {
        let old = vec![leaf("l1", "n + 0 = n", &[]), leaf("l2", "0 + n = n", &["l1"])];
        let new = vec![
            leaf("l1", "n + 0 = n", &[]),
            leaf("l2", "0 + n = n for all n", &["l1"]),
        ];
        match classify_change(&old, &new) {
            ChangeClass::Localized { changed } => {
                assert_eq!(changed, BTreeSet::from([LeafId::new("l2")]));
            }
            other => panic!("expected localized, got {other:?}"),
        }
    }

    #[test]
    fn test_edge_change_is_topology_even_with_same_ids() {
        let old = vec![leaf("l1", "a", &[]), leaf("l2", "b", &["l1"])];
        let new = vec![leaf("l1", "a", &[]), leaf("l2", "b", &[])];
        // The dropped prerequisite also flips l2's content hash.
        match classify_change(&old, &new) {
            ChangeClass::Topology {
                changed,
                added,
                removed,
            } => {
                assert!(changed.contains(&LeafId::new("l2")));
                assert!(added.is_empty());
                assert!(removed.is_empty());
            }
            other => panic!("expected topology, got {other:?}"),
        }
    }

    #[test]
    fn test_added_and_removed_ids_are_topology() {
        let old = vec![leaf("l1", "a", &[]), leaf("l2", "b", &[])];
        let new = vec![leaf("l1", "a", &[]), leaf("l3", "c", &[])];
        match classify_change(&old, &new) {
            ChangeClass::Topology { added, removed, .. } => {
                assert_eq!(added, BTreeSet::from([LeafId::new("l3")]));
                assert_eq!(removed, BTreeSet::from([LeafId::new("l2")]));
            }
            other => panic!("expected topology, got {other:?}"),
        }
    }

    #[test]
    fn test_blocked_plan_includes_transitive_dependents() {
        // l1 <- l2 <- l3, l4 independent.
        let leaves = vec![
            leaf("l1", "a", &[]),
            leaf("l2", "b", &["l1"]),
            leaf("l3", "c", &["l2"]),
            leaf("l4", "d", &[]),
        ];
        let graph = DependencyGraph::build(&leaves);
        let changed = BTreeSet::from([LeafId::new("l1")]);
        let plan = BlockedSubtreePlan::compute(&graph, &changed);

        assert_eq!(
            plan.blocked,
            BTreeSet::from([LeafId::new("l1"), LeafId::new("l2"), LeafId::new("l3")])
        );
        assert!(!plan.covers_everything(4));
        assert!(plan.covers_everything(3));
        assert!(!plan.batches.is_empty());
    }
}

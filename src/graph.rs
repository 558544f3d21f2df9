//! Dependency graph analyzer.
//!
//! Builds a directed graph over the current leaves' prerequisite relations
//! and runs a strongly-connected-components pass once per build, O(V+E).
//! Prerequisite cycles are a fact of real proof bases (mutual induction),
//! so nothing here assumes acyclicity: every traversal carries a visited set
//! and re-visitation is expected.
//!
//! Declarations referenced only as prerequisite targets but absent from the
//! indexed set are **external** nodes, never errors.
//!
//! Consumers: the policy engine (prerequisite-order checks) and the
//! incremental cache (blocked-set and rebuild-batch computation).

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::types::{Leaf, LeafId};

/// Directed dependency graph with its SCC decomposition.
///
/// Edges point dependency → dependent: an edge (p, n) means declaration `p`
/// is a prerequisite of declaration `n`.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    ids: Vec<LeafId>,
    index: BTreeMap<LeafId, usize>,
    /// Out-edges: dependency -> dependents.
    out: Vec<Vec<usize>>,
    /// In-edges: dependent -> dependencies.
    into: Vec<Vec<usize>>,
    edge_count: usize,
    indexed: Vec<bool>,
    scc_of: Vec<usize>,
    sccs: Vec<Vec<usize>>,
    cyclic: Vec<bool>,
}

impl DependencyGraph {
    /// Build the graph and its SCC decomposition from the current leaves.
    pub fn build(leaves: &[Leaf]) -> Self {
        // Indexed nodes first, in id order, then external targets in id order.
        let mut index: BTreeMap<LeafId, usize> = BTreeMap::new();
        let mut ids: Vec<LeafId> = Vec::new();
        let mut sorted_ids: Vec<&LeafId> = leaves.iter().map(|l| &l.id).collect();
        sorted_ids.sort();
        for id in sorted_ids {
            if !index.contains_key(id) {
                index.insert(id.clone(), ids.len());
                ids.push(id.clone());
            }
        }
        let indexed_count = ids.len();

        let mut externals: BTreeSet<LeafId> = BTreeSet::new();
        for leaf in leaves {
            for prereq in &leaf.prerequisites {
                if !index.contains_key(prereq) {
                    externals.insert(prereq.clone());
                }
            }
        }
        for ext in externals {
            index.insert(ext.clone(), ids.len());
            ids.push(ext);
        }

        let n = ids.len();
        let mut indexed = vec![false; n];
        for flag in indexed.iter_mut().take(indexed_count) {
            *flag = true;
        }

        let mut edges: BTreeSet<(usize, usize)> = BTreeSet::new();
        for leaf in leaves {
            let to = index[&leaf.id];
            for prereq in &leaf.prerequisites {
                let from = index[prereq];
                edges.insert((from, to));
            }
        }

        let mut out = vec![Vec::new(); n];
        let mut into = vec![Vec::new(); n];
        for &(from, to) in &edges {
            out[from].push(to);
            into[to].push(from);
        }

        let (scc_of, sccs) = tarjan_sccs(n, &out);
        let cyclic = sccs
            .iter()
            .map(|members| {
                members.len() > 1
                    || members
                        .first()
                        .is_some_and(|&v| edges.contains(&(v, v)))
            })
            .collect();

        Self {
            ids,
            index,
            out,
            into,
            edge_count: edges.len(),
            indexed,
            scc_of,
            sccs,
            cyclic,
        }
    }

    fn ix(&self, id: &LeafId) -> Option<usize> {
        self.index.get(id).copied()
    }

    fn ids_at(&self, ixs: &[usize]) -> Vec<LeafId> {
        let mut out: Vec<LeafId> = ixs.iter().map(|&v| self.ids[v].clone()).collect();
        out.sort();
        out
    }

    /// Whether the declaration appears in the graph at all.
    pub fn contains(&self, id: &LeafId) -> bool {
        self.index.contains_key(id)
    }

    /// Whether the declaration is external (referenced but not indexed).
    pub fn is_external(&self, id: &LeafId) -> bool {
        self.ix(id).is_some_and(|v| !self.indexed[v])
    }

    /// Direct prerequisite declarations of `id`, sorted.
    pub fn direct_dependencies(&self, id: &LeafId) -> Vec<LeafId> {
        self.ix(id)
            .map(|v| self.ids_at(&self.into[v]))
            .unwrap_or_default()
    }

    /// Declarations that directly depend on `id`, sorted.
    pub fn direct_dependents(&self, id: &LeafId) -> Vec<LeafId> {
        self.ix(id)
            .map(|v| self.ids_at(&self.out[v]))
            .unwrap_or_default()
    }

    /// Every declaration `id` transitively depends on, sorted.
    pub fn transitive_dependencies(&self, id: &LeafId) -> Vec<LeafId> {
        self.reachable(id, &self.into)
    }

    /// Every declaration transitively depending on `id`, sorted.
    pub fn transitive_dependents(&self, id: &LeafId) -> Vec<LeafId> {
        self.reachable(id, &self.out)
    }

    fn reachable(&self, id: &LeafId, adjacency: &[Vec<usize>]) -> Vec<LeafId> {
        let Some(start) = self.ix(id) else {
            return Vec::new();
        };
        // `start` is not seeded into the visited set, so it appears in the
        // closure exactly when some path leads back to it, which keeps cyclic
        // declarations mutually reachable with their SCC peers.
        let mut visited: BTreeSet<usize> = BTreeSet::new();
        let mut queue: VecDeque<usize> = VecDeque::new();
        queue.push_back(start);
        while let Some(v) = queue.pop_front() {
            for &next in &adjacency[v] {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        self.ids_at(&visited.into_iter().collect::<Vec<_>>())
    }

    /// Index of the SCC the declaration belongs to.
    pub fn scc_index(&self, id: &LeafId) -> Option<usize> {
        self.ix(id).map(|v| self.scc_of[v])
    }

    /// Members of the declaration's SCC, sorted.
    pub fn scc_members(&self, id: &LeafId) -> Vec<LeafId> {
        self.scc_index(id)
            .map(|s| self.ids_at(&self.sccs[s]))
            .unwrap_or_default()
    }

    /// Whether the declaration sits on a dependency cycle.
    pub fn in_cycle(&self, id: &LeafId) -> bool {
        self.scc_index(id).is_some_and(|s| self.cyclic[s])
    }

    /// Summary statistics for the query surface.
    pub fn stats(&self) -> GraphStats {
        let indexed_node_count = self.indexed.iter().filter(|&&b| b).count();
        let missing: Vec<LeafId> = self
            .ids
            .iter()
            .zip(&self.indexed)
            .filter(|(_, &indexed)| !indexed)
            .map(|(id, _)| id.clone())
            .collect();
        let cyclic_sccs: Vec<Vec<LeafId>> = self
            .sccs
            .iter()
            .zip(&self.cyclic)
            .filter(|(_, &c)| c)
            .map(|(members, _)| self.ids_at(members))
            .collect();

        GraphStats {
            node_count: self.ids.len(),
            edge_count: self.edge_count,
            indexed_node_count,
            external_node_count: self.ids.len() - indexed_node_count,
            missing_dependency_refs: missing,
            scc_count: self.sccs.len(),
            cyclic_scc_count: cyclic_sccs.len(),
            cyclic_sccs,
        }
    }

    /// Per-declaration view for the query surface.
    pub fn declaration_view(&self, id: &LeafId) -> Option<DeclarationView> {
        let v = self.ix(id)?;
        Some(DeclarationView {
            id: id.clone(),
            external: !self.indexed[v],
            direct_dependencies: self.direct_dependencies(id),
            direct_dependents: self.direct_dependents(id),
            transitive_dependencies: self.transitive_dependencies(id),
            transitive_dependents: self.transitive_dependents(id),
            scc_index: self.scc_of[v],
            in_cycle: self.cyclic[self.scc_of[v]],
        })
    }

    /// Partition an affected declaration set into rebuild batches.
    ///
    /// Each batch is one topological layer of the SCC condensation restricted
    /// to the affected set. A batch drawing from a cyclic SCC is flagged
    /// `cyclic` so callers can surface the unresolved cycle instead of
    /// silently serializing it.
    pub fn rebuild_batches(&self, affected: &BTreeSet<LeafId>) -> Vec<RebuildBatch> {
        let affected_ixs: BTreeSet<usize> =
            affected.iter().filter_map(|id| self.ix(id)).collect();
        if affected_ixs.is_empty() {
            return Vec::new();
        }

        let affected_sccs: BTreeSet<usize> =
            affected_ixs.iter().map(|&v| self.scc_of[v]).collect();

        // Condensation edges among affected SCCs.
        let mut preds: BTreeMap<usize, BTreeSet<usize>> = affected_sccs
            .iter()
            .map(|&s| (s, BTreeSet::new()))
            .collect();
        for &v in &affected_ixs {
            for &next in &self.out[v] {
                let (a, b) = (self.scc_of[v], self.scc_of[next]);
                if a != b && affected_sccs.contains(&a) && affected_sccs.contains(&b) {
                    if let Some(set) = preds.get_mut(&b) {
                        set.insert(a);
                    }
                }
            }
        }

        let mut done: BTreeSet<usize> = BTreeSet::new();
        let mut batches = Vec::new();
        while done.len() < affected_sccs.len() {
            let ready: Vec<usize> = affected_sccs
                .iter()
                .filter(|s| !done.contains(s))
                .filter(|s| preds[s].iter().all(|p| done.contains(p)))
                .copied()
                .collect();
            debug_assert!(!ready.is_empty(), "condensation is acyclic");
            if ready.is_empty() {
                break;
            }

            let mut batch_ids: Vec<LeafId> = Vec::new();
            let mut cyclic = false;
            for &s in &ready {
                cyclic |= self.cyclic[s];
                for &v in &self.sccs[s] {
                    if affected_ixs.contains(&v) {
                        batch_ids.push(self.ids[v].clone());
                    }
                }
                done.insert(s);
            }
            batch_ids.sort();
            batches.push(RebuildBatch {
                ids: batch_ids,
                cyclic,
            });
        }
        batches
    }
}

/// One topological rebuild batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildBatch {
    /// Affected declarations in this layer, sorted.
    pub ids: Vec<LeafId>,
    /// True when the batch draws from an unresolved dependency cycle.
    pub cyclic: bool,
}

/// Graph-level statistics for the query surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    /// Indexed plus external nodes.
    pub node_count: usize,
    /// Distinct dependency edges.
    pub edge_count: usize,
    /// Declarations present in the leaf set.
    pub indexed_node_count: usize,
    /// Declarations seen only as prerequisite targets.
    pub external_node_count: usize,
    /// The external declarations, sorted.
    pub missing_dependency_refs: Vec<LeafId>,
    /// Total strongly connected components.
    pub scc_count: usize,
    /// Components denoting a cycle.
    pub cyclic_scc_count: usize,
    /// Members of each cyclic component, sorted.
    pub cyclic_sccs: Vec<Vec<LeafId>>,
}

/// Per-declaration dependency view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclarationView {
    /// The declaration.
    pub id: LeafId,
    /// Whether it is external to the indexed set.
    pub external: bool,
    /// Direct prerequisites, sorted.
    pub direct_dependencies: Vec<LeafId>,
    /// Direct dependents, sorted.
    pub direct_dependents: Vec<LeafId>,
    /// Transitive prerequisites, sorted.
    pub transitive_dependencies: Vec<LeafId>,
    /// Transitive dependents, sorted.
    pub transitive_dependents: Vec<LeafId>,
    /// SCC index.
    pub scc_index: usize,
    /// Whether the declaration sits on a cycle.
    pub in_cycle: bool,
}

/// Iterative Tarjan SCC. Returns (scc index per node, members per SCC).
fn tarjan_sccs(n: usize, out: &[Vec<usize>]) -> (Vec<usize>, Vec<Vec<usize>>) {
    const UNSET: usize = usize::MAX;

    let mut index_of = vec![UNSET; n];
    let mut lowlink = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut scc_of = vec![0usize; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut sccs: Vec<Vec<usize>> = Vec::new();
    let mut next_index = 0usize;

    for root in 0..n {
        if index_of[root] != UNSET {
            continue;
        }
        // Explicit call stack of (node, next out-edge position).
        let mut call: Vec<(usize, usize)> = vec![(root, 0)];
        while let Some(&mut (v, ref mut pos)) = call.last_mut() {
            if *pos == 0 {
                index_of[v] = next_index;
                lowlink[v] = next_index;
                next_index += 1;
                stack.push(v);
                on_stack[v] = true;
            }
            if let Some(&w) = out[v].get(*pos) {
                *pos += 1;
                if index_of[w] == UNSET {
                    call.push((w, 0));
                } else if on_stack[w] {
                    lowlink[v] = lowlink[v].min(index_of[w]);
                }
            } else {
                call.pop();
                if let Some(&(parent, _)) = call.last() {
                    lowlink[parent] = lowlink[parent].min(lowlink[v]);
                }
                if lowlink[v] == index_of[v] {
                    let mut members = Vec::new();
                    loop {
                        let w = stack.pop().expect("SCC stack underflow");
                        on_stack[w] = false;
                        scc_of[w] = sccs.len();
                        members.push(w);
                        if w == v {
                            break;
                        }
                    }
                    members.sort_unstable();
                    sccs.push(members);
                }
            }
        }
    }

    (scc_of, sccs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceSpan;

    fn make_leaf(id: &str, prereqs: &[&str]) -> Leaf {
        Leaf::new(
            id,
            format!("Decl.{id}"),
            format!("statement {id}"),
            Some(1),
            prereqs.iter().map(|p| LeafId::new(*p)).collect(),
            SourceSpan::new("Main.lean", 1, 1),
        )
    }

    #[test]
    fn test_linear_chain_has_no_cycles() {
        let leaves = vec![
            make_leaf("a", &[]),
            make_leaf("b", &["a"]),
            make_leaf("c", &["b"]),
        ];
        let graph = DependencyGraph::build(&leaves);
        let stats = graph.stats();

        assert_eq!(stats.node_count, 3);
        assert_eq!(stats.edge_count, 2);
        assert_eq!(stats.scc_count, 3);
        assert_eq!(stats.cyclic_scc_count, 0);
        assert!(!graph.in_cycle(&LeafId::new("b")));
    }

    #[test]
    fn test_four_cycle_is_one_scc() {
        // a -> b -> c -> d -> a
        let leaves = vec![
            make_leaf("a", &["d"]),
            make_leaf("b", &["a"]),
            make_leaf("c", &["b"]),
            make_leaf("d", &["c"]),
        ];
        let graph = DependencyGraph::build(&leaves);
        let stats = graph.stats();

        assert_eq!(stats.scc_count, 1);
        assert_eq!(stats.cyclic_scc_count, 1);
        assert_eq!(stats.cyclic_sccs[0].len(), 4);
        assert!(graph.in_cycle(&LeafId::new("a")));
    }

    #[test]
    fn test_external_refs_are_nodes_not_errors() {
        let leaves = vec![make_leaf("a", &["Mathlib.Nat.add_zero"])];
        let graph = DependencyGraph::build(&leaves);
        let stats = graph.stats();

        assert_eq!(stats.indexed_node_count, 1);
        assert_eq!(stats.external_node_count, 1);
        assert_eq!(
            stats.missing_dependency_refs,
            vec![LeafId::new("Mathlib.Nat.add_zero")]
        );
        assert!(graph.is_external(&LeafId::new("Mathlib.Nat.add_zero")));
    }

    #[test]
    fn test_transitive_closure() {
        let leaves = vec![
            make_leaf("a", &[]),
            make_leaf("b", &["a"]),
            make_leaf("c", &["b"]),
            make_leaf("d", &["a"]),
        ];
        let graph = DependencyGraph::build(&leaves);

        assert_eq!(
            graph.transitive_dependencies(&LeafId::new("c")),
            vec![LeafId::new("a"), LeafId::new("b")]
        );
        assert_eq!(
            graph.transitive_dependents(&LeafId::new("a")),
            vec![LeafId::new("b"), LeafId::new("c"), LeafId::new("d")]
        );
    }

    #[test]
    fn test_cycle_member_is_in_its_own_closure() {
        // a <-> b, with c hanging off b.
        let leaves = vec![
            make_leaf("a", &["b"]),
            make_leaf("b", &["a"]),
            make_leaf("c", &["b"]),
        ];
        let graph = DependencyGraph::build(&leaves);

        let view = graph.declaration_view(&LeafId::new("a")).unwrap();
        assert!(view.in_cycle);
        assert_eq!(
            view.transitive_dependents,
            vec![LeafId::new("a"), LeafId::new("b"), LeafId::new("c")]
        );
        assert_eq!(
            view.transitive_dependencies,
            vec![LeafId::new("a"), LeafId::new("b")]
        );

        // Acyclic declarations never include themselves.
        let view = graph.declaration_view(&LeafId::new("c")).unwrap();
        assert_eq!(view.transitive_dependents, Vec::<LeafId>::new());
    }

    #[test]
    fn test_self_loop_is_cyclic() {
        let leaves = vec![make_leaf("a", &["a"])];
        let graph = DependencyGraph::build(&leaves);
        assert!(graph.in_cycle(&LeafId::new("a")));
        assert_eq!(graph.stats().cyclic_scc_count, 1);
    }

    #[test]
    fn test_declaration_view() {
        let leaves = vec![make_leaf("a", &[]), make_leaf("b", &["a"])];
        let graph = DependencyGraph::build(&leaves);

        let view = graph.declaration_view(&LeafId::new("b")).unwrap();
        assert!(!view.external);
        assert_eq!(view.direct_dependencies, vec![LeafId::new("a")]);
        assert!(!view.in_cycle);
        assert!(graph.declaration_view(&LeafId::new("zz")).is_none());
    }

    #[test]
    fn test_rebuild_batches_follow_topology() {
        let leaves = vec![
            make_leaf("a", &[]),
            make_leaf("b", &["a"]),
            make_leaf("c", &["b"]),
        ];
        let graph = DependencyGraph::build(&leaves);
        let affected: BTreeSet<LeafId> =
            ["a", "b", "c"].iter().map(|s| LeafId::new(*s)).collect();

        let batches = graph.rebuild_batches(&affected);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].ids, vec![LeafId::new("a")]);
        assert!(batches.iter().all(|b| !b.cyclic));
    }

    #[test]
    fn test_rebuild_batches_flag_cycles() {
        let leaves = vec![
            make_leaf("a", &["b"]),
            make_leaf("b", &["a"]),
            make_leaf("c", &["b"]),
        ];
        let graph = DependencyGraph::build(&leaves);
        let affected: BTreeSet<LeafId> =
            ["a", "b", "c"].iter().map(|s| LeafId::new(*s)).collect();

        let batches = graph.rebuild_batches(&affected);
        assert_eq!(batches.len(), 2);
        assert!(batches[0].cyclic);
        assert_eq!(batches[0].ids.len(), 2);
        assert!(!batches[1].cyclic);
    }

    #[test]
    fn test_rebuild_batches_restricted_to_affected() {
        let leaves = vec![
            make_leaf("a", &[]),
            make_leaf("b", &["a"]),
            make_leaf("c", &["b"]),
        ];
        let graph = DependencyGraph::build(&leaves);
        let affected: BTreeSet<LeafId> = [LeafId::new("c")].into_iter().collect();

        let batches = graph.rebuild_batches(&affected);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].ids, vec![LeafId::new("c")]);
    }
}

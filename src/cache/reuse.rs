//! Parent reuse across rebuilds.
//!
//! During an incremental rebuild the tree builder runs as usual, but its
//! provider is wrapped: before every summarization call the wrapper looks
//! for a parent in the prior tree that matches the requested group, and
//! answers from the cached summary when exactly one unblocked candidate
//! exists. Grouping is provider-independent, so wrapping never changes the
//! shape of the result, only which summaries cost a provider call.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::canonical::statement_hash_hex;
use crate::error::ProviderError;
use crate::provider::{ParentSummary, SummarizationProvider, SummaryRequest};
use crate::types::{ExplanationTree, LeafId, NodeId, ParentNode, TreeNode};

/// Lookup structures over the prior tree's parents.
pub(crate) struct ReuseIndex {
    parents: BTreeMap<NodeId, ParentNode>,
    by_child_ids: BTreeMap<Vec<NodeId>, Vec<NodeId>>,
    by_statement_hashes: BTreeMap<Vec<String>, Vec<NodeId>>,
    child_hashes: BTreeMap<NodeId, BTreeSet<String>>,
    prior_ids: BTreeSet<NodeId>,
    prior_statement_hashes: BTreeSet<String>,
}

impl ReuseIndex {
    pub(crate) fn build(tree: &ExplanationTree) -> Self {
        let mut parents = BTreeMap::new();
        let mut by_child_ids: BTreeMap<Vec<NodeId>, Vec<NodeId>> = BTreeMap::new();
        let mut by_statement_hashes: BTreeMap<Vec<String>, Vec<NodeId>> = BTreeMap::new();
        let mut child_hashes: BTreeMap<NodeId, BTreeSet<String>> = BTreeMap::new();
        let prior_ids: BTreeSet<NodeId> = tree.nodes.keys().cloned().collect();
        let prior_statement_hashes: BTreeSet<String> = tree
            .nodes
            .values()
            .map(|node| statement_hash_hex(node.statement()))
            .collect();

        for node in tree.nodes.values() {
            let TreeNode::Parent(parent) = node else {
                continue;
            };
            let mut child_ids = parent.children.clone();
            child_ids.sort();
            by_child_ids
                .entry(child_ids)
                .or_default()
                .push(parent.id.clone());

            let mut hashes: Vec<String> = parent
                .children
                .iter()
                .filter_map(|id| tree.nodes.get(id))
                .map(|child| statement_hash_hex(child.statement()))
                .collect();
            hashes.sort();
            child_hashes.insert(parent.id.clone(), hashes.iter().cloned().collect());
            by_statement_hashes
                .entry(hashes)
                .or_default()
                .push(parent.id.clone());

            parents.insert(parent.id.clone(), parent.clone());
        }

        Self {
            parents,
            by_child_ids,
            by_statement_hashes,
            child_hashes,
            prior_ids,
            prior_statement_hashes,
        }
    }
}

/// Provider wrapper that serves matching prior parents from cache.
pub(crate) struct ReuseProvider {
    inner: Arc<dyn SummarizationProvider>,
    index: ReuseIndex,
    blocked: BTreeSet<LeafId>,
    reused: AtomicU64,
    regenerated: AtomicU64,
}

enum Match {
    /// Exactly one unblocked candidate.
    One(NodeId),
    /// No candidate; try the next matcher.
    None,
    /// Ambiguous or blocked; regenerate without trying weaker matchers.
    Regenerate,
}

impl ReuseProvider {
    pub(crate) fn new(
        inner: Arc<dyn SummarizationProvider>,
        prior: &ExplanationTree,
        blocked: BTreeSet<LeafId>,
    ) -> Self {
        Self {
            inner,
            index: ReuseIndex::build(prior),
            blocked,
            reused: AtomicU64::new(0),
            regenerated: AtomicU64::new(0),
        }
    }

    pub(crate) fn reused(&self) -> u64 {
        self.reused.load(Ordering::SeqCst)
    }

    pub(crate) fn regenerated(&self) -> u64 {
        self.regenerated.load(Ordering::SeqCst)
    }

    fn is_reusable(&self, parent: &ParentNode) -> bool {
        parent.evidence_refs.is_disjoint(&self.blocked)
    }

    fn resolve(&self, candidates: Option<&Vec<NodeId>>) -> Match {
        match candidates.map(Vec::as_slice) {
            None | Some([]) => Match::None,
            Some([single]) => {
                let Some(parent) = self.index.parents.get(single) else {
                    return Match::None;
                };
                if self.is_reusable(parent) {
                    Match::One(single.clone())
                } else {
                    Match::Regenerate
                }
            }
            Some(_) => Match::Regenerate,
        }
    }

    /// Exact match on the sorted child id set.
    ///
    /// Parent ids are content-derived from child sets, so this matcher also
    /// covers stable-id reuse: an unchanged group reproduces the same id.
    fn match_child_ids(&self, ids: &[NodeId]) -> Match {
        let mut sorted = ids.to_vec();
        sorted.sort();
        self.resolve(self.index.by_child_ids.get(&sorted))
    }

    /// Match on the sorted child statement hashes; catches groups whose ids
    /// were renamed but whose content is untouched.
    fn match_statement_hashes(&self, request: &SummaryRequest) -> Match {
        let mut hashes: Vec<String> = request
            .children
            .iter()
            .map(|c| statement_hash_hex(&c.statement))
            .collect();
        hashes.sort();
        self.resolve(self.index.by_statement_hashes.get(&hashes))
    }

    /// Frontier-restricted match on ids: ignore children that only one side
    /// knows about and require the shared frontier to agree exactly.
    fn match_frontier(&self, ids: &[NodeId]) -> Match {
        let request_set: BTreeSet<&NodeId> = ids.iter().collect();
        let shared: BTreeSet<&NodeId> = ids
            .iter()
            .filter(|id| self.index.prior_ids.contains(*id))
            .collect();
        // A single agreeing child is too weak a signal; it would let a group
        // adopt the summary of any old parent it shares one member with.
        if shared.len() < 2 {
            return Match::None;
        }

        let mut hits: Vec<NodeId> = Vec::new();
        for (id, parent) in &self.index.parents {
            let restricted: BTreeSet<&NodeId> = parent
                .children
                .iter()
                .filter(|c| request_set.contains(*c))
                .collect();
            if !restricted.is_empty() && restricted == shared {
                hits.push(id.clone());
            }
        }
        match hits.as_slice() {
            [] => Match::None,
            [single] => {
                // resolve() re-checks the blocked set.
                self.resolve(Some(&vec![single.clone()]))
            }
            _ => Match::Regenerate,
        }
    }

    /// Frontier-restricted match on statement hashes: the same shared-subset
    /// rule as the id frontier, but keyed by content so that children renamed
    /// under id churn still anchor a match.
    fn match_frontier_statements(&self, request: &SummaryRequest) -> Match {
        let request_hashes: BTreeSet<String> = request
            .children
            .iter()
            .map(|c| statement_hash_hex(&c.statement))
            .collect();
        let shared: BTreeSet<&String> = request_hashes
            .iter()
            .filter(|h| self.index.prior_statement_hashes.contains(*h))
            .collect();
        if shared.len() < 2 {
            return Match::None;
        }

        let mut hits: Vec<NodeId> = Vec::new();
        for (id, hashes) in &self.index.child_hashes {
            let restricted: BTreeSet<&String> = hashes
                .iter()
                .filter(|h| request_hashes.contains(*h))
                .collect();
            if !restricted.is_empty() && restricted == shared {
                hits.push(id.clone());
            }
        }
        match hits.as_slice() {
            [] => Match::None,
            [single] => self.resolve(Some(&vec![single.clone()])),
            _ => Match::Regenerate,
        }
    }

    fn lookup(&self, request: &SummaryRequest) -> Option<ParentSummary> {
        let ids: Vec<NodeId> = request.children.iter().map(|c| c.id.clone()).collect();

        let matchers: [&dyn Fn() -> Match; 4] = [
            &|| self.match_child_ids(&ids),
            &|| self.match_statement_hashes(request),
            &|| self.match_frontier(&ids),
            &|| self.match_frontier_statements(request),
        ];
        for matcher in matchers {
            match matcher() {
                Match::One(id) => {
                    let parent = self.index.parents.get(&id)?;
                    debug!(parent = %id, "reusing cached parent summary");
                    return Some(summary_of(parent, &ids));
                }
                Match::Regenerate => return None,
                Match::None => {}
            }
        }
        None
    }
}

/// Evidence refs are rewritten to the requested child ids: the match
/// guarantees content alignment, but fuzzy tiers may have matched under
/// renamed ids.
fn summary_of(parent: &ParentNode, child_ids: &[NodeId]) -> ParentSummary {
    ParentSummary {
        parent_statement: parent.statement.clone(),
        why_true_from_children: parent.justification.clone(),
        new_terms_introduced: parent.new_terms.clone(),
        complexity_score: parent.complexity_score,
        abstraction_score: parent.abstraction_score,
        evidence_refs: child_ids.to_vec(),
        confidence: parent.confidence,
    }
}

#[async_trait]
impl SummarizationProvider for ReuseProvider {
    async fn summarize(&self, request: &SummaryRequest) -> Result<ParentSummary, ProviderError> {
        if let Some(summary) = self.lookup(request) {
            self.reused.fetch_add(1, Ordering::SeqCst);
            return Ok(summary);
        }
        self.regenerated.fetch_add(1, Ordering::SeqCst);
        self.inner.summarize(request).await
    }
}

//! Tree builder: a per-depth-layer state machine over id-normalized leaves.
//!
//! Each layer is chunked into candidate groups, checked against pre-summary
//! policy, summarized through the external provider, checked against
//! post-summary policy, and materialized into parents. Non-compliant groups
//! are repaired by deterministic repartition inside a bounded retry budget;
//! the accumulator of [`RepartitionEvent`]s rides on the finished tree.
//!
//! ## Synchronization model
//!
//! Grouping and partitioning are synchronous and pure. The only suspension
//! point is the provider call, one per surviving group per layer; calls
//! within a layer run concurrently, and depth d+1 starts only after every
//! group at depth d has produced output. A provider error aborts the build
//! as an infrastructure failure; partially built layers are discarded.

mod partition;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{BuildError, ContractError, PolicyFailure, ProviderError};
use crate::policy::{
    check_post_summary, check_pre_summary, is_unresolvable, ExplanationConfig, GroupChild,
    PolicyDecision,
};
use crate::provider::{ParentSummary, PromptChild, SummarizationProvider, SummaryRequest};
use crate::types::{
    ExplanationTree, GroupDecision, GroupingDiagnostics, LeafId, LeafSet, NodeId, ParentNode,
    RepartitionEvent, RepartitionReason, TreeNode,
};

use partition::{chunk_layer, order_group, split_group};

/// Ordering key for a slot within a layer: chunk index plus split lineage.
type SlotKey = Vec<u32>;

/// Builds explanation trees against a fixed config.
pub struct TreeBuilder {
    provider: Arc<dyn SummarizationProvider>,
    config: ExplanationConfig,
}

impl TreeBuilder {
    /// Create a builder.
    pub fn new(provider: Arc<dyn SummarizationProvider>, config: ExplanationConfig) -> Self {
        Self { provider, config }
    }

    /// The config this builder runs under.
    pub fn config(&self) -> &ExplanationConfig {
        &self.config
    }

    /// Build the full hierarchy for a leaf set.
    pub async fn build(&self, leaf_set: &LeafSet) -> Result<ExplanationTree, BuildError> {
        self.config.validate()?;
        if leaf_set.len() > 1 && self.config.max_children_per_parent < 2 {
            return Err(ContractError::new(
                "invalid_max_children_per_parent",
                format!(
                    "max_children_per_parent={} can never group {} leaves",
                    self.config.max_children_per_parent,
                    leaf_set.len()
                ),
                BTreeMap::from([
                    (
                        "max_children_per_parent".to_string(),
                        self.config.max_children_per_parent.to_string(),
                    ),
                    ("leaf_count".to_string(), leaf_set.len().to_string()),
                ]),
            )
            .into());
        }

        let config_hash = self.config.config_hash();
        let mut nodes: BTreeMap<NodeId, TreeNode> = BTreeMap::new();
        for leaf in leaf_set.leaves() {
            nodes.insert(NodeId::from(&leaf.id), TreeNode::Leaf(leaf.clone()));
        }

        // Single-leaf input short-circuits: the leaf is the root.
        if leaf_set.len() == 1 {
            let root_id = NodeId::from(&leaf_set.leaves()[0].id);
            return Ok(ExplanationTree {
                root_id,
                leaf_ids: leaf_set.ids(),
                config_hash,
                nodes,
                group_plan: vec![],
                grouping_diagnostics: vec![],
                policy_diagnostics: BTreeMap::new(),
                max_depth: 0,
            });
        }

        let mut layer: Vec<GroupChild> = leaf_set
            .leaves()
            .iter()
            .map(|leaf| GroupChild {
                id: NodeId::from(&leaf.id),
                complexity: leaf.complexity,
                statement: leaf.statement.clone(),
                prerequisites: leaf.prerequisites.iter().map(NodeId::from).collect(),
            })
            .collect();

        let mut group_plan: Vec<GroupDecision> = Vec::new();
        let mut grouping_diagnostics: Vec<GroupingDiagnostics> = Vec::new();
        let mut policy_diagnostics: BTreeMap<NodeId, PolicyDecision> = BTreeMap::new();
        let mut layer_depth = 0u32;

        while layer.len() > 1 {
            let outcome = self
                .build_layer(&mut nodes, &layer, layer_depth, &mut policy_diagnostics)
                .await?;

            debug!(
                depth = layer_depth,
                groups = outcome.diagnostics.group_count,
                passthrough = outcome.diagnostics.passthrough_count,
                repartitions = outcome.diagnostics.repartition_events.len(),
                "layer complete"
            );

            if outcome.next_layer == layer {
                // Identical layer: every slot passed through and nothing was
                // shed, so another iteration would repeat forever. A first
                // all-passthrough layer still differs because promotion drops
                // complexity hints.
                let group: Vec<NodeId> = layer.iter().map(|c| c.id.clone()).collect();
                let pre_summary = check_pre_summary(&layer, &self.config);
                return Err(PolicyFailure {
                    depth: layer_depth,
                    group,
                    rounds: 0,
                    pre_summary,
                    post_summary: None,
                }
                .into());
            }

            group_plan.extend(outcome.decisions);
            grouping_diagnostics.push(outcome.diagnostics);
            layer = outcome.next_layer;
            layer_depth += 1;
        }

        let root_id = layer[0].id.clone();
        let max_depth = nodes.get(&root_id).map(|n| n.depth()).unwrap_or(0);

        let tree = ExplanationTree {
            root_id,
            leaf_ids: leaf_set.ids(),
            config_hash,
            nodes,
            group_plan,
            grouping_diagnostics,
            policy_diagnostics,
            max_depth,
        };
        debug_assert!(tree.validate().ok, "built tree failed validation");
        Ok(tree)
    }

    async fn build_layer(
        &self,
        nodes: &mut BTreeMap<NodeId, TreeNode>,
        layer: &[GroupChild],
        layer_depth: u32,
        policy_diagnostics: &mut BTreeMap<NodeId, PolicyDecision>,
    ) -> Result<LayerOutcome, BuildError> {
        let budget = self.config.repartition_budget;
        let mut events: Vec<RepartitionEvent> = Vec::new();
        let mut passthrough: Vec<(SlotKey, GroupChild)> = Vec::new();
        let mut ready: Vec<(SlotKey, Vec<GroupChild>, u32)> = Vec::new();

        // Phase 1: chunk in id order, then resolve pre-summary policy with
        // bounded repartition.
        let mut queue: VecDeque<(SlotKey, Vec<GroupChild>, u32)> =
            chunk_layer(layer, self.config.max_children_per_parent)
                .into_iter()
                .enumerate()
                .map(|(ix, chunk)| (vec![ix as u32], chunk, 0u32))
                .collect();

        while let Some((key, group, round)) = queue.pop_front() {
            if group.len() == 1 {
                let mut single = group;
                passthrough.push((key, single.remove(0)));
                continue;
            }
            let ordered = order_group(group);
            let decision = check_pre_summary(&ordered, &self.config);
            if decision.ok {
                ready.push((key, ordered, round));
                continue;
            }
            if is_unresolvable(&ordered, &decision) || round >= budget {
                return Err(PolicyFailure {
                    depth: layer_depth,
                    group: ids_of(&ordered),
                    rounds: round,
                    pre_summary: decision,
                    post_summary: None,
                }
                .into());
            }

            let codes = decision.codes();
            let (left, right) = split_group(&ordered, &codes);
            warn!(
                depth = layer_depth,
                round = round + 1,
                group = ?ids_of(&ordered),
                codes = ?codes,
                "pre-summary policy repartition"
            );
            events.push(RepartitionEvent {
                reason: RepartitionReason::PreSummaryPolicy,
                round: round + 1,
                depth: layer_depth,
                input_ids: ids_of(&ordered),
                output_groups: vec![ids_of(&left), ids_of(&right)],
                violation_codes: codes,
            });
            let mut left_key = key.clone();
            left_key.push(0);
            let mut right_key = key;
            right_key.push(1);
            queue.push_back((left_key, left, round + 1));
            queue.push_back((right_key, right, round + 1));
        }

        // Phase 2: summarize concurrently, check post-summary policy, and
        // re-split failures while the budget allows. Contiguous sub-slices of
        // an ordered group stay ordered and within the original complexity
        // spread, so sub-groups skip the pre-summary check.
        let mut finished: Vec<(SlotKey, Vec<GroupChild>, ParentSummary, PolicyDecision)> =
            Vec::new();
        let mut pending = ready;

        while !pending.is_empty() {
            let mut join: JoinSet<(usize, Result<ParentSummary, ProviderError>)> = JoinSet::new();
            for (ix, (_, group, _)) in pending.iter().enumerate() {
                let request = SummaryRequest::new(
                    prompt_children(nodes, group),
                    &self.config,
                    layer_depth + 1,
                );
                let provider = Arc::clone(&self.provider);
                join.spawn(async move { (ix, provider.summarize(&request).await) });
            }

            let mut results: BTreeMap<usize, ParentSummary> = BTreeMap::new();
            while let Some(joined) = join.join_next().await {
                let (ix, outcome) = joined
                    .map_err(|e| ProviderError::CallFailed(format!("summarization task: {e}")))?;
                results.insert(ix, outcome?);
            }

            let mut next_pending = Vec::new();
            for (ix, (key, group, round)) in pending.into_iter().enumerate() {
                let Some(summary) = results.remove(&ix) else {
                    return Err(
                        ProviderError::CallFailed("summarization result missing".to_string())
                            .into(),
                    );
                };
                let decision = check_post_summary(&group, &summary, &self.config);
                if decision.ok {
                    finished.push((key, group, summary, decision));
                    continue;
                }
                if group.len() > 2 && round < budget {
                    let codes = decision.codes();
                    let (left, right) = split_group(&group, &codes);
                    warn!(
                        depth = layer_depth,
                        round = round + 1,
                        group = ?ids_of(&group),
                        codes = ?codes,
                        "post-summary policy repartition"
                    );
                    events.push(RepartitionEvent {
                        reason: RepartitionReason::PostSummaryPolicy,
                        round: round + 1,
                        depth: layer_depth,
                        input_ids: ids_of(&group),
                        output_groups: vec![ids_of(&left), ids_of(&right)],
                        violation_codes: codes,
                    });
                    for (branch, sub) in [(0u32, left), (1u32, right)] {
                        let mut sub_key = key.clone();
                        sub_key.push(branch);
                        if sub.len() == 1 {
                            let mut single = sub;
                            passthrough.push((sub_key, single.remove(0)));
                        } else {
                            next_pending.push((sub_key, sub, round + 1));
                        }
                    }
                } else {
                    return Err(PolicyFailure {
                        depth: layer_depth,
                        group: ids_of(&group),
                        rounds: round,
                        pre_summary: check_pre_summary(&group, &self.config),
                        post_summary: Some(decision),
                    }
                    .into());
                }
            }
            pending = next_pending;
        }

        // Phase 3: materialize in slot order so group indices and the next
        // layer are independent of call completion order.
        enum Slot {
            Parent(Vec<GroupChild>, ParentSummary, PolicyDecision),
            Passthrough(GroupChild),
        }
        let mut slots: Vec<(SlotKey, Slot)> = finished
            .into_iter()
            .map(|(key, group, summary, decision)| (key, Slot::Parent(group, summary, decision)))
            .chain(
                passthrough
                    .into_iter()
                    .map(|(key, child)| (key, Slot::Passthrough(child))),
            )
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));

        let mut decisions = Vec::new();
        let mut next_layer = Vec::new();
        let mut diagnostics = GroupingDiagnostics {
            depth: layer_depth,
            group_count: 0,
            passthrough_count: 0,
            repartition_events: events,
        };

        for (group_index, (_, slot)) in slots.into_iter().enumerate() {
            match slot {
                Slot::Passthrough(child) => {
                    diagnostics.passthrough_count += 1;
                    decisions.push(GroupDecision {
                        depth: layer_depth,
                        group_index: group_index as u32,
                        input_ids: vec![child.id.clone()],
                        output_id: child.id.clone(),
                        complexity_spread: 0,
                        passthrough: true,
                    });
                    // Hints constrain grouping at the leaf layer only; a node
                    // promoted past its peers no longer blocks convergence.
                    next_layer.push(GroupChild {
                        complexity: None,
                        ..child
                    });
                }
                Slot::Parent(group, summary, decision) => {
                    diagnostics.group_count += 1;
                    let child_ids = ids_of(&group);
                    let depth = 1 + child_ids
                        .iter()
                        .filter_map(|id| nodes.get(id))
                        .map(|n| n.depth())
                        .max()
                        .unwrap_or(0);
                    let parent_id = ParentNode::derive_id(depth, &child_ids);

                    let mut evidence_refs: BTreeSet<LeafId> = BTreeSet::new();
                    for id in &child_ids {
                        if let Some(node) = nodes.get(id) {
                            evidence_refs.extend(node.evidence_refs());
                        }
                    }

                    decisions.push(GroupDecision {
                        depth: layer_depth,
                        group_index: group_index as u32,
                        input_ids: child_ids.clone(),
                        output_id: parent_id.clone(),
                        complexity_spread: spread_of(&group),
                        passthrough: false,
                    });
                    next_layer.push(GroupChild {
                        id: parent_id.clone(),
                        complexity: None,
                        statement: summary.parent_statement.clone(),
                        prerequisites: vec![],
                    });
                    policy_diagnostics.insert(parent_id.clone(), decision);
                    nodes.insert(
                        parent_id.clone(),
                        TreeNode::Parent(ParentNode {
                            id: parent_id,
                            statement: summary.parent_statement,
                            children: child_ids,
                            depth,
                            complexity_score: summary.complexity_score,
                            abstraction_score: summary.abstraction_score,
                            confidence: summary.confidence,
                            justification: summary.why_true_from_children,
                            new_terms: summary.new_terms_introduced,
                            evidence_refs,
                        }),
                    );
                }
            }
        }

        Ok(LayerOutcome {
            next_layer,
            decisions,
            diagnostics,
        })
    }
}

struct LayerOutcome {
    next_layer: Vec<GroupChild>,
    decisions: Vec<GroupDecision>,
    diagnostics: GroupingDiagnostics,
}

fn ids_of(group: &[GroupChild]) -> Vec<NodeId> {
    group.iter().map(|c| c.id.clone()).collect()
}

fn spread_of(group: &[GroupChild]) -> u32 {
    let hints: Vec<u32> = group.iter().filter_map(|c| c.complexity).collect();
    match (hints.iter().min(), hints.iter().max()) {
        (Some(min), Some(max)) => max - min,
        _ => 0,
    }
}

/// Prompt enumeration for a group, from the materialized nodes.
///
/// Leaves expose their extractor hint; parents expose their provider
/// complexity score rounded to the hint scale. Prompt content never feeds
/// back into partition decisions.
fn prompt_children(nodes: &BTreeMap<NodeId, TreeNode>, group: &[GroupChild]) -> Vec<PromptChild> {
    group
        .iter()
        .map(|child| {
            let complexity = match nodes.get(&child.id) {
                Some(TreeNode::Leaf(leaf)) => leaf.complexity,
                Some(TreeNode::Parent(parent)) => Some(parent.complexity_score.round() as u32),
                None => child.complexity,
            };
            PromptChild {
                id: child.id.clone(),
                complexity,
                statement: child.statement.clone(),
            }
        })
        .collect()
}

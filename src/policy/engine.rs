//! Pre- and post-summary policy checks.
//!
//! Both checks are pure, stateless, config-parameterized functions returning
//! a [`PolicyDecision`]. The engine never aborts anything itself; decisions
//! are advisory-with-consequence and the tree builder decides whether to
//! repartition, pass, or fail the build.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::provider::ParentSummary;
use crate::types::NodeId;
use super::config::ExplanationConfig;

/// Stable policy violation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCode {
    /// Complexity spread exceeds the configured band width.
    ComplexityBand,
    /// An in-group prerequisite edge points backward or cyclically.
    PrerequisiteOrder,
    /// The summary's evidence refs do not cover every child.
    EvidenceCoverage,
    /// Parent-statement vocabulary is insufficiently traceable to children.
    VocabularyContinuity,
    /// More new terms introduced than the budget allows.
    TermBudget,
}

impl fmt::Display for ViolationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViolationCode::ComplexityBand => "complexity_band",
            ViolationCode::PrerequisiteOrder => "prerequisite_order",
            ViolationCode::EvidenceCoverage => "evidence_coverage",
            ViolationCode::VocabularyContinuity => "vocabulary_continuity",
            ViolationCode::TermBudget => "term_budget",
        };
        f.write_str(s)
    }
}

/// One itemized policy violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyViolation {
    /// Machine-readable code.
    pub code: ViolationCode,
    /// Human-readable description.
    pub message: String,
    /// Structured context.
    pub details: BTreeMap<String, String>,
}

/// Metrics backing a policy decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyMetrics {
    /// max − min complexity hint across children that carried one.
    pub complexity_spread: u32,
    /// Count of in-group prerequisite edges pointing backward.
    pub prerequisite_order_violations: u32,
    /// Number of new terms the summary declares.
    pub introduced_term_count: u32,
    /// Fraction of children covered by the summary's evidence refs.
    pub evidence_coverage_ratio: f32,
    /// Fraction of parent-statement terms traceable to children.
    pub vocabulary_continuity_ratio: f32,
    /// The floor the continuity ratio was held to.
    pub vocabulary_continuity_floor: f32,
}

/// The outcome of one policy check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    /// True iff no violations were found.
    pub ok: bool,
    /// Itemized violations (empty when ok).
    pub violations: Vec<PolicyViolation>,
    /// The metrics the decision was made on.
    pub metrics: PolicyMetrics,
}

impl PolicyDecision {
    /// Whether a specific violation code is present.
    pub fn has(&self, code: ViolationCode) -> bool {
        self.violations.iter().any(|v| v.code == code)
    }

    /// All violation codes, deduplicated, in first-seen order.
    pub fn codes(&self) -> Vec<ViolationCode> {
        let mut seen = Vec::new();
        for v in &self.violations {
            if !seen.contains(&v.code) {
                seen.push(v.code);
            }
        }
        seen
    }
}

/// A group member as the policy engine sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupChild {
    /// Node id within the layer.
    pub id: NodeId,
    /// Structural complexity hint, when one exists.
    pub complexity: Option<u32>,
    /// The member's statement.
    pub statement: String,
    /// Prerequisite node ids (leaf-level; synthesized parents carry none).
    pub prerequisites: Vec<NodeId>,
}

/// Complexity spread across children that carry a hint.
fn complexity_spread(children: &[GroupChild]) -> u32 {
    let hints: Vec<u32> = children.iter().filter_map(|c| c.complexity).collect();
    match (hints.iter().min(), hints.iter().max()) {
        (Some(min), Some(max)) => max - min,
        _ => 0,
    }
}

/// All in-group prerequisite edges that point backward in the supplied order.
///
/// Returns (dependent position, prerequisite position) pairs with
/// dependent < prerequisite, i.e. a child placed before something it needs.
fn forward_violations(children: &[GroupChild]) -> Vec<(usize, usize)> {
    let positions: BTreeMap<&NodeId, usize> = children
        .iter()
        .enumerate()
        .map(|(ix, c)| (&c.id, ix))
        .collect();

    let mut out = Vec::new();
    for (ix, child) in children.iter().enumerate() {
        for prereq in &child.prerequisites {
            if let Some(&pix) = positions.get(prereq) {
                if pix > ix {
                    out.push((ix, pix));
                }
            }
        }
    }
    out.sort_unstable();
    out
}

/// The first forward-violating prerequisite edge, in position order.
///
/// This is also the builder's deterministic split point: the group is cut
/// immediately after the dependent. Any order-stable rule would do; this one
/// is documented so rebuilds repartition identically.
pub(crate) fn first_forward_violation(children: &[GroupChild]) -> Option<(usize, usize)> {
    forward_violations(children).into_iter().next()
}

/// Whether a failing group cannot be repaired by any repartition.
///
/// A 2-child group whose members directly require each other is the
/// irreducible case: no reordering or in-layer split relieves it.
pub fn is_unresolvable(children: &[GroupChild], decision: &PolicyDecision) -> bool {
    if children.len() != 2 || !decision.has(ViolationCode::PrerequisiteOrder) {
        return false;
    }
    let (a, b) = (&children[0], &children[1]);
    a.prerequisites.contains(&b.id) && b.prerequisites.contains(&a.id)
}

/// Pre-summary check: complexity band and prerequisite order.
pub fn check_pre_summary(
    children: &[GroupChild],
    config: &ExplanationConfig,
) -> PolicyDecision {
    let mut violations = Vec::new();

    let spread = complexity_spread(children);
    if spread > config.complexity_band_width {
        violations.push(PolicyViolation {
            code: ViolationCode::ComplexityBand,
            message: format!(
                "Complexity spread {spread} exceeds band width {}",
                config.complexity_band_width
            ),
            details: BTreeMap::from([
                ("spread".to_string(), spread.to_string()),
                (
                    "band_width".to_string(),
                    config.complexity_band_width.to_string(),
                ),
            ]),
        });
    }

    let forward = forward_violations(children);
    for &(dep, prereq) in &forward {
        violations.push(PolicyViolation {
            code: ViolationCode::PrerequisiteOrder,
            message: format!(
                "{} at position {dep} requires {} at later position {prereq}",
                children[dep].id, children[prereq].id
            ),
            details: BTreeMap::from([
                ("dependent".to_string(), children[dep].id.to_string()),
                ("prerequisite".to_string(), children[prereq].id.to_string()),
            ]),
        });
    }

    PolicyDecision {
        ok: violations.is_empty(),
        violations,
        metrics: PolicyMetrics {
            complexity_spread: spread,
            prerequisite_order_violations: forward.len() as u32,
            introduced_term_count: 0,
            evidence_coverage_ratio: 1.0,
            vocabulary_continuity_ratio: 1.0,
            vocabulary_continuity_floor: config.vocabulary_continuity_floor(),
        },
    }
}

/// Post-summary check: evidence coverage, vocabulary continuity, term budget.
pub fn check_post_summary(
    children: &[GroupChild],
    summary: &ParentSummary,
    config: &ExplanationConfig,
) -> PolicyDecision {
    let mut violations = Vec::new();

    // Evidence coverage: full coverage required.
    let refs: BTreeSet<&NodeId> = summary.evidence_refs.iter().collect();
    let covered = children.iter().filter(|c| refs.contains(&c.id)).count();
    let coverage = if children.is_empty() {
        1.0
    } else {
        covered as f32 / children.len() as f32
    };
    if covered < children.len() {
        let missing: Vec<String> = children
            .iter()
            .filter(|c| !refs.contains(&c.id))
            .map(|c| c.id.to_string())
            .collect();
        violations.push(PolicyViolation {
            code: ViolationCode::EvidenceCoverage,
            message: format!(
                "Evidence refs cover {covered}/{} children",
                children.len()
            ),
            details: BTreeMap::from([("missing".to_string(), missing.join(","))]),
        });
    }

    // Vocabulary continuity.
    let mut child_terms: BTreeSet<String> = BTreeSet::new();
    for child in children {
        child_terms.extend(tokenize_terms(&child.statement));
    }
    let declared: BTreeSet<String> = summary
        .new_terms_introduced
        .iter()
        .map(|t| t.to_lowercase())
        .collect();

    let parent_terms = tokenize_terms(&summary.parent_statement);
    let traceable = parent_terms
        .iter()
        .filter(|t| child_terms.contains(*t) || declared.contains(*t))
        .count();
    let continuity = if parent_terms.is_empty() {
        1.0
    } else {
        traceable as f32 / parent_terms.len() as f32
    };
    let floor = config.vocabulary_continuity_floor();
    if continuity < floor {
        let novel: Vec<String> = parent_terms
            .iter()
            .filter(|t| !child_terms.contains(*t) && !declared.contains(*t))
            .cloned()
            .collect();
        violations.push(PolicyViolation {
            code: ViolationCode::VocabularyContinuity,
            message: format!(
                "Vocabulary continuity {continuity:.2} below floor {floor:.2}"
            ),
            details: BTreeMap::from([("untraceable".to_string(), novel.join(","))]),
        });
    }

    // Term budget.
    let introduced = summary.new_terms_introduced.len();
    if introduced > config.new_term_budget {
        violations.push(PolicyViolation {
            code: ViolationCode::TermBudget,
            message: format!(
                "{introduced} new terms introduced, budget is {}",
                config.new_term_budget
            ),
            details: BTreeMap::from([
                ("introduced".to_string(), introduced.to_string()),
                ("budget".to_string(), config.new_term_budget.to_string()),
            ]),
        });
    }

    PolicyDecision {
        ok: violations.is_empty(),
        violations,
        metrics: PolicyMetrics {
            complexity_spread: complexity_spread(children),
            prerequisite_order_violations: forward_violations(children).len() as u32,
            introduced_term_count: introduced as u32,
            evidence_coverage_ratio: coverage,
            vocabulary_continuity_ratio: continuity,
            vocabulary_continuity_floor: floor,
        },
    }
}

/// Function words excluded from continuity accounting.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "with", "that", "this", "from", "then",
    "than", "any", "all", "every", "each", "not", "its", "has", "have",
    "is", "be", "by", "of", "to", "in", "on", "or", "an", "a", "it", "as",
    "if", "we", "iff",
];

fn term_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z][A-Za-z0-9_']*").expect("valid term regex"))
}

/// Tokenize a statement into lowercase content terms.
///
/// Single- and two-letter tokens (math variables, mostly) and function words
/// are dropped; everything else counts toward continuity.
pub fn tokenize_terms(text: &str) -> BTreeSet<String> {
    term_regex()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|t| t.len() >= 3 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(id: &str, complexity: Option<u32>, prereqs: &[&str]) -> GroupChild {
        GroupChild {
            id: NodeId::new(id),
            complexity,
            statement: format!("statement about {id}"),
            prerequisites: prereqs.iter().map(|p| NodeId::new(*p)).collect(),
        }
    }

    fn summary_for(children: &[GroupChild]) -> ParentSummary {
        ParentSummary {
            parent_statement: children
                .iter()
                .map(|c| c.statement.clone())
                .collect::<Vec<_>>()
                .join("; "),
            why_true_from_children: "conjunction".to_string(),
            new_terms_introduced: vec![],
            complexity_score: 1.0,
            abstraction_score: 0.5,
            evidence_refs: children.iter().map(|c| c.id.clone()).collect(),
            confidence: 0.9,
        }
    }

    #[test]
    fn test_pre_summary_band_violation() {
        let children = vec![
            child("l1", Some(2), &[]),
            child("l2", Some(3), &[]),
            child("l3", Some(3), &[]),
            child("l4", Some(4), &[]),
        ];
        let mut config = ExplanationConfig::default();
        config.complexity_band_width = 1;

        let decision = check_pre_summary(&children, &config);
        assert!(!decision.ok);
        assert!(decision.has(ViolationCode::ComplexityBand));
        assert_eq!(decision.metrics.complexity_spread, 2);
    }

    #[test]
    fn test_pre_summary_missing_hints_do_not_constrain() {
        let children = vec![
            child("l1", Some(2), &[]),
            child("l2", None, &[]),
            child("l3", Some(3), &[]),
        ];
        let mut config = ExplanationConfig::default();
        config.complexity_band_width = 1;

        let decision = check_pre_summary(&children, &config);
        assert!(decision.ok);
    }

    #[test]
    fn test_pre_summary_prerequisite_order_violation() {
        // l1 requires l3, which sits after it.
        let children = vec![
            child("l1", Some(1), &["l3"]),
            child("l2", Some(1), &[]),
            child("l3", Some(1), &[]),
        ];
        let decision = check_pre_summary(&children, &ExplanationConfig::default());
        assert!(!decision.ok);
        assert!(decision.has(ViolationCode::PrerequisiteOrder));
        assert_eq!(decision.metrics.prerequisite_order_violations, 1);
        assert_eq!(first_forward_violation(&children), Some((0, 2)));
    }

    #[test]
    fn test_out_of_group_prerequisites_ignored() {
        let children = vec![
            child("l1", Some(1), &["external"]),
            child("l2", Some(1), &["l1"]),
        ];
        let decision = check_pre_summary(&children, &ExplanationConfig::default());
        assert!(decision.ok);
    }

    #[test]
    fn test_mutual_pair_is_unresolvable() {
        let children = vec![child("l1", Some(1), &["l2"]), child("l2", Some(1), &["l1"])];
        let decision = check_pre_summary(&children, &ExplanationConfig::default());
        assert!(!decision.ok);
        assert!(is_unresolvable(&children, &decision));
    }

    #[test]
    fn test_one_way_pair_is_resolvable() {
        // l1 requires l2 but not vice versa; the split can relieve it.
        let children = vec![child("l1", Some(1), &["l2"]), child("l2", Some(1), &[])];
        let decision = check_pre_summary(&children, &ExplanationConfig::default());
        assert!(!decision.ok);
        assert!(!is_unresolvable(&children, &decision));
    }

    #[test]
    fn test_post_summary_accepts_covering_summary() {
        let children = vec![child("l1", Some(1), &[]), child("l2", Some(1), &[])];
        let summary = summary_for(&children);
        let decision = check_post_summary(&children, &summary, &ExplanationConfig::default());
        assert!(decision.ok, "{:?}", decision.violations);
        assert_eq!(decision.metrics.evidence_coverage_ratio, 1.0);
    }

    #[test]
    fn test_post_summary_evidence_gap() {
        let children = vec![child("l1", Some(1), &[]), child("l2", Some(1), &[])];
        let mut summary = summary_for(&children);
        summary.evidence_refs = vec![NodeId::new("l1")];

        let decision = check_post_summary(&children, &summary, &ExplanationConfig::default());
        assert!(!decision.ok);
        assert!(decision.has(ViolationCode::EvidenceCoverage));
        assert_eq!(decision.metrics.evidence_coverage_ratio, 0.5);
    }

    #[test]
    fn test_post_summary_vocabulary_break_under_strict() {
        let children = vec![child("l1", Some(1), &[]), child("l2", Some(1), &[])];
        let mut summary = summary_for(&children);
        summary.parent_statement =
            "Cohomological obstruction vanishes unconditionally".to_string();

        let mut config = ExplanationConfig::default();
        config.entailment_mode = super::super::config::EntailmentMode::Strict;

        let decision = check_post_summary(&children, &summary, &config);
        assert!(!decision.ok);
        assert!(decision.has(ViolationCode::VocabularyContinuity));
        assert_eq!(decision.metrics.vocabulary_continuity_floor, 1.0);
    }

    #[test]
    fn test_post_summary_declared_terms_are_traceable() {
        let children = vec![child("l1", Some(1), &[]), child("l2", Some(1), &[])];
        let mut summary = summary_for(&children);
        summary.parent_statement = format!("{} via monotonicity", summary.parent_statement);
        summary.new_terms_introduced = vec!["monotonicity".to_string()];

        let mut config = ExplanationConfig::default();
        config.entailment_mode = super::super::config::EntailmentMode::Strict;

        let decision = check_post_summary(&children, &summary, &config);
        assert!(decision.ok, "{:?}", decision.violations);
        assert_eq!(decision.metrics.introduced_term_count, 1);
    }

    #[test]
    fn test_post_summary_term_budget() {
        let children = vec![child("l1", Some(1), &[]), child("l2", Some(1), &[])];
        let mut summary = summary_for(&children);
        summary.new_terms_introduced = (0..5).map(|i| format!("term{i}")).collect();

        let mut config = ExplanationConfig::default();
        config.new_term_budget = 2;

        let decision = check_post_summary(&children, &summary, &config);
        assert!(!decision.ok);
        assert!(decision.has(ViolationCode::TermBudget));
    }

    #[test]
    fn test_tokenizer_drops_variables_and_stopwords() {
        let terms = tokenize_terms("for all n, the sum n + 0 equals n");
        assert!(terms.contains("sum"));
        assert!(terms.contains("equals"));
        assert!(!terms.iter().any(|t| t == "n" || t == "the" || t == "for"));
    }
}

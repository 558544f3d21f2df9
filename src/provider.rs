//! Summarization provider contract.
//!
//! The provider is the only external collaborator the builder suspends on.
//! The prompt contract is fixed: two messages, a system preamble and a
//! per-child enumeration (id, optional complexity, statement) sorted by id.
//! The response must parse into [`ParentSummary`]; an unparseable response is
//! an infrastructure failure, never a policy failure.
//!
//! ## Determinism
//!
//! Provider output affects node *content* only. Partition shape, group
//! indices and parent ids are all decided before any call is made, so tree
//! shape is identical regardless of call completion order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::policy::{AudienceLevel, ExplanationConfig};
use crate::types::NodeId;

/// One child as enumerated in the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptChild {
    /// Child node id.
    pub id: NodeId,
    /// Optional complexity hint.
    pub complexity: Option<u32>,
    /// The child's statement.
    pub statement: String,
}

/// The fixed two-message prompt sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRequest {
    /// System message: role and response contract.
    pub system: String,
    /// User message: the per-child enumeration.
    pub user: String,
    /// The children, sorted by id (structured form of the user message).
    pub children: Vec<PromptChild>,
    /// Audience the summary is calibrated for.
    pub audience: AudienceLevel,
    /// Depth of the parent being synthesized.
    pub depth: u32,
}

impl SummaryRequest {
    /// Build a request for a group of children.
    ///
    /// Children are sorted by id before enumeration so the prompt is
    /// byte-identical for the same group regardless of builder-internal
    /// ordering.
    pub fn new(mut children: Vec<PromptChild>, config: &ExplanationConfig, depth: u32) -> Self {
        children.sort_by(|a, b| a.id.cmp(&b.id));

        let system = format!(
            "You summarize machine-verified statements for a {:?} audience. \
             Respond with a single JSON object with fields: parent_statement, \
             why_true_from_children, new_terms_introduced (array), \
             complexity_score, abstraction_score, evidence_refs (array of \
             child ids), confidence. Introduce at most {} new terms.",
            config.audience, config.new_term_budget,
        );

        let mut user = String::from("Children:\n");
        for child in &children {
            match child.complexity {
                Some(c) => {
                    user.push_str(&format!("- [{}] (complexity {}) {}\n", child.id, c, child.statement))
                }
                None => user.push_str(&format!("- [{}] {}\n", child.id, child.statement)),
            }
        }

        Self {
            system,
            user,
            children,
            audience: config.audience,
            depth,
        }
    }
}

/// The parsed provider response for one parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentSummary {
    /// The synthesized statement.
    pub parent_statement: String,
    /// Why the statement follows from the children.
    pub why_true_from_children: String,
    /// Terms the statement introduces beyond the children's vocabulary.
    #[serde(default)]
    pub new_terms_introduced: Vec<String>,
    /// Complexity score of the synthesized statement.
    pub complexity_score: f32,
    /// Abstraction score of the synthesized statement.
    pub abstraction_score: f32,
    /// Child ids the summary claims as evidence.
    pub evidence_refs: Vec<NodeId>,
    /// Provider confidence.
    pub confidence: f32,
}

impl ParentSummary {
    /// Parse a raw provider response.
    ///
    /// A response that does not satisfy the contract is a build failure
    /// ([`ProviderError::MalformedResponse`]), not a policy failure.
    pub fn parse(raw: &str) -> Result<Self, ProviderError> {
        serde_json::from_str(raw).map_err(|e| ProviderError::MalformedResponse(e.to_string()))
    }
}

/// The external summarization provider.
///
/// The builder issues one call per surviving group per layer; calls within a
/// layer are independent and may run concurrently. Errors are not retried by
/// the builder.
#[async_trait]
pub trait SummarizationProvider: Send + Sync {
    /// Summarize one group of children into a parent summary.
    async fn summarize(&self, request: &SummaryRequest) -> Result<ParentSummary, ProviderError>;
}

/// Deterministic in-process provider.
///
/// Synthesizes summaries purely from the request: the parent statement joins
/// the child statements, evidence refs cover every child, and no new terms
/// are introduced. Useful for tests and for offline tree-shape work where
/// real prose is not needed.
#[derive(Debug, Clone, Default)]
pub struct StubProvider;

impl StubProvider {
    /// Create a stub provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SummarizationProvider for StubProvider {
    async fn summarize(&self, request: &SummaryRequest) -> Result<ParentSummary, ProviderError> {
        let parent_statement = request
            .children
            .iter()
            .map(|c| c.statement.trim().trim_end_matches('.'))
            .collect::<Vec<_>>()
            .join("; ");

        let complexity_score = request
            .children
            .iter()
            .filter_map(|c| c.complexity)
            .max()
            .unwrap_or(1) as f32;

        Ok(ParentSummary {
            parent_statement,
            why_true_from_children: format!(
                "Conjunction of {} verified child statements",
                request.children.len()
            ),
            new_terms_introduced: vec![],
            complexity_score,
            abstraction_score: 0.5 + 0.1 * request.depth as f32,
            evidence_refs: request.children.iter().map(|c| c.id.clone()).collect(),
            confidence: 0.9,
        })
    }
}

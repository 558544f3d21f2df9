//! # explanation-kernel
//!
//! Deterministic multi-level explanation trees over verified declarations.
//!
//! The explanation kernel answers one question:
//!
//! > Given a set of machine-verified leaves, what hierarchy of progressively
//! > more abstract natural-language claims explains them, and can that
//! > hierarchy be rebuilt byte-for-byte?
//!
//! ## Core Contract
//!
//! 1. Given id-normalized leaves and a config, deterministically group them
//!    into layers and synthesize one parent per group through an external
//!    summarization provider
//! 2. Enforce audience policy (complexity band, prerequisite order, evidence
//!    coverage, vocabulary continuity, term budget) before and after every
//!    summary, repairing violations by deterministic repartition
//! 3. Reuse prior trees across edits: semantic no-op detection, localized
//!    subtree rebuild, and parent reuse under topology change
//!
//! ## Architecture
//!
//! ```text
//! Leaves → DependencyGraph → TreeBuilder ⇄ PolicyEngine
//!                                 ↓
//!                         SummarizationProvider
//!                                 ↓
//!            ExplanationCache (memory LRU + optional disk)
//! ```
//!
//! ## Determinism Guarantees
//!
//! - Same leaves + same config → identical tree, regardless of input order
//! - Partition shape never depends on provider output
//! - Parent ids are content-derived from depth and sorted child ids

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod cache;
pub mod canonical;
pub mod clock;
pub mod error;
pub mod graph;
pub mod policy;
pub mod provider;
pub mod types;

// Re-exports
pub use types::{
    ExplanationTree, GroupDecision, GroupingDiagnostics, Leaf, LeafId, LeafSet, LeafSetError,
    NodeId, ParentNode, RepartitionEvent, RepartitionReason, SourceFingerprint, SourceSpan,
    TreeIssue, TreeIssueCode, TreeNode, TreeValidation,
};
pub use builder::TreeBuilder;
pub use cache::{
    classify_change, BlockedSubtreePlan, CacheEntry, CacheKey, CacheLayer, CacheOutcome,
    CacheReport, CacheStatus, ChangeClass, Diagnostic, DiagnosticCode, DiskCacheConfig,
    EntryDefect, ExplanationCache, ExplanationCacheConfig,
};
pub use canonical::{
    canonical_hash, canonical_hash_hex, normalize_statement, statement_hash_hex,
    to_canonical_bytes, CANONICAL_STATEMENT_VERSION,
};
pub use clock::{
    BuildIdFactory, FixedClock, KernelClock, SequentialBuildIds, SystemClock, UuidBuildIds,
};
pub use error::{BuildError, CacheError, ContractError, PolicyFailure, ProviderError};
pub use graph::{DeclarationView, DependencyGraph, GraphStats, RebuildBatch};
pub use policy::{
    check_post_summary, check_pre_summary, is_unresolvable, AudienceLevel, EntailmentMode,
    ExplanationConfig, GroupChild, PolicyDecision, PolicyMetrics, PolicyViolation, ViolationCode,
};
pub use provider::{
    ParentSummary, PromptChild, StubProvider, SummarizationProvider, SummaryRequest,
};

/// Schema version for all explanation kernel types.
/// Increment on breaking changes to any schema type.
pub const EXPLANATION_SCHEMA_VERSION: &str = "1.0.0";

/// Default config version identifier.
pub const DEFAULT_CONFIG_VERSION: &str = "explanation_config_v1";

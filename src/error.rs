//! Structured error taxonomy.
//!
//! Three failure kinds that are never conflated:
//!
//! 1. **Contract errors** — invalid inputs, rejected synchronously before
//!    any work starts.
//! 2. **Policy errors** — a group exhausted its repartition budget; the
//!    failing decisions ride along for diagnosis. Fatal to the build.
//! 3. **Infrastructure errors** — provider failure or timeout. Aborts the
//!    build; partially built layers are discarded and never cached.
//!
//! Cache disk I/O failure is deliberately absent: it degrades the persistent
//! layer to ephemeral and surfaces only as a diagnostic, never as an error
//! to a reader.
//!
//! Every payload is `Clone + Serialize` so the single-flight channel can fan
//! results out and automated gates can branch on `code`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::policy::PolicyDecision;
use crate::types::{LeafSetError, NodeId};

/// An input rejected before any work started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("Contract violation [{code}]: {message}")]
pub struct ContractError {
    /// Machine-readable code, e.g. `invalid_max_children_per_parent`.
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Structured context for automated gates.
    pub details: BTreeMap<String, String>,
}

impl ContractError {
    /// Create a contract error.
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        details: BTreeMap<String, String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details,
        }
    }
}

/// A cluster could not satisfy policy after exhausting its repartition
/// budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error(
    "Policy failure at depth {depth}: group of {} nodes unresolvable after {rounds} round(s)",
    group.len()
)]
pub struct PolicyFailure {
    /// Depth layer the group belonged to.
    pub depth: u32,
    /// The offending group.
    pub group: Vec<NodeId>,
    /// Repartition rounds consumed before giving up.
    pub rounds: u32,
    /// The pre-summary decision for the group.
    pub pre_summary: PolicyDecision,
    /// The post-summary decision, when the group got that far.
    pub post_summary: Option<PolicyDecision>,
}

/// Failures of the external summarization provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum ProviderError {
    /// The call itself failed.
    #[error("Provider call failed: {0}")]
    CallFailed(String),
    /// The call timed out.
    #[error("Provider call timed out after {0} ms")]
    Timeout(u64),
    /// The response did not parse into the summary contract.
    #[error("Unparseable provider response: {0}")]
    MalformedResponse(String),
}

/// Any reason a tree build can fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum BuildError {
    /// Rejected before work started.
    #[error(transparent)]
    Contract(#[from] ContractError),
    /// Repartition budget exhausted.
    #[error(transparent)]
    Policy(Box<PolicyFailure>),
    /// Provider failure or timeout; nothing produced or cached.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl From<PolicyFailure> for BuildError {
    fn from(failure: PolicyFailure) -> Self {
        BuildError::Policy(Box::new(failure))
    }
}

/// Any reason a cache request can fail.
///
/// Storage-layer trouble is not in here; readers only ever see it as
/// diagnostics on an otherwise successful response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum CacheError {
    /// Malformed leaf input.
    #[error("Invalid leaf set: {0}")]
    LeafSet(#[from] LeafSetError),
    /// The underlying build failed.
    #[error(transparent)]
    Build(#[from] BuildError),
    /// The shared in-flight build terminated without publishing a result.
    #[error("In-flight build ended without a result")]
    FlightInterrupted,
}

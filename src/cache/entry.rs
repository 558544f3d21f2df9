//! Cache records, keys, and per-request reports.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::canonical::{canonical_hash_hex, to_canonical_bytes};
use crate::types::{ExplanationTree, Leaf, LeafId, SourceFingerprint};

use super::BlockedSubtreePlan;

/// Identity of a cached tree: which proof, built under which config.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    /// Stable identifier of the proof or leaf collection.
    pub proof_id: String,
    /// The [`crate::ExplanationConfig`] hash the tree was built under.
    pub config_hash: String,
}

/// Single-flight coalescing key: requests for the same key and the same
/// source bytes share one build.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlightKey {
    pub(crate) key: CacheKey,
    pub(crate) fingerprint: SourceFingerprint,
}

/// Canonical hash of the prerequisite edge list of a leaf set.
///
/// Changes exactly when an edge is added, removed, or re-targeted; content
/// edits that keep the dependency shape leave it untouched.
pub fn dependency_hash(leaves: &[Leaf]) -> String {
    let edges: Vec<(&LeafId, &Vec<LeafId>)> =
        leaves.iter().map(|l| (&l.id, &l.prerequisites)).collect();
    canonical_hash_hex(&edges)
}

/// One materialized cache record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Schema version the record was written with.
    pub schema_version: String,
    /// Proof identifier.
    pub proof_id: String,
    /// Config hash the tree was built under.
    pub config_hash: String,
    /// Raw-text fingerprint of the leaves the tree was built from.
    pub fingerprint: SourceFingerprint,
    /// Dependency-edge hash of those leaves.
    pub dependency_hash: String,
    /// The leaves themselves, id-sorted.
    pub leaves: Vec<Leaf>,
    /// The built tree.
    pub tree: ExplanationTree,
    /// Canonical hash binding the tree to its leaves.
    pub snapshot_hash: String,
    /// SHA-256 over every other field; integrity of the stored record.
    pub entry_hash: String,
    /// Unix seconds at which the entry was created.
    pub created_at_unix: i64,
    /// Id of the build that produced the tree.
    pub build_id: String,
}

impl CacheEntry {
    /// Assemble an entry, stamping the binding hashes.
    pub fn new(
        key: &CacheKey,
        leaves: Vec<Leaf>,
        tree: ExplanationTree,
        created_at_unix: i64,
        build_id: String,
    ) -> Self {
        let snapshot_hash = tree.snapshot_hash(&leaves);
        let mut entry = Self {
            schema_version: crate::EXPLANATION_SCHEMA_VERSION.to_string(),
            proof_id: key.proof_id.clone(),
            config_hash: key.config_hash.clone(),
            fingerprint: SourceFingerprint::compute(&leaves),
            dependency_hash: dependency_hash(&leaves),
            leaves,
            tree,
            snapshot_hash,
            entry_hash: String::new(),
            created_at_unix,
            build_id,
        };
        entry.entry_hash = entry.compute_entry_hash();
        entry
    }

    /// Re-key the entry under a new source fingerprint without rebuilding.
    ///
    /// Used for semantic no-ops: the raw text changed but every leaf is
    /// semantically identical, so the tree, leaves, and snapshot hash stay
    /// byte-for-byte the same and no new build id is issued.
    pub fn with_fingerprint(&self, fingerprint: SourceFingerprint) -> Self {
        let mut entry = self.clone();
        entry.fingerprint = fingerprint;
        entry.entry_hash = entry.compute_entry_hash();
        entry
    }

    /// SHA-256 over the canonical bytes of every field except the hash
    /// itself.
    pub fn compute_entry_hash(&self) -> String {
        let payload = (
            &self.schema_version,
            &self.proof_id,
            &self.config_hash,
            &self.fingerprint,
            &self.dependency_hash,
            &self.leaves,
            &self.tree,
            &self.snapshot_hash,
            self.created_at_unix,
            &self.build_id,
        );
        let mut hasher = Sha256::new();
        hasher.update(to_canonical_bytes(&payload));
        hex::encode(hasher.finalize())
    }

    /// Structural integrity check against the key it is filed under.
    pub fn validate(&self, key: &CacheKey) -> Result<(), EntryDefect> {
        if self.schema_version != crate::EXPLANATION_SCHEMA_VERSION {
            return Err(EntryDefect::SchemaVersion(self.schema_version.clone()));
        }
        if self.proof_id != key.proof_id || self.config_hash != key.config_hash {
            return Err(EntryDefect::KeyMismatch);
        }
        if self.entry_hash != self.compute_entry_hash() {
            return Err(EntryDefect::EntryHash);
        }
        if self.dependency_hash != dependency_hash(&self.leaves) {
            return Err(EntryDefect::DependencyHash);
        }
        if self.snapshot_hash != self.tree.snapshot_hash(&self.leaves) {
            return Err(EntryDefect::SnapshotHash);
        }
        if !self.tree.validate().ok {
            return Err(EntryDefect::TreeInvalid);
        }
        Ok(())
    }
}

/// Reason a stored entry was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryDefect {
    /// Written under a different schema version.
    SchemaVersion(String),
    /// Filed under a key it does not describe.
    KeyMismatch,
    /// Stored entry hash disagrees with the stored fields.
    EntryHash,
    /// Stored dependency hash disagrees with the stored leaves.
    DependencyHash,
    /// Stored snapshot hash disagrees with the stored tree and leaves.
    SnapshotHash,
    /// The stored tree fails structural validation.
    TreeInvalid,
}

impl EntryDefect {
    /// The diagnostic code this defect surfaces as.
    pub fn code(&self) -> DiagnosticCode {
        match self {
            EntryDefect::DependencyHash => DiagnosticCode::DependencyHashMismatch,
            EntryDefect::SnapshotHash => DiagnosticCode::SnapshotHashMismatch,
            _ => DiagnosticCode::EntryInvalid,
        }
    }
}

/// Which storage tier served or would serve a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLayer {
    /// Memory plus the configured disk directory.
    Persistent,
    /// Memory only; disk writes are disabled or have failed.
    Ephemeral,
}

/// Hit/miss classification of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// Served without any provider call.
    Hit,
    /// At least one parent was (re)generated.
    Miss,
}

/// Stable, machine-matchable diagnostic codes.
///
/// Downstream gates branch on these strings; renaming one is a breaking
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticCode {
    /// Exact fingerprint match.
    #[serde(rename = "cache_hit")]
    Hit,
    /// Fingerprint changed but every leaf is semantically unchanged.
    #[serde(rename = "cache_semantic_hit")]
    SemanticHit,
    /// Content edits confined to a dependency-closed subtree.
    #[serde(rename = "cache_incremental_subtree_rebuild")]
    IncrementalSubtreeRebuild,
    /// Leaves or edges changed; parents reused where they still match.
    #[serde(rename = "cache_incremental_topology_rebuild")]
    IncrementalTopologyRebuild,
    /// The blocked set spans the whole tree; reuse abandoned.
    #[serde(rename = "cache_blocked_subtree_full_rebuild")]
    BlockedSubtreeFullRebuild,
    /// Nothing cached for the key.
    #[serde(rename = "cache_miss")]
    Miss,
    /// Disk write failed; cache degraded to ephemeral.
    #[serde(rename = "cache_write_failed")]
    WriteFailed,
    /// Disk read failed.
    #[serde(rename = "cache_read_failed")]
    ReadFailed,
    /// Stored entry failed validation and was discarded.
    #[serde(rename = "cache_entry_invalid")]
    EntryInvalid,
    /// Stored dependency hash disagrees with stored leaves.
    #[serde(rename = "cache_dependency_hash_mismatch")]
    DependencyHashMismatch,
    /// Stored snapshot hash disagrees with stored tree.
    #[serde(rename = "cache_snapshot_hash_mismatch")]
    SnapshotHashMismatch,
}

impl DiagnosticCode {
    /// The wire string for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticCode::Hit => "cache_hit",
            DiagnosticCode::SemanticHit => "cache_semantic_hit",
            DiagnosticCode::IncrementalSubtreeRebuild => "cache_incremental_subtree_rebuild",
            DiagnosticCode::IncrementalTopologyRebuild => "cache_incremental_topology_rebuild",
            DiagnosticCode::BlockedSubtreeFullRebuild => "cache_blocked_subtree_full_rebuild",
            DiagnosticCode::Miss => "cache_miss",
            DiagnosticCode::WriteFailed => "cache_write_failed",
            DiagnosticCode::ReadFailed => "cache_read_failed",
            DiagnosticCode::EntryInvalid => "cache_entry_invalid",
            DiagnosticCode::DependencyHashMismatch => "cache_dependency_hash_mismatch",
            DiagnosticCode::SnapshotHashMismatch => "cache_snapshot_hash_mismatch",
        }
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured diagnostic on a cache report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Stable code.
    pub code: DiagnosticCode,
    /// Human-readable detail.
    pub message: String,
    /// Structured context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl Diagnostic {
    pub(crate) fn new(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    pub(crate) fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }
}

/// What the cache did for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheReport {
    /// Hit or miss.
    pub status: CacheStatus,
    /// Storage tier the result lives in.
    pub layer: CacheLayer,
    /// The key the request resolved under.
    pub cache_key: CacheKey,
    /// Fingerprint of the supplied source.
    pub source_fingerprint: SourceFingerprint,
    /// Snapshot hash of the served tree + leaves.
    pub snapshot_hash: String,
    /// Integrity hash of the served entry.
    pub entry_hash: String,
    /// Build id of the served tree.
    pub build_id: String,
    /// Creation time of the served entry.
    pub created_at_unix: i64,
    /// Ordered diagnostics.
    pub diagnostics: Vec<Diagnostic>,
    /// Parents carried over from the prior tree.
    pub reused_parents: u64,
    /// Parents produced by fresh provider calls.
    pub regenerated_parents: u64,
    /// The blocked-set plan, when an incremental path computed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_subtree_plan: Option<BlockedSubtreePlan>,
    /// Whether an incremental path gave up and fell back to a full rebuild.
    pub full_rebuild_fallback: bool,
}

impl CacheReport {
    /// Whether a diagnostic with the given code is present.
    pub fn has(&self, code: DiagnosticCode) -> bool {
        self.diagnostics.iter().any(|d| d.code == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LeafSet, SourceSpan};

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
    fn test_dependency_hash_ignores_statement_edits() {
        let a = vec![leaf("l1", "x", &[]), leaf("l2", "y", &["l1"])];
        let b = vec![leaf("l1", "x (edited)", &[]), leaf("l2", "y", &["l1"])];
        assert_eq!(dependency_hash(&a), dependency_hash(&b));

        let c = vec![leaf("l1", "x", &[]), leaf("l2", "y", &[])];
        assert_ne!(dependency_hash(&a), dependency_hash(&c));
    }

    #[tokio::test]
    async fn test_entry_validate_catches_tampered_snapshot() {
        let leaves = vec![leaf("l1", "x", &[]), leaf("l2", "y", &[])];
        let leaf_set = LeafSet::new(leaves.clone()).unwrap();
        let builder = crate::TreeBuilder::new(
            std::sync::Arc::new(crate::StubProvider::new()),
            crate::ExplanationConfig::default(),
        );
        let tree = builder.build(&leaf_set).await.unwrap();

        let key = CacheKey {
            proof_id: "p".to_string(),
            config_hash: tree.config_hash.clone(),
        };
        let mut entry = CacheEntry::new(&key, leaves, tree, 0, "build-1".to_string());
        assert!(entry.validate(&key).is_ok());

        // Bit rot in one field without the entry hash keeping up.
        entry.snapshot_hash = "0".repeat(16);
        assert_eq!(entry.validate(&key), Err(EntryDefect::EntryHash));

        // A consistently rewritten record still fails on the snapshot hash.
        entry.entry_hash = entry.compute_entry_hash();
        assert_eq!(entry.validate(&key), Err(EntryDefect::SnapshotHash));
        assert_eq!(
            entry.validate(&key).unwrap_err().code(),
            DiagnosticCode::SnapshotHashMismatch
        );
    }

    #[test]
    fn test_diagnostic_codes_are_stable() {
        assert_eq!(DiagnosticCode::Hit.as_str(), "cache_hit");
        assert_eq!(
            DiagnosticCode::IncrementalSubtreeRebuild.as_str(),
            "cache_incremental_subtree_rebuild"
        );
        assert_eq!(
            serde_json::to_string(&DiagnosticCode::SemanticHit).unwrap(),
            "\"cache_semantic_hit\""
        );
    }
}

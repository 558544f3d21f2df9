//! Leaf declarations: the atomic, already-verified ground truth.
//!
//! A [`Leaf`] is an extracted theorem declaration. Leaves are immutable; a
//! leaf's identity is its id, and its semantic content is captured by
//! [`Leaf::content_hash`], which normalizes statement formatting so that a
//! whitespace-only edit of the proof source does not count as a change.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::canonical::{canonical_hash_hex, normalize_statement, statement_hash_hex};

/// Stable identifier of a leaf declaration.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LeafId(String);

impl LeafId {
    /// Create a leaf id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeafId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LeafId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Location of a declaration in the proof source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    /// Source file path, relative to the proof codebase root.
    pub file: String,
    /// First line of the declaration (1-based).
    pub start_line: u32,
    /// Last line of the declaration (1-based, inclusive).
    pub end_line: u32,
}

impl SourceSpan {
    /// Create a source span.
    pub fn new(file: impl Into<String>, start_line: u32, end_line: u32) -> Self {
        Self {
            file: file.into(),
            start_line,
            end_line,
        }
    }
}

/// An atomic, machine-verified theorem declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leaf {
    /// Unique, stable leaf id.
    pub id: LeafId,
    /// Identifier of the declaration in the proof codebase.
    pub declaration_id: String,
    /// Natural-language or formal statement text.
    pub statement: String,
    /// Optional complexity hint supplied by the extractor.
    pub complexity: Option<u32>,
    /// Ordered prerequisite leaf ids (dependencies of this declaration).
    pub prerequisites: Vec<LeafId>,
    /// Location in the proof source.
    pub span: SourceSpan,
    /// Free-form tags from the extractor.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Optional link to the rendered source.
    #[serde(default)]
    pub source_url: Option<String>,
}

impl Leaf {
    /// Create a leaf with the fields every caller needs; tags and source_url
    /// default to empty.
    pub fn new(
        id: impl Into<LeafId>,
        declaration_id: impl Into<String>,
        statement: impl Into<String>,
        complexity: Option<u32>,
        prerequisites: Vec<LeafId>,
        span: SourceSpan,
    ) -> Self {
        Self {
            id: id.into(),
            declaration_id: declaration_id.into(),
            statement: statement.into(),
            complexity,
            prerequisites,
            span,
            tags: Vec::new(),
            source_url: None,
        }
    }

    /// Semantic content hash of this leaf.
    ///
    /// Covers declaration id, the normalized statement, and the prerequisite
    /// list. Formatting-only statement edits do not change this hash.
    pub fn content_hash(&self) -> String {
        let payload = LeafContent {
            declaration_id: &self.declaration_id,
            statement_hash: statement_hash_hex(&self.statement),
            prerequisites: &self.prerequisites,
        };
        canonical_hash_hex(&payload)
    }

    /// The normalized statement text.
    pub fn normalized_statement(&self) -> String {
        normalize_statement(&self.statement)
    }
}

#[derive(Serialize)]
struct LeafContent<'a> {
    declaration_id: &'a str,
    statement_hash: String,
    prerequisites: &'a [LeafId],
}

impl From<String> for LeafId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Fingerprint of an entire source set, as supplied or recomputed.
///
/// Computed over the raw leaf records (verbatim statement text included), so
/// any textual edit flips the fingerprint. The incremental cache then decides
/// whether the edit was semantically meaningful via content hashes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceFingerprint(String);

impl SourceFingerprint {
    /// Compute the fingerprint of an id-sorted leaf slice.
    pub fn compute(leaves: &[Leaf]) -> Self {
        Self(canonical_hash_hex(&leaves))
    }

    /// Wrap an externally supplied fingerprint string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The fingerprint as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error raised when a leaf set cannot be formed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum LeafSetError {
    /// Two leaves share an id.
    #[error("Duplicate leaf id: {0}")]
    DuplicateId(LeafId),
    /// The set is empty.
    #[error("Leaf set is empty")]
    Empty,
}

/// An id-normalized, fingerprinted set of leaves.
///
/// Construction sorts leaves by id and rejects duplicates, so every
/// downstream grouping decision sees the same canonical order regardless of
/// how the extractor ordered its output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafSet {
    leaves: Vec<Leaf>,
    fingerprint: SourceFingerprint,
}

impl LeafSet {
    /// Build a leaf set from extractor output.
    pub fn new(mut leaves: Vec<Leaf>) -> Result<Self, LeafSetError> {
        if leaves.is_empty() {
            return Err(LeafSetError::Empty);
        }
        leaves.sort_by(|a, b| a.id.cmp(&b.id));

        let mut seen: BTreeSet<&LeafId> = BTreeSet::new();
        for leaf in &leaves {
            if !seen.insert(&leaf.id) {
                return Err(LeafSetError::DuplicateId(leaf.id.clone()));
            }
        }
        drop(seen);

        let fingerprint = SourceFingerprint::compute(&leaves);
        Ok(Self { leaves, fingerprint })
    }

    /// The id-sorted leaves.
    pub fn leaves(&self) -> &[Leaf] {
        &self.leaves
    }

    /// The source fingerprint of the set.
    pub fn fingerprint(&self) -> &SourceFingerprint {
        &self.fingerprint
    }

    /// Number of leaves.
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    /// Whether the set is empty (never true for a constructed set).
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Sorted leaf ids.
    pub fn ids(&self) -> Vec<LeafId> {
        self.leaves.iter().map(|l| l.id.clone()).collect()
    }

    /// Look up a leaf by id.
    pub fn get(&self, id: &LeafId) -> Option<&Leaf> {
        self.leaves
            .binary_search_by(|l| l.id.cmp(id))
            .ok()
            .map(|ix| &self.leaves[ix])
    }
}

//! Core types for the explanation kernel.

pub mod leaf;
pub mod node;
pub mod tree;

pub use leaf::{Leaf, LeafId, LeafSet, LeafSetError, SourceFingerprint, SourceSpan};
pub use node::{NodeId, ParentNode, TreeNode};
pub use tree::{
    ExplanationTree, GroupDecision, GroupingDiagnostics, RepartitionEvent, RepartitionReason,
    TreeIssue, TreeIssueCode, TreeValidation,
};

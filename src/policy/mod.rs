//! Pedagogical policy: configuration profiles and the pre/post-summary checks.

pub mod config;
pub mod engine;

pub use config::{AudienceLevel, EntailmentMode, ExplanationConfig};
pub use engine::{
    check_post_summary, check_pre_summary, is_unresolvable, tokenize_terms, GroupChild,
    PolicyDecision, PolicyMetrics, PolicyViolation, ViolationCode,
};

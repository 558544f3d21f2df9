//! Explanation configuration: the audience/complexity profile a tree is
//! built under.
//!
//! Thresholds derived from the config are pure total functions over closed
//! enum values. There is no runtime string dispatch anywhere in the policy
//! path, so an unknown audience or entailment mode is unrepresentable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::canonical::canonical_hash_hex;
use crate::error::ContractError;
use crate::DEFAULT_CONFIG_VERSION;

/// Who the explanation hierarchy is calibrated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudienceLevel {
    /// General reader; almost every term must come from the children.
    Novice,
    /// Mathematically literate reader.
    Student,
    /// Domain expert; the most new vocabulary is tolerated.
    Expert,
}

impl AudienceLevel {
    /// Base vocabulary-continuity floor before the term budget relaxes it.
    pub fn continuity_base(self) -> f32 {
        match self {
            AudienceLevel::Novice => 0.90,
            AudienceLevel::Student => 0.75,
            AudienceLevel::Expert => 0.60,
        }
    }
}

/// How strictly a parent statement must be entailed by its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntailmentMode {
    /// Continuity floor comes from the audience level and term budget.
    Lenient,
    /// Every parent-statement term must trace to the children; floor 1.0.
    Strict,
}

/// Configuration for one explanation hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplanationConfig {
    /// Config schema version identifier.
    pub version: String,
    /// Target audience.
    pub audience: AudienceLevel,
    /// Maximum children per synthesized parent.
    pub max_children_per_parent: usize,
    /// Allowed max − min complexity-hint spread within one group.
    pub complexity_band_width: u32,
    /// How many genuinely new terms one parent may introduce.
    pub new_term_budget: usize,
    /// Entailment strictness.
    pub entailment_mode: EntailmentMode,
    /// Bounded retry budget for repartitioning non-compliant groups.
    pub repartition_budget: u32,
}

impl Default for ExplanationConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_CONFIG_VERSION.to_string(),
            audience: AudienceLevel::Student,
            max_children_per_parent: 4,
            complexity_band_width: 2,
            new_term_budget: 3,
            entailment_mode: EntailmentMode::Lenient,
            repartition_budget: 4,
        }
    }
}

impl ExplanationConfig {
    /// Deterministic hash of the configuration.
    ///
    /// All fields are integers or closed enums, so canonical JSON hashing is
    /// stable without any float quantization step.
    pub fn config_hash(&self) -> String {
        canonical_hash_hex(self)
    }

    /// The effective vocabulary-continuity floor for this config.
    ///
    /// Each budgeted new term relaxes the audience base slightly; strict
    /// entailment overrides everything and forces 1.0.
    pub fn vocabulary_continuity_floor(&self) -> f32 {
        match self.entailment_mode {
            EntailmentMode::Strict => 1.0,
            EntailmentMode::Lenient => {
                let relaxed =
                    self.audience.continuity_base() - 0.02 * self.new_term_budget as f32;
                relaxed.max(0.5)
            }
        }
    }

    /// Reject invalid configurations before any work starts.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.max_children_per_parent < 1 {
            return Err(ContractError::new(
                "invalid_max_children_per_parent",
                format!(
                    "max_children_per_parent must be >= 1, got {}",
                    self.max_children_per_parent
                ),
                BTreeMap::from([(
                    "max_children_per_parent".to_string(),
                    self.max_children_per_parent.to_string(),
                )]),
            ));
        }
        if self.repartition_budget < 1 {
            return Err(ContractError::new(
                "invalid_repartition_budget",
                format!(
                    "repartition_budget must be >= 1, got {}",
                    self.repartition_budget
                ),
                BTreeMap::from([(
                    "repartition_budget".to_string(),
                    self.repartition_budget.to_string(),
                )]),
            ));
        }
        Ok(())
    }
}

//! Reason classification — ordered threshold rules over delta columns.
//!
//! RULE: declaration order is the precedence order. The first rule
//! whose comparison holds wins, and exactly one reason is assigned per
//! record.

use crate::types::Document;
use serde::{Deserialize, Serialize};

/// Label assigned when no rule matches.
pub const NO_DISCREPANCY: &str = "no_discrepancy";

/// How a rule compares its delta against the threshold. Configured
/// explicitly per rule — the engine never guesses from the sign of the
/// threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Matches when `delta >= threshold`.
    Signed,
    /// Matches when `|delta| >= threshold`.
    Absolute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonRule {
    pub reason: String,
    pub delta_column: String,
    pub threshold: f64,
    pub comparison: Comparison,
}

impl ReasonRule {
    fn matches(&self, delta: f64) -> bool {
        match self.comparison {
            Comparison::Signed => delta >= self.threshold,
            Comparison::Absolute => delta.abs() >= self.threshold,
        }
    }
}

/// Assign a reason from the computed delta columns. Rules whose delta
/// column is absent or non-numeric are passed over rather than treated
/// as matches — a delta that could not be computed proves nothing.
pub fn classify(rules: &[ReasonRule], deltas: &Document) -> String {
    for rule in rules {
        let Some(value) = deltas.get(&rule.delta_column) else {
            continue;
        };
        let Some(delta) = crate::expr::numeric(value) else {
            continue;
        };
        if rule.matches(delta) {
            return rule.reason.clone();
        }
    }
    NO_DISCREPANCY.to_string()
}

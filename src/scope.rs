//! Variable scopes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifetime and visibility tier of a variable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    /// Loaded from configuration, read-only afterwards.
    Global,
    /// Baseline of one batch, read-only while the batch runs.
    Batch,
    Scenario,
    Story,
    Step,
    /// Write-only sink feeding the batch overlay of later batches.
    NextBatches,
}

impl VariableScope {
    pub const ALL: [VariableScope; 6] = [
        VariableScope::Global,
        VariableScope::Batch,
        VariableScope::Scenario,
        VariableScope::Story,
        VariableScope::Step,
        VariableScope::NextBatches,
    ];

    /// Whether steps may write into this scope.
    pub fn is_writable(self) -> bool {
        !matches!(self, VariableScope::Global | VariableScope::Batch)
    }

    /// Lowercase form used in log messages, e.g. `next batches`.
    pub fn human_readable(self) -> &'static str {
        match self {
            VariableScope::Global => "global",
            VariableScope::Batch => "batch",
            VariableScope::Scenario => "scenario",
            VariableScope::Story => "story",
            VariableScope::Step => "step",
            VariableScope::NextBatches => "next batches",
        }
    }
}

impl fmt::Display for VariableScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.human_readable())
    }
}

impl FromStr for VariableScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        VariableScope::ALL
            .into_iter()
            .find(|scope| scope.human_readable() == normalized)
            .ok_or_else(|| format!("Unknown variable scope: '{s}'"))
    }
}

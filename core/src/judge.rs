use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JudgeVerdict {
    Pass,
    Fail,
}

/// Audit result for one realized draft. Persisted verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JudgeResult {
    pub score: f64,
    pub verdict: JudgeVerdict,
    /// Clause identifiers, e.g. "ban:guarantee", "leak:internal_identifier"
    pub violated_clauses: Vec<String>,
    pub rewrite_directives: Vec<String>,
    pub reasoning: String,
    /// True when the single rewrite was accepted
    #[serde(default)]
    pub rewrite_applied: bool,
    /// Score of the original draft when a rewrite was attempted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_score: Option<f64>,
}

impl JudgeResult {
    pub fn passed(&self) -> bool {
        self.verdict == JudgeVerdict::Pass
    }
}

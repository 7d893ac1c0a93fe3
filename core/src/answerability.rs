use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Maximum number of missing-information items carried by a verdict.
pub const MAX_MISSING_INFORMATION: usize = 3;

/// Three-state answerability. Ordered `Insufficient < Derivable < Direct`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum AnswerabilityState {
    Insufficient,
    Derivable,
    Direct,
}

impl AnswerabilityState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insufficient => "insufficient",
            Self::Derivable => "derivable",
            Self::Direct => "direct",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "direct" => Some(Self::Direct),
            "derivable" => Some(Self::Derivable),
            "insufficient" => Some(Self::Insufficient),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityLevel {
    Low,
    Medium,
    High,
}

/// Where a verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Deterministic,
    Judge,
    /// Judge call failed or timed out; deterministic `insufficient` substituted
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AnswerabilityVerdict {
    pub state: AnswerabilityState,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub ambiguity: AmbiguityLevel,
    /// At most three items, most important first
    pub missing_information: Vec<String>,
    pub reasoning: String,
    pub source: VerdictSource,
}

impl AnswerabilityVerdict {
    pub fn new(
        state: AnswerabilityState,
        confidence: f64,
        ambiguity: AmbiguityLevel,
        mut missing_information: Vec<String>,
        reasoning: impl Into<String>,
        source: VerdictSource,
    ) -> Self {
        missing_information.truncate(MAX_MISSING_INFORMATION);
        Self {
            state,
            confidence: confidence.clamp(0.0, 1.0),
            ambiguity,
            missing_information,
            reasoning: reasoning.into(),
            source,
        }
    }

    pub fn is_insufficient(&self) -> bool {
        self.state == AnswerabilityState::Insufficient
    }
}

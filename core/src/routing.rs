use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Maximum clarifying questions per decision.
pub const MAX_CLARIFYING_QUESTIONS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RoutingAction {
    Answer,
    Clarify,
    Escalate,
}

impl RoutingAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Answer => "answer",
            Self::Clarify => "clarify",
            Self::Escalate => "escalate",
        }
    }
}

/// Registered workflows. `Answer` is the default for plain questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
    Diagnose,
    Plan,
    Critique,
    Summarize,
    Brainstorm,
    Evaluate,
    Write,
    Answer,
}

impl Workflow {
    pub const ALL: [Workflow; 8] = [
        Self::Diagnose,
        Self::Plan,
        Self::Critique,
        Self::Summarize,
        Self::Brainstorm,
        Self::Evaluate,
        Self::Write,
        Self::Answer,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Diagnose => "diagnose",
            Self::Plan => "plan",
            Self::Critique => "critique",
            Self::Summarize => "summarize",
            Self::Brainstorm => "brainstorm",
            Self::Evaluate => "evaluate",
            Self::Write => "write",
            Self::Answer => "answer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_lowercase();
        Self::ALL.into_iter().find(|workflow| workflow.as_str() == value)
    }
}

/// One routing decision per turn, persisted verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RoutingDecision {
    pub intent: String,
    pub confidence: f64,
    pub required_inputs_missing: Vec<String>,
    pub chosen_workflow: Workflow,
    pub output_schema: String,
    pub action: RoutingAction,
    /// At most three, each tied to a distinct missing input
    pub clarifying_questions: Vec<String>,
    /// Machine reason codes for owner-side debugging
    #[serde(default)]
    pub reason_codes: Vec<String>,
}

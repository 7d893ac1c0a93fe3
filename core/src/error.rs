use serde::Serialize;
use utoipa::ToSchema;

/// Structured error response for agents and widgets.
/// Every error carries enough information for a client to decide what to do next
/// without ever exposing internal identifiers.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    /// Machine-readable error code (e.g. "validation_failed", "not_found", "forbidden")
    pub error: String,
    /// Domain-specific machine code for deterministic remediation (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Human/agent-readable description of what went wrong
    pub message: String,
    /// Which request field caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The value that was received (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<serde_json::Value>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about what the correct usage looks like
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
}

/// Error codes used across the API
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT: &str = "conflict";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const FORBIDDEN: &str = "forbidden";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const ACTION_FORBIDDEN: &str = "action_forbidden";
    pub const ACTION_MISSING_PARAMS: &str = "action_missing_params";
}

/// Failure taxonomy of a single turn.
///
/// Only `Authorization` is fatal for the turn. Every other variant is recovered
/// locally by the stage that raised it; the variants exist so the recovery is
/// logged with a stable name.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("authorization failed: {0}")]
    Authorization(String),
    #[error("evidence unavailable: {0}")]
    EvidenceUnavailable(String),
    #[error("judge unavailable: {0}")]
    JudgeUnavailable(String),
    #[error("action forbidden in this context")]
    ActionForbidden,
    #[error("action is missing required parameters")]
    ActionMissingParams { missing: Vec<String> },
    #[error("persistence failed: {0}")]
    PersistenceFailure(String),
}

impl TurnError {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Authorization(_) => "authorization_error",
            Self::EvidenceUnavailable(_) => "evidence_unavailable",
            Self::JudgeUnavailable(_) => "judge_unavailable",
            Self::ActionForbidden => "action_forbidden",
            Self::ActionMissingParams { .. } => "action_missing_params",
            Self::PersistenceFailure(_) => "persistence_failure",
        }
    }

    /// Whether the turn must stop and surface a refusal.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Authorization(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_authorization_is_fatal() {
        assert!(TurnError::Authorization("mismatch".into()).is_fatal());
        assert!(!TurnError::EvidenceUnavailable("timeout".into()).is_fatal());
        assert!(!TurnError::JudgeUnavailable("timeout".into()).is_fatal());
        assert!(!TurnError::ActionForbidden.is_fatal());
        assert!(!TurnError::PersistenceFailure("db".into()).is_fatal());
    }

    #[test]
    fn kinds_are_stable_snake_case() {
        assert_eq!(
            TurnError::ActionMissingParams {
                missing: vec!["recipient".into()]
            }
            .kind(),
            "action_missing_params"
        );
        assert_eq!(TurnError::ActionForbidden.kind(), "action_forbidden");
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SendEmail,
    ScheduleMeeting,
    CreateTask,
}

impl ActionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SendEmail => "send_email",
            Self::ScheduleMeeting => "schedule_meeting",
            Self::CreateTask => "create_task",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "send_email" => Some(Self::SendEmail),
            "schedule_meeting" => Some(Self::ScheduleMeeting),
            "create_task" => Some(Self::CreateTask),
            _ => None,
        }
    }

    pub const fn required_params(self) -> &'static [&'static str] {
        match self {
            Self::SendEmail => &["recipient", "subject", "body"],
            Self::ScheduleMeeting => &["attendee", "time"],
            Self::CreateTask => &["title"],
        }
    }

    /// Human wording for a required parameter. Never the field identifier.
    pub fn describe_param(self, param: &str) -> &'static str {
        match (self, param) {
            (Self::SendEmail, "recipient") => "who the email should go to",
            (Self::SendEmail, "subject") => "what the email should be titled",
            (Self::SendEmail, "body") => "what the message should say",
            (Self::ScheduleMeeting, "attendee") => "who should attend the meeting",
            (Self::ScheduleMeeting, "time") => "when the meeting should happen",
            (Self::CreateTask, "title") => "what the task should be called",
            _ => "a few more details",
        }
    }

    pub const fn noun(self) -> &'static str {
        match self {
            Self::SendEmail => "email",
            Self::ScheduleMeeting => "meeting",
            Self::CreateTask => "task",
        }
    }
}

/// Lifecycle of an action draft.
///
/// proposed → needs_approval → approved → executed | failed. The remaining
/// states are terminal outcomes of the proposal itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Proposed,
    NeedsApproval,
    Approved,
    Executed,
    Failed,
    MissingParams,
    Forbidden,
    Disabled,
}

impl ActionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::NeedsApproval => "needs_approval",
            Self::Approved => "approved",
            Self::Executed => "executed",
            Self::Failed => "failed",
            Self::MissingParams => "missing_params",
            Self::Forbidden => "forbidden",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "proposed" => Some(Self::Proposed),
            "needs_approval" => Some(Self::NeedsApproval),
            "approved" => Some(Self::Approved),
            "executed" => Some(Self::Executed),
            "failed" => Some(Self::Failed),
            "missing_params" => Some(Self::MissingParams),
            "forbidden" => Some(Self::Forbidden),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Executed | Self::Failed | Self::MissingParams | Self::Forbidden | Self::Disabled
        )
    }

    pub const fn can_transition_to(self, next: ActionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Proposed, Self::NeedsApproval)
                | (Self::Proposed, Self::Approved)
                | (Self::Proposed, Self::MissingParams)
                | (Self::Proposed, Self::Forbidden)
                | (Self::Proposed, Self::Disabled)
                | (Self::NeedsApproval, Self::Approved)
                | (Self::Approved, Self::Executed)
                | (Self::Approved, Self::Failed)
        )
    }
}

/// Persisted action record. Upserted by id; last writer wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ActionDraft {
    pub id: Uuid,
    pub twin_id: Uuid,
    pub requested_by: Option<Uuid>,
    pub action_type: ActionType,
    pub params: BTreeMap<String, String>,
    pub status: ActionStatus,
    pub execution_id: Option<Uuid>,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-turn outcome of the action lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ActionPlan {
    /// Only outcome states reach a plan: needs_approval, executed, failed,
    /// missing_params, forbidden or disabled. `proposed` and `approved` exist
    /// on stored drafts while the lane is mid-transition.
    pub status: ActionStatus,
    pub action_type: ActionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_is_the_only_way_into_execution() {
        assert!(ActionStatus::NeedsApproval.can_transition_to(ActionStatus::Approved));
        assert!(ActionStatus::Approved.can_transition_to(ActionStatus::Executed));
        assert!(!ActionStatus::NeedsApproval.can_transition_to(ActionStatus::Executed));
        assert!(!ActionStatus::Proposed.can_transition_to(ActionStatus::Executed));
        assert!(!ActionStatus::Forbidden.can_transition_to(ActionStatus::Approved));
    }

    #[test]
    fn terminal_states_do_not_transition() {
        for status in [
            ActionStatus::Executed,
            ActionStatus::Failed,
            ActionStatus::MissingParams,
            ActionStatus::Forbidden,
            ActionStatus::Disabled,
        ] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(ActionStatus::Approved));
        }
    }

    #[test]
    fn param_descriptions_never_echo_field_names() {
        for action in [
            ActionType::SendEmail,
            ActionType::ScheduleMeeting,
            ActionType::CreateTask,
        ] {
            for param in action.required_params() {
                assert!(!action.describe_param(param).contains(param));
            }
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Trust boundary of a turn. Derived once per turn from trusted signals only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InteractionContextKind {
    OwnerTraining,
    OwnerChat,
    PublicShare,
    PublicWidget,
}

impl InteractionContextKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OwnerTraining => "OWNER_TRAINING",
            Self::OwnerChat => "OWNER_CHAT",
            Self::PublicShare => "PUBLIC_SHARE",
            Self::PublicWidget => "PUBLIC_WIDGET",
        }
    }

    pub const fn is_owner(self) -> bool {
        matches!(self, Self::OwnerTraining | Self::OwnerChat)
    }

    pub const fn is_public(self) -> bool {
        !self.is_owner()
    }

    pub const fn allows_training_writes(self) -> bool {
        matches!(self, Self::OwnerTraining)
    }
}

/// Resolved interaction context for one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct InteractionContext {
    pub kind: InteractionContextKind,
    /// Endpoint the turn arrived on (e.g. "chat", "widget", "share", "training")
    pub origin_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub training_session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_link_id: Option<Uuid>,
    /// Non-reversible share-token fingerprint, kept for tracing only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_token_fingerprint: Option<String>,
}

impl InteractionContext {
    pub fn new(kind: InteractionContextKind, origin_endpoint: impl Into<String>) -> Self {
        Self {
            kind,
            origin_endpoint: origin_endpoint.into(),
            training_session_id: None,
            share_link_id: None,
            share_token_fingerprint: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Visitor,
    Anonymous,
}

/// Authenticated caller as supplied by the session/auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub role: Role,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            tenant_id: None,
            role: Role::Anonymous,
        }
    }

    pub fn owner(user_id: Uuid, tenant_id: Option<Uuid>) -> Self {
        Self {
            user_id: Some(user_id),
            tenant_id,
            role: Role::Owner,
        }
    }

    pub fn visitor(user_id: Option<Uuid>, tenant_id: Option<Uuid>) -> Self {
        Self {
            user_id,
            tenant_id,
            role: Role::Visitor,
        }
    }
}

/// Raw per-request signals. Nothing here is trusted on its own.
#[derive(Debug, Clone, Default)]
pub struct ContextSignals {
    pub origin_endpoint: String,
    pub training_session_id: Option<Uuid>,
    pub share_token: Option<String>,
    /// Caller-supplied mode hint; logged, never authoritative
    pub requested_mode: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingSessionStatus {
    Active,
    Expired,
    Closed,
}

impl TrainingSessionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingSession {
    pub id: Uuid,
    pub twin_id: Uuid,
    pub owner_id: Uuid,
    pub status: TrainingSessionStatus,
    pub expires_at: DateTime<Utc>,
}

impl TrainingSession {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.status == TrainingSessionStatus::Active && self.expires_at > now
    }

    /// Active in storage but past its expiry; needs the lazy expiry write.
    pub fn needs_expiry_mark(&self, now: DateTime<Utc>) -> bool {
        self.status == TrainingSessionStatus::Active && self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareLink {
    pub id: Uuid,
    pub twin_id: Uuid,
    pub token_hash: String,
    pub revoked: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ShareLink {
    pub fn is_usable_for(&self, twin_id: Uuid, now: DateTime<Utc>) -> bool {
        !self.revoked && self.twin_id == twin_id && self.expires_at.is_none_or(|at| at > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn only_owner_training_allows_training_writes() {
        assert!(InteractionContextKind::OwnerTraining.allows_training_writes());
        assert!(!InteractionContextKind::OwnerChat.allows_training_writes());
        assert!(!InteractionContextKind::PublicShare.allows_training_writes());
        assert!(!InteractionContextKind::PublicWidget.allows_training_writes());
    }

    #[test]
    fn context_kind_serializes_as_screaming_snake_case() {
        let value = serde_json::to_value(InteractionContextKind::PublicShare).unwrap();
        assert_eq!(value, serde_json::json!("PUBLIC_SHARE"));
    }

    #[test]
    fn training_session_liveness_respects_expiry() {
        let now = Utc::now();
        let mut session = TrainingSession {
            id: Uuid::now_v7(),
            twin_id: Uuid::now_v7(),
            owner_id: Uuid::now_v7(),
            status: TrainingSessionStatus::Active,
            expires_at: now + Duration::minutes(5),
        };
        assert!(session.is_live_at(now));
        assert!(!session.needs_expiry_mark(now));

        session.expires_at = now - Duration::seconds(1);
        assert!(!session.is_live_at(now));
        assert!(session.needs_expiry_mark(now));
    }

    #[test]
    fn share_link_rejects_revoked_or_foreign_twin() {
        let now = Utc::now();
        let twin_id = Uuid::now_v7();
        let link = ShareLink {
            id: Uuid::now_v7(),
            twin_id,
            token_hash: "h".into(),
            revoked: false,
            expires_at: None,
        };
        assert!(link.is_usable_for(twin_id, now));
        assert!(!link.is_usable_for(Uuid::now_v7(), now));
        let revoked = ShareLink {
            revoked: true,
            ..link
        };
        assert!(!revoked.is_usable_for(twin_id, now));
    }
}

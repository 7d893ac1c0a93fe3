//! Interaction context resolution: the trust boundary of a turn.
//!
//! Only the authenticated principal and server-side session/share records
//! decide the context. Caller-supplied mode hints are logged and dropped.

use std::time::Duration;

use chrono::{DateTime, Utc};
use twin_core::auth::{hash_token, share_token_fingerprint};
use twin_core::context::{
    ContextSignals, InteractionContext, InteractionContextKind, Principal, Role,
};
use twin_core::error::TurnError;
use uuid::Uuid;

use crate::stores::{SessionDirectory, StoreError, with_timeout};

pub async fn resolve_context(
    sessions: &dyn SessionDirectory,
    store_timeout: Duration,
    signals: &ContextSignals,
    principal: &Principal,
    twin_id: Uuid,
    now: DateTime<Utc>,
) -> Result<InteractionContext, TurnError> {
    if let Some(mode) = signals.requested_mode.as_deref() {
        tracing::info!(
            twin_id = %twin_id,
            requested_mode = mode,
            "caller-supplied mode ignored"
        );
    }

    let origin = signals.origin_endpoint.as_str();
    match principal.role {
        Role::Visitor => {
            if signals.training_session_id.is_some() || signals.share_token.is_some() {
                tracing::info!(
                    twin_id = %twin_id,
                    "visitor supplied owner/share signals; resolving to widget"
                );
            }
            Ok(InteractionContext::new(
                InteractionContextKind::PublicWidget,
                origin,
            ))
        }
        Role::Owner => {
            let Some(user_id) = principal.user_id else {
                return Err(TurnError::Authorization(
                    "owner principal without user id".to_string(),
                ));
            };
            let owner = match with_timeout(
                store_timeout,
                "session directory",
                sessions.twin_owner(twin_id),
            )
            .await
            {
                Ok(owner) => owner,
                Err(err) => {
                    tracing::warn!(
                        twin_id = %twin_id,
                        error = %err,
                        "twin ownership lookup failed; treating caller as non-owner"
                    );
                    None
                }
            };
            if owner == Some(user_id) {
                resolve_owner_context(sessions, store_timeout, signals, user_id, twin_id, now)
                    .await
            } else {
                resolve_public_context(sessions, store_timeout, signals, twin_id, now).await
            }
        }
        Role::Anonymous => {
            resolve_public_context(sessions, store_timeout, signals, twin_id, now).await
        }
    }
}

async fn resolve_owner_context(
    sessions: &dyn SessionDirectory,
    store_timeout: Duration,
    signals: &ContextSignals,
    owner_id: Uuid,
    twin_id: Uuid,
    now: DateTime<Utc>,
) -> Result<InteractionContext, TurnError> {
    let origin = signals.origin_endpoint.as_str();
    let session = match signals.training_session_id {
        Some(session_id) => {
            let session = with_timeout(
                store_timeout,
                "session directory",
                sessions.get_training_session(session_id),
            )
            .await
            .map_err(authorization_unavailable)?
            .ok_or_else(|| TurnError::Authorization("unknown training session".to_string()))?;
            if session.owner_id != owner_id || session.twin_id != twin_id {
                return Err(TurnError::Authorization(
                    "training session ownership mismatch".to_string(),
                ));
            }
            Some(session)
        }
        None if origin.eq_ignore_ascii_case("training") => {
            match with_timeout(
                store_timeout,
                "session directory",
                sessions.active_training_session(twin_id, owner_id),
            )
            .await
            {
                Ok(session) => session,
                Err(err) => {
                    tracing::warn!(error = %err, "active training session lookup failed");
                    None
                }
            }
        }
        None => None,
    };

    let Some(session) = session else {
        return Ok(InteractionContext::new(
            InteractionContextKind::OwnerChat,
            origin,
        ));
    };

    if session.needs_expiry_mark(now) {
        if let Err(err) = with_timeout(
            store_timeout,
            "session directory",
            sessions.mark_training_session_expired(session.id),
        )
        .await
        {
            tracing::warn!(
                session_id = %session.id,
                error = %err,
                "failed to mark training session expired"
            );
        }
        tracing::info!(session_id = %session.id, "training session expired on read");
    }

    if session.is_live_at(now) {
        let mut context = InteractionContext::new(InteractionContextKind::OwnerTraining, origin);
        context.training_session_id = Some(session.id);
        Ok(context)
    } else {
        Ok(InteractionContext::new(
            InteractionContextKind::OwnerChat,
            origin,
        ))
    }
}

async fn resolve_public_context(
    sessions: &dyn SessionDirectory,
    store_timeout: Duration,
    signals: &ContextSignals,
    twin_id: Uuid,
    now: DateTime<Utc>,
) -> Result<InteractionContext, TurnError> {
    let origin = signals.origin_endpoint.as_str();
    if signals.training_session_id.is_some() {
        tracing::info!(twin_id = %twin_id, "training session id from non-owner ignored");
    }
    let Some(token) = signals
        .share_token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
    else {
        return Ok(InteractionContext::new(
            InteractionContextKind::PublicWidget,
            origin,
        ));
    };

    let fingerprint = share_token_fingerprint(token);
    let link = with_timeout(
        store_timeout,
        "session directory",
        sessions.find_share_link(&hash_token(token)),
    )
    .await
    .map_err(authorization_unavailable)?;
    match link {
        Some(link) if link.is_usable_for(twin_id, now) => {
            let mut context = InteractionContext::new(InteractionContextKind::PublicShare, origin);
            context.share_link_id = Some(link.id);
            context.share_token_fingerprint = Some(fingerprint);
            Ok(context)
        }
        Some(_) => Err(TurnError::Authorization(format!(
            "share link {fingerprint} revoked, expired or bound to another twin"
        ))),
        None => Err(TurnError::Authorization(format!(
            "unknown share token {fingerprint}"
        ))),
    }
}

fn authorization_unavailable(err: StoreError) -> TurnError {
    TurnError::Authorization(format!("session directory unavailable: {err}"))
}

/// Training writes (runtime modules, verified answers) require OWNER_TRAINING.
pub fn ensure_training_write_allowed(context: &InteractionContext) -> Result<(), TurnError> {
    if context.kind.allows_training_writes() {
        Ok(())
    } else {
        Err(TurnError::Authorization(format!(
            "training writes are not allowed in {} context",
            context.kind.as_str()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use twin_core::context::{ShareLink, TrainingSession, TrainingSessionStatus};

    const TIMEOUT: Duration = Duration::from_millis(500);

    struct Fixture {
        store: MemoryStore,
        twin_id: Uuid,
        owner_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let twin_id = Uuid::now_v7();
        let owner_id = Uuid::now_v7();
        store.add_twin(twin_id, owner_id, None).await;
        Fixture {
            store,
            twin_id,
            owner_id,
        }
    }

    fn signals(origin: &str) -> ContextSignals {
        ContextSignals {
            origin_endpoint: origin.to_string(),
            ..ContextSignals::default()
        }
    }

    async fn add_session(f: &Fixture, owner_id: Uuid, expires_in: ChronoDuration) -> Uuid {
        let id = Uuid::now_v7();
        f.store
            .add_training_session(TrainingSession {
                id,
                twin_id: f.twin_id,
                owner_id,
                status: TrainingSessionStatus::Active,
                expires_at: Utc::now() + expires_in,
            })
            .await;
        id
    }

    #[tokio::test]
    async fn visitor_with_training_session_resolves_to_widget() {
        let f = fixture().await;
        let session_id = add_session(&f, f.owner_id, ChronoDuration::minutes(30)).await;
        let mut signals = signals("chat");
        signals.training_session_id = Some(session_id);
        signals.requested_mode = Some("OWNER_TRAINING".into());

        let context = resolve_context(
            &f.store,
            TIMEOUT,
            &signals,
            &Principal::visitor(None, None),
            f.twin_id,
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(context.kind, InteractionContextKind::PublicWidget);
        assert_eq!(context.training_session_id, None);
    }

    #[tokio::test]
    async fn owner_with_live_session_resolves_to_training() {
        let f = fixture().await;
        let session_id = add_session(&f, f.owner_id, ChronoDuration::minutes(30)).await;
        let mut signals = signals("training");
        signals.training_session_id = Some(session_id);

        let context = resolve_context(
            &f.store,
            TIMEOUT,
            &signals,
            &Principal::owner(f.owner_id, None),
            f.twin_id,
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(context.kind, InteractionContextKind::OwnerTraining);
        assert_eq!(context.training_session_id, Some(session_id));
        assert!(ensure_training_write_allowed(&context).is_ok());
    }

    #[tokio::test]
    async fn training_origin_picks_up_active_session_without_explicit_id() {
        let f = fixture().await;
        add_session(&f, f.owner_id, ChronoDuration::minutes(30)).await;
        let context = resolve_context(
            &f.store,
            TIMEOUT,
            &signals("training"),
            &Principal::owner(f.owner_id, None),
            f.twin_id,
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(context.kind, InteractionContextKind::OwnerTraining);
    }

    #[tokio::test]
    async fn session_of_another_owner_is_an_authorization_error() {
        let f = fixture().await;
        let foreign = add_session(&f, Uuid::now_v7(), ChronoDuration::minutes(30)).await;
        let mut signals = signals("training");
        signals.training_session_id = Some(foreign);

        let err = resolve_context(
            &f.store,
            TIMEOUT,
            &signals,
            &Principal::owner(f.owner_id, None),
            f.twin_id,
            Utc::now(),
        )
        .await
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn expired_session_is_marked_and_downgraded_to_chat() {
        let f = fixture().await;
        let session_id = add_session(&f, f.owner_id, ChronoDuration::minutes(-1)).await;
        let mut signals = signals("training");
        signals.training_session_id = Some(session_id);

        let context = resolve_context(
            &f.store,
            TIMEOUT,
            &signals,
            &Principal::owner(f.owner_id, None),
            f.twin_id,
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(context.kind, InteractionContextKind::OwnerChat);
        assert!(ensure_training_write_allowed(&context).is_err());
        let stored = f.store.training_session(session_id).await.unwrap();
        assert_eq!(stored.status, TrainingSessionStatus::Expired);
    }

    #[tokio::test]
    async fn valid_share_token_keeps_only_fingerprint() {
        let f = fixture().await;
        let token = "share-token-abcdef";
        f.store
            .add_share_link(
                token,
                ShareLink {
                    id: Uuid::now_v7(),
                    twin_id: f.twin_id,
                    token_hash: hash_token(token),
                    revoked: false,
                    expires_at: None,
                },
            )
            .await;
        let mut signals = signals("share");
        signals.share_token = Some(token.to_string());

        let context = resolve_context(
            &f.store,
            TIMEOUT,
            &signals,
            &Principal::anonymous(),
            f.twin_id,
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(context.kind, InteractionContextKind::PublicShare);
        let fingerprint = context.share_token_fingerprint.unwrap();
        assert!(!fingerprint.contains("share-token"));
    }

    #[tokio::test]
    async fn revoked_or_unknown_share_token_is_refused() {
        let f = fixture().await;
        let token = "revoked-token";
        f.store
            .add_share_link(
                token,
                ShareLink {
                    id: Uuid::now_v7(),
                    twin_id: f.twin_id,
                    token_hash: hash_token(token),
                    revoked: true,
                    expires_at: None,
                },
            )
            .await;
        for candidate in [token, "never-issued"] {
            let mut signals = signals("share");
            signals.share_token = Some(candidate.to_string());
            let result = resolve_context(
                &f.store,
                TIMEOUT,
                &signals,
                &Principal::anonymous(),
                f.twin_id,
                Utc::now(),
            )
            .await;
            assert!(matches!(result, Err(TurnError::Authorization(_))));
        }
    }

    #[tokio::test]
    async fn owner_of_another_twin_is_treated_as_public() {
        let f = fixture().await;
        let context = resolve_context(
            &f.store,
            TIMEOUT,
            &signals("chat"),
            &Principal::owner(Uuid::now_v7(), None),
            f.twin_id,
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(context.kind, InteractionContextKind::PublicWidget);
    }

    #[tokio::test]
    async fn anonymous_mode_hint_is_not_authoritative() {
        let f = fixture().await;
        let mut signals = signals("widget");
        signals.requested_mode = Some("OWNER_CHAT".into());
        let context = resolve_context(
            &f.store,
            TIMEOUT,
            &signals,
            &Principal::anonymous(),
            f.twin_id,
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(context.kind, InteractionContextKind::PublicWidget);
    }
}

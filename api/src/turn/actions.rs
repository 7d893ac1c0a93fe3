//! Action lane: turns an action intent into a gated draft and runs approved
//! drafts under a step budget and a deadline.

use chrono::{DateTime, Utc};
use twin_core::actions::{ActionDraft, ActionPlan, ActionStatus, ActionType};
use twin_core::context::{InteractionContext, Principal, Role};
use twin_core::error::{TurnError, codes};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::stores::{StepOutcome, StoreError, Stores, with_timeout};
use crate::turn::profile::ActionIntent;

pub const FORBIDDEN_MESSAGE: &str = "I can't take actions from this conversation.";
const DISABLED_MESSAGE: &str = "Taking actions is switched off for this twin right now.";

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub plan: ActionPlan,
    /// User-facing text; never echoes parameters or field identifiers
    pub message: String,
}

fn outcome(
    status: ActionStatus,
    action_type: ActionType,
    error_code: Option<&str>,
    message: impl Into<String>,
) -> ActionOutcome {
    ActionOutcome {
        plan: ActionPlan {
            status,
            action_type,
            action_id: None,
            execution_id: None,
            error_code: error_code.map(str::to_string),
        },
        message: message.into(),
    }
}

/// Required parameters absent or blank in `params`, in declaration order.
pub fn missing_params(intent: &ActionIntent) -> Vec<&'static str> {
    intent
        .action_type
        .required_params()
        .iter()
        .copied()
        .filter(|param| {
            intent
                .params
                .get(*param)
                .is_none_or(|value| value.trim().is_empty())
        })
        .collect()
}

/// One question covering every missing parameter, in plain words.
pub fn missing_params_question(action_type: ActionType, missing: &[&str]) -> String {
    let descriptions: Vec<&str> = missing
        .iter()
        .map(|param| action_type.describe_param(param))
        .collect();
    let joined = match descriptions.as_slice() {
        [] => "a few more details".to_string(),
        [only] => (*only).to_string(),
        [rest @ .., last] => format!("{} and {last}", rest.join(", ")),
    };
    format!(
        "I can set up that {} once I know {joined}. Could you tell me?",
        action_type.noun()
    )
}

async fn append_audit(stores: &Stores, config: &PipelineConfig, kind: &str, payload: serde_json::Value) {
    if let Err(err) = with_timeout(
        config.store_timeout,
        "approval audit store",
        stores.audit.append_event(kind, payload),
    )
    .await
    {
        let err = TurnError::PersistenceFailure(err.to_string());
        tracing::warn!(kind, error = %err, "audit event not written");
    }
}

async fn save_draft(stores: &Stores, config: &PipelineConfig, draft: &ActionDraft) -> Result<(), StoreError> {
    with_timeout(
        config.store_timeout,
        "approval audit store",
        stores.audit.upsert_action_draft(draft),
    )
    .await
}

/// Gate an action intent for this turn.
pub async fn propose(
    stores: &Stores,
    config: &PipelineConfig,
    context: &InteractionContext,
    principal: &Principal,
    twin_id: Uuid,
    intent: &ActionIntent,
    now: DateTime<Utc>,
) -> ActionOutcome {
    let action_type = intent.action_type;

    if context.kind.is_public() {
        tracing::info!(
            context = context.kind.as_str(),
            action_type = action_type.as_str(),
            "action intent refused in public context"
        );
        append_audit(
            stores,
            config,
            "action_forbidden",
            serde_json::json!({
                "twin_id": twin_id,
                "action_type": action_type.as_str(),
                "context": context.kind.as_str(),
            }),
        )
        .await;
        return outcome(
            ActionStatus::Forbidden,
            action_type,
            Some(codes::ACTION_FORBIDDEN),
            FORBIDDEN_MESSAGE,
        );
    }

    if !config.actions_enabled {
        return outcome(
            ActionStatus::Disabled,
            action_type,
            Some("actions_disabled"),
            DISABLED_MESSAGE,
        );
    }

    let missing = missing_params(intent);
    if !missing.is_empty() {
        let err = TurnError::ActionMissingParams {
            missing: missing.iter().map(|param| param.to_string()).collect(),
        };
        tracing::info!(error = %err, action_type = action_type.as_str(), "action intent incomplete");
        return outcome(
            ActionStatus::MissingParams,
            action_type,
            Some(codes::ACTION_MISSING_PARAMS),
            missing_params_question(action_type, &missing),
        );
    }

    let mut draft = ActionDraft {
        id: Uuid::now_v7(),
        twin_id,
        requested_by: principal.user_id,
        action_type,
        params: intent.params.clone(),
        status: ActionStatus::Proposed,
        execution_id: None,
        error_code: None,
        created_at: now,
        updated_at: now,
    };

    if !config.action_approval_required {
        draft.status = ActionStatus::Approved;
        if let Err(err) = save_draft(stores, config, &draft).await {
            tracing::warn!(error = %err, "approved draft not persisted before execution");
        }
        let executed = execute(stores, config, draft).await;
        let message = match executed.status {
            ActionStatus::Executed => format!("Done. The {} is taken care of.", action_type.noun()),
            _ => format!("I couldn't finish the {}. Nothing else was changed.", action_type.noun()),
        };
        return ActionOutcome {
            plan: plan_of(&executed),
            message,
        };
    }

    draft.status = ActionStatus::NeedsApproval;
    if let Err(err) = save_draft(stores, config, &draft).await {
        let err = TurnError::PersistenceFailure(err.to_string());
        tracing::warn!(error = %err, action_id = %draft.id, "action draft not persisted");
    }
    ActionOutcome {
        plan: plan_of(&draft),
        message: format!(
            "I've drafted the {}. It goes out once you approve it.",
            action_type.noun()
        ),
    }
}

pub fn plan_of(draft: &ActionDraft) -> ActionPlan {
    ActionPlan {
        status: draft.status,
        action_type: draft.action_type,
        action_id: Some(draft.id),
        execution_id: draft.execution_id,
        error_code: draft.error_code.clone(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("action draft not found")]
    NotFound,
    #[error("only the twin owner can approve actions")]
    NotOwner,
    #[error("action is {0} and cannot be approved")]
    InvalidState(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Owner approval: needs_approval → approved → executed | failed.
pub async fn approve(
    stores: &Stores,
    config: &PipelineConfig,
    principal: &Principal,
    twin_id: Uuid,
    action_id: Uuid,
    now: DateTime<Utc>,
) -> Result<ActionPlan, ApprovalError> {
    let Some(user_id) = principal.user_id.filter(|_| principal.role == Role::Owner) else {
        return Err(ApprovalError::NotOwner);
    };
    let owner = with_timeout(
        config.store_timeout,
        "session directory",
        stores.sessions.twin_owner(twin_id),
    )
    .await?;
    if owner != Some(user_id) {
        return Err(ApprovalError::NotOwner);
    }

    let draft = with_timeout(
        config.store_timeout,
        "approval audit store",
        stores.audit.get_action_draft(action_id),
    )
    .await?
    .filter(|draft| draft.twin_id == twin_id)
    .ok_or(ApprovalError::NotFound)?;
    if !draft.status.can_transition_to(ActionStatus::Approved) || draft.status != ActionStatus::NeedsApproval {
        return Err(ApprovalError::InvalidState(draft.status.as_str()));
    }

    let approved = ActionDraft {
        status: ActionStatus::Approved,
        updated_at: now,
        ..draft
    };
    let won = with_timeout(
        config.store_timeout,
        "approval audit store",
        stores.audit.transition_action_draft(&approved, ActionStatus::NeedsApproval),
    )
    .await?;
    if !won {
        tracing::info!(action_id = %action_id, "approval lost to a concurrent approval");
        return Err(ApprovalError::InvalidState(ActionStatus::Approved.as_str()));
    }
    let executed = execute(stores, config, approved).await;
    Ok(plan_of(&executed))
}

/// Run an approved draft step by step under the step budget and deadline,
/// with audit events before and after.
pub async fn execute(stores: &Stores, config: &PipelineConfig, mut draft: ActionDraft) -> ActionDraft {
    let execution_id = Uuid::now_v7();
    draft.execution_id = Some(execution_id);
    append_audit(
        stores,
        config,
        "action_execution_started",
        serde_json::json!({
            "action_id": draft.id,
            "execution_id": execution_id,
            "action_type": draft.action_type.as_str(),
            "max_steps": config.action_max_steps,
        }),
    )
    .await;

    let max_steps = config.action_max_steps.max(1);
    let run = async {
        for step in 1..=max_steps {
            match stores.connector.execute_step(&draft, step).await? {
                StepOutcome::Done => return Ok(Some(step)),
                StepOutcome::Continue => {}
            }
        }
        Ok::<Option<u32>, StoreError>(None)
    };
    let (status, error_code, steps) = match tokio::time::timeout(config.action_timeout, run).await {
        Ok(Ok(Some(steps))) => (ActionStatus::Executed, None, Some(steps)),
        Ok(Ok(None)) => (ActionStatus::Failed, Some("step_budget_exhausted"), None),
        Ok(Err(err)) => {
            tracing::warn!(error = %err, action_id = %draft.id, "action connector failed");
            (ActionStatus::Failed, Some("connector_error"), None)
        }
        Err(_) => (ActionStatus::Failed, Some("execution_timeout"), None),
    };

    draft.status = status;
    draft.error_code = error_code.map(str::to_string);
    draft.updated_at = Utc::now();
    if let Err(err) = save_draft(stores, config, &draft).await {
        let err = TurnError::PersistenceFailure(err.to_string());
        tracing::warn!(error = %err, action_id = %draft.id, "executed draft not persisted");
    }
    append_audit(
        stores,
        config,
        "action_execution_finished",
        serde_json::json!({
            "action_id": draft.id,
            "execution_id": execution_id,
            "status": status.as_str(),
            "error_code": error_code,
            "steps": steps,
        }),
    )
    .await;
    tracing::info!(
        action_id = %draft.id,
        status = status.as_str(),
        error_code = error_code.unwrap_or(""),
        "action execution finished"
    );
    draft
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use twin_core::context::InteractionContextKind;
    use twin_core::judge::JudgeResult;
    use twin_core::routing::RoutingDecision;

    use super::*;
    use crate::stores::ApprovalAuditStore;
    use crate::stores::memory::{ConnectorBehavior, MemoryStore};
    use crate::turn::profile::detect_action_intent;

    struct Harness {
        memory: Arc<MemoryStore>,
        stores: Stores,
        twin_id: Uuid,
        owner: Principal,
    }

    async fn harness() -> Harness {
        let memory = Arc::new(MemoryStore::new());
        let twin_id = Uuid::now_v7();
        let owner_id = Uuid::now_v7();
        memory.add_twin(twin_id, owner_id, None).await;
        Harness {
            stores: Stores::in_memory(memory.clone()),
            memory,
            twin_id,
            owner: Principal::owner(owner_id, None),
        }
    }

    fn email_intent() -> ActionIntent {
        ActionIntent {
            action_type: ActionType::SendEmail,
            params: BTreeMap::from([
                ("recipient".to_string(), "a@example.com".to_string()),
                ("subject".to_string(), "Hi".to_string()),
                ("body".to_string(), "Hello".to_string()),
            ]),
        }
    }

    fn context(kind: InteractionContextKind) -> InteractionContext {
        InteractionContext::new(kind, "chat")
    }

    #[tokio::test]
    async fn public_contexts_are_forbidden_without_leaking_params() {
        let h = harness().await;
        for kind in [InteractionContextKind::PublicShare, InteractionContextKind::PublicWidget] {
            let out = propose(
                &h.stores,
                &PipelineConfig::default(),
                &context(kind),
                &Principal::anonymous(),
                h.twin_id,
                &email_intent(),
                Utc::now(),
            )
            .await;
            assert_eq!(out.plan.status, ActionStatus::Forbidden);
            assert_eq!(out.plan.action_id, None);
            assert!(!out.message.contains("a@example.com"));
            assert!(!out.message.contains("Hello"));
        }
        let events = h.memory.events().await;
        assert!(events.iter().all(|(_, payload)| !payload.to_string().contains("a@example.com")));
    }

    #[tokio::test]
    async fn public_refusal_ignores_feature_flags() {
        let h = harness().await;
        let config = PipelineConfig {
            action_approval_required: false,
            ..PipelineConfig::default()
        };
        let out = propose(
            &h.stores,
            &config,
            &context(InteractionContextKind::PublicShare),
            &Principal::anonymous(),
            h.twin_id,
            &email_intent(),
            Utc::now(),
        )
        .await;
        assert_eq!(out.plan.status, ActionStatus::Forbidden);
        assert!(h.memory.executed_steps().await.is_empty());
    }

    #[tokio::test]
    async fn disabled_actions_short_circuit() {
        let h = harness().await;
        let config = PipelineConfig {
            actions_enabled: false,
            ..PipelineConfig::default()
        };
        let out = propose(
            &h.stores,
            &config,
            &context(InteractionContextKind::OwnerChat),
            &h.owner,
            h.twin_id,
            &email_intent(),
            Utc::now(),
        )
        .await;
        assert_eq!(out.plan.status, ActionStatus::Disabled);
    }

    #[tokio::test]
    async fn missing_params_ask_exactly_one_plain_question() {
        let h = harness().await;
        let intent = detect_action_intent("send an email to a@example.com").unwrap();
        let out = propose(
            &h.stores,
            &PipelineConfig::default(),
            &context(InteractionContextKind::OwnerChat),
            &h.owner,
            h.twin_id,
            &intent,
            Utc::now(),
        )
        .await;
        assert_eq!(out.plan.status, ActionStatus::MissingParams);
        assert_eq!(out.message.matches('?').count(), 1);
        for field in ["subject", "body", "recipient"] {
            assert!(!out.message.contains(field));
        }
    }

    #[tokio::test]
    async fn owner_intent_waits_for_approval_then_executes() {
        let h = harness().await;
        let config = PipelineConfig::default();
        let out = propose(
            &h.stores,
            &config,
            &context(InteractionContextKind::OwnerChat),
            &h.owner,
            h.twin_id,
            &email_intent(),
            Utc::now(),
        )
        .await;
        assert_eq!(out.plan.status, ActionStatus::NeedsApproval);
        assert!(h.memory.executed_steps().await.is_empty());
        let action_id = out.plan.action_id.unwrap();

        let plan = approve(&h.stores, &config, &h.owner, h.twin_id, action_id, Utc::now())
            .await
            .unwrap();
        assert_eq!(plan.status, ActionStatus::Executed);
        assert!(plan.execution_id.is_some());

        let kinds: Vec<String> = h.memory.events().await.into_iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec!["action_execution_started", "action_execution_finished"]);

        let again = approve(&h.stores, &config, &h.owner, h.twin_id, action_id, Utc::now()).await;
        assert!(matches!(again, Err(ApprovalError::InvalidState("executed"))));
    }

    /// Audit store whose draft reads take a while, so two approvals both see
    /// the draft before either one moves it.
    struct SlowDraftReads {
        inner: Arc<MemoryStore>,
        delay: Duration,
    }

    #[async_trait]
    impl ApprovalAuditStore for SlowDraftReads {
        async fn upsert_action_draft(&self, draft: &ActionDraft) -> Result<(), StoreError> {
            self.inner.upsert_action_draft(draft).await
        }

        async fn get_action_draft(&self, action_id: Uuid) -> Result<Option<ActionDraft>, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.get_action_draft(action_id).await
        }

        async fn transition_action_draft(
            &self,
            draft: &ActionDraft,
            from: ActionStatus,
        ) -> Result<bool, StoreError> {
            self.inner.transition_action_draft(draft, from).await
        }

        async fn record_routing_decision(
            &self,
            turn_id: Uuid,
            twin_id: Uuid,
            decision: &RoutingDecision,
        ) -> Result<(), StoreError> {
            self.inner.record_routing_decision(turn_id, twin_id, decision).await
        }

        async fn record_judge_result(
            &self,
            turn_id: Uuid,
            twin_id: Uuid,
            result: &JudgeResult,
        ) -> Result<(), StoreError> {
            self.inner.record_judge_result(turn_id, twin_id, result).await
        }

        async fn append_event(
            &self,
            kind: &str,
            payload: serde_json::Value,
        ) -> Result<(), StoreError> {
            self.inner.append_event(kind, payload).await
        }
    }

    #[tokio::test]
    async fn concurrent_approvals_execute_the_action_once() {
        let h = harness().await;
        let config = PipelineConfig::default();
        let out = propose(
            &h.stores,
            &config,
            &context(InteractionContextKind::OwnerChat),
            &h.owner,
            h.twin_id,
            &email_intent(),
            Utc::now(),
        )
        .await;
        let action_id = out.plan.action_id.unwrap();

        let mut stores = h.stores.clone();
        stores.audit = Arc::new(SlowDraftReads {
            inner: h.memory.clone(),
            delay: Duration::from_millis(20),
        });
        let (first, second) = tokio::join!(
            approve(&stores, &config, &h.owner, h.twin_id, action_id, Utc::now()),
            approve(&stores, &config, &h.owner, h.twin_id, action_id, Utc::now()),
        );

        let results = [first, second];
        let executed = results
            .iter()
            .filter(|result| matches!(result, Ok(plan) if plan.status == ActionStatus::Executed))
            .count();
        assert_eq!(executed, 1);
        assert!(
            results
                .iter()
                .any(|result| matches!(result, Err(ApprovalError::InvalidState("approved"))))
        );
        assert_eq!(h.memory.executed_steps().await.len(), 1);
        let started = h
            .memory
            .events()
            .await
            .into_iter()
            .filter(|(kind, _)| kind == "action_execution_started")
            .count();
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn returned_plans_never_carry_transient_states() {
        let h = harness().await;
        let owner_chat = context(InteractionContextKind::OwnerChat);
        let mut plans = Vec::new();
        for approval_required in [true, false] {
            let config = PipelineConfig {
                action_approval_required: approval_required,
                ..PipelineConfig::default()
            };
            let out = propose(
                &h.stores,
                &config,
                &owner_chat,
                &h.owner,
                h.twin_id,
                &email_intent(),
                Utc::now(),
            )
            .await;
            plans.push(out.plan);
        }
        let pending = plans[0].action_id.unwrap();
        plans.push(
            approve(&h.stores, &PipelineConfig::default(), &h.owner, h.twin_id, pending, Utc::now())
                .await
                .unwrap(),
        );

        let statuses: Vec<ActionStatus> = plans.iter().map(|plan| plan.status).collect();
        assert_eq!(
            statuses,
            vec![ActionStatus::NeedsApproval, ActionStatus::Executed, ActionStatus::Executed]
        );
    }

    #[tokio::test]
    async fn only_the_owner_can_approve() {
        let h = harness().await;
        let config = PipelineConfig::default();
        let out = propose(
            &h.stores,
            &config,
            &context(InteractionContextKind::OwnerChat),
            &h.owner,
            h.twin_id,
            &email_intent(),
            Utc::now(),
        )
        .await;
        let action_id = out.plan.action_id.unwrap();
        let stranger = Principal::owner(Uuid::now_v7(), None);
        let result = approve(&h.stores, &config, &stranger, h.twin_id, action_id, Utc::now()).await;
        assert!(matches!(result, Err(ApprovalError::NotOwner)));
        let visitor = Principal::visitor(h.owner.user_id, None);
        let result = approve(&h.stores, &config, &visitor, h.twin_id, action_id, Utc::now()).await;
        assert!(matches!(result, Err(ApprovalError::NotOwner)));
    }

    #[tokio::test]
    async fn step_budget_exhaustion_fails_the_action() {
        let h = harness().await;
        h.memory
            .set_connector_behavior(ConnectorBehavior {
                steps_to_finish: 10,
                step_delay: Duration::ZERO,
            })
            .await;
        let config = PipelineConfig {
            action_approval_required: false,
            action_max_steps: 3,
            ..PipelineConfig::default()
        };
        let out = propose(
            &h.stores,
            &config,
            &context(InteractionContextKind::OwnerChat),
            &h.owner,
            h.twin_id,
            &email_intent(),
            Utc::now(),
        )
        .await;
        assert_eq!(out.plan.status, ActionStatus::Failed);
        assert_eq!(out.plan.error_code.as_deref(), Some("step_budget_exhausted"));
        assert_eq!(h.memory.executed_steps().await.len(), 3);
    }

    #[tokio::test]
    async fn slow_connector_hits_the_deadline() {
        let h = harness().await;
        h.memory
            .set_connector_behavior(ConnectorBehavior {
                steps_to_finish: 1,
                step_delay: Duration::from_millis(200),
            })
            .await;
        let config = PipelineConfig {
            action_approval_required: false,
            action_timeout: Duration::from_millis(10),
            ..PipelineConfig::default()
        };
        let out = propose(
            &h.stores,
            &config,
            &context(InteractionContextKind::OwnerTraining),
            &h.owner,
            h.twin_id,
            &email_intent(),
            Utc::now(),
        )
        .await;
        assert_eq!(out.plan.status, ActionStatus::Failed);
        assert_eq!(out.plan.error_code.as_deref(), Some("execution_timeout"));
    }
}

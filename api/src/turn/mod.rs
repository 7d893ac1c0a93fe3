//! Turn engine: one short-lived pipeline run per user message.
//!
//! resolve context → profile → action lane | (persona → fast path or
//! retrieval + answerability) → routing → compile → plan → realize → audit →
//! scrub → best-effort persistence → telemetry.

pub mod actions;
pub mod answerability;
pub mod auditor;
pub mod compiler;
pub mod context;
pub mod planner;
pub mod profile;
pub mod realizer;
pub mod retrieval;
pub mod routing;
pub mod scrub;
pub mod telemetry;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use twin_core::actions::{ActionPlan, ActionStatus};
use twin_core::answerability::{AnswerabilityState, AnswerabilityVerdict, VerdictSource};
use twin_core::context::{ContextSignals, InteractionContext, InteractionContextKind, Principal};
use twin_core::error::TurnError;
use twin_core::evidence::{RetrievalScope, RetrievalStats};
use twin_core::judge::JudgeResult;
use twin_core::persona::{PersonaSpec, ProceduralModule, parse_semver};
use twin_core::routing::{RoutingAction, RoutingDecision};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::llm::LlmProvider;
use crate::stores::{StoreError, Stores, with_timeout};
use self::planner::{PlannerAction, PlannerInput, ResponsePlan};
use self::profile::{QueryClass, QueryProfile};
use self::retrieval::RetrievalOutcome;
use self::routing::RoutingRequest;
use self::scrub::ScrubLevel;
use self::telemetry::TurnTelemetry;

#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub query: String,
    pub conversation_id: Option<Uuid>,
    pub signals: ContextSignals,
    /// Caller-pinned context; keys satisfy workflow required inputs
    pub pinned_context: BTreeMap<String, String>,
    /// Metadata filters for evidence retrieval; dropped on the relaxed retry
    pub filters: BTreeMap<String, String>,
}

/// Owner-only per-turn diagnostics. Never carries prompts.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct TurnDebugSnapshot {
    pub query_class: String,
    pub requires_evidence: bool,
    pub quote_intent: bool,
    pub answerability_state: Option<AnswerabilityState>,
    pub planner_action: PlannerAction,
    pub retrieval_stats: RetrievalStats,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TurnResponse {
    pub turn_id: Uuid,
    pub conversation_id: Uuid,
    pub context: InteractionContextKind,
    pub text: String,
    pub planner_action: PlannerAction,
    pub citations: Vec<String>,
    pub teaching_questions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionPlan>,
    /// Present for owner contexts only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<JudgeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<TurnDebugSnapshot>,
}

/// Used when the twin has no active persona spec; answers stay evidence-only.
fn fallback_spec() -> PersonaSpec {
    PersonaSpec {
        version: "0.0.0".to_string(),
        approved: false,
        display_name: "the owner".to_string(),
        identity_summary: String::new(),
        constitution: vec!["Only say what the notes support.".to_string()],
        decision_policy: Vec::new(),
        voice_identity: Vec::new(),
        modules: Vec::new(),
        few_shots: Vec::new(),
        ban: Vec::new(),
    }
}

const fn scrub_level(kind: InteractionContextKind) -> ScrubLevel {
    if kind.is_owner() {
        ScrubLevel::Owner
    } else {
        ScrubLevel::Public
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModuleWriteError {
    #[error(transparent)]
    Turn(#[from] TurnError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Persisted {
    turn_id: Uuid,
    twin_id: Uuid,
    decision: RoutingDecision,
    judge: Option<JudgeResult>,
}

pub struct TurnEngine {
    config: PipelineConfig,
    stores: Stores,
    llm: Arc<dyn LlmProvider>,
    telemetry: Arc<TurnTelemetry>,
}

impl TurnEngine {
    pub fn new(config: PipelineConfig, stores: Stores, llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            config,
            stores,
            llm,
            telemetry: Arc::new(TurnTelemetry::default()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn telemetry(&self) -> &TurnTelemetry {
        &self.telemetry
    }

    pub async fn resolve(
        &self,
        signals: &ContextSignals,
        principal: &Principal,
        twin_id: Uuid,
    ) -> Result<InteractionContext, TurnError> {
        context::resolve_context(
            self.stores.sessions.as_ref(),
            self.config.store_timeout,
            signals,
            principal,
            twin_id,
            Utc::now(),
        )
        .await
    }

    /// Run one turn. Only an authorization failure escapes as an error; every
    /// other failure degrades to a clarification or disclosed uncertainty.
    pub async fn run_turn(
        &self,
        twin_id: Uuid,
        request: TurnRequest,
        principal: &Principal,
    ) -> Result<TurnResponse, TurnError> {
        self.telemetry.record_turn();
        let context = match self.resolve(&request.signals, principal, twin_id).await {
            Ok(context) => context,
            Err(err) => {
                self.telemetry.record_refusal();
                tracing::info!(twin_id = %twin_id, kind = err.kind(), error = %err, "turn refused");
                return Err(err);
            }
        };
        let turn_id = Uuid::now_v7();
        let conversation_id = request.conversation_id.unwrap_or_else(Uuid::now_v7);
        let profile = profile::profile_query(&request.query);

        if let Some(intent) = profile.action_intent.as_ref() {
            let outcome = actions::propose(
                &self.stores,
                &self.config,
                &context,
                principal,
                twin_id,
                intent,
                Utc::now(),
            )
            .await;
            return Ok(self.finish_action_turn(
                turn_id,
                conversation_id,
                twin_id,
                &context,
                &profile,
                outcome,
            ));
        }

        let spec = self.load_spec(twin_id).await;
        let fast_path = matches!(profile.query_class, QueryClass::Identity | QueryClass::Smalltalk);

        let (retrieval, verdict) = if fast_path {
            (RetrievalOutcome::skipped(), None)
        } else {
            let scope = RetrievalScope {
                twin_id,
                tenant_id: principal.tenant_id,
                public_only: context.kind.is_public(),
                filters: request.filters.clone(),
            };
            let outcome = retrieval::retrieve(
                &self.stores,
                &self.config,
                twin_id,
                &profile.normalized,
                &scope,
                profile.quote_intent,
            )
            .await;
            if !outcome.stats.timed_out_legs.is_empty() {
                let err = TurnError::EvidenceUnavailable(outcome.stats.timed_out_legs.join(","));
                tracing::warn!(kind = err.kind(), error = %err, "retrieval degraded");
            }
            let verdict =
                answerability::evaluate(self.llm.as_ref(), &self.config, &profile, &outcome).await;
            if verdict.source == VerdictSource::Fallback {
                self.telemetry.record_judge_fallback();
            }
            (outcome, Some(verdict))
        };

        let mut decision = self.route(&request, &profile, &context, &retrieval, verdict.as_ref());
        let runtime_modules = self
            .load_runtime_modules(twin_id, profile.intent_label.as_str())
            .await;
        let persona_plan = compiler::compile(
            &spec,
            profile.intent_label,
            &runtime_modules,
            profile.structure_requested,
        );

        let recent_questions = if decision.action == RoutingAction::Clarify {
            self.recent_questions(conversation_id).await
        } else {
            Vec::new()
        };
        let plan = match profile.query_class {
            QueryClass::Identity => planner::plan_identity(if spec.approved {
                spec.identity_summary.as_str()
            } else {
                ""
            }),
            QueryClass::Smalltalk => planner::plan_smalltalk(),
            _ => planner::plan(&PlannerInput {
                decision: &decision,
                verdict: verdict.as_ref(),
                profile: &profile,
                evidence: &retrieval.rows,
                structured_rendering: persona_plan.structured_rendering,
                recent_questions: &recent_questions,
                display_name: &spec.display_name,
            }),
        };
        planner::align_decision(&mut decision, &plan);

        let realized = realizer::realize(
            self.llm.as_ref(),
            &self.config,
            &plan,
            &persona_plan,
            &spec.display_name,
            &profile.normalized,
        )
        .await;
        if realized.fell_back {
            self.telemetry.record_realizer_fallback();
        }

        let level = scrub_level(context.kind);
        let tokens = machine_tokens_for(&decision, &plan);
        let (text, judge) = if realized.used_llm && !realized.fell_back {
            let reviewed = auditor::review(
                self.llm.as_ref(),
                &self.config,
                auditor::AuditInput {
                    draft: &realized.text,
                    plan: &persona_plan,
                    citation_count: plan.citations.len(),
                    machine_tokens: &tokens,
                    level,
                },
            )
            .await;
            if reviewed.judge.rewrite_applied {
                self.telemetry.record_rewrite();
            }
            (reviewed.text, Some(reviewed.judge))
        } else {
            (realized.text, None)
        };
        let text = scrub::scrub(&text, &tokens, level).text;

        if !plan.teaching_questions.is_empty() {
            self.record_questions(conversation_id, turn_id, &plan.teaching_questions)
                .await;
        }
        self.telemetry.record_route(decision.action);
        self.persist(Persisted {
            turn_id,
            twin_id,
            decision: decision.clone(),
            judge: judge.clone(),
        });

        let snapshot = TurnDebugSnapshot {
            query_class: profile.query_class.as_str().to_string(),
            requires_evidence: profile.requires_evidence,
            quote_intent: profile.quote_intent,
            answerability_state: verdict.as_ref().map(|v| v.state),
            planner_action: plan.action,
            retrieval_stats: retrieval.stats,
        };
        tracing::info!(
            turn_id = %turn_id,
            twin_id = %twin_id,
            context = context.kind.as_str(),
            query_class = %snapshot.query_class,
            requires_evidence = snapshot.requires_evidence,
            answerability = snapshot.answerability_state.map(|s| s.as_str()).unwrap_or("skipped"),
            planner_action = plan.action.as_str(),
            retrieval_path = snapshot.retrieval_stats.path.as_str(),
            "turn completed"
        );

        let owner_view = context.kind.is_owner();
        Ok(TurnResponse {
            turn_id,
            conversation_id,
            context: context.kind,
            text,
            planner_action: plan.action,
            citations: plan.citations,
            teaching_questions: plan.teaching_questions,
            action: None,
            routing: owner_view.then_some(decision),
            audit: if owner_view { judge } else { None },
            debug: owner_view.then_some(snapshot),
        })
    }

    /// Owner approval of a pending action draft; executes it inline.
    pub async fn approve_action(
        &self,
        principal: &Principal,
        twin_id: Uuid,
        action_id: Uuid,
    ) -> Result<ActionPlan, actions::ApprovalError> {
        let plan = actions::approve(
            &self.stores,
            &self.config,
            principal,
            twin_id,
            action_id,
            Utc::now(),
        )
        .await?;
        self.telemetry.record_action(plan.status);
        Ok(plan)
    }

    /// Training write: only an OWNER_TRAINING context may teach the twin new
    /// procedural modules.
    pub async fn upsert_runtime_module(
        &self,
        signals: &ContextSignals,
        principal: &Principal,
        twin_id: Uuid,
        module: &ProceduralModule,
    ) -> Result<InteractionContext, ModuleWriteError> {
        let context = self.resolve(signals, principal, twin_id).await?;
        context::ensure_training_write_allowed(&context)?;
        with_timeout(
            self.config.store_timeout,
            "persona spec store",
            self.stores.persona.upsert_runtime_module(twin_id, module),
        )
        .await?;
        tracing::info!(
            twin_id = %twin_id,
            module_id = %module.id,
            intent_labels = ?module.intent_labels,
            "runtime module upserted"
        );
        Ok(context)
    }

    fn route(
        &self,
        request: &TurnRequest,
        profile: &QueryProfile,
        context: &InteractionContext,
        retrieval: &RetrievalOutcome,
        verdict: Option<&AnswerabilityVerdict>,
    ) -> RoutingDecision {
        let decision = routing::build_routing_decision(
            &self.config,
            &RoutingRequest {
                query: &profile.normalized,
                intent_label: profile.intent_label,
                context: context.kind,
                target_owner_scope: profile.target_owner_scope,
                requires_evidence: profile.requires_evidence,
                knowledge_available: !retrieval.rows.is_empty(),
                smalltalk: profile.query_class == QueryClass::Smalltalk,
                pinned_context: &request.pinned_context,
            },
        );
        match verdict {
            Some(verdict) => routing::reconcile_with_answerability(
                decision,
                verdict,
                context.kind,
                profile.target_owner_scope,
            ),
            None => decision,
        }
    }

    fn finish_action_turn(
        &self,
        turn_id: Uuid,
        conversation_id: Uuid,
        twin_id: Uuid,
        context: &InteractionContext,
        profile: &QueryProfile,
        outcome: actions::ActionOutcome,
    ) -> TurnResponse {
        let status = outcome.plan.status;
        let missing: Vec<String> = profile
            .action_intent
            .as_ref()
            .map(|intent| {
                actions::missing_params(intent)
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let clarify = status == ActionStatus::MissingParams;
        let decision = RoutingDecision {
            intent: outcome.plan.action_type.as_str().to_string(),
            confidence: 1.0,
            required_inputs_missing: if clarify { missing } else { Vec::new() },
            chosen_workflow: profile.intent_label,
            output_schema: "action_v1".to_string(),
            action: if clarify {
                RoutingAction::Clarify
            } else {
                RoutingAction::Answer
            },
            clarifying_questions: if clarify {
                vec![outcome.message.clone()]
            } else {
                Vec::new()
            },
            reason_codes: vec!["action_lane".to_string(), format!("action_{}", status.as_str())],
        };
        self.telemetry.record_action_turn(status);
        self.telemetry.record_route(decision.action);
        self.persist(Persisted {
            turn_id,
            twin_id,
            decision: decision.clone(),
            judge: None,
        });

        let planner_action = if clarify {
            PlannerAction::Clarify
        } else {
            PlannerAction::Answer
        };
        let owner_view = context.kind.is_owner();
        let snapshot = TurnDebugSnapshot {
            query_class: profile.query_class.as_str().to_string(),
            requires_evidence: profile.requires_evidence,
            quote_intent: profile.quote_intent,
            answerability_state: None,
            planner_action,
            retrieval_stats: RetrievalStats::skipped(),
        };
        tracing::info!(
            turn_id = %turn_id,
            twin_id = %twin_id,
            context = context.kind.as_str(),
            action_type = outcome.plan.action_type.as_str(),
            action_status = status.as_str(),
            "action turn completed"
        );
        TurnResponse {
            turn_id,
            conversation_id,
            context: context.kind,
            text: outcome.message,
            planner_action,
            citations: Vec::new(),
            teaching_questions: Vec::new(),
            action: Some(outcome.plan),
            routing: owner_view.then_some(decision),
            audit: None,
            debug: owner_view.then_some(snapshot),
        }
    }

    async fn load_spec(&self, twin_id: Uuid) -> PersonaSpec {
        match with_timeout(
            self.config.store_timeout,
            "persona spec store",
            self.stores.persona.get_active_spec(twin_id),
        )
        .await
        {
            Ok(Some(spec)) if parse_semver(&spec.version).is_some() => spec,
            Ok(Some(spec)) => {
                tracing::warn!(
                    twin_id = %twin_id,
                    version = %spec.version,
                    "persona spec version is not semver; using fallback persona"
                );
                fallback_spec()
            }
            Ok(None) => {
                tracing::warn!(twin_id = %twin_id, "no active persona spec; using fallback persona");
                fallback_spec()
            }
            Err(err) => {
                tracing::warn!(twin_id = %twin_id, error = %err, "persona spec unavailable; using fallback persona");
                fallback_spec()
            }
        }
    }

    async fn load_runtime_modules(&self, twin_id: Uuid, intent_label: &str) -> Vec<ProceduralModule> {
        with_timeout(
            self.config.store_timeout,
            "persona spec store",
            self.stores.persona.list_runtime_modules(twin_id, intent_label),
        )
        .await
        .unwrap_or_else(|err| {
            tracing::warn!(twin_id = %twin_id, error = %err, "runtime modules unavailable");
            Vec::new()
        })
    }

    async fn recent_questions(&self, conversation_id: Uuid) -> Vec<String> {
        with_timeout(
            self.config.store_timeout,
            "turn history store",
            self.stores
                .history
                .recent_questions(conversation_id, self.config.question_window),
        )
        .await
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "turn history unavailable; questions may repeat");
            Vec::new()
        })
    }

    async fn record_questions(&self, conversation_id: Uuid, turn_id: Uuid, questions: &[String]) {
        if let Err(err) = with_timeout(
            self.config.store_timeout,
            "turn history store",
            self.stores
                .history
                .record_questions(conversation_id, turn_id, questions),
        )
        .await
        {
            let err = TurnError::PersistenceFailure(err.to_string());
            tracing::warn!(error = %err, "teaching questions not recorded");
        }
    }

    /// Fire-and-forget write of the turn's routing decision and judge result.
    fn persist(&self, record: Persisted) {
        let stores = self.stores.clone();
        let timeout = self.config.store_timeout;
        tokio::spawn(async move {
            if let Err(err) = with_timeout(
                timeout,
                "approval audit store",
                stores
                    .audit
                    .record_routing_decision(record.turn_id, record.twin_id, &record.decision),
            )
            .await
            {
                let err = TurnError::PersistenceFailure(err.to_string());
                tracing::warn!(turn_id = %record.turn_id, error = %err, "routing decision not persisted");
            }
            let Some(judge) = record.judge.as_ref() else {
                return;
            };
            if let Err(err) = with_timeout(
                timeout,
                "approval audit store",
                stores
                    .audit
                    .record_judge_result(record.turn_id, record.twin_id, judge),
            )
            .await
            {
                let err = TurnError::PersistenceFailure(err.to_string());
                tracing::warn!(turn_id = %record.turn_id, error = %err, "judge result not persisted");
            }
        });
    }
}

/// Identifiers that must not reach user-facing text this turn.
fn machine_tokens_for(decision: &RoutingDecision, plan: &ResponsePlan) -> HashSet<String> {
    scrub::machine_tokens(
        decision
            .reason_codes
            .iter()
            .chain(decision.required_inputs_missing.iter())
            .chain(plan.citations.iter())
            .map(String::as_str)
            .chain([decision.output_schema.as_str(), routing::REQUEST_DETAILS_FIELD]),
    )
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::stores::memory::MemoryStore;
    use crate::turn::compiler::fixtures::persona_spec;
    use twin_core::evidence::{BlockType, EvidenceRow};

    pub struct Fixture {
        pub engine: TurnEngine,
        pub memory: Arc<MemoryStore>,
        pub twin_id: Uuid,
        pub owner: Principal,
    }

    pub fn passage(source_id: &str, text: &str) -> EvidenceRow {
        EvidenceRow {
            source_id: source_id.to_string(),
            text: text.to_string(),
            score: 0.0,
            block_type: BlockType::Answer,
            section_path: "career".to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    pub async fn fixture_with(llm: Arc<dyn LlmProvider>, config: PipelineConfig) -> Fixture {
        let memory = Arc::new(MemoryStore::new());
        let twin_id = Uuid::now_v7();
        let owner_id = Uuid::now_v7();
        memory.add_twin(twin_id, owner_id, Some(persona_spec())).await;
        memory
            .add_passage(
                twin_id,
                passage(
                    "career-1",
                    "I moved to Berlin in 2019 because the music scene pulled me in.",
                ),
                true,
            )
            .await;
        memory
            .add_verified_answer(
                twin_id,
                passage(
                    "va-berlin",
                    "Why did you move to Berlin? For the music scene, back in 2019.",
                ),
                true,
            )
            .await;
        Fixture {
            engine: TurnEngine::new(config, Stores::in_memory(memory.clone()), llm),
            memory,
            twin_id,
            owner: Principal::owner(owner_id, None),
        }
    }

    pub fn request(query: &str) -> TurnRequest {
        TurnRequest {
            query: query.to_string(),
            signals: ContextSignals {
                origin_endpoint: "chat".to_string(),
                ..ContextSignals::default()
            },
            ..TurnRequest::default()
        }
    }
}

//! Collaborator seams of the turn pipeline.
//!
//! Every external dependency (evidence search, persona specs, sessions,
//! approvals, history, connectors) is an async trait so the pipeline can run
//! against Postgres, HTTP services or the in-memory tables used by tests and
//! `TWIN_STORE_BACKEND=memory`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use twin_core::actions::{ActionDraft, ActionStatus};
use twin_core::context::{Principal, ShareLink, TrainingSession};
use twin_core::evidence::{EvidenceRow, EvidenceSearch};
use twin_core::judge::JudgeResult;
use twin_core::persona::{PersonaSpec, ProceduralModule};
use twin_core::routing::RoutingDecision;
use uuid::Uuid;

pub mod http;
pub mod memory;
pub mod postgres;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("could not decode upstream payload: {0}")]
    Decode(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// Run a collaborator call under an explicit deadline.
pub async fn with_timeout<T, F>(
    duration: Duration,
    label: &'static str,
    fut: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(label)),
    }
}

#[async_trait]
pub trait EvidenceStore: Send + Sync {
    async fn search(&self, request: &EvidenceSearch) -> Result<Vec<EvidenceRow>, StoreError>;
}

/// Owner-curated memories ("what I'd say about X"), ranked by match score.
#[async_trait]
pub trait OwnerMemoryStore: Send + Sync {
    async fn lookup(&self, twin_id: Uuid, query: &str) -> Result<Vec<EvidenceRow>, StoreError>;
}

/// Answers the owner explicitly verified during training.
#[async_trait]
pub trait VerifiedAnswerStore: Send + Sync {
    async fn lookup(
        &self,
        twin_id: Uuid,
        query: &str,
        public_only: bool,
    ) -> Result<Vec<EvidenceRow>, StoreError>;
}

#[async_trait]
pub trait PersonaSpecStore: Send + Sync {
    async fn get_active_spec(&self, twin_id: Uuid) -> Result<Option<PersonaSpec>, StoreError>;

    /// Active runtime-learned modules for an intent, including unscoped ones.
    async fn list_runtime_modules(
        &self,
        twin_id: Uuid,
        intent_label: &str,
    ) -> Result<Vec<ProceduralModule>, StoreError>;

    /// Idempotent by module id; last writer wins.
    async fn upsert_runtime_module(
        &self,
        twin_id: Uuid,
        module: &ProceduralModule,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn principal_for_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Principal>, StoreError>;
    async fn twin_owner(&self, twin_id: Uuid) -> Result<Option<Uuid>, StoreError>;
    async fn get_training_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<TrainingSession>, StoreError>;
    async fn active_training_session(
        &self,
        twin_id: Uuid,
        owner_id: Uuid,
    ) -> Result<Option<TrainingSession>, StoreError>;
    async fn mark_training_session_expired(&self, session_id: Uuid) -> Result<(), StoreError>;
    async fn find_share_link(&self, token_hash: &str) -> Result<Option<ShareLink>, StoreError>;
}

#[async_trait]
pub trait ApprovalAuditStore: Send + Sync {
    async fn upsert_action_draft(&self, draft: &ActionDraft) -> Result<(), StoreError>;
    async fn get_action_draft(&self, action_id: Uuid) -> Result<Option<ActionDraft>, StoreError>;
    /// Store `draft` only while the stored status is still `from`. Returns
    /// false when another writer moved the draft first.
    async fn transition_action_draft(
        &self,
        draft: &ActionDraft,
        from: ActionStatus,
    ) -> Result<bool, StoreError>;
    async fn record_routing_decision(
        &self,
        turn_id: Uuid,
        twin_id: Uuid,
        decision: &RoutingDecision,
    ) -> Result<(), StoreError>;
    async fn record_judge_result(
        &self,
        turn_id: Uuid,
        twin_id: Uuid,
        result: &JudgeResult,
    ) -> Result<(), StoreError>;
    async fn append_event(&self, kind: &str, payload: serde_json::Value)
    -> Result<(), StoreError>;
}

#[async_trait]
pub trait TurnHistoryStore: Send + Sync {
    /// Teaching questions asked in the last `window` turns of a conversation.
    async fn recent_questions(
        &self,
        conversation_id: Uuid,
        window: usize,
    ) -> Result<Vec<String>, StoreError>;
    async fn record_questions(
        &self,
        conversation_id: Uuid,
        turn_id: Uuid,
        questions: &[String],
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Continue,
}

/// Executes approved actions one bounded step at a time.
#[async_trait]
pub trait ActionConnector: Send + Sync {
    async fn execute_step(&self, draft: &ActionDraft, step: u32)
    -> Result<StepOutcome, StoreError>;
}

#[derive(Clone)]
pub struct Stores {
    pub evidence: Arc<dyn EvidenceStore>,
    pub owner_memory: Arc<dyn OwnerMemoryStore>,
    pub verified_answers: Arc<dyn VerifiedAnswerStore>,
    pub persona: Arc<dyn PersonaSpecStore>,
    pub sessions: Arc<dyn SessionDirectory>,
    pub audit: Arc<dyn ApprovalAuditStore>,
    pub history: Arc<dyn TurnHistoryStore>,
    pub connector: Arc<dyn ActionConnector>,
}

impl Stores {
    /// Every seam backed by the same in-memory tables.
    pub fn in_memory(store: Arc<memory::MemoryStore>) -> Self {
        Self {
            evidence: store.clone(),
            owner_memory: store.clone(),
            verified_answers: store.clone(),
            persona: store.clone(),
            sessions: store.clone(),
            audit: store.clone(),
            history: store.clone(),
            connector: store,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_timeout_maps_elapsed_deadline() {
        let result: Result<(), StoreError> = with_timeout(
            Duration::from_millis(5),
            "persona spec store",
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(result, Err(StoreError::Timeout("persona spec store"))));
    }
}

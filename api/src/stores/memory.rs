//! In-memory keyed tables behind every store seam.
//!
//! Used by the test suite and by `TWIN_STORE_BACKEND=memory`, optionally seeded
//! from a JSON fixture (`TWIN_MEMORY_FIXTURE`). Dense search uses a hashed
//! bag-of-words embedding so results are deterministic without a model.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use twin_core::actions::{ActionDraft, ActionStatus};
use twin_core::auth::hash_token;
use twin_core::context::{Principal, Role, ShareLink, TrainingSession, TrainingSessionStatus};
use twin_core::evidence::{EvidenceRow, EvidenceSearch, SearchMode};
use twin_core::judge::JudgeResult;
use twin_core::persona::{PersonaSpec, ProceduralModule};
use twin_core::routing::RoutingDecision;
use uuid::Uuid;

use super::{
    ActionConnector, ApprovalAuditStore, EvidenceStore, OwnerMemoryStore, PersonaSpecStore,
    SessionDirectory, StepOutcome, StoreError, TurnHistoryStore, VerifiedAnswerStore,
};

const EMBEDDING_DIMENSIONS: usize = 256;

#[derive(Debug, Clone)]
struct StoredPassage {
    row: EvidenceRow,
    public: bool,
}

#[derive(Default)]
struct Tables {
    principals: HashMap<String, Principal>,
    twin_owners: HashMap<Uuid, Uuid>,
    training_sessions: HashMap<Uuid, TrainingSession>,
    share_links: HashMap<String, ShareLink>,
    passages: HashMap<Uuid, Vec<StoredPassage>>,
    owner_memories: HashMap<Uuid, Vec<EvidenceRow>>,
    verified_answers: HashMap<Uuid, Vec<StoredPassage>>,
    specs: HashMap<Uuid, PersonaSpec>,
    runtime_modules: HashMap<Uuid, BTreeMap<String, ProceduralModule>>,
    drafts: HashMap<Uuid, ActionDraft>,
    routing_decisions: Vec<(Uuid, Uuid, RoutingDecision)>,
    judge_results: Vec<(Uuid, Uuid, JudgeResult)>,
    events: Vec<(String, serde_json::Value)>,
    questions: HashMap<Uuid, Vec<(Uuid, Vec<String>)>>,
    executed_steps: Vec<(Uuid, u32)>,
}

/// Connector behavior knobs for exercising bounded execution.
#[derive(Debug, Clone, Copy)]
pub struct ConnectorBehavior {
    pub steps_to_finish: u32,
    pub step_delay: Duration,
}

impl Default for ConnectorBehavior {
    fn default() -> Self {
        Self {
            steps_to_finish: 1,
            step_delay: Duration::ZERO,
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    connector: RwLock<ConnectorBehavior>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_principal(&self, token: &str, principal: Principal) {
        self.tables
            .write()
            .await
            .principals
            .insert(hash_token(token), principal);
    }

    pub async fn add_twin(&self, twin_id: Uuid, owner_id: Uuid, spec: Option<PersonaSpec>) {
        let mut tables = self.tables.write().await;
        tables.twin_owners.insert(twin_id, owner_id);
        if let Some(spec) = spec {
            tables.specs.insert(twin_id, spec);
        }
    }

    pub async fn add_training_session(&self, session: TrainingSession) {
        self.tables
            .write()
            .await
            .training_sessions
            .insert(session.id, session);
    }

    pub async fn add_share_link(&self, token: &str, link: ShareLink) {
        self.tables
            .write()
            .await
            .share_links
            .insert(hash_token(token), link);
    }

    pub async fn add_passage(&self, twin_id: Uuid, row: EvidenceRow, public: bool) {
        self.tables
            .write()
            .await
            .passages
            .entry(twin_id)
            .or_default()
            .push(StoredPassage { row, public });
    }

    pub async fn add_owner_memory(&self, twin_id: Uuid, row: EvidenceRow) {
        self.tables
            .write()
            .await
            .owner_memories
            .entry(twin_id)
            .or_default()
            .push(row);
    }

    pub async fn add_verified_answer(&self, twin_id: Uuid, row: EvidenceRow, public: bool) {
        self.tables
            .write()
            .await
            .verified_answers
            .entry(twin_id)
            .or_default()
            .push(StoredPassage { row, public });
    }

    pub async fn set_connector_behavior(&self, behavior: ConnectorBehavior) {
        *self.connector.write().await = behavior;
    }

    pub async fn training_session(&self, session_id: Uuid) -> Option<TrainingSession> {
        self.tables
            .read()
            .await
            .training_sessions
            .get(&session_id)
            .cloned()
    }

    pub async fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.tables.read().await.events.clone()
    }

    pub async fn routing_decisions(&self) -> Vec<RoutingDecision> {
        self.tables
            .read()
            .await
            .routing_decisions
            .iter()
            .map(|(_, _, decision)| decision.clone())
            .collect()
    }

    pub async fn judge_results(&self) -> Vec<JudgeResult> {
        self.tables
            .read()
            .await
            .judge_results
            .iter()
            .map(|(_, _, result)| result.clone())
            .collect()
    }

    pub async fn executed_steps(&self) -> Vec<(Uuid, u32)> {
        self.tables.read().await.executed_steps.clone()
    }

    /// Seed tables from a JSON fixture file.
    pub async fn load_fixture(&self, path: &str) -> Result<(), StoreError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StoreError::Upstream(format!("reading fixture {path}: {e}")))?;
        let fixture: MemoryFixture =
            serde_json::from_str(&raw).map_err(|e| StoreError::Decode(e.to_string()))?;
        self.apply_fixture(fixture).await;
        Ok(())
    }

    async fn apply_fixture(&self, fixture: MemoryFixture) {
        for key in fixture.keys {
            let principal = Principal {
                user_id: Some(key.user_id),
                tenant_id: key.tenant_id,
                role: key.role,
            };
            self.add_principal(&key.token, principal).await;
        }
        for twin in fixture.twins {
            self.add_twin(twin.id, twin.owner_id, twin.persona).await;
            for passage in twin.passages {
                self.add_passage(twin.id, passage.row, passage.public).await;
            }
            for memory in twin.owner_memories {
                self.add_owner_memory(twin.id, memory).await;
            }
            for answer in twin.verified_answers {
                self.add_verified_answer(twin.id, answer.row, answer.public)
                    .await;
            }
            for share in twin.share_links {
                let link = ShareLink {
                    id: Uuid::now_v7(),
                    twin_id: twin.id,
                    token_hash: hash_token(&share.token),
                    revoked: false,
                    expires_at: share.expires_at,
                };
                self.add_share_link(&share.token, link).await;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct MemoryFixture {
    #[serde(default)]
    keys: Vec<FixtureKey>,
    #[serde(default)]
    twins: Vec<FixtureTwin>,
}

#[derive(Debug, Deserialize)]
struct FixtureKey {
    token: String,
    user_id: Uuid,
    #[serde(default)]
    tenant_id: Option<Uuid>,
    role: Role,
}

#[derive(Debug, Deserialize)]
struct FixtureTwin {
    id: Uuid,
    owner_id: Uuid,
    #[serde(default)]
    persona: Option<PersonaSpec>,
    #[serde(default)]
    passages: Vec<FixturePassage>,
    #[serde(default)]
    owner_memories: Vec<EvidenceRow>,
    #[serde(default)]
    verified_answers: Vec<FixturePassage>,
    #[serde(default)]
    share_links: Vec<FixtureShare>,
}

#[derive(Debug, Deserialize)]
struct FixturePassage {
    #[serde(flatten)]
    row: EvidenceRow,
    #[serde(default)]
    public: bool,
}

#[derive(Debug, Deserialize)]
struct FixtureShare {
    token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

fn tokenize_ascii(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            current.push(ch.to_ascii_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

fn hashing_embedding(text: &str) -> Vec<f64> {
    let mut vec = vec![0.0_f64; EMBEDDING_DIMENSIONS];
    let mut counts: HashMap<String, u32> = HashMap::new();
    for token in tokenize_ascii(text) {
        *counts.entry(token).or_insert(0) += 1;
    }
    for (token, count) in counts {
        let digest = Sha256::digest(token.as_bytes());
        let bucket = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
            % EMBEDDING_DIMENSIONS;
        vec[bucket] += f64::from(count);
    }
    let norm = vec.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        for value in &mut vec {
            *value /= norm;
        }
    }
    vec
}

fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    // Inputs are unit-normalized.
    a.iter().zip(b).map(|(x, y)| x * y).sum::<f64>().clamp(0.0, 1.0)
}

fn dense_score(query: &str, text: &str) -> f64 {
    cosine_similarity(&hashing_embedding(query), &hashing_embedding(text))
}

/// Share of distinct query tokens present in the text.
fn lexical_score(query: &str, text: &str) -> f64 {
    let query_tokens: HashSet<String> = tokenize_ascii(query)
        .into_iter()
        .filter(|token| token.len() > 2)
        .collect();
    if query_tokens.is_empty() {
        return 0.0;
    }
    let text_tokens: HashSet<String> = tokenize_ascii(text).into_iter().collect();
    let hits = query_tokens
        .iter()
        .filter(|token| text_tokens.contains(*token))
        .count();
    hits as f64 / query_tokens.len() as f64
}

fn matches_filters(row: &EvidenceRow, filters: &BTreeMap<String, String>) -> bool {
    filters.iter().all(|(key, expected)| {
        row.metadata
            .get(key)
            .and_then(|value| value.as_str())
            .is_some_and(|value| value.eq_ignore_ascii_case(expected))
    })
}

fn rank(mut rows: Vec<EvidenceRow>, top_k: usize) -> Vec<EvidenceRow> {
    rows.retain(|row| row.score > 0.0);
    rows.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
    rows.truncate(top_k);
    rows
}

#[async_trait]
impl EvidenceStore for MemoryStore {
    async fn search(&self, request: &EvidenceSearch) -> Result<Vec<EvidenceRow>, StoreError> {
        let tables = self.tables.read().await;
        let Some(passages) = tables.passages.get(&request.scope.twin_id) else {
            return Ok(Vec::new());
        };
        let rows = passages
            .iter()
            .filter(|passage| passage.public || !request.scope.public_only)
            .filter(|passage| matches_filters(&passage.row, &request.scope.filters))
            .map(|passage| {
                let score = match request.mode {
                    SearchMode::Dense => dense_score(&request.query, &passage.row.text),
                    SearchMode::Lexical => lexical_score(&request.query, &passage.row.text),
                };
                EvidenceRow {
                    score,
                    ..passage.row.clone()
                }
            })
            .collect();
        Ok(rank(rows, request.top_k))
    }
}

#[async_trait]
impl OwnerMemoryStore for MemoryStore {
    async fn lookup(&self, twin_id: Uuid, query: &str) -> Result<Vec<EvidenceRow>, StoreError> {
        let tables = self.tables.read().await;
        let rows = tables
            .owner_memories
            .get(&twin_id)
            .map(|memories| {
                memories
                    .iter()
                    .map(|row| EvidenceRow {
                        score: dense_score(query, &row.text).max(lexical_score(query, &row.text)),
                        ..row.clone()
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(rank(rows, 3))
    }
}

#[async_trait]
impl VerifiedAnswerStore for MemoryStore {
    async fn lookup(
        &self,
        twin_id: Uuid,
        query: &str,
        public_only: bool,
    ) -> Result<Vec<EvidenceRow>, StoreError> {
        let tables = self.tables.read().await;
        let rows = tables
            .verified_answers
            .get(&twin_id)
            .map(|answers| {
                answers
                    .iter()
                    .filter(|answer| answer.public || !public_only)
                    .map(|answer| EvidenceRow {
                        score: dense_score(query, &answer.row.text)
                            .max(lexical_score(query, &answer.row.text)),
                        ..answer.row.clone()
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(rank(rows, 3))
    }
}

#[async_trait]
impl PersonaSpecStore for MemoryStore {
    async fn get_active_spec(&self, twin_id: Uuid) -> Result<Option<PersonaSpec>, StoreError> {
        Ok(self.tables.read().await.specs.get(&twin_id).cloned())
    }

    async fn list_runtime_modules(
        &self,
        twin_id: Uuid,
        intent_label: &str,
    ) -> Result<Vec<ProceduralModule>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .runtime_modules
            .get(&twin_id)
            .map(|modules| {
                modules
                    .values()
                    .filter(|module| module.active && module.applies_to(intent_label))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert_runtime_module(
        &self,
        twin_id: Uuid,
        module: &ProceduralModule,
    ) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .runtime_modules
            .entry(twin_id)
            .or_default()
            .insert(module.id.clone(), module.clone());
        Ok(())
    }
}

#[async_trait]
impl SessionDirectory for MemoryStore {
    async fn principal_for_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Principal>, StoreError> {
        Ok(self.tables.read().await.principals.get(token_hash).cloned())
    }

    async fn twin_owner(&self, twin_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        Ok(self.tables.read().await.twin_owners.get(&twin_id).copied())
    }

    async fn get_training_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<TrainingSession>, StoreError> {
        Ok(self.training_session(session_id).await)
    }

    async fn active_training_session(
        &self,
        twin_id: Uuid,
        owner_id: Uuid,
    ) -> Result<Option<TrainingSession>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .training_sessions
            .values()
            .filter(|session| {
                session.twin_id == twin_id
                    && session.owner_id == owner_id
                    && session.status == TrainingSessionStatus::Active
            })
            .max_by_key(|session| session.expires_at)
            .cloned())
    }

    async fn mark_training_session_expired(&self, session_id: Uuid) -> Result<(), StoreError> {
        if let Some(session) = self
            .tables
            .write()
            .await
            .training_sessions
            .get_mut(&session_id)
        {
            session.status = TrainingSessionStatus::Expired;
        }
        Ok(())
    }

    async fn find_share_link(&self, token_hash: &str) -> Result<Option<ShareLink>, StoreError> {
        Ok(self.tables.read().await.share_links.get(token_hash).cloned())
    }
}

#[async_trait]
impl ApprovalAuditStore for MemoryStore {
    async fn upsert_action_draft(&self, draft: &ActionDraft) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .drafts
            .insert(draft.id, draft.clone());
        Ok(())
    }

    async fn get_action_draft(&self, action_id: Uuid) -> Result<Option<ActionDraft>, StoreError> {
        Ok(self.tables.read().await.drafts.get(&action_id).cloned())
    }

    async fn transition_action_draft(
        &self,
        draft: &ActionDraft,
        from: ActionStatus,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.drafts.get(&draft.id) {
            Some(current) if current.status == from => {
                tables.drafts.insert(draft.id, draft.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_routing_decision(
        &self,
        turn_id: Uuid,
        twin_id: Uuid,
        decision: &RoutingDecision,
    ) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .routing_decisions
            .push((turn_id, twin_id, decision.clone()));
        Ok(())
    }

    async fn record_judge_result(
        &self,
        turn_id: Uuid,
        twin_id: Uuid,
        result: &JudgeResult,
    ) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .judge_results
            .push((turn_id, twin_id, result.clone()));
        Ok(())
    }

    async fn append_event(
        &self,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .events
            .push((kind.to_string(), payload));
        Ok(())
    }
}

#[async_trait]
impl TurnHistoryStore for MemoryStore {
    async fn recent_questions(
        &self,
        conversation_id: Uuid,
        window: usize,
    ) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .questions
            .get(&conversation_id)
            .map(|turns| {
                turns
                    .iter()
                    .rev()
                    .take(window)
                    .flat_map(|(_, questions)| questions.iter().cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn record_questions(
        &self,
        conversation_id: Uuid,
        turn_id: Uuid,
        questions: &[String],
    ) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .questions
            .entry(conversation_id)
            .or_default()
            .push((turn_id, questions.to_vec()));
        Ok(())
    }
}

#[async_trait]
impl ActionConnector for MemoryStore {
    async fn execute_step(
        &self,
        draft: &ActionDraft,
        step: u32,
    ) -> Result<StepOutcome, StoreError> {
        let behavior = *self.connector.read().await;
        if !behavior.step_delay.is_zero() {
            tokio::time::sleep(behavior.step_delay).await;
        }
        self.tables
            .write()
            .await
            .executed_steps
            .push((draft.id, step));
        if step >= behavior.steps_to_finish {
            Ok(StepOutcome::Done)
        } else {
            Ok(StepOutcome::Continue)
        }
    }
}

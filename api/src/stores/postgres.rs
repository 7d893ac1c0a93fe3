//! Postgres adapters. Queries are runtime-checked; the schema is owned by the
//! platform that provisions twins, keys and sessions.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use twin_core::actions::{ActionDraft, ActionStatus};
use twin_core::context::{Principal, Role, ShareLink, TrainingSession, TrainingSessionStatus};
use twin_core::evidence::{BlockType, EvidenceRow, EvidenceSearch, SearchMode};
use twin_core::judge::JudgeResult;
use twin_core::persona::{PersonaSpec, ProceduralModule};
use twin_core::routing::RoutingDecision;
use uuid::Uuid;

use super::{
    ApprovalAuditStore, EvidenceStore, OwnerMemoryStore, PersonaSpecStore, SessionDirectory,
    StoreError, TurnHistoryStore, VerifiedAnswerStore,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ping(&self) -> bool {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
    what: &str,
) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Decode(format!("{what}: {e}")))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Decode(e.to_string()))
}

fn parse_role(value: &str) -> Role {
    match value.trim().to_lowercase().as_str() {
        "owner" => Role::Owner,
        "visitor" => Role::Visitor,
        _ => Role::Anonymous,
    }
}

fn parse_block_type(value: &str) -> BlockType {
    match value.trim().to_lowercase().as_str() {
        "answer" => BlockType::Answer,
        "prompt" => BlockType::Prompt,
        "question" => BlockType::Question,
        "owner_memory" => BlockType::OwnerMemory,
        "verified_answer" => BlockType::VerifiedAnswer,
        _ => BlockType::Passage,
    }
}

#[derive(sqlx::FromRow)]
struct PrincipalRow {
    user_id: Uuid,
    tenant_id: Option<Uuid>,
    role: String,
}

#[derive(sqlx::FromRow)]
struct TrainingSessionRow {
    id: Uuid,
    twin_id: Uuid,
    owner_id: Uuid,
    status: String,
    expires_at: DateTime<Utc>,
}

impl TrainingSessionRow {
    fn into_session(self) -> Result<TrainingSession, StoreError> {
        let status = TrainingSessionStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Decode(format!("unknown training session status '{}'", self.status))
        })?;
        Ok(TrainingSession {
            id: self.id,
            twin_id: self.twin_id,
            owner_id: self.owner_id,
            status,
            expires_at: self.expires_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ShareLinkRow {
    id: Uuid,
    twin_id: Uuid,
    token_hash: String,
    revoked: bool,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct PassageRow {
    source_id: String,
    text: String,
    score: f64,
    block_type: String,
    section_path: String,
    metadata: serde_json::Value,
}

impl From<PassageRow> for EvidenceRow {
    fn from(row: PassageRow) -> Self {
        EvidenceRow {
            source_id: row.source_id,
            text: row.text,
            score: row.score.clamp(0.0, 1.0),
            block_type: parse_block_type(&row.block_type),
            section_path: row.section_path,
            metadata: row.metadata,
        }
    }
}

fn filters_json(filters: &BTreeMap<String, String>) -> serde_json::Value {
    serde_json::Value::Object(
        filters
            .iter()
            .map(|(key, value)| (key.clone(), serde_json::Value::String(value.clone())))
            .collect(),
    )
}

#[async_trait]
impl EvidenceStore for PgStore {
    async fn search(&self, request: &EvidenceSearch) -> Result<Vec<EvidenceRow>, StoreError> {
        // Dense similarity is approximated with trigram similarity; real
        // vector search lives behind the HTTP evidence adapter.
        let sql = match request.mode {
            SearchMode::Dense => {
                "SELECT source_id, text, similarity(text, $2)::float8 AS score, \
                        block_type, section_path, metadata \
                 FROM evidence_passages \
                 WHERE twin_id = $1 AND (is_public OR NOT $3) AND metadata @> $4 \
                 ORDER BY score DESC, source_id ASC LIMIT $5"
            }
            SearchMode::Lexical => {
                "SELECT source_id, text, \
                        LEAST(ts_rank_cd(search, plainto_tsquery('simple', $2)), 1.0)::float8 AS score, \
                        block_type, section_path, metadata \
                 FROM evidence_passages \
                 WHERE twin_id = $1 AND (is_public OR NOT $3) AND metadata @> $4 \
                   AND search @@ plainto_tsquery('simple', $2) \
                 ORDER BY score DESC, source_id ASC LIMIT $5"
            }
        };
        let rows = sqlx::query_as::<_, PassageRow>(sql)
            .bind(request.scope.twin_id)
            .bind(&request.query)
            .bind(request.scope.public_only)
            .bind(filters_json(&request.scope.filters))
            .bind(request.top_k as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EvidenceRow::from).collect())
    }
}

#[async_trait]
impl OwnerMemoryStore for PgStore {
    async fn lookup(&self, twin_id: Uuid, query: &str) -> Result<Vec<EvidenceRow>, StoreError> {
        let rows = sqlx::query_as::<_, PassageRow>(
            "SELECT source_id, text, similarity(text, $2)::float8 AS score, \
                    'owner_memory' AS block_type, '' AS section_path, '{}'::jsonb AS metadata \
             FROM owner_memories \
             WHERE twin_id = $1 \
             ORDER BY score DESC, source_id ASC LIMIT 3",
        )
        .bind(twin_id)
        .bind(query)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EvidenceRow::from).collect())
    }
}

#[async_trait]
impl VerifiedAnswerStore for PgStore {
    async fn lookup(
        &self,
        twin_id: Uuid,
        query: &str,
        public_only: bool,
    ) -> Result<Vec<EvidenceRow>, StoreError> {
        let rows = sqlx::query_as::<_, PassageRow>(
            "SELECT source_id, answer AS text, similarity(question, $2)::float8 AS score, \
                    'verified_answer' AS block_type, '' AS section_path, '{}'::jsonb AS metadata \
             FROM verified_answers \
             WHERE twin_id = $1 AND (is_public OR NOT $3) \
             ORDER BY score DESC, source_id ASC LIMIT 3",
        )
        .bind(twin_id)
        .bind(query)
        .bind(public_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EvidenceRow::from).collect())
    }
}

#[async_trait]
impl PersonaSpecStore for PgStore {
    async fn get_active_spec(&self, twin_id: Uuid) -> Result<Option<PersonaSpec>, StoreError> {
        let spec: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT spec FROM persona_specs \
             WHERE twin_id = $1 AND is_active = TRUE \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(twin_id)
        .fetch_optional(&self.pool)
        .await?;
        spec.map(|value| decode(value, "persona spec")).transpose()
    }

    async fn list_runtime_modules(
        &self,
        twin_id: Uuid,
        intent_label: &str,
    ) -> Result<Vec<ProceduralModule>, StoreError> {
        let rows: Vec<serde_json::Value> = sqlx::query_scalar(
            "SELECT module FROM runtime_modules \
             WHERE twin_id = $1 AND (module->>'active')::boolean IS NOT FALSE \
             ORDER BY module_id ASC",
        )
        .bind(twin_id)
        .fetch_all(&self.pool)
        .await?;
        let mut modules = Vec::with_capacity(rows.len());
        for row in rows {
            let module: ProceduralModule = decode(row, "runtime module")?;
            if module.applies_to(intent_label) {
                modules.push(module);
            }
        }
        Ok(modules)
    }

    async fn upsert_runtime_module(
        &self,
        twin_id: Uuid,
        module: &ProceduralModule,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO runtime_modules (twin_id, module_id, module, updated_at) \
             VALUES ($1, $2, $3, NOW()) \
             ON CONFLICT (twin_id, module_id) \
             DO UPDATE SET module = EXCLUDED.module, updated_at = NOW()",
        )
        .bind(twin_id)
        .bind(&module.id)
        .bind(encode(module)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionDirectory for PgStore {
    async fn principal_for_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Principal>, StoreError> {
        let row = sqlx::query_as::<_, PrincipalRow>(
            "SELECT user_id, tenant_id, role FROM api_keys \
             WHERE key_hash = $1 AND is_revoked = FALSE \
               AND (expires_at IS NULL OR expires_at > NOW())",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Principal {
            user_id: Some(row.user_id),
            tenant_id: row.tenant_id,
            role: parse_role(&row.role),
        }))
    }

    async fn twin_owner(&self, twin_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT owner_id FROM twins WHERE id = $1")
                .bind(twin_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn get_training_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<TrainingSession>, StoreError> {
        sqlx::query_as::<_, TrainingSessionRow>(
            "SELECT id, twin_id, owner_id, status, expires_at \
             FROM training_sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .map(TrainingSessionRow::into_session)
        .transpose()
    }

    async fn active_training_session(
        &self,
        twin_id: Uuid,
        owner_id: Uuid,
    ) -> Result<Option<TrainingSession>, StoreError> {
        sqlx::query_as::<_, TrainingSessionRow>(
            "SELECT id, twin_id, owner_id, status, expires_at \
             FROM training_sessions \
             WHERE twin_id = $1 AND owner_id = $2 AND status = 'active' \
             ORDER BY expires_at DESC LIMIT 1",
        )
        .bind(twin_id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?
        .map(TrainingSessionRow::into_session)
        .transpose()
    }

    async fn mark_training_session_expired(&self, session_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE training_sessions SET status = 'expired' \
             WHERE id = $1 AND status = 'active'",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_share_link(&self, token_hash: &str) -> Result<Option<ShareLink>, StoreError> {
        let row = sqlx::query_as::<_, ShareLinkRow>(
            "SELECT id, twin_id, token_hash, revoked, expires_at \
             FROM share_links WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| ShareLink {
            id: row.id,
            twin_id: row.twin_id,
            token_hash: row.token_hash,
            revoked: row.revoked,
            expires_at: row.expires_at,
        }))
    }
}

#[async_trait]
impl ApprovalAuditStore for PgStore {
    async fn upsert_action_draft(&self, draft: &ActionDraft) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO action_drafts (id, twin_id, status, draft, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) \
             DO UPDATE SET status = EXCLUDED.status, draft = EXCLUDED.draft, \
                           updated_at = EXCLUDED.updated_at",
        )
        .bind(draft.id)
        .bind(draft.twin_id)
        .bind(draft.status.as_str())
        .bind(encode(draft)?)
        .bind(draft.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_action_draft(&self, action_id: Uuid) -> Result<Option<ActionDraft>, StoreError> {
        let draft: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT draft FROM action_drafts WHERE id = $1")
                .bind(action_id)
                .fetch_optional(&self.pool)
                .await?;
        draft.map(|value| decode(value, "action draft")).transpose()
    }

    async fn transition_action_draft(
        &self,
        draft: &ActionDraft,
        from: ActionStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE action_drafts SET status = $3, draft = $4, updated_at = $5 \
             WHERE id = $1 AND status = $2",
        )
        .bind(draft.id)
        .bind(from.as_str())
        .bind(draft.status.as_str())
        .bind(encode(draft)?)
        .bind(draft.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_routing_decision(
        &self,
        turn_id: Uuid,
        twin_id: Uuid,
        decision: &RoutingDecision,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO routing_decisions (turn_id, twin_id, action, decision, created_at) \
             VALUES ($1, $2, $3, $4, NOW())",
        )
        .bind(turn_id)
        .bind(twin_id)
        .bind(decision.action.as_str())
        .bind(encode(decision)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_judge_result(
        &self,
        turn_id: Uuid,
        twin_id: Uuid,
        result: &JudgeResult,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO judge_results (turn_id, twin_id, score, result, created_at) \
             VALUES ($1, $2, $3, $4, NOW())",
        )
        .bind(turn_id)
        .bind(twin_id)
        .bind(result.score)
        .bind(encode(result)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_event(
        &self,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO audit_events (id, kind, payload, created_at) VALUES ($1, $2, $3, NOW())",
        )
        .bind(Uuid::now_v7())
        .bind(kind)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TurnHistoryStore for PgStore {
    async fn recent_questions(
        &self,
        conversation_id: Uuid,
        window: usize,
    ) -> Result<Vec<String>, StoreError> {
        let rows: Vec<Vec<String>> = sqlx::query_scalar(
            "SELECT questions FROM turn_questions \
             WHERE conversation_id = $1 \
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(conversation_id)
        .bind(window as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().flatten().collect())
    }

    async fn record_questions(
        &self,
        conversation_id: Uuid,
        turn_id: Uuid,
        questions: &[String],
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO turn_questions (conversation_id, turn_id, questions, created_at) \
             VALUES ($1, $2, $3, NOW())",
        )
        .bind(conversation_id)
        .bind(turn_id)
        .bind(questions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_roles_fall_back_to_anonymous() {
        assert_eq!(parse_role("OWNER"), Role::Owner);
        assert_eq!(parse_role("visitor"), Role::Visitor);
        assert_eq!(parse_role("admin"), Role::Anonymous);
    }

    #[test]
    fn filters_encode_as_containment_object() {
        let mut filters = BTreeMap::new();
        filters.insert("collection".to_string(), "faq".to_string());
        assert_eq!(
            filters_json(&filters),
            serde_json::json!({"collection": "faq"})
        );
        assert_eq!(filters_json(&BTreeMap::new()), serde_json::json!({}));
    }

    #[test]
    fn unknown_block_types_are_plain_passages() {
        assert_eq!(parse_block_type("question"), BlockType::Question);
        assert_eq!(parse_block_type("chunk"), BlockType::Passage);
    }
}

//! Retrieval fusion: owner memory, then verified answers, then hybrid
//! dense + lexical search fused into one ranking with a confidence floor.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use tokio::time::Instant;
use twin_core::evidence::{
    BlockType, EvidenceRow, EvidenceSearch, RetrievalPath, RetrievalScope, RetrievalStats,
    SearchMode, score_summary,
};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::stores::{StoreError, Stores, with_timeout};
use crate::turn::profile::tokenize;

/// Share of the final score taken by query-term overlap in the rerank pass.
const RERANK_OVERLAP_WEIGHT: f64 = 0.2;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "what", "when", "where", "which", "who", "why",
    "how", "did", "does", "you", "your", "yours", "about", "with", "that", "this", "have", "has",
    "had", "can", "could", "would", "should", "will", "from", "into", "tell", "me", "please",
    "there", "their", "they", "them", "our", "its", "not", "but", "any", "all", "been", "being",
    "think", "know", "some",
];

#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub rows: Vec<EvidenceRow>,
    pub stats: RetrievalStats,
}

impl RetrievalOutcome {
    pub fn skipped() -> Self {
        Self {
            rows: Vec::new(),
            stats: RetrievalStats::skipped(),
        }
    }
}

/// Content words of a query, in order, without duplicates.
pub fn query_keywords(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(query)
        .into_iter()
        .filter(|token| token.len() > 2 && !STOPWORDS.contains(&token.as_str()))
        .filter(|token| seen.insert(token.clone()))
        .collect()
}

fn overlap_ratio(keywords: &[String], text: &str) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let text_tokens: HashSet<String> = tokenize(text).into_iter().collect();
    let hits = keywords
        .iter()
        .filter(|keyword| text_tokens.contains(*keyword))
        .count();
    hits as f64 / keywords.len() as f64
}

fn sort_rows(rows: &mut [EvidenceRow]) {
    rows.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
}

struct FusionAccumulator {
    row: EvidenceRow,
    dense: f64,
    lexical: f64,
}

/// Weighted fusion of the two legs keyed by source id, followed by the
/// overlap rerank. Scores stay in [0, 1].
pub fn fuse(
    dense: &[EvidenceRow],
    lexical: &[EvidenceRow],
    dense_weight: f64,
    keywords: &[String],
) -> Vec<EvidenceRow> {
    let dense_weight = dense_weight.clamp(0.0, 1.0);
    let mut entries: HashMap<String, FusionAccumulator> = HashMap::new();
    for row in dense {
        let entry = entries
            .entry(row.source_id.clone())
            .or_insert_with(|| FusionAccumulator {
                row: row.clone(),
                dense: 0.0,
                lexical: 0.0,
            });
        entry.dense = entry.dense.max(row.score.clamp(0.0, 1.0));
    }
    for row in lexical {
        let entry = entries
            .entry(row.source_id.clone())
            .or_insert_with(|| FusionAccumulator {
                row: row.clone(),
                dense: 0.0,
                lexical: 0.0,
            });
        entry.lexical = entry.lexical.max(row.score.clamp(0.0, 1.0));
    }

    let mut out: Vec<EvidenceRow> = entries
        .into_values()
        .map(|entry| {
            let fused = dense_weight * entry.dense + (1.0 - dense_weight) * entry.lexical;
            let overlap = overlap_ratio(keywords, &entry.row.text);
            let score = ((1.0 - RERANK_OVERLAP_WEIGHT) * fused + RERANK_OVERLAP_WEIGHT * overlap)
                .clamp(0.0, 1.0);
            EvidenceRow {
                score,
                ..entry.row
            }
        })
        .collect();
    sort_rows(&mut out);
    out
}

/// Drop interview/training scaffolding unless the user asked for quotes.
pub fn filter_scaffolding(rows: Vec<EvidenceRow>, quote_intent: bool) -> (Vec<EvidenceRow>, usize) {
    if quote_intent {
        return (rows, 0);
    }
    let before = rows.len();
    let kept: Vec<EvidenceRow> = rows
        .into_iter()
        .filter(|row| !row.block_type.is_scaffolding())
        .collect();
    let filtered = before - kept.len();
    (kept, filtered)
}

fn passes_floor(rows: &[EvidenceRow], config: &PipelineConfig) -> bool {
    let (top1, top5_avg) = score_summary(rows);
    !rows.is_empty() && top1 >= config.floor_top1 && top5_avg >= config.floor_top5_avg
}

/// Union by source id, keeping the higher score.
fn merge_rows(primary: Vec<EvidenceRow>, secondary: Vec<EvidenceRow>) -> Vec<EvidenceRow> {
    let mut by_id: HashMap<String, EvidenceRow> = HashMap::new();
    for row in primary.into_iter().chain(secondary) {
        match by_id.get(&row.source_id) {
            Some(existing) if existing.score >= row.score => {}
            _ => {
                by_id.insert(row.source_id.clone(), row);
            }
        }
    }
    let mut rows: Vec<EvidenceRow> = by_id.into_values().collect();
    sort_rows(&mut rows);
    rows
}

struct LegResults {
    dense: Vec<EvidenceRow>,
    lexical: Vec<EvidenceRow>,
    timed_out_legs: Vec<String>,
}

fn settle_leg(
    leg: &str,
    result: Result<Result<Vec<EvidenceRow>, StoreError>, tokio::time::error::Elapsed>,
    timed_out_legs: &mut Vec<String>,
) -> Vec<EvidenceRow> {
    match result {
        Ok(Ok(rows)) => rows,
        Ok(Err(err)) => {
            tracing::warn!(leg, error = %err, "evidence leg failed");
            timed_out_legs.push(leg.to_string());
            Vec::new()
        }
        Err(_) => {
            tracing::warn!(leg, "evidence leg missed retrieval deadline");
            timed_out_legs.push(leg.to_string());
            Vec::new()
        }
    }
}

/// Dense and lexical search concurrently under one deadline. A leg that fails
/// or misses the deadline contributes nothing; the other leg still counts.
async fn search_legs(
    stores: &Stores,
    query: &str,
    scope: &RetrievalScope,
    top_k: usize,
    config: &PipelineConfig,
) -> LegResults {
    let deadline = Instant::now() + config.retrieval_timeout;
    let dense_request = EvidenceSearch {
        query: query.to_string(),
        scope: scope.clone(),
        top_k,
        mode: SearchMode::Dense,
    };
    let lexical_request = EvidenceSearch {
        mode: SearchMode::Lexical,
        ..dense_request.clone()
    };
    let (dense, lexical) = tokio::join!(
        tokio::time::timeout_at(deadline, stores.evidence.search(&dense_request)),
        tokio::time::timeout_at(deadline, stores.evidence.search(&lexical_request)),
    );

    let mut timed_out_legs = Vec::new();
    let dense = settle_leg("dense", dense, &mut timed_out_legs);
    let lexical = settle_leg("lexical", lexical, &mut timed_out_legs);
    LegResults {
        dense,
        lexical,
        timed_out_legs,
    }
}

fn short_circuit(row: EvidenceRow, block_type: BlockType, path: RetrievalPath) -> RetrievalOutcome {
    let row = EvidenceRow { block_type, ..row };
    let mut stats = RetrievalStats::skipped();
    stats.path = path;
    stats.fused_hits = 1;
    stats.top1 = row.score;
    stats.top5_avg = row.score;
    stats.floor_passed = true;
    RetrievalOutcome {
        rows: vec![row],
        stats,
    }
}

fn best_above(mut rows: Vec<EvidenceRow>, threshold: f64) -> Option<EvidenceRow> {
    sort_rows(&mut rows);
    rows.into_iter().next().filter(|row| row.score >= threshold)
}

pub async fn retrieve(
    stores: &Stores,
    config: &PipelineConfig,
    twin_id: Uuid,
    query: &str,
    scope: &RetrievalScope,
    quote_intent: bool,
) -> RetrievalOutcome {
    let mut timed_out_legs: Vec<String> = Vec::new();

    // Owner memories are private notes; public scopes never consult them.
    if !scope.public_only {
        match with_timeout(
            config.store_timeout,
            "owner memory store",
            stores.owner_memory.lookup(twin_id, query),
        )
        .await
        {
            Ok(rows) => {
                if let Some(row) = best_above(rows, config.owner_memory_threshold) {
                    tracing::debug!(source_id = %row.source_id, score = row.score, "owner memory short-circuit");
                    return short_circuit(row, BlockType::OwnerMemory, RetrievalPath::OwnerMemory);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "owner memory lookup failed");
                timed_out_legs.push("owner_memory".to_string());
            }
        }
    }

    match with_timeout(
        config.store_timeout,
        "verified answer store",
        stores
            .verified_answers
            .lookup(twin_id, query, scope.public_only),
    )
    .await
    {
        Ok(rows) => {
            if let Some(row) = best_above(rows, config.verified_answer_threshold) {
                tracing::debug!(source_id = %row.source_id, score = row.score, "verified answer short-circuit");
                let mut outcome =
                    short_circuit(row, BlockType::VerifiedAnswer, RetrievalPath::VerifiedAnswer);
                outcome.stats.timed_out_legs = timed_out_legs;
                return outcome;
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "verified answer lookup failed");
            timed_out_legs.push("verified_answer".to_string());
        }
    }

    let keywords = query_keywords(query);
    let legs = search_legs(stores, query, scope, config.retrieval_top_k, config).await;
    timed_out_legs.extend(legs.timed_out_legs);
    let mut dense_hits = legs.dense.len();
    let mut lexical_hits = legs.lexical.len();
    let fused = fuse(&legs.dense, &legs.lexical, config.dense_weight, &keywords);
    let (mut rows, mut scaffolding_filtered) = filter_scaffolding(fused, quote_intent);

    let mut floor_passed = passes_floor(&rows, config);
    let mut relaxed_retry = false;
    let mut degraded = false;
    if !floor_passed {
        relaxed_retry = true;
        let expanded = if keywords.is_empty() {
            query.to_string()
        } else {
            keywords.join(" ")
        };
        let retry = search_legs(
            stores,
            &expanded,
            &scope.relaxed(),
            config.retrieval_top_k * 2,
            config,
        )
        .await;
        dense_hits += retry.dense.len();
        lexical_hits += retry.lexical.len();
        for leg in retry.timed_out_legs {
            let leg = format!("{leg}_retry");
            if !timed_out_legs.contains(&leg) {
                timed_out_legs.push(leg);
            }
        }
        let retry_fused = fuse(&retry.dense, &retry.lexical, config.dense_weight, &keywords);
        let (retry_rows, retry_filtered) = filter_scaffolding(retry_fused, quote_intent);
        scaffolding_filtered += retry_filtered;
        rows = merge_rows(rows, retry_rows);
        floor_passed = passes_floor(&rows, config);
        degraded = !floor_passed;
        if degraded {
            tracing::info!(
                fused_hits = rows.len(),
                "retrieval below confidence floor after relaxed retry; returning degraded results"
            );
        }
    }
    rows.truncate(config.retrieval_top_k);

    let (top1, top5_avg) = score_summary(&rows);
    let path = if rows.is_empty() {
        RetrievalPath::Empty
    } else {
        RetrievalPath::Hybrid
    };
    RetrievalOutcome {
        stats: RetrievalStats {
            path,
            dense_hits,
            lexical_hits,
            fused_hits: rows.len(),
            top1,
            top5_avg,
            floor_passed,
            relaxed_retry,
            degraded,
            timed_out_legs,
            scaffolding_filtered,
        },
        rows,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::stores::memory::MemoryStore;
    use crate::stores::EvidenceStore;

    fn row(source_id: &str, text: &str, score: f64, block_type: BlockType) -> EvidenceRow {
        EvidenceRow {
            source_id: source_id.to_string(),
            text: text.to_string(),
            score,
            block_type,
            section_path: String::new(),
            metadata: serde_json::Value::Null,
        }
    }

    fn scope(twin_id: Uuid, public_only: bool) -> RetrievalScope {
        RetrievalScope {
            twin_id,
            tenant_id: None,
            public_only,
            filters: BTreeMap::new(),
        }
    }

    /// Fixed per-mode results with an optional delay on the lexical leg.
    struct StubEvidence {
        dense: Vec<EvidenceRow>,
        lexical: Vec<EvidenceRow>,
        lexical_delay: Duration,
    }

    #[async_trait]
    impl EvidenceStore for StubEvidence {
        async fn search(&self, request: &EvidenceSearch) -> Result<Vec<EvidenceRow>, StoreError> {
            match request.mode {
                SearchMode::Dense => Ok(self.dense.clone()),
                SearchMode::Lexical => {
                    tokio::time::sleep(self.lexical_delay).await;
                    Ok(self.lexical.clone())
                }
            }
        }
    }

    fn stores_with(evidence: StubEvidence) -> (Stores, Arc<MemoryStore>) {
        let memory = Arc::new(MemoryStore::new());
        let mut stores = Stores::in_memory(memory.clone());
        stores.evidence = Arc::new(evidence);
        (stores, memory)
    }

    #[test]
    fn fusion_rewards_rows_found_by_both_legs() {
        let dense = vec![
            row("both", "berlin move", 0.8, BlockType::Passage),
            row("dense-only", "berlin move", 0.8, BlockType::Passage),
        ];
        let lexical = vec![row("both", "berlin move", 0.7, BlockType::Passage)];
        let fused = fuse(&dense, &lexical, 0.6, &query_keywords("berlin move"));
        assert_eq!(fused[0].source_id, "both");
        assert!(fused[0].score > fused[1].score);
        assert!(fused.iter().all(|r| (0.0..=1.0).contains(&r.score)));
    }

    #[test]
    fn fusion_orders_ties_by_source_id() {
        let dense = vec![
            row("b", "same", 0.5, BlockType::Passage),
            row("a", "same", 0.5, BlockType::Passage),
        ];
        let fused = fuse(&dense, &[], 0.5, &[]);
        let ids: Vec<&str> = fused.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn scaffolding_is_filtered_unless_quoting() {
        let rows = vec![
            row("q", "What was your first job?", 0.9, BlockType::Question),
            row("a", "My first job was at a bakery.", 0.8, BlockType::Answer),
        ];
        let (kept, filtered) = filter_scaffolding(rows.clone(), false);
        assert_eq!(filtered, 1);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].source_id, "a");

        let (kept, filtered) = filter_scaffolding(rows, true);
        assert_eq!(filtered, 0);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn keywords_drop_stopwords_and_duplicates() {
        assert_eq!(
            query_keywords("Why did you move to Berlin, Berlin?"),
            vec!["move".to_string(), "berlin".to_string()]
        );
    }

    #[tokio::test]
    async fn owner_memory_above_threshold_short_circuits() {
        let (stores, memory) = stores_with(StubEvidence {
            dense: vec![row("doc", "unrelated", 0.9, BlockType::Passage)],
            lexical: vec![],
            lexical_delay: Duration::ZERO,
        });
        let twin_id = Uuid::now_v7();
        memory
            .add_owner_memory(
                twin_id,
                row("mem-1", "favorite book dune", 0.0, BlockType::Passage),
            )
            .await;

        let outcome = retrieve(
            &stores,
            &PipelineConfig::default(),
            twin_id,
            "favorite book dune",
            &scope(twin_id, false),
            false,
        )
        .await;
        assert_eq!(outcome.stats.path, RetrievalPath::OwnerMemory);
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0].block_type, BlockType::OwnerMemory);
    }

    #[tokio::test]
    async fn public_scope_skips_owner_memory_but_uses_verified_answers() {
        let (stores, memory) = stores_with(StubEvidence {
            dense: vec![],
            lexical: vec![],
            lexical_delay: Duration::ZERO,
        });
        let twin_id = Uuid::now_v7();
        memory
            .add_owner_memory(twin_id, row("mem", "favorite book dune", 0.0, BlockType::Passage))
            .await;
        memory
            .add_verified_answer(
                twin_id,
                row("va", "favorite book dune", 0.0, BlockType::Answer),
                true,
            )
            .await;

        let outcome = retrieve(
            &stores,
            &PipelineConfig::default(),
            twin_id,
            "favorite book dune",
            &scope(twin_id, true),
            false,
        )
        .await;
        assert_eq!(outcome.stats.path, RetrievalPath::VerifiedAnswer);
        assert_eq!(outcome.rows[0].source_id, "va");
    }

    #[tokio::test]
    async fn slow_leg_yields_partial_results() {
        let (stores, _) = stores_with(StubEvidence {
            dense: vec![row("d", "berlin move story", 0.9, BlockType::Passage)],
            lexical: vec![row("l", "berlin move story", 0.9, BlockType::Passage)],
            lexical_delay: Duration::from_millis(500),
        });
        let config = PipelineConfig {
            retrieval_timeout: Duration::from_millis(50),
            ..PipelineConfig::default()
        };
        let twin_id = Uuid::now_v7();
        let outcome = retrieve(
            &stores,
            &config,
            twin_id,
            "berlin move",
            &scope(twin_id, false),
            false,
        )
        .await;
        assert!(outcome.stats.timed_out_legs.contains(&"lexical".to_string()));
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0].source_id, "d");
    }

    #[tokio::test]
    async fn below_floor_retries_once_and_marks_degraded() {
        let (stores, _) = stores_with(StubEvidence {
            dense: vec![row("weak", "something else", 0.1, BlockType::Passage)],
            lexical: vec![],
            lexical_delay: Duration::ZERO,
        });
        let twin_id = Uuid::now_v7();
        let outcome = retrieve(
            &stores,
            &PipelineConfig::default(),
            twin_id,
            "quantum gardening",
            &scope(twin_id, false),
            false,
        )
        .await;
        assert!(outcome.stats.relaxed_retry);
        assert!(outcome.stats.degraded);
        assert!(!outcome.stats.floor_passed);
        assert_eq!(outcome.stats.path, RetrievalPath::Hybrid);
        assert_eq!(outcome.rows.len(), 1);
    }

    #[tokio::test]
    async fn empty_evidence_reports_empty_path() {
        let (stores, _) = stores_with(StubEvidence {
            dense: vec![],
            lexical: vec![],
            lexical_delay: Duration::ZERO,
        });
        let twin_id = Uuid::now_v7();
        let outcome = retrieve(
            &stores,
            &PipelineConfig::default(),
            twin_id,
            "anything at all",
            &scope(twin_id, false),
            false,
        )
        .await;
        assert_eq!(outcome.stats.path, RetrievalPath::Empty);
        assert!(outcome.rows.is_empty());
    }
}

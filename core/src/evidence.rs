use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Structural role of a retrieved passage.
///
/// `Prompt` and `Question` rows are interview/training scaffolding: they tell
/// the twin what it was asked, not what it knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Passage,
    Answer,
    Prompt,
    Question,
    OwnerMemory,
    VerifiedAnswer,
}

impl BlockType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passage => "passage",
            Self::Answer => "answer",
            Self::Prompt => "prompt",
            Self::Question => "question",
            Self::OwnerMemory => "owner_memory",
            Self::VerifiedAnswer => "verified_answer",
        }
    }

    pub const fn is_scaffolding(self) -> bool {
        matches!(self, Self::Prompt | Self::Question)
    }
}

/// One retrieved passage with provenance and relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EvidenceRow {
    pub source_id: String,
    pub text: String,
    /// Relevance in [0, 1]
    #[serde(default)]
    pub score: f64,
    pub block_type: BlockType,
    /// Location inside the source document (e.g. "Interview > Career")
    #[serde(default)]
    pub section_path: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Dense,
    Lexical,
}

/// Retrieval scope of one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalScope {
    pub twin_id: Uuid,
    pub tenant_id: Option<Uuid>,
    /// Public contexts only see documents published for visitors
    pub public_only: bool,
    /// Metadata filters, dropped on the relaxed retry
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

impl RetrievalScope {
    pub fn relaxed(&self) -> Self {
        Self {
            filters: BTreeMap::new(),
            ..self.clone()
        }
    }
}

/// Request sent to the evidence store adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceSearch {
    pub query: String,
    pub scope: RetrievalScope,
    pub top_k: usize,
    pub mode: SearchMode,
}

/// Which rung of the precedence ladder produced the evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalPath {
    OwnerMemory,
    VerifiedAnswer,
    Hybrid,
    /// Every rung came back empty or below the floor
    Empty,
    /// Retrieval not needed for this turn (identity/smalltalk fast path)
    Skipped,
}

impl RetrievalPath {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OwnerMemory => "owner_memory",
            Self::VerifiedAnswer => "verified_answer",
            Self::Hybrid => "hybrid",
            Self::Empty => "empty",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RetrievalStats {
    pub path: RetrievalPath,
    pub dense_hits: usize,
    pub lexical_hits: usize,
    pub fused_hits: usize,
    pub top1: f64,
    pub top5_avg: f64,
    pub floor_passed: bool,
    pub relaxed_retry: bool,
    pub degraded: bool,
    /// Legs ("dense", "lexical", "owner_memory", ...) that hit their deadline or failed
    pub timed_out_legs: Vec<String>,
    pub scaffolding_filtered: usize,
}

impl RetrievalStats {
    pub fn skipped() -> Self {
        Self {
            path: RetrievalPath::Skipped,
            dense_hits: 0,
            lexical_hits: 0,
            fused_hits: 0,
            top1: 0.0,
            top5_avg: 0.0,
            floor_passed: false,
            relaxed_retry: false,
            degraded: false,
            timed_out_legs: Vec::new(),
            scaffolding_filtered: 0,
        }
    }
}

/// Top-1 score and the average over the first five rows of a ranked list.
pub fn score_summary(rows: &[EvidenceRow]) -> (f64, f64) {
    let top1 = rows.first().map(|row| row.score).unwrap_or(0.0);
    let window: Vec<f64> = rows.iter().take(5).map(|row| row.score).collect();
    let top5_avg = if window.is_empty() {
        0.0
    } else {
        window.iter().sum::<f64>() / window.len() as f64
    };
    (top1, top5_avg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(score: f64) -> EvidenceRow {
        EvidenceRow {
            source_id: format!("doc-{score}"),
            text: "text".into(),
            score,
            block_type: BlockType::Passage,
            section_path: String::new(),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn scaffolding_is_prompt_and_question_only() {
        assert!(BlockType::Prompt.is_scaffolding());
        assert!(BlockType::Question.is_scaffolding());
        assert!(!BlockType::Answer.is_scaffolding());
        assert!(!BlockType::OwnerMemory.is_scaffolding());
    }

    #[test]
    fn score_summary_averages_first_five() {
        let rows: Vec<EvidenceRow> = [0.9, 0.8, 0.7, 0.6, 0.5, 0.1]
            .into_iter()
            .map(row)
            .collect();
        let (top1, avg) = score_summary(&rows);
        assert_eq!(top1, 0.9);
        assert!((avg - 0.7).abs() < 1e-9);
        assert_eq!(score_summary(&[]), (0.0, 0.0));
    }

    #[test]
    fn relaxed_scope_drops_filters_only() {
        let mut filters = BTreeMap::new();
        filters.insert("collection".to_string(), "faq".to_string());
        let scope = RetrievalScope {
            twin_id: Uuid::now_v7(),
            tenant_id: None,
            public_only: true,
            filters,
        };
        let relaxed = scope.relaxed();
        assert!(relaxed.filters.is_empty());
        assert!(relaxed.public_only);
        assert_eq!(relaxed.twin_id, scope.twin_id);
    }
}

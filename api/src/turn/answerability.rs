//! Three-state answerability: deterministic bands first, an LLM judgment
//! only inside the inconclusive band.

use std::collections::HashSet;

use serde::Deserialize;
use twin_core::answerability::{
    AmbiguityLevel, AnswerabilityState, AnswerabilityVerdict, MAX_MISSING_INFORMATION,
    VerdictSource,
};
use twin_core::evidence::{EvidenceRow, RetrievalPath};

use crate::config::PipelineConfig;
use crate::llm::{CompletionRequest, LlmError, LlmProvider, complete_within};
use crate::turn::profile::{QueryProfile, tokenize};
use crate::turn::retrieval::{RetrievalOutcome, query_keywords};

/// Rows whose text counts toward keyword coverage.
const COVERAGE_WINDOW: usize = 3;
/// Coverage needed before a strong score is trusted as a direct answer.
const DIRECT_COVERAGE_MIN: f64 = 0.5;

const VAGUE_REFERENCES: &[&str] = &["it", "that", "this", "they", "those", "them", "he", "she"];

#[derive(Debug, Clone, Copy, PartialEq)]
struct EvidenceStrength {
    top1: f64,
    coverage: f64,
    score: f64,
}

fn measure(rows: &[EvidenceRow], keywords: &[String]) -> EvidenceStrength {
    let top1 = rows.first().map(|row| row.score).unwrap_or(0.0);
    let covered: HashSet<String> = rows
        .iter()
        .take(COVERAGE_WINDOW)
        .flat_map(|row| tokenize(&row.text))
        .collect();
    let coverage = if keywords.is_empty() {
        if rows.is_empty() { 0.0 } else { 1.0 }
    } else {
        keywords.iter().filter(|k| covered.contains(*k)).count() as f64 / keywords.len() as f64
    };
    EvidenceStrength {
        top1,
        coverage,
        score: (0.7 * top1 + 0.3 * coverage).clamp(0.0, 1.0),
    }
}

fn uncovered_terms(rows: &[EvidenceRow], keywords: &[String]) -> Vec<String> {
    let covered: HashSet<String> = rows
        .iter()
        .take(COVERAGE_WINDOW)
        .flat_map(|row| tokenize(&row.text))
        .collect();
    keywords
        .iter()
        .filter(|k| !covered.contains(*k))
        .take(MAX_MISSING_INFORMATION)
        .cloned()
        .collect()
}

pub fn ambiguity_of(profile: &QueryProfile) -> AmbiguityLevel {
    let vague = profile
        .tokens
        .iter()
        .any(|token| VAGUE_REFERENCES.contains(&token.as_str()));
    match profile.tokens.len() {
        0..=2 => AmbiguityLevel::High,
        n if vague && n <= 6 => AmbiguityLevel::Medium,
        _ => AmbiguityLevel::Low,
    }
}

enum Band {
    Settled(AnswerabilityVerdict),
    /// Needs a judgment; the state is the floor the judgment cannot go below
    Inconclusive {
        floor: AnswerabilityState,
        strength: EvidenceStrength,
    },
}

fn classify(
    config: &PipelineConfig,
    profile: &QueryProfile,
    outcome: &RetrievalOutcome,
    keywords: &[String],
) -> Band {
    let ambiguity = ambiguity_of(profile);
    let rows = &outcome.rows;
    if rows.is_empty() {
        let mut missing = keywords.to_vec();
        if missing.is_empty() {
            missing.push("what the question is about".to_string());
        }
        return Band::Settled(AnswerabilityVerdict::new(
            AnswerabilityState::Insufficient,
            0.0,
            ambiguity,
            missing,
            "no evidence retrieved",
            VerdictSource::Deterministic,
        ));
    }

    if matches!(
        outcome.stats.path,
        RetrievalPath::OwnerMemory | RetrievalPath::VerifiedAnswer
    ) {
        return Band::Settled(AnswerabilityVerdict::new(
            AnswerabilityState::Direct,
            rows[0].score,
            ambiguity,
            Vec::new(),
            format!("short-circuit via {}", outcome.stats.path.as_str()),
            VerdictSource::Deterministic,
        ));
    }

    let strength = measure(rows, keywords);
    if strength.score < config.derivable_min {
        return Band::Settled(AnswerabilityVerdict::new(
            AnswerabilityState::Insufficient,
            strength.score,
            ambiguity,
            uncovered_terms(rows, keywords),
            "evidence below derivable band",
            VerdictSource::Deterministic,
        ));
    }
    if strength.score >= config.direct_min
        && strength.coverage >= DIRECT_COVERAGE_MIN
        && !outcome.stats.degraded
    {
        return Band::Settled(AnswerabilityVerdict::new(
            AnswerabilityState::Direct,
            strength.score,
            ambiguity,
            Vec::new(),
            "evidence strength and coverage in direct band",
            VerdictSource::Deterministic,
        ));
    }
    Band::Inconclusive {
        floor: AnswerabilityState::Derivable,
        strength,
    }
}

#[derive(Debug, Deserialize)]
struct JudgedAnswerability {
    state: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    ambiguity: Option<AmbiguityLevel>,
    #[serde(default)]
    missing_information: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

fn judge_prompt(query: &str, rows: &[EvidenceRow]) -> String {
    let mut prompt = String::from(
        "Decide whether the evidence answers the question.\n\
         Reply with JSON: state (direct|derivable|insufficient), confidence (0-1), \
         ambiguity (low|medium|high), missing_information (at most 3 short phrases), reasoning.\n\n",
    );
    prompt.push_str(&format!("Question: {query}\n\nEvidence:\n"));
    for (index, row) in rows.iter().take(5).enumerate() {
        prompt.push_str(&format!("[{}] {}\n", index + 1, row.text));
    }
    prompt
}

fn judge_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["state"],
        "properties": {
            "state": { "type": "string", "enum": ["direct", "derivable", "insufficient"] },
            "confidence": { "type": "number" },
            "ambiguity": { "type": "string", "enum": ["low", "medium", "high"] },
            "missing_information": { "type": "array", "items": { "type": "string" } },
            "reasoning": { "type": "string" }
        }
    })
}

/// Evaluate whether retrieved evidence can answer the query.
///
/// The judge is consulted only in the inconclusive band and its state is
/// lifted to the band's floor, so adding relevant evidence never lowers the
/// verdict. A failed judge call yields `insufficient` with source `fallback`.
pub async fn evaluate(
    llm: &dyn LlmProvider,
    config: &PipelineConfig,
    profile: &QueryProfile,
    outcome: &RetrievalOutcome,
) -> AnswerabilityVerdict {
    let keywords = query_keywords(&profile.normalized);
    let (floor, strength) = match classify(config, profile, outcome, &keywords) {
        Band::Settled(verdict) => return verdict,
        Band::Inconclusive { floor, strength } => (floor, strength),
    };
    let ambiguity = ambiguity_of(profile);
    let deterministic = AnswerabilityVerdict::new(
        floor,
        strength.score,
        ambiguity,
        uncovered_terms(&outcome.rows, &keywords),
        "evidence in inconclusive band",
        VerdictSource::Deterministic,
    );

    let request = CompletionRequest::structured(
        judge_prompt(&profile.normalized, &outcome.rows),
        judge_schema(),
    );
    let completion = match complete_within(llm, request, config.llm_timeout).await {
        Ok(completion) => completion,
        Err(LlmError::NotConfigured) => return deterministic,
        Err(err) => {
            tracing::warn!(error = %err, "answerability judge failed; falling back to insufficient");
            return AnswerabilityVerdict::new(
                AnswerabilityState::Insufficient,
                strength.score,
                ambiguity,
                deterministic.missing_information,
                "answerability judge unavailable",
                VerdictSource::Fallback,
            );
        }
    };

    let judged = completion
        .json_payload()
        .and_then(|payload| serde_json::from_value::<JudgedAnswerability>(payload).ok());
    let Some(judged) = judged else {
        tracing::warn!("answerability judge returned an unreadable verdict; falling back to insufficient");
        return AnswerabilityVerdict::new(
            AnswerabilityState::Insufficient,
            strength.score,
            ambiguity,
            deterministic.missing_information,
            "answerability judge returned an unreadable verdict",
            VerdictSource::Fallback,
        );
    };

    let state = AnswerabilityState::parse(&judged.state)
        .unwrap_or(floor)
        .max(floor);
    let missing = if state == AnswerabilityState::Direct {
        Vec::new()
    } else if judged.missing_information.is_empty() {
        deterministic.missing_information
    } else {
        judged.missing_information
    };
    AnswerabilityVerdict::new(
        state,
        judged.confidence.unwrap_or(strength.score),
        judged.ambiguity.unwrap_or(ambiguity),
        missing,
        judged.reasoning,
        VerdictSource::Judge,
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use twin_core::evidence::{BlockType, RetrievalStats};

    use super::*;
    use crate::llm::Completion;
    use crate::llm::testing::ScriptedLlm;
    use crate::turn::profile::profile_query;

    fn row(source_id: &str, text: &str, score: f64) -> EvidenceRow {
        EvidenceRow {
            source_id: source_id.to_string(),
            text: text.to_string(),
            score,
            block_type: BlockType::Passage,
            section_path: String::new(),
            metadata: serde_json::Value::Null,
        }
    }

    fn hybrid(rows: Vec<EvidenceRow>) -> RetrievalOutcome {
        let mut stats = RetrievalStats::skipped();
        stats.path = if rows.is_empty() {
            RetrievalPath::Empty
        } else {
            RetrievalPath::Hybrid
        };
        stats.floor_passed = true;
        RetrievalOutcome { rows, stats }
    }

    fn json_reply(value: serde_json::Value) -> Result<Completion, LlmError> {
        Ok(Completion {
            text: String::new(),
            json: Some(value),
        })
    }

    #[tokio::test]
    async fn no_evidence_is_insufficient_without_calling_judge() {
        let llm = ScriptedLlm::texts(&[]);
        let profile = profile_query("Why did you move to Berlin?");
        let verdict = evaluate(&llm, &PipelineConfig::default(), &profile, &hybrid(vec![])).await;
        assert_eq!(verdict.state, AnswerabilityState::Insufficient);
        assert_eq!(verdict.source, VerdictSource::Deterministic);
        assert!(verdict.missing_information.contains(&"berlin".to_string()));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn strong_covered_evidence_is_direct() {
        let llm = ScriptedLlm::texts(&[]);
        let profile = profile_query("Why did you move to Berlin?");
        let outcome = hybrid(vec![row("a", "I move to Berlin for the music scene.", 0.9)]);
        let verdict = evaluate(&llm, &PipelineConfig::default(), &profile, &outcome).await;
        assert_eq!(verdict.state, AnswerabilityState::Direct);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn judge_cannot_drop_below_band_floor() {
        let llm = ScriptedLlm::new(vec![json_reply(serde_json::json!({
            "state": "insufficient",
            "reasoning": "not sure"
        }))]);
        let profile = profile_query("Why did you move to Berlin?");
        let outcome = hybrid(vec![row("a", "Berlin has great techno clubs.", 0.6)]);
        let verdict = evaluate(&llm, &PipelineConfig::default(), &profile, &outcome).await;
        assert_eq!(verdict.state, AnswerabilityState::Derivable);
        assert_eq!(verdict.source, VerdictSource::Judge);
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn judge_timeout_falls_back_to_insufficient() {
        let llm = ScriptedLlm::slow(Duration::from_millis(200));
        let config = PipelineConfig {
            llm_timeout: Duration::from_millis(5),
            ..PipelineConfig::default()
        };
        let profile = profile_query("Why did you move to Berlin?");
        let outcome = hybrid(vec![row("a", "Berlin has great techno clubs.", 0.6)]);
        let verdict = evaluate(&llm, &config, &profile, &outcome).await;
        assert_eq!(verdict.state, AnswerabilityState::Insufficient);
        assert_eq!(verdict.source, VerdictSource::Fallback);
    }

    #[tokio::test]
    async fn more_relevant_evidence_never_downgrades() {
        let llm = ScriptedLlm::texts(&[]);
        let config = PipelineConfig::default();
        let profile = profile_query("Why did you move to Berlin?");
        let weak = hybrid(vec![row("a", "Berlin has great techno clubs.", 0.6)]);
        let strong = hybrid(vec![
            row("b", "I move to Berlin for the music.", 0.9),
            row("a", "Berlin has great techno clubs.", 0.6),
        ]);
        let weak_state = evaluate(&llm, &config, &profile, &weak).await.state;
        let strong_state = evaluate(&llm, &config, &profile, &strong).await.state;
        assert!(strong_state >= weak_state);
    }

    #[test]
    fn short_queries_are_highly_ambiguous() {
        assert_eq!(ambiguity_of(&profile_query("why?")), AmbiguityLevel::High);
        assert_eq!(
            ambiguity_of(&profile_query("why did you do that")),
            AmbiguityLevel::Medium
        );
        assert_eq!(
            ambiguity_of(&profile_query("why did you move from London to Berlin in 2019")),
            AmbiguityLevel::Low
        );
    }
}

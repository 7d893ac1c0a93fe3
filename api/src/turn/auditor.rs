//! Persona auditor: deterministic clause checks, an optional LLM judge, and
//! at most one constrained rewrite.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use twin_core::error::TurnError;
use twin_core::judge::{JudgeResult, JudgeVerdict};
use twin_core::persona::PersonaPromptPlan;

use crate::config::PipelineConfig;
use crate::llm::{CompletionRequest, LlmError, LlmProvider, complete_within};
use crate::turn::realizer;
use crate::turn::scrub::{ScrubLevel, detect_leaks};

const BAN_PENALTY: f64 = 0.35;
const LEAK_PENALTY: f64 = 0.35;
const LENGTH_PENALTY: f64 = 0.2;
const CITATION_RANGE_PENALTY: f64 = 0.2;
const CITATION_MISSING_PENALTY: f64 = 0.1;

static CITATION_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d{1,2})\]").expect("valid citation marker regex"));

pub struct AuditInput<'a> {
    pub draft: &'a str,
    pub plan: &'a PersonaPromptPlan,
    pub citation_count: usize,
    pub machine_tokens: &'a HashSet<String>,
    pub level: ScrubLevel,
}

struct Findings {
    penalty: f64,
    hard_failure: bool,
    clauses: Vec<String>,
    directives: Vec<String>,
}

fn check_clauses(input: &AuditInput<'_>) -> Findings {
    let mut findings = Findings {
        penalty: 0.0,
        hard_failure: false,
        clauses: Vec::new(),
        directives: Vec::new(),
    };
    let lowered = input.draft.to_lowercase();

    for phrase in &input.plan.banned_phrases {
        if lowered.contains(&phrase.to_lowercase()) {
            findings.penalty += BAN_PENALTY;
            findings.hard_failure = true;
            findings.clauses.push(format!("ban:{phrase}"));
            findings
                .directives
                .push(format!("Remove the phrase \"{phrase}\"."));
        }
    }

    if !detect_leaks(input.draft, input.machine_tokens, input.level).is_empty() {
        findings.penalty += LEAK_PENALTY;
        findings.hard_failure = true;
        findings.clauses.push("leak:internal_identifier".to_string());
        findings.directives.push(
            "Do not mention internal identifiers or system names; say it in plain words."
                .to_string(),
        );
    }

    if let Some(limit) = input
        .plan
        .max_chars
        .filter(|limit| input.draft.chars().count() > *limit)
    {
        findings.penalty += LENGTH_PENALTY;
        findings.clauses.push(format!("max_chars:{limit}"));
        findings
            .directives
            .push(format!("Shorten the answer to under {limit} characters."));
    }

    let markers: Vec<usize> = CITATION_MARKER_RE
        .captures_iter(input.draft)
        .filter_map(|caps| caps[1].parse().ok())
        .collect();
    if markers
        .iter()
        .any(|marker| *marker == 0 || *marker > input.citation_count)
    {
        findings.penalty += CITATION_RANGE_PENALTY;
        findings.clauses.push("citation:out_of_range".to_string());
        findings.directives.push(format!(
            "Only use citation markers [1] to [{}].",
            input.citation_count
        ));
    } else if input.citation_count > 0 && markers.is_empty() {
        findings.penalty += CITATION_MISSING_PENALTY;
        findings.clauses.push("citation:missing".to_string());
        findings
            .directives
            .push("Keep the [n] markers next to the facts they support.".to_string());
    }
    findings
}

pub fn deterministic_audit(input: &AuditInput<'_>, pass_score: f64) -> JudgeResult {
    let findings = check_clauses(input);
    let score = (1.0 - findings.penalty).clamp(0.0, 1.0);
    let verdict = if score >= pass_score && !findings.hard_failure {
        JudgeVerdict::Pass
    } else {
        JudgeVerdict::Fail
    };
    let reasoning = if findings.clauses.is_empty() {
        "all deterministic clauses satisfied".to_string()
    } else {
        format!("{} clause(s) violated", findings.clauses.len())
    };
    JudgeResult {
        score,
        verdict,
        violated_clauses: findings.clauses,
        rewrite_directives: findings.directives,
        reasoning,
        rewrite_applied: false,
        draft_score: None,
    }
}

#[derive(Debug, Deserialize)]
struct JudgeReply {
    score: f64,
    #[serde(default)]
    violated_clauses: Vec<String>,
    #[serde(default)]
    rewrite_directives: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

fn judge_prompt(input: &AuditInput<'_>) -> String {
    let mut prompt = input.plan.render_within(2_000);
    prompt.push_str(
        "\n\n## Review\nScore how well the draft follows the persona above (0-1). \
         Reply with JSON: score, violated_clauses, rewrite_directives, reasoning.\n",
    );
    prompt.push_str(&format!("\nDraft:\n{}\n", input.draft));
    prompt
}

async fn llm_judge(
    llm: &dyn LlmProvider,
    config: &PipelineConfig,
    input: &AuditInput<'_>,
) -> Result<Option<JudgeReply>, TurnError> {
    let schema = serde_json::json!({
        "type": "object",
        "required": ["score"],
        "properties": {
            "score": { "type": "number" },
            "violated_clauses": { "type": "array", "items": { "type": "string" } },
            "rewrite_directives": { "type": "array", "items": { "type": "string" } },
            "reasoning": { "type": "string" }
        }
    });
    let request = CompletionRequest::structured(judge_prompt(input), schema);
    let completion = match complete_within(llm, request, config.llm_timeout).await {
        Ok(completion) => completion,
        Err(LlmError::NotConfigured) => return Ok(None),
        Err(err) => return Err(TurnError::JudgeUnavailable(err.to_string())),
    };
    completion
        .json_payload()
        .and_then(|payload| serde_json::from_value::<JudgeReply>(payload).ok())
        .map(Some)
        .ok_or_else(|| TurnError::JudgeUnavailable("unreadable judge reply".to_string()))
}

fn merge(mut result: JudgeResult, reply: JudgeReply, pass_score: f64) -> JudgeResult {
    result.score = result.score.min(reply.score.clamp(0.0, 1.0));
    for clause in reply.violated_clauses {
        if !result.violated_clauses.contains(&clause) {
            result.violated_clauses.push(clause);
        }
    }
    for directive in reply.rewrite_directives {
        if !result.rewrite_directives.contains(&directive) {
            result.rewrite_directives.push(directive);
        }
    }
    if result.score < pass_score {
        result.verdict = JudgeVerdict::Fail;
    }
    if !reply.reasoning.trim().is_empty() {
        result.reasoning = format!("{}; judge: {}", result.reasoning, reply.reasoning.trim());
    }
    result
}

/// Deterministic checks combined with the LLM judge when one is reachable.
pub async fn audit(
    llm: &dyn LlmProvider,
    config: &PipelineConfig,
    input: &AuditInput<'_>,
) -> JudgeResult {
    let deterministic = deterministic_audit(input, config.audit_pass_score);
    match llm_judge(llm, config, input).await {
        Ok(Some(reply)) => merge(deterministic, reply, config.audit_pass_score),
        Ok(None) => deterministic,
        Err(err) => {
            tracing::warn!(error = %err, "persona judge unavailable; using deterministic audit");
            deterministic
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reviewed {
    pub text: String,
    pub judge: JudgeResult,
}

/// Audit the draft and, on failure, try one rewrite constrained to the
/// violated-clause directives. The rewrite is kept only if it scores higher.
pub async fn review(
    llm: &dyn LlmProvider,
    config: &PipelineConfig,
    input: AuditInput<'_>,
) -> Reviewed {
    let first = audit(llm, config, &input).await;
    if first.passed() || first.rewrite_directives.is_empty() {
        return Reviewed {
            text: input.draft.to_string(),
            judge: first,
        };
    }

    let rewritten =
        match realizer::rewrite(llm, config, input.draft, &first.rewrite_directives).await {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(error = %err, "persona rewrite failed; keeping original draft");
                return Reviewed {
                    text: input.draft.to_string(),
                    judge: first,
                };
            }
        };
    let second_input = AuditInput {
        draft: &rewritten,
        ..input
    };
    let second = audit(llm, config, &second_input).await;
    if second.score > first.score {
        tracing::debug!(
            draft_score = first.score,
            final_score = second.score,
            "persona rewrite accepted"
        );
        Reviewed {
            text: rewritten,
            judge: JudgeResult {
                rewrite_applied: true,
                draft_score: Some(first.score),
                ..second
            },
        }
    } else {
        tracing::debug!(
            draft_score = first.score,
            rewrite_score = second.score,
            "persona rewrite rejected"
        );
        Reviewed {
            text: input.draft.to_string(),
            judge: first,
        }
    }
}

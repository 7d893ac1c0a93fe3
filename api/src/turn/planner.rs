//! Response planning: answer points and citations, teaching questions, or a
//! disclosed-uncertainty handoff.

use std::collections::HashSet;

use serde::Serialize;
use twin_core::answerability::AnswerabilityVerdict;
use twin_core::evidence::EvidenceRow;
use twin_core::routing::{MAX_CLARIFYING_QUESTIONS, RoutingAction, RoutingDecision};
use utoipa::ToSchema;

use crate::turn::profile::{QueryClass, QueryProfile};
use crate::turn::routing::question_for_input;

const MAX_ANSWER_POINTS: usize = 4;
const MAX_POINT_CHARS: usize = 320;
/// Normalized edit similarity at which a candidate counts as already asked.
const NEAR_REPEAT_SIMILARITY: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PlannerAction {
    Answer,
    Clarify,
    Escalate,
}

impl PlannerAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Answer => "answer",
            Self::Clarify => "clarify",
            Self::Escalate => "escalate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RenderStrategy {
    Prose,
    Steps,
    Bullets,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponsePlan {
    pub action: PlannerAction,
    /// Template label from the query class, never a structure of its own
    pub template: &'static str,
    pub render_strategy: RenderStrategy,
    pub answer_points: Vec<String>,
    /// Source ids backing `answer_points`, in marker order
    pub citations: Vec<String>,
    pub teaching_questions: Vec<String>,
    pub handoff_note: Option<String>,
    /// Answer composed without the LLM (identity, smalltalk)
    pub deterministic: bool,
}

impl ResponsePlan {
    fn empty(action: PlannerAction, template: &'static str) -> Self {
        Self {
            action,
            template,
            render_strategy: RenderStrategy::Prose,
            answer_points: Vec::new(),
            citations: Vec::new(),
            teaching_questions: Vec::new(),
            handoff_note: None,
            deterministic: false,
        }
    }
}

pub struct PlannerInput<'a> {
    pub decision: &'a RoutingDecision,
    pub verdict: Option<&'a AnswerabilityVerdict>,
    pub profile: &'a QueryProfile,
    pub evidence: &'a [EvidenceRow],
    pub structured_rendering: bool,
    /// Teaching questions already asked in this conversation's window
    pub recent_questions: &'a [String],
    pub display_name: &'a str,
}

/// Identity fast path: the approved self-description, no citations.
pub fn plan_identity(identity_summary: &str) -> ResponsePlan {
    ResponsePlan {
        answer_points: vec![identity_summary.trim().to_string()],
        deterministic: true,
        ..ResponsePlan::empty(PlannerAction::Answer, QueryClass::Identity.as_str())
    }
}

pub fn plan_smalltalk() -> ResponsePlan {
    ResponsePlan {
        deterministic: true,
        ..ResponsePlan::empty(PlannerAction::Answer, QueryClass::Smalltalk.as_str())
    }
}

fn lead_sentences(text: &str) -> String {
    let trimmed = text.trim();
    let mut out = String::new();
    for sentence in trimmed.split_inclusive(['.', '!', '?']) {
        if !out.is_empty() && out.chars().count() + sentence.chars().count() > MAX_POINT_CHARS {
            break;
        }
        out.push_str(sentence);
        if out.chars().count() >= MAX_POINT_CHARS / 2 {
            break;
        }
    }
    let out = out.trim();
    if out.chars().count() > MAX_POINT_CHARS {
        out.chars().take(MAX_POINT_CHARS).collect()
    } else {
        out.to_string()
    }
}

fn plan_answer(input: &PlannerInput<'_>) -> ResponsePlan {
    let mut seen = HashSet::new();
    let mut answer_points = Vec::new();
    let mut citations = Vec::new();
    for row in input
        .evidence
        .iter()
        .filter(|row| input.profile.quote_intent || !row.block_type.is_scaffolding())
    {
        if answer_points.len() >= MAX_ANSWER_POINTS {
            break;
        }
        let point = lead_sentences(&row.text);
        if point.is_empty() || !seen.insert(point.to_lowercase()) {
            continue;
        }
        citations.push(row.source_id.clone());
        answer_points.push(format!("{point} [{}]", citations.len()));
    }

    let render_strategy = match (input.structured_rendering, input.profile.query_class) {
        (false, _) => RenderStrategy::Prose,
        (true, QueryClass::Procedural) => RenderStrategy::Steps,
        (true, _) => RenderStrategy::Bullets,
    };
    ResponsePlan {
        render_strategy,
        answer_points,
        citations,
        ..ResponsePlan::empty(PlannerAction::Answer, input.profile.query_class.as_str())
    }
}

fn normalize_question(question: &str) -> String {
    question
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Phrasings for one missing input, most direct first.
fn question_variants(field: &str) -> Vec<String> {
    let base = question_for_input(field);
    let mut softened = base.clone();
    if let Some(first) = softened.get(..1) {
        let lowered = first.to_lowercase();
        softened.replace_range(..1, &lowered);
    }
    vec![
        base,
        format!("To get this right, {softened}"),
        format!("One more detail would help: {softened}"),
    ]
}

/// Up to three questions, one per distinct field, none repeating a recently
/// asked question.
pub fn teaching_questions(fields: &[String], recent_questions: &[String]) -> Vec<String> {
    let asked: Vec<String> = recent_questions
        .iter()
        .map(|question| normalize_question(question))
        .collect();
    let already_asked = |candidate: &str| {
        let candidate = normalize_question(candidate);
        asked
            .iter()
            .any(|question| strsim::normalized_levenshtein(question, &candidate) >= NEAR_REPEAT_SIMILARITY)
    };
    let mut seen_fields = HashSet::new();
    let mut questions = Vec::new();
    for field in fields {
        if questions.len() >= MAX_CLARIFYING_QUESTIONS {
            break;
        }
        if !seen_fields.insert(field.as_str()) {
            continue;
        }
        if let Some(question) = question_variants(field)
            .into_iter()
            .find(|candidate| !already_asked(candidate))
        {
            questions.push(question);
        }
    }
    questions
}

fn plan_escalation(display_name: &str, reason: &str) -> ResponsePlan {
    ResponsePlan {
        handoff_note: Some(format!(
            "I don't have enough from {display_name} on this to answer confidently. {reason}"
        )),
        ..ResponsePlan::empty(PlannerAction::Escalate, "uncertain")
    }
}

pub fn plan(input: &PlannerInput<'_>) -> ResponsePlan {
    match input.decision.action {
        RoutingAction::Answer => plan_answer(input),
        RoutingAction::Escalate => plan_escalation(
            input.display_name,
            "I've flagged it so it can be added in a training session.",
        ),
        RoutingAction::Clarify => {
            let mut fields = input.decision.required_inputs_missing.clone();
            if let Some(verdict) = input.verdict {
                for term in &verdict.missing_information {
                    if !fields.contains(term) {
                        fields.push(term.clone());
                    }
                }
            }
            let questions = teaching_questions(&fields, input.recent_questions);
            if questions.is_empty() {
                tracing::info!(
                    fields = fields.len(),
                    "every teaching question was asked recently; disclosing uncertainty instead"
                );
                return plan_escalation(
                    input.display_name,
                    "Rephrasing the question or adding detail may help.",
                );
            }
            ResponsePlan {
                teaching_questions: questions,
                ..ResponsePlan::empty(PlannerAction::Clarify, "clarify")
            }
        }
    }
}

/// Bring the routing decision in line with what the planner actually did, so
/// the persisted row and the route counters match the response.
pub fn align_decision(decision: &mut RoutingDecision, plan: &ResponsePlan) {
    match plan.action {
        PlannerAction::Clarify => {
            decision.action = RoutingAction::Clarify;
            decision.clarifying_questions = plan.teaching_questions.clone();
        }
        PlannerAction::Escalate => {
            if decision.action == RoutingAction::Clarify {
                decision.reason_codes.push("teaching_questions_exhausted".to_string());
            }
            decision.action = RoutingAction::Escalate;
            decision.clarifying_questions.clear();
        }
        PlannerAction::Answer => {}
    }
}

#[cfg(test)]
mod tests {
    use twin_core::evidence::BlockType;
    use twin_core::routing::Workflow;

    use super::*;
    use crate::turn::profile::profile_query;

    fn decision(action: RoutingAction, missing: &[&str]) -> RoutingDecision {
        RoutingDecision {
            intent: "answer".to_string(),
            confidence: 0.8,
            required_inputs_missing: missing.iter().map(|s| s.to_string()).collect(),
            chosen_workflow: Workflow::Answer,
            output_schema: "answer_v1".to_string(),
            action,
            clarifying_questions: Vec::new(),
            reason_codes: Vec::new(),
        }
    }

    fn row(source_id: &str, text: &str, block_type: BlockType) -> EvidenceRow {
        EvidenceRow {
            source_id: source_id.to_string(),
            text: text.to_string(),
            score: 0.8,
            block_type,
            section_path: String::new(),
            metadata: serde_json::Value::Null,
        }
    }

    fn input<'a>(
        decision: &'a RoutingDecision,
        profile: &'a QueryProfile,
        evidence: &'a [EvidenceRow],
        recent: &'a [String],
    ) -> PlannerInput<'a> {
        PlannerInput {
            decision,
            verdict: None,
            profile,
            evidence,
            structured_rendering: false,
            recent_questions: recent,
            display_name: "Ada",
        }
    }

    #[test]
    fn answer_cites_only_used_non_scaffolding_rows() {
        let decision = decision(RoutingAction::Answer, &[]);
        let profile = profile_query("Why did you move to Berlin?");
        let evidence = vec![
            row("q1", "Why did you move to Berlin?", BlockType::Question),
            row("a1", "I moved for the music scene. It was 2019.", BlockType::Answer),
        ];
        let plan = plan(&input(&decision, &profile, &evidence, &[]));
        assert_eq!(plan.action, PlannerAction::Answer);
        assert_eq!(plan.citations, vec!["a1"]);
        assert_eq!(plan.answer_points.len(), 1);
        assert!(plan.answer_points[0].ends_with("[1]"));
        assert_eq!(plan.render_strategy, RenderStrategy::Prose);
    }

    #[test]
    fn structure_follows_request_and_query_class() {
        let decision = decision(RoutingAction::Answer, &[]);
        let profile = profile_query("How do I onboard a new engineer, step by step?");
        let evidence = vec![row("p", "Pair them with a buddy.", BlockType::Passage)];
        let mut planner_input = input(&decision, &profile, &evidence, &[]);
        planner_input.structured_rendering = true;
        assert_eq!(plan(&planner_input).render_strategy, RenderStrategy::Steps);
    }

    #[test]
    fn clarify_questions_skip_recent_phrasings() {
        let decision = decision(RoutingAction::Clarify, &["goal", "timeframe"]);
        let profile = profile_query("Make a plan");
        let first = plan(&input(&decision, &profile, &[], &[]));
        assert_eq!(first.teaching_questions.len(), 2);

        let second = plan(&input(&decision, &profile, &[], &first.teaching_questions));
        assert_eq!(second.action, PlannerAction::Clarify);
        for question in &second.teaching_questions {
            assert!(!first.teaching_questions.contains(question));
        }
    }

    #[test]
    fn near_identical_recent_question_counts_as_asked() {
        let recent = vec!["what outcome are you aimingg for".to_string()];
        let questions = teaching_questions(&["goal".to_string()], &recent);
        assert_eq!(questions.len(), 1);
        assert!(questions[0].starts_with("To get this right,"));
    }

    #[test]
    fn exhausted_questions_disclose_uncertainty() {
        let decision = decision(RoutingAction::Clarify, &["goal"]);
        let profile = profile_query("Make a plan");
        let recent = question_variants("goal");
        let plan = plan(&input(&decision, &profile, &[], &recent));
        assert_eq!(plan.action, PlannerAction::Escalate);
        assert!(plan.handoff_note.is_some());
        assert!(plan.teaching_questions.is_empty());
    }

    #[test]
    fn decision_follows_exhausted_clarification() {
        let mut routed = decision(RoutingAction::Clarify, &["goal"]);
        routed.clarifying_questions = vec![question_for_input("goal")];
        let profile = profile_query("Make a plan");
        let recent = question_variants("goal");
        let plan = plan(&input(&routed, &profile, &[], &recent));

        align_decision(&mut routed, &plan);
        assert_eq!(routed.action, RoutingAction::Escalate);
        assert!(routed.clarifying_questions.is_empty());
        assert!(routed.reason_codes.contains(&"teaching_questions_exhausted".to_string()));
    }

    #[test]
    fn decision_records_the_questions_actually_asked() {
        let mut routed = decision(RoutingAction::Clarify, &["goal"]);
        routed.clarifying_questions = vec![question_for_input("goal")];
        let profile = profile_query("Make a plan");
        let recent = vec![question_for_input("goal")];
        let plan = plan(&input(&routed, &profile, &[], &recent));

        align_decision(&mut routed, &plan);
        assert_eq!(routed.action, RoutingAction::Clarify);
        assert_eq!(routed.clarifying_questions, plan.teaching_questions);
        assert_ne!(routed.clarifying_questions, recent);
    }

    #[test]
    fn escalation_carries_handoff_note() {
        let decision = decision(RoutingAction::Escalate, &[]);
        let profile = profile_query("What was your first job?");
        let plan = plan(&input(&decision, &profile, &[], &[]));
        assert_eq!(plan.action, PlannerAction::Escalate);
        assert!(plan.citations.is_empty());
        assert!(plan.handoff_note.unwrap_or_default().contains("Ada"));
    }

    #[test]
    fn identity_plan_has_no_citations() {
        let plan = plan_identity("I'm Ada's twin.");
        assert!(plan.citations.is_empty());
        assert!(plan.deterministic);
        assert_eq!(plan.template, "identity");
    }
}

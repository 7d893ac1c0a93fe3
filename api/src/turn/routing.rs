//! Workflow routing: registry of workflows with required inputs, confidence
//! scoring and the answer/clarify/escalate policy.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use twin_core::answerability::AnswerabilityVerdict;
use twin_core::context::InteractionContextKind;
use twin_core::routing::{MAX_CLARIFYING_QUESTIONS, RoutingAction, RoutingDecision, Workflow};

use crate::config::PipelineConfig;
use crate::turn::profile::tokenize;

/// Field used when clarification is needed but no declared input is missing.
pub const REQUEST_DETAILS_FIELD: &str = "request_details";

const SMALLTALK_BOOST: f64 = 0.15;
const SHORT_QUERY_PENALTY: f64 = 0.2;
const EVIDENCE_AVAILABLE_BOOST: f64 = 0.1;
const EVIDENCE_MISSING_PENALTY: f64 = 0.15;
const MISSING_INPUT_PENALTY: f64 = 0.12;

static SYMPTOM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|fails?|failing|broken|crash(?:es|ing)?|not working|stuck|slow|keeps?|stopped)\b")
        .expect("valid symptom regex")
});
static TIMEFRAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(today|tomorrow|tonight|week|weeks|month|months|year|years|quarter|deadline|by (?:monday|tuesday|wednesday|thursday|friday|saturday|sunday|next|the end)|\d+\s*(?:days?|hours?|weeks?))\b")
        .expect("valid timeframe regex")
});
static ARTIFACT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)("[^"]{20,}"|```|\b(?:below|attached|here is|here's|pasted)\b)"#)
        .expect("valid artifact regex")
});
static OPTIONS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\bor\b|\bvs\.?\b|\bversus\b|\bbetween\b|\bcompared to\b|\bbetter than\b|\bworth\b)")
        .expect("valid options regex")
});
static AUDIENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:for|to) (?:my |our |the |a |an )?(team|boss|manager|client|customer|friend|investors?|audience|readers?|students?|[a-z]+s)\b")
        .expect("valid audience regex")
});

/// A required input is satisfied by its detector or by a pinned context key
/// of the same name.
struct RequiredInput {
    name: &'static str,
    question: &'static str,
    detector: fn(&str, usize) -> bool,
}

struct WorkflowSpec {
    workflow: Workflow,
    output_schema: &'static str,
    required_inputs: &'static [RequiredInput],
}

fn mentions_symptoms(query: &str, _tokens: usize) -> bool {
    SYMPTOM_RE.is_match(query)
}

fn states_goal(_query: &str, tokens: usize) -> bool {
    tokens >= 5
}

fn mentions_timeframe(query: &str, _tokens: usize) -> bool {
    TIMEFRAME_RE.is_match(query)
}

fn includes_artifact(query: &str, _tokens: usize) -> bool {
    ARTIFACT_RE.is_match(query) || query.len() > 280
}

fn names_topic(_query: &str, tokens: usize) -> bool {
    tokens >= 4
}

fn lists_options(query: &str, _tokens: usize) -> bool {
    OPTIONS_RE.is_match(query)
}

fn names_audience(query: &str, _tokens: usize) -> bool {
    AUDIENCE_RE.is_match(query)
}

const SYMPTOMS: RequiredInput = RequiredInput {
    name: "symptoms",
    question: "What exactly is happening, and what did you expect to happen instead?",
    detector: mentions_symptoms,
};
const GOAL: RequiredInput = RequiredInput {
    name: "goal",
    question: "What outcome are you aiming for?",
    detector: states_goal,
};
const TIMEFRAME: RequiredInput = RequiredInput {
    name: "timeframe",
    question: "What timeframe are you working with?",
    detector: mentions_timeframe,
};
const ARTIFACT: RequiredInput = RequiredInput {
    name: "artifact",
    question: "Could you paste the piece you'd like me to look at?",
    detector: includes_artifact,
};
const SOURCE_TEXT: RequiredInput = RequiredInput {
    name: "source_text",
    question: "Could you share the text you want summarized?",
    detector: includes_artifact,
};
const TOPIC: RequiredInput = RequiredInput {
    name: "topic",
    question: "What topic should we brainstorm around?",
    detector: names_topic,
};
const OPTIONS: RequiredInput = RequiredInput {
    name: "options",
    question: "Which options are you weighing against each other?",
    detector: lists_options,
};
const AUDIENCE: RequiredInput = RequiredInput {
    name: "audience",
    question: "Who is this for?",
    detector: names_audience,
};

const REGISTRY: &[WorkflowSpec] = &[
    WorkflowSpec {
        workflow: Workflow::Diagnose,
        output_schema: "diagnosis_v1",
        required_inputs: &[SYMPTOMS],
    },
    WorkflowSpec {
        workflow: Workflow::Plan,
        output_schema: "plan_v1",
        required_inputs: &[GOAL, TIMEFRAME],
    },
    WorkflowSpec {
        workflow: Workflow::Critique,
        output_schema: "critique_v1",
        required_inputs: &[ARTIFACT],
    },
    WorkflowSpec {
        workflow: Workflow::Summarize,
        output_schema: "summary_v1",
        required_inputs: &[SOURCE_TEXT],
    },
    WorkflowSpec {
        workflow: Workflow::Brainstorm,
        output_schema: "ideas_v1",
        required_inputs: &[TOPIC],
    },
    WorkflowSpec {
        workflow: Workflow::Evaluate,
        output_schema: "evaluation_v1",
        required_inputs: &[OPTIONS],
    },
    WorkflowSpec {
        workflow: Workflow::Write,
        output_schema: "draft_v1",
        required_inputs: &[AUDIENCE],
    },
    WorkflowSpec {
        workflow: Workflow::Answer,
        output_schema: "answer_v1",
        required_inputs: &[],
    },
];

fn spec_for(workflow: Workflow) -> &'static WorkflowSpec {
    REGISTRY
        .iter()
        .find(|spec| spec.workflow == workflow)
        .unwrap_or(&REGISTRY[REGISTRY.len() - 1])
}

/// Human question for a missing input name. Unknown names are treated as
/// missing information terms.
pub fn question_for_input(name: &str) -> String {
    if name == REQUEST_DETAILS_FIELD {
        return "Could you say a bit more about what you're looking for?".to_string();
    }
    REGISTRY
        .iter()
        .flat_map(|spec| spec.required_inputs.iter())
        .find(|input| input.name == name)
        .map(|input| input.question.to_string())
        .unwrap_or_else(|| format!("Could you tell me more about {name}?"))
}

#[derive(Debug, Clone)]
pub struct RoutingRequest<'a> {
    pub query: &'a str,
    pub intent_label: Workflow,
    pub context: InteractionContextKind,
    pub target_owner_scope: bool,
    pub requires_evidence: bool,
    pub knowledge_available: bool,
    pub smalltalk: bool,
    pub pinned_context: &'a BTreeMap<String, String>,
}

fn missing_inputs(spec: &WorkflowSpec, request: &RoutingRequest<'_>) -> Vec<String> {
    let token_count = tokenize(request.query).len();
    spec.required_inputs
        .iter()
        .filter(|input| {
            let pinned = request
                .pinned_context
                .get(input.name)
                .is_some_and(|value| !value.trim().is_empty());
            !pinned && !(input.detector)(request.query, token_count)
        })
        .map(|input| input.name.to_string())
        .collect()
}

fn questions_for(fields: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    fields
        .iter()
        .filter(|field| seen.insert(field.as_str()))
        .take(MAX_CLARIFYING_QUESTIONS)
        .map(|field| question_for_input(field))
        .collect()
}

pub fn build_routing_decision(
    config: &PipelineConfig,
    request: &RoutingRequest<'_>,
) -> RoutingDecision {
    let spec = spec_for(request.intent_label);
    let mut reason_codes: Vec<String> = Vec::new();
    let mut required_inputs_missing = missing_inputs(spec, request);

    let mut confidence = config.routing_baseline;
    if request.smalltalk {
        confidence += SMALLTALK_BOOST;
        reason_codes.push("smalltalk_boost".to_string());
    }
    if tokenize(request.query).len() < 3 && !request.smalltalk {
        confidence -= SHORT_QUERY_PENALTY;
        reason_codes.push("short_query_penalty".to_string());
    }
    if request.requires_evidence {
        if request.knowledge_available {
            confidence += EVIDENCE_AVAILABLE_BOOST;
            reason_codes.push("evidence_available".to_string());
        } else {
            confidence -= EVIDENCE_MISSING_PENALTY;
            reason_codes.push("evidence_unavailable".to_string());
        }
    }
    if !required_inputs_missing.is_empty() {
        confidence -= MISSING_INPUT_PENALTY * required_inputs_missing.len() as f64;
        reason_codes.push("required_inputs_missing".to_string());
    }
    let confidence = confidence.clamp(0.0, 1.0);

    let evidence_unmet = request.requires_evidence && !request.knowledge_available;
    let action = if request.context.is_owner() && request.target_owner_scope && evidence_unmet {
        reason_codes.push("owner_scope_evidence_unavailable".to_string());
        RoutingAction::Escalate
    } else if request.context.is_public() && evidence_unmet {
        reason_codes.push("public_context_evidence_unmet".to_string());
        RoutingAction::Clarify
    } else if confidence < config.clarify_threshold || !required_inputs_missing.is_empty() {
        if confidence < config.clarify_threshold {
            reason_codes.push("below_clarify_threshold".to_string());
        }
        RoutingAction::Clarify
    } else {
        RoutingAction::Answer
    };

    if action == RoutingAction::Clarify && required_inputs_missing.is_empty() {
        required_inputs_missing.push(REQUEST_DETAILS_FIELD.to_string());
    }
    let clarifying_questions = if action == RoutingAction::Clarify {
        questions_for(&required_inputs_missing)
    } else {
        Vec::new()
    };

    RoutingDecision {
        intent: request.intent_label.as_str().to_string(),
        confidence,
        required_inputs_missing,
        chosen_workflow: spec.workflow,
        output_schema: spec.output_schema.to_string(),
        action,
        clarifying_questions,
        reason_codes,
    }
}

/// An `insufficient` verdict never leaves the decision at `answer`.
pub fn reconcile_with_answerability(
    mut decision: RoutingDecision,
    verdict: &AnswerabilityVerdict,
    context: InteractionContextKind,
    target_owner_scope: bool,
) -> RoutingDecision {
    if !verdict.is_insufficient() || decision.action != RoutingAction::Answer {
        return decision;
    }
    if context.is_owner() && target_owner_scope {
        decision.action = RoutingAction::Escalate;
        decision.clarifying_questions.clear();
        decision
            .reason_codes
            .push("answerability_insufficient_escalate".to_string());
        return decision;
    }

    decision.action = RoutingAction::Clarify;
    decision
        .reason_codes
        .push("answerability_insufficient_clarify".to_string());
    for term in &verdict.missing_information {
        if !decision.required_inputs_missing.contains(term) {
            decision.required_inputs_missing.push(term.clone());
        }
    }
    if decision.required_inputs_missing.is_empty() {
        decision
            .required_inputs_missing
            .push(REQUEST_DETAILS_FIELD.to_string());
    }
    decision.clarifying_questions = questions_for(&decision.required_inputs_missing);
    decision
}

#[cfg(test)]
mod tests {
    use twin_core::answerability::{AmbiguityLevel, AnswerabilityState, VerdictSource};

    use super::*;

    fn request<'a>(
        query: &'a str,
        intent_label: Workflow,
        context: InteractionContextKind,
        pinned: &'a BTreeMap<String, String>,
    ) -> RoutingRequest<'a> {
        RoutingRequest {
            query,
            intent_label,
            context,
            target_owner_scope: false,
            requires_evidence: true,
            knowledge_available: true,
            smalltalk: false,
            pinned_context: pinned,
        }
    }

    fn verdict(state: AnswerabilityState, missing: &[&str]) -> AnswerabilityVerdict {
        AnswerabilityVerdict::new(
            state,
            0.3,
            AmbiguityLevel::Low,
            missing.iter().map(|s| s.to_string()).collect(),
            "test",
            VerdictSource::Deterministic,
        )
    }

    #[test]
    fn well_formed_question_with_evidence_answers() {
        let pinned = BTreeMap::new();
        let decision = build_routing_decision(
            &PipelineConfig::default(),
            &request(
                "Why did you leave your job at the bakery?",
                Workflow::Answer,
                InteractionContextKind::OwnerChat,
                &pinned,
            ),
        );
        assert_eq!(decision.action, RoutingAction::Answer);
        assert_eq!(decision.output_schema, "answer_v1");
        assert!(decision.clarifying_questions.is_empty());
    }

    #[test]
    fn owner_scope_without_evidence_escalates() {
        let pinned = BTreeMap::new();
        let mut req = request(
            "What was your first job?",
            Workflow::Answer,
            InteractionContextKind::OwnerChat,
            &pinned,
        );
        req.target_owner_scope = true;
        req.knowledge_available = false;
        let decision = build_routing_decision(&PipelineConfig::default(), &req);
        assert_eq!(decision.action, RoutingAction::Escalate);
        assert!(decision.clarifying_questions.is_empty());
    }

    #[test]
    fn public_context_with_unmet_evidence_always_clarifies() {
        let pinned = BTreeMap::new();
        let mut req = request(
            "What was your first job?",
            Workflow::Answer,
            InteractionContextKind::PublicShare,
            &pinned,
        );
        req.target_owner_scope = true;
        req.knowledge_available = false;
        let config = PipelineConfig {
            clarify_threshold: 0.0,
            ..PipelineConfig::default()
        };
        let decision = build_routing_decision(&config, &req);
        assert_eq!(decision.action, RoutingAction::Clarify);
        assert_eq!(decision.required_inputs_missing, vec![REQUEST_DETAILS_FIELD]);
        assert_eq!(decision.clarifying_questions.len(), 1);
    }

    #[test]
    fn missing_plan_inputs_clarify_with_one_question_each() {
        let pinned = BTreeMap::new();
        let decision = build_routing_decision(
            &PipelineConfig::default(),
            &request("Make a plan", Workflow::Plan, InteractionContextKind::OwnerChat, &pinned),
        );
        assert_eq!(decision.action, RoutingAction::Clarify);
        assert_eq!(decision.required_inputs_missing, vec!["goal", "timeframe"]);
        assert_eq!(decision.clarifying_questions.len(), 2);
        assert_ne!(decision.clarifying_questions[0], decision.clarifying_questions[1]);
        assert!(decision.confidence < PipelineConfig::default().routing_baseline);
    }

    #[test]
    fn pinned_context_satisfies_required_inputs() {
        let pinned = BTreeMap::from([("timeframe".to_string(), "two weeks".to_string())]);
        let decision = build_routing_decision(
            &PipelineConfig::default(),
            &request(
                "Plan my training for the half marathon race",
                Workflow::Plan,
                InteractionContextKind::OwnerChat,
                &pinned,
            ),
        );
        assert!(decision.required_inputs_missing.is_empty());
        assert_eq!(decision.action, RoutingAction::Answer);
    }

    #[test]
    fn clarifying_questions_are_capped() {
        let fields: Vec<String> = ["a", "b", "c", "d", "a"].iter().map(|s| s.to_string()).collect();
        assert_eq!(questions_for(&fields).len(), MAX_CLARIFYING_QUESTIONS);
    }

    #[test]
    fn insufficient_verdict_never_yields_answer() {
        let pinned = BTreeMap::new();
        let decision = build_routing_decision(
            &PipelineConfig::default(),
            &request(
                "Why did you leave your job at the bakery?",
                Workflow::Answer,
                InteractionContextKind::PublicWidget,
                &pinned,
            ),
        );
        assert_eq!(decision.action, RoutingAction::Answer);

        let reconciled = reconcile_with_answerability(
            decision.clone(),
            &verdict(AnswerabilityState::Insufficient, &["bakery"]),
            InteractionContextKind::PublicWidget,
            true,
        );
        assert_eq!(reconciled.action, RoutingAction::Clarify);
        assert_eq!(
            reconciled.clarifying_questions,
            vec!["Could you tell me more about bakery?".to_string()]
        );

        let owner = reconcile_with_answerability(
            decision,
            &verdict(AnswerabilityState::Insufficient, &[]),
            InteractionContextKind::OwnerChat,
            true,
        );
        assert_eq!(owner.action, RoutingAction::Escalate);
    }

    #[test]
    fn sufficient_verdict_leaves_decision_untouched() {
        let pinned = BTreeMap::new();
        let decision = build_routing_decision(
            &PipelineConfig::default(),
            &request(
                "Why did you leave your job at the bakery?",
                Workflow::Answer,
                InteractionContextKind::OwnerChat,
                &pinned,
            ),
        );
        let reconciled = reconcile_with_answerability(
            decision.clone(),
            &verdict(AnswerabilityState::Derivable, &[]),
            InteractionContextKind::OwnerChat,
            true,
        );
        assert_eq!(reconciled, decision);
    }
}

//! Query profiling: query class, workflow intent, quote and action intent.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use twin_core::actions::ActionType;
use twin_core::routing::Workflow;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum QueryClass {
    Identity,
    Procedural,
    Factual,
    Evaluative,
    Smalltalk,
}

impl QueryClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Procedural => "procedural",
            Self::Factual => "factual",
            Self::Evaluative => "evaluative",
            Self::Smalltalk => "smalltalk",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionIntent {
    pub action_type: ActionType,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryProfile {
    pub normalized: String,
    pub tokens: Vec<String>,
    pub query_class: QueryClass,
    pub intent_label: Workflow,
    pub quote_intent: bool,
    pub action_intent: Option<ActionIntent>,
    pub requires_evidence: bool,
    /// The question is about the owner personally (their views, history, choices)
    pub target_owner_scope: bool,
    /// The user explicitly asked for steps or a list
    pub structure_requested: bool,
}

static IDENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(who are you|what are you|introduce yourself|tell me about yourself|what(?:'s| is) your name|who am i (?:talking|speaking) (?:to|with))\b",
    )
    .expect("valid identity regex")
});
static PROCEDURAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(how (?:do|can|should|would) (?:i|you|we)|how to|walk me through|what are the steps)\b")
        .expect("valid procedural regex")
});
static EVALUATIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(should i|what (?:do|did) you think|is it worth|worth it|pros and cons|better than|would you recommend|your opinion|do you like)\b",
    )
    .expect("valid evaluative regex")
});
static QUOTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(quote|verbatim|word for word|exact words|exact wording|what (?:was|were) the questions?|what did (?:i|you) get asked)\b",
    )
    .expect("valid quote regex")
});
static STRUCTURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(step by step|steps|bullet(?:s| points)?|numbered|as a list|list of)\b")
        .expect("valid structure regex")
});

static SEND_EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:please\s+)?(?:can you\s+)?(?:send|write and send|shoot)\s+(?:an?\s+)?(?:e-?mail|message|note)\b")
        .expect("valid send email regex")
});
static SCHEDULE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:please\s+)?(?:can you\s+)?(?:schedule|book|set up|arrange)\s+(?:a\s+)?(?:meeting|call)\b")
        .expect("valid schedule regex")
});
static TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:please\s+)?(?:can you\s+)?(?:create|add|make)\s+(?:a\s+|an?\s+)?(?:task|todo|to-do)\b|^\s*remind me to\b")
        .expect("valid task regex")
});
static EMAIL_ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)+").expect("valid email regex")
});
static SUBJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bsubject\s*:\s*(.+?)(?:\s+body\s*:|$)").expect("valid subject regex")
});
static BODY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bbody\s*:\s*(.+)$").expect("valid body regex"));
static MEETING_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b((?:today|tomorrow|monday|tuesday|wednesday|thursday|friday|saturday|sunday|next week)(?:\s+at\s+\d{1,2}(?::\d{2})?\s*(?:am|pm)?)?|at\s+\d{1,2}(?::\d{2})?\s*(?:am|pm)?)",
    )
    .expect("valid meeting time regex")
});
static MEETING_WITH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bwith\s+([A-Za-z][A-Za-z.'-]*)").expect("valid meeting attendee regex")
});
static TASK_TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:(?:task|todo|to-do)(?:\s+(?:to|called|named|titled|for))?\s*:?\s*|remind me to\s+)(.+)$",
    )
    .expect("valid task title regex")
});

const SMALLTALK_TOKENS: &[&str] = &[
    "hi", "hello", "hey", "thanks", "thank", "you", "good", "morning", "evening", "afternoon",
    "bye", "goodbye", "cheers", "ok", "okay", "cool", "great", "nice", "yo", "howdy",
];
const OWNER_SCOPE_TOKENS: &[&str] = &["you", "your", "yours", "yourself", "my", "mine"];

pub fn tokenize(value: &str) -> Vec<String> {
    value
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter_map(|chunk| {
            let normalized = chunk.trim_matches('\'').trim().to_lowercase();
            if normalized.is_empty() {
                None
            } else {
                Some(normalized)
            }
        })
        .collect()
}

fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn classify_workflow(normalized: &str, tokens: &HashSet<&str>) -> Workflow {
    let lower = normalized.to_lowercase();
    let has = |candidates: &[&str]| candidates.iter().any(|t| tokens.contains(*t));
    let phrase = |candidates: &[&str]| candidates.iter().any(|p| lower.contains(*p));

    if has(&["summarize", "summarise", "summary", "recap", "tldr"]) {
        return Workflow::Summarize;
    }
    if has(&["critique", "critic", "roast"]) || phrase(&["feedback on", "review my", "what's wrong with"]) {
        return Workflow::Critique;
    }
    if has(&["diagnose", "debug", "broken", "failing", "fails", "error", "bug"])
        || phrase(&["not working", "why does", "why is"])
    {
        return Workflow::Diagnose;
    }
    if has(&["brainstorm", "ideas"]) || phrase(&["come up with", "suggestions for"]) {
        return Workflow::Brainstorm;
    }
    if has(&["evaluate", "compare", "assess"])
        || phrase(&["pros and cons", "is it worth", "should i", "better than"])
    {
        return Workflow::Evaluate;
    }
    if has(&["plan", "roadmap", "strategy", "schedule"]) || phrase(&["plan for", "steps to"]) {
        return Workflow::Plan;
    }
    if has(&["write", "draft", "compose", "rewrite"]) {
        return Workflow::Write;
    }
    Workflow::Answer
}

fn classify_query(normalized: &str, tokens: &[String]) -> QueryClass {
    if IDENTITY_RE.is_match(normalized) {
        return QueryClass::Identity;
    }
    if !tokens.is_empty()
        && tokens.len() <= 4
        && tokens.iter().all(|t| SMALLTALK_TOKENS.contains(&t.as_str()))
    {
        return QueryClass::Smalltalk;
    }
    if PROCEDURAL_RE.is_match(normalized) {
        return QueryClass::Procedural;
    }
    if EVALUATIVE_RE.is_match(normalized) {
        return QueryClass::Evaluative;
    }
    QueryClass::Factual
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().trim_end_matches(['.', '!', '?']).trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Detect an action request and extract whatever parameters are present.
pub fn detect_action_intent(normalized: &str) -> Option<ActionIntent> {
    let mut params = BTreeMap::new();
    let action_type = if SEND_EMAIL_RE.is_match(normalized) {
        if let Some(recipient) = EMAIL_ADDRESS_RE.find(normalized) {
            params.insert("recipient".to_string(), recipient.as_str().to_string());
        }
        if let Some(subject) = capture(&SUBJECT_RE, normalized) {
            params.insert("subject".to_string(), subject);
        }
        if let Some(body) = capture(&BODY_RE, normalized) {
            params.insert("body".to_string(), body);
        }
        ActionType::SendEmail
    } else if SCHEDULE_RE.is_match(normalized) {
        let attendee = EMAIL_ADDRESS_RE
            .find(normalized)
            .map(|m| m.as_str().to_string())
            .or_else(|| capture(&MEETING_WITH_RE, normalized));
        if let Some(attendee) = attendee {
            params.insert("attendee".to_string(), attendee);
        }
        if let Some(time) = capture(&MEETING_TIME_RE, normalized) {
            params.insert("time".to_string(), time);
        }
        ActionType::ScheduleMeeting
    } else if TASK_RE.is_match(normalized) {
        if let Some(title) = capture(&TASK_TITLE_RE, normalized) {
            params.insert("title".to_string(), title);
        }
        ActionType::CreateTask
    } else {
        return None;
    };
    Some(ActionIntent {
        action_type,
        params,
    })
}

pub fn profile_query(query: &str) -> QueryProfile {
    let normalized = normalize_query(query);
    let tokens = tokenize(&normalized);
    let token_set: HashSet<&str> = tokens.iter().map(String::as_str).collect();

    let query_class = classify_query(&normalized, &tokens);
    let intent_label = classify_workflow(&normalized, &token_set);
    let quote_intent = QUOTE_RE.is_match(&normalized);
    let action_intent = detect_action_intent(&normalized);
    let fast_path = matches!(query_class, QueryClass::Identity | QueryClass::Smalltalk);
    let requires_evidence = !fast_path && action_intent.is_none();
    let target_owner_scope = !fast_path
        && OWNER_SCOPE_TOKENS
            .iter()
            .any(|token| token_set.contains(token));
    let structure_requested = STRUCTURE_RE.is_match(&normalized);

    QueryProfile {
        normalized,
        tokens,
        query_class,
        intent_label,
        quote_intent,
        action_intent,
        requires_evidence,
        target_owner_scope,
        structure_requested,
    }
}

//! Internal-identifier scrubber for user-facing text.
//!
//! Detection combines a per-turn set of known machine tokens (reason codes,
//! field names, clause ids) with shape regexes. Rewriting happens once and is
//! fail-open: whatever survives the single pass is logged and passed through.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static LEAK_SNAKE_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[a-z][a-z0-9]*(?:_[a-z0-9]+)+\b").expect("valid snake token regex")
});
static LEAK_DOTTED_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[a-z][a-z0-9_]*(?:\.[a-z0-9_]+){1,}\b").expect("valid dotted token regex")
});
static LEAK_ENDPOINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/v1/[a-z0-9/_\.{}-]+").expect("valid endpoint regex"));
static LEAK_CLAUSE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:ban|max_chars|leak|citation):[^\s,;]+").expect("valid clause id regex")
});

/// Abbreviations the dotted-token shape would otherwise flag.
const DOTTED_ALLOWLIST: &[&str] = &["e.g", "i.e", "a.m", "p.m", "etc"];

/// Public contexts also treat dotted tokens (hosts, module paths) as leaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubLevel {
    Owner,
    Public,
}

pub fn is_machine_token_shape(token: &str) -> bool {
    let trimmed = token.trim();
    if trimmed.len() < 3 {
        return false;
    }
    trimmed.contains('_')
        || trimmed.contains('/')
        || trimmed.contains(':')
        || (trimmed.contains('.') && !trimmed.contains(' '))
}

/// Collect the tokens worth hunting for; plain words are ignored.
pub fn machine_tokens<'a>(candidates: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
    candidates
        .into_iter()
        .map(str::trim)
        .filter(|token| is_machine_token_shape(token))
        .map(str::to_string)
        .collect()
}

pub fn detect_leaks(text: &str, tokens: &HashSet<String>, level: ScrubLevel) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let mut leaks: HashSet<String> = HashSet::new();
    let lowered = trimmed.to_lowercase();
    for token in tokens {
        if !token.is_empty() && lowered.contains(&token.to_lowercase()) {
            leaks.insert(token.clone());
        }
    }
    for found in LEAK_ENDPOINT_RE.find_iter(trimmed) {
        leaks.insert(found.as_str().to_string());
    }
    for found in LEAK_CLAUSE_ID_RE.find_iter(trimmed) {
        leaks.insert(found.as_str().to_string());
    }
    for found in LEAK_SNAKE_TOKEN_RE.find_iter(trimmed) {
        leaks.insert(found.as_str().to_string());
    }
    if level == ScrubLevel::Public {
        for found in LEAK_DOTTED_TOKEN_RE.find_iter(trimmed) {
            if !DOTTED_ALLOWLIST.contains(&found.as_str()) {
                leaks.insert(found.as_str().to_string());
            }
        }
    }
    let mut out: Vec<String> = leaks.into_iter().collect();
    out.sort();
    out
}

fn replacement_for(token: &str) -> String {
    let normalized = token.trim().to_lowercase();
    if normalized.starts_with("/v1/") {
        return "an internal service".to_string();
    }
    if normalized.contains(':') {
        return "an internal check".to_string();
    }
    if normalized.contains('/') || normalized.contains('.') {
        return "an internal reference".to_string();
    }
    normalized.replace('_', " ")
}

pub fn replace_case_insensitive(text: &str, needle: &str, replacement: &str) -> String {
    let trimmed = needle.trim();
    if trimmed.is_empty() {
        return text.to_string();
    }
    let pattern = format!("(?i){}", regex::escape(trimmed));
    let Ok(re) = Regex::new(&pattern) else {
        return text.to_string();
    };
    re.replace_all(text, replacement).into_owned()
}

fn tidy(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let tidied = collapsed
        .replace(" ,", ",")
        .replace(" .", ".")
        .replace(" :", ":")
        .trim()
        .to_string();
    if tidied.is_empty() {
        "I don't have a good answer to that yet.".to_string()
    } else {
        tidied
    }
}

fn rewrite_once(text: &str, tokens: &HashSet<String>, level: ScrubLevel) -> String {
    let mut rewritten = text.to_string();
    let mut sorted: Vec<&String> = tokens.iter().collect();
    sorted.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    for token in sorted {
        rewritten = replace_case_insensitive(&rewritten, token, &replacement_for(token));
    }
    rewritten = LEAK_ENDPOINT_RE
        .replace_all(&rewritten, "an internal service")
        .into_owned();
    rewritten = LEAK_CLAUSE_ID_RE
        .replace_all(&rewritten, "an internal check")
        .into_owned();
    rewritten = LEAK_SNAKE_TOKEN_RE
        .replace_all(&rewritten, |caps: &regex::Captures<'_>| caps[0].replace('_', " "))
        .into_owned();
    if level == ScrubLevel::Public {
        rewritten = LEAK_DOTTED_TOKEN_RE
            .replace_all(&rewritten, |caps: &regex::Captures<'_>| {
                if DOTTED_ALLOWLIST.contains(&&caps[0]) {
                    caps[0].to_string()
                } else {
                    "an internal reference".to_string()
                }
            })
            .into_owned();
    }
    tidy(&rewritten)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scrubbed {
    pub text: String,
    pub leaks_detected: usize,
    pub leaks_remaining: usize,
}

/// Detect, rewrite once, re-detect. Never blocks the response.
pub fn scrub(text: &str, tokens: &HashSet<String>, level: ScrubLevel) -> Scrubbed {
    let leaks_detected = detect_leaks(text, tokens, level).len();
    if leaks_detected == 0 {
        return Scrubbed {
            text: text.to_string(),
            leaks_detected,
            leaks_remaining: 0,
        };
    }
    let rewritten = rewrite_once(text, tokens, level);
    let leaks_remaining = detect_leaks(&rewritten, tokens, level).len();
    tracing::info!(
        leak_detected_total = leaks_detected,
        leak_passed_through_total = leaks_remaining,
        "identifier scrubber executed (fail-open, one rewrite)"
    );
    Scrubbed {
        text: rewritten,
        leaks_detected,
        leaks_remaining,
    }
}

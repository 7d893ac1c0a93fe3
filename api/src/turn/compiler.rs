//! Persona compiler: turns a versioned persona spec plus runtime-learned
//! modules into the per-turn prompt plan.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

use twin_core::persona::{
    FewShot, MAX_FEW_SHOTS, PersonaPromptPlan, PersonaSpec, ProceduralModule, PromptSection,
    PromptSectionKind,
};
use twin_core::routing::Workflow;

/// Merge spec-baked and runtime modules by id (runtime wins), keep the active
/// ones that apply to `intent_label`, order by (priority, id).
pub fn select_modules(
    spec: &PersonaSpec,
    intent_label: &str,
    runtime_modules: &[ProceduralModule],
) -> Vec<ProceduralModule> {
    let mut merged: BTreeMap<&str, &ProceduralModule> = BTreeMap::new();
    for module in spec.modules.iter().chain(runtime_modules) {
        merged.insert(module.id.as_str(), module);
    }
    let mut selected: Vec<ProceduralModule> = merged
        .into_values()
        .filter(|module| module.active && module.applies_to(intent_label))
        .cloned()
        .collect();
    selected.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
    selected
}

/// Few-shots referenced by a selected module or matching the intent come
/// first, then newest first, then by id.
pub fn select_few_shots<'a>(
    spec: &'a PersonaSpec,
    intent_label: &str,
    modules: &[ProceduralModule],
) -> Vec<&'a FewShot> {
    let referenced: HashSet<&str> = modules
        .iter()
        .flat_map(|module| module.few_shot_ids.iter().map(String::as_str))
        .collect();
    let mut candidates: Vec<&FewShot> = spec.few_shots.iter().collect();
    candidates.sort_by(|a, b| {
        let a_match = referenced.contains(a.id.as_str()) || a.matches_intent(intent_label);
        let b_match = referenced.contains(b.id.as_str()) || b.matches_intent(intent_label);
        Reverse(a_match)
            .cmp(&Reverse(b_match))
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    candidates.truncate(MAX_FEW_SHOTS);
    candidates
}

fn push_unique(target: &mut Vec<String>, seen: &mut HashSet<String>, value: &str) {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return;
    }
    if seen.insert(trimmed.to_lowercase()) {
        target.push(trimmed.to_string());
    }
}

fn module_line(module: &ProceduralModule) -> String {
    match module.say_style.as_deref() {
        Some(style) if !style.trim().is_empty() => {
            format!("When {}: {} (style: {})", module.when, module.do_, style.trim())
        }
        _ => format!("When {}: {}", module.when, module.do_),
    }
}

pub fn compile(
    spec: &PersonaSpec,
    intent_label: Workflow,
    runtime_modules: &[ProceduralModule],
    structure_requested: bool,
) -> PersonaPromptPlan {
    let intent = intent_label.as_str();
    let modules = select_modules(spec, intent, runtime_modules);
    let few_shots = select_few_shots(spec, intent, &modules);

    let mut banned_phrases = Vec::new();
    let mut seen = HashSet::new();
    for phrase in spec.ban.iter().chain(modules.iter().flat_map(|m| m.ban.iter())) {
        push_unique(&mut banned_phrases, &mut seen, phrase);
    }
    let max_chars = modules.iter().filter_map(|module| module.max_chars).min();
    let structured_rendering =
        structure_requested || modules.iter().any(ProceduralModule::requests_structure);

    let mut deterministic_rules: Vec<String> = banned_phrases
        .iter()
        .map(|phrase| format!("never say \"{phrase}\""))
        .collect();
    if let Some(limit) = max_chars {
        deterministic_rules.push(format!("stay under {limit} characters"));
    }
    deterministic_rules.push("do not expose internal identifiers".to_string());
    deterministic_rules.push("cite evidence with [n] markers".to_string());

    let sections = vec![
        PromptSection {
            kind: PromptSectionKind::Constitution,
            lines: spec.constitution.clone(),
        },
        PromptSection {
            kind: PromptSectionKind::DecisionPolicy,
            lines: spec.decision_policy.clone(),
        },
        PromptSection {
            kind: PromptSectionKind::VoiceIdentity,
            lines: spec.voice_identity.clone(),
        },
        PromptSection {
            kind: PromptSectionKind::ProceduralModules,
            lines: modules.iter().map(module_line).collect(),
        },
        PromptSection {
            kind: PromptSectionKind::FewShots,
            lines: few_shots
                .iter()
                .map(|shot| format!("User: {}\n{}: {}", shot.user, spec.display_name, shot.assistant))
                .collect(),
        },
    ];
    debug_assert!(
        sections
            .iter()
            .map(|s| s.kind)
            .eq(PromptSectionKind::ORDER.into_iter())
    );

    PersonaPromptPlan {
        persona_spec_version: spec.version.clone(),
        intent_label: intent.to_string(),
        selected_module_ids: modules.into_iter().map(|module| module.id).collect(),
        few_shot_ids: few_shots.iter().map(|shot| shot.id.clone()).collect(),
        deterministic_rules,
        banned_phrases,
        max_chars,
        structured_rendering,
        sections,
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{TimeZone, Utc};

    use super::*;

    pub fn module(id: &str, labels: &[&str], priority: i32) -> ProceduralModule {
        ProceduralModule {
            id: id.to_string(),
            intent_labels: labels.iter().map(|s| s.to_string()).collect(),
            when: format!("{id} applies"),
            do_: format!("handle {id}"),
            say_style: None,
            max_chars: None,
            ban: Vec::new(),
            few_shot_ids: Vec::new(),
            priority,
            active: true,
        }
    }

    pub fn few_shot(id: &str, labels: &[&str], day: u32) -> FewShot {
        FewShot {
            id: id.to_string(),
            intent_labels: labels.iter().map(|s| s.to_string()).collect(),
            user: format!("question {id}"),
            assistant: format!("answer {id}"),
            created_at: Utc.with_ymd_and_hms(2026, 1, day, 12, 0, 0).unwrap(),
        }
    }

    pub fn persona_spec() -> PersonaSpec {
        PersonaSpec {
            version: "1.2.0".to_string(),
            approved: true,
            display_name: "Ada".to_string(),
            identity_summary: "I'm Ada's twin. I talk about engineering leadership and running."
                .to_string(),
            constitution: vec!["Be honest about what you don't know.".to_string()],
            decision_policy: vec!["Prefer concrete examples over abstractions.".to_string()],
            voice_identity: vec!["Warm, direct, a little dry.".to_string()],
            modules: vec![
                module("spec-plan", &["plan"], 2),
                module("spec-any", &[], 1),
                module("shared", &["answer"], 0),
            ],
            few_shots: vec![
                few_shot("fs-old-answer", &["answer"], 1),
                few_shot("fs-new-answer", &["answer"], 9),
                few_shot("fs-plan", &["plan"], 20),
                few_shot("fs-other-1", &["write"], 15),
                few_shot("fs-other-2", &["write"], 16),
            ],
            ban: vec!["As an AI".to_string()],
        }
    }
}

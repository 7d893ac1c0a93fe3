use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Maximum few-shot examples in one compiled plan.
pub const MAX_FEW_SHOTS: usize = 4;

/// A procedural module: when a situation matches, do X and say it like Y.
///
/// Spec-baked modules ship inside [`PersonaSpec`]; runtime-learned modules live
/// in a separate store and win id ties at compile time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProceduralModule {
    pub id: String,
    /// Workflow labels this module applies to; empty means unscoped
    #[serde(default)]
    pub intent_labels: Vec<String>,
    pub when: String,
    #[serde(rename = "do")]
    pub do_: String,
    /// Rendering hint, e.g. "concise", "numbered", "bullets", "steps", "warm"
    #[serde(default)]
    pub say_style: Option<String>,
    /// Upper bound on answer length enforced by the auditor
    #[serde(default)]
    pub max_chars: Option<usize>,
    /// Phrases the realized answer must never contain
    #[serde(default)]
    pub ban: Vec<String>,
    #[serde(default)]
    pub few_shot_ids: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl ProceduralModule {
    pub fn applies_to(&self, intent_label: &str) -> bool {
        self.intent_labels.is_empty()
            || self
                .intent_labels
                .iter()
                .any(|label| label.eq_ignore_ascii_case(intent_label))
    }

    /// Whether the module's say_style asks for list/step rendering.
    pub fn requests_structure(&self) -> bool {
        self.say_style.as_deref().is_some_and(|style| {
            let style = style.to_lowercase();
            ["numbered", "bullets", "bulleted", "steps", "list"]
                .iter()
                .any(|marker| style.contains(marker))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FewShot {
    pub id: String,
    #[serde(default)]
    pub intent_labels: Vec<String>,
    pub user: String,
    pub assistant: String,
    pub created_at: DateTime<Utc>,
}

impl FewShot {
    pub fn matches_intent(&self, intent_label: &str) -> bool {
        self.intent_labels
            .iter()
            .any(|label| label.eq_ignore_ascii_case(intent_label))
    }
}

/// Versioned persona spec. Never mutated by the turn pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PersonaSpec {
    /// Semver, e.g. "1.4.0"
    pub version: String,
    /// Whether the owner approved this profile for identity answers
    #[serde(default)]
    pub approved: bool,
    pub display_name: String,
    /// Short first-person self-description used by the identity fast path
    #[serde(default)]
    pub identity_summary: String,
    pub constitution: Vec<String>,
    pub decision_policy: Vec<String>,
    pub voice_identity: Vec<String>,
    #[serde(default)]
    pub modules: Vec<ProceduralModule>,
    #[serde(default)]
    pub few_shots: Vec<FewShot>,
    /// Spec-wide banned phrases
    #[serde(default)]
    pub ban: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PromptSectionKind {
    Constitution,
    DecisionPolicy,
    VoiceIdentity,
    ProceduralModules,
    FewShots,
}

impl PromptSectionKind {
    /// Render order. Budget truncation trims from the end of this list.
    pub const ORDER: [PromptSectionKind; 5] = [
        Self::Constitution,
        Self::DecisionPolicy,
        Self::VoiceIdentity,
        Self::ProceduralModules,
        Self::FewShots,
    ];

    pub const fn title(self) -> &'static str {
        match self {
            Self::Constitution => "Constitution",
            Self::DecisionPolicy => "Decision policy",
            Self::VoiceIdentity => "Voice and identity",
            Self::ProceduralModules => "Procedures",
            Self::FewShots => "Examples",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PromptSection {
    pub kind: PromptSectionKind,
    pub lines: Vec<String>,
}

/// Compiled per-turn persona prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PersonaPromptPlan {
    pub persona_spec_version: String,
    pub intent_label: String,
    pub selected_module_ids: Vec<String>,
    pub few_shot_ids: Vec<String>,
    /// Rules the auditor checks deterministically (bans, length limits)
    pub deterministic_rules: Vec<String>,
    pub banned_phrases: Vec<String>,
    pub max_chars: Option<usize>,
    pub structured_rendering: bool,
    pub sections: Vec<PromptSection>,
}

impl PersonaPromptPlan {
    /// Render sections in fixed order, dropping whole lines from the bottom
    /// until the text fits `budget` characters.
    pub fn render_within(&self, budget: usize) -> String {
        let mut lines: Vec<String> = Vec::new();
        for section in &self.sections {
            if section.lines.is_empty() {
                continue;
            }
            lines.push(format!("## {}", section.kind.title()));
            lines.extend(section.lines.iter().cloned());
        }
        loop {
            let rendered = lines.join("\n");
            if rendered.chars().count() <= budget || lines.is_empty() {
                return rendered;
            }
            lines.pop();
            // A trailing header with no body is noise.
            if lines.last().is_some_and(|line| line.starts_with("## ")) {
                lines.pop();
            }
        }
    }
}

/// Parse a `MAJOR.MINOR.PATCH` version string.
pub fn parse_semver(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> PersonaPromptPlan {
        PersonaPromptPlan {
            persona_spec_version: "1.0.0".into(),
            intent_label: "answer".into(),
            selected_module_ids: vec![],
            few_shot_ids: vec![],
            deterministic_rules: vec![],
            banned_phrases: vec![],
            max_chars: None,
            structured_rendering: false,
            sections: vec![
                PromptSection {
                    kind: PromptSectionKind::Constitution,
                    lines: vec!["Be honest.".into()],
                },
                PromptSection {
                    kind: PromptSectionKind::VoiceIdentity,
                    lines: vec!["Speak plainly.".into()],
                },
                PromptSection {
                    kind: PromptSectionKind::FewShots,
                    lines: vec!["User: hi\nTwin: hello".into()],
                },
            ],
        }
    }

    #[test]
    fn render_within_trims_from_the_bottom_only() {
        let plan = plan();
        let full = plan.render_within(10_000);
        assert!(full.starts_with("## Constitution\nBe honest."));
        assert!(full.contains("## Examples"));

        let trimmed = plan.render_within(45);
        assert!(trimmed.contains("Be honest."));
        assert!(!trimmed.contains("Examples"));
        assert!(full.starts_with(&trimmed));
    }

    #[test]
    fn parse_semver_requires_three_numeric_parts() {
        assert_eq!(parse_semver("1.4.0"), Some((1, 4, 0)));
        assert_eq!(parse_semver("1.4"), None);
        assert_eq!(parse_semver("1.4.0.1"), None);
        assert_eq!(parse_semver("v1.4.0"), None);
    }

    #[test]
    fn unscoped_module_applies_to_every_intent() {
        let module = ProceduralModule {
            id: "m".into(),
            intent_labels: vec![],
            when: "always".into(),
            do_: "be brief".into(),
            say_style: Some("Numbered steps".into()),
            max_chars: None,
            ban: vec![],
            few_shot_ids: vec![],
            priority: 0,
            active: true,
        };
        assert!(module.applies_to("plan"));
        assert!(module.requests_structure());
    }
}

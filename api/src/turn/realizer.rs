//! Turns a response plan into text. Only answer plans reach the LLM.

use twin_core::persona::PersonaPromptPlan;

use crate::config::PipelineConfig;
use crate::llm::{CompletionRequest, LlmError, LlmProvider, complete_within};
use crate::turn::planner::{PlannerAction, RenderStrategy, ResponsePlan};

pub const UNCERTAINTY_MESSAGE: &str =
    "I'm not able to give you a reliable answer right now. Could you try again in a moment?";

const NO_NOTES_MESSAGE: &str = "I'm not sure about that one.";

const ANSWER_MAX_TOKENS: u32 = 600;

#[derive(Debug, Clone, PartialEq)]
pub struct Realized {
    pub text: String,
    pub used_llm: bool,
    /// The LLM failed and the fixed uncertainty message was substituted
    pub fell_back: bool,
}

impl Realized {
    fn deterministic(text: String) -> Self {
        Self {
            text,
            used_llm: false,
            fell_back: false,
        }
    }
}

fn render_instruction(strategy: RenderStrategy) -> &'static str {
    match strategy {
        RenderStrategy::Prose => "Answer in plain prose. Do not use lists or headings.",
        RenderStrategy::Steps => "Answer as a short numbered sequence of steps.",
        RenderStrategy::Bullets => "Answer as a short bulleted list.",
    }
}

fn answer_prompt(
    plan: &ResponsePlan,
    persona: &PersonaPromptPlan,
    query: &str,
    budget: usize,
) -> String {
    let mut prompt = persona.render_within(budget);
    prompt.push_str("\n\n## Task\n");
    prompt.push_str(render_instruction(plan.render_strategy));
    prompt.push('\n');
    if let Some(limit) = persona.max_chars {
        prompt.push_str(&format!("Stay under {limit} characters.\n"));
    }
    if plan.answer_points.is_empty() {
        prompt.push_str("No notes are available; say briefly that you're not sure.\n");
    } else {
        prompt.push_str("Use only these notes and keep their [n] markers:\n");
        for point in &plan.answer_points {
            prompt.push_str(&format!("- {point}\n"));
        }
    }
    prompt.push_str(&format!("\nQuestion: {query}\n"));
    prompt
}

fn clarify_text(plan: &ResponsePlan) -> String {
    let lead = if plan.teaching_questions.len() == 1 {
        "I want to get this right."
    } else {
        "I want to get this right, so a couple of questions first."
    };
    let mut parts = vec![lead.to_string()];
    parts.extend(plan.teaching_questions.iter().cloned());
    parts.join(" ")
}

/// Answer points laid out without the LLM, in the plan's render strategy.
fn render_points(plan: &ResponsePlan) -> String {
    if plan.answer_points.is_empty() {
        return NO_NOTES_MESSAGE.to_string();
    }
    match plan.render_strategy {
        RenderStrategy::Prose => plan.answer_points.join(" "),
        RenderStrategy::Steps => plan
            .answer_points
            .iter()
            .enumerate()
            .map(|(index, point)| format!("{}. {point}", index + 1))
            .collect::<Vec<_>>()
            .join("\n"),
        RenderStrategy::Bullets => plan
            .answer_points
            .iter()
            .map(|point| format!("- {point}"))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn deterministic_text(plan: &ResponsePlan, display_name: &str) -> String {
    match plan.template {
        "identity" => plan
            .answer_points
            .first()
            .filter(|summary| !summary.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("I'm {display_name}'s digital twin.")),
        _ => format!("Hi! I'm {display_name}'s twin. What would you like to talk about?"),
    }
}

pub async fn realize(
    llm: &dyn LlmProvider,
    config: &PipelineConfig,
    plan: &ResponsePlan,
    persona: &PersonaPromptPlan,
    display_name: &str,
    query: &str,
) -> Realized {
    match plan.action {
        PlannerAction::Clarify => return Realized::deterministic(clarify_text(plan)),
        PlannerAction::Escalate => {
            return Realized::deterministic(
                plan.handoff_note
                    .clone()
                    .unwrap_or_else(|| UNCERTAINTY_MESSAGE.to_string()),
            );
        }
        PlannerAction::Answer if plan.deterministic => {
            return Realized::deterministic(deterministic_text(plan, display_name));
        }
        PlannerAction::Answer => {}
    }

    let request = CompletionRequest::text(
        answer_prompt(plan, persona, query, config.prompt_budget_chars),
        ANSWER_MAX_TOKENS,
    );
    match complete_within(llm, request, config.llm_timeout).await {
        Ok(completion) if !completion.text.trim().is_empty() => Realized {
            text: completion.text.trim().to_string(),
            used_llm: true,
            fell_back: false,
        },
        Ok(_) => {
            tracing::warn!(provider = llm.name(), "realizer got an empty completion");
            fallback()
        }
        Err(LlmError::NotConfigured) => {
            tracing::debug!("no LLM provider configured; rendering answer points directly");
            Realized::deterministic(render_points(plan))
        }
        Err(err) => {
            tracing::warn!(provider = llm.name(), error = %err, "realizer call failed");
            fallback()
        }
    }
}

fn fallback() -> Realized {
    Realized {
        text: UNCERTAINTY_MESSAGE.to_string(),
        used_llm: true,
        fell_back: true,
    }
}

/// Single constrained rewrite: apply the directives, change nothing else.
pub async fn rewrite(
    llm: &dyn LlmProvider,
    config: &PipelineConfig,
    draft: &str,
    directives: &[String],
) -> Result<String, LlmError> {
    let mut prompt = String::from(
        "Rewrite the draft below. Apply only these corrections and keep everything else, \
         including [n] markers:\n",
    );
    for directive in directives {
        prompt.push_str(&format!("- {directive}\n"));
    }
    prompt.push_str(&format!("\nDraft:\n{draft}\n"));
    let completion = complete_within(
        llm,
        CompletionRequest::text(prompt, ANSWER_MAX_TOKENS),
        config.llm_timeout,
    )
    .await?;
    let text = completion.text.trim();
    if text.is_empty() {
        return Err(LlmError::Decode("empty rewrite".to_string()));
    }
    Ok(text.to_string())
}

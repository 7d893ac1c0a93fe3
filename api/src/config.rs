use std::time::Duration;

/// Which persistence adapters back the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl StoreBackend {
    pub fn from_env() -> Self {
        match std::env::var("TWIN_STORE_BACKEND")
            .unwrap_or_default()
            .trim()
            .to_lowercase()
            .as_str()
        {
            "memory" => Self::Memory,
            _ => Self::Postgres,
        }
    }
}

/// Tunables of the turn pipeline.
///
/// Absolute values are configuration; only their relative ordering is an
/// invariant, and [`PipelineConfig::repaired`] restores it on load.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub clarify_threshold: f64,
    pub routing_baseline: f64,
    pub floor_top1: f64,
    pub floor_top5_avg: f64,
    pub owner_memory_threshold: f64,
    pub verified_answer_threshold: f64,
    /// Weight of the dense leg in fusion; lexical gets the remainder
    pub dense_weight: f64,
    pub direct_min: f64,
    pub derivable_min: f64,
    pub retrieval_top_k: usize,
    pub retrieval_timeout: Duration,
    pub llm_timeout: Duration,
    pub store_timeout: Duration,
    pub actions_enabled: bool,
    pub action_approval_required: bool,
    pub action_max_steps: u32,
    pub action_timeout: Duration,
    pub audit_pass_score: f64,
    pub prompt_budget_chars: usize,
    /// Number of recent turns whose teaching questions must not repeat
    pub question_window: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            clarify_threshold: 0.55,
            routing_baseline: 0.7,
            floor_top1: 0.35,
            floor_top5_avg: 0.2,
            owner_memory_threshold: 0.85,
            verified_answer_threshold: 0.8,
            dense_weight: 0.6,
            direct_min: 0.72,
            derivable_min: 0.42,
            retrieval_top_k: 8,
            retrieval_timeout: Duration::from_millis(1_500),
            llm_timeout: Duration::from_millis(8_000),
            store_timeout: Duration::from_millis(800),
            actions_enabled: true,
            action_approval_required: true,
            action_max_steps: 4,
            action_timeout: Duration::from_millis(5_000),
            audit_pass_score: 0.7,
            prompt_budget_chars: 6_000,
            question_window: 6,
        }
    }
}

fn env_f64(key: &str, default_value: f64, min: f64, max: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .map(|value| value.clamp(min, max))
        .unwrap_or(default_value)
}

fn env_u64(key: &str, default_value: u64, min: u64, max: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(|value| value.clamp(min, max))
        .unwrap_or(default_value)
}

fn env_bool(key: &str, default_value: bool) -> bool {
    match std::env::var(key)
        .unwrap_or_default()
        .trim()
        .to_lowercase()
        .as_str()
    {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => default_value,
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            clarify_threshold: env_f64("TWIN_CLARIFY_THRESHOLD", d.clarify_threshold, 0.0, 1.0),
            routing_baseline: env_f64("TWIN_ROUTING_BASELINE", d.routing_baseline, 0.0, 1.0),
            floor_top1: env_f64("TWIN_FLOOR_TOP1", d.floor_top1, 0.0, 1.0),
            floor_top5_avg: env_f64("TWIN_FLOOR_TOP5_AVG", d.floor_top5_avg, 0.0, 1.0),
            owner_memory_threshold: env_f64(
                "TWIN_OWNER_MEMORY_THRESHOLD",
                d.owner_memory_threshold,
                0.0,
                1.0,
            ),
            verified_answer_threshold: env_f64(
                "TWIN_VERIFIED_ANSWER_THRESHOLD",
                d.verified_answer_threshold,
                0.0,
                1.0,
            ),
            dense_weight: env_f64("TWIN_DENSE_WEIGHT", d.dense_weight, 0.0, 1.0),
            direct_min: env_f64("TWIN_DIRECT_MIN", d.direct_min, 0.0, 1.0),
            derivable_min: env_f64("TWIN_DERIVABLE_MIN", d.derivable_min, 0.0, 1.0),
            retrieval_top_k: env_u64("TWIN_RETRIEVAL_TOP_K", d.retrieval_top_k as u64, 1, 50)
                as usize,
            retrieval_timeout: Duration::from_millis(env_u64(
                "TWIN_RETRIEVAL_TIMEOUT_MS",
                d.retrieval_timeout.as_millis() as u64,
                50,
                30_000,
            )),
            llm_timeout: Duration::from_millis(env_u64(
                "TWIN_LLM_TIMEOUT_MS",
                d.llm_timeout.as_millis() as u64,
                100,
                120_000,
            )),
            store_timeout: Duration::from_millis(env_u64(
                "TWIN_STORE_TIMEOUT_MS",
                d.store_timeout.as_millis() as u64,
                20,
                30_000,
            )),
            actions_enabled: env_bool("TWIN_ACTIONS_ENABLED", d.actions_enabled),
            action_approval_required: env_bool(
                "TWIN_ACTION_APPROVAL_REQUIRED",
                d.action_approval_required,
            ),
            action_max_steps: env_u64("TWIN_ACTION_MAX_STEPS", d.action_max_steps as u64, 1, 32)
                as u32,
            action_timeout: Duration::from_millis(env_u64(
                "TWIN_ACTION_TIMEOUT_MS",
                d.action_timeout.as_millis() as u64,
                100,
                120_000,
            )),
            audit_pass_score: env_f64("TWIN_AUDIT_PASS_SCORE", d.audit_pass_score, 0.0, 1.0),
            prompt_budget_chars: env_u64(
                "TWIN_PROMPT_BUDGET_CHARS",
                d.prompt_budget_chars as u64,
                500,
                200_000,
            ) as usize,
            question_window: env_u64("TWIN_QUESTION_WINDOW", d.question_window as u64, 1, 50)
                as usize,
        }
        .repaired()
    }

    /// Restore the relative ordering of thresholds, logging each repair.
    pub fn repaired(mut self) -> Self {
        if self.floor_top5_avg > self.floor_top1 {
            tracing::warn!(
                floor_top1 = self.floor_top1,
                floor_top5_avg = self.floor_top5_avg,
                "floor_top5_avg above floor_top1; lowering to floor_top1"
            );
            self.floor_top5_avg = self.floor_top1;
        }
        if self.owner_memory_threshold < self.floor_top1 {
            tracing::warn!(
                owner_memory_threshold = self.owner_memory_threshold,
                floor_top1 = self.floor_top1,
                "owner memory threshold below retrieval floor; raising"
            );
            self.owner_memory_threshold = self.floor_top1;
        }
        if self.verified_answer_threshold < self.floor_top1 {
            tracing::warn!(
                verified_answer_threshold = self.verified_answer_threshold,
                floor_top1 = self.floor_top1,
                "verified answer threshold below retrieval floor; raising"
            );
            self.verified_answer_threshold = self.floor_top1;
        }
        if self.derivable_min >= self.direct_min {
            let repaired = (self.direct_min - 0.05).max(0.0);
            tracing::warn!(
                direct_min = self.direct_min,
                derivable_min = self.derivable_min,
                repaired,
                "derivable_min must stay below direct_min; lowering"
            );
            self.derivable_min = repaired;
        }
        self
    }

    pub fn lexical_weight(&self) -> f64 {
        1.0 - self.dense_weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_already_satisfy_ordering() {
        let config = PipelineConfig::default();
        assert_eq!(config.clone().repaired(), config);
    }

    #[test]
    fn repaired_restores_threshold_ordering() {
        let config = PipelineConfig {
            floor_top1: 0.3,
            floor_top5_avg: 0.5,
            owner_memory_threshold: 0.1,
            verified_answer_threshold: 0.2,
            direct_min: 0.5,
            derivable_min: 0.6,
            ..PipelineConfig::default()
        }
        .repaired();
        assert_eq!(config.floor_top5_avg, 0.3);
        assert_eq!(config.owner_memory_threshold, 0.3);
        assert_eq!(config.verified_answer_threshold, 0.3);
        assert!(config.derivable_min < config.direct_min);
    }

    #[test]
    fn lexical_weight_complements_dense_weight() {
        let config = PipelineConfig {
            dense_weight: 0.25,
            ..PipelineConfig::default()
        };
        assert!((config.lexical_weight() - 0.75).abs() < 1e-9);
    }
}

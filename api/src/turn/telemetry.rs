//! Per-process turn counters and their rate snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use twin_core::actions::ActionStatus;
use twin_core::routing::RoutingAction;
use utoipa::ToSchema;

#[derive(Debug, Default)]
pub struct TurnTelemetry {
    turns: AtomicU64,
    refused: AtomicU64,
    routed_answer: AtomicU64,
    routed_clarify: AtomicU64,
    routed_escalate: AtomicU64,
    action_turns: AtomicU64,
    forbidden: AtomicU64,
    missing_params: AtomicU64,
    needs_approval: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    judge_fallbacks: AtomicU64,
    realizer_fallbacks: AtomicU64,
    rewrites_applied: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct TelemetrySnapshot {
    pub turns_total: u64,
    pub refused_total: u64,
    pub action_turns_total: u64,
    /// Share of routed turns per action, in percent
    pub answer_rate_pct: f64,
    pub clarify_rate_pct: f64,
    pub escalate_rate_pct: f64,
    /// Share of action turns per outcome, in percent
    pub forbidden_context_rate_pct: f64,
    pub missing_params_rate_pct: f64,
    pub needs_approval_rate_pct: f64,
    pub executed_rate_pct: f64,
    pub execution_failed_total: u64,
    pub judge_fallback_total: u64,
    pub realizer_fallback_total: u64,
    pub rewrite_applied_total: u64,
}

fn round_one_decimal(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    (value * 10.0).round() / 10.0
}

fn rate_pct(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        round_one_decimal((numerator as f64) / (denominator as f64) * 100.0)
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl TurnTelemetry {
    pub fn record_turn(&self) {
        bump(&self.turns);
    }

    pub fn record_refusal(&self) {
        bump(&self.refused);
    }

    pub fn record_route(&self, action: RoutingAction) {
        bump(match action {
            RoutingAction::Answer => &self.routed_answer,
            RoutingAction::Clarify => &self.routed_clarify,
            RoutingAction::Escalate => &self.routed_escalate,
        });
    }

    /// Count an action-lane outcome. Executions finished later via approval
    /// are counted as they happen.
    pub fn record_action(&self, status: ActionStatus) {
        match status {
            ActionStatus::Forbidden => bump(&self.forbidden),
            ActionStatus::MissingParams => bump(&self.missing_params),
            ActionStatus::NeedsApproval => bump(&self.needs_approval),
            ActionStatus::Executed => bump(&self.executed),
            ActionStatus::Failed => bump(&self.failed),
            ActionStatus::Proposed | ActionStatus::Approved | ActionStatus::Disabled => {}
        }
    }

    pub fn record_action_turn(&self, status: ActionStatus) {
        bump(&self.action_turns);
        self.record_action(status);
    }

    pub fn record_judge_fallback(&self) {
        bump(&self.judge_fallbacks);
    }

    pub fn record_realizer_fallback(&self) {
        bump(&self.realizer_fallbacks);
    }

    pub fn record_rewrite(&self) {
        bump(&self.rewrites_applied);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let answer = load(&self.routed_answer);
        let clarify = load(&self.routed_clarify);
        let escalate = load(&self.routed_escalate);
        let routed = answer + clarify + escalate;
        let action_turns = load(&self.action_turns);
        TelemetrySnapshot {
            turns_total: load(&self.turns),
            refused_total: load(&self.refused),
            action_turns_total: action_turns,
            answer_rate_pct: rate_pct(answer, routed),
            clarify_rate_pct: rate_pct(clarify, routed),
            escalate_rate_pct: rate_pct(escalate, routed),
            forbidden_context_rate_pct: rate_pct(load(&self.forbidden), action_turns),
            missing_params_rate_pct: rate_pct(load(&self.missing_params), action_turns),
            needs_approval_rate_pct: rate_pct(load(&self.needs_approval), action_turns),
            executed_rate_pct: rate_pct(load(&self.executed), action_turns),
            execution_failed_total: load(&self.failed),
            judge_fallback_total: load(&self.judge_fallbacks),
            realizer_fallback_total: load(&self.realizer_fallbacks),
            rewrite_applied_total: load(&self.rewrites_applied),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_pct_handles_zero_denominator() {
        assert_eq!(rate_pct(3, 0), 0.0);
        assert_eq!(rate_pct(5, 20), 25.0);
        assert_eq!(rate_pct(1, 3), 33.3);
    }

    #[test]
    fn snapshot_reports_route_and_action_rates() {
        let telemetry = TurnTelemetry::default();
        for _ in 0..3 {
            telemetry.record_turn();
            telemetry.record_route(RoutingAction::Answer);
        }
        telemetry.record_turn();
        telemetry.record_route(RoutingAction::Clarify);
        telemetry.record_action_turn(ActionStatus::Forbidden);
        telemetry.record_action_turn(ActionStatus::NeedsApproval);

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.turns_total, 4);
        assert_eq!(snapshot.answer_rate_pct, 75.0);
        assert_eq!(snapshot.clarify_rate_pct, 25.0);
        assert_eq!(snapshot.forbidden_context_rate_pct, 50.0);
        assert_eq!(snapshot.needs_approval_rate_pct, 50.0);
        assert_eq!(snapshot.executed_rate_pct, 0.0);
    }
}

//! Run-level stop conditions.
//!
//! A [`StoppingConditionManager`] accumulates the resources a session has
//! consumed (steps, tokens, cost, wall-clock time, errors) and decides after
//! each step whether the session must end. Every threshold is independently
//! optional; a `None` limit is never breached.
//!
//! Mutators take `&mut self`, so a manager is only ever driven from one turn
//! at a time. Sharing one across tasks needs an explicit `Mutex`.

use crate::agent::config::opt_millis;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

// ── Conditions ─────────────────────────────────────────────────────

/// Thresholds that end a session. `None` disables a threshold.
///
/// In JSON, an omitted field keeps its default and an explicit `null`
/// disables it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopConditions {
    pub max_steps: Option<u32>,
    pub max_tokens: Option<u64>,
    /// Cost ceiling in the host's currency units.
    pub max_cost: Option<f64>,
    #[serde(rename = "time_limit_ms", with = "opt_millis")]
    pub time_limit: Option<Duration>,
    pub error_threshold: Option<u32>,
}

impl Default for StopConditions {
    fn default() -> Self {
        Self {
            max_steps: Some(20),
            max_tokens: Some(100_000),
            max_cost: Some(1.0),
            time_limit: Some(Duration::from_millis(300_000)),
            error_threshold: Some(5),
        }
    }
}

impl StopConditions {
    /// No thresholds at all. The session runs until the turn finishes,
    /// success criteria are met, or it is cancelled.
    pub fn none() -> Self {
        Self {
            max_steps: None,
            max_tokens: None,
            max_cost: None,
            time_limit: None,
            error_threshold: None,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = Some(max_cost);
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = Some(threshold);
        self
    }
}

// ── Run state ──────────────────────────────────────────────────────

/// Counters accumulated since the manager was created or last reset.
///
/// Counters only grow between resets.
#[derive(Debug, Clone)]
pub struct RunState {
    pub steps: u32,
    pub tokens: u64,
    pub cost: f64,
    pub errors: u32,
    started: Instant,
    started_at: DateTime<Local>,
}

impl RunState {
    fn new() -> Self {
        Self {
            steps: 0,
            tokens: 0,
            cost: 0.0,
            errors: 0,
            started: Instant::now(),
            started_at: Local::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }
}

/// Immutable view of a [`RunState`] at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub steps: u32,
    pub tokens: u64,
    pub cost: f64,
    pub errors: u32,
    pub elapsed: Duration,
    pub started_at: DateTime<Local>,
}

impl fmt::Display for RunSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "steps={} tokens={} cost=${:.4} errors={} elapsed={:.1}s",
            self.steps,
            self.tokens,
            self.cost,
            self.errors,
            self.elapsed.as_secs_f64()
        )
    }
}

// ── Decisions ──────────────────────────────────────────────────────

/// The first breached threshold, with its current and limit values.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    MaxSteps { steps: u32, limit: u32 },
    MaxTokens { tokens: u64, limit: u64 },
    MaxCost { cost: f64, limit: f64 },
    TimeLimit { elapsed: Duration, limit: Duration },
    ErrorThreshold { errors: u32, limit: u32 },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::MaxSteps { steps, limit } => {
                write!(f, "Maximum steps reached ({steps}/{limit})")
            }
            StopReason::MaxTokens { tokens, limit } => {
                write!(f, "Token limit reached ({tokens}/{limit})")
            }
            StopReason::MaxCost { cost, limit } => {
                write!(f, "Cost limit reached (${cost:.4}/${limit:.4})")
            }
            StopReason::TimeLimit { elapsed, limit } => write!(
                f,
                "Time limit reached ({}ms/{}ms)",
                elapsed.as_millis(),
                limit.as_millis()
            ),
            StopReason::ErrorThreshold { errors, limit } => {
                write!(f, "Error threshold reached ({errors}/{limit})")
            }
        }
    }
}

/// Result of [`StoppingConditionManager::should_stop`].
#[derive(Debug, Clone, PartialEq)]
pub struct StopDecision {
    pub stop: bool,
    pub reason: Option<StopReason>,
}

impl StopDecision {
    fn proceed() -> Self {
        Self {
            stop: false,
            reason: None,
        }
    }

    fn stop(reason: StopReason) -> Self {
        Self {
            stop: true,
            reason: Some(reason),
        }
    }
}

/// Result of [`StoppingConditionManager::check_success_criteria`].
#[derive(Debug, Clone, PartialEq)]
pub enum CriteriaStatus {
    Met,
    NotMet,
    /// The predicate returned an error or panicked. The message is kept
    /// for logging.
    CheckFailed(String),
}

impl CriteriaStatus {
    pub fn is_met(&self) -> bool {
        matches!(self, CriteriaStatus::Met)
    }
}

impl fmt::Display for CriteriaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CriteriaStatus::Met => f.write_str("met"),
            CriteriaStatus::NotMet => f.write_str("not met"),
            CriteriaStatus::CheckFailed(e) => write!(f, "criteria check failed: {e}"),
        }
    }
}

/// Host-supplied success predicate, evaluated against the current run.
pub type SuccessCriteria = Box<dyn Fn(&RunSnapshot) -> Result<bool, String> + Send + Sync>;

// ── Manager ────────────────────────────────────────────────────────

/// Tracks one session's consumption against its [`StopConditions`].
pub struct StoppingConditionManager {
    conditions: StopConditions,
    state: RunState,
    criteria: Option<SuccessCriteria>,
}

impl fmt::Debug for StoppingConditionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoppingConditionManager")
            .field("conditions", &self.conditions)
            .field("state", &self.state)
            .field("has_criteria", &self.criteria.is_some())
            .finish()
    }
}

impl StoppingConditionManager {
    pub fn new(conditions: StopConditions) -> Self {
        Self {
            conditions,
            state: RunState::new(),
            criteria: None,
        }
    }

    /// Install a success predicate.
    pub fn with_success_criteria(
        mut self,
        criteria: impl Fn(&RunSnapshot) -> Result<bool, String> + Send + Sync + 'static,
    ) -> Self {
        self.criteria = Some(Box::new(criteria));
        self
    }

    pub fn conditions(&self) -> &StopConditions {
        &self.conditions
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn increment_step(&mut self) {
        self.state.steps = self.state.steps.saturating_add(1);
    }

    pub fn add_tokens(&mut self, tokens: u64) {
        self.state.tokens = self.state.tokens.saturating_add(tokens);
    }

    /// Add to the accumulated cost. Negative and non-finite deltas are
    /// ignored.
    pub fn add_cost(&mut self, cost: f64) {
        if !cost.is_finite() || cost < 0.0 {
            debug!("Ignoring invalid cost delta: {cost}");
            return;
        }
        self.state.cost += cost;
    }

    pub fn increment_error(&mut self) {
        self.state.errors = self.state.errors.saturating_add(1);
    }

    /// Evaluate thresholds in priority order (steps, tokens, cost, time,
    /// errors) and report the first one breached.
    pub fn should_stop(&self) -> StopDecision {
        let c = &self.conditions;
        let s = &self.state;

        if let Some(limit) = c.max_steps
            && s.steps >= limit
        {
            return StopDecision::stop(StopReason::MaxSteps {
                steps: s.steps,
                limit,
            });
        }
        if let Some(limit) = c.max_tokens
            && s.tokens >= limit
        {
            return StopDecision::stop(StopReason::MaxTokens {
                tokens: s.tokens,
                limit,
            });
        }
        if let Some(limit) = c.max_cost
            && s.cost >= limit
        {
            return StopDecision::stop(StopReason::MaxCost {
                cost: s.cost,
                limit,
            });
        }
        if let Some(limit) = c.time_limit {
            let elapsed = s.elapsed();
            if elapsed >= limit {
                return StopDecision::stop(StopReason::TimeLimit { elapsed, limit });
            }
        }
        if let Some(limit) = c.error_threshold
            && s.errors >= limit
        {
            return StopDecision::stop(StopReason::ErrorThreshold {
                errors: s.errors,
                limit,
            });
        }

        StopDecision::proceed()
    }

    /// Run the success predicate, if any. A predicate error or panic is
    /// reported, not propagated.
    pub fn check_success_criteria(&self) -> CriteriaStatus {
        let Some(criteria) = &self.criteria else {
            return CriteriaStatus::NotMet;
        };
        let snapshot = self.snapshot();
        match catch_unwind(AssertUnwindSafe(|| criteria(&snapshot))) {
            Ok(Ok(true)) => CriteriaStatus::Met,
            Ok(Ok(false)) => CriteriaStatus::NotMet,
            Ok(Err(e)) => CriteriaStatus::CheckFailed(e),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "predicate panicked".to_string());
                debug!("Success predicate panicked: {message}");
                CriteriaStatus::CheckFailed(message)
            }
        }
    }

    /// Zero every counter and restart the clock.
    pub fn reset(&mut self) {
        self.state = RunState::new();
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            steps: self.state.steps,
            tokens: self.state.tokens,
            cost: self.state.cost,
            errors: self.state.errors,
            elapsed: self.state.elapsed(),
            started_at: self.state.started_at,
        }
    }

    /// Errors the session can still absorb before the error threshold trips.
    /// `None` when no threshold is configured.
    pub fn remaining_errors(&self) -> Option<u32> {
        self.conditions
            .error_threshold
            .map(|limit| limit.saturating_sub(self.state.errors))
    }
}

impl Default for StoppingConditionManager {
    fn default() -> Self {
        Self::new(StopConditions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn only_steps(max: u32) -> StoppingConditionManager {
        StoppingConditionManager::new(StopConditions::none().with_max_steps(max))
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = StopConditions::default();
        assert_eq!(c.max_steps, Some(20));
        assert_eq!(c.max_tokens, Some(100_000));
        assert_eq!(c.max_cost, Some(1.0));
        assert_eq!(c.time_limit, Some(Duration::from_secs(300)));
        assert_eq!(c.error_threshold, Some(5));
    }

    #[test]
    fn max_steps_reason_reports_counts() {
        let mut m = only_steps(3);
        for _ in 0..2 {
            m.increment_step();
            assert!(!m.should_stop().stop);
        }
        m.increment_step();
        let decision = m.should_stop();
        assert!(decision.stop);
        assert_eq!(
            decision.reason.map(|r| r.to_string()).as_deref(),
            Some("Maximum steps reached (3/3)")
        );
    }

    #[test]
    fn unconfigured_thresholds_never_stop() {
        let mut m = StoppingConditionManager::new(StopConditions::none());
        for _ in 0..1_000 {
            m.increment_step();
            m.increment_error();
        }
        m.add_tokens(u64::MAX);
        m.add_cost(1e9);
        assert_eq!(m.should_stop(), StopDecision::proceed());
    }

    #[test]
    fn first_breached_condition_wins() {
        let mut m = StoppingConditionManager::new(
            StopConditions::none()
                .with_max_tokens(100)
                .with_error_threshold(1),
        );
        m.add_tokens(150);
        m.increment_error();
        assert!(matches!(
            m.should_stop().reason,
            Some(StopReason::MaxTokens {
                tokens: 150,
                limit: 100
            })
        ));
    }

    #[test]
    fn cost_limit_breaches_at_equality() {
        let mut m = StoppingConditionManager::new(StopConditions::none().with_max_cost(0.5));
        m.add_cost(0.25);
        assert!(!m.should_stop().stop);
        m.add_cost(0.25);
        let reason = m.should_stop().reason.map(|r| r.to_string());
        assert_eq!(reason.as_deref(), Some("Cost limit reached ($0.5000/$0.5000)"));
    }

    #[test]
    fn token_limit_breaches_at_equality() {
        let mut m = StoppingConditionManager::new(StopConditions::none().with_max_tokens(500));
        m.add_tokens(499);
        assert!(!m.should_stop().stop);
        m.add_tokens(1);
        let decision = m.should_stop();
        assert!(decision.stop);
        assert_eq!(
            decision.reason,
            Some(StopReason::MaxTokens {
                tokens: 500,
                limit: 500
            })
        );

        let mut exact = StoppingConditionManager::new(StopConditions::none().with_max_tokens(500));
        exact.add_tokens(500);
        assert!(exact.should_stop().stop);
    }

    #[test]
    fn invalid_cost_deltas_are_ignored() {
        let mut m = StoppingConditionManager::default();
        m.add_cost(0.1);
        m.add_cost(-5.0);
        m.add_cost(f64::NAN);
        m.add_cost(f64::INFINITY);
        assert_eq!(m.state().cost, 0.1);
    }

    #[test]
    fn error_threshold_and_remaining_errors() {
        let mut m =
            StoppingConditionManager::new(StopConditions::none().with_error_threshold(2));
        assert_eq!(m.remaining_errors(), Some(2));
        m.increment_error();
        assert_eq!(m.remaining_errors(), Some(1));
        m.increment_error();
        assert_eq!(m.remaining_errors(), Some(0));
        assert_eq!(
            m.should_stop().reason.map(|r| r.to_string()).as_deref(),
            Some("Error threshold reached (2/2)")
        );
        assert_eq!(
            StoppingConditionManager::new(StopConditions::none()).remaining_errors(),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn time_limit_uses_elapsed_clock() {
        let m = StoppingConditionManager::new(
            StopConditions::none().with_time_limit(Duration::from_secs(10)),
        );
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!m.should_stop().stop);
        tokio::time::advance(Duration::from_secs(1)).await;
        let decision = m.should_stop();
        assert!(matches!(
            decision.reason,
            Some(StopReason::TimeLimit { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_zeroes_counters_and_restarts_clock() {
        let mut m = StoppingConditionManager::new(
            StopConditions::none()
                .with_max_steps(1)
                .with_time_limit(Duration::from_secs(5)),
        );
        m.increment_step();
        m.add_tokens(10);
        m.increment_error();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(m.should_stop().stop);

        m.reset();
        let snap = m.snapshot();
        assert_eq!((snap.steps, snap.tokens, snap.errors), (0, 0, 0));
        assert_eq!(snap.cost, 0.0);
        assert_eq!(snap.elapsed, Duration::ZERO);
        assert!(!m.should_stop().stop);
    }

    #[test]
    fn success_criteria_statuses() {
        assert_eq!(
            StoppingConditionManager::default().check_success_criteria(),
            CriteriaStatus::NotMet
        );

        let mut m = StoppingConditionManager::default()
            .with_success_criteria(|snap| Ok(snap.steps >= 2));
        m.increment_step();
        assert_eq!(m.check_success_criteria(), CriteriaStatus::NotMet);
        m.increment_step();
        assert!(m.check_success_criteria().is_met());

        let failing = StoppingConditionManager::default()
            .with_success_criteria(|_| Err("judge unavailable".into()));
        let status = failing.check_success_criteria();
        assert_eq!(status, CriteriaStatus::CheckFailed("judge unavailable".into()));
        assert!(status.to_string().starts_with("criteria check failed"));
    }

    #[test]
    fn panicking_criteria_is_reported_as_check_failure() {
        let m = StoppingConditionManager::default()
            .with_success_criteria(|_| panic!("judge crashed"));
        assert_eq!(
            m.check_success_criteria(),
            CriteriaStatus::CheckFailed("judge crashed".into())
        );
        // The manager stays usable afterwards.
        assert!(!m.should_stop().stop);
    }

    #[test]
    fn conditions_deserialize_with_defaults_and_null() {
        let c: StopConditions =
            serde_json::from_str(r#"{"max_steps": 3, "max_cost": null, "time_limit_ms": 1500}"#)
                .unwrap();
        assert_eq!(c.max_steps, Some(3));
        assert_eq!(c.max_cost, None);
        assert_eq!(c.time_limit, Some(Duration::from_millis(1500)));
        assert_eq!(c.max_tokens, Some(100_000));
    }
}

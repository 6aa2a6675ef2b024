//! The session governor: one agent session's trimming, stopping, retry and
//! recovery in a single place.
//!
//! A [`SessionGovernor`] does not call the model itself. The host drives it
//! one turn at a time, either manually ([`prepare_history`], [`call`],
//! [`complete_step`]) or through [`run`], which owns the loop and decides
//! when it ends.
//!
//! [`prepare_history`]: SessionGovernor::prepare_history
//! [`call`]: SessionGovernor::call
//! [`complete_step`]: SessionGovernor::complete_step
//! [`run`]: SessionGovernor::run

use super::config::GovernorConfig;
use super::events::{EventHandler, GovernorEvent, NoopHandler};
use super::stopping::{
    CriteriaStatus, RunSnapshot, StopDecision, StopReason, StoppingConditionManager,
};
use crate::Message;
use crate::context::budget::{ContextUsage, ModelBudget};
use crate::context::estimator::{DefaultEstimator, TokenEstimator};
use crate::context::trimmer::ContextTrimmer;
use crate::resilience::cancel::CancelToken;
use crate::resilience::outcome::Outcome;
use crate::resilience::recovery::{RecoveryRunner, RecoveryStrategy};
use crate::resilience::retry::{RetryPolicy, retry_with_backoff_cancellable};
use std::borrow::Cow;
use std::fmt::{self, Display};
use std::future::Future;
use tracing::debug;

// ── Turn types ─────────────────────────────────────────────────────

/// Resources one step consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepUsage {
    pub tokens: u64,
    pub cost: f64,
}

impl StepUsage {
    pub fn tokens(tokens: u64) -> Self {
        Self { tokens, cost: 0.0 }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// What a turn reports back to [`SessionGovernor::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TurnReport {
    pub usage: StepUsage,
    /// The agent produced its final answer; no further turn is needed.
    pub finished: bool,
}

impl TurnReport {
    /// The turn completed and the agent wants another one.
    pub fn proceed(usage: StepUsage) -> Self {
        Self {
            usage,
            finished: false,
        }
    }

    /// The turn completed and the agent is done.
    pub fn finished(usage: StepUsage) -> Self {
        Self {
            usage,
            finished: true,
        }
    }
}

/// Why [`SessionGovernor::run`] returned.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd<E> {
    /// Cancellation was observed.
    Aborted,
    /// A stop threshold was breached.
    Stopped(StopReason),
    /// The success predicate reported the task done.
    CriteriaMet,
    /// A turn reported itself finished.
    Finished,
    /// A turn failed with an error nothing could recover from.
    Failed(E),
}

impl<E: Display> Display for SessionEnd<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Aborted => f.write_str("aborted"),
            SessionEnd::Stopped(reason) => write!(f, "stopped: {reason}"),
            SessionEnd::CriteriaMet => f.write_str("success criteria met"),
            SessionEnd::Finished => f.write_str("finished"),
            SessionEnd::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

// ── SessionGovernor ────────────────────────────────────────────────

/// Governs one agent session.
///
/// ```ignore
/// let handler = LoggingHandler;
/// let source = CancelSource::new();
/// let mut governor = SessionGovernor::new(config, budget)
///     .with_event_handler(&handler)
///     .with_cancel_token(source.token());
///
/// let end = governor
///     .run(async |g| {
///         let history = g.prepare_history(&messages).into_owned();
///         match g.call(|| client.complete(&history)).await {
///             Outcome::Completed(reply) => Outcome::Completed(TurnReport::proceed(reply.usage)),
///             Outcome::Aborted => Outcome::Aborted,
///             Outcome::Failed(e) => Outcome::Failed(e),
///         }
///     })
///     .await;
/// ```
///
/// # Lifetimes
///
/// The event handler is borrowed for `'a`. Bind it to a `let` before
/// building the governor.
pub struct SessionGovernor<'a> {
    config: GovernorConfig,
    budget: ModelBudget,
    stopping: StoppingConditionManager,
    trimmer: ContextTrimmer<Box<dyn TokenEstimator>>,
    retry: RetryPolicy,
    events: &'a dyn EventHandler,
    cancel: CancelToken,
}

impl<'a> SessionGovernor<'a> {
    pub fn new(config: GovernorConfig, budget: ModelBudget) -> Self {
        let trimmer = boxed_trimmer(Box::new(DefaultEstimator), &config);
        Self {
            stopping: StoppingConditionManager::new(config.stop.clone()),
            retry: config.retry.to_policy(),
            trimmer,
            budget,
            config,
            events: &NoopHandler,
            cancel: CancelToken::never(),
        }
    }

    pub fn with_event_handler(mut self, handler: &'a dyn EventHandler) -> Self {
        self.events = handler;
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Replace the retry policy built from the config, e.g. to retry on a
    /// custom predicate.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Score messages with a provider-specific estimator.
    pub fn with_estimator(mut self, estimator: impl TokenEstimator + 'static) -> Self {
        self.trimmer = boxed_trimmer(Box::new(estimator), &self.config);
        self
    }

    pub fn with_success_criteria(
        mut self,
        criteria: impl Fn(&RunSnapshot) -> Result<bool, String> + Send + Sync + 'static,
    ) -> Self {
        self.stopping = self.stopping.with_success_criteria(criteria);
        self
    }

    // ── Accessors ─────────────────────────────────────────────────

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn budget(&self) -> &ModelBudget {
        &self.budget
    }

    pub fn stopping(&self) -> &StoppingConditionManager {
        &self.stopping
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.stopping.snapshot()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// How full `history` is against this session's budget.
    pub fn usage(&self, history: &[Message]) -> ContextUsage {
        ContextUsage::measure(history, &self.budget, &**self.trimmer.estimator())
    }

    // ── Per-turn operations ───────────────────────────────────────

    /// Trim `history` to the model's safe limit for the next call.
    ///
    /// The caller's history is never modified.
    pub fn prepare_history<'h>(&self, history: &'h [Message]) -> Cow<'h, [Message]> {
        let trimmed = self.trimmer.trim(history, &self.budget);
        let report = &trimmed.report;
        if report.trimmed() {
            self.events.on_event(&GovernorEvent::HistoryTrimmed {
                old_count: report.original_count,
                new_count: report.retained_count,
                tokens_freed: report.tokens_freed(),
            });
        }
        if report.over_budget {
            debug!(
                "History still over budget after trimming ({} tokens, limit {:.0})",
                report.tokens_after, report.safe_limit
            );
        }
        trimmed.messages
    }

    /// Run one unit of work with cancellable retry. A failure counts
    /// against the error threshold.
    pub async fn call<T, E, F, Fut>(&mut self, op: F) -> Outcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let outcome =
            retry_with_backoff_cancellable(&self.retry, self.events, &self.cancel, op).await;
        self.record_outcome(&outcome);
        outcome
    }

    /// Run one unit of work through `strategies`.
    ///
    /// Recovery rounds are capped at the errors the session can still
    /// absorb (and at `recovery.max_recoveries` when configured). Each
    /// recovery counts against the error threshold, as does a final
    /// failure.
    pub async fn call_with_recovery<T, E, F, Fut>(
        &mut self,
        strategies: &[RecoveryStrategy],
        op: F,
    ) -> Outcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let cap = match (
            self.config.recovery.max_recoveries,
            self.stopping.remaining_errors(),
        ) {
            (Some(configured), Some(remaining)) => Some(configured.min(remaining)),
            (configured, remaining) => configured.or(remaining),
        };
        let run = RecoveryRunner::new(strategies)
            .with_max_recoveries(cap)
            .with_events(self.events)
            .with_cancel(&self.cancel)
            .run(op)
            .await;
        for _ in 0..run.recoveries {
            self.stopping.increment_error();
        }
        self.record_outcome(&run.outcome);
        run.outcome
    }

    /// Record a finished step and decide whether the session must stop.
    pub fn complete_step(&mut self, usage: StepUsage) -> StopDecision {
        self.stopping.increment_step();
        self.stopping.add_tokens(usage.tokens);
        self.stopping.add_cost(usage.cost);

        let snapshot = self.stopping.snapshot();
        self.events
            .on_event(&GovernorEvent::StepCompleted { snapshot: &snapshot });

        let decision = self.stopping.should_stop();
        if let Some(reason) = &decision.reason {
            self.events
                .on_event(&GovernorEvent::StopConditionMet { reason });
        }
        decision
    }

    /// Evaluate the success predicate and report the result.
    pub fn check_success_criteria(&self) -> CriteriaStatus {
        let status = self.stopping.check_success_criteria();
        self.events
            .on_event(&GovernorEvent::SuccessCriteriaChecked { status: &status });
        status
    }

    /// Start the session over: counters go to zero and the clock restarts.
    pub fn restart(&mut self) {
        debug!("Session restarted after {}", self.stopping.snapshot());
        self.stopping.reset();
    }

    // ── Loop ──────────────────────────────────────────────────────

    /// Drive turns until the session ends.
    ///
    /// Before each turn the cancel token and the stop conditions are
    /// checked. After a completed turn its usage is recorded, then success
    /// criteria, the turn's own `finished` flag, and the stop decision are
    /// honoured in that order. A failed turn ends the session with its
    /// error; recoverable failures should be handled inside the turn with
    /// [`call`](Self::call) or [`call_with_recovery`](Self::call_with_recovery).
    pub async fn run<E, F>(&mut self, mut turn: F) -> SessionEnd<E>
    where
        F: AsyncFnMut(&mut Self) -> Outcome<TurnReport, E>,
        E: Display,
    {
        loop {
            if self.cancel.is_cancelled() {
                self.events.on_event(&GovernorEvent::OperationAborted);
                return SessionEnd::Aborted;
            }
            if let Some(reason) = self.stopping.should_stop().reason {
                self.events
                    .on_event(&GovernorEvent::StopConditionMet { reason: &reason });
                return SessionEnd::Stopped(reason);
            }

            let report = match turn(&mut *self).await {
                Outcome::Completed(report) => report,
                Outcome::Aborted => {
                    self.events.on_event(&GovernorEvent::OperationAborted);
                    return SessionEnd::Aborted;
                }
                Outcome::Failed(e) => {
                    let error = e.to_string();
                    self.events
                        .on_event(&GovernorEvent::OperationFailed { error: &error });
                    return SessionEnd::Failed(e);
                }
            };

            let decision = self.complete_step(report.usage);
            if self.check_success_criteria().is_met() {
                return SessionEnd::CriteriaMet;
            }
            if report.finished {
                return SessionEnd::Finished;
            }
            if let Some(reason) = decision.reason {
                return SessionEnd::Stopped(reason);
            }
        }
    }

    fn record_outcome<T, E: Display>(&mut self, outcome: &Outcome<T, E>) {
        match outcome {
            Outcome::Completed(_) => {}
            Outcome::Aborted => self.events.on_event(&GovernorEvent::OperationAborted),
            Outcome::Failed(e) => {
                self.stopping.increment_error();
                let error = e.to_string();
                self.events
                    .on_event(&GovernorEvent::OperationFailed { error: &error });
            }
        }
    }
}

fn boxed_trimmer(
    estimator: Box<dyn TokenEstimator>,
    config: &GovernorConfig,
) -> ContextTrimmer<Box<dyn TokenEstimator>> {
    ContextTrimmer::with_estimator(estimator).with_safe_limit_ratio(config.trim.safe_limit_ratio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::stopping::StopConditions;
    use crate::context::estimator::FnEstimator;
    use crate::resilience::cancel::CancelSource;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Recorder {
        fn names(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl EventHandler for Recorder {
        fn on_event(&self, event: &GovernorEvent<'_>) {
            self.0.lock().unwrap().push(event.name().to_string());
        }
    }

    fn quick_config() -> GovernorConfig {
        GovernorConfig::default()
            .with_stop_conditions(StopConditions::none())
            .with_initial_delay(Duration::from_millis(10))
    }

    #[test]
    fn prepare_history_trims_and_reports() {
        let recorder = Recorder::default();
        let governor = SessionGovernor::new(quick_config(), ModelBudget::new(200))
            .with_event_handler(&recorder)
            .with_estimator(FnEstimator::new(|m: &Message| match m.role {
                crate::MessageRole::System => 50,
                _ => 80,
            }));
        let history = vec![
            Message::system("sys"),
            Message::user("question"),
            Message::assistant_text("answer"),
        ];
        let prepared = governor.prepare_history(&history);
        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[1].as_text(), Some("answer"));
        assert_eq!(history.len(), 3);
        assert_eq!(recorder.names(), vec!["history_trimmed"]);
    }

    #[test]
    fn prepare_history_is_silent_when_nothing_evicted() {
        let recorder = Recorder::default();
        let governor = SessionGovernor::new(quick_config(), ModelBudget::new(100_000))
            .with_event_handler(&recorder);
        let history = vec![Message::user("hi")];
        assert!(matches!(governor.prepare_history(&history), Cow::Borrowed(_)));
        assert!(recorder.names().is_empty());
    }

    #[test]
    fn complete_step_reports_stop() {
        let recorder = Recorder::default();
        let config = quick_config().with_max_steps(2);
        let mut governor =
            SessionGovernor::new(config, ModelBudget::new(1_000)).with_event_handler(&recorder);
        assert!(!governor.complete_step(StepUsage::tokens(10)).stop);
        let decision = governor.complete_step(StepUsage::tokens(10).with_cost(0.01));
        assert!(decision.stop);
        assert_eq!(governor.snapshot().tokens, 20);
        assert_eq!(
            recorder.names(),
            vec!["step_completed", "step_completed", "stop_condition_met"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn call_failure_counts_as_error() {
        let mut governor =
            SessionGovernor::new(quick_config().with_retries(1), ModelBudget::new(1_000));
        let outcome: Outcome<(), String> = governor
            .call(|| async { Err("HTTP 500".to_string()) })
            .await;
        assert!(outcome.is_failed());
        assert_eq!(governor.snapshot().errors, 1);
    }

    #[tokio::test]
    async fn recovery_cap_follows_error_budget() {
        let config = quick_config().with_error_threshold(3);
        let mut governor = SessionGovernor::new(config, ModelBudget::new(1_000));
        governor.stopping.increment_error();

        let strategies = [RecoveryStrategy::matching("wait", "busy", |_: &str| async {})];
        let outcome: Outcome<(), String> = governor
            .call_with_recovery(&strategies, || async { Err("busy".to_string()) })
            .await;

        assert!(outcome.is_failed());
        // One pre-existing error, two recoveries, one final failure.
        assert_eq!(governor.snapshot().errors, 4);
        assert!(governor.stopping().should_stop().stop);
    }

    #[tokio::test]
    async fn configured_recovery_cap_applies() {
        let config = quick_config().with_max_recoveries(1);
        let mut governor = SessionGovernor::new(config, ModelBudget::new(1_000));
        let strategies = [RecoveryStrategy::matching("wait", "busy", |_: &str| async {})];
        let mut calls = 0;
        let outcome: Outcome<(), String> = governor
            .call_with_recovery(&strategies, || {
                calls += 1;
                async { Err("busy".to_string()) }
            })
            .await;
        assert!(outcome.is_failed());
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn run_stops_on_max_steps() {
        let config = quick_config().with_max_steps(3);
        let mut governor = SessionGovernor::new(config, ModelBudget::new(1_000));
        let end = governor
            .run(async |_g| {
                Outcome::<_, String>::Completed(TurnReport::proceed(StepUsage::tokens(5)))
            })
            .await;
        assert_eq!(end.to_string(), "stopped: Maximum steps reached (3/3)");
        assert_eq!(governor.snapshot().steps, 3);
    }

    #[tokio::test]
    async fn run_honours_finished_turn() {
        let mut governor = SessionGovernor::new(quick_config(), ModelBudget::new(1_000));
        let mut turns = 0;
        let end = governor
            .run(async |_g| {
                turns += 1;
                let usage = StepUsage::tokens(1);
                let report = if turns == 2 {
                    TurnReport::finished(usage)
                } else {
                    TurnReport::proceed(usage)
                };
                Outcome::<_, String>::Completed(report)
            })
            .await;
        assert_eq!(end, SessionEnd::Finished);
        assert_eq!(turns, 2);
    }

    #[tokio::test]
    async fn run_ends_when_criteria_met() {
        let mut governor = SessionGovernor::new(quick_config(), ModelBudget::new(1_000))
            .with_success_criteria(|snap| Ok(snap.tokens >= 30));
        let end = governor
            .run(async |_g| {
                Outcome::<_, String>::Completed(TurnReport::proceed(StepUsage::tokens(10)))
            })
            .await;
        assert_eq!(end, SessionEnd::CriteriaMet);
        assert_eq!(governor.snapshot().steps, 3);
    }

    #[tokio::test]
    async fn run_propagates_turn_failure() {
        let mut governor = SessionGovernor::new(quick_config(), ModelBudget::new(1_000));
        let end = governor
            .run(async |_g| Outcome::<TurnReport, _>::Failed("disk full".to_string()))
            .await;
        assert_eq!(end, SessionEnd::Failed("disk full".to_string()));
    }

    #[tokio::test]
    async fn run_aborts_when_cancelled_between_turns() {
        let source = CancelSource::new();
        let recorder = Recorder::default();
        let mut governor = SessionGovernor::new(quick_config(), ModelBudget::new(1_000))
            .with_event_handler(&recorder)
            .with_cancel_token(source.token());
        let end = governor
            .run(async |_g| {
                source.cancel();
                Outcome::<_, String>::Completed(TurnReport::proceed(StepUsage::default()))
            })
            .await;
        assert_eq!(end, SessionEnd::Aborted);
        assert_eq!(governor.snapshot().steps, 1);
        assert_eq!(
            recorder.names().last().map(String::as_str),
            Some("operation_aborted")
        );
    }

    #[tokio::test]
    async fn restart_resets_run_state() {
        let config = quick_config().with_max_steps(1);
        let mut governor = SessionGovernor::new(config, ModelBudget::new(1_000));
        governor.complete_step(StepUsage::tokens(100));
        assert!(governor.stopping().should_stop().stop);
        governor.restart();
        assert!(!governor.stopping().should_stop().stop);
        assert_eq!(governor.snapshot().tokens, 0);
    }
}

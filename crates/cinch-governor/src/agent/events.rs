//! Governor events and the handlers that observe them.
//!
//! The governor never logs decisions directly. Every trim, stop, retry and
//! recovery is reported as a [`GovernorEvent`] to an [`EventHandler`] the
//! host passes in, carrying enough fields to reconstruct why the decision
//! was made.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |
//! | Custom `impl EventHandler` | Metrics, status lines, audit trails |

use crate::agent::stopping::{CriteriaStatus, RunSnapshot, StopReason};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ── Events ─────────────────────────────────────────────────────────

/// Decisions and outcomes reported by the governor.
#[derive(Debug)]
pub enum GovernorEvent<'a> {
    /// Old messages were evicted to fit the model's safe limit.
    HistoryTrimmed {
        old_count: usize,
        new_count: usize,
        tokens_freed: usize,
    },
    /// A stop threshold was breached; the session ends after this step.
    StopConditionMet { reason: &'a StopReason },
    /// A recovery strategy matched a failure and is about to run.
    RecoveryAttempted {
        error: &'a str,
        strategy: &'a str,
        /// 1-based recovery round within the current call.
        attempt: u32,
    },
    /// A matched failure will be retried after `delay`.
    RetryScheduled {
        /// 1-based number of the retry about to happen.
        attempt: u32,
        max_retries: u32,
        delay: Duration,
        error: &'a str,
    },
    /// Cancellation was observed; the operation ended without error.
    OperationAborted,
    /// An operation failed after retries and recovery were exhausted.
    OperationFailed { error: &'a str },
    /// A step's usage was recorded.
    StepCompleted { snapshot: &'a RunSnapshot },
    /// Success criteria were evaluated after a step.
    SuccessCriteriaChecked { status: &'a CriteriaStatus },
}

impl GovernorEvent<'_> {
    /// Stable snake_case name for metrics labels and filtering.
    pub fn name(&self) -> &'static str {
        match self {
            GovernorEvent::HistoryTrimmed { .. } => "history_trimmed",
            GovernorEvent::StopConditionMet { .. } => "stop_condition_met",
            GovernorEvent::RecoveryAttempted { .. } => "recovery_attempted",
            GovernorEvent::RetryScheduled { .. } => "retry_scheduled",
            GovernorEvent::OperationAborted => "operation_aborted",
            GovernorEvent::OperationFailed { .. } => "operation_failed",
            GovernorEvent::StepCompleted { .. } => "step_completed",
            GovernorEvent::SuccessCriteriaChecked { .. } => "success_criteria_checked",
        }
    }
}

// ── Handlers ───────────────────────────────────────────────────────

/// Observer for governor events.
///
/// Handlers are called synchronously on the governor's control flow and
/// should return quickly.
///
/// # Example
///
/// ```
/// use cinch_governor::agent::events::{EventHandler, GovernorEvent};
///
/// struct StatusLine;
///
/// impl EventHandler for StatusLine {
///     fn on_event(&self, event: &GovernorEvent<'_>) {
///         if let GovernorEvent::StopConditionMet { reason } = event {
///             eprintln!("stopping: {reason}");
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &GovernorEvent<'_>) {
        let _ = event;
    }
}

impl<T: EventHandler + ?Sized> EventHandler for &T {
    fn on_event(&self, event: &GovernorEvent<'_>) {
        (**self).on_event(event);
    }
}

impl<T: EventHandler + ?Sized> EventHandler for Arc<T> {
    fn on_event(&self, event: &GovernorEvent<'_>) {
        (**self).on_event(event);
    }
}

/// Discards every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```
/// use cinch_governor::agent::events::{FnEventHandler, GovernorEvent};
///
/// let handler = FnEventHandler::new(|event: &GovernorEvent<'_>| {
///     println!("{}", event.name());
/// });
/// # let _ = handler;
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&GovernorEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&GovernorEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&GovernorEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &GovernorEvent<'_>) {
        (self.0)(event);
    }
}

/// Dispatches every event to each inner handler in registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with_if(metrics_enabled, MetricsHandler::new());
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Add a handler only when `condition` holds.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    /// Add a handler from an `Option`. `None` is a no-op.
    pub fn with_opt(self, handler: Option<impl EventHandler + 'static>) -> Self {
        match handler {
            Some(h) => self.with(h),
            None => self,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &GovernorEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &GovernorEvent<'_>) {
        match event {
            GovernorEvent::HistoryTrimmed {
                old_count,
                new_count,
                tokens_freed,
            } => {
                info!(
                    old_count,
                    new_count, tokens_freed, "Trimmed history from {old_count} to {new_count} messages"
                );
            }
            GovernorEvent::StopConditionMet { reason } => {
                info!(reason = %reason, "Stop condition met: {reason}");
            }
            GovernorEvent::RecoveryAttempted {
                error,
                strategy,
                attempt,
            } => {
                warn!(
                    error,
                    strategy, attempt, "Recovering with {strategy} (attempt {attempt}): {error}"
                );
            }
            GovernorEvent::RetryScheduled {
                attempt,
                max_retries,
                delay,
                error,
            } => {
                warn!(
                    attempt,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error,
                    "Retrying ({attempt}/{max_retries}) after {}ms: {error}",
                    delay.as_millis()
                );
            }
            GovernorEvent::OperationAborted => {
                info!("Operation aborted");
            }
            GovernorEvent::OperationFailed { error } => {
                warn!(error, "Operation failed: {error}");
            }
            GovernorEvent::StepCompleted { snapshot } => {
                debug!(
                    steps = snapshot.steps,
                    tokens = snapshot.tokens,
                    cost = snapshot.cost,
                    errors = snapshot.errors,
                    "Step completed: {snapshot}"
                );
            }
            GovernorEvent::SuccessCriteriaChecked { status } => {
                debug!(status = %status, "Success criteria {status}");
            }
        }
    }
}

//! Retry with exponential backoff.
//!
//! An operation is attempted once, then retried up to
//! [`RetryPolicy::max_retries`] more times while its error matches one of
//! the policy's [`ErrorMatcher`]s. Before retry `n` (counting from zero) the loop
//! waits `initial_delay * 2^n`. An unmatched error, or a matched error once
//! retries are exhausted, is returned immediately without waiting.

use crate::agent::events::{EventHandler, GovernorEvent};
use crate::resilience::cancel::CancelToken;
use crate::resilience::outcome::Outcome;
use std::fmt::{self, Display};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

// ── Matchers ───────────────────────────────────────────────────────

/// Decides which errors are worth retrying.
#[derive(Clone, Default)]
pub enum ErrorMatcher {
    /// Retry every error.
    #[default]
    Any,
    /// Retry errors whose message contains this text, ignoring case.
    /// Stored lowercased.
    Contains(String),
    /// Retry transient API failures: HTTP 429 and 5xx, dropped connections,
    /// timeouts. Never 400, 401, 403, 404 or 422.
    Transient,
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl ErrorMatcher {
    pub fn contains(pattern: impl Into<String>) -> Self {
        ErrorMatcher::Contains(pattern.into().to_lowercase())
    }

    pub fn predicate(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        ErrorMatcher::Predicate(Arc::new(f))
    }

    pub fn matches(&self, error: &str) -> bool {
        match self {
            ErrorMatcher::Any => true,
            ErrorMatcher::Contains(pattern) => error.to_lowercase().contains(pattern.as_str()),
            ErrorMatcher::Transient => is_transient_error(error) && !is_permanent_error(error),
            ErrorMatcher::Predicate(f) => f(error),
        }
    }
}

impl fmt::Debug for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorMatcher::Any => f.write_str("Any"),
            ErrorMatcher::Contains(p) => f.debug_tuple("Contains").field(p).finish(),
            ErrorMatcher::Transient => f.write_str("Transient"),
            ErrorMatcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Whether an error message indicates a transient (retryable) failure.
pub fn is_transient_error(error: &str) -> bool {
    let transient_statuses = ["429", "500", "502", "503", "504"];
    if transient_statuses
        .iter()
        .any(|s| error.contains(&format!("HTTP {s}")))
    {
        return true;
    }

    let lower = error.to_lowercase();
    [
        "rate limit",
        "overloaded",
        "connection reset",
        "connection refused",
        "timed out",
        "timeout",
        "broken pipe",
        "network",
    ]
    .iter()
    .any(|p| lower.contains(p))
}

/// Whether an error message is a permanent (non-retryable) failure.
pub fn is_permanent_error(error: &str) -> bool {
    if ["HTTP 400", "HTTP 401", "HTTP 403", "HTTP 404", "HTTP 422"]
        .iter()
        .any(|p| error.contains(p))
    {
        return true;
    }

    let lower = error.to_lowercase();
    ["bad request", "unauthorized", "forbidden"]
        .iter()
        .any(|p| lower.contains(p))
}

// ── Policy ─────────────────────────────────────────────────────────

/// How many times to retry, how long to wait, and which errors qualify.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = a single attempt).
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each one after.
    pub initial_delay: Duration,
    /// Checked in order; an error is retryable if any matches. Empty
    /// retries nothing.
    pub matchers: Vec<ErrorMatcher>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            matchers: vec![ErrorMatcher::Any],
        }
    }
}

impl RetryPolicy {
    /// Default delay and matcher with the given retry count.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Retry only errors `matcher` accepts.
    pub fn with_matcher(mut self, matcher: ErrorMatcher) -> Self {
        self.matchers = vec![matcher];
        self
    }

    pub fn with_matchers(mut self, matchers: impl IntoIterator<Item = ErrorMatcher>) -> Self {
        self.matchers = matchers.into_iter().collect();
        self
    }

    /// Also retry errors `matcher` accepts.
    pub fn or_matching(mut self, matcher: ErrorMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn is_retryable(&self, error: &str) -> bool {
        self.matchers.iter().any(|m| m.matches(error))
    }

    /// Delay before retry `attempt` (0-indexed). Saturates at
    /// `Duration::MAX` instead of overflowing.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    /// The delay before the next retry, or `None` if `error` must be
    /// returned now. Emits [`GovernorEvent::RetryScheduled`] when a retry is
    /// granted.
    fn schedule(&self, attempt: u32, error: &str, events: &dyn EventHandler) -> Option<Duration> {
        if attempt >= self.max_retries {
            debug!("Retries exhausted after {} attempt(s): {error}", attempt + 1);
            return None;
        }
        if !self.is_retryable(error) {
            debug!("Error not retryable: {error}");
            return None;
        }
        let delay = self.delay_for_attempt(attempt);
        events.on_event(&GovernorEvent::RetryScheduled {
            attempt: attempt + 1,
            max_retries: self.max_retries,
            delay,
            error,
        });
        Some(delay)
    }
}

// ── Retry loops ────────────────────────────────────────────────────

/// Run `op` under `policy`, returning its first success or the error that
/// ended the loop.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    events: &dyn EventHandler,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => match policy.schedule(attempt, &e.to_string(), events) {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(e),
            },
        }
    }
}

/// Like [`retry_with_backoff`], but checks `cancel` before every attempt and
/// races each backoff delay against it.
pub async fn retry_with_backoff_cancellable<T, E, F, Fut>(
    policy: &RetryPolicy,
    events: &dyn EventHandler,
    cancel: &CancelToken,
    mut op: F,
) -> Outcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Outcome::Aborted;
        }
        match op().await {
            Ok(v) => return Outcome::Completed(v),
            Err(e) => match policy.schedule(attempt, &e.to_string(), events) {
                Some(delay) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Outcome::Aborted,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                None => return Outcome::Failed(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::{FnEventHandler, NoopHandler};
    use crate::resilience::cancel::CancelSource;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn failing(calls: &AtomicU32, error: &'static str) -> impl Future<Output = Result<u32, String>> {
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Err(error.to_string()) }
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(1000));
        assert!(matches!(policy.matchers.as_slice(), [ErrorMatcher::Any]));
    }

    #[test]
    fn delay_doubles_without_cap() {
        let policy = RetryPolicy::default().with_initial_delay(Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1600));
        assert_eq!(policy.delay_for_attempt(200), Duration::MAX);
    }

    #[test]
    fn contains_matcher_ignores_case() {
        let m = ErrorMatcher::contains("Rate Limit");
        assert!(m.matches("429: RATE LIMIT exceeded"));
        assert!(!m.matches("invalid api key"));
    }

    #[test]
    fn transient_matcher() {
        let m = ErrorMatcher::Transient;
        assert!(m.matches("provider HTTP 429: rate limited"));
        assert!(m.matches("provider HTTP 503: unavailable"));
        assert!(m.matches("request failed: connection reset by peer"));
        assert!(m.matches("operation timed out"));
        assert!(!m.matches("provider HTTP 400: bad request"));
        assert!(!m.matches("provider HTTP 401: unauthorized"));
        assert!(!m.matches("HTTP 404 timeout page"));
        assert!(!m.matches("some random error"));
    }

    #[test]
    fn predicate_matcher() {
        let m = ErrorMatcher::predicate(|e| e.len() > 3);
        assert!(m.matches("long"));
        assert!(!m.matches("no"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_means_one_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::with_retries(0);
        let result = retry_with_backoff(&policy, &NoopHandler, || failing(&calls, "boom")).await;
        assert_eq!(result, Err("boom".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unmatched_error_propagates_without_delay() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default().with_matcher(ErrorMatcher::contains("rate limit"));
        let start = Instant::now();
        let result =
            retry_with_backoff(&policy, &NoopHandler, || failing(&calls, "invalid request")).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn any_matcher_in_the_set_qualifies() {
        let policy = RetryPolicy::default()
            .with_matcher(ErrorMatcher::contains("rate limit"))
            .or_matching(ErrorMatcher::contains("timeout"));
        assert!(policy.is_retryable("Rate limit hit"));
        assert!(policy.is_retryable("upstream timeout"));
        assert!(!policy.is_retryable("invalid api key"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_matcher_grants_retry() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::with_retries(1)
            .with_initial_delay(Duration::from_millis(10))
            .with_matchers([
                ErrorMatcher::contains("rate limit"),
                ErrorMatcher::contains("timeout"),
            ]);
        let result =
            retry_with_backoff(&policy, &NoopHandler, || failing(&calls, "read timeout")).await;
        assert_eq!(result, Err("read timeout".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_matcher_set_retries_nothing() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default().with_matchers(Vec::new());
        let start = Instant::now();
        let result =
            retry_with_backoff(&policy, &NoopHandler, || failing(&calls, "HTTP 503")).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn matched_errors_back_off_exponentially() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::with_retries(3).with_initial_delay(Duration::from_millis(100));
        let start = Instant::now();
        let result: Result<(), String> = retry_with_backoff(&policy, &NoopHandler, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("flaky attempt {n}")) }
        })
        .await;
        // Exhaustion surfaces the last error, not the first.
        assert_eq!(result, Err("flaky attempt 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 100 + 200 + 400
        assert_eq!(start.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result: Result<&str, String> = retry_with_backoff(&policy, &NoopHandler, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("HTTP 503".to_string())
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_events_report_attempt_and_delay() {
        let seen = Mutex::new(Vec::new());
        let handler = FnEventHandler::new(|event: &GovernorEvent<'_>| {
            if let GovernorEvent::RetryScheduled {
                attempt,
                max_retries,
                delay,
                ..
            } = event
            {
                seen.lock().unwrap().push((*attempt, *max_retries, *delay));
            }
        });
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::with_retries(2).with_initial_delay(Duration::from_millis(10));
        let _ = retry_with_backoff(&policy, &handler, || failing(&calls, "x")).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (1, 2, Duration::from_millis(10)),
                (2, 2, Duration::from_millis(20)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_aborts() {
        let source = CancelSource::new();
        let token = source.token();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::with_retries(5).with_initial_delay(Duration::from_secs(60));

        let canceller = source.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let outcome =
            retry_with_backoff_cancellable(&policy, &NoopHandler, &token, || failing(&calls, "x"))
                .await;
        assert!(outcome.is_aborted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_never_attempts() {
        let source = CancelSource::new();
        source.cancel();
        let calls = AtomicU32::new(0);
        let outcome = retry_with_backoff_cancellable(
            &RetryPolicy::default(),
            &NoopHandler,
            &source.token(),
            || failing(&calls, "x"),
        )
        .await;
        assert!(outcome.is_aborted());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellable_reports_failure() {
        let calls = AtomicU32::new(0);
        let outcome = retry_with_backoff_cancellable(
            &RetryPolicy::with_retries(0),
            &NoopHandler,
            &CancelToken::never(),
            || failing(&calls, "fatal"),
        )
        .await;
        assert_eq!(outcome, Outcome::Failed("fatal".to_string()));
    }
}

//! Strategy-driven recovery.
//!
//! A recovery strategy pairs a predicate over an error message with an async
//! action that might make the failure go away (wait out a rate limit, trim
//! context, re-authenticate). When an operation fails, the first strategy
//! whose predicate matches runs its action and the operation is tried again.
//! The loop ends on success, when no strategy matches, or when the optional
//! recovery cap is reached; the last error is returned in both failure
//! cases.

use crate::agent::events::{EventHandler, GovernorEvent, NoopHandler};
use crate::resilience::cancel::CancelToken;
use crate::resilience::outcome::Outcome;
use crate::resilience::retry::ErrorMatcher;
use futures::future::BoxFuture;
use std::fmt::{self, Display};
use std::future::Future;
use tracing::debug;

type RecoveryAction = Box<dyn Fn(&str) -> BoxFuture<'static, ()> + Send + Sync>;

/// A named `{predicate, action}` pair.
pub struct RecoveryStrategy {
    name: String,
    matcher: ErrorMatcher,
    action: RecoveryAction,
}

impl RecoveryStrategy {
    /// A strategy that runs `action` for errors accepted by `predicate`.
    pub fn new<P, A, Fut>(name: impl Into<String>, predicate: P, action: A) -> Self
    where
        P: Fn(&str) -> bool + Send + Sync + 'static,
        A: Fn(&str) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::with_matcher(name, ErrorMatcher::predicate(predicate), action)
    }

    /// A strategy for errors containing `pattern`, ignoring case.
    pub fn matching<A, Fut>(name: impl Into<String>, pattern: &str, action: A) -> Self
    where
        A: Fn(&str) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::with_matcher(name, ErrorMatcher::contains(pattern), action)
    }

    pub fn with_matcher<A, Fut>(name: impl Into<String>, matcher: ErrorMatcher, action: A) -> Self
    where
        A: Fn(&str) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            matcher,
            action: Box::new(move |error: &str| -> BoxFuture<'static, ()> {
                Box::pin(action(error))
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, error: &str) -> bool {
        self.matcher.matches(error)
    }

    pub async fn recover(&self, error: &str) {
        (self.action)(error).await;
    }
}

impl fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryStrategy")
            .field("name", &self.name)
            .field("matcher", &self.matcher)
            .finish_non_exhaustive()
    }
}

/// Run `op` with recovery and no cap.
pub async fn execute_with_recovery<T, E, F, Fut>(
    strategies: &[RecoveryStrategy],
    events: &dyn EventHandler,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut recoveries = 0u32;
    loop {
        let error = match op().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        let message = error.to_string();
        let Some(strategy) = find_strategy(strategies, &message) else {
            return Err(error);
        };
        recoveries += 1;
        attempt_recovery(strategy, &message, recoveries, events).await;
    }
}

/// Recovery with an optional cap, an event sink and a cancellation token.
///
/// ```ignore
/// let run = RecoveryRunner::new(&strategies)
///     .with_max_recoveries(Some(3))
///     .with_events(&LoggingHandler)
///     .with_cancel(&token)
///     .run(|| client.complete(&request))
///     .await;
/// ```
pub struct RecoveryRunner<'a> {
    strategies: &'a [RecoveryStrategy],
    max_recoveries: Option<u32>,
    events: &'a dyn EventHandler,
    cancel: Option<&'a CancelToken>,
}

/// How a [`RecoveryRunner::run`] ended and how many recoveries it took.
#[derive(Debug)]
pub struct RecoveryRun<T, E> {
    pub outcome: Outcome<T, E>,
    pub recoveries: u32,
}

impl<'a> RecoveryRunner<'a> {
    pub fn new(strategies: &'a [RecoveryStrategy]) -> Self {
        Self {
            strategies,
            max_recoveries: None,
            events: &NoopHandler,
            cancel: None,
        }
    }

    /// Cap the number of recovery rounds. `None` is unbounded.
    pub fn with_max_recoveries(mut self, max: Option<u32>) -> Self {
        self.max_recoveries = max;
        self
    }

    pub fn with_events(mut self, events: &'a dyn EventHandler) -> Self {
        self.events = events;
        self
    }

    /// Check `cancel` before every attempt and race recovery actions
    /// against it.
    pub fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> RecoveryRun<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut recoveries = 0u32;
        let end = |outcome, recoveries| RecoveryRun {
            outcome,
            recoveries,
        };
        loop {
            if self.is_cancelled() {
                return end(Outcome::Aborted, recoveries);
            }
            let error = match op().await {
                Ok(v) => return end(Outcome::Completed(v), recoveries),
                Err(e) => e,
            };
            let message = error.to_string();
            let Some(strategy) = find_strategy(self.strategies, &message) else {
                return end(Outcome::Failed(error), recoveries);
            };
            if let Some(cap) = self.max_recoveries
                && recoveries >= cap
            {
                debug!("Recovery cap of {cap} reached: {message}");
                return end(Outcome::Failed(error), recoveries);
            }
            recoveries += 1;

            let action = attempt_recovery(strategy, &message, recoveries, self.events);
            match self.cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return end(Outcome::Aborted, recoveries),
                        _ = action => {}
                    }
                }
                None => action.await,
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(CancelToken::is_cancelled)
    }
}

fn find_strategy<'s>(
    strategies: &'s [RecoveryStrategy],
    error: &str,
) -> Option<&'s RecoveryStrategy> {
    let strategy = strategies.iter().find(|s| s.matches(error));
    if strategy.is_none() {
        debug!("No recovery strategy matches: {error}");
    }
    strategy
}

async fn attempt_recovery(
    strategy: &RecoveryStrategy,
    error: &str,
    attempt: u32,
    events: &dyn EventHandler,
) {
    events.on_event(&GovernorEvent::RecoveryAttempted {
        error,
        strategy: strategy.name(),
        attempt,
    });
    strategy.recover(error).await;
}

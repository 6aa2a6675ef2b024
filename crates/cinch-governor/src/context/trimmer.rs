//! FIFO context window trimming.
//!
//! When the estimated size of a history exceeds the model's safe limit
//! (80% of its context capacity), the oldest evictable messages are dropped
//! one at a time until the history fits. A leading system prompt is pinned
//! and never dropped, and at least one evictable message is always kept,
//! even if that leaves the history over budget.
//!
//! Eviction is strictly oldest-first with no relevance scoring. A history of
//! large old tool results interleaved with small recent turns is trimmed in
//! the same order as any other; a smarter policy would plug in here without
//! changing the [`ContextTrimmer::trim`] signature.

use crate::context::budget::{ModelBudget, SAFE_LIMIT_RATIO};
use crate::context::estimator::{DefaultEstimator, TokenEstimator};
use crate::{Message, MessageRole};
use std::borrow::Cow;
use tracing::trace;

/// What a trim pass did.
#[derive(Debug, Clone, PartialEq)]
pub struct TrimReport {
    pub original_count: usize,
    pub retained_count: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub safe_limit: f64,
    /// The retained history is still above the safe limit because only the
    /// pinned prefix and a single evictable message were left.
    pub over_budget: bool,
}

impl TrimReport {
    /// Whether any message was evicted.
    pub fn trimmed(&self) -> bool {
        self.retained_count < self.original_count
    }

    pub fn evicted_count(&self) -> usize {
        self.original_count - self.retained_count
    }

    pub fn tokens_freed(&self) -> usize {
        self.tokens_before.saturating_sub(self.tokens_after)
    }
}

/// A trimmed history and the report describing it.
///
/// `messages` borrows the input when nothing was evicted; callers must treat
/// it as read-only either way.
#[derive(Debug)]
pub struct Trimmed<'a> {
    pub messages: Cow<'a, [Message]>,
    pub report: TrimReport,
}

/// Keeps a history within a model's safe limit by FIFO eviction.
#[derive(Debug, Clone)]
pub struct ContextTrimmer<E = DefaultEstimator> {
    estimator: E,
    safe_limit_ratio: f64,
}

impl ContextTrimmer<DefaultEstimator> {
    pub fn new() -> Self {
        Self::with_estimator(DefaultEstimator)
    }
}

impl Default for ContextTrimmer<DefaultEstimator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: TokenEstimator> ContextTrimmer<E> {
    /// Create a trimmer that scores messages with a custom estimator.
    pub fn with_estimator(estimator: E) -> Self {
        Self {
            estimator,
            safe_limit_ratio: SAFE_LIMIT_RATIO,
        }
    }

    /// Override the fraction of the context capacity history may occupy.
    pub fn with_safe_limit_ratio(mut self, ratio: f64) -> Self {
        self.safe_limit_ratio = ratio;
        self
    }

    pub fn estimator(&self) -> &E {
        &self.estimator
    }

    pub fn safe_limit_ratio(&self) -> f64 {
        self.safe_limit_ratio
    }

    /// Trim `history` to fit `budget`.
    pub fn trim<'a>(&self, history: &'a [Message], budget: &ModelBudget) -> Trimmed<'a> {
        let safe_limit = budget.safe_limit_with(self.safe_limit_ratio);
        let tokens_before = self.estimator.estimate_all(history);

        let unchanged = |tokens: usize| Trimmed {
            messages: Cow::Borrowed(history),
            report: TrimReport {
                original_count: history.len(),
                retained_count: history.len(),
                tokens_before: tokens,
                tokens_after: tokens,
                safe_limit,
                over_budget: tokens as f64 > safe_limit,
            },
        };

        if tokens_before as f64 <= safe_limit {
            return unchanged(tokens_before);
        }

        let pinned = usize::from(
            history
                .first()
                .is_some_and(|m| m.role == MessageRole::System),
        );

        let mut total = tokens_before;
        let mut start = pinned;
        while total as f64 > safe_limit && history.len() - start > 1 {
            let cost = self.estimator.estimate(&history[start]);
            trace!("Evicting message {start} ({}, {cost} tokens)", history[start].role);
            total = total.saturating_sub(cost);
            start += 1;
        }

        if start == pinned {
            return unchanged(tokens_before);
        }

        let mut kept = Vec::with_capacity(pinned + history.len() - start);
        kept.extend_from_slice(&history[..pinned]);
        kept.extend_from_slice(&history[start..]);

        Trimmed {
            report: TrimReport {
                original_count: history.len(),
                retained_count: kept.len(),
                tokens_before,
                tokens_after: total,
                safe_limit,
                over_budget: total as f64 > safe_limit,
            },
            messages: Cow::Owned(kept),
        }
    }
}

/// Trim with the default estimator and safe-limit ratio.
pub fn trim_history<'a>(history: &'a [Message], budget: &ModelBudget) -> Cow<'a, [Message]> {
    ContextTrimmer::new().trim(history, budget).messages
}

//! Model context budgets and usage reporting.
//!
//! A [`ModelBudget`] is the context capacity of the active model, read from
//! the host's model descriptor. Capacity is never defaulted for trimming: a
//! missing or malformed capacity is a configuration error. The only place a
//! fixed capacity is allowed is [`ContextUsage::for_display`], which feeds
//! status lines and logs.

use crate::context::estimator::TokenEstimator;
use crate::{GovernorError, Message, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fraction of the context capacity the trimmer allows history to occupy.
/// The remaining 20% is kept free for the next response and tool framing.
pub const SAFE_LIMIT_RATIO: f64 = 0.8;

/// Capacity assumed by display-only estimates when no budget is known.
pub const DISPLAY_FALLBACK_CONTEXT: usize = 200_000;

/// Per-model context capacity, in tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelBudget {
    pub context: usize,
}

impl ModelBudget {
    pub fn new(context: usize) -> Self {
        Self { context }
    }

    /// Read the capacity from a model descriptor.
    ///
    /// Accepts a top-level `context` field or a nested `limit.context` field.
    /// The value must be a positive integer; anything else is rejected.
    ///
    /// ```
    /// use cinch_governor::context::ModelBudget;
    /// use serde_json::json;
    ///
    /// let budget = ModelBudget::from_descriptor(&json!({"id": "m", "context": 8192})).unwrap();
    /// assert_eq!(budget.context, 8192);
    /// assert!(ModelBudget::from_descriptor(&json!({"id": "m"})).is_err());
    /// ```
    pub fn from_descriptor(descriptor: &Value) -> Result<Self> {
        let field = descriptor
            .get("context")
            .or_else(|| descriptor.get("limit").and_then(|l| l.get("context")))
            .ok_or_else(|| GovernorError::InvalidModel("missing context capacity".into()))?;

        let context = match field {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| {
                    n.as_f64()
                        .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0)
                        .map(|f| f as u64)
                })
                .ok_or_else(|| {
                    GovernorError::InvalidModel(format!("context capacity {n} is not a whole number"))
                })?,
            other => {
                return Err(GovernorError::InvalidModel(format!(
                    "context capacity must be numeric, got {other}"
                )));
            }
        };

        if context == 0 {
            return Err(GovernorError::InvalidModel(
                "context capacity must be positive".into(),
            ));
        }

        let context = usize::try_from(context).map_err(|_| {
            GovernorError::InvalidModel(format!("context capacity {context} is too large"))
        })?;

        Ok(Self { context })
    }

    /// Token ceiling for retained history at the default ratio.
    pub fn safe_limit(&self) -> f64 {
        self.safe_limit_with(SAFE_LIMIT_RATIO)
    }

    /// Token ceiling for retained history at a custom ratio.
    pub fn safe_limit_with(&self, ratio: f64) -> f64 {
        self.context as f64 * ratio
    }
}

/// Snapshot of context usage at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextUsage {
    /// Estimated tokens consumed by the history.
    pub estimated_tokens: usize,
    /// Context capacity the percentage is measured against.
    pub max_tokens: usize,
    /// Usage as a fraction (0.0 to 1.0+).
    pub usage_pct: f64,
    /// Whether `max_tokens` is the display fallback rather than a real budget.
    pub assumed_capacity: bool,
}

impl ContextUsage {
    /// Measure a history against a known budget.
    pub fn measure(
        history: &[Message],
        budget: &ModelBudget,
        estimator: &dyn TokenEstimator,
    ) -> Self {
        Self::compute(estimator.estimate_all(history), budget.context, false)
    }

    /// Display-only measurement. Falls back to [`DISPLAY_FALLBACK_CONTEXT`]
    /// when the host has no budget for the model. Never use the result for
    /// trimming decisions.
    pub fn for_display(
        history: &[Message],
        budget: Option<&ModelBudget>,
        estimator: &dyn TokenEstimator,
    ) -> Self {
        let tokens = estimator.estimate_all(history);
        match budget {
            Some(b) => Self::compute(tokens, b.context, false),
            None => Self::compute(tokens, DISPLAY_FALLBACK_CONTEXT, true),
        }
    }

    fn compute(estimated_tokens: usize, max_tokens: usize, assumed_capacity: bool) -> Self {
        let usage_pct = if max_tokens > 0 {
            estimated_tokens as f64 / max_tokens as f64
        } else {
            1.0
        };
        Self {
            estimated_tokens,
            max_tokens,
            usage_pct,
            assumed_capacity,
        }
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({:.0}% of {}{})",
            self.estimated_tokens,
            self.usage_pct * 100.0,
            self.max_tokens,
            if self.assumed_capacity { ", assumed" } else { "" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct PerMessage(usize);

    impl TokenEstimator for PerMessage {
        fn estimate(&self, _message: &Message) -> usize {
            self.0
        }
    }

    #[test]
    fn descriptor_with_top_level_context() {
        let budget = ModelBudget::from_descriptor(&json!({"context": 200_000})).unwrap();
        assert_eq!(budget.context, 200_000);
    }

    #[test]
    fn descriptor_with_nested_limit() {
        let budget =
            ModelBudget::from_descriptor(&json!({"limit": {"context": 64_000, "output": 8_000}}))
                .unwrap();
        assert_eq!(budget.context, 64_000);
    }

    #[test]
    fn descriptor_accepts_integral_float() {
        let budget = ModelBudget::from_descriptor(&json!({"context": 32000.0})).unwrap();
        assert_eq!(budget.context, 32_000);
    }

    #[test]
    fn missing_context_is_an_error() {
        let err = ModelBudget::from_descriptor(&json!({"id": "x"})).unwrap_err();
        assert!(matches!(err, GovernorError::InvalidModel(_)));
    }

    #[test]
    fn non_numeric_context_is_an_error() {
        assert!(ModelBudget::from_descriptor(&json!({"context": "128k"})).is_err());
        assert!(ModelBudget::from_descriptor(&json!({"context": null})).is_err());
        assert!(ModelBudget::from_descriptor(&json!({"context": 1.5})).is_err());
        assert!(ModelBudget::from_descriptor(&json!({"context": -4})).is_err());
        assert!(ModelBudget::from_descriptor(&json!({"context": 0})).is_err());
    }

    #[test]
    fn safe_limit_is_eighty_percent() {
        assert_eq!(ModelBudget::new(200).safe_limit(), 160.0);
        assert_eq!(ModelBudget::new(1000).safe_limit_with(0.5), 500.0);
    }

    #[test]
    fn display_usage_falls_back_without_budget() {
        let history = vec![Message::user("a"), Message::user("b")];
        let usage = ContextUsage::for_display(&history, None, &PerMessage(1_000));
        assert_eq!(usage.estimated_tokens, 2_000);
        assert_eq!(usage.max_tokens, DISPLAY_FALLBACK_CONTEXT);
        assert!(usage.assumed_capacity);
        assert!(usage.to_log_string().contains("assumed"));
    }

    #[test]
    fn measured_usage_uses_budget() {
        let history = vec![Message::user("a")];
        let usage = ContextUsage::measure(&history, &ModelBudget::new(400), &PerMessage(100));
        assert_eq!(usage.usage_pct, 0.25);
        assert!(!usage.assumed_capacity);
        assert!(usage.to_log_string().contains("25% of 400"));
    }
}

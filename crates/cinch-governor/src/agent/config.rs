//! Configuration for a [`SessionGovernor`](super::session::SessionGovernor).
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration. Durations are written in milliseconds.
//!
//! # Examples
//!
//! Defaults with a couple of builder overrides:
//!
//! ```
//! use cinch_governor::agent::config::GovernorConfig;
//!
//! let config = GovernorConfig::default()
//!     .with_max_steps(30)
//!     .with_retries(5);
//! assert_eq!(config.stop.max_steps, Some(30));
//! ```
//!
//! Loaded from JSON, with unset fields keeping their defaults:
//!
//! ```
//! use cinch_governor::agent::config::GovernorConfig;
//!
//! let config = GovernorConfig::from_json_str(r#"{
//!     "stop": { "max_cost": null, "time_limit_ms": 60000 },
//!     "retry": { "max_retries": 1, "retry_on": [{ "contains": "rate limit" }, "transient"] }
//! }"#).unwrap();
//! assert_eq!(config.stop.max_cost, None);
//! assert_eq!(config.stop.max_steps, Some(20));
//! ```

use crate::agent::stopping::StopConditions;
use crate::context::budget::SAFE_LIMIT_RATIO;
use crate::resilience::retry::{ErrorMatcher, RetryPolicy};
use crate::{GovernorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ── Retry settings ────────────────────────────────────────────────

/// Which errors the session retries, in serializable form.
///
/// Arbitrary predicates can't be written down; install those with
/// [`SessionGovernor::with_retry_policy`](super::session::SessionGovernor::with_retry_policy).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    #[default]
    All,
    Transient,
    Contains(String),
}

impl From<&RetryOn> for ErrorMatcher {
    fn from(retry_on: &RetryOn) -> Self {
        match retry_on {
            RetryOn::All => ErrorMatcher::Any,
            RetryOn::Transient => ErrorMatcher::Transient,
            RetryOn::Contains(pattern) => ErrorMatcher::contains(pattern.as_str()),
        }
    }
}

/// Serializable form of [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,
    /// An error is retried if any entry matches. Accepts a single value or
    /// a list; an empty list retries nothing.
    #[serde(deserialize_with = "one_or_many")]
    pub retry_on: Vec<RetryOn>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            initial_delay: policy.initial_delay,
            retry_on: vec![RetryOn::All],
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: self.initial_delay,
            matchers: self.retry_on.iter().map(ErrorMatcher::from).collect(),
        }
    }
}

// ── Trim and recovery settings ────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimSettings {
    /// Fraction of the model's context the retained history may occupy.
    /// Must be in `(0, 1]`.
    pub safe_limit_ratio: f64,
}

impl Default for TrimSettings {
    fn default() -> Self {
        Self {
            safe_limit_ratio: SAFE_LIMIT_RATIO,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Recovery rounds allowed per call. The session further limits this to
    /// the errors it can still absorb. `None` leaves that as the only limit.
    pub max_recoveries: Option<u32>,
}

// ── Governor config ───────────────────────────────────────────────

/// Everything a session needs besides the model budget.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub stop: StopConditions,
    pub retry: RetrySettings,
    pub trim: TrimSettings,
    pub recovery: RecoverySettings,
}

impl GovernorConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|source| GovernorError::Parse {
            what: "governor config".into(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| GovernorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Reject values no session could run with.
    pub fn validate(&self) -> Result<()> {
        let ratio = self.trim.safe_limit_ratio;
        if !(ratio.is_finite() && ratio > 0.0 && ratio <= 1.0) {
            return Err(GovernorError::InvalidConfig(format!(
                "safe_limit_ratio must be in (0, 1], got {ratio}"
            )));
        }
        if let Some(cost) = self.stop.max_cost
            && !(cost.is_finite() && cost >= 0.0)
        {
            return Err(GovernorError::InvalidConfig(format!(
                "max_cost must be a non-negative number, got {cost}"
            )));
        }
        Ok(())
    }

    // ── Builder methods ───────────────────────────────────────────

    pub fn with_stop_conditions(mut self, stop: StopConditions) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.stop.max_steps = Some(max_steps);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.stop.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_max_cost(mut self, max_cost: f64) -> Self {
        self.stop.max_cost = Some(max_cost);
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.stop.time_limit = Some(limit);
        self
    }

    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.stop.error_threshold = Some(threshold);
        self
    }

    /// Set the retry count, keeping the delay and matcher.
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.retry.initial_delay = delay;
        self
    }

    /// Replace the retryable-error set.
    pub fn with_retry_on(mut self, retry_on: impl IntoIterator<Item = RetryOn>) -> Self {
        self.retry.retry_on = retry_on.into_iter().collect();
        self
    }

    pub fn with_safe_limit_ratio(mut self, ratio: f64) -> Self {
        self.trim.safe_limit_ratio = ratio;
        self
    }

    pub fn with_max_recoveries(mut self, max: u32) -> Self {
        self.recovery.max_recoveries = Some(max);
        self
    }
}

// ── Serde helpers ─────────────────────────────────────────────────

/// A single `RetryOn` or a list of them.
fn one_or_many<'de, D>(d: D) -> std::result::Result<Vec<RetryOn>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(RetryOn),
        Many(Vec<RetryOn>),
    }

    Ok(match OneOrMany::deserialize(d)? {
        OneOrMany::One(retry_on) => vec![retry_on],
        OneOrMany::Many(list) => list,
    })
}

/// `Duration` as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// `Option<Duration>` as integer milliseconds or `null`.
pub(crate) mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

//! Context window management: estimation, budgets, and trimming.
//!
//! 1. **[`estimator`]**: [`TokenEstimator`] costs each message. The default
//!    implementation tokenizes short texts exactly and approximates long ones.
//!
//! 2. **[`budget`]**: [`ModelBudget`] carries the model's context capacity
//!    and its 80% safe limit. [`ContextUsage`] reports how full a history is.
//!
//! 3. **[`trimmer`]**: [`ContextTrimmer`] evicts the oldest non-system
//!    messages until the history fits the safe limit.
//!
//! The [`SessionGovernor`](crate::agent::session::SessionGovernor) runs the
//! trimmer before every model call.

pub mod budget;
pub mod estimator;
pub mod trimmer;

pub use budget::{ContextUsage, DISPLAY_FALLBACK_CONTEXT, ModelBudget, SAFE_LIMIT_RATIO};
pub use estimator::{DefaultEstimator, FnEstimator, TokenEstimator, estimate_message};
pub use trimmer::{ContextTrimmer, TrimReport, Trimmed, trim_history};

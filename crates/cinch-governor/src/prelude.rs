//! Convenience re-exports for common `cinch-governor` types.
//!
//! Meant to be glob-imported by agent hosts:
//!
//! ```ignore
//! use cinch_governor::prelude::*;
//! ```
//!
//! Stream classification, the trimmer's report types, and timeout helpers
//! are left out; import those from their modules when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{ContentPart, GovernorError, Message, MessageContent, MessageRole};

// ── Session ─────────────────────────────────────────────────────────
pub use crate::agent::{
    CompositeEventHandler, CriteriaStatus, EventHandler, FnEventHandler, GovernorConfig,
    GovernorEvent, LoggingHandler, NoopHandler, RunSnapshot, SessionEnd, SessionGovernor,
    StepUsage, StopConditions, StopReason, TurnReport,
};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{ContextTrimmer, ContextUsage, ModelBudget, TokenEstimator};

// ── Resilience ──────────────────────────────────────────────────────
pub use crate::resilience::{
    CancelSource, CancelToken, ErrorMatcher, Outcome, RecoveryStrategy, RetryPolicy,
};

//! Session-level control: when to stop, what to report, and the
//! [`SessionGovernor`] that ties trimming, stopping, and recovery together.
//!
//! - [`session::SessionGovernor`]: one agent session's governor. Start here.
//! - [`config::GovernorConfig`]: stop thresholds, retry, trim, and recovery
//!   settings, loadable from JSON.
//! - [`stopping`]: [`StoppingConditionManager`] and its [`StopConditions`].
//! - [`events`]: [`EventHandler`] trait and [`GovernorEvent`] enum for
//!   observing decisions. Includes [`LoggingHandler`],
//!   [`CompositeEventHandler`], and [`FnEventHandler`].

pub mod config;
pub mod events;
pub mod session;
pub mod stopping;

pub use config::{GovernorConfig, RecoverySettings, RetryOn, RetrySettings, TrimSettings};
pub use events::{
    CompositeEventHandler, EventHandler, FnEventHandler, GovernorEvent, LoggingHandler,
    NoopHandler,
};
pub use session::{SessionEnd, SessionGovernor, StepUsage, TurnReport};
pub use stopping::{
    CriteriaStatus, RunSnapshot, RunState, StopConditions, StopDecision, StopReason,
    StoppingConditionManager, SuccessCriteria,
};

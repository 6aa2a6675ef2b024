//! Deadline wrapper for async operations.

use std::future::Future;
use std::time::Duration;

/// The operation did not finish within its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation timed out after {}ms", .0.as_millis())]
pub struct TimedOut(pub Duration);

/// Race `future` against a `limit` timer.
///
/// Whichever loses is dropped. A future that times out is abandoned
/// mid-flight, so it must tolerate being dropped at any await point.
pub async fn run_with_timeout<F: Future>(limit: Duration, future: F) -> Result<F::Output, TimedOut> {
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| TimedOut(limit))
}

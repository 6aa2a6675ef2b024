//! Failure handling around the host's async operations.
//!
//! - [`outcome`]: [`Outcome`], which keeps cancellation apart from failure.
//! - [`retry`]: exponential backoff for errors an [`ErrorMatcher`] accepts.
//! - [`cancel`]: one-shot [`CancelSource`] / [`CancelToken`] pairs and
//!   [`cancellable`] streams.
//! - [`recovery`]: ordered recovery strategies tried before giving up.
//! - [`streaming`]: classified response chunks and the SSE decoder.
//! - [`timeout`]: [`run_with_timeout`].
//!
//! Everything here is generic over the caller's error type and only needs
//! `E: Display` to match or report an error.

pub mod cancel;
pub mod outcome;
pub mod recovery;
pub mod retry;
pub mod streaming;
pub mod timeout;

pub use cancel::{CancelSource, CancelToken, cancellable};
pub use outcome::Outcome;
pub use recovery::{RecoveryRun, RecoveryRunner, RecoveryStrategy, execute_with_recovery};
pub use retry::{ErrorMatcher, RetryPolicy, retry_with_backoff, retry_with_backoff_cancellable};
pub use streaming::{
    ChunkHandler, SseDecoder, StreamChunk, StreamSummary, consume_stream, decode_sse,
};
pub use timeout::{TimedOut, run_with_timeout};

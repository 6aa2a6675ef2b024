//! Cooperative cancellation.
//!
//! A [`CancelSource`] owns the right to cancel; any number of cloned
//! [`CancelToken`]s observe it. Cancellation is one-shot: the first
//! [`CancelSource::cancel`] fires every registered callback exactly once and
//! later calls do nothing. A callback registered after cancellation runs
//! immediately.
//!
//! The readiness signal is a `tokio_util` [`CancellationToken`], so a token
//! can be awaited inside `tokio::select!` next to any other future.

use futures::stream::FusedStream;
use futures::{Stream, StreamExt};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::trace;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CallbackState {
    cancelled: bool,
    callbacks: Vec<Callback>,
}

struct Shared {
    signal: CancellationToken,
    state: Mutex<CallbackState>,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            signal: CancellationToken::new(),
            state: Mutex::new(CallbackState::default()),
        })
    }
}

/// The cancelling side. Cloning shares the same signal.
#[derive(Clone)]
pub struct CancelSource {
    shared: Arc<Shared>,
}

impl CancelSource {
    pub fn new() -> Self {
        Self {
            shared: Shared::new(),
        }
    }

    /// A token observing this source.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Cancel and fire callbacks. Returns `false` if already cancelled.
    ///
    /// Callbacks run on the calling thread after the internal lock is
    /// released, so a callback may register further callbacks or inspect
    /// the token.
    pub fn cancel(&self) -> bool {
        let callbacks = {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if state.cancelled {
                return false;
            }
            state.cancelled = true;
            self.shared.signal.cancel();
            std::mem::take(&mut state.callbacks)
        };
        trace!("Cancelled, firing {} callback(s)", callbacks.len());
        for callback in callbacks {
            callback();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.signal.is_cancelled()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSource")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// The observing side of a [`CancelSource`].
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    /// A token whose source has been dropped; it is never cancelled.
    pub fn never() -> Self {
        CancelSource::new().token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.signal.is_cancelled()
    }

    /// Resolves once the source is cancelled.
    pub async fn cancelled(&self) {
        self.shared.signal.cancelled().await;
    }

    /// Run `callback` once on cancellation, or right now if already
    /// cancelled.
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if state.cancelled {
            drop(state);
            callback();
            return;
        }
        state.callbacks.push(Box::new(callback));
    }

    /// The underlying readiness signal, for APIs that take a
    /// `CancellationToken` directly.
    pub fn as_cancellation_token(&self) -> &CancellationToken {
        &self.shared.signal
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::never()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Wrap a stream so it ends cleanly once `token` is cancelled.
///
/// The token is checked before every element, and a pending `next()` is
/// raced against cancellation. Elements the inner stream has buffered are
/// discarded. Polling after the end keeps yielding `None`.
pub fn cancellable<S>(stream: S, token: CancelToken) -> impl FusedStream<Item = S::Item>
where
    S: Stream,
{
    futures::stream::unfold(
        (Box::pin(stream), token),
        |(mut stream, token)| async move {
            if token.is_cancelled() {
                return None;
            }
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                item = stream.next() => item,
            };
            next.map(|item| (item, (stream, token)))
        },
    )
    .fuse()
}

//! `AsyncPromise`: a cloneable handle to a cancellable asynchronous result.

use crate::error::{PromiseError, Rejection};
use crate::state::{PromiseState, Shared, WakerKey};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tether_core::{Disposable, PromiseStatus};

/// Asynchronous result with external cancellation.
///
/// Clones share the same state. The first of `set_result`, `set_error` and
/// `cancel` wins; later calls return `false` and change nothing.
///
/// ```ignore
/// let promise = AsyncPromise::new();
/// promise.on_success(|v: &u32| tracing::info!(v, "done"));
/// worker.submit(promise.clone());
/// let value = promise.blocking_get(Some(Duration::from_secs(5)))?;
/// ```
pub struct AsyncPromise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for AsyncPromise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for AsyncPromise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> AsyncPromise<T> {
    pub fn new() -> Self {
        Self::with_state(PromiseState::Pending)
    }

    /// An already-fulfilled promise.
    pub fn resolved(value: T) -> Self {
        Self::with_state(PromiseState::Fulfilled(value))
    }

    pub fn rejected(reason: Rejection) -> Self {
        Self::with_state(PromiseState::Rejected(reason))
    }

    pub fn cancelled() -> Self {
        Self::with_state(PromiseState::Cancelled)
    }

    fn with_state(state: PromiseState<T>) -> Self {
        Self {
            shared: Arc::new(Shared::new(state)),
        }
    }

    // -- Transitions --

    pub fn set_result(&self, value: T) -> bool {
        let applied = self.shared.complete(PromiseState::Fulfilled(value));
        if !applied {
            tracing::trace!(status = ?self.status(), "late result ignored");
        }
        applied
    }

    pub fn set_error(&self, error: impl std::error::Error + Send + Sync + 'static) -> bool {
        self.reject(Arc::new(error))
    }

    pub fn reject(&self, reason: Rejection) -> bool {
        self.shared.complete(PromiseState::Rejected(reason))
    }

    /// Moves a pending promise to `Cancelled`. No effect once terminal.
    pub fn cancel(&self) -> bool {
        let applied = self.shared.complete(PromiseState::Cancelled);
        if applied {
            tracing::trace!("promise cancelled");
        }
        applied
    }

    // -- Queries --

    pub fn status(&self) -> PromiseStatus {
        self.shared.inner.lock().state.status()
    }

    pub fn is_done(&self) -> bool {
        self.status().is_done()
    }

    pub fn is_succeeded(&self) -> bool {
        self.status() == PromiseStatus::Succeeded
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == PromiseStatus::Cancelled
    }

    /// The outcome if terminal, without blocking.
    pub fn try_get(&self) -> Option<Result<T, PromiseError>> {
        self.shared.inner.lock().state.outcome()
    }

    /// Blocks until terminal or until `timeout` elapses. A timeout too large
    /// to express as a deadline waits without one.
    pub fn blocking_get(&self, timeout: Option<Duration>) -> Result<T, PromiseError> {
        let mut inner = self.shared.inner.lock();
        if let Some(outcome) = inner.state.outcome() {
            return outcome;
        }
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t).map(|at| (t, at)));
        loop {
            match deadline {
                None => self.shared.done.wait(&mut inner),
                Some((timeout, at)) => {
                    if self.shared.done.wait_until(&mut inner, at).timed_out() {
                        return inner
                            .state
                            .outcome()
                            .unwrap_or(Err(PromiseError::Timeout(timeout)));
                    }
                }
            }
            if let Some(outcome) = inner.state.outcome() {
                return outcome;
            }
        }
    }

    // -- Callbacks --

    /// Runs `f` with the value once fulfilled (immediately if it already is).
    pub fn on_success(&self, f: impl FnOnce(&T) + Send + 'static) -> &Self {
        self.shared.subscribe(Box::new(move |outcome: &Result<T, PromiseError>| {
            if let Ok(value) = outcome {
                f(value);
            }
        }));
        self
    }

    /// Runs `f` on rejection or cancellation.
    pub fn on_error(&self, f: impl FnOnce(&PromiseError) + Send + 'static) -> &Self {
        self.shared.subscribe(Box::new(move |outcome: &Result<T, PromiseError>| {
            if let Err(error) = outcome {
                f(error);
            }
        }));
        self
    }

    /// Runs `f` on any terminal outcome.
    pub fn on_processed(
        &self,
        f: impl FnOnce(&Result<T, PromiseError>) + Send + 'static,
    ) -> &Self {
        self.shared.subscribe(Box::new(f));
        self
    }

    /// Moves this promise's outcome into `target` once terminal.
    pub fn forward_to(&self, target: &AsyncPromise<T>) {
        let target = target.clone();
        self.on_processed(move |outcome| {
            target.complete_with(outcome.clone());
        });
    }

    pub(crate) fn complete_with(&self, outcome: Result<T, PromiseError>) -> bool {
        match outcome {
            Ok(value) => self.set_result(value),
            Err(PromiseError::Cancelled) => self.cancel(),
            Err(PromiseError::Rejected(reason)) => self.reject(reason),
            Err(PromiseError::Timeout(t)) => self.set_error(PromiseError::Timeout(t)),
        }
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for AsyncPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncPromise")
            .field("status", &self.status())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Async waiting
// ---------------------------------------------------------------------------

/// Future resolving to the promise's outcome.
///
/// Dropping the future before completion unregisters its waker.
pub struct PromiseFuture<T> {
    shared: Arc<Shared<T>>,
    slot: Option<WakerKey>,
}

impl<T: Clone + Send + 'static> Future for PromiseFuture<T> {
    type Output = Result<T, PromiseError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.shared.poll_outcome(cx.waker(), &mut this.slot) {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

impl<T> Drop for PromiseFuture<T> {
    fn drop(&mut self) {
        if let Some(key) = self.slot.take() {
            self.shared.forget_waker(key);
        }
    }
}

impl<T: Clone + Send + 'static> IntoFuture for AsyncPromise<T> {
    type Output = Result<T, PromiseError>;
    type IntoFuture = PromiseFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        PromiseFuture {
            shared: self.shared,
            slot: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Disposal hook
// ---------------------------------------------------------------------------

/// Cancels the wrapped promise when disposed.
pub struct CancelOnDispose<T> {
    promise: AsyncPromise<T>,
}

impl<T: Clone + Send + 'static> CancelOnDispose<T> {
    pub fn new(promise: &AsyncPromise<T>) -> Arc<Self> {
        Arc::new(Self {
            promise: promise.clone(),
        })
    }
}

impl<T: Clone + Send + 'static> Disposable for CancelOnDispose<T> {
    fn dispose(&self) {
        self.promise.cancel();
    }

    fn debug_name(&self) -> String {
        format!("CancelOnDispose({:?})", self.promise.status())
    }
}

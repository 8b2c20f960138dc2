//! Promise state machine.
//!
//! `Pending` is the only non-terminal state. Every transition goes through
//! [`Shared::complete`], which holds the lock only long enough to swap the
//! state and take the pending callbacks and wakers; they run afterwards.

use crate::error::{PromiseError, Rejection};
use parking_lot::{Condvar, Mutex};
use slotmap::{new_key_type, SlotMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::task::Waker;
use tether_core::{panic_message, PromiseStatus};

new_key_type! {
    /// Slot of one future's waker; removed when that future is dropped.
    pub(crate) struct WakerKey;
}

pub(crate) type Callback<T> = Box<dyn FnOnce(&Result<T, PromiseError>) + Send>;

pub(crate) enum PromiseState<T> {
    Pending,
    Fulfilled(T),
    Rejected(Rejection),
    Cancelled,
}

impl<T: Clone> PromiseState<T> {
    pub(crate) fn status(&self) -> PromiseStatus {
        match self {
            Self::Pending => PromiseStatus::Pending,
            Self::Fulfilled(_) => PromiseStatus::Succeeded,
            Self::Rejected(_) => PromiseStatus::Rejected,
            Self::Cancelled => PromiseStatus::Cancelled,
        }
    }

    /// `None` while pending.
    pub(crate) fn outcome(&self) -> Option<Result<T, PromiseError>> {
        match self {
            Self::Pending => None,
            Self::Fulfilled(v) => Some(Ok(v.clone())),
            Self::Rejected(e) => Some(Err(PromiseError::Rejected(e.clone()))),
            Self::Cancelled => Some(Err(PromiseError::Cancelled)),
        }
    }
}

pub(crate) struct Inner<T> {
    pub(crate) state: PromiseState<T>,
    callbacks: Vec<Callback<T>>,
    wakers: SlotMap<WakerKey, Waker>,
}

pub(crate) struct Shared<T> {
    pub(crate) inner: Mutex<Inner<T>>,
    pub(crate) done: Condvar,
}

impl<T: Clone + Send + 'static> Shared<T> {
    pub(crate) fn new(state: PromiseState<T>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                callbacks: Vec::new(),
                wakers: SlotMap::with_key(),
            }),
            done: Condvar::new(),
        }
    }

    /// The single mutation point. Returns `false` if already terminal.
    pub(crate) fn complete(&self, next: PromiseState<T>) -> bool {
        let (callbacks, wakers, outcome) = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, PromiseState::Pending) {
                return false;
            }
            inner.state = next;
            let callbacks = std::mem::take(&mut inner.callbacks);
            let wakers = std::mem::take(&mut inner.wakers);
            let outcome = if callbacks.is_empty() {
                None
            } else {
                inner.state.outcome()
            };
            (callbacks, wakers, outcome)
        };

        self.done.notify_all();
        for waker in wakers.into_iter().map(|(_, w)| w) {
            waker.wake();
        }
        if let Some(outcome) = outcome {
            for callback in callbacks {
                run_callback(callback, &outcome);
            }
        }
        true
    }

    /// Runs `callback` now if terminal, otherwise queues it.
    pub(crate) fn subscribe(&self, callback: Callback<T>) {
        let outcome = {
            let mut inner = self.inner.lock();
            match inner.state.outcome() {
                Some(outcome) => outcome,
                None => {
                    inner.callbacks.push(callback);
                    return;
                }
            }
        };
        run_callback(callback, &outcome);
    }

    /// Returns the outcome if terminal. Otherwise stores `waker` in the
    /// caller's slot, reusing the slot across polls.
    pub(crate) fn poll_outcome(
        &self,
        waker: &Waker,
        slot: &mut Option<WakerKey>,
    ) -> Option<Result<T, PromiseError>> {
        let mut inner = self.inner.lock();
        if let Some(outcome) = inner.state.outcome() {
            *slot = None;
            return Some(outcome);
        }
        match slot.and_then(|key| inner.wakers.get_mut(key)) {
            Some(stored) => {
                if !stored.will_wake(waker) {
                    *stored = waker.clone();
                }
            }
            None => *slot = Some(inner.wakers.insert(waker.clone())),
        }
        None
    }
}

impl<T> Shared<T> {
    /// Drops a waker whose future went away before completion.
    pub(crate) fn forget_waker(&self, key: WakerKey) {
        self.inner.lock().wakers.remove(key);
    }

    #[cfg(test)]
    pub(crate) fn waker_count(&self) -> usize {
        self.inner.lock().wakers.len()
    }
}

fn run_callback<T>(callback: Callback<T>, outcome: &Result<T, PromiseError>) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
        let message = panic_message(payload.as_ref());
        tracing::warn!(error = %message, "promise callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn only_first_transition_wins() {
        let shared = Shared::new(PromiseState::Pending);
        assert!(shared.complete(PromiseState::Cancelled));
        assert!(!shared.complete(PromiseState::Fulfilled(1)));
        assert_eq!(shared.inner.lock().state.status(), PromiseStatus::Cancelled);
    }

    #[test]
    fn queued_callbacks_run_once_after_completion() {
        let shared = Shared::new(PromiseState::Pending);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let h = hits.clone();
            shared.subscribe(Box::new(move |r: &Result<u32, PromiseError>| {
                assert_eq!(*r.as_ref().unwrap(), 7);
                h.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        shared.complete(PromiseState::Fulfilled(7));
        shared.complete(PromiseState::Fulfilled(8));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_callback_does_not_block_others() {
        let shared = Shared::new(PromiseState::Pending);
        let hits = Arc::new(AtomicUsize::new(0));
        shared.subscribe(Box::new(|_: &Result<(), PromiseError>| panic!("bad listener")));
        let h = hits.clone();
        shared.subscribe(Box::new(move |_: &Result<(), PromiseError>| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(shared.complete(PromiseState::Fulfilled(())));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

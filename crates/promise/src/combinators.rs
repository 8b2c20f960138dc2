//! Derived promises.
//!
//! Rejection and cancellation flow downstream only: cancelling a derived
//! promise never touches its source.

use crate::error::{rejection, PromiseError};
use crate::promise::AsyncPromise;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

impl<T: Clone + Send + 'static> AsyncPromise<T> {
    /// Maps the fulfilled value. A panic in `f` rejects the derived promise.
    pub fn then<U, F>(&self, f: F) -> AsyncPromise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let derived = AsyncPromise::new();
        let target = derived.clone();
        self.on_processed(move |outcome: &Result<T, PromiseError>| match outcome {
            Ok(value) => {
                let value = value.clone();
                match catch_unwind(AssertUnwindSafe(move || f(value))) {
                    Ok(mapped) => {
                        target.set_result(mapped);
                    }
                    Err(_) => {
                        target.reject(rejection("then() callback panicked"));
                    }
                }
            }
            Err(error) => {
                propagate(&target, error);
            }
        });
        derived
    }

    /// Chains a promise-returning step.
    pub fn then_async<U, F>(&self, f: F) -> AsyncPromise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> AsyncPromise<U> + Send + 'static,
    {
        let derived = AsyncPromise::new();
        let target = derived.clone();
        self.on_processed(move |outcome: &Result<T, PromiseError>| match outcome {
            Ok(value) => {
                let value = value.clone();
                match catch_unwind(AssertUnwindSafe(move || f(value))) {
                    Ok(next) => next.forward_to(&target),
                    Err(_) => {
                        target.reject(rejection("then_async() callback panicked"));
                    }
                }
            }
            Err(error) => {
                propagate(&target, error);
            }
        });
        derived
    }
}

fn propagate<U: Clone + Send + 'static>(target: &AsyncPromise<U>, error: &PromiseError) {
    match error {
        PromiseError::Cancelled => {
            target.cancel();
        }
        PromiseError::Rejected(reason) => {
            target.reject(reason.clone());
        }
        PromiseError::Timeout(_) => {
            target.set_error(error.clone());
        }
    }
}

/// All-of: fulfills with every value in input order once all inputs are
/// fulfilled. The first rejection or cancellation completes the aggregate.
pub fn collect_results<T: Clone + Send + 'static>(
    promises: Vec<AsyncPromise<T>>,
) -> AsyncPromise<Vec<T>> {
    if promises.is_empty() {
        return AsyncPromise::resolved(Vec::new());
    }

    struct Gather<T> {
        slots: Vec<Option<T>>,
        remaining: usize,
    }

    let aggregate = AsyncPromise::new();
    let gather = Arc::new(Mutex::new(Gather {
        slots: vec![None; promises.len()],
        remaining: promises.len(),
    }));

    for (index, promise) in promises.iter().enumerate() {
        let gather = gather.clone();
        let aggregate = aggregate.clone();
        promise.on_processed(move |outcome: &Result<T, PromiseError>| match outcome {
            Ok(value) => {
                let finished = {
                    let mut g = gather.lock();
                    g.slots[index] = Some(value.clone());
                    g.remaining -= 1;
                    if g.remaining == 0 {
                        Some(g.slots.drain(..).flatten().collect::<Vec<T>>())
                    } else {
                        None
                    }
                };
                if let Some(values) = finished {
                    aggregate.set_result(values);
                }
            }
            Err(error) => propagate(&aggregate, error),
        });
    }
    aggregate
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::PromiseStatus;

    #[test]
    fn then_maps_value() {
        let source = AsyncPromise::new();
        let doubled = source.then(|v: u32| v * 2);
        assert!(!doubled.is_done());
        source.set_result(21);
        assert_eq!(doubled.blocking_get(None).unwrap(), 42);
    }

    #[test]
    fn cancellation_flows_downstream_only() {
        let source: AsyncPromise<u32> = AsyncPromise::new();
        let derived = source.then(|v| v + 1);
        derived.cancel();
        assert_eq!(source.status(), PromiseStatus::Pending);

        let other = source.then(|v| v + 1);
        source.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn panic_in_then_rejects() {
        let derived = AsyncPromise::resolved(1u8).then(|_| -> u8 { panic!("mapper failed") });
        assert_eq!(derived.status(), PromiseStatus::Rejected);
    }

    #[test]
    fn then_async_flattens() {
        let inner: AsyncPromise<String> = AsyncPromise::new();
        let inner2 = inner.clone();
        let chained = AsyncPromise::resolved(7u32).then_async(move |_| inner2);
        assert!(!chained.is_done());
        inner.set_result("seven".into());
        assert_eq!(chained.blocking_get(None).unwrap(), "seven");
    }

    #[test]
    fn collect_preserves_input_order() {
        let ps: Vec<AsyncPromise<usize>> = (0..4).map(|_| AsyncPromise::new()).collect();
        let all = collect_results(ps.clone());
        for i in [3, 1, 0, 2] {
            ps[i].set_result(i * 10);
        }
        assert_eq!(all.blocking_get(None).unwrap(), vec![0, 10, 20, 30]);
    }

    #[test]
    fn collect_fails_fast() {
        let ps: Vec<AsyncPromise<u8>> = (0..3).map(|_| AsyncPromise::new()).collect();
        let all = collect_results(ps.clone());
        ps[1].reject(rejection("nope"));
        assert_eq!(all.status(), PromiseStatus::Rejected);
        ps[0].set_result(1);
        ps[2].set_result(2);
        assert_eq!(all.status(), PromiseStatus::Rejected);
    }

    #[test]
    fn collect_empty_is_resolved() {
        let all = collect_results::<u8>(Vec::new());
        assert_eq!(all.blocking_get(None).unwrap(), Vec::<u8>::new());
    }
}

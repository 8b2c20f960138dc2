//! Resolution vs. cancellation races across threads.

use std::future::IntoFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tether_core::PromiseStatus;
use tether_promise::{AsyncPromise, PromiseError};

#[test]
fn exactly_one_completion_wins_under_contention() {
    for _ in 0..200 {
        let promise: AsyncPromise<usize> = AsyncPromise::new();
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        promise.on_processed(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        });

        let barrier = Arc::new(Barrier::new(4));
        let wins = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let p = promise.clone();
                let b = barrier.clone();
                let w = wins.clone();
                std::thread::spawn(move || {
                    b.wait();
                    let won = if i % 2 == 0 { p.cancel() } else { p.set_result(i) };
                    if won {
                        w.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert!(matches!(
            promise.status(),
            PromiseStatus::Cancelled | PromiseStatus::Succeeded
        ));
    }
}

#[test]
fn many_waiters_observe_the_same_outcome() {
    let promise: AsyncPromise<String> = AsyncPromise::new();
    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let p = promise.clone();
            std::thread::spawn(move || p.blocking_get(Some(Duration::from_secs(5))))
        })
        .collect();

    std::thread::sleep(Duration::from_millis(10));
    promise.set_result("shared".to_string());

    for w in waiters {
        assert_eq!(w.join().unwrap().unwrap(), "shared");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_and_blocking_waiters_mix() {
    let promise: AsyncPromise<u32> = AsyncPromise::new();
    let blocking = {
        let p = promise.clone();
        tokio::task::spawn_blocking(move || p.blocking_get(None))
    };
    let awaiting = tokio::spawn(promise.clone().into_future());

    promise.cancel();

    assert!(matches!(
        blocking.await.unwrap(),
        Err(PromiseError::Cancelled)
    ));
    assert!(matches!(awaiting.await.unwrap(), Err(PromiseError::Cancelled)));
}

//! The dedicated write thread.
//!
//! Write actions are queued over an unbounded channel and executed one at a
//! time under the rule's exclusive lock. Each action resolves the promise
//! returned by [`WriteThread::push_write_action`]; a panic rejects it, and
//! anything still queued at shutdown is cancelled.

use crate::rule::AccessRule;
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tether_core::{panic_message, TetherError, TetherResult};
use tether_promise::{rejection, AsyncPromise, PromiseError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

trait WriteJob: Send {
    fn run(self: Box<Self>, rule: &AccessRule, stats: &WriteCounters);
    fn cancel(self: Box<Self>);
}

struct PushedAction<T, F> {
    promise: AsyncPromise<T>,
    action: F,
}

impl<T, F> WriteJob for PushedAction<T, F>
where
    T: Clone + Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    fn run(self: Box<Self>, rule: &AccessRule, stats: &WriteCounters) {
        let PushedAction { promise, action } = *self;
        if promise.is_done() {
            // Cancelled by the caller while queued.
            stats.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match catch_unwind(AssertUnwindSafe(|| rule.run_write_action(action))) {
            Ok(Ok(value)) => {
                stats.completed.fetch_add(1, Ordering::Relaxed);
                promise.set_result(value);
            }
            Ok(Err(error)) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                promise.set_error(error);
            }
            Err(payload) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                let message = panic_message(payload.as_ref());
                warn!(%message, "write action panicked");
                promise.reject(rejection(format!("write action panicked: {message}")));
            }
        }
    }

    fn cancel(self: Box<Self>) {
        self.promise.cancel();
    }
}

enum Message {
    Run(Box<dyn WriteJob>),
    Stop,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct WriteCounters {
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    cancelled: AtomicU64,
}

/// Point-in-time view of the write queue.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WriteStats {
    pub queued: u64,
    pub completed: u64,
    /// Actions that panicked or were refused by the access rule.
    pub failed: u64,
    /// Actions whose promise was already cancelled when their turn came.
    pub skipped: u64,
    /// Actions cancelled by shutdown.
    pub cancelled: u64,
}

// ---------------------------------------------------------------------------
// WriteThread
// ---------------------------------------------------------------------------

pub struct WriteThread {
    rule: Arc<AccessRule>,
    sender: UnboundedSender<Message>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
    counters: Arc<WriteCounters>,
}

impl WriteThread {
    /// Spawns the write thread and binds it to `rule`. The thread is named
    /// after the rule's `write_thread_name`.
    pub fn start(rule: Arc<AccessRule>) -> TetherResult<Self> {
        let (sender, receiver) = unbounded_channel();
        let counters = Arc::new(WriteCounters::default());
        let stopped = Arc::new(AtomicBool::new(false));
        let name = rule.config().write_thread_name.clone();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn({
                let rule = rule.clone();
                let counters = counters.clone();
                let stopped = stopped.clone();
                move || write_loop(&rule, receiver, &counters, &stopped)
            })
            .map_err(|e| TetherError::Internal(format!("spawning write thread: {e}")))?;

        info!(thread = %name, "write thread started");
        Ok(Self {
            rule,
            sender,
            handle: Mutex::new(Some(handle)),
            stopped,
            counters,
        })
    }

    pub fn rule(&self) -> &Arc<AccessRule> {
        &self.rule
    }

    /// Queues `action` to run under exclusive access. The promise resolves
    /// with its value, is rejected if it panics, and is cancelled if the
    /// thread has been shut down.
    pub fn push_write_action<T, F>(&self, action: F) -> AsyncPromise<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let promise = AsyncPromise::new();
        if self.stopped.load(Ordering::SeqCst) {
            debug!("write action pushed after shutdown");
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            promise.cancel();
            return promise;
        }

        let job = Box::new(PushedAction {
            promise: promise.clone(),
            action,
        });
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        if let Err(rejected) = self.sender.send(Message::Run(job)) {
            // Receiver gone: the loop has already exited.
            if let Message::Run(job) = rejected.0 {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                job.cancel();
            }
        }
        promise
    }

    /// Runs `action` under exclusive access and waits for it. On the write
    /// thread the action runs inline; elsewhere it is queued and the caller
    /// blocks until it finishes. A caller holding read access gets
    /// `ReadToWriteUpgrade`, since the queued write would wait on its grant.
    pub fn run_and_wait<T, F>(&self, action: F) -> TetherResult<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.rule.is_write_thread() {
            return self.rule.run_write_action(action);
        }
        if self.rule.is_read_access_allowed() {
            return Err(TetherError::ReadToWriteUpgrade);
        }
        self.push_write_action(action)
            .blocking_get(None)
            .map_err(|e| match e {
                PromiseError::Cancelled => TetherError::WriteThreadStopped,
                other => TetherError::Internal(other.to_string()),
            })
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> WriteStats {
        WriteStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting actions, lets the running action finish, cancels the
    /// rest of the queue, and joins the thread. Idempotent. Must not be
    /// called from the write thread itself.
    pub fn shutdown(&self) -> TetherResult<()> {
        if self.rule.is_write_thread() {
            return Err(TetherError::Internal(
                "write thread cannot shut itself down".to_string(),
            ));
        }
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // A send error means the loop is already gone; joining still applies.
        let _ = self.sender.send(Message::Stop);

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| TetherError::Internal("write thread panicked".to_string()))?;
        }
        let stats = self.stats();
        info!(
            completed = stats.completed,
            failed = stats.failed,
            cancelled = stats.cancelled,
            "write thread stopped"
        );
        Ok(())
    }
}

impl Drop for WriteThread {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "write thread shutdown on drop failed");
        }
    }
}

impl std::fmt::Debug for WriteThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteThread")
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

fn write_loop(
    rule: &AccessRule,
    mut receiver: UnboundedReceiver<Message>,
    counters: &WriteCounters,
    stopped: &AtomicBool,
) {
    rule.bind_write_thread();
    while let Some(message) = receiver.blocking_recv() {
        match message {
            Message::Run(job) if stopped.load(Ordering::SeqCst) => {
                counters.cancelled.fetch_add(1, Ordering::Relaxed);
                job.cancel();
            }
            Message::Run(job) => {
                let started = Instant::now();
                job.run(rule, counters);
                debug!(elapsed_us = started.elapsed().as_micros() as u64, "write action done");
            }
            Message::Stop => break,
        }
    }

    receiver.close();
    let mut drained = 0u64;
    while let Ok(message) = receiver.try_recv() {
        if let Message::Run(job) = message {
            job.cancel();
            drained += 1;
        }
    }
    counters.cancelled.fetch_add(drained, Ordering::Relaxed);
    if drained > 0 {
        debug!(drained, "cancelled queued write actions");
    }
    rule.unbind_write_thread();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccessConfig;
    use std::sync::Barrier;
    use std::time::Duration;
    use tether_core::PromiseStatus;

    fn start() -> WriteThread {
        WriteThread::start(AccessRule::new(AccessConfig::default())).unwrap()
    }

    #[test]
    fn pushed_action_resolves() {
        let wt = start();
        let rule = wt.rule().clone();
        let p = wt.push_write_action(move || {
            assert!(rule.is_write_access_allowed());
            std::thread::current().name().map(str::to_string)
        });
        assert_eq!(
            p.blocking_get(Some(Duration::from_secs(5))).unwrap(),
            Some("tether-write".to_string())
        );
        wt.shutdown().unwrap();
        assert_eq!(wt.stats().completed, 1);
    }

    #[test]
    fn panic_rejects_and_thread_survives() {
        let wt = start();
        let bad = wt.push_write_action(|| -> u8 { panic!("writer failed") });
        let good = wt.push_write_action(|| 5u8);
        assert!(matches!(
            bad.blocking_get(Some(Duration::from_secs(5))),
            Err(PromiseError::Rejected(_))
        ));
        assert_eq!(good.blocking_get(Some(Duration::from_secs(5))).unwrap(), 5);
        assert!(!wt.rule().is_write_access_allowed());
    }

    #[test]
    fn shutdown_cancels_queue() {
        let wt = start();
        let gate = Arc::new(Barrier::new(2));
        let g = gate.clone();
        let first = wt.push_write_action(move || {
            g.wait();
            std::thread::sleep(Duration::from_millis(50));
            1u32
        });
        let queued: Vec<_> = (0..5).map(|i| wt.push_write_action(move || i)).collect();
        gate.wait();
        wt.shutdown().unwrap();

        assert_eq!(first.blocking_get(None).unwrap(), 1);
        for p in &queued {
            assert_eq!(p.status(), PromiseStatus::Cancelled);
        }
        let late = wt.push_write_action(|| 0u32);
        assert!(late.is_cancelled());
        assert_eq!(wt.stats().cancelled, 6);
        assert!(wt.shutdown().is_ok());
    }

    #[test]
    fn cancelled_before_run_is_skipped() {
        let wt = start();
        let gate = Arc::new(Barrier::new(2));
        let g = gate.clone();
        let blocker = wt.push_write_action(move || {
            g.wait();
        });
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let victim = wt.push_write_action(move || r.store(true, Ordering::SeqCst));
        victim.cancel();
        let after = wt.push_write_action(|| ());
        gate.wait();
        blocker.blocking_get(None).unwrap();
        after.blocking_get(None).unwrap();
        wt.shutdown().unwrap();
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(wt.stats().skipped, 1);
    }

    #[test]
    fn run_and_wait_from_other_thread() {
        let wt = start();
        assert_eq!(wt.run_and_wait(|| 40 + 2).unwrap(), 42);
        wt.shutdown().unwrap();
        assert!(matches!(
            wt.run_and_wait(|| 0),
            Err(TetherError::WriteThreadStopped)
        ));
    }

    #[tokio::test]
    async fn pushed_action_can_be_awaited() {
        let wt = start();
        let value = wt.push_write_action(|| "done".to_string()).await.unwrap();
        assert_eq!(value, "done");
    }
}

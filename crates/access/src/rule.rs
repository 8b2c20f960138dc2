//! Shared read / exclusive write discipline.
//!
//! One `AccessRule` guards one body of shared state. Reads may run on any
//! thread; writes run only on the bound write thread. The underlying
//! `parking_lot::RwLock` is task-fair, so a waiting writer blocks new
//! outermost readers while in-flight readers finish. Nested reads and reads
//! inside a write action never touch the lock again; they re-use the outer
//! grant recorded in thread-local state.

use crate::config::AccessConfig;
use crate::listeners::{ListenerHandle, Listeners, WriteActionListener};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use tether_core::{AccessKind, TetherError, TetherResult};
use tracing::{debug, warn};

static NEXT_RULE_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Per-thread grant bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
struct Held {
    reads: u32,
    writing: bool,
}

thread_local! {
    static HELD: RefCell<HashMap<u64, Held>> = RefCell::new(HashMap::new());
}

fn held(rule: u64) -> Held {
    HELD.with(|cell| cell.borrow().get(&rule).copied().unwrap_or_default())
}

fn update_held<R>(rule: u64, f: impl FnOnce(&mut Held) -> R) -> R {
    HELD.with(|cell| {
        let mut map = cell.borrow_mut();
        let entry = map.entry(rule).or_default();
        let out = f(entry);
        if entry.reads == 0 && !entry.writing {
            map.remove(&rule);
        }
        out
    })
}

fn thread_label() -> String {
    let current = std::thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}

// ---------------------------------------------------------------------------
// Access token
// ---------------------------------------------------------------------------

/// A granted read. Holds the shared lock when it is the outermost read on
/// this thread, nothing otherwise. Not `Send`: a grant belongs to the
/// thread that took it.
#[must_use = "the read grant is released when the token is dropped"]
pub struct AccessToken {
    rule: u64,
    guard: Option<ArcRwLockReadGuard<RawRwLock, ()>>,
    _not_send: PhantomData<*const ()>,
}

impl AccessToken {
    /// True if this token took the lock itself rather than riding an outer
    /// grant.
    pub fn is_outermost(&self) -> bool {
        self.guard.is_some()
    }
}

impl Drop for AccessToken {
    fn drop(&mut self) {
        update_held(self.rule, |h| h.reads = h.reads.saturating_sub(1));
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("rule", &self.rule)
            .field("outermost", &self.is_outermost())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Cancellable reads
// ---------------------------------------------------------------------------

/// Handed to a cancellable read so it can notice waiting writers.
pub struct ReadProgress<'a> {
    rule: &'a AccessRule,
    yieldable: bool,
}

impl ReadProgress<'_> {
    /// Fails with `ReadCancelled` while a writer is waiting for the lock.
    /// A read that cannot yield (nested, or inside a write action) never
    /// fails here.
    pub fn check_canceled(&self) -> TetherResult<()> {
        if self.yieldable && self.rule.has_pending_writer() {
            return Err(TetherError::ReadCancelled { attempts: 0 });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Counters {
    reads_granted: AtomicU64,
    reads_cancelled: AtomicU64,
    writes_run: AtomicU64,
}

/// Point-in-time view of the rule's counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AccessStats {
    /// Outermost read grants (nested reads are not counted).
    pub reads_granted: u64,
    /// Cancellable read attempts that yielded to a writer.
    pub reads_cancelled: u64,
    /// Outermost write actions executed.
    pub writes_run: u64,
}

// ---------------------------------------------------------------------------
// AccessRule
// ---------------------------------------------------------------------------

pub struct AccessRule {
    id: u64,
    lock: Arc<RwLock<()>>,
    pending_writers: AtomicUsize,
    write_thread: Mutex<Option<ThreadId>>,
    listeners: Arc<Listeners>,
    counters: Counters,
    config: AccessConfig,
}

impl AccessRule {
    pub fn new(config: AccessConfig) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_RULE_ID.fetch_add(1, Ordering::Relaxed),
            lock: Arc::new(RwLock::new(())),
            pending_writers: AtomicUsize::new(0),
            write_thread: Mutex::new(None),
            listeners: Arc::new(Listeners::default()),
            counters: Counters::default(),
            config,
        })
    }

    pub fn config(&self) -> &AccessConfig {
        &self.config
    }

    // ----- read side -----

    /// Blocks until read access is granted.
    pub fn acquire_read(&self) -> AccessToken {
        if let Some(token) = self.reuse_grant() {
            return token;
        }
        let guard = self.lock.read_arc();
        self.grant(guard)
    }

    /// Grants read access only if it is available without waiting.
    pub fn try_acquire_read(&self) -> Option<AccessToken> {
        if let Some(token) = self.reuse_grant() {
            return Some(token);
        }
        self.lock.try_read_arc().map(|guard| self.grant(guard))
    }

    /// Runs `f` under read access and returns its result unchanged.
    pub fn read<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let _token = self.acquire_read();
        f()
    }

    /// Infallible variant of [`read`](Self::read).
    pub fn compute_read<T>(&self, f: impl FnOnce() -> T) -> T {
        let _token = self.acquire_read();
        f()
    }

    /// Runs a read that steps aside for writers.
    ///
    /// `f` should call [`ReadProgress::check_canceled`] at safe points and
    /// propagate its error. Each cancelled attempt releases the lock, waits
    /// for the writer to get through, and starts `f` over. After
    /// `cancellable_read_attempts` cancelled attempts the read gives up with
    /// `ReadCancelled`. Called from inside an existing grant the read cannot
    /// yield, so it runs once and is never cancelled.
    pub fn run_cancellable_read<T>(
        &self,
        mut f: impl FnMut(&ReadProgress<'_>) -> TetherResult<T>,
    ) -> TetherResult<T> {
        let state = held(self.id);
        if state.reads > 0 || state.writing {
            let _token = self.acquire_read();
            return f(&ReadProgress {
                rule: self,
                yieldable: false,
            });
        }

        let limit = self.config.cancellable_read_attempts.max(1);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let outcome = {
                let _token = self.acquire_read();
                f(&ReadProgress {
                    rule: self,
                    yieldable: true,
                })
            };
            match outcome {
                Err(TetherError::ReadCancelled { .. }) => {
                    self.counters.reads_cancelled.fetch_add(1, Ordering::Relaxed);
                    if attempts >= limit {
                        warn!(attempts, "cancellable read gave up");
                        return Err(TetherError::ReadCancelled { attempts });
                    }
                    debug!(attempts, "read yielded to writer");
                    // The fair lock parks the next acquisition behind the writer.
                    std::thread::yield_now();
                }
                other => return other,
            }
        }
    }

    // ----- write side -----

    /// Runs `f` under exclusive access. Only valid on the write thread, and
    /// not while that thread holds a read grant of its own. Nested write
    /// actions run inline.
    pub fn run_write_action<T>(&self, f: impl FnOnce() -> T) -> TetherResult<T> {
        if !self.is_write_thread() {
            return Err(TetherError::NotWriteThread(thread_label()));
        }
        let state = held(self.id);
        if state.writing {
            return Ok(f());
        }
        if state.reads > 0 {
            return Err(TetherError::ReadToWriteUpgrade);
        }

        let _scope = self.enter_write();
        self.listeners.before_write_action();
        let value = f();
        self.listeners.after_write_action();
        self.counters.writes_run.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    fn enter_write(&self) -> WriteScope<'_> {
        self.pending_writers.fetch_add(1, Ordering::SeqCst);
        let guard = self.lock.write_arc();
        self.pending_writers.fetch_sub(1, Ordering::SeqCst);
        update_held(self.id, |h| h.writing = true);
        WriteScope {
            rule: self,
            _guard: guard,
        }
    }

    pub(crate) fn bind_write_thread(&self) {
        let current = std::thread::current().id();
        let previous = self.write_thread.lock().replace(current);
        if let Some(previous) = previous.filter(|p| *p != current) {
            warn!(?previous, ?current, "write thread rebound");
        }
    }

    pub(crate) fn unbind_write_thread(&self) {
        let current = std::thread::current().id();
        let mut slot = self.write_thread.lock();
        if *slot == Some(current) {
            *slot = None;
        }
    }

    // ----- queries -----

    pub fn is_write_thread(&self) -> bool {
        *self.write_thread.lock() == Some(std::thread::current().id())
    }

    /// True while the current thread holds a read grant or is inside a
    /// write action.
    pub fn is_read_access_allowed(&self) -> bool {
        let state = held(self.id);
        state.reads > 0 || state.writing
    }

    /// True only inside a write action on the write thread.
    pub fn is_write_access_allowed(&self) -> bool {
        held(self.id).writing
    }

    pub fn assert_read_access_allowed(&self) -> TetherResult<()> {
        if self.is_read_access_allowed() {
            Ok(())
        } else {
            Err(TetherError::ReadAccessRequired(thread_label()))
        }
    }

    /// Strongest access the current thread holds.
    pub fn current_access(&self) -> AccessKind {
        let state = held(self.id);
        if state.writing {
            AccessKind::Write
        } else if state.reads > 0 {
            AccessKind::Read
        } else {
            AccessKind::None
        }
    }

    /// True while some writer is waiting for the lock.
    pub fn has_pending_writer(&self) -> bool {
        self.pending_writers.load(Ordering::SeqCst) > 0
    }

    // ----- listeners -----

    /// Subscribes to write-action boundaries. Dispose the returned handle
    /// (directly or through an owner) to unsubscribe.
    pub fn add_write_listener(&self, listener: Arc<dyn WriteActionListener>) -> Arc<ListenerHandle> {
        self.listeners.add(listener)
    }

    pub fn write_listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn stats(&self) -> AccessStats {
        AccessStats {
            reads_granted: self.counters.reads_granted.load(Ordering::Relaxed),
            reads_cancelled: self.counters.reads_cancelled.load(Ordering::Relaxed),
            writes_run: self.counters.writes_run.load(Ordering::Relaxed),
        }
    }

    // ----- internals -----

    fn reuse_grant(&self) -> Option<AccessToken> {
        let state = held(self.id);
        if state.reads == 0 && !state.writing {
            return None;
        }
        update_held(self.id, |h| h.reads += 1);
        Some(AccessToken {
            rule: self.id,
            guard: None,
            _not_send: PhantomData,
        })
    }

    fn grant(&self, guard: ArcRwLockReadGuard<RawRwLock, ()>) -> AccessToken {
        update_held(self.id, |h| h.reads += 1);
        self.counters.reads_granted.fetch_add(1, Ordering::Relaxed);
        AccessToken {
            rule: self.id,
            guard: Some(guard),
            _not_send: PhantomData,
        }
    }
}

impl std::fmt::Debug for AccessRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessRule")
            .field("id", &self.id)
            .field("pending_writers", &self.pending_writers.load(Ordering::Relaxed))
            .field("write_thread", &*self.write_thread.lock())
            .finish()
    }
}

/// Restores thread-local state and releases the exclusive lock, also when
/// the write action unwinds.
struct WriteScope<'a> {
    rule: &'a AccessRule,
    _guard: ArcRwLockWriteGuard<RawRwLock, ()>,
}

impl Drop for WriteScope<'_> {
    fn drop(&mut self) {
        update_held(self.rule.id, |h| h.writing = false);
    }
}

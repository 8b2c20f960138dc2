//! Write-action boundary listeners.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tether_core::Disposable;
use tracing::warn;

/// Observes every outermost write action. Both hooks run on the write
/// thread while the exclusive lock is held.
pub trait WriteActionListener: Send + Sync + 'static {
    fn before_write_action(&self) {}
    fn after_write_action(&self) {}
}

#[derive(Default)]
pub(crate) struct Listeners {
    entries: Mutex<Vec<(u64, Arc<dyn WriteActionListener>)>>,
    next_id: AtomicU64,
}

impl Listeners {
    pub(crate) fn add(self: &Arc<Self>, listener: Arc<dyn WriteActionListener>) -> Arc<ListenerHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, listener));
        Arc::new(ListenerHandle {
            id,
            owner: Arc::downgrade(self),
        })
    }

    fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn WriteActionListener>> {
        self.entries.lock().iter().map(|(_, l)| l.clone()).collect()
    }

    pub(crate) fn before_write_action(&self) {
        for listener in self.snapshot() {
            notify("before_write_action", || listener.before_write_action());
        }
    }

    pub(crate) fn after_write_action(&self) {
        for listener in self.snapshot() {
            notify("after_write_action", || listener.after_write_action());
        }
    }
}

fn notify(hook: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(hook, "write listener panicked");
    }
}

/// Subscription handle. Disposing it unsubscribes the listener.
pub struct ListenerHandle {
    id: u64,
    owner: Weak<Listeners>,
}

impl Disposable for ListenerHandle {
    fn dispose(&self) {
        if let Some(listeners) = self.owner.upgrade() {
            listeners.remove(self.id);
        }
    }

    fn debug_name(&self) -> String {
        format!("WriteActionListener#{}", self.id)
    }
}

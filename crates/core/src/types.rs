//! Domain types shared by the disposer, promise and access crates.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Disposable
// ---------------------------------------------------------------------------

/// A resource participating in the ownership tree.
///
/// Resources are shared as `Arc`s and identified by allocation, so
/// `dispose` takes `&self`; implementors keep their mutable state behind
/// interior mutability. The disposer calls `dispose` at most once.
pub trait Disposable: Send + Sync + 'static {
    fn dispose(&self);

    /// Called on every node of a subtree, parents first, before any node of
    /// that subtree is disposed.
    fn before_tree_dispose(&self) {}

    fn debug_name(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// Type-erased shared handle to a [`Disposable`].
pub type DisposableRef = Arc<dyn Disposable>;

/// Identity of a disposable: the address of its `Arc` allocation.
///
/// Only meaningful while the allocation is pinned by a strong or weak
/// reference held by whoever stores the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(usize);

impl ObjectKey {
    #[inline]
    pub fn of(resource: &DisposableRef) -> Self {
        Self(Arc::as_ptr(resource) as *const () as usize)
    }
}

/// Erases a concrete `Arc<T>` into a [`DisposableRef`] sharing the same allocation.
#[inline]
pub fn erase<T: Disposable>(resource: &Arc<T>) -> DisposableRef {
    resource.clone()
}

// ---------------------------------------------------------------------------
// Closure-backed disposables
// ---------------------------------------------------------------------------

/// A named disposable with no behavior of its own, used as a parent for
/// grouping resources.
#[derive(Debug)]
pub struct NamedDisposable {
    name: String,
}

impl NamedDisposable {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { name: name.into() })
    }
}

impl Disposable for NamedDisposable {
    fn dispose(&self) {}

    fn debug_name(&self) -> String {
        self.name.clone()
    }
}

/// Runs a closure exactly once on dispose.
pub struct OnDispose {
    name: String,
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl OnDispose {
    pub fn new(name: impl Into<String>, action: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            action: Mutex::new(Some(Box::new(action))),
        })
    }
}

impl Disposable for OnDispose {
    fn dispose(&self) {
        let action = self.action.lock().take();
        if let Some(action) = action {
            action();
        }
    }

    fn debug_name(&self) -> String {
        self.name.clone()
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Observable state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PromiseStatus {
    Pending,
    Succeeded,
    Rejected,
    Cancelled,
}

impl PromiseStatus {
    pub fn is_done(self) -> bool {
        self != Self::Pending
    }
}

/// Kind of access a thread currently holds on application state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessKind {
    None,
    Read,
    Write,
}

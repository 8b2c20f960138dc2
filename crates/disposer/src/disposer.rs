//! Public registration / teardown API over the ownership tree.

use crate::tree::{Node, NodeId, Teardown, Tree};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tether_core::error::{TetherError, TetherResult};
use tether_core::{panic_message, DisposableRef, NamedDisposable, ObjectKey};

/// Disposer settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisposerConfig {
    /// Capture a backtrace for every node so leak reports show where the
    /// leaked resource entered the tree. Costly; meant for tests.
    pub debug_mode: bool,
}

/// Owns the parent/child relation between disposables and tears subtrees
/// down children-first.
///
/// No user callback is ever invoked while the internal lock is held, so
/// `dispose` implementations may freely register, dispose or query.
///
/// A subtree torn down on one thread stays linked to its parent until it is
/// gone. An ancestor disposed meanwhile on another thread waits for it
/// before disposing any of its own nodes.
///
/// ```ignore
/// let disposer = Disposer::new(DisposerConfig::default());
/// let project: DisposableRef = NamedDisposable::new("project");
/// let index: DisposableRef = Arc::new(Index::open()?);
/// disposer.register(&project, &index)?;
/// disposer.dispose(&project, false)?; // index is disposed first
/// ```
#[derive(Default)]
pub struct Disposer {
    tree: Mutex<Tree>,
    /// Signalled whenever a teardown leaves the tree.
    torn_down: Condvar,
    config: DisposerConfig,
}

impl Disposer {
    pub fn new(config: DisposerConfig) -> Self {
        Self {
            tree: Mutex::new(Tree::default()),
            torn_down: Condvar::new(),
            config,
        }
    }

    pub fn config(&self) -> &DisposerConfig {
        &self.config
    }

    /// Makes `parent` own `child`.
    ///
    /// Re-registering a child under a new parent moves it. Registering the
    /// same pair again is a no-op.
    pub fn register(&self, parent: &DisposableRef, child: &DisposableRef) -> TetherResult<()> {
        self.register_inner(parent, child, None)
    }

    /// Like [`register`](Self::register), but allows at most one child per
    /// `(parent, key)`; see [`find_registered`](Self::find_registered).
    pub fn register_with_key(
        &self,
        parent: &DisposableRef,
        child: &DisposableRef,
        key: &str,
    ) -> TetherResult<()> {
        self.register_inner(parent, child, Some(key))
    }

    /// Registers unless the parent is already disposed or disposing.
    ///
    /// Returns `false` in that case; other registration errors are still
    /// reported as `false` and logged.
    pub fn try_register(&self, parent: &DisposableRef, child: &DisposableRef) -> bool {
        match self.register(parent, child) {
            Ok(()) => true,
            Err(TetherError::ParentDisposed(_)) => false,
            Err(e) => {
                tracing::warn!(error = %e, "try_register failed");
                false
            }
        }
    }

    fn register_inner(
        &self,
        parent: &DisposableRef,
        child: &DisposableRef,
        key: Option<&str>,
    ) -> TetherResult<()> {
        let parent_key = ObjectKey::of(parent);
        let child_key = ObjectKey::of(child);
        if parent_key == child_key {
            return Err(TetherError::SelfRegistration(child.debug_name()));
        }

        let mut tree = self.tree.lock();

        if tree.is_disposed(parent_key) || tree.is_disposing(parent_key) {
            return Err(TetherError::ParentDisposed(parent.debug_name()));
        }
        if tree.is_disposed(child_key) || tree.is_disposing(child_key) {
            return Err(TetherError::AlreadyDisposed(child.debug_name()));
        }

        let existing_parent = tree.node_id(parent_key);
        let existing_child = tree.node_id(child_key);

        if let (Some(parent_id), Some(child_id)) = (existing_parent, existing_child) {
            let already_there = tree.node(child_id).map_or(false, |n| {
                n.parent == Some(parent_id) && n.key.as_deref() == key
            });
            if already_there {
                return Ok(());
            }
            if tree.is_ancestor_or_self(child_id, parent_id) {
                return Err(TetherError::OwnershipCycle {
                    parent: parent.debug_name(),
                    child: child.debug_name(),
                });
            }
        }
        if let (Some(parent_id), Some(k)) = (existing_parent, key) {
            let taken = tree
                .child_with_key(parent_id, k)
                .map_or(false, |holder| Some(holder) != existing_child);
            if taken {
                return Err(TetherError::DuplicateKey {
                    parent: parent.debug_name(),
                    key: k.to_string(),
                });
            }
        }

        let capture = self.config.debug_mode;
        let parent_id = tree.get_or_insert(parent, capture);
        let child_id = tree.get_or_insert(child, capture);
        tree.attach(parent_id, child_id, key.map(str::to_owned));

        tracing::trace!(
            parent = %parent.debug_name(),
            child = %child.debug_name(),
            key,
            "registered"
        );
        Ok(())
    }

    /// Looks up the child registered under `parent` with `key`.
    pub fn find_registered(&self, parent: &DisposableRef, key: &str) -> Option<DisposableRef> {
        let tree = self.tree.lock();
        let parent_id = tree.node_id(ObjectKey::of(parent))?;
        let child_id = tree.child_with_key(parent_id, key)?;
        tree.node(child_id).map(|n| n.object.clone())
    }

    /// Tears down the subtree rooted at `resource`.
    ///
    /// Children are disposed before their parents, siblings in reverse
    /// registration order. A resource that was never registered is disposed
    /// directly only if `process_unregistered` is set. Disposing twice is a
    /// no-op.
    ///
    /// Panicking callbacks do not stop the teardown; their messages are
    /// collected into [`TetherError::DisposeFailed`].
    pub fn dispose(&self, resource: &DisposableRef, process_unregistered: bool) -> TetherResult<()> {
        let key = ObjectKey::of(resource);

        let Teardown { plan, in_flight } = {
            let mut tree = self.tree.lock();
            match tree.node_id(key) {
                Some(id) => match tree.begin_teardown(id, std::thread::current().id()) {
                    Some(teardown) => teardown,
                    None => return Ok(()),
                },
                None => {
                    if tree.is_disposed(key) || !process_unregistered {
                        return Ok(());
                    }
                    tree.record_disposed(resource);
                    drop(tree);
                    tracing::trace!(resource = %resource.debug_name(), "disposing unregistered");
                    let mut failures = Vec::new();
                    invoke(resource, &mut failures, |r| r.dispose());
                    return into_result(failures);
                }
            }
        };

        let mut failures = Vec::new();
        for planned in &plan {
            invoke(&planned.object, &mut failures, |r| r.before_tree_dispose());
        }
        self.wait_for(&in_flight);
        for planned in plan.iter().rev() {
            invoke(&planned.object, &mut failures, |r| r.dispose());
        }

        let removed: Vec<Node> = self.tree.lock().finish_teardown(&plan);
        self.torn_down.notify_all();
        tracing::debug!(
            resource = %resource.debug_name(),
            nodes = removed.len(),
            waited_on = in_flight.len(),
            failures = failures.len(),
            "disposed subtree"
        );
        drop(removed);
        drop(plan);

        into_result(failures)
    }

    /// Blocks until every node in `in_flight` has left the tree.
    fn wait_for(&self, in_flight: &[NodeId]) {
        if in_flight.is_empty() {
            return;
        }
        let mut tree = self.tree.lock();
        while in_flight.iter().any(|id| tree.contains(*id)) {
            tracing::trace!(pending = in_flight.len(), "waiting for nested teardown");
            self.torn_down.wait(&mut tree);
        }
    }

    pub fn is_disposed(&self, resource: &DisposableRef) -> bool {
        self.tree.lock().is_disposed(ObjectKey::of(resource))
    }

    /// True while the resource's subtree is being torn down.
    pub fn is_disposing(&self, resource: &DisposableRef) -> bool {
        self.tree.lock().is_disposing(ObjectKey::of(resource))
    }

    pub fn parent_of(&self, resource: &DisposableRef) -> Option<DisposableRef> {
        let tree = self.tree.lock();
        let id = tree.node_id(ObjectKey::of(resource))?;
        let parent = tree.node(id)?.parent?;
        tree.node(parent).map(|n| n.object.clone())
    }

    /// Direct children in registration order.
    pub fn children_of(&self, resource: &DisposableRef) -> Vec<DisposableRef> {
        let tree = self.tree.lock();
        let Some(node) = tree
            .node_id(ObjectKey::of(resource))
            .and_then(|id| tree.node(id))
        else {
            return Vec::new();
        };
        node.children
            .iter()
            .filter_map(|c| tree.node(*c).map(|n| n.object.clone()))
            .collect()
    }

    /// Number of live nodes in the tree.
    pub fn tree_size(&self) -> usize {
        self.tree.lock().len()
    }

    /// Creates a named disposable owned by `parent`.
    pub fn new_disposable_under(
        &self,
        parent: &DisposableRef,
        name: impl Into<String>,
    ) -> TetherResult<DisposableRef> {
        let child: DisposableRef = NamedDisposable::new(name);
        self.register(parent, &child)?;
        Ok(child)
    }

    /// Fails with every remaining root if the tree is not empty.
    pub fn assert_is_empty(&self) -> TetherResult<()> {
        let leaked: Vec<String> = {
            let tree = self.tree.lock();
            tree.roots()
                .map(|n| match &n.origin {
                    Some(bt) => format!("{} registered at:\n{bt}", n.object.debug_name()),
                    None => n.object.debug_name(),
                })
                .collect()
        };
        if leaked.is_empty() {
            return Ok(());
        }
        tracing::warn!(roots = leaked.len(), "ownership tree is not empty");
        Err(TetherError::LeakedRoots(leaked))
    }

    /// Forgets all tree state without running any callback.
    pub fn clear(&self) {
        let (arena, disposed) = self.tree.lock().take_all();
        tracing::debug!(nodes = arena.len(), disposed, "cleared ownership tree");
        drop(arena);
    }
}

/// Convenience for [`NamedDisposable::new`] erased to a [`DisposableRef`].
pub fn new_disposable(name: impl Into<String>) -> DisposableRef {
    NamedDisposable::new(name)
}

fn invoke(resource: &DisposableRef, failures: &mut Vec<String>, f: impl FnOnce(&DisposableRef)) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(resource))) {
        let message = panic_message(payload.as_ref());
        tracing::warn!(resource = %resource.debug_name(), error = %message, "dispose callback panicked");
        failures.push(format!("{}: {message}", resource.debug_name()));
    }
}

fn into_result(failures: Vec<String>) -> TetherResult<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(TetherError::DisposeFailed(failures))
    }
}

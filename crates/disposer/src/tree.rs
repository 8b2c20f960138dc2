//! Arena-backed ownership tree.
//!
//! Nodes live in a `SlotMap` and reference each other by [`NodeId`]; an
//! identity index maps each registered object's allocation to its node.
//! Every walk here is iterative so arbitrarily deep ownership chains are
//! safe.

use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use tether_core::{Disposable, DisposableRef, ObjectKey};

new_key_type! { pub(crate) struct NodeId; }

/// Disposed entries are swept for dead allocations after this many insertions.
const PURGE_INTERVAL: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeState {
    Live,
    /// Frozen by a teardown running on `owner`.
    Disposing { owner: ThreadId },
}

pub(crate) struct Node {
    pub(crate) object: DisposableRef,
    pub(crate) parent: Option<NodeId>,
    /// Registration order; teardown walks it back to front.
    pub(crate) children: SmallVec<[NodeId; 4]>,
    pub(crate) key: Option<String>,
    pub(crate) state: NodeState,
    pub(crate) origin: Option<Arc<Backtrace>>,
}

/// One entry of a teardown plan, in pre-order.
pub(crate) struct PlannedNode {
    pub(crate) id: NodeId,
    pub(crate) object: DisposableRef,
}

/// A frozen subtree ready to be torn down.
pub(crate) struct Teardown {
    pub(crate) plan: Vec<PlannedNode>,
    /// Roots of nested subtrees another thread is already tearing down.
    /// Their parents must not be disposed before these nodes are gone.
    pub(crate) in_flight: Vec<NodeId>,
}

#[derive(Default)]
pub(crate) struct Tree {
    arena: SlotMap<NodeId, Node>,
    index: HashMap<ObjectKey, NodeId>,
    /// Weak refs pin the allocation, so a key here can never be reused by a
    /// different object while the entry exists.
    disposed: HashMap<ObjectKey, Weak<dyn Disposable>>,
    inserted_since_purge: usize,
}

impl Tree {
    pub(crate) fn len(&self) -> usize {
        self.arena.len()
    }

    pub(crate) fn node_id(&self, key: ObjectKey) -> Option<NodeId> {
        self.index.get(&key).copied()
    }

    pub(crate) fn node(&self, id: NodeId) -> Option<&Node> {
        self.arena.get(id)
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.arena.contains_key(id)
    }

    pub(crate) fn is_disposed(&self, key: ObjectKey) -> bool {
        self.disposed.contains_key(&key)
    }

    pub(crate) fn is_disposing(&self, key: ObjectKey) -> bool {
        self.node_id(key)
            .and_then(|id| self.arena.get(id))
            .map_or(false, |n| matches!(n.state, NodeState::Disposing { .. }))
    }

    /// Returns the node for `object`, inserting it as a root if unknown.
    pub(crate) fn get_or_insert(&mut self, object: &DisposableRef, capture_origin: bool) -> NodeId {
        let key = ObjectKey::of(object);
        if let Some(id) = self.index.get(&key) {
            return *id;
        }
        let origin = capture_origin.then(|| Arc::new(Backtrace::force_capture()));
        let id = self.arena.insert(Node {
            object: object.clone(),
            parent: None,
            children: SmallVec::new(),
            key: None,
            state: NodeState::Live,
            origin,
        });
        self.index.insert(key, id);
        id
    }

    /// True if `ancestor` is `node` or lies on its parent chain.
    pub(crate) fn is_ancestor_or_self(&self, ancestor: NodeId, mut node: NodeId) -> bool {
        loop {
            if node == ancestor {
                return true;
            }
            match self.arena.get(node).and_then(|n| n.parent) {
                Some(parent) => node = parent,
                None => return false,
            }
        }
    }

    pub(crate) fn child_with_key(&self, parent: NodeId, key: &str) -> Option<NodeId> {
        let node = self.arena.get(parent)?;
        node.children.iter().copied().find(|c| {
            self.arena
                .get(*c)
                .and_then(|n| n.key.as_deref())
                .map_or(false, |k| k == key)
        })
    }

    /// Moves `child` under `parent`, detaching it from any previous parent.
    pub(crate) fn attach(&mut self, parent: NodeId, child: NodeId, key: Option<String>) {
        self.detach(child);
        if let Some(node) = self.arena.get_mut(child) {
            node.parent = Some(parent);
            node.key = key;
        }
        if let Some(node) = self.arena.get_mut(parent) {
            node.children.push(child);
        }
    }

    fn detach(&mut self, child: NodeId) {
        let Some(parent) = self.arena.get_mut(child).and_then(|n| n.parent.take()) else {
            return;
        };
        if let Some(node) = self.arena.get_mut(parent) {
            node.children.retain(|c| *c != child);
        }
    }

    /// Freezes the subtree rooted at `root` for a teardown run by `owner`
    /// and returns it in pre-order (children in registration order).
    /// Returns `None` if `root` is already being torn down.
    ///
    /// Reversing the plan yields the dispose order: every child before its
    /// parent, siblings last-registered-first. The subtree stays linked to
    /// its parent until [`finish_teardown`](Self::finish_teardown), so an
    /// ancestor's teardown started meanwhile finds it and waits for it.
    pub(crate) fn begin_teardown(&mut self, root: NodeId, owner: ThreadId) -> Option<Teardown> {
        if matches!(self.arena.get(root)?.state, NodeState::Disposing { .. }) {
            return None;
        }

        let mut plan = Vec::new();
        let mut in_flight = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(node) = self.arena.get_mut(id) else {
                continue;
            };
            if let NodeState::Disposing { owner: running } = node.state {
                // Our own thread is inside that teardown and cannot wait for it.
                if running != owner {
                    in_flight.push(id);
                }
                continue;
            }
            node.state = NodeState::Disposing { owner };
            plan.push(PlannedNode {
                id,
                object: node.object.clone(),
            });
            stack.extend(node.children.iter().rev().copied());
        }
        Some(Teardown { plan, in_flight })
    }

    /// Unlinks the torn-down subtree, removes its nodes and records their
    /// objects as disposed.
    ///
    /// The removed nodes are returned so the caller can drop the objects
    /// outside the tree lock.
    pub(crate) fn finish_teardown(&mut self, plan: &[PlannedNode]) -> Vec<Node> {
        if let Some(root) = plan.first() {
            self.detach(root.id);
        }
        let mut removed = Vec::with_capacity(plan.len());
        for planned in plan {
            if let Some(node) = self.arena.remove(planned.id) {
                let key = ObjectKey::of(&node.object);
                self.index.remove(&key);
                self.record_disposed(&node.object);
                removed.push(node);
            }
        }
        removed
    }

    pub(crate) fn record_disposed(&mut self, object: &DisposableRef) {
        self.disposed
            .insert(ObjectKey::of(object), Arc::downgrade(object));
        self.inserted_since_purge += 1;
        if self.inserted_since_purge >= PURGE_INTERVAL {
            self.purge_dead();
        }
    }

    /// Forgets disposed objects nobody can ask about anymore.
    fn purge_dead(&mut self) {
        let before = self.disposed.len();
        self.disposed.retain(|_, weak| weak.strong_count() > 0);
        self.inserted_since_purge = 0;
        tracing::trace!(
            purged = before - self.disposed.len(),
            remaining = self.disposed.len(),
            "purged disposed set"
        );
    }

    pub(crate) fn roots(&self) -> impl Iterator<Item = &Node> {
        self.arena.values().filter(|n| n.parent.is_none())
    }

    pub(crate) fn take_all(&mut self) -> (SlotMap<NodeId, Node>, usize) {
        let disposed = self.disposed.len();
        self.index.clear();
        self.disposed.clear();
        self.inserted_since_purge = 0;
        (std::mem::take(&mut self.arena), disposed)
    }
}

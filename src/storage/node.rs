//! In-memory representation of one page: the node the cache hands out,
//! latched by its own `RawLatch` and carrying the intrusive list head for
//! bound cursor frames.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::storage::{PageId, NO_PAGE};
use crate::sync::RawLatch;
use crate::tree::frame::FrameList;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Empty,
    Leaf,
    Internal,
    Fragment,
    UndoLog,
}

/// Flush tag. `Dirty(t)` matches commit state `t`; a node whose tag equals
/// the current commit state is skipped by the in-progress checkpoint and
/// flushed by the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedState {
    Clean,
    Dirty(u8),
}

/// Latched contents of a node. Only reachable through a guard.
pub struct NodeInner {
    pub kind: NodeKind,
    pub state: CachedState,
    pub page: Box<[u8]>,
}

impl NodeInner {
    pub fn is_dirty(&self) -> bool {
        matches!(self.state, CachedState::Dirty(_))
    }
}

pub struct Node {
    /// Back-reference to the owning `Arc`, so guards can keep the node
    /// alive past the borrow they were created from.
    self_ref: Weak<Node>,
    /// Current page id; 0 while the node is unbacked.
    id: AtomicU64,
    latch: RawLatch,
    inner: UnsafeCell<NodeInner>,
    /// Head of the intrusive list of cursor frames bound to this node.
    pub(crate) frames: FrameList,
    /// LRU stamp maintained by the cache.
    pub(crate) access: AtomicU64,
    /// Tree roots stay resident.
    pub(crate) pinned: AtomicBool,
    /// Whether the node currently sits in the dirty list.
    pub(crate) in_dirty: AtomicBool,
}

// The UnsafeCell is only dereferenced while the latch is held in the
// matching mode; the guards below are the sole access path.
unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("pinned", &self.pinned.load(Ordering::Relaxed))
            .finish()
    }
}

impl Node {
    pub fn new(page_size: usize) -> Arc<Node> {
        Arc::new_cyclic(|weak| Node {
            self_ref: weak.clone(),
            id: AtomicU64::new(NO_PAGE),
            latch: RawLatch::new(),
            inner: UnsafeCell::new(NodeInner {
                kind: NodeKind::Empty,
                state: CachedState::Clean,
                page: vec![0u8; page_size].into_boxed_slice(),
            }),
            frames: FrameList::new(),
            access: AtomicU64::new(0),
            pinned: AtomicBool::new(false),
            in_dirty: AtomicBool::new(false),
        })
    }

    fn arc(&self) -> Arc<Node> {
        self.self_ref.upgrade().expect("node still referenced")
    }

    pub fn id(&self) -> PageId {
        self.id.load(Ordering::Acquire)
    }

    /// Only while holding the exclusive latch.
    pub(crate) fn set_id(&self, id: PageId) {
        self.id.store(id, Ordering::Release);
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    pub fn set_pinned(&self, pinned: bool) {
        self.pinned.store(pinned, Ordering::Release);
    }

    pub fn has_frames(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn latch(&self) -> &RawLatch {
        &self.latch
    }

    pub fn read(&self) -> NodeReadGuard {
        self.latch.acquire_shared();
        NodeReadGuard { node: self.arc() }
    }

    pub fn write(&self) -> NodeWriteGuard {
        self.latch.acquire_exclusive();
        NodeWriteGuard { node: self.arc() }
    }

    pub fn try_read(&self) -> Option<NodeReadGuard> {
        if self.latch.try_acquire_shared() {
            Some(NodeReadGuard { node: self.arc() })
        } else {
            None
        }
    }

    pub fn try_write(&self) -> Option<NodeWriteGuard> {
        if self.latch.try_acquire_exclusive() {
            Some(NodeWriteGuard { node: self.arc() })
        } else {
            None
        }
    }
}

/// Shared-latched view. The guard owns a reference to the node, so it can
/// outlive the binding it was created from; hand-over-hand descent keeps
/// the child guard while dropping the parent's.
pub struct NodeReadGuard {
    node: Arc<Node>,
}

impl NodeReadGuard {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Try to convert to exclusive; only succeeds as the sole holder.
    pub fn try_upgrade(self) -> std::result::Result<NodeWriteGuard, NodeReadGuard> {
        if self.node.latch.try_upgrade() {
            let node = self.node.clone();
            std::mem::forget(self);
            Ok(NodeWriteGuard { node })
        } else {
            Err(self)
        }
    }
}

impl Deref for NodeReadGuard {
    type Target = NodeInner;
    fn deref(&self) -> &NodeInner {
        unsafe { &*self.node.inner.get() }
    }
}

impl Drop for NodeReadGuard {
    fn drop(&mut self) {
        self.node.latch.release_shared();
    }
}

/// Exclusive-latched view.
pub struct NodeWriteGuard {
    node: Arc<Node>,
}

impl NodeWriteGuard {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn set_id(&mut self, id: PageId) {
        self.node.set_id(id);
    }

    pub fn downgrade(self) -> NodeReadGuard {
        let node = self.node.clone();
        std::mem::forget(self);
        node.latch.downgrade();
        NodeReadGuard { node }
    }
}

impl Deref for NodeWriteGuard {
    type Target = NodeInner;
    fn deref(&self) -> &NodeInner {
        unsafe { &*self.node.inner.get() }
    }
}

impl DerefMut for NodeWriteGuard {
    fn deref_mut(&mut self) -> &mut NodeInner {
        unsafe { &mut *self.node.inner.get() }
    }
}

impl Drop for NodeWriteGuard {
    fn drop(&mut self) {
        self.node.latch.release_exclusive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_enforce_exclusion() {
        let node = Node::new(512);
        let r1 = node.read();
        let r2 = node.read();
        assert!(node.try_write().is_none());
        drop(r1);
        drop(r2);
        let mut w = node.write();
        w.kind = NodeKind::Leaf;
        w.page[0] = 9;
        assert!(node.try_read().is_none());
        let r = w.downgrade();
        assert_eq!(r.kind, NodeKind::Leaf);
        assert_eq!(r.page[0], 9);
        assert!(node.try_read().is_some());
    }

    #[test]
    fn upgrade_from_sole_reader() {
        let node = Node::new(512);
        let r = node.read();
        let w = r.try_upgrade().ok().expect("sole reader upgrades");
        drop(w);
        let r1 = node.read();
        let r2 = node.read();
        assert!(r2.try_upgrade().is_err());
        drop(r1);
    }
}

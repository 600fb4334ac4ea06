//! Cursor frames: one per level of a cursor's descent, bound to the node
//! it references through a small mutex-guarded per-node list.
//!
//! Structural modifications (split, merge, eviction checks) must visit
//! every frame bound to a node exactly once, while unrelated cursors keep
//! binding and unbinding their own frames. The list is per-node, so the
//! only contention is between cursors sitting on the same node; bind,
//! unbind, and rebind are each atomic under the owning node's list lock.
//!
//! Lock order: node frame list before frame binding. Never two frame lists
//! at once. A binder that finds its frame migrated underneath it retries
//! against the new node.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::storage::node::Node;

/// Position encoding for leaf frames: a non-negative value is an exact
/// entry index; a missed search stores the one's complement of the
/// insertion point.
pub fn not_found(insert_idx: usize) -> i32 {
    !(insert_idx as i32)
}

pub fn insertion_point(pos: i32) -> usize {
    debug_assert!(pos < 0);
    (!pos) as usize
}

#[derive(Debug, Default)]
pub(crate) struct Binding {
    pub node: Option<Arc<Node>>,
    pub pos: i32,
    /// Retained key for leaf frames that missed an exact match.
    pub not_found_key: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct CursorFrame {
    self_ref: Weak<CursorFrame>,
    /// One level up in the cursor's chain. Mutable because height changes
    /// splice levels in and out underneath parked cursors.
    parent: Mutex<Option<Arc<CursorFrame>>>,
    pub(crate) binding: Mutex<Binding>,
}

impl CursorFrame {
    pub fn new(parent: Option<Arc<CursorFrame>>) -> Arc<CursorFrame> {
        Arc::new_cyclic(|weak| CursorFrame {
            self_ref: weak.clone(),
            parent: Mutex::new(parent),
            binding: Mutex::new(Binding::default()),
        })
    }

    fn arc(&self) -> Arc<CursorFrame> {
        self.self_ref.upgrade().expect("frame still referenced")
    }

    pub fn parent(&self) -> Option<Arc<CursorFrame>> {
        self.parent.lock().clone()
    }

    pub fn set_parent(&self, parent: Option<Arc<CursorFrame>>) {
        *self.parent.lock() = parent;
    }

    pub fn node(&self) -> Option<Arc<Node>> {
        self.binding.lock().node.clone()
    }

    pub fn pos(&self) -> i32 {
        self.binding.lock().pos
    }

    pub fn set_pos(&self, pos: i32) {
        self.binding.lock().pos = pos;
    }

    pub fn not_found_key(&self) -> Option<Vec<u8>> {
        self.binding.lock().not_found_key.clone()
    }

    pub fn set_not_found_key(&self, key: Option<Vec<u8>>) {
        self.binding.lock().not_found_key = key;
    }

    /// Bind to `node` at `pos`. The frame must be unbound.
    pub fn bind(&self, node: &Arc<Node>, pos: i32) {
        let mut list = node.frames.inner.lock();
        let mut b = self.binding.lock();
        debug_assert!(b.node.is_none(), "bind of an already-bound frame");
        b.node = Some(node.clone());
        b.pos = pos;
        list.push(self.arc());
    }

    /// Detach from whatever node the frame is currently bound to. Safe to
    /// call on an unbound frame. Loops when a concurrent structural change
    /// migrates the frame mid-unbind.
    pub fn unbind(&self) {
        loop {
            let node = match self.binding.lock().node.clone() {
                None => return,
                Some(n) => n,
            };
            let mut list = node.frames.inner.lock();
            let mut b = self.binding.lock();
            match &b.node {
                Some(n) if Arc::ptr_eq(n, &node) => {
                    let idx = list
                        .iter()
                        .position(|f| std::ptr::eq(Arc::as_ptr(f), self))
                        .expect("bound frame present in node list");
                    list.swap_remove(idx);
                    b.node = None;
                    b.not_found_key = None;
                    return;
                }
                _ => {
                    // Migrated while we were acquiring; retry on the new
                    // binding.
                    drop(b);
                    drop(list);
                }
            }
        }
    }

    /// Atomically move the binding to `to` at `new_pos`. A concurrent
    /// unbind never observes the frame as unbound partway through.
    pub fn rebind(&self, to: &Arc<Node>, new_pos: i32) {
        self.unbind();
        self.bind(to, new_pos);
    }
}

/// Per-node list head; the final element is the most recent binding.
#[derive(Debug, Default)]
pub struct FrameList {
    pub(crate) inner: Mutex<Vec<Arc<CursorFrame>>>,
}

impl FrameList {
    pub fn new() -> FrameList {
        FrameList::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Snapshot for structural visitors. Callers hold the node's exclusive
    /// latch, so no bind can slip in afterwards; unbinds are tolerated by
    /// revalidating per frame.
    pub fn snapshot(&self) -> Vec<Arc<CursorFrame>> {
        self.inner.lock().clone()
    }
}

/// What a structural visitor decided for one frame.
pub enum FrameMove {
    Keep(i32),
    MoveTo(Arc<Node>, i32),
}

/// Visit every frame bound to `node` and apply the decision returned by
/// `decide`, relocating frames into their new home where requested. The
/// caller must hold `node` exclusively, and hold the target node of any
/// `MoveTo` exclusively as well.
pub fn relocate_frames(
    node: &Arc<Node>,
    mut decide: impl FnMut(i32, Option<&[u8]>) -> FrameMove,
) {
    for frame in node.frames.snapshot() {
        let decision;
        {
            let mut list = node.frames.inner.lock();
            let mut b = frame.binding.lock();
            match &b.node {
                Some(n) if Arc::ptr_eq(n, node) => {}
                // The cursor unbound itself in the meantime.
                _ => continue,
            }
            decision = decide(b.pos, b.not_found_key.as_deref());
            match &decision {
                FrameMove::Keep(pos) => {
                    b.pos = *pos;
                    continue;
                }
                FrameMove::MoveTo(_, pos) => {
                    let idx = list
                        .iter()
                        .position(|f| Arc::ptr_eq(f, &frame))
                        .expect("bound frame present in node list");
                    list.swap_remove(idx);
                    b.pos = *pos;
                    b.node = None;
                }
            }
        }
        if let FrameMove::MoveTo(to, pos) = decision {
            let mut list = to.frames.inner.lock();
            let mut b = frame.binding.lock();
            b.node = Some(to.clone());
            b.pos = pos;
            list.push(frame.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::node::Node;

    #[test]
    fn bind_unbind_roundtrip() {
        let node = Node::new(512);
        let frame = CursorFrame::new(None);
        assert!(node.frames.is_empty());
        frame.bind(&node, 3);
        assert_eq!(node.frames.len(), 1);
        assert_eq!(frame.pos(), 3);
        assert!(Arc::ptr_eq(&frame.node().unwrap(), &node));
        frame.unbind();
        assert!(node.frames.is_empty());
        assert!(frame.node().is_none());
        // Idempotent.
        frame.unbind();
    }

    #[test]
    fn rebind_moves_between_nodes() {
        let a = Node::new(512);
        let b = Node::new(512);
        let frame = CursorFrame::new(None);
        frame.bind(&a, 0);
        frame.rebind(&b, 7);
        assert!(a.frames.is_empty());
        assert_eq!(b.frames.len(), 1);
        assert_eq!(frame.pos(), 7);
    }

    #[test]
    fn relocate_splits_by_position() {
        let left = Node::new(512);
        let right = Node::new(512);
        let low = CursorFrame::new(None);
        let high = CursorFrame::new(None);
        low.bind(&left, 1);
        high.bind(&left, 5);

        let split_pos = 3;
        relocate_frames(&left, |pos, _| {
            if pos >= split_pos {
                FrameMove::MoveTo(right.clone(), pos - split_pos)
            } else {
                FrameMove::Keep(pos)
            }
        });

        assert_eq!(left.frames.len(), 1);
        assert_eq!(right.frames.len(), 1);
        assert_eq!(low.pos(), 1);
        assert_eq!(high.pos(), 2);
        assert!(Arc::ptr_eq(&high.node().unwrap(), &right));
    }

    #[test]
    fn parent_chain_terminates() {
        let root = CursorFrame::new(None);
        let mid = CursorFrame::new(Some(root.clone()));
        let leaf = CursorFrame::new(Some(mid.clone()));
        let mut depth = 0;
        let mut cur = Some(leaf);
        while let Some(f) = cur {
            depth += 1;
            cur = f.parent();
        }
        assert_eq!(depth, 3);
    }
}

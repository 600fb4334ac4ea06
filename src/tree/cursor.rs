//! Tree cursors: a chain of frames, one per level, bound to the nodes of
//! the current descent path.
//!
//! Within a leaf, iteration just advances the frame position under the
//! leaf's shared latch. Crossing a leaf boundary ascends the frame chain
//! to the first ancestor with another child, then re-descends along the
//! edge of the new subtree, rebinding the existing frames level by level.
//! Structural modifications relocate bound frames under the node's
//! exclusive latch, so whatever this cursor observes after re-latching is
//! a consistent position in key order.

use std::sync::Arc;

use crate::core::errors::{Result, TuplError};
use crate::db::DbCore;
use crate::storage::node::NodeKind;
use crate::tree::frame::{insertion_point, not_found, CursorFrame};
use crate::tree::page::{InternalPage, LeafPage, GHOST};
use crate::tree::Tree;

pub struct Cursor {
    tree: Arc<Tree>,
    leaf: Option<Arc<CursorFrame>>,
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("tree", &self.tree.id)
            .field("key", &self.key)
            .finish()
    }
}

impl Cursor {
    pub(crate) fn new(tree: Arc<Tree>) -> Cursor {
        Cursor {
            tree,
            leaf: None,
            key: None,
            value: None,
        }
    }

    /// Key at the current position, if positioned.
    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// Value at the current position; `None` when positioned at a missing
    /// key.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Unbind every frame and forget the position.
    pub fn reset(&mut self) {
        let mut frame = self.leaf.take();
        while let Some(f) = frame {
            let parent = f.parent();
            f.unbind();
            frame = parent;
        }
        self.key = None;
        self.value = None;
    }

    /// Position at `key`. Returns the value when the key exists.
    pub fn find(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.reset();
        let core = self.tree.core()?;
        let mut parent_frame: Option<Arc<CursorFrame>> = None;
        let mut guard = self.tree.root().read();
        loop {
            match guard.kind {
                NodeKind::Internal => {
                    let (idx, child_id) = {
                        let internal = InternalPage::open(&guard.page)?;
                        let idx = Tree::child_index(&core, &internal, key)?;
                        (idx, internal.child_id(idx)?)
                    };
                    let frame = CursorFrame::new(parent_frame.take());
                    frame.bind(guard.node(), idx as i32);
                    parent_frame = Some(frame);
                    let child = Tree::latch_child_shared(&core, child_id)?;
                    guard = child;
                }
                NodeKind::Leaf => {
                    let leaf = LeafPage::open(&guard.page)?;
                    let (idx, found) = Tree::search_leaf(&core, &leaf, key)?;
                    let frame = CursorFrame::new(parent_frame.take());
                    if found {
                        frame.bind(guard.node(), idx as i32);
                        let (flags, stored) = leaf.value_at(idx)?;
                        self.value = Tree::materialize(&core, flags, stored)?;
                    } else {
                        frame.bind(guard.node(), not_found(idx));
                        frame.set_not_found_key(Some(key.to_vec()));
                        self.value = None;
                    }
                    self.leaf = Some(frame);
                    self.key = Some(key.to_vec());
                    return Ok(self.value.clone());
                }
                _ => {
                    return Err(TuplError::CorruptDatabase(
                        "cursor descended into a non-tree page".into(),
                    ))
                }
            }
        }
    }

    /// Position at `key`, starting from the current leaf when the key
    /// falls inside its range. Sequential access in key order then skips
    /// the full descent.
    pub fn find_nearby(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let core = self.tree.core()?;
        let Some(frame) = self.leaf.clone() else {
            return self.find(key);
        };
        let Some(node) = frame.node() else {
            return self.find(key);
        };
        let guard = node.read();
        let still_bound = frame
            .node()
            .map_or(false, |n| Arc::ptr_eq(&n, &node));
        if !still_bound || guard.kind != NodeKind::Leaf {
            drop(guard);
            return self.find(key);
        }
        let leaf = LeafPage::open(&guard.page)?;
        let n = leaf.slot_count();
        if n == 0 {
            drop(guard);
            return self.find(key);
        }
        let (first_flags, first) = leaf.key_at(0)?;
        let (last_flags, last) = leaf.key_at(n - 1)?;
        let first_key = Tree::decode_key(&core, first_flags, first)?;
        let last_key = Tree::decode_key(&core, last_flags, last)?;
        if key < first_key.as_slice() || key > last_key.as_slice() {
            drop(guard);
            return self.find(key);
        }

        let (idx, found) = Tree::search_leaf(&core, &leaf, key)?;
        if found {
            frame.set_pos(idx as i32);
            frame.set_not_found_key(None);
            let (flags, stored) = leaf.value_at(idx)?;
            self.value = Tree::materialize(&core, flags, stored)?;
        } else {
            frame.set_pos(not_found(idx));
            frame.set_not_found_key(Some(key.to_vec()));
            self.value = None;
        }
        self.key = Some(key.to_vec());
        Ok(self.value.clone())
    }

    /// Position at the first entry. Returns false on an empty tree.
    pub fn first(&mut self) -> Result<bool> {
        self.find(&[])?;
        if self.value.is_some() {
            return Ok(true);
        }
        self.next()
    }

    /// Position at the last entry. Returns false on an empty tree.
    pub fn last(&mut self) -> Result<bool> {
        self.reset();
        let core = self.tree.core()?;
        let mut parent_frame: Option<Arc<CursorFrame>> = None;
        let mut guard = self.tree.root().read();
        loop {
            match guard.kind {
                NodeKind::Internal => {
                    let (idx, child_id) = {
                        let internal = InternalPage::open(&guard.page)?;
                        let idx = internal.slot_count();
                        (idx, internal.child_id(idx)?)
                    };
                    let frame = CursorFrame::new(parent_frame.take());
                    frame.bind(guard.node(), idx as i32);
                    parent_frame = Some(frame);
                    guard = Tree::latch_child_shared(&core, child_id)?;
                }
                NodeKind::Leaf => {
                    let n = LeafPage::open(&guard.page)?.slot_count();
                    let frame = CursorFrame::new(parent_frame.take());
                    frame.bind(guard.node(), not_found(n));
                    self.leaf = Some(frame);
                    drop(guard);
                    return self.previous();
                }
                _ => {
                    return Err(TuplError::CorruptDatabase(
                        "cursor descended into a non-tree page".into(),
                    ))
                }
            }
        }
    }

    /// Advance to the next non-ghost entry in key order.
    pub fn next(&mut self) -> Result<bool> {
        self.step(true)
    }

    /// Step back to the previous non-ghost entry in key order.
    pub fn previous(&mut self) -> Result<bool> {
        self.step(false)
    }

    fn step(&mut self, forward: bool) -> Result<bool> {
        let core = self.tree.core()?;
        loop {
            let Some(frame) = self.leaf.clone() else {
                return Ok(false);
            };
            let Some(node) = frame.node() else {
                // The frame came unbound underneath us; rebuild from the
                // remembered key.
                let Some(key) = self.key.clone() else {
                    return Ok(false);
                };
                self.find(&key)?;
                continue;
            };
            let guard = node.read();
            let still_bound = frame
                .node()
                .map_or(false, |n| Arc::ptr_eq(&n, &node));
            if !still_bound || guard.kind != NodeKind::Leaf {
                drop(guard);
                continue;
            }

            let leaf = LeafPage::open(&guard.page)?;
            let n = leaf.slot_count() as i32;
            let pos = frame.pos();
            let mut p = if forward {
                if pos >= 0 {
                    pos + 1
                } else {
                    insertion_point(pos) as i32
                }
            } else if pos >= 0 {
                pos - 1
            } else {
                insertion_point(pos) as i32 - 1
            };

            while p >= 0 && p < n {
                let flags = leaf.flags_at(p as usize)?;
                if flags & GHOST == 0 {
                    frame.set_pos(p);
                    frame.set_not_found_key(None);
                    let (kf, kstored) = leaf.key_at(p as usize)?;
                    let (vf, vstored) = leaf.value_at(p as usize)?;
                    self.key = Some(Tree::decode_key(&core, kf, kstored)?);
                    self.value = Tree::materialize(&core, vf, vstored)?;
                    return Ok(true);
                }
                p += if forward { 1 } else { -1 };
            }
            drop(guard);

            // Leaf exhausted; hop to the adjacent one.
            match self.advance_leaf(&core, forward)? {
                Hop::Moved => continue,
                Hop::End => {
                    self.key = None;
                    self.value = None;
                    return Ok(false);
                }
                Hop::Rebuild => {
                    let Some(key) = self.key.clone() else {
                        return Ok(false);
                    };
                    self.find(&key)?;
                    continue;
                }
            }
        }
    }

    /// Move the frame chain to the adjacent leaf in `forward` direction.
    fn advance_leaf(&mut self, core: &Arc<DbCore>, forward: bool) -> Result<Hop> {
        let Some(leaf_frame) = self.leaf.clone() else {
            return Ok(Hop::End);
        };
        // Leaf-to-root chain; chain[0] is the leaf.
        let mut chain = vec![leaf_frame];
        while let Some(p) = chain.last().expect("non-empty").parent() {
            chain.push(p);
        }

        for level in 1..chain.len() {
            let pframe = &chain[level];
            let Some(pnode) = pframe.node() else {
                return Ok(Hop::Rebuild);
            };
            let pguard = pnode.read();
            let still_bound = pframe
                .node()
                .map_or(false, |n| Arc::ptr_eq(&n, &pnode));
            if !still_bound || pguard.kind != NodeKind::Internal {
                return Ok(Hop::Rebuild);
            }
            let internal = InternalPage::open(&pguard.page)?;
            let cur = pframe.pos();
            let next = if forward { cur + 1 } else { cur - 1 };
            if next < 0 || next as usize > internal.slot_count() {
                // This ancestor is exhausted as well.
                continue;
            }
            pframe.set_pos(next);

            // Re-descend along the near edge of the new subtree, rebinding
            // the frames below this level.
            let mut child_id = internal.child_id(next as usize)?;
            let mut upper = pguard;
            for l in (0..level).rev() {
                let cguard = Tree::latch_child_shared(core, child_id)?;
                drop(upper);
                let f = &chain[l];
                match cguard.kind {
                    NodeKind::Internal => {
                        if l == 0 {
                            return Ok(Hop::Rebuild);
                        }
                        let inner = InternalPage::open(&cguard.page)?;
                        let slot = if forward { 0 } else { inner.slot_count() };
                        f.rebind(cguard.node(), slot as i32);
                        child_id = inner.child_id(slot)?;
                        upper = cguard;
                    }
                    NodeKind::Leaf => {
                        if l != 0 {
                            return Ok(Hop::Rebuild);
                        }
                        let n = LeafPage::open(&cguard.page)?.slot_count();
                        let pos = if forward { not_found(0) } else { not_found(n) };
                        f.rebind(cguard.node(), pos);
                        return Ok(Hop::Moved);
                    }
                    _ => return Ok(Hop::Rebuild),
                }
            }
            return Ok(Hop::Rebuild);
        }
        Ok(Hop::End)
    }
}

enum Hop {
    Moved,
    End,
    Rebuild,
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.reset();
    }
}

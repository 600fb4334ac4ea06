//! B-tree structural operations.
//!
//! Reads descend hand-over-hand under shared latches. Mutations re-descend
//! with exclusive latches, dirtying the whole path top-down: under
//! copy-on-write every ancestor's child pointer changes when a page is
//! relocated, so the path is going to be rewritten anyway.
//!
//! The root node object is stable for the life of the tree: splits that
//! grow the height push the old root contents down into fresh children,
//! and height shrinks pull the last child back up. Cursor frames bound to
//! affected nodes are relocated inside the same exclusive critical
//! section, so iteration stays consistent across concurrent structural
//! changes.

pub mod cursor;
pub mod frame;
pub mod page;

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;

use crate::core::errors::{Result, TuplError};
use crate::db::DbCore;
use crate::storage::node::{CachedState, Node, NodeKind, NodeReadGuard, NodeWriteGuard};
use crate::storage::node_cache::LoadKind;
use crate::storage::{PageId, NO_PAGE};
use crate::tree::frame::{insertion_point, not_found, CursorFrame, FrameMove};
use crate::tree::page::{
    InternalEntry, InternalPage, InternalPageMut, LeafEntry, LeafPage, LeafPageMut, GHOST,
    INTERNAL_HEADER, KEY_FRAGMENTED, LEAF_HEADER, VALUE_FRAGMENTED,
};

pub use cursor::Cursor;

/// Reserved internal tree ids; user trees start above these.
pub const REGISTRY_TREE_ID: u64 = 1;
pub const NAME_MAP_TREE_ID: u64 = 2;
pub const TRASH_TREE_ID: u64 = 3;
pub const FIRST_USER_TREE_ID: u64 = 16;

const SLOT_SIZE: usize = 4;
const LEAF_RECORD_HEADER: usize = 5;
const INTERNAL_RECORD_HEADER: usize = 3;
const CHILD_ID_SIZE: usize = 6;

/// Largest key stored inline; anything longer becomes a fragment directory.
pub fn max_inline_key(page_size: usize) -> usize {
    16383usize.min(page_size / 2 - 22)
}

/// Largest value stored inline in a leaf.
pub fn max_inline_value(page_size: usize) -> usize {
    3 * (page_size - LEAF_HEADER) / 4
}

/// Merge when a node's live bytes fall below a quarter of the page.
fn underfull_limit(page_size: usize) -> usize {
    page_size / 4
}

fn page_cap(page_size: usize) -> usize {
    page_size.min(u16::MAX as usize)
}

/// A stored value in its on-page form: possibly a fragment directory,
/// possibly ghosted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawValue {
    pub flags: u8,
    pub bytes: Vec<u8>,
}

impl RawValue {
    pub fn is_fragmented(&self) -> bool {
        self.flags & VALUE_FRAGMENTED != 0
    }

    pub fn is_ghost(&self) -> bool {
        self.flags & GHOST != 0
    }
}

pub struct Tree {
    db: Weak<DbCore>,
    pub id: u64,
    pub name: Mutex<Option<Vec<u8>>>,
    root: Arc<Node>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("id", &self.id)
            .field("root", &self.root.id())
            .finish()
    }
}

impl Tree {
    pub(crate) fn new(
        db: Weak<DbCore>,
        id: u64,
        name: Option<Vec<u8>>,
        root: Arc<Node>,
    ) -> Arc<Tree> {
        root.set_pinned(true);
        Arc::new(Tree {
            db,
            id,
            name: Mutex::new(name),
            root,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn core(&self) -> Result<Arc<DbCore>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TuplError::ClosedIndex);
        }
        self.db
            .upgrade()
            .ok_or(TuplError::DatabaseClosed { cause: None })
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    pub fn root_id(&self) -> PageId {
        self.root.id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    // ---- key comparison ----------------------------------------------

    fn cmp_stored(core: &DbCore, flags: u8, stored: &[u8], probe: &[u8]) -> Result<CmpOrdering> {
        if flags & KEY_FRAGMENTED != 0 {
            let full = core.fragmenter().reconstruct(stored)?;
            Ok(full.as_slice().cmp(probe))
        } else {
            Ok(stored.cmp(probe))
        }
    }

    /// Lower-bound binary search over leaf slots: `(idx, true)` on an exact
    /// match, `(insertion_point, false)` otherwise.
    pub(crate) fn search_leaf(
        core: &DbCore,
        leaf: &LeafPage<'_>,
        probe: &[u8],
    ) -> Result<(usize, bool)> {
        let mut lo = 0usize;
        let mut hi = leaf.slot_count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let (flags, stored) = leaf.key_at(mid)?;
            match Self::cmp_stored(core, flags, stored, probe)? {
                CmpOrdering::Less => lo = mid + 1,
                CmpOrdering::Equal => return Ok((mid, true)),
                CmpOrdering::Greater => hi = mid,
            }
        }
        Ok((lo, false))
    }

    /// Child index to descend into: the number of separators at or below
    /// the probe. A probe equal to a separator belongs to the right child,
    /// since each separator is a lower bound of its right subtree.
    pub(crate) fn child_index(
        core: &DbCore,
        internal: &InternalPage<'_>,
        probe: &[u8],
    ) -> Result<usize> {
        let mut lo = 0usize;
        let mut hi = internal.slot_count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let (flags, stored) = internal.key_at(mid)?;
            match Self::cmp_stored(core, flags, stored, probe)? {
                CmpOrdering::Greater => hi = mid,
                _ => lo = mid + 1,
            }
        }
        Ok(lo)
    }

    // ---- shared-latch descent ----------------------------------------

    /// Latch a child shared, retrying when eviction won the race between
    /// the map lookup and the latch.
    pub(crate) fn latch_child_shared(core: &DbCore, child_id: PageId) -> Result<NodeReadGuard> {
        loop {
            let node = core
                .cache
                .get_or_load(core.store.as_ref(), child_id, LoadKind::Tree)?;
            let guard = node.read();
            if node.id() == child_id && guard.kind != NodeKind::Empty {
                return Ok(guard);
            }
        }
    }

    fn latch_child_exclusive(core: &DbCore, child_id: PageId) -> Result<NodeWriteGuard> {
        loop {
            let node = core
                .cache
                .get_or_load(core.store.as_ref(), child_id, LoadKind::Tree)?;
            let guard = node.write();
            if node.id() == child_id && guard.kind != NodeKind::Empty {
                return Ok(guard);
            }
        }
    }

    /// Read a value without binding any frames.
    pub fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let core = self.core()?;
        let mut guard = self.root.read();
        loop {
            match guard.kind {
                NodeKind::Internal => {
                    let child_id = {
                        let internal = InternalPage::open(&guard.page)?;
                        let idx = Self::child_index(&core, &internal, key)?;
                        internal.child_id(idx)?
                    };
                    guard = Self::latch_child_shared(&core, child_id)?;
                }
                NodeKind::Leaf => {
                    let leaf = LeafPage::open(&guard.page)?;
                    let (idx, found) = Self::search_leaf(&core, &leaf, key)?;
                    if !found {
                        return Ok(None);
                    }
                    let (flags, stored) = leaf.value_at(idx)?;
                    return Self::materialize(&core, flags, stored);
                }
                _ => {
                    return Err(TuplError::CorruptDatabase(format!(
                        "tree {} descended into a non-tree page",
                        self.id
                    )))
                }
            }
        }
    }

    pub(crate) fn materialize(core: &DbCore, flags: u8, stored: &[u8]) -> Result<Option<Vec<u8>>> {
        if flags & GHOST != 0 {
            return Ok(None);
        }
        if flags & VALUE_FRAGMENTED != 0 {
            return core.fragmenter().reconstruct(stored).map(Some);
        }
        Ok(Some(stored.to_vec()))
    }

    /// Decode a stored key back to user form.
    pub(crate) fn decode_key(core: &DbCore, flags: u8, stored: &[u8]) -> Result<Vec<u8>> {
        if flags & KEY_FRAGMENTED != 0 {
            core.fragmenter().reconstruct(stored)
        } else {
            Ok(stored.to_vec())
        }
    }

    // ---- exclusive-latch mutation path -------------------------------

    /// Exclusive descent to the leaf for `key`, dirtying the whole path and
    /// patching child pointers as copy-on-write relocates pages.
    fn descend_mut(&self, core: &DbCore, key: &[u8]) -> Result<MutPath> {
        let mut guard = self.root.write();
        core.mark_dirty(&mut guard)?;
        let mut stack: Vec<(NodeWriteGuard, usize)> = Vec::new();
        loop {
            match guard.kind {
                NodeKind::Internal => {
                    let (idx, child_id) = {
                        let internal = InternalPage::open(&guard.page)?;
                        let idx = Self::child_index(core, &internal, key)?;
                        (idx, internal.child_id(idx)?)
                    };
                    let mut child = Self::latch_child_exclusive(core, child_id)?;
                    if let Some((_, new_id)) = core.mark_dirty(&mut child)? {
                        let mut internal = InternalPageMut::open(&mut guard.page)?;
                        internal.set_child_id(idx, new_id)?;
                    }
                    stack.push((guard, idx));
                    guard = child;
                }
                NodeKind::Leaf => return Ok(MutPath { stack, leaf: guard }),
                _ => {
                    return Err(TuplError::CorruptDatabase(format!(
                        "tree {} descended into a non-tree page",
                        self.id
                    )))
                }
            }
        }
    }

    /// Insert or replace. Returns the previous stored value, still in its
    /// on-page form; the caller owns the fate of any fragment pages it
    /// references.
    pub fn store(&self, key: &[u8], value: &[u8]) -> Result<Option<RawValue>> {
        let core = self.core()?;
        let page_size = core.cache.page_size();
        // An entry must fit an empty leaf on its own, so the value budget
        // shrinks as the stored key (or its directory) grows.
        let key_est = key.len().min(max_inline_key(page_size));
        let room = page_cap(page_size)
            .saturating_sub(LEAF_HEADER + SLOT_SIZE + LEAF_RECORD_HEADER + key_est);
        let budget = max_inline_value(page_size).min(room);
        let (vflags, vbytes) = if value.len() <= budget {
            (0, value.to_vec())
        } else {
            (VALUE_FRAGMENTED, core.fragmenter().fragment(value, budget)?)
        };
        self.store_encoded(&core, key, vflags, &vbytes)
    }

    /// Restore an entry in its exact stored form (rollback and recovery).
    /// Returns whatever stored value it displaced.
    pub fn store_raw(&self, key: &[u8], flags: u8, bytes: &[u8]) -> Result<Option<RawValue>> {
        let core = self.core()?;
        self.store_encoded(&core, key, flags, bytes)
    }

    fn store_encoded(
        &self,
        core: &Arc<DbCore>,
        key: &[u8],
        vflags: u8,
        vbytes: &[u8],
    ) -> Result<Option<RawValue>> {
        let page_size = core.cache.page_size();
        let mut path = self.descend_mut(core, key)?;

        let (idx, found) = {
            let leaf = LeafPage::open(&path.leaf.page)?;
            Self::search_leaf(core, &leaf, key)?
        };

        if found {
            let (old, keep_key_flags) = {
                let leaf = LeafPage::open(&path.leaf.page)?;
                let (flags, stored) = leaf.value_at(idx)?;
                let kf = leaf.key_at(idx)?.0 & KEY_FRAGMENTED;
                (
                    RawValue {
                        flags,
                        bytes: stored.to_vec(),
                    },
                    kf,
                )
            };
            let fits = {
                let mut leaf = LeafPageMut::open(&mut path.leaf.page)?;
                leaf.replace_at(idx, keep_key_flags | vflags, vbytes)?
            };
            if !fits {
                self.split_leaf(core, path, LeafOp::ReplaceAt(idx), vflags, None, vbytes)?;
            }
            Ok(Some(old))
        } else {
            let (kflags, kbytes) = self.encode_key(core, key, page_size)?;
            let fits = {
                let mut leaf = LeafPageMut::open(&mut path.leaf.page)?;
                leaf.insert_at(idx, kflags | vflags, &kbytes, vbytes)?
            };
            if fits {
                frames_after_insert(path.leaf.node(), idx);
            } else {
                self.split_leaf(
                    core,
                    path,
                    LeafOp::InsertAt(idx),
                    kflags | vflags,
                    Some(&kbytes),
                    vbytes,
                )?;
            }
            Ok(None)
        }
    }

    /// Physically remove the entry. Fragmented key pages are freed here;
    /// the returned raw value carries any fragmented value directory for
    /// the caller to free or keep.
    pub fn delete(&self, key: &[u8]) -> Result<Option<RawValue>> {
        let core = self.core()?;
        let mut path = self.descend_mut(&core, key)?;
        let (idx, found) = {
            let leaf = LeafPage::open(&path.leaf.page)?;
            Self::search_leaf(&core, &leaf, key)?
        };
        if !found {
            return Ok(None);
        }
        let old = self.remove_leaf_entry(&core, &mut path.leaf, idx)?;
        self.rebalance_after_delete(&core, path)?;
        Ok(Some(old))
    }

    /// Transactional delete: keep the entry, flag it as a ghost. Readers
    /// treat it as absent; commit removes it, rollback clears the flag.
    pub fn mark_ghost(&self, key: &[u8]) -> Result<Option<RawValue>> {
        let core = self.core()?;
        let mut path = self.descend_mut(&core, key)?;
        let (idx, found) = {
            let leaf = LeafPage::open(&path.leaf.page)?;
            Self::search_leaf(&core, &leaf, key)?
        };
        if !found {
            return Ok(None);
        }
        let (vflags, old_bytes) = {
            let leaf = LeafPage::open(&path.leaf.page)?;
            let (flags, stored) = leaf.value_at(idx)?;
            (flags, stored.to_vec())
        };
        if vflags & GHOST != 0 {
            return Ok(None);
        }
        let mut leaf = LeafPageMut::open(&mut path.leaf.page)?;
        leaf.set_flags_at(idx, vflags | GHOST)?;
        Ok(Some(RawValue {
            flags: vflags,
            bytes: old_bytes,
        }))
    }

    /// Clear a ghost flag (rollback of a transactional delete).
    pub fn unmark_ghost(&self, key: &[u8]) -> Result<bool> {
        let core = self.core()?;
        let mut path = self.descend_mut(&core, key)?;
        let (idx, found) = {
            let leaf = LeafPage::open(&path.leaf.page)?;
            Self::search_leaf(&core, &leaf, key)?
        };
        if !found {
            return Ok(false);
        }
        let flags = {
            let leaf = LeafPage::open(&path.leaf.page)?;
            leaf.flags_at(idx)?
        };
        if flags & GHOST == 0 {
            return Ok(false);
        }
        let mut leaf = LeafPageMut::open(&mut path.leaf.page)?;
        leaf.set_flags_at(idx, flags & !GHOST)?;
        Ok(true)
    }

    /// Physically remove an entry, but only while it is still a ghost
    /// (transaction commit finalization).
    pub fn remove_ghost(&self, key: &[u8]) -> Result<Option<RawValue>> {
        let core = self.core()?;
        let mut path = self.descend_mut(&core, key)?;
        let (idx, found) = {
            let leaf = LeafPage::open(&path.leaf.page)?;
            Self::search_leaf(&core, &leaf, key)?
        };
        if !found {
            return Ok(None);
        }
        let flags = {
            let leaf = LeafPage::open(&path.leaf.page)?;
            leaf.flags_at(idx)?
        };
        if flags & GHOST == 0 {
            return Ok(None);
        }
        let old = self.remove_leaf_entry(&core, &mut path.leaf, idx)?;
        self.rebalance_after_delete(&core, path)?;
        Ok(Some(old))
    }

    fn remove_leaf_entry(
        &self,
        core: &DbCore,
        leaf_guard: &mut NodeWriteGuard,
        idx: usize,
    ) -> Result<RawValue> {
        let (kflags, kbytes, vflags, vbytes) = {
            let leaf = LeafPage::open(&leaf_guard.page)?;
            let (kf, k) = leaf.key_at(idx)?;
            let (vf, v) = leaf.value_at(idx)?;
            (kf, k.to_vec(), vf, v.to_vec())
        };
        {
            let mut leaf = LeafPageMut::open(&mut leaf_guard.page)?;
            leaf.remove_at(idx)?;
        }
        frames_after_remove(leaf_guard.node(), idx);
        if kflags & KEY_FRAGMENTED != 0 {
            core.fragmenter().delete(&kbytes)?;
        }
        Ok(RawValue {
            flags: vflags,
            bytes: vbytes,
        })
    }

    // ---- encoding ----------------------------------------------------

    fn encode_key(&self, core: &DbCore, key: &[u8], page_size: usize) -> Result<(u8, Vec<u8>)> {
        let limit = max_inline_key(page_size);
        if key.len() <= limit {
            return Ok((0, key.to_vec()));
        }
        let dir = core.fragmenter().fragment(key, limit).map_err(|e| match e {
            TuplError::LargeValue(n) => TuplError::LargeKey(n),
            other => other,
        })?;
        Ok((KEY_FRAGMENTED, dir))
    }

    // ---- split -------------------------------------------------------

    fn new_dirty_node(&self, core: &DbCore, kind: NodeKind) -> Result<NodeWriteGuard> {
        let id = core.store.alloc_page()?;
        let mut guard = core.cache.alloc_latched(core.store.as_ref())?;
        guard.kind = kind;
        guard.state = CachedState::Dirty(core.store.commit_state());
        guard.set_id(id);
        let node = guard.node().clone();
        core.cache.insert(&node);
        core.cache.mark_in_dirty(&node);
        Ok(guard)
    }

    /// Split the leaf at the bottom of `path`, applying the one pending
    /// operation that did not fit, then push the separator upward.
    fn split_leaf(
        &self,
        core: &Arc<DbCore>,
        mut path: MutPath,
        op: LeafOp,
        vflags: u8,
        key: Option<&[u8]>,
        value: &[u8],
    ) -> Result<()> {
        let mut entries = {
            let leaf = LeafPage::open(&path.leaf.page)?;
            leaf.entries()?
        };
        match op {
            LeafOp::ReplaceAt(idx) => {
                entries[idx].flags = vflags | (entries[idx].flags & KEY_FRAGMENTED);
                entries[idx].value = value.to_vec();
            }
            LeafOp::InsertAt(idx) => {
                entries.insert(
                    idx,
                    LeafEntry {
                        flags: vflags,
                        key: key.expect("insert carries a key").to_vec(),
                        value: value.to_vec(),
                    },
                );
                // Frames take positions in the combined entry list first;
                // the relocation below maps them onto the halves.
                frames_after_insert(path.leaf.node(), idx);
            }
        }

        let page_size = core.cache.page_size();
        let split = leaf_split_point(&entries);
        let left_entries = entries[..split].to_vec();
        let right_entries = entries[split..].to_vec();

        // Shortest separator that still routes correctly.
        let sep_full = {
            let l = left_entries.last().expect("left half non-empty");
            let r = right_entries.first().expect("right half non-empty");
            let left_max = Self::decode_key(core, l.flags, &l.key)?;
            let right_min = Self::decode_key(core, r.flags, &r.key)?;
            shortest_separator(&left_max, &right_min)
        };
        let (sep_flags, sep_bytes) = self.encode_key(core, &sep_full, page_size)?;

        let mut right = self.new_dirty_node(core, NodeKind::Leaf)?;
        LeafPageMut::build(&mut right.page, &right_entries)?;
        LeafPageMut::build(&mut path.leaf.page, &left_entries)?;

        let right_node = right.node().clone();
        frame::relocate_frames(path.leaf.node(), |pos, _| split_move(pos, split, &right_node));
        debug!(
            "tree {}: leaf {} split, right sibling {}",
            self.id,
            path.leaf.node().id(),
            right_node.id()
        );
        drop(right);

        self.insert_separator_upward(core, path, sep_flags, sep_bytes, right_node)
    }

    /// Insert `sep -> right` into the ancestors, splitting internal nodes
    /// as needed and growing the root when it overflows.
    fn insert_separator_upward(
        &self,
        core: &Arc<DbCore>,
        mut path: MutPath,
        mut sep_flags: u8,
        mut sep_bytes: Vec<u8>,
        mut right_node: Arc<Node>,
    ) -> Result<()> {
        loop {
            let Some((mut parent, child_idx)) = path.stack.pop() else {
                // `path.leaf` still holds the bottom guard: the root
                // itself, already rebuilt as the left half.
                return self.grow_root_from_leaf(
                    core,
                    path.leaf,
                    sep_flags,
                    sep_bytes,
                    right_node,
                );
            };

            let right_id = right_node.id();
            let fits = {
                let mut internal = InternalPageMut::open(&mut parent.page)?;
                internal.insert_at(child_idx, sep_flags, &sep_bytes, right_id)?
            };
            // Child indexes shift as if the insert happened either way;
            // the split below works on the combined picture.
            frames_after_child_insert(parent.node(), child_idx);
            repoint_parents(&right_node, parent.node(), (child_idx + 1) as i32);
            if fits {
                return Ok(());
            }

            let (first_child, mut entries) = {
                let internal = InternalPage::open(&parent.page)?;
                internal.entries()?
            };
            entries.insert(
                child_idx,
                InternalEntry {
                    flags: sep_flags,
                    key: sep_bytes.clone(),
                    child: right_id,
                },
            );

            if Arc::ptr_eq(parent.node(), &self.root) {
                debug_assert!(path.stack.is_empty());
                return self.grow_root_from_internal(core, parent, first_child, entries);
            }

            let promote = entries.len() / 2;
            let promoted = entries[promote].clone();
            let left_entries = entries[..promote].to_vec();
            let right_entries = entries[promote + 1..].to_vec();

            let mut right = self.new_dirty_node(core, NodeKind::Internal)?;
            InternalPageMut::build(&mut right.page, promoted.child, &right_entries)?;
            InternalPageMut::build(&mut parent.page, first_child, &left_entries)?;

            let new_right = right.node().clone();
            let boundary = (promote + 1) as i32;
            frame::relocate_frames(parent.node(), |pos, _| {
                if pos >= boundary {
                    FrameMove::MoveTo(new_right.clone(), pos - boundary)
                } else {
                    FrameMove::Keep(pos)
                }
            });
            debug!(
                "tree {}: internal {} split, right sibling {}",
                self.id,
                parent.node().id(),
                new_right.id()
            );
            drop(right);

            sep_flags = promoted.flags;
            sep_bytes = promoted.key;
            right_node = new_right;
            // Loop continues with the grandparent.
            path.leaf = parent;
        }
    }

    /// Root was a leaf and split: push its (already rebuilt) left half into
    /// a fresh child and turn the root into a two-child internal node.
    fn grow_root_from_leaf(
        &self,
        core: &Arc<DbCore>,
        mut root_guard: NodeWriteGuard,
        sep_flags: u8,
        sep_bytes: Vec<u8>,
        right_node: Arc<Node>,
    ) -> Result<()> {
        debug_assert!(Arc::ptr_eq(root_guard.node(), &self.root));

        let mut left = self.new_dirty_node(core, root_guard.kind)?;
        left.page.copy_from_slice(&root_guard.page);
        let left_id = left.node().id();
        let left_node = left.node().clone();

        let root_node = self.root.clone();
        frame::relocate_frames(&root_node, |pos, _| {
            FrameMove::MoveTo(left_node.clone(), pos)
        });
        adopt_root_parents(&left_node, &root_node, 0);
        adopt_root_parents(&right_node, &root_node, 1);

        {
            let mut internal = InternalPageMut::init(&mut root_guard.page, left_id)?;
            if !internal.insert_at(0, sep_flags, &sep_bytes, right_node.id())? {
                return Err(TuplError::CorruptDatabase(
                    "separator does not fit an empty root".into(),
                ));
            }
        }
        root_guard.kind = NodeKind::Internal;
        debug!(
            "tree {}: root grew, children {left_id} and {}",
            self.id,
            right_node.id()
        );
        Ok(())
    }

    /// Root was an internal node and its separator list overflowed: split
    /// the combined list into two fresh children around a promoted middle.
    fn grow_root_from_internal(
        &self,
        core: &Arc<DbCore>,
        mut root_guard: NodeWriteGuard,
        first_child: PageId,
        entries: Vec<InternalEntry>,
    ) -> Result<()> {
        let promote = entries.len() / 2;
        let promoted = entries[promote].clone();
        let left_entries = entries[..promote].to_vec();
        let right_entries = entries[promote + 1..].to_vec();

        let mut left = self.new_dirty_node(core, NodeKind::Internal)?;
        InternalPageMut::build(&mut left.page, first_child, &left_entries)?;
        let mut right = self.new_dirty_node(core, NodeKind::Internal)?;
        InternalPageMut::build(&mut right.page, promoted.child, &right_entries)?;

        let left_node = left.node().clone();
        let right_node = right.node().clone();
        let root_node = self.root.clone();
        let boundary = (promote + 1) as i32;
        frame::relocate_frames(&root_node, |pos, _| {
            if pos >= boundary {
                FrameMove::MoveTo(right_node.clone(), pos - boundary)
            } else {
                FrameMove::MoveTo(left_node.clone(), pos)
            }
        });
        adopt_root_parents(&left_node, &root_node, 0);
        adopt_root_parents(&right_node, &root_node, 1);

        {
            let mut internal = InternalPageMut::init(&mut root_guard.page, left_node.id())?;
            if !internal.insert_at(0, promoted.flags, &promoted.key, right_node.id())? {
                return Err(TuplError::CorruptDatabase(
                    "separator does not fit an empty root".into(),
                ));
            }
        }
        debug!(
            "tree {}: root grew, children {} and {}",
            self.id,
            left_node.id(),
            right_node.id()
        );
        Ok(())
    }

    // ---- merge -------------------------------------------------------

    /// After a removal, merge underfull nodes upward and shrink the root
    /// when it ends up with a single child.
    fn rebalance_after_delete(&self, core: &Arc<DbCore>, mut path: MutPath) -> Result<()> {
        let page_size = core.cache.page_size();
        let mut child = path.leaf;

        while let Some((mut parent, child_idx)) = path.stack.pop() {
            let live = match child.kind {
                NodeKind::Leaf => LeafPage::open(&child.page)?.live_bytes()?,
                _ => InternalPage::open(&child.page)?.live_bytes()?,
            };
            if live >= underfull_limit(page_size) {
                return Ok(());
            }
            let merged = self.try_merge_child(core, &mut parent, child_idx, &mut child)?;
            if !merged {
                return Ok(());
            }
            child = parent;
        }

        // Merges reached the top; `child` is the root guard.
        self.shrink_root(core, child)
    }

    /// Merge the child at `child_idx` with an adjacent sibling when their
    /// combined content fits one page. Returns false when nothing changed.
    fn try_merge_child(
        &self,
        core: &Arc<DbCore>,
        parent: &mut NodeWriteGuard,
        child_idx: usize,
        child: &mut NodeWriteGuard,
    ) -> Result<bool> {
        let page_size = core.cache.page_size();
        let sep_count = {
            let internal = InternalPage::open(&parent.page)?;
            internal.slot_count()
        };
        if sep_count == 0 {
            return Ok(false);
        }

        // Prefer merging with the right sibling; the rightmost child pairs
        // with its left neighbour instead.
        let left_idx = if child_idx < sep_count {
            child_idx
        } else {
            child_idx - 1
        };
        let right_idx = left_idx + 1;
        let sep_idx = left_idx;

        let (left_id, right_id) = {
            let internal = InternalPage::open(&parent.page)?;
            (internal.child_id(left_idx)?, internal.child_id(right_idx)?)
        };
        let child_is_left = child.node().id() == left_id;

        let mut other =
            Self::latch_child_exclusive(core, if child_is_left { right_id } else { left_id })?;
        if let Some((_, new_id)) = core.mark_dirty(&mut other)? {
            let mut internal = InternalPageMut::open(&mut parent.page)?;
            internal.set_child_id(if child_is_left { right_idx } else { left_idx }, new_id)?;
        }

        let (survivor, victim): (&mut NodeWriteGuard, &mut NodeWriteGuard) = if child_is_left {
            (child, &mut other)
        } else {
            (&mut other, child)
        };

        match survivor.kind {
            NodeKind::Leaf => {
                let left_entries = LeafPage::open(&survivor.page)?.entries()?;
                let right_entries = LeafPage::open(&victim.page)?.entries()?;
                let combined: usize = LEAF_HEADER
                    + left_entries
                        .iter()
                        .chain(right_entries.iter())
                        .map(|e| SLOT_SIZE + LEAF_RECORD_HEADER + e.key.len() + e.value.len())
                        .sum::<usize>();
                if combined > page_cap(page_size) {
                    return Ok(false);
                }
                let offset = left_entries.len();
                let mut all = left_entries;
                all.extend(right_entries);
                LeafPageMut::build(&mut survivor.page, &all)?;

                let survivor_node = survivor.node().clone();
                frame::relocate_frames(victim.node(), |pos, _| {
                    let new_pos = if pos >= 0 {
                        pos + offset as i32
                    } else {
                        not_found(insertion_point(pos) + offset)
                    };
                    FrameMove::MoveTo(survivor_node.clone(), new_pos)
                });
                repoint_parents(&survivor_node, parent.node(), left_idx as i32);
            }
            NodeKind::Internal => {
                let (l_first, l_entries) = InternalPage::open(&survivor.page)?.entries()?;
                let (r_first, r_entries) = InternalPage::open(&victim.page)?.entries()?;
                let (sep_flags, sep_key) = {
                    let internal = InternalPage::open(&parent.page)?;
                    let (f, k) = internal.key_at(sep_idx)?;
                    (f, k.to_vec())
                };
                // The demoted separator joins the combined entry list.
                let l_len = l_entries.len();
                let mut all = l_entries;
                all.push(InternalEntry {
                    flags: sep_flags,
                    key: sep_key,
                    child: r_first,
                });
                all.extend(r_entries);
                let combined: usize = INTERNAL_HEADER
                    + all
                        .iter()
                        .map(|e| {
                            SLOT_SIZE + INTERNAL_RECORD_HEADER + e.key.len() + CHILD_ID_SIZE
                        })
                        .sum::<usize>();
                if combined > page_cap(page_size) {
                    return Ok(false);
                }
                // Victim child c sits after the left children plus the
                // demoted separator's child.
                let offset = (l_len + 1) as i32;
                InternalPageMut::build(&mut survivor.page, l_first, &all)?;

                let survivor_node = survivor.node().clone();
                frame::relocate_frames(victim.node(), |pos, _| {
                    FrameMove::MoveTo(survivor_node.clone(), pos + offset)
                });
                repoint_parents(&survivor_node, parent.node(), left_idx as i32);
            }
            _ => return Ok(false),
        }

        // Remove the separator and the victim's pointer from the parent.
        let (sep_flags, sep_key) = {
            let internal = InternalPage::open(&parent.page)?;
            let (f, k) = internal.key_at(sep_idx)?;
            (f, k.to_vec())
        };
        {
            let mut internal = InternalPageMut::open(&mut parent.page)?;
            internal.remove_at(sep_idx)?;
        }
        frames_after_child_remove(parent.node(), sep_idx);
        if sep_flags & KEY_FRAGMENTED != 0 {
            core.fragmenter().delete(&sep_key)?;
        }

        let victim_id = victim.node().id();
        core.cache.remove(victim_id);
        core.store.delete_page(victim_id)?;
        victim.kind = NodeKind::Empty;
        victim.set_id(NO_PAGE);
        debug!("tree {}: merged node {victim_id} away", self.id);
        Ok(true)
    }

    /// Pull a single remaining child's contents up into the root, dropping
    /// one level of height per iteration.
    fn shrink_root(&self, core: &Arc<DbCore>, mut root_guard: NodeWriteGuard) -> Result<()> {
        loop {
            if root_guard.kind != NodeKind::Internal {
                return Ok(());
            }
            let only_child = {
                let internal = InternalPage::open(&root_guard.page)?;
                if internal.slot_count() > 0 {
                    return Ok(());
                }
                internal.child_id(0)?
            };
            let mut child = Self::latch_child_exclusive(core, only_child)?;
            root_guard.page.copy_from_slice(&child.page);
            root_guard.kind = child.kind;

            // Splice the vanished level out of every cursor chain before
            // moving the frames up.
            let root_node = self.root.clone();
            let child_node = child.node().clone();
            for f in child_node.frames.snapshot() {
                if let Some(p) = f.parent() {
                    let grandparent = p.parent();
                    p.unbind();
                    f.set_parent(grandparent);
                }
            }
            frame::relocate_frames(&child_node, |pos, _| {
                FrameMove::MoveTo(root_node.clone(), pos)
            });

            core.cache.remove(only_child);
            core.store.delete_page(only_child)?;
            child.kind = NodeKind::Empty;
            child.set_id(NO_PAGE);
            debug!("tree {}: height shrank, absorbed {only_child}", self.id);
        }
    }

    /// Free every page of this tree: fragment chains referenced by the
    /// entries, then the node pages themselves. Used by index deletion;
    /// the tree must already be closed to new operations.
    pub(crate) fn drop_contents(&self, core: &DbCore) -> Result<()> {
        let guard = self.root.write();
        let root_id = self.root.id();
        self.drop_subtree(core, guard)?;
        core.cache.remove(root_id);
        core.store.delete_page(root_id)?;
        self.root.set_pinned(false);
        Ok(())
    }

    fn drop_subtree(&self, core: &DbCore, mut guard: NodeWriteGuard) -> Result<()> {
        match guard.kind {
            NodeKind::Leaf => {
                let leaf = LeafPage::open(&guard.page)?;
                for i in 0..leaf.slot_count() {
                    let (kf, k) = leaf.key_at(i)?;
                    if kf & KEY_FRAGMENTED != 0 {
                        core.fragmenter().delete(k)?;
                    }
                    let (vf, v) = leaf.value_at(i)?;
                    if vf & VALUE_FRAGMENTED != 0 {
                        core.fragmenter().delete(v)?;
                    }
                }
            }
            NodeKind::Internal => {
                let (first, entries) = InternalPage::open(&guard.page)?.entries()?;
                for e in &entries {
                    if e.flags & KEY_FRAGMENTED != 0 {
                        core.fragmenter().delete(&e.key)?;
                    }
                }
                let mut children = vec![first];
                children.extend(entries.iter().map(|e| e.child));
                for id in children {
                    let child = Self::latch_child_exclusive(core, id)?;
                    self.drop_subtree(core, child)?;
                    core.cache.remove(id);
                    core.store.delete_page(id)?;
                }
            }
            _ => {}
        }
        guard.kind = NodeKind::Empty;
        Ok(())
    }

    // ---- scans -------------------------------------------------------

    /// Approximate random key between the bounds, for splittable scans. No
    /// uniformity guarantee.
    pub fn random_key(&self, low: Option<&[u8]>, high: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        use rand::Rng;
        let core = self.core()?;
        let mut rng = rand::thread_rng();
        let mut guard = self.root.read();
        loop {
            match guard.kind {
                NodeKind::Internal => {
                    let child_id = {
                        let internal = InternalPage::open(&guard.page)?;
                        let lo = match low {
                            Some(k) => Self::child_index(&core, &internal, k)?,
                            None => 0,
                        };
                        let hi = match high {
                            Some(k) => Self::child_index(&core, &internal, k)?,
                            None => internal.slot_count(),
                        };
                        let pick = if hi > lo { rng.gen_range(lo..=hi) } else { lo };
                        internal.child_id(pick)?
                    };
                    guard = Self::latch_child_shared(&core, child_id)?;
                }
                NodeKind::Leaf => {
                    let leaf = LeafPage::open(&guard.page)?;
                    let n = leaf.slot_count();
                    if n == 0 {
                        return Ok(None);
                    }
                    let pick = rng.gen_range(0..n);
                    let (flags, stored) = leaf.key_at(pick)?;
                    return Self::decode_key(&core, flags, stored).map(Some);
                }
                _ => return Ok(None),
            }
        }
    }

    /// Walk every reachable page checking structural invariants; returns
    /// the number of live entries.
    pub fn verify(&self) -> Result<u64> {
        let core = self.core()?;
        let guard = self.root.read();
        self.verify_node(&core, &guard, None, None)
    }

    fn verify_node(
        &self,
        core: &DbCore,
        guard: &NodeReadGuard,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> Result<u64> {
        match guard.kind {
            NodeKind::Leaf => {
                let leaf = LeafPage::open(&guard.page)?;
                let mut count = 0;
                let mut prev: Option<Vec<u8>> = None;
                for i in 0..leaf.slot_count() {
                    let (flags, stored) = leaf.key_at(i)?;
                    let key = Self::decode_key(core, flags, stored)?;
                    if let Some(p) = &prev {
                        if *p >= key {
                            return Err(TuplError::CorruptDatabase(format!(
                                "tree {}: leaf keys out of order",
                                self.id
                            )));
                        }
                    }
                    if low.is_some_and(|lo| key.as_slice() < lo)
                        || high.is_some_and(|hi| key.as_slice() >= hi)
                    {
                        return Err(TuplError::CorruptDatabase(format!(
                            "tree {}: key outside subtree bounds",
                            self.id
                        )));
                    }
                    prev = Some(key);
                    count += 1;
                }
                Ok(count)
            }
            NodeKind::Internal => {
                let (bounds, children) = {
                    let internal = InternalPage::open(&guard.page)?;
                    let mut seps = Vec::new();
                    for i in 0..internal.slot_count() {
                        let (flags, stored) = internal.key_at(i)?;
                        seps.push(Self::decode_key(core, flags, stored)?);
                    }
                    let mut kids = Vec::new();
                    for i in 0..=internal.slot_count() {
                        kids.push(internal.child_id(i)?);
                    }
                    (seps, kids)
                };
                let mut count = 0;
                for (i, child_id) in children.iter().enumerate() {
                    let child = Self::latch_child_shared(core, *child_id)?;
                    let lo = if i == 0 {
                        low
                    } else {
                        Some(bounds[i - 1].as_slice())
                    };
                    let hi = if i == bounds.len() {
                        high
                    } else {
                        Some(bounds[i].as_slice())
                    };
                    count += self.verify_node(core, &child, lo, hi)?;
                }
                Ok(count)
            }
            _ => Err(TuplError::CorruptDatabase(format!(
                "tree {}: unexpected node kind in verify",
                self.id
            ))),
        }
    }
}

struct MutPath {
    stack: Vec<(NodeWriteGuard, usize)>,
    leaf: NodeWriteGuard,
}

enum LeafOp {
    InsertAt(usize),
    ReplaceAt(usize),
}

/// Byte-balanced split index in `1..len`.
fn leaf_split_point(entries: &[LeafEntry]) -> usize {
    if entries.len() < 2 {
        return 1;
    }
    let total: usize = entries
        .iter()
        .map(|e| SLOT_SIZE + LEAF_RECORD_HEADER + e.key.len() + e.value.len())
        .sum();
    let mut acc = 0;
    for (i, e) in entries.iter().enumerate() {
        acc += SLOT_SIZE + LEAF_RECORD_HEADER + e.key.len() + e.value.len();
        if acc * 2 >= total {
            return (i + 1).min(entries.len() - 1).max(1);
        }
    }
    entries.len() / 2
}

/// Shortest key strictly greater than `left_max` and no greater than
/// `right_min`: the right-min prefix one byte past the common prefix.
fn shortest_separator(left_max: &[u8], right_min: &[u8]) -> Vec<u8> {
    let mut i = 0;
    while i < left_max.len() && i < right_min.len() && left_max[i] == right_min[i] {
        i += 1;
    }
    right_min[..(i + 1).min(right_min.len())].to_vec()
}

fn split_move(pos: i32, split: usize, right: &Arc<Node>) -> FrameMove {
    let split = split as i32;
    if pos >= 0 {
        if pos >= split {
            FrameMove::MoveTo(right.clone(), pos - split)
        } else {
            FrameMove::Keep(pos)
        }
    } else {
        let ip = insertion_point(pos) as i32;
        if ip >= split {
            FrameMove::MoveTo(right.clone(), not_found((ip - split) as usize))
        } else {
            FrameMove::Keep(pos)
        }
    }
}

/// Shift frames on a leaf after an entry was spliced in at `idx`.
fn frames_after_insert(node: &Arc<Node>, idx: usize) {
    let idx = idx as i32;
    frame::relocate_frames(node, |pos, _| {
        let new = if pos >= 0 {
            if pos >= idx {
                pos + 1
            } else {
                pos
            }
        } else {
            let ip = insertion_point(pos) as i32;
            if ip >= idx {
                not_found((ip + 1) as usize)
            } else {
                pos
            }
        };
        FrameMove::Keep(new)
    });
}

/// Shift frames on a leaf after the entry at `idx` was removed. A frame
/// sitting exactly on the removed entry degrades to a not-found position.
fn frames_after_remove(node: &Arc<Node>, idx: usize) {
    let idx = idx as i32;
    frame::relocate_frames(node, |pos, _| {
        let new = if pos >= 0 {
            match pos.cmp(&idx) {
                CmpOrdering::Less => pos,
                CmpOrdering::Equal => not_found(idx as usize),
                CmpOrdering::Greater => pos - 1,
            }
        } else {
            let ip = insertion_point(pos) as i32;
            if ip > idx {
                not_found((ip - 1) as usize)
            } else {
                pos
            }
        };
        FrameMove::Keep(new)
    });
}

/// Child-index fix-up on an internal node after a separator insert at
/// `sep_idx` (the new right child occupies `sep_idx + 1`).
fn frames_after_child_insert(node: &Arc<Node>, sep_idx: usize) {
    let boundary = (sep_idx + 1) as i32;
    frame::relocate_frames(node, |pos, _| {
        FrameMove::Keep(if pos >= boundary { pos + 1 } else { pos })
    });
}

/// Child-index fix-up after the separator at `sep_idx` was removed (its
/// right child at `sep_idx + 1` is gone).
fn frames_after_child_remove(node: &Arc<Node>, sep_idx: usize) {
    let boundary = (sep_idx + 1) as i32;
    frame::relocate_frames(node, |pos, _| {
        FrameMove::Keep(if pos > boundary { pos - 1 } else { pos })
    });
}

/// Point the parent frames of every frame bound to `moved` at child slot
/// `child_idx` of `parent_node`.
fn repoint_parents(moved: &Arc<Node>, parent_node: &Arc<Node>, child_idx: i32) {
    for f in moved.frames.snapshot() {
        if let Some(p) = f.parent() {
            if let Some(pn) = p.node() {
                if Arc::ptr_eq(&pn, parent_node) {
                    p.set_pos(child_idx);
                }
            }
        }
    }
}

/// Give every frame on `node` a root-level parent frame at `child_idx`,
/// replacing parents that pointed at the root pre-growth (there were none
/// above the root) or creating them for frames that had no parent.
fn adopt_root_parents(node: &Arc<Node>, root: &Arc<Node>, child_idx: i32) {
    for f in node.frames.snapshot() {
        match f.parent() {
            Some(p) if p.node().map_or(false, |pn| Arc::ptr_eq(&pn, root)) => {
                p.set_pos(child_idx);
            }
            Some(_) => {}
            None => {
                let pf = CursorFrame::new(None);
                pf.bind(root, child_idx);
                f.set_parent(Some(pf));
            }
        }
    }
}

/// Initialize a page as an empty tree root.
pub(crate) fn init_empty_root(page: &mut [u8]) -> Result<()> {
    LeafPageMut::init(page)?;
    Ok(())
}

//! Bounded cache of nodes keyed by page id.
//!
//! The id map is striped; each stripe orders its nodes by an access stamp
//! for approximate LRU. Promotion to most-recently-used happens only with
//! probability `1 / used_rate`, which keeps hot nodes from turning every
//! access into a shared-counter write storm while still aging the cache.
//!
//! A separate dirty list tracks every node carrying a dirty tag; the
//! checkpoint drains it for the retiring tag. Nodes that are pinned (tree
//! roots), have bound cursor frames, or sit in the dirty list are not
//! eviction victims.
//!
//! When three eviction passes come up empty, the cache asks its owner to
//! release unused trees (unpinning their roots) and sweeps once more
//! before giving up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use rand::Rng;

use crate::core::errors::{Result, TuplError};
use crate::storage::node::{CachedState, Node, NodeKind, NodeWriteGuard};
use crate::storage::page_store::PageStore;
use crate::storage::PageId;
use crate::tree::page;

/// How a page read from the store should be typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    /// Leaf or internal; decided by the page's kind byte.
    Tree,
    Fragment,
    UndoLog,
}

struct Stripe {
    map: Mutex<HashMap<PageId, Arc<Node>>>,
}

/// Last-resort hook invoked under terminal cache pressure. Returns true
/// when it released something worth another eviction sweep.
pub type Reclaimer = Box<dyn Fn() -> bool + Send + Sync>;

pub struct NodeCache {
    stripes: Box<[Stripe]>,
    stripe_mask: u64,
    page_size: usize,
    max_nodes: usize,
    used_rate: u32,
    node_count: AtomicUsize,
    clock: AtomicU64,
    dirty: Mutex<Vec<Arc<Node>>>,
    reclaimer: Mutex<Option<Reclaimer>>,
}

impl std::fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache")
            .field("max_nodes", &self.max_nodes)
            .field("node_count", &self.node_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl NodeCache {
    pub fn new(page_size: usize, max_bytes: usize) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let stripe_count = (4 * cpus).next_power_of_two();
        let stripes = (0..stripe_count)
            .map(|_| Stripe {
                map: Mutex::new(HashMap::new()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let max_nodes = (max_bytes / page_size).max(8);
        let used_rate = ((max_nodes / 64) as u32).clamp(1, 64);
        NodeCache {
            stripes,
            stripe_mask: (stripe_count - 1) as u64,
            page_size,
            max_nodes,
            used_rate,
            node_count: AtomicUsize::new(0),
            clock: AtomicU64::new(1),
            dirty: Mutex::new(Vec::new()),
            reclaimer: Mutex::new(None),
        }
    }

    /// Install the owner's unused-resource release hook.
    pub fn set_reclaimer(&self, f: Reclaimer) {
        *self.reclaimer.lock() = Some(f);
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    pub fn node_count(&self) -> usize {
        self.node_count.load(Ordering::Relaxed)
    }

    fn stripe_for(&self, id: PageId) -> &Stripe {
        let h = id.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        &self.stripes[((h >> 32) & self.stripe_mask) as usize]
    }

    fn touch(&self, node: &Node) {
        if self.used_rate <= 1 || rand::thread_rng().gen_range(0..self.used_rate) == 0 {
            let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
            node.access.store(stamp, Ordering::Relaxed);
        }
    }

    /// Look up a cached node.
    pub fn get(&self, id: PageId) -> Option<Arc<Node>> {
        let stripe = self.stripe_for(id);
        let node = stripe.map.lock().get(&id).cloned()?;
        self.touch(&node);
        Some(node)
    }

    /// Fetch the node for `id`, reading it from the store on a miss. The
    /// returned node is fully loaded; a caller that latches it and finds
    /// `Empty` lost a race with eviction and should retry.
    pub fn get_or_load(
        &self,
        store: &dyn PageStore,
        id: PageId,
        kind: LoadKind,
    ) -> Result<Arc<Node>> {
        if let Some(node) = self.get(id) {
            return Ok(node);
        }

        // Reserve the slot before the read so concurrent loaders of the
        // same id block on the node latch instead of racing the I/O.
        let mut guard = self.alloc_latched(store)?;
        guard.set_id(id);
        let node = guard.node().clone();
        {
            let stripe = self.stripe_for(id);
            let mut map = stripe.map.lock();
            if let Some(existing) = map.get(&id) {
                // Lost the race; discard the reservation.
                let existing = existing.clone();
                drop(map);
                guard.set_id(crate::storage::NO_PAGE);
                self.discard(guard);
                return Ok(existing);
            }
            map.insert(id, node.clone());
        }

        let result = store
            .read_page(id, &mut guard.page)
            .and_then(|()| match kind {
                LoadKind::Tree => match page::page_kind(&guard.page)? {
                    page::KIND_LEAF => Ok(NodeKind::Leaf),
                    _ => Ok(NodeKind::Internal),
                },
                LoadKind::Fragment => Ok(NodeKind::Fragment),
                LoadKind::UndoLog => Ok(NodeKind::UndoLog),
            });
        match result {
            Ok(kind) => {
                guard.kind = kind;
                guard.state = CachedState::Clean;
                drop(guard);
                self.touch(&node);
                Ok(node)
            }
            Err(e) => {
                self.stripe_for(id).map.lock().remove(&id);
                guard.set_id(crate::storage::NO_PAGE);
                self.discard(guard);
                Err(e)
            }
        }
    }

    /// Hand out an exclusively latched node that is not in the map: either
    /// freshly allocated when the cache may still grow, or a reclaimed
    /// eviction victim. The caller assigns an id and calls `insert`.
    pub fn alloc_latched(&self, store: &dyn PageStore) -> Result<NodeWriteGuard> {
        if self.node_count.fetch_add(1, Ordering::AcqRel) < self.max_nodes {
            let node = Node::new(self.page_size);
            return Ok(node.write());
        }
        self.node_count.fetch_sub(1, Ordering::AcqRel);

        // Three passes over the stripes looking for an evictable victim.
        // The victim's node object is reused, so the count stays put.
        for pass in 0..3 {
            if let Some(guard) = self.evict_any(pass)? {
                return Ok(guard);
            }
        }

        // Last resort: have the owner let go of unused trees, which
        // unpins their roots, then sweep once more.
        let reclaimed = {
            let reclaimer = self.reclaimer.lock();
            reclaimer.as_ref().map_or(false, |f| f())
        };
        if reclaimed {
            debug!("cache pressure released unused trees");
            if let Some(guard) = self.evict_any(3)? {
                return Ok(guard);
            }
        }

        if store.is_durable() {
            Err(TuplError::CacheExhausted)
        } else {
            Err(TuplError::DatabaseFull)
        }
    }

    fn evict_any(&self, pass: usize) -> Result<Option<NodeWriteGuard>> {
        for stripe in self.stripes.iter() {
            if let Some(guard) = self.evict_from(stripe)? {
                debug!("evicted page {} (pass {pass})", guard.node().id());
                let mut guard = guard;
                guard.set_id(crate::storage::NO_PAGE);
                guard.kind = NodeKind::Empty;
                guard.state = CachedState::Clean;
                return Ok(Some(guard));
            }
        }
        Ok(None)
    }

    /// Return an allocation obtained from `alloc_latched` that ended up
    /// unused.
    pub fn discard(&self, guard: NodeWriteGuard) {
        drop(guard);
        self.node_count.fetch_sub(1, Ordering::AcqRel);
    }

    fn evict_from(&self, stripe: &Stripe) -> Result<Option<NodeWriteGuard>> {
        let mut map = stripe.map.lock();
        let mut victim: Option<(PageId, Arc<Node>, u64)> = None;
        for (&id, node) in map.iter() {
            if node.is_pinned() || node.has_frames() || node.in_dirty.load(Ordering::Acquire) {
                continue;
            }
            let stamp = node.access.load(Ordering::Relaxed);
            match &victim {
                Some((_, _, best)) if stamp >= *best => {}
                _ => victim = Some((id, node.clone(), stamp)),
            }
        }
        let Some((id, node, _)) = victim else {
            return Ok(None);
        };
        // Non-blocking: the stripe lock is held, so a blocking latch here
        // would invert the stripe -> latch order.
        let Some(guard) = node.try_write() else {
            return Ok(None);
        };
        if node.has_frames() || node.is_pinned() || guard.is_dirty() {
            return Ok(None);
        }
        map.remove(&id);
        Ok(Some(guard))
    }

    /// Publish a node in the id map.
    pub fn insert(&self, node: &Arc<Node>) {
        let id = node.id();
        debug_assert_ne!(id, crate::storage::NO_PAGE);
        self.stripe_for(id).map.lock().insert(id, node.clone());
        self.touch(node);
    }

    /// Move a node to a new id after copy-on-write relocation. The caller
    /// holds the node's exclusive latch.
    pub fn rekey(&self, node: &Arc<Node>, old: PageId, new: PageId) {
        if old != crate::storage::NO_PAGE {
            self.stripe_for(old).map.lock().remove(&old);
        }
        node.set_id(new);
        self.stripe_for(new).map.lock().insert(new, node.clone());
    }

    /// Drop a node from the map (page deleted or tree closed).
    pub fn remove(&self, id: PageId) {
        self.stripe_for(id).map.lock().remove(&id);
    }

    /// Track a node that just became dirty.
    pub fn mark_in_dirty(&self, node: &Arc<Node>) {
        if !node.in_dirty.swap(true, Ordering::AcqRel) {
            self.dirty.lock().push(node.clone());
        }
    }

    /// Drain the dirty list. Every drained node has `in_dirty` cleared, so
    /// concurrent re-dirtying re-registers it.
    pub fn take_dirty(&self) -> Vec<Arc<Node>> {
        let drained = std::mem::take(&mut *self.dirty.lock());
        for node in &drained {
            node.in_dirty.store(false, Ordering::Release);
        }
        drained
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page_store::NonDurablePageStore;

    fn cache_with(max_nodes: usize) -> NodeCache {
        NodeCache::new(512, max_nodes * 512)
    }

    #[test]
    fn alloc_insert_get() {
        let store = NonDurablePageStore::new(512);
        let cache = cache_with(8);
        let mut guard = cache.alloc_latched(&store).unwrap();
        guard.kind = NodeKind::Leaf;
        guard.set_id(42);
        let node = guard.node().clone();
        drop(guard);
        cache.insert(&node);
        assert!(Arc::ptr_eq(&cache.get(42).unwrap(), &node));
        assert!(cache.get(43).is_none());
    }

    #[test]
    fn eviction_reclaims_clean_unpinned_nodes() {
        let store = NonDurablePageStore::new(512);
        let cache = cache_with(8);
        for id in 10..18 {
            let mut g = cache.alloc_latched(&store).unwrap();
            g.kind = NodeKind::Leaf;
            g.set_id(id);
            let node = g.node().clone();
            drop(g);
            cache.insert(&node);
        }
        assert_eq!(cache.node_count(), 8);
        // The ninth allocation must recycle one of the first eight.
        let g = cache.alloc_latched(&store).unwrap();
        assert_eq!(cache.node_count(), 8);
        let mut found_missing = false;
        for id in 10..18 {
            if cache.get(id).is_none() {
                found_missing = true;
            }
        }
        assert!(found_missing);
        cache.discard(g);
    }

    #[test]
    fn pinned_and_dirty_nodes_survive_pressure() {
        let store = NonDurablePageStore::new(512);
        let cache = cache_with(4);
        let mut nodes = Vec::new();
        for id in 1..=4 {
            let mut g = cache.alloc_latched(&store).unwrap();
            g.kind = NodeKind::Leaf;
            g.set_id(id * 100);
            if id <= 2 {
                g.node().set_pinned(true);
            } else {
                g.state = CachedState::Dirty(0);
            }
            let node = g.node().clone();
            drop(g);
            cache.insert(&node);
            if id > 2 {
                cache.mark_in_dirty(&node);
            }
            nodes.push(node);
        }
        // Everything is pinned or dirty: allocation must fail, not evict.
        assert!(matches!(
            cache.alloc_latched(&store),
            Err(TuplError::DatabaseFull)
        ));
        for node in &nodes {
            assert!(cache.get(node.id()).is_some());
        }
    }

    #[test]
    fn reclaimer_unblocks_a_full_cache() {
        let store = NonDurablePageStore::new(512);
        let cache = cache_with(4);
        let mut pinned = Vec::new();
        for id in 1..=4u64 {
            let mut g = cache.alloc_latched(&store).unwrap();
            g.kind = NodeKind::Leaf;
            g.set_id(id * 10);
            g.node().set_pinned(true);
            let node = g.node().clone();
            drop(g);
            cache.insert(&node);
            pinned.push(node);
        }
        assert!(matches!(
            cache.alloc_latched(&store),
            Err(TuplError::DatabaseFull)
        ));

        // The hook unpins everything; the retry sweep must now succeed.
        let release = pinned.clone();
        cache.set_reclaimer(Box::new(move || {
            for node in &release {
                node.set_pinned(false);
            }
            true
        }));
        let guard = cache.alloc_latched(&store).unwrap();
        cache.discard(guard);
    }

    #[test]
    fn dirty_list_drains_once() {
        let store = NonDurablePageStore::new(512);
        let cache = cache_with(8);
        let mut g = cache.alloc_latched(&store).unwrap();
        g.set_id(7);
        let node = g.node().clone();
        drop(g);
        cache.mark_in_dirty(&node);
        cache.mark_in_dirty(&node);
        assert_eq!(cache.dirty_count(), 1);
        let drained = cache.take_dirty();
        assert_eq!(drained.len(), 1);
        assert_eq!(cache.dirty_count(), 0);
        // Re-dirtying after a drain re-registers.
        cache.mark_in_dirty(&node);
        assert_eq!(cache.dirty_count(), 1);
    }
}

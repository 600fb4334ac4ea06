//! Database: the registry of named trees and the open/recover/close
//! orchestration around the storage kernel.
//!
//! Two internal trees bootstrap everything: the registry (tree id 1) maps
//! tree id to root page id and is itself rooted from the committed
//! header; the name map (tree id 2) maps names to tree ids and back. The
//! trash tree (id 3) stages dropped indexes until their pages are freed.
//!
//! I/O failures during mutation close the database with the cause
//! stashed; later calls surface `DatabaseClosed` wrapping it. Lock order:
//! commit lock, then the open-trees map, then node latches.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use fs4::fs_std::FileExt;
use log::{info, warn};
use parking_lot::Mutex;

use crate::checkpoint::{Checkpointer, CheckpointStash};
use crate::config::{Config, DurabilityMode};
use crate::core::errors::{Result, StorageError, TuplError};
use crate::storage::fragment::Fragmenter;
use crate::storage::node::{CachedState, Node, NodeKind, NodeWriteGuard};
use crate::storage::node_cache::{LoadKind, NodeCache};
use crate::storage::page_store::{DurablePageStore, NonDurablePageStore, PageStore};
use crate::storage::{PageId, NO_PAGE};
use crate::tree::{
    init_empty_root, Cursor, Tree, FIRST_USER_TREE_ID, NAME_MAP_TREE_ID, REGISTRY_TREE_ID,
    TRASH_TREE_ID,
};
use crate::txn::redo_log::{FileRedoLog, NoRedoLog, RedoRecord, RedoWriter};
use crate::txn::transaction::Transaction;
use crate::txn::{recovery, TxnContexts, TxnId};

const NAME_KEY_PREFIX: u8 = 0;
const ID_KEY_PREFIX: u8 = 1;

pub(crate) struct DbCore {
    /// Back-reference to the owning `Arc`, handed to trees as their
    /// database handle.
    self_weak: Weak<DbCore>,
    pub(crate) config: Config,
    pub(crate) base_path: Option<PathBuf>,
    pub(crate) store: Arc<dyn PageStore>,
    pub(crate) cache: NodeCache,
    pub(crate) redo: Mutex<Box<dyn RedoWriter>>,
    pub(crate) contexts: TxnContexts,
    txn_counter: AtomicU64,
    tree_id_counter: AtomicU64,
    open_trees: Mutex<OpenTrees>,
    registry: Mutex<Option<Arc<Tree>>>,
    name_map: Mutex<Option<Arc<Tree>>>,
    trash: Mutex<Option<Arc<Tree>>>,
    pub(crate) checkpoint_mutex: Mutex<()>,
    pub(crate) ckpt_stash: Mutex<Option<CheckpointStash>>,
    pub(crate) committed_master: AtomicU64,
    closed: AtomicBool,
    closing: AtomicBool,
    panic_cause: Mutex<Option<String>>,
    lock_file: Mutex<Option<std::fs::File>>,
}

#[derive(Default)]
struct OpenTrees {
    by_name: HashMap<Vec<u8>, Arc<Tree>>,
    by_id: HashMap<u64, Arc<Tree>>,
}

impl std::fmt::Debug for DbCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbCore")
            .field("base_path", &self.base_path)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl DbCore {
    pub(crate) fn arc(&self) -> Arc<DbCore> {
        self.self_weak.upgrade().expect("database core still alive")
    }

    pub(crate) fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TuplError::DatabaseClosed {
                cause: self.panic_cause.lock().clone(),
            });
        }
        Ok(())
    }

    /// One-shot close with cause. Everything after this surfaces
    /// `DatabaseClosed` carrying it.
    pub(crate) fn panic_close(&self, cause: &TuplError) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::error!("database panicked: {cause}");
            *self.panic_cause.lock() = Some(cause.to_string());
        }
    }

    /// Apply the propagation policy: recoverable errors pass through, the
    /// rest close the database.
    pub(crate) fn fail_guard<T>(&self, r: Result<T>) -> Result<T> {
        if let Err(e) = &r {
            if !e.is_recoverable() && !matches!(e, TuplError::DatabaseClosed { .. }) {
                self.panic_close(e);
            }
        }
        r
    }

    pub(crate) fn fragmenter(&self) -> Fragmenter<'_> {
        Fragmenter::new(self.store.as_ref(), &self.cache)
    }

    pub(crate) fn txn_id_snapshot(&self) -> TxnId {
        self.txn_counter.load(Ordering::Acquire)
    }

    fn next_txn_id(&self) -> TxnId {
        self.txn_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn registry(&self) -> Arc<Tree> {
        self.registry.lock().clone().expect("registry bootstrapped")
    }

    fn name_map_tree(&self) -> Arc<Tree> {
        self.name_map.lock().clone().expect("name map bootstrapped")
    }

    fn trash_tree(&self) -> Arc<Tree> {
        self.trash.lock().clone().expect("trash bootstrapped")
    }

    // ---- dirty protocol ----------------------------------------------

    /// Make a latched node mutable under the current commit state.
    ///
    /// A clean node backed by a committed page is relocated (copy on
    /// write): the old id is scheduled for deferred deletion and stays
    /// readable until the next checkpoint retires it. A node still dirty
    /// under the retiring state is first written to its committed
    /// location, since that content belongs to the in-flight snapshot.
    /// Returns the (old, new) ids when the node moved.
    pub(crate) fn mark_dirty(
        &self,
        guard: &mut NodeWriteGuard,
    ) -> Result<Option<(PageId, PageId)>> {
        let cur = self.store.commit_state();
        match guard.state {
            CachedState::Dirty(t) if t == cur => Ok(None),
            CachedState::Dirty(_) => {
                let old = guard.node().id();
                self.store.write_page(old, &guard.page)?;
                let new_id = self.store.alloc_page()?;
                self.store.delete_page(old)?;
                self.cache.rekey(guard.node(), old, new_id);
                guard.state = CachedState::Dirty(cur);
                self.cache.mark_in_dirty(guard.node());
                Ok(Some((old, new_id)))
            }
            CachedState::Clean => {
                let old = guard.node().id();
                let new_id = self.store.alloc_page()?;
                if old != NO_PAGE {
                    self.store.delete_page(old)?;
                    self.cache.rekey(guard.node(), old, new_id);
                } else {
                    guard.set_id(new_id);
                    self.cache.insert(guard.node());
                }
                guard.state = CachedState::Dirty(cur);
                self.cache.mark_in_dirty(guard.node());
                Ok(if old != NO_PAGE {
                    Some((old, new_id))
                } else {
                    None
                })
            }
        }
    }

    // ---- redo helpers ------------------------------------------------

    pub(crate) fn redo_write(&self, rec: &RedoRecord) -> Result<()> {
        self.redo.lock().write(rec)
    }

    /// Push the redo log toward disk as hard as the durability mode asks.
    pub(crate) fn redo_commit_flush(&self) -> Result<()> {
        match self.config.durability {
            DurabilityMode::Sync => self.redo.lock().flush(true),
            DurabilityMode::NoSync => self.redo.lock().flush(false),
            DurabilityMode::NoFlush | DurabilityMode::NoRedo => Ok(()),
        }
    }

    pub(crate) fn custom_redo(&self, payload: &[u8]) -> Result<()> {
        match &self.config.custom_handler {
            Some(h) => h.redo(payload),
            None => {
                warn!("custom redo record with no handler registered");
                Ok(())
            }
        }
    }

    pub(crate) fn custom_undo(&self, payload: &[u8]) -> Result<()> {
        match &self.config.custom_handler {
            Some(h) => h.undo(payload),
            None => {
                warn!("custom undo record with no handler registered");
                Ok(())
            }
        }
    }

    // ---- tree bootstrap and lookup -----------------------------------

    fn create_tree_root(&self) -> Result<Arc<Node>> {
        let id = self.store.alloc_page()?;
        let mut guard = self.cache.alloc_latched(self.store.as_ref())?;
        guard.kind = NodeKind::Leaf;
        init_empty_root(&mut guard.page)?;
        guard.state = CachedState::Dirty(self.store.commit_state());
        guard.set_id(id);
        let node = guard.node().clone();
        drop(guard);
        node.set_pinned(true);
        self.cache.insert(&node);
        self.cache.mark_in_dirty(&node);
        Ok(node)
    }

    fn load_tree_root(&self, id: PageId) -> Result<Arc<Node>> {
        let node = self.cache.get_or_load(self.store.as_ref(), id, LoadKind::Tree)?;
        node.set_pinned(true);
        Ok(node)
    }

    /// Resolve a tree by id, opening it from the registry or creating it
    /// when the registry has never heard of it (redo replay of an index
    /// created after the last checkpoint).
    pub(crate) fn tree_by_id(&self, id: u64) -> Result<Arc<Tree>> {
        match id {
            REGISTRY_TREE_ID => return Ok(self.registry()),
            NAME_MAP_TREE_ID => return Ok(self.name_map_tree()),
            TRASH_TREE_ID => return Ok(self.trash_tree()),
            _ => {}
        }
        if let Some(tree) = self.open_trees.lock().by_id.get(&id) {
            return Ok(tree.clone());
        }

        let registry = self.registry();
        let root = match registry.load(&id.to_be_bytes())? {
            Some(v) if v.len() == 8 => {
                let root_id = u64::from_le_bytes(v.try_into().expect("8 bytes"));
                self.load_tree_root(root_id)?
            }
            Some(_) => {
                return Err(TuplError::CorruptDatabase(format!(
                    "registry entry for tree {id} malformed"
                )))
            }
            None => {
                let _cl = self.store.commit_lock().acquire_shared();
                let root = self.create_tree_root()?;
                registry.store(&id.to_be_bytes(), &root.id().to_le_bytes())?;
                self.bump_tree_id_counter(id);
                root
            }
        };
        let tree = Tree::new(self.self_weak.clone(), id, None, root);
        let mut open = self.open_trees.lock();
        let entry = open.by_id.entry(id).or_insert_with(|| tree.clone());
        Ok(entry.clone())
    }

    fn bump_tree_id_counter(&self, seen: u64) {
        let mut cur = self.tree_id_counter.load(Ordering::Acquire);
        while seen >= cur {
            match self.tree_id_counter.compare_exchange(
                cur,
                seen + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Record the current root page id of every open tree in the
    /// registry. Runs under the exclusive commit lock during checkpoint.
    pub(crate) fn sync_registry_roots(&self) -> Result<()> {
        let registry = self.registry();
        let mut trees: Vec<Arc<Tree>> = vec![self.name_map_tree(), self.trash_tree()];
        trees.extend(self.open_trees.lock().by_id.values().cloned());
        for tree in trees {
            if tree.is_closed() {
                continue;
            }
            let key = tree.id.to_be_bytes();
            let root = tree.root_id().to_le_bytes();
            let current = registry.load(&key)?;
            if current.as_deref() != Some(&root[..]) {
                registry.store(&key, &root)?;
            }
        }
        Ok(())
    }

    // ---- index management -------------------------------------------

    fn open_index_inner(&self, name: &[u8], create: bool) -> Result<Option<Arc<Tree>>> {
        if let Some(tree) = self.open_trees.lock().by_name.get(name) {
            return Ok(Some(tree.clone()));
        }

        let name_map = self.name_map_tree();
        let mut name_key = Vec::with_capacity(1 + name.len());
        name_key.push(NAME_KEY_PREFIX);
        name_key.extend_from_slice(name);

        if let Some(v) = name_map.load(&name_key)? {
            if v.len() != 8 {
                return Err(TuplError::CorruptDatabase(format!(
                    "name map entry for {name:?} malformed"
                )));
            }
            let id = u64::from_le_bytes(v.try_into().expect("8 bytes"));
            let tree = self.tree_by_id(id)?;
            *tree.name.lock() = Some(name.to_vec());
            let mut open = self.open_trees.lock();
            open.by_name.insert(name.to_vec(), tree.clone());
            return Ok(Some(tree));
        }
        if !create {
            return Ok(None);
        }
        if self.config.read_only {
            return Err(StorageError("cannot create index in read-only mode".into()).into());
        }

        // Creation mutates the registry; that wants the exclusive commit
        // lock ahead of the open-trees latch.
        let _excl = self.store.commit_lock().acquire_exclusive();
        // Double-check under the exclusive lock.
        if let Some(v) = name_map.load(&name_key)? {
            let id = u64::from_le_bytes(
                v.try_into()
                    .map_err(|_| TuplError::CorruptDatabase("name map entry malformed".into()))?,
            );
            let tree = self.tree_by_id(id)?;
            return Ok(Some(tree));
        }

        let id = self.tree_id_counter.fetch_add(1, Ordering::AcqRel);
        let root = self.create_tree_root()?;
        let registry = self.registry();
        registry.store(&id.to_be_bytes(), &root.id().to_le_bytes())?;

        let mut id_key = Vec::with_capacity(9);
        id_key.push(ID_KEY_PREFIX);
        id_key.extend_from_slice(&id.to_be_bytes());
        name_map.store(&name_key, &id.to_le_bytes())?;
        name_map.store(&id_key, name)?;
        // The bindings replay through the redo log like any other store;
        // the registry itself is rebuilt from checkpoints only.
        self.redo_write(&RedoRecord::Store {
            index: NAME_MAP_TREE_ID,
            key: name_key.clone(),
            value: id.to_le_bytes().to_vec(),
        })?;
        self.redo_write(&RedoRecord::Store {
            index: NAME_MAP_TREE_ID,
            key: id_key,
            value: name.to_vec(),
        })?;

        let tree = Tree::new(self.self_weak.clone(), id, Some(name.to_vec()), root);
        let mut open = self.open_trees.lock();
        open.by_name.insert(name.to_vec(), tree.clone());
        open.by_id.insert(id, tree.clone());
        info!("created index {:?} as tree {id}", String::from_utf8_lossy(name));
        Ok(Some(tree))
    }

    pub(crate) fn apply_rename_index(&self, id: u64, new_name: &[u8]) -> Result<()> {
        let tree = self.tree_by_id(id)?;
        let name_map = self.name_map_tree();
        let _cl = self.store.commit_lock().acquire_shared();

        let mut id_key = Vec::with_capacity(9);
        id_key.push(ID_KEY_PREFIX);
        id_key.extend_from_slice(&id.to_be_bytes());
        if let Some(old_name) = name_map.load(&id_key)? {
            let mut old_key = Vec::with_capacity(1 + old_name.len());
            old_key.push(NAME_KEY_PREFIX);
            old_key.extend_from_slice(&old_name);
            if let Some(raw) = name_map.delete(&old_key)? {
                debug_assert!(!raw.is_fragmented());
            }
            self.open_trees.lock().by_name.remove(&old_name);
        }
        let mut name_key = Vec::with_capacity(1 + new_name.len());
        name_key.push(NAME_KEY_PREFIX);
        name_key.extend_from_slice(new_name);
        name_map.store(&name_key, &id.to_le_bytes())?;
        name_map.store(&id_key, new_name)?;

        *tree.name.lock() = Some(new_name.to_vec());
        self.open_trees
            .lock()
            .by_name
            .insert(new_name.to_vec(), tree);
        Ok(())
    }

    /// Drop a tree by id: registry and trash bookkeeping plus the page
    /// walk that frees its contents.
    pub(crate) fn apply_delete_index(&self, id: u64) -> Result<()> {
        let tree = self.tree_by_id(id)?;
        let registry = self.registry();
        let trash = self.trash_tree();
        {
            let _cl = self.store.commit_lock().acquire_shared();
            // Staged in the trash until the contents are gone, so a crash
            // mid-drop can finish the job on the next open.
            trash.store(&id.to_be_bytes(), &[])?;

            // Resolve the name through the reverse mapping so replayed
            // drops of never-opened trees still clean their bindings.
            let name_map = self.name_map_tree();
            let mut id_key = Vec::with_capacity(9);
            id_key.push(ID_KEY_PREFIX);
            id_key.extend_from_slice(&id.to_be_bytes());
            if let Some(name) = name_map.load(&id_key)? {
                let mut name_key = Vec::with_capacity(1 + name.len());
                name_key.push(NAME_KEY_PREFIX);
                name_key.extend_from_slice(&name);
                name_map_delete(&name_map, &name_key)?;
                name_map_delete(&name_map, &id_key)?;
                self.open_trees.lock().by_name.remove(&name);
            }

            // Closed before the page walk so concurrent holders of the
            // index observe `ClosedIndex` rather than a vanishing tree.
            tree.close();
            tree.drop_contents(self)?;
            registry.delete(&id.to_be_bytes())?;
            trash.delete(&id.to_be_bytes())?;
        }
        self.open_trees.lock().by_id.remove(&id);
        info!("deleted index tree {id}");
        Ok(())
    }

    /// Cache-pressure fallback: drop open trees nobody holds a handle to,
    /// unpinning their roots so the eviction sweep can reclaim them. A
    /// tree is only let go when its root is clean, since a clean root's
    /// registry entry was recorded by the checkpoint that cleaned it;
    /// reopening later reloads the same state from the registry.
    pub(crate) fn release_unused_trees(&self) -> bool {
        // try_lock so a pressured allocation inside a path that already
        // holds the map cannot wedge itself.
        let Some(mut open) = self.open_trees.try_lock() else {
            return false;
        };
        let OpenTrees { by_name, by_id } = &mut *open;
        let mut released = false;
        by_id.retain(|id, tree| {
            let name = tree.name.lock().clone();
            let map_refs = 1 + name
                .as_ref()
                .map_or(0, |n| usize::from(by_name.contains_key(n.as_slice())));
            if Arc::strong_count(tree) > map_refs {
                // An Index, Cursor, or in-flight operation still holds it.
                return true;
            }
            let Some(guard) = tree.root().try_read() else {
                return true;
            };
            if guard.is_dirty() {
                return true;
            }
            drop(guard);
            tree.root().set_pinned(false);
            if let Some(n) = name {
                by_name.remove(&n);
            }
            info!("released unused tree {id} under cache pressure");
            released = true;
            false
        });
        released
    }

    /// Finish any index drop interrupted by a crash.
    fn drain_trash(&self) -> Result<()> {
        let trash = self.trash_tree();
        let mut cursor = Cursor::new(trash.clone());
        let mut pending = Vec::new();
        if cursor.first()? {
            loop {
                if let Some(key) = cursor.key() {
                    if key.len() == 8 {
                        pending.push(u64::from_be_bytes(key.try_into().expect("8 bytes")));
                    }
                }
                if !cursor.next()? {
                    break;
                }
            }
        }
        drop(cursor);
        for id in pending {
            info!("resuming interrupted drop of tree {id}");
            self.apply_delete_index(id)?;
        }
        Ok(())
    }
}

fn name_map_delete(name_map: &Arc<Tree>, key: &[u8]) -> Result<()> {
    let _ = name_map.delete(key)?;
    Ok(())
}

// ---- public handles ---------------------------------------------------

/// An open named tree.
#[derive(Clone)]
pub struct Index {
    tree: Arc<Tree>,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("id", &self.tree.id)
            .field("name", &self.tree.name.lock())
            .finish()
    }
}

impl Index {
    pub(crate) fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn id(&self) -> u64 {
        self.tree.id
    }

    pub fn name(&self) -> Option<Vec<u8>> {
        self.tree.name.lock().clone()
    }

    pub fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tree.load(key)
    }

    /// Auto-committed store: durable per the configured mode once this
    /// returns.
    pub fn store(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let core = self.tree.core()?;
        let r = self.store_inner(&core, key, value);
        core.fail_guard(r)?;
        core.redo_commit_flush()
    }

    fn store_inner(&self, core: &Arc<DbCore>, key: &[u8], value: &[u8]) -> Result<()> {
        let _cl = core.store.commit_lock().acquire_shared();
        let old = self.tree.store(key, value)?;
        if let Some(raw) = old {
            if raw.is_fragmented() && !raw.is_ghost() {
                core.fragmenter().delete(&raw.bytes)?;
            }
        }
        core.redo_write(&RedoRecord::Store {
            index: self.tree.id,
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    /// Auto-committed delete. Returns whether the key existed.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let core = self.tree.core()?;
        let r = self.delete_inner(&core, key);
        let existed = core.fail_guard(r)?;
        core.redo_commit_flush()?;
        Ok(existed)
    }

    fn delete_inner(&self, core: &Arc<DbCore>, key: &[u8]) -> Result<bool> {
        let _cl = core.store.commit_lock().acquire_shared();
        let Some(raw) = self.tree.delete(key)? else {
            return Ok(false);
        };
        let was_ghost = raw.is_ghost();
        if raw.is_fragmented() {
            core.fragmenter().delete(&raw.bytes)?;
        }
        core.redo_write(&RedoRecord::Delete {
            index: self.tree.id,
            key: key.to_vec(),
        })?;
        Ok(!was_ghost)
    }

    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.tree.clone())
    }

    /// Approximate random key between the bounds; no uniformity guarantee.
    pub fn random_key(&self, low: Option<&[u8]>, high: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        self.tree.random_key(low, high)
    }

    /// Structural verification of the whole tree; returns the entry count.
    pub fn verify(&self) -> Result<u64> {
        self.tree.verify()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DbStats {
    pub page_size: usize,
    pub total_pages: u64,
    pub free_pages: u64,
    pub pending_free_pages: u64,
    pub cached_nodes: usize,
    pub dirty_nodes: usize,
    pub checkpoint_number: u64,
    pub active_transactions: usize,
}

/// An open database.
pub struct Database {
    core: Arc<DbCore>,
    checkpointer: Mutex<Option<Checkpointer>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("core", &self.core).finish()
    }
}

impl Database {
    /// Open (creating as needed) the database described by `config`.
    pub fn open(config: Config) -> Result<Database> {
        config.validate()?;
        let base = config.base_path.clone();

        let (store, lock_file): (Arc<dyn PageStore>, Option<std::fs::File>) = match &base {
            None => (Arc::new(NonDurablePageStore::new(config.page_size)), None),
            Some(base_path) => {
                if let Some(parent) = base_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let lock_path = suffixed(base_path, ".lock");
                let lock_file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(false)
                    .open(&lock_path)?;
                lock_file.try_lock_exclusive().map_err(|_| {
                    StorageError(format!("database is already open: {lock_path:?}"))
                })?;

                let data_path = config.resolved_data_path().expect("base path implies data");
                let exists = data_path.exists()
                    && data_path.metadata().map(|m| m.len()).unwrap_or(0) > 0;
                let store: Arc<dyn PageStore> = if exists {
                    Arc::new(DurablePageStore::open(&data_path, config.page_size)?)
                } else {
                    if config.read_only {
                        return Err(StorageError(
                            "read-only open of a missing database".into(),
                        )
                        .into());
                    }
                    Arc::new(DurablePageStore::create(&data_path, config.page_size)?)
                };
                (store, Some(lock_file))
            }
        };

        let page_size = store.page_size();
        let header = store.committed_header();
        let existed = header.checkpoint_number > 1 || header.registry_root_id != 0;

        let core = Arc::new_cyclic(|weak| DbCore {
            self_weak: weak.clone(),
            cache: NodeCache::new(page_size, config.max_cache_bytes),
            base_path: base.clone(),
            store,
            redo: Mutex::new(Box::new(NoRedoLog)),
            contexts: TxnContexts::new(),
            txn_counter: AtomicU64::new(header.last_txn_id),
            tree_id_counter: AtomicU64::new(FIRST_USER_TREE_ID),
            open_trees: Mutex::new(OpenTrees::default()),
            registry: Mutex::new(None),
            name_map: Mutex::new(None),
            trash: Mutex::new(None),
            checkpoint_mutex: Mutex::new(()),
            ckpt_stash: Mutex::new(None),
            committed_master: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            panic_cause: Mutex::new(None),
            lock_file: Mutex::new(lock_file),
            config,
        });

        // Bootstrap the registry from the committed header, then the name
        // map and trash trees through it.
        let registry_root = if header.registry_root_id != 0 {
            core.load_tree_root(header.registry_root_id)?
        } else {
            let _cl = core.store.commit_lock().acquire_shared();
            core.create_tree_root()?
        };
        let registry = Tree::new(
            Arc::downgrade(&core),
            REGISTRY_TREE_ID,
            None,
            registry_root,
        );
        *core.registry.lock() = Some(registry.clone());
        let name_map = open_internal_tree(&core, NAME_MAP_TREE_ID)?;
        *core.name_map.lock() = Some(name_map);
        let trash = open_internal_tree(&core, TRASH_TREE_ID)?;
        *core.trash.lock() = Some(trash);

        // Terminal cache pressure may ask for unused trees to be let go.
        {
            let weak = core.self_weak.clone();
            core.cache.set_reclaimer(Box::new(move || {
                weak.upgrade().map_or(false, |core| core.release_unused_trees())
            }));
        }

        // Seed the tree id counter past everything the registry knows.
        {
            let mut cursor = Cursor::new(registry.clone());
            if cursor.last()? {
                if let Some(key) = cursor.key() {
                    if key.len() == 8 {
                        let id = u64::from_be_bytes(key.try_into().expect("8 bytes"));
                        core.bump_tree_id_counter(id.max(FIRST_USER_TREE_ID - 1));
                    }
                }
            }
        }

        let mut next_redo = header.redo_num;
        if existed && core.store.is_durable() {
            let (stats, max_txn) = recovery::recover(&core, &header)?;
            core.txn_counter.store(max_txn, Ordering::Release);
            next_redo = stats.last_redo.max(next_redo);
            recovery::post_recovery_audit(&core);
            core.drain_trash()?;
        }

        if core.store.is_durable() && core.config.durability != DurabilityMode::NoRedo {
            let base_path = base.as_ref().expect("durable store implies base");
            *core.redo.lock() = Box::new(FileRedoLog::create(base_path, next_redo + 1)?);
        }

        if core.store.is_durable() {
            // Stabilize: recovery results and fresh bootstrap pages become
            // the first recoverable point.
            crate::checkpoint::checkpoint(&core, true)?;
            if let Some(base_path) = &base {
                write_info_file(base_path, &core)?;
                if core.config.cache_priming {
                    prime_cache(base_path, &core);
                }
            }
        }

        let checkpointer = if core.store.is_durable() && !core.config.read_only {
            Some(Checkpointer::spawn(
                core.clone(),
                core.config.checkpoint_interval,
            ))
        } else {
            None
        };

        Ok(Database {
            core,
            checkpointer: Mutex::new(checkpointer),
        })
    }

    /// Open the named index, creating it when missing.
    pub fn open_index(&self, name: &[u8]) -> Result<Index> {
        self.core.check_closed()?;
        let r = self.core.open_index_inner(name, true);
        let tree = self.core.fail_guard(r)?.expect("create requested");
        Ok(Index { tree })
    }

    /// Open the named index only if it already exists.
    pub fn find_index(&self, name: &[u8]) -> Result<Option<Index>> {
        self.core.check_closed()?;
        let r = self.core.open_index_inner(name, false);
        Ok(self.core.fail_guard(r)?.map(|tree| Index { tree }))
    }

    /// Rename an index, durably.
    pub fn rename_index(&self, index: &Index, new_name: &[u8]) -> Result<()> {
        self.core.check_closed()?;
        let r = (|| {
            self.core.apply_rename_index(index.id(), new_name)?;
            self.core.redo_write(&RedoRecord::RenameIndex {
                index: index.id(),
                new_name: new_name.to_vec(),
            })?;
            self.core.redo_commit_flush()
        })();
        self.core.fail_guard(r)
    }

    /// Drop an index and free its pages.
    pub fn delete_index(&self, index: Index) -> Result<()> {
        self.core.check_closed()?;
        let id = index.id();
        let r = (|| {
            self.core.apply_delete_index(id)?;
            self.core.redo_write(&RedoRecord::DeleteIndex { index: id })?;
            self.core.redo_commit_flush()
        })();
        self.core.fail_guard(r)
    }

    /// Begin a transaction.
    pub fn begin(&self) -> Result<Transaction> {
        self.core.check_closed()?;
        let id = self.core.next_txn_id();
        Ok(Transaction::begin(self.core.clone(), id))
    }

    /// Force a checkpoint now.
    pub fn checkpoint(&self) -> Result<()> {
        self.core.check_closed()?;
        let r = crate::checkpoint::checkpoint(&self.core, true);
        self.core.fail_guard(r)
    }

    /// Structural verification across every open tree plus the registry.
    pub fn verify(&self) -> Result<()> {
        self.core.check_closed()?;
        self.core.registry().verify()?;
        let trees: Vec<Arc<Tree>> = self.core.open_trees.lock().by_id.values().cloned().collect();
        for tree in trees {
            tree.verify()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> DbStats {
        let store_stats = self.core.store.stats();
        DbStats {
            page_size: self.core.cache.page_size(),
            total_pages: store_stats.total_pages,
            free_pages: store_stats.free_pages,
            pending_free_pages: store_stats.pending_free_pages,
            cached_nodes: self.core.cache.node_count(),
            dirty_nodes: self.core.cache.dirty_count(),
            checkpoint_number: self.core.store.committed_header().checkpoint_number,
            active_transactions: self.core.contexts.active_count(),
        }
    }

    /// Abandon the instance without flushing anything: no final
    /// checkpoint, no redo shutdown record. The on-disk state is whatever
    /// the last checkpoint and redo writes left behind, as after a kill.
    #[doc(hidden)]
    pub fn simulate_crash(self) {
        if let Some(mut cp) = self.checkpointer.lock().take() {
            cp.stop();
        }
        self.core.closing.store(true, Ordering::Release);
        self.core.closed.store(true, Ordering::Release);
        if let Some(lock) = self.core.lock_file.lock().take() {
            let _ = FileExt::unlock(&lock);
        }
    }

    /// Flush and close. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        if self.core.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut cp) = self.checkpointer.lock().take() {
            cp.stop();
        }
        let panicked = self.core.closed.load(Ordering::Acquire);
        if self.core.store.is_durable() && !panicked && !self.core.config.read_only {
            crate::checkpoint::checkpoint(&self.core, true)?;
            self.core.redo_write(&RedoRecord::Shutdown)?;
            self.core.redo.lock().flush(true)?;
            if self.core.config.cache_priming {
                if let Some(base) = &self.core.base_path {
                    write_primer(base, &self.core);
                }
            }
        }
        self.core.closed.store(true, Ordering::Release);
        self.core.store.sync()?;
        if let Some(lock) = self.core.lock_file.lock().take() {
            let _ = FileExt::unlock(&lock);
        }
        info!("database closed");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("close on drop failed: {e}");
        }
    }
}

fn open_internal_tree(core: &Arc<DbCore>, id: u64) -> Result<Arc<Tree>> {
    let registry = core.registry();
    let root = match registry.load(&id.to_be_bytes())? {
        Some(v) if v.len() == 8 => {
            let root_id = u64::from_le_bytes(v.try_into().expect("8 bytes"));
            core.load_tree_root(root_id)?
        }
        Some(_) => {
            return Err(TuplError::CorruptDatabase(format!(
                "registry entry for internal tree {id} malformed"
            )))
        }
        None => {
            let _cl = core.store.commit_lock().acquire_shared();
            let root = core.create_tree_root()?;
            registry.store(&id.to_be_bytes(), &root.id().to_le_bytes())?;
            root
        }
    };
    Ok(Tree::new(Arc::downgrade(core), id, None, root))
}

fn suffixed(base: &std::path::Path, suffix: &str) -> PathBuf {
    let mut name = base
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    base.with_file_name(name)
}

fn write_info_file(base: &std::path::Path, core: &Arc<DbCore>) -> Result<()> {
    let path = suffixed(base, ".info");
    let stats = core.store.stats();
    let mut f = std::fs::File::create(path)?;
    writeln!(f, "encoding.version: {:#x}", crate::storage::header::ENCODING_VERSION)?;
    writeln!(f, "page.size: {}", core.cache.page_size())?;
    writeln!(f, "cache.max.nodes: {}", core.cache.max_nodes())?;
    writeln!(f, "lock.timeout.ms: {}", core.config.lock_timeout.as_millis())?;
    writeln!(f, "pages.total: {}", stats.total_pages)?;
    Ok(())
}

/// Best-effort warm-start files: a list of recently cached page ids.
fn write_primer(base: &std::path::Path, core: &Arc<DbCore>) {
    let path = suffixed(base, ".primer");
    let registry = core.registry();
    let mut ids: Vec<PageId> = vec![registry.root_id()];
    for tree in core.open_trees.lock().by_id.values() {
        ids.push(tree.root_id());
    }
    let mut out = Vec::with_capacity(ids.len() * 8);
    for id in ids {
        out.extend_from_slice(&id.to_le_bytes());
    }
    if let Err(e) = std::fs::write(&path, out) {
        warn!("failed to write primer file: {e}");
    }
}

fn prime_cache(base: &std::path::Path, core: &Arc<DbCore>) {
    let path = suffixed(base, ".primer");
    let Ok(bytes) = std::fs::read(&path) else {
        return;
    };
    for chunk in bytes.chunks_exact(8) {
        let id = u64::from_le_bytes(chunk.try_into().expect("8 bytes"));
        if id >= crate::storage::FIRST_DATA_PAGE {
            let _ = core
                .cache
                .get_or_load(core.store.as_ref(), id, LoadKind::Tree);
        }
    }
    info!("cache primed from {path:?}");
}

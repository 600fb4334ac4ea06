//! Fixed-size page storage beneath the node cache.
//!
//! Two implementations: `DurablePageStore` persists pages to a single data
//! file with the double-header commit protocol, `NonDurablePageStore` only
//! hands out ids for a purely cache-resident database.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

use log::{debug, info};
use parking_lot::Mutex;

use crate::core::errors::{Result, StorageError, TuplError};
use crate::storage::free_list::FreeList;
use crate::storage::header::CommitHeader;
use crate::storage::{PageId, FIRST_DATA_PAGE, MAX_PAGE_ID};
use crate::sync::CommitLock;

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub total_pages: u64,
    pub free_pages: u64,
    pub pending_free_pages: u64,
}

/// What the storage kernel consumes from a page store.
pub trait PageStore: Send + Sync {
    fn page_size(&self) -> usize;

    fn is_durable(&self) -> bool;

    /// The commit lock bound to this store.
    fn commit_lock(&self) -> &CommitLock;

    /// Current commit state tag (0 or 1). Nodes dirtied now carry this tag.
    fn commit_state(&self) -> u8;

    /// Flip the commit state; the previous tag becomes the to-be-flushed
    /// one. Caller must hold the commit lock exclusively.
    fn flip_commit_state(&self) -> u8;

    /// Allocate a page id, reusing a free one when possible. Never 0 or 1.
    fn alloc_page(&self) -> Result<PageId>;

    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()>;

    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()>;

    /// Logically delete: the id stays reserved until the checkpoint that
    /// retires the current commit state makes it durable-free.
    fn delete_page(&self, id: PageId) -> Result<()>;

    /// Free a page that never reached a committed snapshot; immediately
    /// reusable.
    fn recycle_page(&self, id: PageId) -> Result<()>;

    /// Durably publish `header`. `prepare` runs first and must flush all
    /// data pages belonging to the snapshot. With `resume` the free-list
    /// state already recorded in `header` is reused instead of being
    /// serialized again.
    fn commit(
        &self,
        resume: bool,
        header: &mut CommitHeader,
        prepare: &mut dyn FnMut() -> Result<()>,
    ) -> Result<()>;

    /// Snapshot of the last committed header.
    fn committed_header(&self) -> CommitHeader;

    fn sync(&self) -> Result<()>;

    fn stats(&self) -> StoreStats;
}

struct DurableState {
    active_header: usize,
    total_pages: u64,
    free: FreeList,
    /// Pages holding the currently-committed free list; recycled once the
    /// next commit supersedes them.
    free_chain: Vec<PageId>,
}

pub struct DurablePageStore {
    path: PathBuf,
    file: Mutex<File>,
    page_size: usize,
    commit_lock: CommitLock,
    commit_state: AtomicU8,
    state: Mutex<DurableState>,
    committed: Mutex<CommitHeader>,
}

impl std::fmt::Debug for DurablePageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurablePageStore")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl DurablePageStore {
    /// Create a fresh data file: both header slots written, slot 0 live.
    pub fn create<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() && path.metadata()?.len() > 0 {
            return Err(StorageError(format!("file already exists: {path:?}")).into());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let mut header = CommitHeader::new(page_size as u32);
        header.checkpoint_number = 1;
        let mut page = vec![0u8; page_size];
        header.pack(&mut page)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&page)?;
        // Slot 1 starts zeroed; its checksum never validates.
        file.write_all(&vec![0u8; page_size])?;
        file.sync_all()?;

        info!("created page store at {path:?}, page size {page_size}");
        Ok(DurablePageStore {
            path,
            file: Mutex::new(file),
            page_size,
            commit_lock: CommitLock::new(),
            commit_state: AtomicU8::new(0),
            state: Mutex::new(DurableState {
                active_header: 0,
                total_pages: FIRST_DATA_PAGE,
                free: FreeList::new(),
                free_chain: Vec::new(),
            }),
            committed: Mutex::new(header),
        })
    }

    /// Open an existing file, choosing the newer header whose checksum
    /// validates and rebuilding the free list from it.
    pub fn open<P: AsRef<Path>>(path: P, default_page_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        // The header stores the real page size; peek at slot 0's fixed
        // prefix to find it, falling back to the configured default when
        // slot 0 is torn.
        let mut prefix = [0u8; 16];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut prefix)
            .map_err(|_| StorageError("file too small for a header".into()))?;
        let page_size = if &prefix[..8] == b"TUPLDB01" {
            u32::from_le_bytes(prefix[12..16].try_into().expect("4 bytes")) as usize
        } else {
            default_page_size
        };
        if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
            return Err(TuplError::CorruptDatabase(format!(
                "implausible page size {page_size}"
            )));
        }

        let mut best: Option<(usize, CommitHeader)> = None;
        for slot in 0..2usize {
            let mut page = vec![0u8; page_size];
            file.seek(SeekFrom::Start((slot * page_size) as u64))?;
            if file.read_exact(&mut page).is_err() {
                continue;
            }
            match CommitHeader::unpack(&page) {
                Ok(h) => {
                    let better = match &best {
                        None => true,
                        Some((_, b)) => h.checkpoint_number > b.checkpoint_number,
                    };
                    if better {
                        best = Some((slot, h));
                    }
                }
                Err(e) => debug!("header slot {slot} rejected: {e}"),
            }
        }
        let (active_header, header) = best.ok_or_else(|| {
            TuplError::CorruptDatabase("no valid committed header".into())
        })?;
        if header.page_size as usize != page_size {
            return Err(TuplError::CorruptDatabase("page size mismatch".into()));
        }

        let file = Mutex::new(file);
        let read_one = |id: PageId, buf: &mut [u8]| -> Result<()> {
            let mut f = file.lock();
            f.seek(SeekFrom::Start(id * page_size as u64))?;
            f.read_exact(buf)
                .map_err(|_| StorageError(format!("short read for page {id}")))?;
            Ok(())
        };
        let (free, free_chain) = FreeList::deserialize(
            header.free_list_head,
            header.free_list_count,
            read_one,
            page_size,
        )?;

        info!(
            "opened page store at {path:?}: checkpoint {}, {} pages, {} free",
            header.checkpoint_number,
            header.total_page_count,
            free.reusable_count()
        );
        Ok(DurablePageStore {
            path,
            file,
            page_size,
            commit_lock: CommitLock::new(),
            commit_state: AtomicU8::new((header.checkpoint_number % 2) as u8),
            state: Mutex::new(DurableState {
                active_header,
                total_pages: header.total_page_count,
                free,
                free_chain,
            }),
            committed: Mutex::new(header),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_at(&self, id: PageId, buf: &[u8]) -> Result<()> {
        let mut f = self.file.lock();
        f.seek(SeekFrom::Start(id * self.page_size as u64))?;
        f.write_all(buf)?;
        Ok(())
    }
}

impl PageStore for DurablePageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn commit_lock(&self) -> &CommitLock {
        &self.commit_lock
    }

    fn commit_state(&self) -> u8 {
        self.commit_state.load(Ordering::Acquire)
    }

    fn flip_commit_state(&self) -> u8 {
        let next = self.commit_state() ^ 1;
        self.commit_state.store(next, Ordering::Release);
        next
    }

    fn alloc_page(&self) -> Result<PageId> {
        let mut state = self.state.lock();
        if let Some(id) = state.free.alloc() {
            return Ok(id);
        }
        let id = state.total_pages;
        if id > MAX_PAGE_ID {
            return Err(TuplError::DatabaseFull);
        }
        state.total_pages += 1;
        Ok(id)
    }

    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        if id < FIRST_DATA_PAGE {
            return Err(TuplError::CorruptDatabase(format!(
                "read of reserved page {id}"
            )));
        }
        let mut f = self.file.lock();
        f.seek(SeekFrom::Start(id * self.page_size as u64))?;
        f.read_exact(buf)
            .map_err(|_| StorageError(format!("short read for page {id}")))?;
        Ok(())
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        if id < FIRST_DATA_PAGE {
            return Err(TuplError::CorruptDatabase(format!(
                "write to reserved page {id}"
            )));
        }
        self.write_at(id, buf)
    }

    fn delete_page(&self, id: PageId) -> Result<()> {
        let commit_state = self.commit_state();
        self.state.lock().free.delete(id, commit_state);
        Ok(())
    }

    fn recycle_page(&self, id: PageId) -> Result<()> {
        self.state.lock().free.recycle(id);
        Ok(())
    }

    fn commit(
        &self,
        resume: bool,
        header: &mut CommitHeader,
        prepare: &mut dyn FnMut() -> Result<()>,
    ) -> Result<()> {
        prepare()?;

        let retiring = self.commit_state() ^ 1;
        let mut retired_chain: Vec<PageId> = Vec::new();
        let mut retired_ids: Vec<PageId> = Vec::new();
        if !resume {
            let mut state = self.state.lock();
            // Ids deleted under the retiring state join the persistent free
            // set now, but become allocatable only after the sync below.
            retired_ids = state.free.take_pending(retiring);
            let (head, count, chain) = {
                let DurableState {
                    total_pages, free, ..
                } = &mut *state;
                free.serialize(
                    &retired_ids,
                    self.page_size,
                    || {
                        let id = *total_pages;
                        if id > MAX_PAGE_ID {
                            return Err(TuplError::DatabaseFull);
                        }
                        *total_pages += 1;
                        Ok(id)
                    },
                    |id, page| self.write_at(id, page),
                )?
            };
            header.free_list_head = head;
            header.free_list_count = count;
            header.total_page_count = state.total_pages;
            header.checkpoint_number = self.committed.lock().checkpoint_number + 1;
            header.page_size = self.page_size as u32;
            retired_chain = std::mem::replace(&mut state.free_chain, chain);
        }

        let slot = {
            let state = self.state.lock();
            state.active_header ^ 1
        };
        let mut page = vec![0u8; self.page_size];
        header.pack(&mut page)?;
        {
            let mut f = self.file.lock();
            f.seek(SeekFrom::Start((slot * self.page_size) as u64))?;
            f.write_all(&page)?;
            f.sync_all()?;
        }

        {
            let mut state = self.state.lock();
            state.active_header = slot;
            // Retired ids are durable-free now; let allocation see them.
            for id in retired_ids {
                state.free.recycle(id);
            }
            // The previous commit's free-list chain is unreferenced now.
            // Reuse is in-memory only; after a crash those ids are simply
            // absent from both free lists until rewritten.
            for id in retired_chain {
                state.free.recycle(id);
            }
        }
        *self.committed.lock() = header.clone();
        debug!(
            "committed header {} (slot {slot}, registry root {})",
            header.checkpoint_number, header.registry_root_id
        );
        Ok(())
    }

    fn committed_header(&self) -> CommitHeader {
        self.committed.lock().clone()
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        let state = self.state.lock();
        StoreStats {
            total_pages: state.total_pages,
            free_pages: state.free.reusable_count() as u64,
            pending_free_pages: state.free.pending_count() as u64,
        }
    }
}

/// Page ids without a backing file. Reads and writes are rejected; the node
/// cache is the only copy of every page, so eviction pressure surfaces as
/// `DatabaseFull`.
pub struct NonDurablePageStore {
    page_size: usize,
    commit_lock: CommitLock,
    commit_state: AtomicU8,
    state: Mutex<DurableState>,
}

impl std::fmt::Debug for NonDurablePageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonDurablePageStore")
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl NonDurablePageStore {
    pub fn new(page_size: usize) -> Self {
        NonDurablePageStore {
            page_size,
            commit_lock: CommitLock::new(),
            commit_state: AtomicU8::new(0),
            state: Mutex::new(DurableState {
                active_header: 0,
                total_pages: FIRST_DATA_PAGE,
                free: FreeList::new(),
                free_chain: Vec::new(),
            }),
        }
    }
}

impl PageStore for NonDurablePageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn commit_lock(&self) -> &CommitLock {
        &self.commit_lock
    }

    fn commit_state(&self) -> u8 {
        self.commit_state.load(Ordering::Acquire)
    }

    fn flip_commit_state(&self) -> u8 {
        let next = self.commit_state() ^ 1;
        self.commit_state.store(next, Ordering::Release);
        next
    }

    fn alloc_page(&self) -> Result<PageId> {
        let mut state = self.state.lock();
        if let Some(id) = state.free.alloc() {
            return Ok(id);
        }
        let id = state.total_pages;
        if id > MAX_PAGE_ID {
            return Err(TuplError::DatabaseFull);
        }
        state.total_pages += 1;
        Ok(id)
    }

    fn read_page(&self, id: PageId, _buf: &mut [u8]) -> Result<()> {
        Err(StorageError(format!("non-durable store cannot read page {id}")).into())
    }

    fn write_page(&self, id: PageId, _buf: &[u8]) -> Result<()> {
        Err(StorageError(format!("non-durable store cannot write page {id}")).into())
    }

    fn delete_page(&self, id: PageId) -> Result<()> {
        // No snapshot can reference the page; reuse immediately.
        self.state.lock().free.recycle(id);
        Ok(())
    }

    fn recycle_page(&self, id: PageId) -> Result<()> {
        self.state.lock().free.recycle(id);
        Ok(())
    }

    fn commit(
        &self,
        _resume: bool,
        _header: &mut CommitHeader,
        _prepare: &mut dyn FnMut() -> Result<()>,
    ) -> Result<()> {
        Ok(())
    }

    fn committed_header(&self) -> CommitHeader {
        CommitHeader::new(self.page_size as u32)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        let state = self.state.lock();
        StoreStats {
            total_pages: state.total_pages,
            free_pages: state.free.reusable_count() as u64,
            pending_free_pages: state.free.pending_count() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_reopen_selects_committed_header() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("store.db");

        let store = DurablePageStore::create(&path, 512).unwrap();
        let id = store.alloc_page().unwrap();
        store.write_page(id, &vec![7u8; 512]).unwrap();
        let mut header = store.committed_header();
        header.registry_root_id = id;
        store.commit(false, &mut header, &mut || Ok(())).unwrap();
        drop(store);

        let store = DurablePageStore::open(&path, 512).unwrap();
        let committed = store.committed_header();
        assert_eq!(committed.registry_root_id, id);
        assert_eq!(committed.checkpoint_number, 2);
        let mut buf = vec![0u8; 512];
        store.read_page(id, &mut buf).unwrap();
        assert_eq!(buf, vec![7u8; 512]);
    }

    #[test]
    fn torn_header_falls_back_to_older_slot() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("torn.db");

        let store = DurablePageStore::create(&path, 512).unwrap();
        let mut header = store.committed_header();
        store.commit(false, &mut header, &mut || Ok(())).unwrap();
        let slot = {
            let state = store.state.lock();
            state.active_header
        };
        drop(store);

        // Corrupt the live slot; open must fall back to the other one.
        {
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start((slot * 512 + 100) as u64)).unwrap();
            f.write_all(&[0xff; 8]).unwrap();
            f.sync_all().unwrap();
        }
        let store = DurablePageStore::open(&path, 512).unwrap();
        assert_eq!(store.committed_header().checkpoint_number, 1);
    }

    #[test]
    fn deleted_page_reused_only_after_commit() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("defer.db");
        let store = DurablePageStore::create(&path, 512).unwrap();

        let id = store.alloc_page().unwrap();
        store.write_page(id, &vec![1u8; 512]).unwrap();
        store.delete_page(id).unwrap();
        let next = store.alloc_page().unwrap();
        assert_ne!(next, id);

        // The delete was tagged with state 0; flipping makes 0 the retiring
        // state at the next commit.
        store.flip_commit_state();
        let mut header = store.committed_header();
        store.commit(false, &mut header, &mut || Ok(())).unwrap();
        let reused = store.alloc_page().unwrap();
        assert_eq!(reused, id);
    }

    #[test]
    fn non_durable_rejects_io() {
        let store = NonDurablePageStore::new(4096);
        let id = store.alloc_page().unwrap();
        let mut buf = vec![0u8; 4096];
        assert!(store.read_page(id, &mut buf).is_err());
        assert!(store.write_page(id, &buf).is_err());
        store.delete_page(id).unwrap();
        assert_eq!(store.alloc_page().unwrap(), id);
    }
}

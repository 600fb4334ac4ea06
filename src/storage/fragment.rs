//! Fragmented values and keys.
//!
//! A payload too large to inline in a node is split into fragment pages
//! and represented by a directory record:
//!
//! ```text
//! header byte 0000_ffip
//!   ff  width of the full-length field: 2, 4, 6 or 8 bytes
//!   i   inline prefix present (u16 length + bytes follow the length field)
//!   p   0 = direct 6-byte page pointers, 1 = one indirect pointer to an
//!       inode tree of pointer pages
//! ```
//!
//! The inline prefix holds the head of the payload; the remainder fills
//! fragment pages in order, the last one partially. An inode tree is built
//! when the direct pointer list would not fit the directory budget: pointer
//! pages hold `page_size / 6` children each, stacked until a single root
//! remains. Both sides derive the tree shape from the full length, so the
//! directory never records a depth.

use std::sync::Arc;

use crate::core::errors::{Result, StorageError, TuplError};
use crate::storage::node::{CachedState, Node, NodeKind};
use crate::storage::node_cache::{LoadKind, NodeCache};
use crate::storage::page_store::PageStore;
use crate::storage::{read_id48, write_id48, PageId};

const F_INLINE: u8 = 0b10;
const F_INDIRECT: u8 = 0b01;

const POINTER_SIZE: usize = 6;

pub struct Fragmenter<'a> {
    pub store: &'a dyn PageStore,
    pub cache: &'a NodeCache,
}

impl<'a> Fragmenter<'a> {
    pub fn new(store: &'a dyn PageStore, cache: &'a NodeCache) -> Self {
        Fragmenter { store, cache }
    }

    fn page_size(&self) -> usize {
        self.store.page_size()
    }

    fn pointers_per_page(&self) -> usize {
        self.page_size() / POINTER_SIZE
    }

    /// Break `payload` into fragment pages and return a directory no larger
    /// than `budget` bytes.
    pub fn fragment(&self, payload: &[u8], budget: usize) -> Result<Vec<u8>> {
        let len = payload.len() as u64;
        let width = length_width(len);
        let page = self.page_size();

        // Prefer keeping the remainder inline: it saves a mostly-empty
        // trailing fragment page. Fall back to plain direct pointers, and
        // reach for an inode tree only when the pointer list itself
        // overflows the directory budget.
        let inline_len = (payload.len() % page).min(u16::MAX as usize);
        let with_inline = if inline_len > 0 {
            let pages = (payload.len() - inline_len) / page;
            let size = 1 + width + 2 + inline_len + POINTER_SIZE * pages;
            Some((size, inline_len, pages))
        } else {
            None
        };
        let direct_pages = payload.len().div_ceil(page);
        let direct_size = 1 + width + POINTER_SIZE * direct_pages;

        if let Some((size, inline_len, pages)) = with_inline {
            if size <= budget {
                return self.encode_direct(payload, width, inline_len, pages);
            }
        }
        if direct_size <= budget {
            return self.encode_direct(payload, width, 0, direct_pages);
        }
        let indirect_size = 1 + width + POINTER_SIZE;
        if indirect_size > budget {
            return Err(TuplError::LargeValue(payload.len()));
        }
        self.encode_indirect(payload, width)
    }

    fn encode_direct(
        &self,
        payload: &[u8],
        width: usize,
        inline_len: usize,
        pages: usize,
    ) -> Result<Vec<u8>> {
        let mut dir = Vec::with_capacity(1 + width + 2 + inline_len + POINTER_SIZE * pages);
        let mut header = (width_code(width)) << 2;
        if inline_len > 0 {
            header |= F_INLINE;
        }
        dir.push(header);
        dir.extend_from_slice(&(payload.len() as u64).to_le_bytes()[..width]);
        if inline_len > 0 {
            dir.extend_from_slice(&(inline_len as u16).to_le_bytes());
            dir.extend_from_slice(&payload[..inline_len]);
        }
        let ids = self.write_data_pages(&payload[inline_len..])?;
        debug_assert_eq!(ids.len(), pages);
        for id in ids {
            let mut buf = [0u8; 8];
            write_id48(&mut buf, 0, id);
            dir.extend_from_slice(&buf[..POINTER_SIZE]);
        }
        Ok(dir)
    }

    fn encode_indirect(&self, payload: &[u8], width: usize) -> Result<Vec<u8>> {
        let ids = self.write_data_pages(payload)?;
        let root = self.build_inode_tree(ids)?;
        let mut dir = Vec::with_capacity(1 + width + POINTER_SIZE);
        dir.push((width_code(width) << 2) | F_INDIRECT);
        dir.extend_from_slice(&(payload.len() as u64).to_le_bytes()[..width]);
        let mut buf = [0u8; 8];
        write_id48(&mut buf, 0, root);
        dir.extend_from_slice(&buf[..POINTER_SIZE]);
        Ok(dir)
    }

    /// Write `data` across fragment pages through the cache, so the
    /// checkpoint flushes them with everything else.
    fn write_data_pages(&self, data: &[u8]) -> Result<Vec<PageId>> {
        let page = self.page_size();
        let mut ids = Vec::with_capacity(data.len().div_ceil(page));
        for chunk in data.chunks(page) {
            ids.push(self.write_fragment_page(chunk)?);
        }
        Ok(ids)
    }

    fn write_fragment_page(&self, content: &[u8]) -> Result<PageId> {
        let id = self.store.alloc_page()?;
        let mut guard = self.cache.alloc_latched(self.store)?;
        guard.kind = NodeKind::Fragment;
        guard.state = CachedState::Dirty(self.store.commit_state());
        guard.page[..content.len()].copy_from_slice(content);
        guard.page[content.len()..].fill(0);
        guard.set_id(id);
        let node = guard.node().clone();
        drop(guard);
        self.cache.insert(&node);
        self.cache.mark_in_dirty(&node);
        Ok(id)
    }

    fn build_inode_tree(&self, mut ids: Vec<PageId>) -> Result<PageId> {
        let per = self.pointers_per_page();
        while ids.len() > 1 {
            let mut parents = Vec::with_capacity(ids.len().div_ceil(per));
            for group in ids.chunks(per) {
                let mut content = vec![0u8; group.len() * POINTER_SIZE];
                for (i, id) in group.iter().enumerate() {
                    write_id48(&mut content, i * POINTER_SIZE, *id);
                }
                parents.push(self.write_fragment_page(&content)?);
            }
            ids = parents;
        }
        ids.pop()
            .ok_or_else(|| StorageError("empty inode tree".into()).into())
    }

    /// Reassemble a fragmented payload from its directory.
    pub fn reconstruct(&self, dir: &[u8]) -> Result<Vec<u8>> {
        let parsed = Directory::parse(dir, self.page_size())?;
        let mut out = Vec::with_capacity(parsed.full_len as usize);
        out.extend_from_slice(parsed.inline);

        let remaining = (parsed.full_len as usize)
            .checked_sub(parsed.inline.len())
            .ok_or_else(|| {
                TuplError::CorruptDatabase("fragment inline longer than full length".into())
            })?;
        let data_ids = self.data_page_ids(&parsed, remaining)?;
        let page = self.page_size();
        let mut left = remaining;
        for id in data_ids {
            let take = left.min(page);
            let node = self
                .cache
                .get_or_load(self.store, id, LoadKind::Fragment)?;
            let taken = self.read_fragment(&node, id, take, &mut out)?;
            if !taken {
                // Evicted between lookup and latch; one reload attempt.
                let node = self
                    .cache
                    .get_or_load(self.store, id, LoadKind::Fragment)?;
                if !self.read_fragment(&node, id, take, &mut out)? {
                    return Err(TuplError::CorruptDatabase(format!(
                        "fragment page {id} unavailable"
                    )));
                }
            }
            left -= take;
        }
        if left != 0 {
            return Err(TuplError::CorruptDatabase(
                "fragmented payload shorter than its directory claims".into(),
            ));
        }
        Ok(out)
    }

    fn read_fragment(
        &self,
        node: &Arc<Node>,
        id: PageId,
        take: usize,
        out: &mut Vec<u8>,
    ) -> Result<bool> {
        let guard = node.read();
        if node.id() != id || guard.kind != NodeKind::Fragment {
            return Ok(false);
        }
        out.extend_from_slice(&guard.page[..take]);
        Ok(true)
    }

    /// Free every page referenced by the directory. Deletions are deferred
    /// through the store's pending-free machinery.
    pub fn delete(&self, dir: &[u8]) -> Result<()> {
        let parsed = Directory::parse(dir, self.page_size())?;
        let remaining = (parsed.full_len as usize)
            .checked_sub(parsed.inline.len())
            .ok_or_else(|| {
                TuplError::CorruptDatabase("fragment inline longer than full length".into())
            })?;
        if parsed.indirect {
            // Free the inode pages too, level by level.
            let sizes = level_sizes(
                remaining.div_ceil(self.page_size()),
                self.pointers_per_page(),
            );
            let mut ids = vec![parsed.root()?];
            for &level_size in sizes.iter().rev().skip(1) {
                let next = self.read_pointers(&ids, level_size)?;
                for &id in &ids {
                    self.drop_page(id)?;
                }
                ids = next;
            }
            for id in ids {
                self.drop_page(id)?;
            }
        } else {
            for id in parsed.direct_ids() {
                self.drop_page(id)?;
            }
        }
        Ok(())
    }

    fn drop_page(&self, id: PageId) -> Result<()> {
        self.cache.remove(id);
        self.store.delete_page(id)
    }

    fn data_page_ids(&self, parsed: &Directory<'_>, remaining: usize) -> Result<Vec<PageId>> {
        let n_data = remaining.div_ceil(self.page_size());
        if !parsed.indirect {
            let ids = parsed.direct_ids();
            if ids.len() != n_data {
                return Err(TuplError::CorruptDatabase(
                    "fragment directory pointer count mismatch".into(),
                ));
            }
            return Ok(ids);
        }
        if n_data == 0 {
            return Ok(Vec::new());
        }
        let sizes = level_sizes(n_data, self.pointers_per_page());
        let mut ids = vec![parsed.root()?];
        // sizes runs bottom-up; walk it top-down, expanding pointer pages.
        for &level_size in sizes.iter().rev().skip(1) {
            ids = self.read_pointers(&ids, level_size)?;
        }
        Ok(ids)
    }

    fn read_pointers(&self, pages: &[PageId], total: usize) -> Result<Vec<PageId>> {
        let per = self.pointers_per_page();
        let mut out = Vec::with_capacity(total);
        for (i, &id) in pages.iter().enumerate() {
            let want = (total - i * per).min(per);
            let node = self
                .cache
                .get_or_load(self.store, id, LoadKind::Fragment)?;
            let guard = node.read();
            if node.id() != id || guard.kind != NodeKind::Fragment {
                return Err(TuplError::CorruptDatabase(format!(
                    "inode page {id} unavailable"
                )));
            }
            for k in 0..want {
                out.push(read_id48(&guard.page, k * POINTER_SIZE));
            }
        }
        Ok(out)
    }
}

/// Payload length recorded in a directory, without touching any pages.
pub fn full_length(dir: &[u8]) -> Result<u64> {
    let header = *dir
        .first()
        .ok_or_else(|| StorageError("empty fragment directory".into()))?;
    let width = 2 + 2 * ((header >> 2) & 0b11) as usize;
    if dir.len() < 1 + width {
        return Err(StorageError("truncated fragment directory".into()).into());
    }
    let mut bytes = [0u8; 8];
    bytes[..width].copy_from_slice(&dir[1..1 + width]);
    Ok(u64::from_le_bytes(bytes))
}

struct Directory<'a> {
    full_len: u64,
    inline: &'a [u8],
    indirect: bool,
    pointers: &'a [u8],
}

impl<'a> Directory<'a> {
    fn parse(dir: &'a [u8], _page_size: usize) -> Result<Self> {
        let header = *dir
            .first()
            .ok_or_else(|| StorageError("empty fragment directory".into()))?;
        if header & 0xf0 != 0 {
            return Err(TuplError::CorruptDatabase(
                "fragment directory header corrupt".into(),
            ));
        }
        let width = 2 + 2 * ((header >> 2) & 0b11) as usize;
        let mut pos = 1;
        if dir.len() < pos + width {
            return Err(StorageError("truncated fragment directory".into()).into());
        }
        let mut bytes = [0u8; 8];
        bytes[..width].copy_from_slice(&dir[pos..pos + width]);
        let full_len = u64::from_le_bytes(bytes);
        pos += width;

        let inline = if header & F_INLINE != 0 {
            if dir.len() < pos + 2 {
                return Err(StorageError("truncated fragment directory".into()).into());
            }
            let n = u16::from_le_bytes(dir[pos..pos + 2].try_into().expect("2 bytes")) as usize;
            pos += 2;
            if dir.len() < pos + n {
                return Err(StorageError("truncated fragment directory".into()).into());
            }
            let s = &dir[pos..pos + n];
            pos += n;
            s
        } else {
            &dir[0..0]
        };

        let pointers = &dir[pos..];
        if pointers.len() % POINTER_SIZE != 0 {
            return Err(TuplError::CorruptDatabase(
                "fragment directory pointer area misaligned".into(),
            ));
        }
        Ok(Directory {
            full_len,
            inline,
            indirect: header & F_INDIRECT != 0,
            pointers,
        })
    }

    fn direct_ids(&self) -> Vec<PageId> {
        self.pointers
            .chunks(POINTER_SIZE)
            .map(|c| read_id48(c, 0))
            .collect()
    }

    fn root(&self) -> Result<PageId> {
        if self.pointers.len() != POINTER_SIZE {
            return Err(TuplError::CorruptDatabase(
                "indirect fragment directory must hold one pointer".into(),
            ));
        }
        Ok(read_id48(self.pointers, 0))
    }
}

/// Node counts per inode level, bottom (data pages) first.
fn level_sizes(n_data: usize, per: usize) -> Vec<usize> {
    let mut sizes = vec![n_data.max(1)];
    while *sizes.last().expect("non-empty") > 1 {
        let last = *sizes.last().expect("non-empty");
        sizes.push(last.div_ceil(per));
    }
    sizes
}

fn length_width(len: u64) -> usize {
    if len < (1 << 16) {
        2
    } else if len < (1 << 32) {
        4
    } else if len < (1 << 48) {
        6
    } else {
        8
    }
}

fn width_code(width: usize) -> u8 {
    ((width - 2) / 2) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::node_cache::NodeCache;
    use crate::storage::page_store::{DurablePageStore, PageStore};
    use tempfile::tempdir;

    fn setup(page_size: usize) -> (tempfile::TempDir, DurablePageStore, NodeCache) {
        let tmp = tempdir().unwrap();
        let store = DurablePageStore::create(tmp.path().join("frag.db"), page_size).unwrap();
        let cache = NodeCache::new(page_size, 1 << 20);
        (tmp, store, cache)
    }

    #[test]
    fn direct_roundtrip_with_inline_tail() {
        let (_tmp, store, cache) = setup(512);
        let frag = Fragmenter::new(&store, &cache);
        let payload: Vec<u8> = (0..1300u32).map(|i| (i % 251) as u8).collect();
        // 1300 = 2 full pages + 276-byte remainder, kept inline.
        let dir = frag.fragment(&payload, 400).unwrap();
        assert_ne!(dir[0] & F_INLINE, 0);
        assert_eq!(full_length(&dir).unwrap(), 1300);
        assert_eq!(frag.reconstruct(&dir).unwrap(), payload);

        // A tight budget drops the inline prefix but stays direct.
        let dir2 = frag.fragment(&payload, 40).unwrap();
        assert_eq!(dir2[0] & F_INLINE, 0);
        assert_eq!(frag.reconstruct(&dir2).unwrap(), payload);
    }

    #[test]
    fn exact_page_multiple_has_no_inline() {
        let (_tmp, store, cache) = setup(512);
        let frag = Fragmenter::new(&store, &cache);
        let payload = vec![7u8; 1024];
        let dir = frag.fragment(&payload, 256).unwrap();
        assert_eq!(dir[0] & F_INLINE, 0);
        assert_eq!(frag.reconstruct(&dir).unwrap(), payload);
    }

    #[test]
    fn indirect_roundtrip() {
        let (_tmp, store, cache) = setup(512);
        let frag = Fragmenter::new(&store, &cache);
        // 200 pages of data with a 32-byte budget forces the inode tree
        // (each inode page holds 85 pointers, so this takes two levels).
        let payload: Vec<u8> = (0..512 * 200u32).map(|i| (i % 239) as u8).collect();
        let dir = frag.fragment(&payload, 32).unwrap();
        assert_ne!(dir[0] & F_INDIRECT, 0);
        assert!(dir.len() <= 32);
        assert_eq!(frag.reconstruct(&dir).unwrap(), payload);
    }

    #[test]
    fn delete_returns_pages_to_the_store() {
        let (_tmp, store, cache) = setup(512);
        let frag = Fragmenter::new(&store, &cache);
        let payload = vec![3u8; 4096];
        let dir = frag.fragment(&payload, 256).unwrap();
        let before = store.stats().pending_free_pages;
        frag.delete(&dir).unwrap();
        assert!(store.stats().pending_free_pages > before);
    }

    #[test]
    fn budget_too_small_even_for_indirect() {
        let (_tmp, store, cache) = setup(512);
        let frag = Fragmenter::new(&store, &cache);
        let payload = vec![1u8; 2000];
        assert!(matches!(
            frag.fragment(&payload, 4),
            Err(TuplError::LargeValue(_))
        ));
    }
}

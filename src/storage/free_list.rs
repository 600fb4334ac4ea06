//! Free page bookkeeping.
//!
//! Two paths for freeing a page:
//! - `recycle`: the page was never part of a committed snapshot, so it may
//!   be handed out again immediately.
//! - `delete`: the page is still referenced by a committed header. It sits
//!   in the pending set for the commit state under which it was deleted,
//!   and becomes reusable only once the checkpoint that retires that state
//!   commits.
//!
//! At commit time the reusable queue is serialized into a chain of
//! free-list pages, delta-varint encoded:
//!
//! ```text
//! +0: next page id (6 bytes, 0 = end of chain)
//! +6: id count (u16)
//! +8: first id (varint), then deltas between consecutive sorted ids
//! ```

use std::collections::VecDeque;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::core::errors::{Result, StorageError};
use crate::core::varint;
use crate::storage::{read_id48, write_id48, PageId, NO_PAGE};

const CHAIN_HEADER: usize = 8;

#[derive(Debug, Default)]
pub struct FreeList {
    /// Immediately reusable ids.
    recycle: VecDeque<PageId>,
    /// Deleted ids awaiting the checkpoint that retires their state.
    pending: [Vec<PageId>; 2],
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self) -> Option<PageId> {
        self.recycle.pop_front()
    }

    pub fn recycle(&mut self, id: PageId) {
        self.recycle.push_back(id);
    }

    pub fn delete(&mut self, id: PageId, commit_state: u8) {
        self.pending[commit_state as usize].push(id);
    }

    /// Drain the retiring state's pending set. The ids belong in the
    /// checkpoint's serialized free set right away, but must re-enter the
    /// reusable queue only once that checkpoint is durable; the caller
    /// feeds them back through `recycle` after the commit syncs.
    pub fn take_pending(&mut self, retiring_state: u8) -> Vec<PageId> {
        std::mem::take(&mut self.pending[retiring_state as usize])
    }

    pub fn reusable_count(&self) -> usize {
        self.recycle.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending[0].len() + self.pending[1].len()
    }

    /// Serialize the reusable queue plus `extra` into a page chain.
    /// `alloc_fresh` must hand out ids outside the set being serialized,
    /// and `write` stores one finished page. Returns the head id and the
    /// number of ids written.
    pub fn serialize(
        &self,
        extra: &[PageId],
        page_size: usize,
        mut alloc_fresh: impl FnMut() -> Result<PageId>,
        mut write: impl FnMut(PageId, &[u8]) -> Result<()>,
    ) -> Result<(PageId, u64, Vec<PageId>)> {
        if self.recycle.is_empty() && extra.is_empty() {
            return Ok((NO_PAGE, 0, Vec::new()));
        }

        let mut ids: Vec<PageId> = self.recycle.iter().copied().chain(extra.iter().copied()).collect();
        ids.sort_unstable();
        ids.dedup();

        // Chunk ids into pages back-to-front so each page can point at the
        // next one without patching.
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let mut body = Vec::new();
        let mut prev: Option<PageId> = None;
        let mut counts: Vec<u16> = Vec::new();
        let mut count = 0u16;
        for &id in &ids {
            let delta = match prev {
                None => id,
                Some(p) => id - p,
            };
            let mut tmp = Vec::with_capacity(10);
            varint::write_u64(&mut tmp, delta);
            if body.len() + tmp.len() > page_size - CHAIN_HEADER || count == u16::MAX {
                chunks.push(std::mem::take(&mut body));
                counts.push(count);
                count = 0;
                prev = None;
                varint::write_u64(&mut body, id);
            } else {
                body.extend_from_slice(&tmp);
            }
            prev = Some(id);
            count += 1;
        }
        chunks.push(body);
        counts.push(count);

        let mut next = NO_PAGE;
        let mut chain = Vec::with_capacity(chunks.len());
        for (body, count) in chunks.iter().zip(counts.iter()).rev() {
            let page_id = alloc_fresh()?;
            let mut page = vec![0u8; page_size];
            write_id48(&mut page, 0, next);
            page[6..8].copy_from_slice(&count.to_le_bytes());
            page[CHAIN_HEADER..CHAIN_HEADER + body.len()].copy_from_slice(body);
            write(page_id, &page)?;
            next = page_id;
            chain.push(page_id);
        }
        chain.reverse();
        Ok((next, ids.len() as u64, chain))
    }

    /// Rebuild the reusable queue from a serialized chain.
    pub fn deserialize(
        head: PageId,
        expected: u64,
        mut read: impl FnMut(PageId, &mut [u8]) -> Result<()>,
        page_size: usize,
    ) -> Result<(Self, Vec<PageId>)> {
        let mut list = FreeList::new();
        let mut chain = Vec::new();
        let mut next = head;
        let mut total = 0u64;
        while next != NO_PAGE {
            chain.push(next);
            let mut page = vec![0u8; page_size];
            read(next, &mut page)?;
            next = read_id48(&page, 0);
            let count = (&page[6..8]).read_u16::<LittleEndian>()? as usize;
            let mut pos = CHAIN_HEADER;
            let mut id: PageId = 0;
            for i in 0..count {
                let v = varint::read_u64(&page, &mut pos)?;
                id = if i == 0 { v } else { id + v };
                list.recycle.push_back(id);
                total += 1;
            }
            if chain.len() as u64 > expected + 1 {
                return Err(StorageError("free list chain cycle".into()).into());
            }
        }
        if total != expected {
            return Err(StorageError(format!(
                "free list count mismatch: expected {expected}, decoded {total}"
            ))
            .into());
        }
        Ok((list, chain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn delete_is_deferred_until_retire() {
        let mut fl = FreeList::new();
        fl.delete(10, 0);
        fl.delete(11, 1);
        assert_eq!(fl.alloc(), None);
        for id in fl.take_pending(0) {
            fl.recycle(id);
        }
        assert_eq!(fl.alloc(), Some(10));
        assert_eq!(fl.alloc(), None);
        for id in fl.take_pending(1) {
            fl.recycle(id);
        }
        assert_eq!(fl.alloc(), Some(11));
    }

    #[test]
    fn recycle_is_immediate() {
        let mut fl = FreeList::new();
        fl.recycle(7);
        assert_eq!(fl.alloc(), Some(7));
    }

    #[test]
    fn serialize_roundtrip() {
        let page_size = 128;
        let mut fl = FreeList::new();
        for id in (100..400).step_by(3) {
            fl.recycle(id);
        }
        let mut pages: HashMap<PageId, Vec<u8>> = HashMap::new();
        let mut fresh = 1000u64;
        let (head, count, chain) = fl
            .serialize(
                &[],
                page_size,
                || {
                    fresh += 1;
                    Ok(fresh)
                },
                |id, page| {
                    pages.insert(id, page.to_vec());
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(count, 100);
        assert!(!chain.is_empty());

        let (back, chain2) = FreeList::deserialize(
            head,
            count,
            |id, buf| {
                buf.copy_from_slice(pages.get(&id).expect("chain page"));
                Ok(())
            },
            page_size,
        )
        .unwrap();
        assert_eq!(chain2, chain);
        let mut got: Vec<PageId> = Vec::new();
        let mut b = back;
        while let Some(id) = b.alloc() {
            got.push(id);
        }
        let want: Vec<PageId> = (100..400).step_by(3).collect();
        assert_eq!(got, want);
    }
}

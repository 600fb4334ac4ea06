//! Per-transaction undo log: a stack of reversible operations.
//!
//! Small logs live in an in-memory entry buffer. Once the encoded size
//! crosses half a page the log spills into a chain of undo pages and stays
//! there. Chain pages are allocated through the node cache so the
//! checkpoint persists them along with everything else; the master undo
//! log then references them by page id.
//!
//! Page layout:
//!
//! ```text
//! 0: page kind (u8, 4 = undo log)
//! 1: reserved
//! 2: top_pos (u16)            offset of the newest stream byte
//! 4: lower node id (6 bytes)  next (older) page in the chain, 0 = end
//! ```
//!
//! Entry bytes grow from the page tail toward the header. The logical
//! stream reads newest-first: the top page from `top_pos` to the end, then
//! each lower page from just past its header to the end (lower pages are
//! always full).
//!
//! Entry encoding: `opcode`, then for opcodes >= 16 a varint payload
//! length and the payload.

use byteorder::{ByteOrder, LittleEndian};

use crate::core::errors::{Result, StorageError, TuplError};
use crate::core::varint;
use crate::db::DbCore;
use crate::storage::node::NodeKind;
use crate::storage::node_cache::LoadKind;
use crate::storage::{read_id48, write_id48, PageId, NO_PAGE};
use crate::txn::TxnId;

// Marker opcodes (no payload).
pub const OP_SCOPE_ENTER: u8 = 1;
pub const OP_SCOPE_COMMIT: u8 = 2;
pub const OP_COMMIT: u8 = 3;
pub const OP_COMMIT_TRUNCATE: u8 = 4;

// Payload opcodes (varint length follows the opcode).
pub const OP_ACTIVE_INDEX: u8 = 16;
pub const OP_UNINSERT: u8 = 17;
pub const OP_UNUPDATE: u8 = 18;
pub const OP_UNDELETE: u8 = 19;
pub const OP_UNDELETE_FRAGMENTED: u8 = 20;
pub const OP_CUSTOM: u8 = 21;
// "LK" variants carry an explicit key length for fragmented keys.
pub const OP_UNINSERT_LK: u8 = 22;
pub const OP_UNUPDATE_LK: u8 = 23;
pub const OP_UNDELETE_LK: u8 = 24;
// Master-log entries.
pub const OP_LOG_COPY: u8 = 25;
pub const OP_LOG_REF: u8 = 26;

pub const UNDO_PAGE_KIND: u8 = 4;
const UNDO_HEADER: usize = 10;
const POS_TOP: usize = 2;
const POS_LOWER: usize = 4;

fn page_cap(page_size: usize) -> usize {
    page_size.min(u16::MAX as usize)
}

#[derive(Debug)]
pub struct UndoLog {
    pub txn_id: TxnId,
    /// Index the newest entries apply to; switches are recorded inline.
    pub active_index: u64,
    /// Encoded entries, oldest first, until the log spills.
    buffer: Vec<Vec<u8>>,
    buffer_bytes: usize,
    spilled: bool,
    top: PageId,
    top_pos: usize,
    /// Total stream bytes in the spilled chain.
    pub length: u64,
}

impl UndoLog {
    pub fn new(txn_id: TxnId) -> UndoLog {
        UndoLog {
            txn_id,
            active_index: 0,
            buffer: Vec::new(),
            buffer_bytes: 0,
            spilled: false,
            top: NO_PAGE,
            top_pos: 0,
            length: 0,
        }
    }

    /// Rebuild from a master-log reference.
    pub fn from_ref(
        txn_id: TxnId,
        active_index: u64,
        length: u64,
        top: PageId,
        top_pos: usize,
    ) -> UndoLog {
        UndoLog {
            txn_id,
            active_index,
            buffer: Vec::new(),
            buffer_bytes: 0,
            spilled: true,
            top,
            top_pos,
            length,
        }
    }

    /// Rebuild from a master-log inline copy.
    pub fn from_copy(txn_id: TxnId, active_index: u64, blob: &[u8]) -> Result<UndoLog> {
        let mut log = UndoLog::new(txn_id);
        log.active_index = active_index;
        let mut pos = 0;
        while pos < blob.len() {
            let start = pos;
            let op = blob[pos];
            pos += 1;
            if op >= 16 {
                let len = varint::read_u64(blob, &mut pos)? as usize;
                if pos + len > blob.len() {
                    return Err(StorageError("master log copy truncated".into()).into());
                }
                pos += len;
            }
            log.buffer.push(blob[start..pos].to_vec());
            log.buffer_bytes += pos - start;
        }
        Ok(log)
    }

    pub fn is_empty(&self) -> bool {
        !self.spilled && self.buffer.is_empty()
    }

    pub fn is_spilled(&self) -> bool {
        self.spilled
    }

    pub fn top(&self) -> (PageId, usize) {
        (self.top, self.top_pos)
    }

    // ---- push --------------------------------------------------------

    fn encode(op: u8, payload: &[u8]) -> Vec<u8> {
        if op < 16 {
            debug_assert!(payload.is_empty());
            return vec![op];
        }
        let mut out = Vec::with_capacity(1 + 10 + payload.len());
        out.push(op);
        varint::write_u64(&mut out, payload.len() as u64);
        out.extend_from_slice(payload);
        out
    }

    pub fn push(&mut self, core: &DbCore, op: u8, payload: &[u8]) -> Result<()> {
        let entry = Self::encode(op, payload);
        if !self.spilled {
            let limit = core.cache.page_size() / 2;
            if self.buffer_bytes + entry.len() <= limit {
                self.buffer_bytes += entry.len();
                self.buffer.push(entry);
                return Ok(());
            }
            self.spill(core)?;
        }
        self.push_to_chain(core, &entry)
    }

    /// Record a switch of the active index so rollback can switch back as
    /// it pops past the boundary.
    pub fn ensure_active_index(&mut self, core: &DbCore, index_id: u64) -> Result<()> {
        if self.active_index == index_id {
            return Ok(());
        }
        if self.active_index != 0 {
            let mut payload = Vec::new();
            varint::write_u64(&mut payload, self.active_index);
            self.push(core, OP_ACTIVE_INDEX, &payload)?;
        }
        self.active_index = index_id;
        Ok(())
    }

    /// Move every buffered entry into the page chain, oldest first.
    fn spill(&mut self, core: &DbCore) -> Result<()> {
        let entries = std::mem::take(&mut self.buffer);
        self.buffer_bytes = 0;
        for entry in &entries {
            self.push_to_chain(core, entry)?;
        }
        Ok(())
    }

    /// Force the log onto pages; used before a master-log reference is
    /// taken.
    pub fn force_spill(&mut self, core: &DbCore) -> Result<()> {
        if !self.spilled {
            self.spill(core)?;
            if !self.spilled {
                // Nothing was buffered; materialize an empty chain anyway.
                self.new_top_page(core)?;
            }
        }
        Ok(())
    }

    fn new_top_page(&mut self, core: &DbCore) -> Result<()> {
        let cap = page_cap(core.cache.page_size());
        let id = core.store.alloc_page()?;
        let mut guard = core.cache.alloc_latched(core.store.as_ref())?;
        guard.kind = NodeKind::UndoLog;
        guard.state = crate::storage::node::CachedState::Dirty(core.store.commit_state());
        guard.page.fill(0);
        guard.page[0] = UNDO_PAGE_KIND;
        LittleEndian::write_u16(&mut guard.page[POS_TOP..POS_TOP + 2], cap as u16);
        write_id48(&mut guard.page, POS_LOWER, self.top);
        guard.set_id(id);
        let node = guard.node().clone();
        drop(guard);
        core.cache.insert(&node);
        core.cache.mark_in_dirty(&node);
        self.top = id;
        self.top_pos = cap;
        self.spilled = true;
        Ok(())
    }

    fn push_to_chain(&mut self, core: &DbCore, bytes: &[u8]) -> Result<()> {
        let mut remaining = bytes.len();
        while remaining > 0 {
            if !self.spilled || self.top_pos <= UNDO_HEADER {
                self.new_top_page(core)?;
            }
            let avail = self.top_pos - UNDO_HEADER;
            let take = avail.min(remaining);
            let new_pos = self.top_pos - take;
            self.with_top(core, |page| {
                page[new_pos..new_pos + take]
                    .copy_from_slice(&bytes[remaining - take..remaining]);
                LittleEndian::write_u16(&mut page[POS_TOP..POS_TOP + 2], new_pos as u16);
            })?;
            self.top_pos = new_pos;
            remaining -= take;
        }
        self.length += bytes.len() as u64;
        Ok(())
    }

    /// Mutate the top page under its latch, relocating it first when a
    /// checkpoint cleaned it (the committed copy must stay intact).
    fn with_top(&mut self, core: &DbCore, f: impl FnOnce(&mut [u8])) -> Result<()> {
        let node = core
            .cache
            .get_or_load(core.store.as_ref(), self.top, LoadKind::UndoLog)?;
        let mut guard = node.write();
        if node.id() != self.top || guard.kind != NodeKind::UndoLog {
            return Err(TuplError::CorruptDatabase(format!(
                "undo page {} unavailable",
                self.top
            )));
        }
        core.mark_dirty(&mut guard)?;
        self.top = guard.node().id();
        f(&mut guard.page);
        Ok(())
    }

    // ---- pop ---------------------------------------------------------

    /// Opcode of the newest entry without consuming it.
    pub fn peek_op(&self, core: &DbCore) -> Result<Option<u8>> {
        if !self.spilled {
            return Ok(self.buffer.last().map(|e| e[0]));
        }
        let cap = page_cap(core.cache.page_size());
        let mut id = self.top;
        let mut pos = self.top_pos;
        loop {
            if id == NO_PAGE {
                return Ok(None);
            }
            let node = core
                .cache
                .get_or_load(core.store.as_ref(), id, LoadKind::UndoLog)?;
            let guard = node.read();
            if pos >= cap {
                // The top page is fully drained; the newest byte lives in
                // the next (older) page.
                id = read_id48(&guard.page, POS_LOWER);
                pos = UNDO_HEADER;
                continue;
            }
            return Ok(Some(guard.page[pos]));
        }
    }

    fn exhausted(&self, core: &DbCore) -> bool {
        let cap = page_cap(core.cache.page_size());
        self.top == NO_PAGE || (self.top_pos >= cap && self.lower_of_top(core).unwrap_or(NO_PAGE) == NO_PAGE)
    }

    fn lower_of_top(&self, core: &DbCore) -> Result<PageId> {
        let node = core
            .cache
            .get_or_load(core.store.as_ref(), self.top, LoadKind::UndoLog)?;
        let guard = node.read();
        Ok(read_id48(&guard.page, POS_LOWER))
    }

    /// Pop the newest entry, returning its opcode and payload.
    pub fn pop(&mut self, core: &DbCore) -> Result<Option<(u8, Vec<u8>)>> {
        if !self.spilled {
            let Some(entry) = self.buffer.pop() else {
                return Ok(None);
            };
            self.buffer_bytes -= entry.len();
            let op = entry[0];
            if op < 16 {
                return Ok(Some((op, Vec::new())));
            }
            let mut pos = 1;
            let len = varint::read_u64(&entry, &mut pos)? as usize;
            return Ok(Some((op, entry[pos..pos + len].to_vec())));
        }

        if self.exhausted(core) {
            return Ok(None);
        }
        let op = self.read_stream(core, 1)?[0];
        if op < 16 {
            return Ok(Some((op, Vec::new())));
        }
        // Varint length, one byte at a time.
        let mut len: u64 = 0;
        let mut shift = 0;
        loop {
            let b = self.read_stream(core, 1)?[0];
            len |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 64 {
                return Err(TuplError::CorruptDatabase("undo varint overflow".into()));
            }
        }
        let payload = self.read_stream(core, len as usize)?;
        Ok(Some((op, payload)))
    }

    /// Consume `n` stream bytes, freeing pages as they drain.
    fn read_stream(&mut self, core: &DbCore, n: usize) -> Result<Vec<u8>> {
        let cap = page_cap(core.cache.page_size());
        let mut out = Vec::with_capacity(n);
        let mut need = n;
        while need > 0 {
            if self.top == NO_PAGE {
                return Err(TuplError::CorruptDatabase("undo log truncated".into()));
            }
            if self.top_pos >= cap {
                let lower = self.lower_of_top(core)?;
                self.release_page(core, self.top)?;
                self.top = lower;
                self.top_pos = UNDO_HEADER;
                continue;
            }
            let node = core
                .cache
                .get_or_load(core.store.as_ref(), self.top, LoadKind::UndoLog)?;
            let guard = node.read();
            let take = (cap - self.top_pos).min(need);
            out.extend_from_slice(&guard.page[self.top_pos..self.top_pos + take]);
            drop(guard);
            self.top_pos += take;
            need -= take;
        }
        self.length = self.length.saturating_sub(n as u64);
        Ok(out)
    }

    fn release_page(&self, core: &DbCore, id: PageId) -> Result<()> {
        core.cache.remove(id);
        // Deferred: the page may be referenced by the committed master
        // undo log until the next checkpoint supersedes it.
        core.store.delete_page(id)
    }

    /// Walk the chain freeing every page (committed log skipped by
    /// recovery, or a log discarded wholesale).
    pub fn free_chain(&mut self, core: &DbCore) -> Result<()> {
        let mut id = self.top;
        while id != NO_PAGE {
            let lower = {
                let node = core
                    .cache
                    .get_or_load(core.store.as_ref(), id, LoadKind::UndoLog)?;
                let guard = node.read();
                read_id48(&guard.page, POS_LOWER)
            };
            self.release_page(core, id)?;
            id = lower;
        }
        self.top = NO_PAGE;
        self.top_pos = 0;
        self.spilled = false;
        self.buffer.clear();
        self.buffer_bytes = 0;
        self.length = 0;
        Ok(())
    }

    /// Mark the log committed and release it. A crash between the marker
    /// and the next checkpoint leaves a chain whose newest entry is
    /// `OP_COMMIT_TRUNCATE`; recovery skips it without decoding further.
    /// The deletes are deferred, so the committed master undo log keeps
    /// readable pages until the next checkpoint supersedes it.
    pub fn commit_and_truncate(&mut self, core: &DbCore) -> Result<()> {
        if self.spilled {
            let entry = Self::encode(OP_COMMIT_TRUNCATE, &[]);
            self.push_to_chain(core, &entry)?;
            self.free_chain(core)?;
        }
        self.buffer.clear();
        self.buffer_bytes = 0;
        self.spilled = false;
        self.top = NO_PAGE;
        self.top_pos = 0;
        self.length = 0;
        Ok(())
    }

    // ---- master log --------------------------------------------------

    /// Append this log's master entry: an inline copy for buffered logs, a
    /// reference for spilled ones.
    pub fn push_master_entry(&self, core: &DbCore, master: &mut UndoLog) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let mut payload = Vec::new();
        varint::write_u64(&mut payload, self.txn_id);
        varint::write_u64(&mut payload, self.active_index);
        if self.spilled {
            varint::write_u64(&mut payload, self.length);
            let mut id = [0u8; 8];
            write_id48(&mut id, 0, self.top);
            payload.extend_from_slice(&id[..6]);
            varint::write_u64(&mut payload, self.top_pos as u64);
            master.push(core, OP_LOG_REF, &payload)
        } else {
            for entry in &self.buffer {
                payload.extend_from_slice(entry);
            }
            master.push(core, OP_LOG_COPY, &payload)
        }
    }

    /// Decode one master entry back into an `UndoLog`.
    pub fn from_master_entry(op: u8, payload: &[u8]) -> Result<UndoLog> {
        let mut pos = 0;
        let txn_id = varint::read_u64(payload, &mut pos)?;
        let active_index = varint::read_u64(payload, &mut pos)?;
        match op {
            OP_LOG_COPY => UndoLog::from_copy(txn_id, active_index, &payload[pos..]),
            OP_LOG_REF => {
                let length = varint::read_u64(payload, &mut pos)?;
                if pos + 6 > payload.len() {
                    return Err(StorageError("master log ref truncated".into()).into());
                }
                let top = read_id48(payload, pos);
                pos += 6;
                let top_pos = varint::read_u64(payload, &mut pos)? as usize;
                Ok(UndoLog::from_ref(txn_id, active_index, length, top, top_pos))
            }
            other => Err(TuplError::CorruptDatabase(format!(
                "unexpected master log opcode {other}"
            ))),
        }
    }
}

// ---- payload builders used by the transaction layer -------------------

pub fn payload_key(key: &[u8]) -> Vec<u8> {
    key.to_vec()
}

pub fn payload_key_value(key: &[u8], flags: u8, stored: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + key.len() + 1 + stored.len());
    varint::write_u64(&mut out, key.len() as u64);
    out.extend_from_slice(key);
    out.push(flags);
    out.extend_from_slice(stored);
    out
}

pub fn parse_key_value(payload: &[u8]) -> Result<(Vec<u8>, u8, Vec<u8>)> {
    let mut pos = 0;
    let klen = varint::read_u64(payload, &mut pos)? as usize;
    if pos + klen + 1 > payload.len() {
        return Err(StorageError("undo payload truncated".into()).into());
    }
    let key = payload[pos..pos + klen].to_vec();
    pos += klen;
    let flags = payload[pos];
    pos += 1;
    Ok((key, flags, payload[pos..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_encoding_markers_are_single_bytes() {
        assert_eq!(UndoLog::encode(OP_SCOPE_ENTER, &[]), vec![OP_SCOPE_ENTER]);
        let e = UndoLog::encode(OP_UNINSERT, b"key");
        assert_eq!(e[0], OP_UNINSERT);
        assert_eq!(e[1], 3);
        assert_eq!(&e[2..], b"key");
    }

    #[test]
    fn copy_roundtrip_preserves_order() {
        let mut blob = Vec::new();
        blob.extend(UndoLog::encode(OP_SCOPE_ENTER, &[]));
        blob.extend(UndoLog::encode(OP_UNINSERT, b"a"));
        blob.extend(UndoLog::encode(OP_UNUPDATE, b"bb"));
        let log = UndoLog::from_copy(9, 16, &blob).unwrap();
        assert_eq!(log.txn_id, 9);
        assert_eq!(log.active_index, 16);
        assert_eq!(log.buffer.len(), 3);
        assert_eq!(log.buffer[0], vec![OP_SCOPE_ENTER]);
    }

    #[test]
    fn key_value_payload_roundtrip() {
        let p = payload_key_value(b"k1", 2, b"stored-bytes");
        let (k, f, v) = parse_key_value(&p).unwrap();
        assert_eq!(k, b"k1");
        assert_eq!(f, 2);
        assert_eq!(v, b"stored-bytes");
    }
}

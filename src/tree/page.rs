//! Slotted page layout for tree nodes.
//!
//! Both node kinds share the same free-space model:
//! - the **slot directory** grows forward from the header (`lower` moves up),
//! - the **record area** grows backward from the end (`upper` moves down),
//! - free space is the gap between them.
//!
//! Header (little-endian):
//! ```text
//! 0: kind (u8)        1 = leaf, 2 = internal
//! 1: reserved (u8)
//! 2: slot_count (u16)
//! 4: lower (u16)
//! 6: upper (u16)
//! 8: first child id (6 bytes, internal only)
//! ```
//!
//! Leaf record: `flags u8, klen u16, vlen u16, key, value`.
//! Internal record: `flags u8, klen u16, key, child id (6 bytes)`.
//!
//! Keys and values may be stored fragmented: the record then holds the
//! fragment directory instead of the raw bytes, marked by a flag bit.

use byteorder::{ByteOrder, LittleEndian};

use crate::core::errors::{Result, StorageError, TuplError};
use crate::storage::{read_id48, write_id48, PageId};

pub const KIND_LEAF: u8 = 1;
pub const KIND_INTERNAL: u8 = 2;

/// Entry flag bits.
pub const KEY_FRAGMENTED: u8 = 0b0000_0001;
pub const VALUE_FRAGMENTED: u8 = 0b0000_0010;
pub const GHOST: u8 = 0b0000_0100;

const HDR_KIND: usize = 0;
const HDR_SLOT_COUNT: usize = 2;
const HDR_LOWER: usize = 4;
const HDR_UPPER: usize = 6;
const HDR_FIRST_CHILD: usize = 8;

pub const LEAF_HEADER: usize = 8;
pub const INTERNAL_HEADER: usize = 14;
const SLOT_SIZE: usize = 4;

const LEAF_RECORD_HEADER: usize = 5;
const INTERNAL_RECORD_HEADER: usize = 3;
const CHILD_ID_SIZE: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub flags: u8,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalEntry {
    pub flags: u8,
    pub key: Vec<u8>,
    pub child: PageId,
}

fn corrupt(msg: impl Into<String>) -> TuplError {
    TuplError::CorruptDatabase(msg.into())
}

/// Offsets are u16; a 64 KiB page loses its final byte to stay addressable.
fn cap_of(buf: &[u8]) -> usize {
    buf.len().min(u16::MAX as usize)
}

fn leaf_record_len(klen: usize, vlen: usize) -> usize {
    LEAF_RECORD_HEADER + klen + vlen
}

fn internal_record_len(klen: usize) -> usize {
    INTERNAL_RECORD_HEADER + klen + CHILD_ID_SIZE
}

// Shared read-side mechanics over an immutable page buffer.

fn header_usize(buf: &[u8], off: usize) -> usize {
    LittleEndian::read_u16(&buf[off..off + 2]) as usize
}

fn slot(buf: &[u8], header: usize, idx: usize) -> Result<(usize, usize)> {
    let count = header_usize(buf, HDR_SLOT_COUNT);
    if idx >= count {
        return Err(corrupt(format!("slot {idx} out of bounds (count {count})")));
    }
    let base = header + idx * SLOT_SIZE;
    let off = header_usize(buf, base);
    let len = header_usize(buf, base + 2);
    if off < header || off + len > buf.len() || len == 0 {
        return Err(corrupt(format!("record out of bounds: off={off} len={len}")));
    }
    Ok((off, len))
}

fn validate(buf: &[u8], kind: u8, header: usize) -> Result<()> {
    if buf.len() < header {
        return Err(corrupt("page smaller than header"));
    }
    if buf[HDR_KIND] != kind {
        return Err(corrupt(format!(
            "unexpected page kind {} (wanted {kind})",
            buf[HDR_KIND]
        )));
    }
    let count = header_usize(buf, HDR_SLOT_COUNT);
    let lower = header_usize(buf, HDR_LOWER);
    let upper = header_usize(buf, HDR_UPPER);
    if lower != header + count * SLOT_SIZE {
        return Err(corrupt(format!("lower mismatch: {lower} with {count} slots")));
    }
    if lower > upper || upper > cap_of(buf) {
        return Err(corrupt(format!("free space corrupt: lower={lower} upper={upper}")));
    }
    Ok(())
}

/// Read-only view of a leaf page.
#[derive(Debug)]
pub struct LeafPage<'a> {
    buf: &'a [u8],
}

impl<'a> LeafPage<'a> {
    pub fn open(buf: &'a [u8]) -> Result<Self> {
        validate(buf, KIND_LEAF, LEAF_HEADER)?;
        Ok(LeafPage { buf })
    }

    pub fn slot_count(&self) -> usize {
        header_usize(self.buf, HDR_SLOT_COUNT)
    }

    pub fn flags_at(&self, idx: usize) -> Result<u8> {
        let (off, _) = slot(self.buf, LEAF_HEADER, idx)?;
        Ok(self.buf[off])
    }

    pub fn key_at(&self, idx: usize) -> Result<(u8, &'a [u8])> {
        let (off, len) = slot(self.buf, LEAF_HEADER, idx)?;
        let (flags, klen, _vlen) = self.record_header(off, len)?;
        let start = off + LEAF_RECORD_HEADER;
        Ok((flags, &self.buf[start..start + klen]))
    }

    pub fn value_at(&self, idx: usize) -> Result<(u8, &'a [u8])> {
        let (off, len) = slot(self.buf, LEAF_HEADER, idx)?;
        let (flags, klen, vlen) = self.record_header(off, len)?;
        let start = off + LEAF_RECORD_HEADER + klen;
        Ok((flags, &self.buf[start..start + vlen]))
    }

    pub fn entry_at(&self, idx: usize) -> Result<LeafEntry> {
        let (flags, key) = self.key_at(idx)?;
        let (_, value) = self.value_at(idx)?;
        Ok(LeafEntry {
            flags,
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    pub fn entries(&self) -> Result<Vec<LeafEntry>> {
        (0..self.slot_count()).map(|i| self.entry_at(i)).collect()
    }

    /// Bytes in live use: header, slots, and reachable records.
    pub fn live_bytes(&self) -> Result<usize> {
        let mut total = LEAF_HEADER + self.slot_count() * SLOT_SIZE;
        for i in 0..self.slot_count() {
            let (_, len) = slot(self.buf, LEAF_HEADER, i)?;
            total += len;
        }
        Ok(total)
    }

    fn record_header(&self, off: usize, len: usize) -> Result<(u8, usize, usize)> {
        if len < LEAF_RECORD_HEADER {
            return Err(corrupt("leaf record too small"));
        }
        let flags = self.buf[off];
        let klen = LittleEndian::read_u16(&self.buf[off + 1..off + 3]) as usize;
        let vlen = LittleEndian::read_u16(&self.buf[off + 3..off + 5]) as usize;
        if leaf_record_len(klen, vlen) != len {
            return Err(corrupt(format!("leaf record length mismatch at {off}")));
        }
        Ok((flags, klen, vlen))
    }
}

/// Mutable view of a leaf page.
#[derive(Debug)]
pub struct LeafPageMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> LeafPageMut<'a> {
    /// Initialize `buf` as an empty leaf.
    pub fn init(buf: &'a mut [u8]) -> Result<Self> {
        if buf.len() < LEAF_HEADER {
            return Err(corrupt("page smaller than leaf header"));
        }
        let cap = cap_of(buf);
        buf.fill(0);
        buf[HDR_KIND] = KIND_LEAF;
        LittleEndian::write_u16(&mut buf[HDR_SLOT_COUNT..HDR_SLOT_COUNT + 2], 0);
        LittleEndian::write_u16(&mut buf[HDR_LOWER..HDR_LOWER + 2], LEAF_HEADER as u16);
        LittleEndian::write_u16(&mut buf[HDR_UPPER..HDR_UPPER + 2], cap as u16);
        Ok(LeafPageMut { buf })
    }

    pub fn open(buf: &'a mut [u8]) -> Result<Self> {
        validate(buf, KIND_LEAF, LEAF_HEADER)?;
        Ok(LeafPageMut { buf })
    }

    pub fn r(&self) -> LeafPage<'_> {
        LeafPage { buf: &*self.buf }
    }

    /// Splice an entry in at `idx`, keeping slot order. Returns false when
    /// the page cannot hold it even after compaction.
    pub fn insert_at(&mut self, idx: usize, flags: u8, key: &[u8], value: &[u8]) -> Result<bool> {
        let record_len = leaf_record_len(key.len(), value.len());
        let need = record_len + SLOT_SIZE;
        if self.free_contiguous() < need {
            self.compact()?;
            if self.free_contiguous() < need {
                return Ok(false);
            }
        }

        let upper = header_usize(self.buf, HDR_UPPER);
        let new_upper = upper
            .checked_sub(record_len)
            .ok_or_else(|| corrupt("upper underflow"))?;
        self.buf[new_upper] = flags;
        LittleEndian::write_u16(
            &mut self.buf[new_upper + 1..new_upper + 3],
            key.len() as u16,
        );
        LittleEndian::write_u16(
            &mut self.buf[new_upper + 3..new_upper + 5],
            value.len() as u16,
        );
        let key_start = new_upper + LEAF_RECORD_HEADER;
        self.buf[key_start..key_start + key.len()].copy_from_slice(key);
        let val_start = key_start + key.len();
        self.buf[val_start..val_start + value.len()].copy_from_slice(value);

        self.insert_slot(LEAF_HEADER, idx, new_upper, record_len)?;
        LittleEndian::write_u16(&mut self.buf[HDR_UPPER..HDR_UPPER + 2], new_upper as u16);
        Ok(true)
    }

    /// Replace the value (and flags) of the entry at `idx`, keeping its
    /// key. On overflow the original entry is restored and false returned.
    pub fn replace_at(&mut self, idx: usize, flags: u8, value: &[u8]) -> Result<bool> {
        let (key, old_flags, old_value) = {
            let r = self.r();
            let (_, k) = r.key_at(idx)?;
            let (of, v) = r.value_at(idx)?;
            (k.to_vec(), of, v.to_vec())
        };
        self.remove_at(idx)?;
        if self.insert_at(idx, flags, &key, value)? {
            return Ok(true);
        }
        // The old record fit before, so re-inserting it cannot fail.
        if !self.insert_at(idx, old_flags, &key, &old_value)? {
            return Err(corrupt("replace_at failed to restore original entry"));
        }
        Ok(false)
    }

    /// Rewrite the flags byte in place.
    pub fn set_flags_at(&mut self, idx: usize, flags: u8) -> Result<()> {
        let (off, _) = slot(self.buf, LEAF_HEADER, idx)?;
        self.buf[off] = flags;
        Ok(())
    }

    /// Remove the slot; record bytes become garbage until compaction.
    pub fn remove_at(&mut self, idx: usize) -> Result<()> {
        remove_slot(self.buf, LEAF_HEADER, idx)
    }

    pub fn free_contiguous(&self) -> usize {
        let lower = header_usize(self.buf, HDR_LOWER);
        let upper = header_usize(self.buf, HDR_UPPER);
        upper.saturating_sub(lower)
    }

    /// Rewrite records tightly against the end of the page, reclaiming
    /// garbage left behind by removals.
    pub fn compact(&mut self) -> Result<()> {
        compact(self.buf, LEAF_HEADER)
    }

    fn insert_slot(&mut self, header: usize, idx: usize, off: usize, len: usize) -> Result<()> {
        insert_slot(self.buf, header, idx, off, len)
    }

    /// Build a fresh leaf from sorted entries. Fails with `CorruptDatabase`
    /// when they cannot fit, which callers treat as a split-sizing bug.
    pub fn build(buf: &'a mut [u8], entries: &[LeafEntry]) -> Result<()> {
        let mut page = LeafPageMut::init(buf)?;
        for (i, e) in entries.iter().enumerate() {
            if !page.insert_at(i, e.flags, &e.key, &e.value)? {
                return Err(corrupt("leaf build overflow"));
            }
        }
        Ok(())
    }
}

/// Read-only view of an internal page.
#[derive(Debug)]
pub struct InternalPage<'a> {
    buf: &'a [u8],
}

impl<'a> InternalPage<'a> {
    pub fn open(buf: &'a [u8]) -> Result<Self> {
        validate(buf, KIND_INTERNAL, INTERNAL_HEADER)?;
        Ok(InternalPage { buf })
    }

    /// Number of separator keys; child count is one more.
    pub fn slot_count(&self) -> usize {
        header_usize(self.buf, HDR_SLOT_COUNT)
    }

    pub fn key_at(&self, idx: usize) -> Result<(u8, &'a [u8])> {
        let (off, len) = slot(self.buf, INTERNAL_HEADER, idx)?;
        let (flags, klen) = self.record_header(off, len)?;
        let start = off + INTERNAL_RECORD_HEADER;
        Ok((flags, &self.buf[start..start + klen]))
    }

    /// Child id for child index `idx` in `0..=slot_count()`.
    pub fn child_id(&self, idx: usize) -> Result<PageId> {
        if idx == 0 {
            return Ok(read_id48(self.buf, HDR_FIRST_CHILD));
        }
        let (off, len) = slot(self.buf, INTERNAL_HEADER, idx - 1)?;
        let (_, klen) = self.record_header(off, len)?;
        Ok(read_id48(self.buf, off + INTERNAL_RECORD_HEADER + klen))
    }

    pub fn entries(&self) -> Result<(PageId, Vec<InternalEntry>)> {
        let first = read_id48(self.buf, HDR_FIRST_CHILD);
        let mut out = Vec::with_capacity(self.slot_count());
        for i in 0..self.slot_count() {
            let (flags, key) = self.key_at(i)?;
            out.push(InternalEntry {
                flags,
                key: key.to_vec(),
                child: self.child_id(i + 1)?,
            });
        }
        Ok((first, out))
    }

    pub fn live_bytes(&self) -> Result<usize> {
        let mut total = INTERNAL_HEADER + self.slot_count() * SLOT_SIZE;
        for i in 0..self.slot_count() {
            let (_, len) = slot(self.buf, INTERNAL_HEADER, i)?;
            total += len;
        }
        Ok(total)
    }

    fn record_header(&self, off: usize, len: usize) -> Result<(u8, usize)> {
        if len < INTERNAL_RECORD_HEADER + CHILD_ID_SIZE {
            return Err(corrupt("internal record too small"));
        }
        let flags = self.buf[off];
        let klen = LittleEndian::read_u16(&self.buf[off + 1..off + 3]) as usize;
        if internal_record_len(klen) != len {
            return Err(corrupt(format!("internal record length mismatch at {off}")));
        }
        Ok((flags, klen))
    }
}

/// Mutable view of an internal page.
#[derive(Debug)]
pub struct InternalPageMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> InternalPageMut<'a> {
    pub fn init(buf: &'a mut [u8], first_child: PageId) -> Result<Self> {
        if buf.len() < INTERNAL_HEADER {
            return Err(corrupt("page smaller than internal header"));
        }
        let cap = cap_of(buf);
        buf.fill(0);
        buf[HDR_KIND] = KIND_INTERNAL;
        LittleEndian::write_u16(&mut buf[HDR_SLOT_COUNT..HDR_SLOT_COUNT + 2], 0);
        LittleEndian::write_u16(
            &mut buf[HDR_LOWER..HDR_LOWER + 2],
            INTERNAL_HEADER as u16,
        );
        LittleEndian::write_u16(&mut buf[HDR_UPPER..HDR_UPPER + 2], cap as u16);
        write_id48(buf, HDR_FIRST_CHILD, first_child);
        Ok(InternalPageMut { buf })
    }

    pub fn open(buf: &'a mut [u8]) -> Result<Self> {
        validate(buf, KIND_INTERNAL, INTERNAL_HEADER)?;
        Ok(InternalPageMut { buf })
    }

    pub fn r(&self) -> InternalPage<'_> {
        InternalPage { buf: &*self.buf }
    }

    /// Update a child pointer in place (copy-on-write relocation).
    pub fn set_child_id(&mut self, idx: usize, id: PageId) -> Result<()> {
        if idx == 0 {
            write_id48(self.buf, HDR_FIRST_CHILD, id);
            return Ok(());
        }
        let (off, len) = slot(self.buf, INTERNAL_HEADER, idx - 1)?;
        if len < INTERNAL_RECORD_HEADER + CHILD_ID_SIZE {
            return Err(corrupt("internal record too small"));
        }
        let klen = LittleEndian::read_u16(&self.buf[off + 1..off + 3]) as usize;
        write_id48(self.buf, off + INTERNAL_RECORD_HEADER + klen, id);
        Ok(())
    }

    /// Insert separator `key` at `idx`, whose right child is `child`.
    pub fn insert_at(&mut self, idx: usize, flags: u8, key: &[u8], child: PageId) -> Result<bool> {
        let record_len = internal_record_len(key.len());
        let need = record_len + SLOT_SIZE;
        if self.free_contiguous() < need {
            self.compact()?;
            if self.free_contiguous() < need {
                return Ok(false);
            }
        }

        let upper = header_usize(self.buf, HDR_UPPER);
        let new_upper = upper
            .checked_sub(record_len)
            .ok_or_else(|| corrupt("upper underflow"))?;
        self.buf[new_upper] = flags;
        LittleEndian::write_u16(
            &mut self.buf[new_upper + 1..new_upper + 3],
            key.len() as u16,
        );
        let key_start = new_upper + INTERNAL_RECORD_HEADER;
        self.buf[key_start..key_start + key.len()].copy_from_slice(key);
        write_id48(self.buf, key_start + key.len(), child);

        insert_slot(self.buf, INTERNAL_HEADER, idx, new_upper, record_len)?;
        LittleEndian::write_u16(&mut self.buf[HDR_UPPER..HDR_UPPER + 2], new_upper as u16);
        Ok(true)
    }

    /// Remove separator `idx` together with its right child pointer.
    pub fn remove_at(&mut self, idx: usize) -> Result<()> {
        remove_slot(self.buf, INTERNAL_HEADER, idx)
    }

    pub fn free_contiguous(&self) -> usize {
        let lower = header_usize(self.buf, HDR_LOWER);
        let upper = header_usize(self.buf, HDR_UPPER);
        upper.saturating_sub(lower)
    }

    pub fn compact(&mut self) -> Result<()> {
        compact(self.buf, INTERNAL_HEADER)
    }

    pub fn build(buf: &'a mut [u8], first_child: PageId, entries: &[InternalEntry]) -> Result<()> {
        let mut page = InternalPageMut::init(buf, first_child)?;
        for (i, e) in entries.iter().enumerate() {
            if !page.insert_at(i, e.flags, &e.key, e.child)? {
                return Err(corrupt("internal build overflow"));
            }
        }
        Ok(())
    }
}

fn insert_slot(buf: &mut [u8], header: usize, idx: usize, off: usize, len: usize) -> Result<()> {
    let count = header_usize(buf, HDR_SLOT_COUNT);
    if idx > count {
        return Err(corrupt("slot insertion index out of bounds"));
    }
    if idx < count {
        let src_start = header + idx * SLOT_SIZE;
        let src_end = header + count * SLOT_SIZE;
        buf.copy_within(src_start..src_end, src_start + SLOT_SIZE);
    }
    let base = header + idx * SLOT_SIZE;
    LittleEndian::write_u16(&mut buf[base..base + 2], off as u16);
    LittleEndian::write_u16(&mut buf[base + 2..base + 4], len as u16);
    LittleEndian::write_u16(
        &mut buf[HDR_SLOT_COUNT..HDR_SLOT_COUNT + 2],
        (count + 1) as u16,
    );
    LittleEndian::write_u16(
        &mut buf[HDR_LOWER..HDR_LOWER + 2],
        (header + (count + 1) * SLOT_SIZE) as u16,
    );
    Ok(())
}

fn remove_slot(buf: &mut [u8], header: usize, idx: usize) -> Result<()> {
    let count = header_usize(buf, HDR_SLOT_COUNT);
    if idx >= count {
        return Err(corrupt("slot removal index out of bounds"));
    }
    if idx + 1 < count {
        let src_start = header + (idx + 1) * SLOT_SIZE;
        let src_end = header + count * SLOT_SIZE;
        buf.copy_within(src_start..src_end, header + idx * SLOT_SIZE);
    }
    LittleEndian::write_u16(
        &mut buf[HDR_SLOT_COUNT..HDR_SLOT_COUNT + 2],
        (count - 1) as u16,
    );
    LittleEndian::write_u16(
        &mut buf[HDR_LOWER..HDR_LOWER + 2],
        (header + (count - 1) * SLOT_SIZE) as u16,
    );
    Ok(())
}

fn compact(buf: &mut [u8], header: usize) -> Result<()> {
    let count = header_usize(buf, HDR_SLOT_COUNT);
    let cap = cap_of(buf);
    let mut scratch = buf.to_vec();
    let mut upper = cap;
    // Pack back-to-front so slot order survives intact.
    for i in (0..count).rev() {
        let (off, len) = slot(buf, header, i)?;
        upper = upper
            .checked_sub(len)
            .ok_or_else(|| corrupt("compact upper underflow"))?;
        scratch[upper..upper + len].copy_from_slice(&buf[off..off + len]);
        let base = header + i * SLOT_SIZE;
        LittleEndian::write_u16(&mut scratch[base..base + 2], upper as u16);
        LittleEndian::write_u16(&mut scratch[base + 2..base + 4], len as u16);
    }
    LittleEndian::write_u16(&mut scratch[HDR_UPPER..HDR_UPPER + 2], upper as u16);
    buf.copy_from_slice(&scratch);
    Ok(())
}

/// Read the kind byte of a tree page.
pub fn page_kind(buf: &[u8]) -> Result<u8> {
    match buf.first() {
        Some(&k) if k == KIND_LEAF || k == KIND_INTERNAL => Ok(k),
        Some(&other) => Err(corrupt(format!("unknown tree page kind {other}"))),
        None => Err(StorageError("empty page buffer".into()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_insert_read_remove() {
        let mut buf = vec![0u8; 256];
        let mut page = LeafPageMut::init(&mut buf).unwrap();
        assert!(page.insert_at(0, 0, b"b", b"two").unwrap());
        assert!(page.insert_at(0, 0, b"a", b"one").unwrap());
        assert!(page.insert_at(2, 0, b"c", b"three").unwrap());

        let r = page.r();
        assert_eq!(r.slot_count(), 3);
        assert_eq!(r.key_at(0).unwrap().1, b"a");
        assert_eq!(r.value_at(1).unwrap().1, b"two");
        assert_eq!(r.key_at(2).unwrap().1, b"c");

        page.remove_at(1).unwrap();
        let r = page.r();
        assert_eq!(r.slot_count(), 2);
        assert_eq!(r.key_at(1).unwrap().1, b"c");
    }

    #[test]
    fn leaf_compacts_to_reuse_garbage() {
        let mut buf = vec![0u8; 128];
        let mut page = LeafPageMut::init(&mut buf).unwrap();
        assert!(page.insert_at(0, 0, b"a", &[b'x'; 30]).unwrap());
        assert!(page.insert_at(1, 0, b"b", &[b'y'; 30]).unwrap());
        assert!(page.insert_at(2, 0, b"c", &[b'z'; 30]).unwrap());
        page.remove_at(1).unwrap();
        // Fits only after compaction reclaims b's record.
        assert!(page.insert_at(2, 0, b"d", &[b'w'; 30]).unwrap());
        assert_eq!(page.r().key_at(2).unwrap().1, b"d");
    }

    #[test]
    fn leaf_full_is_reported_not_fatal() {
        let mut buf = vec![0u8; 64];
        let mut page = LeafPageMut::init(&mut buf).unwrap();
        assert!(page.insert_at(0, 0, b"a", &[b'x'; 30]).unwrap());
        assert!(!page.insert_at(1, 0, b"b", &[b'y'; 30]).unwrap());
    }

    #[test]
    fn leaf_flags_roundtrip() {
        let mut buf = vec![0u8; 128];
        let mut page = LeafPageMut::init(&mut buf).unwrap();
        assert!(page
            .insert_at(0, VALUE_FRAGMENTED, b"k", b"directory")
            .unwrap());
        assert_eq!(page.r().key_at(0).unwrap().0, VALUE_FRAGMENTED);
        page.set_flags_at(0, VALUE_FRAGMENTED | GHOST).unwrap();
        assert_eq!(page.r().flags_at(0).unwrap(), VALUE_FRAGMENTED | GHOST);
    }

    #[test]
    fn internal_children_and_separators() {
        let mut buf = vec![0u8; 256];
        let mut page = InternalPageMut::init(&mut buf, 10).unwrap();
        assert!(page.insert_at(0, 0, b"m", 20).unwrap());
        assert!(page.insert_at(1, 0, b"t", 30).unwrap());

        let r = page.r();
        assert_eq!(r.slot_count(), 2);
        assert_eq!(r.child_id(0).unwrap(), 10);
        assert_eq!(r.child_id(1).unwrap(), 20);
        assert_eq!(r.child_id(2).unwrap(), 30);
        assert_eq!(r.key_at(0).unwrap().1, b"m");

        page.set_child_id(1, 99).unwrap();
        assert_eq!(page.r().child_id(1).unwrap(), 99);

        // Dropping separator 0 merges away child 1.
        page.remove_at(0).unwrap();
        let r = page.r();
        assert_eq!(r.slot_count(), 1);
        assert_eq!(r.child_id(0).unwrap(), 10);
        assert_eq!(r.child_id(1).unwrap(), 30);
    }

    #[test]
    fn rebuild_from_entries() {
        let mut buf = vec![0u8; 256];
        let entries = vec![
            LeafEntry {
                flags: 0,
                key: b"a".to_vec(),
                value: b"1".to_vec(),
            },
            LeafEntry {
                flags: GHOST,
                key: b"b".to_vec(),
                value: Vec::new(),
            },
        ];
        LeafPageMut::build(&mut buf, &entries).unwrap();
        let r = LeafPage::open(&buf).unwrap();
        assert_eq!(r.entries().unwrap(), entries);
    }
}

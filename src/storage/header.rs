//! Committed header pages.
//!
//! The first two pages of the data file are alternating headers. A commit
//! writes the inactive one and syncs; recovery picks the header with the
//! higher checkpoint number whose checksum validates.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::core::errors::{Result, StorageError};
use crate::storage::PageId;

const MAGIC: [u8; 8] = *b"TUPLDB01";

/// On-disk encoding version.
pub const ENCODING_VERSION: u32 = 0x0133_2712;

/// Fixed fields; the trailing 4 bytes of the page hold the CRC.
const FIXED_SIZE: usize = 8 + 4 + 4 + 8 * 9 + 2;

/// Maximum extra payload carried by a header.
pub const MAX_EXTRA: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitHeader {
    pub page_size: u32,
    /// Monotonic commit counter; selects the live header on open.
    pub checkpoint_number: u64,
    pub registry_root_id: PageId,
    /// Top page of the master undo log, or 0 when no transactions were in
    /// flight at the checkpoint.
    pub master_undo_id: PageId,
    pub last_txn_id: u64,
    pub redo_num: u64,
    pub redo_position: u64,
    pub redo_txn_id: u64,
    pub free_list_head: PageId,
    pub free_list_count: u64,
    pub total_page_count: u64,
    pub extra: Vec<u8>,
}

impl CommitHeader {
    pub fn new(page_size: u32) -> Self {
        CommitHeader {
            page_size,
            checkpoint_number: 0,
            registry_root_id: 0,
            master_undo_id: 0,
            last_txn_id: 0,
            redo_num: 0,
            redo_position: 0,
            redo_txn_id: 0,
            free_list_head: 0,
            free_list_count: 0,
            total_page_count: crate::storage::FIRST_DATA_PAGE,
            extra: Vec::new(),
        }
    }

    /// Serialize into a full page buffer. The CRC covers everything before
    /// the final 4 bytes.
    pub fn pack(&self, page: &mut [u8]) -> Result<()> {
        if self.extra.len() > MAX_EXTRA {
            return Err(StorageError("header extra payload too large".into()).into());
        }
        if page.len() < FIXED_SIZE + MAX_EXTRA + 4 {
            return Err(StorageError("page too small for header".into()).into());
        }
        page.fill(0);
        let mut w = std::io::Cursor::new(&mut *page);
        std::io::Write::write_all(&mut w, &MAGIC)?;
        w.write_u32::<LittleEndian>(ENCODING_VERSION)?;
        w.write_u32::<LittleEndian>(self.page_size)?;
        w.write_u64::<LittleEndian>(self.checkpoint_number)?;
        w.write_u64::<LittleEndian>(self.registry_root_id)?;
        w.write_u64::<LittleEndian>(self.master_undo_id)?;
        w.write_u64::<LittleEndian>(self.last_txn_id)?;
        w.write_u64::<LittleEndian>(self.redo_num)?;
        w.write_u64::<LittleEndian>(self.redo_position)?;
        w.write_u64::<LittleEndian>(self.redo_txn_id)?;
        w.write_u64::<LittleEndian>(self.free_list_head)?;
        w.write_u64::<LittleEndian>(self.free_list_count)?;
        w.write_u64::<LittleEndian>(self.total_page_count)?;
        w.write_u16::<LittleEndian>(self.extra.len() as u16)?;
        std::io::Write::write_all(&mut w, &self.extra)?;

        let crc_off = page.len() - 4;
        let crc = crc32(&page[..crc_off]);
        page[crc_off..].copy_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Decode and validate one header page. Returns an error for a bad
    /// magic, version, or checksum.
    pub fn unpack(page: &[u8]) -> Result<Self> {
        if page.len() < FIXED_SIZE + 4 {
            return Err(StorageError("header page too small".into()).into());
        }
        let crc_off = page.len() - 4;
        let stored = u32::from_le_bytes(page[crc_off..].try_into().expect("4 bytes"));
        if crc32(&page[..crc_off]) != stored {
            return Err(StorageError("header checksum mismatch".into()).into());
        }

        let mut r = std::io::Cursor::new(page);
        let mut magic = [0u8; 8];
        std::io::Read::read_exact(&mut r, &mut magic)?;
        if magic != MAGIC {
            return Err(StorageError("invalid header magic".into()).into());
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != ENCODING_VERSION {
            return Err(
                StorageError(format!("unsupported encoding version: {version:#x}")).into(),
            );
        }
        let page_size = r.read_u32::<LittleEndian>()?;
        let checkpoint_number = r.read_u64::<LittleEndian>()?;
        let registry_root_id = r.read_u64::<LittleEndian>()?;
        let master_undo_id = r.read_u64::<LittleEndian>()?;
        let last_txn_id = r.read_u64::<LittleEndian>()?;
        let redo_num = r.read_u64::<LittleEndian>()?;
        let redo_position = r.read_u64::<LittleEndian>()?;
        let redo_txn_id = r.read_u64::<LittleEndian>()?;
        let free_list_head = r.read_u64::<LittleEndian>()?;
        let free_list_count = r.read_u64::<LittleEndian>()?;
        let total_page_count = r.read_u64::<LittleEndian>()?;
        let extra_len = r.read_u16::<LittleEndian>()? as usize;
        if extra_len > MAX_EXTRA {
            return Err(StorageError("header extra length corrupt".into()).into());
        }
        let mut extra = vec![0u8; extra_len];
        std::io::Read::read_exact(&mut r, &mut extra)?;

        Ok(CommitHeader {
            page_size,
            checkpoint_number,
            registry_root_id,
            master_undo_id,
            last_txn_id,
            redo_num,
            redo_position,
            redo_txn_id,
            free_list_head,
            free_list_count,
            total_page_count,
            extra,
        })
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let mut h = CommitHeader::new(4096);
        h.checkpoint_number = 7;
        h.registry_root_id = 42;
        h.last_txn_id = 1000;
        h.extra = vec![1, 2, 3];
        let mut page = vec![0u8; 4096];
        h.pack(&mut page).unwrap();
        let back = CommitHeader::unpack(&page).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn corruption_is_detected() {
        let h = CommitHeader::new(512);
        let mut page = vec![0u8; 512];
        h.pack(&mut page).unwrap();
        page[40] ^= 0xff;
        assert!(CommitHeader::unpack(&page).is_err());
    }
}

//! Append-only redo log: one record per logical operation.
//!
//! Files are named `<base>.redo.<N>` with a monotonically increasing log
//! number; the checkpoint records the number and byte offset it has made
//! durable, and rotation opens file `N + 1` once the current file crosses
//! a size threshold.
//!
//! File header: magic, version, log number, CRC. Each record is
//! `opcode, payload, crc32(opcode + payload)`; replay stops at the first
//! record whose checksum fails or which is cut short, truncating the tail.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use log::{info, warn};

use crate::core::errors::{Result, StorageError};
use crate::core::varint;
use crate::txn::TxnId;

const REDO_MAGIC: &[u8; 8] = b"TUPLREDO";
const REDO_VERSION: u32 = 1;
pub const REDO_HEADER_SIZE: u64 = 8 + 4 + 8 + 4;

/// Flush the write buffer once it grows past this.
const BUFFER_FLUSH_SIZE: usize = 64 * 1024;

const OP_TIMESTAMP: u8 = 1;
const OP_SHUTDOWN: u8 = 2;
const OP_CLOSE: u8 = 3;
const OP_END_FILE: u8 = 4;
const OP_STORE: u8 = 16;
const OP_DELETE: u8 = 17;
const OP_RENAME_INDEX: u8 = 19;
const OP_DELETE_INDEX: u8 = 20;
const OP_TXN_ENTER: u8 = 32;
const OP_TXN_COMMIT: u8 = 33;
const OP_TXN_COMMIT_FINAL: u8 = 34;
const OP_TXN_ROLLBACK: u8 = 35;
const OP_TXN_ROLLBACK_FINAL: u8 = 36;
const OP_TXN_STORE: u8 = 48;
const OP_TXN_DELETE: u8 = 49;
const OP_TXN_STORE_COMMIT_FINAL: u8 = 50;
const OP_CUSTOM: u8 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoRecord {
    Timestamp { ts: u64 },
    Shutdown,
    Close,
    EndFile,
    Store { index: u64, key: Vec<u8>, value: Vec<u8> },
    Delete { index: u64, key: Vec<u8> },
    RenameIndex { index: u64, new_name: Vec<u8> },
    DeleteIndex { index: u64 },
    TxnEnter { txn: TxnId },
    TxnCommit { txn: TxnId },
    TxnCommitFinal { txn: TxnId },
    TxnRollback { txn: TxnId },
    TxnRollbackFinal { txn: TxnId },
    TxnStore { txn: TxnId, index: u64, key: Vec<u8>, value: Vec<u8> },
    TxnDelete { txn: TxnId, index: u64, key: Vec<u8> },
    TxnStoreCommitFinal { txn: TxnId, index: u64, key: Vec<u8>, value: Vec<u8> },
    Custom { txn: TxnId, payload: Vec<u8> },
}

impl RedoRecord {
    fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        match self {
            RedoRecord::Timestamp { ts } => {
                out.push(OP_TIMESTAMP);
                varint::write_u64(out, *ts);
            }
            RedoRecord::Shutdown => out.push(OP_SHUTDOWN),
            RedoRecord::Close => out.push(OP_CLOSE),
            RedoRecord::EndFile => out.push(OP_END_FILE),
            RedoRecord::Store { index, key, value } => {
                out.push(OP_STORE);
                varint::write_u64(out, *index);
                write_bytes(out, key);
                write_bytes(out, value);
            }
            RedoRecord::Delete { index, key } => {
                out.push(OP_DELETE);
                varint::write_u64(out, *index);
                write_bytes(out, key);
            }
            RedoRecord::RenameIndex { index, new_name } => {
                out.push(OP_RENAME_INDEX);
                varint::write_u64(out, *index);
                write_bytes(out, new_name);
            }
            RedoRecord::DeleteIndex { index } => {
                out.push(OP_DELETE_INDEX);
                varint::write_u64(out, *index);
            }
            RedoRecord::TxnEnter { txn } => {
                out.push(OP_TXN_ENTER);
                varint::write_u64(out, *txn);
            }
            RedoRecord::TxnCommit { txn } => {
                out.push(OP_TXN_COMMIT);
                varint::write_u64(out, *txn);
            }
            RedoRecord::TxnCommitFinal { txn } => {
                out.push(OP_TXN_COMMIT_FINAL);
                varint::write_u64(out, *txn);
            }
            RedoRecord::TxnRollback { txn } => {
                out.push(OP_TXN_ROLLBACK);
                varint::write_u64(out, *txn);
            }
            RedoRecord::TxnRollbackFinal { txn } => {
                out.push(OP_TXN_ROLLBACK_FINAL);
                varint::write_u64(out, *txn);
            }
            RedoRecord::TxnStore { txn, index, key, value } => {
                out.push(OP_TXN_STORE);
                varint::write_u64(out, *txn);
                varint::write_u64(out, *index);
                write_bytes(out, key);
                write_bytes(out, value);
            }
            RedoRecord::TxnDelete { txn, index, key } => {
                out.push(OP_TXN_DELETE);
                varint::write_u64(out, *txn);
                varint::write_u64(out, *index);
                write_bytes(out, key);
            }
            RedoRecord::TxnStoreCommitFinal { txn, index, key, value } => {
                out.push(OP_TXN_STORE_COMMIT_FINAL);
                varint::write_u64(out, *txn);
                varint::write_u64(out, *index);
                write_bytes(out, key);
                write_bytes(out, value);
            }
            RedoRecord::Custom { txn, payload } => {
                out.push(OP_CUSTOM);
                varint::write_u64(out, *txn);
                write_bytes(out, payload);
            }
        }
        let crc = crc32(&out[start..]);
        out.extend_from_slice(&crc.to_le_bytes());
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Result<RedoRecord> {
        let start = *pos;
        let op = *buf
            .get(*pos)
            .ok_or_else(|| StorageError("redo record truncated".into()))?;
        *pos += 1;
        let rec = match op {
            OP_TIMESTAMP => RedoRecord::Timestamp {
                ts: varint::read_u64(buf, pos)?,
            },
            OP_SHUTDOWN => RedoRecord::Shutdown,
            OP_CLOSE => RedoRecord::Close,
            OP_END_FILE => RedoRecord::EndFile,
            OP_STORE => RedoRecord::Store {
                index: varint::read_u64(buf, pos)?,
                key: read_bytes(buf, pos)?,
                value: read_bytes(buf, pos)?,
            },
            OP_DELETE => RedoRecord::Delete {
                index: varint::read_u64(buf, pos)?,
                key: read_bytes(buf, pos)?,
            },
            OP_RENAME_INDEX => RedoRecord::RenameIndex {
                index: varint::read_u64(buf, pos)?,
                new_name: read_bytes(buf, pos)?,
            },
            OP_DELETE_INDEX => RedoRecord::DeleteIndex {
                index: varint::read_u64(buf, pos)?,
            },
            OP_TXN_ENTER => RedoRecord::TxnEnter {
                txn: varint::read_u64(buf, pos)?,
            },
            OP_TXN_COMMIT => RedoRecord::TxnCommit {
                txn: varint::read_u64(buf, pos)?,
            },
            OP_TXN_COMMIT_FINAL => RedoRecord::TxnCommitFinal {
                txn: varint::read_u64(buf, pos)?,
            },
            OP_TXN_ROLLBACK => RedoRecord::TxnRollback {
                txn: varint::read_u64(buf, pos)?,
            },
            OP_TXN_ROLLBACK_FINAL => RedoRecord::TxnRollbackFinal {
                txn: varint::read_u64(buf, pos)?,
            },
            OP_TXN_STORE => RedoRecord::TxnStore {
                txn: varint::read_u64(buf, pos)?,
                index: varint::read_u64(buf, pos)?,
                key: read_bytes(buf, pos)?,
                value: read_bytes(buf, pos)?,
            },
            OP_TXN_DELETE => RedoRecord::TxnDelete {
                txn: varint::read_u64(buf, pos)?,
                index: varint::read_u64(buf, pos)?,
                key: read_bytes(buf, pos)?,
            },
            OP_TXN_STORE_COMMIT_FINAL => RedoRecord::TxnStoreCommitFinal {
                txn: varint::read_u64(buf, pos)?,
                index: varint::read_u64(buf, pos)?,
                key: read_bytes(buf, pos)?,
                value: read_bytes(buf, pos)?,
            },
            OP_CUSTOM => RedoRecord::Custom {
                txn: varint::read_u64(buf, pos)?,
                payload: read_bytes(buf, pos)?,
            },
            other => {
                return Err(StorageError(format!("unknown redo opcode {other}")).into());
            }
        };
        if *pos + 4 > buf.len() {
            return Err(StorageError("redo record checksum missing".into()).into());
        }
        let stored = LittleEndian::read_u32(&buf[*pos..*pos + 4]);
        if crc32(&buf[start..*pos]) != stored {
            return Err(StorageError("redo record checksum mismatch".into()).into());
        }
        *pos += 4;
        Ok(rec)
    }
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    varint::write_u64(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

fn read_bytes(buf: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let len = varint::read_u64(buf, pos)? as usize;
    if *pos + len > buf.len() {
        return Err(StorageError("redo record truncated".into()).into());
    }
    let out = buf[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(out)
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

pub fn redo_file_path(base: &Path, num: u64) -> PathBuf {
    let mut name = base
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".redo.{num}"));
    base.with_file_name(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedoPosition {
    pub num: u64,
    pub offset: u64,
}

/// Sink for redo records: a real file writer, or nothing in `NoRedo` mode.
pub trait RedoWriter: Send {
    fn write(&mut self, rec: &RedoRecord) -> Result<()>;
    /// Push buffered bytes to the OS; with `durable` also fsync.
    fn flush(&mut self, durable: bool) -> Result<()>;
    fn position(&mut self) -> Result<RedoPosition>;
    /// Close the current file with an end marker and start `num + 1`.
    fn rotate(&mut self) -> Result<u64>;
    fn size(&self) -> u64;
    fn is_enabled(&self) -> bool;
}

pub struct FileRedoLog {
    base: PathBuf,
    num: u64,
    file: File,
    buffer: Vec<u8>,
    flushed: u64,
}

impl std::fmt::Debug for FileRedoLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRedoLog")
            .field("num", &self.num)
            .field("size", &self.size())
            .finish()
    }
}

impl FileRedoLog {
    /// Create redo file `num`, replacing any stale leftover of that
    /// number.
    pub fn create(base: &Path, num: u64) -> Result<FileRedoLog> {
        let path = redo_file_path(base, num);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut header = Vec::with_capacity(REDO_HEADER_SIZE as usize);
        header.extend_from_slice(REDO_MAGIC);
        header.extend_from_slice(&REDO_VERSION.to_le_bytes());
        header.extend_from_slice(&num.to_le_bytes());
        let crc = crc32(&header);
        header.extend_from_slice(&crc.to_le_bytes());
        file.write_all(&header)?;
        file.sync_all()?;
        info!("redo log {num} created at {path:?}");
        Ok(FileRedoLog {
            base: base.to_path_buf(),
            num,
            file,
            buffer: Vec::new(),
            flushed: 0,
        })
    }
}

impl RedoWriter for FileRedoLog {
    fn write(&mut self, rec: &RedoRecord) -> Result<()> {
        rec.encode(&mut self.buffer);
        if self.buffer.len() >= BUFFER_FLUSH_SIZE {
            self.flush(false)?;
        }
        Ok(())
    }

    fn flush(&mut self, durable: bool) -> Result<()> {
        if !self.buffer.is_empty() {
            self.file.write_all(&self.buffer)?;
            self.flushed += self.buffer.len() as u64;
            self.buffer.clear();
        }
        if durable {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn position(&mut self) -> Result<RedoPosition> {
        self.flush(false)?;
        Ok(RedoPosition {
            num: self.num,
            offset: REDO_HEADER_SIZE + self.flushed,
        })
    }

    fn rotate(&mut self) -> Result<u64> {
        self.write(&RedoRecord::EndFile)?;
        self.flush(true)?;
        let next = FileRedoLog::create(&self.base, self.num + 1)?;
        *self = next;
        Ok(self.num)
    }

    fn size(&self) -> u64 {
        REDO_HEADER_SIZE + self.flushed + self.buffer.len() as u64
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

/// `NoRedo` durability: every record is dropped.
#[derive(Debug, Default)]
pub struct NoRedoLog;

impl RedoWriter for NoRedoLog {
    fn write(&mut self, _rec: &RedoRecord) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self, _durable: bool) -> Result<()> {
        Ok(())
    }

    fn position(&mut self) -> Result<RedoPosition> {
        Ok(RedoPosition { num: 0, offset: 0 })
    }

    fn rotate(&mut self) -> Result<u64> {
        Ok(0)
    }

    fn size(&self) -> u64 {
        0
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Replay-side reader. Loads one file at a time and yields records until
/// the stream ends or a torn/corrupt suffix is found, which is truncated.
pub struct RedoReader {
    base: PathBuf,
    num: u64,
    buf: Vec<u8>,
    pos: usize,
    path: PathBuf,
}

impl RedoReader {
    /// Open the redo stream at `position`. Returns `None` when the first
    /// file does not exist.
    pub fn open(base: &Path, position: RedoPosition) -> Result<Option<RedoReader>> {
        let path = redo_file_path(base, position.num);
        if !path.exists() {
            return Ok(None);
        }
        let buf = Self::load(&path, position.num)?;
        let pos = (position.offset as usize).min(buf.len());
        Ok(Some(RedoReader {
            base: base.to_path_buf(),
            num: position.num,
            buf,
            pos,
            path,
        }))
    }

    fn load(path: &Path, expect_num: u64) -> Result<Vec<u8>> {
        let mut file = OpenOptions::new().read(true).open(path)?;
        let mut buf = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut buf)?;
        if buf.len() < REDO_HEADER_SIZE as usize {
            return Err(StorageError(format!("redo file {path:?} truncated header")).into());
        }
        if &buf[..8] != REDO_MAGIC {
            return Err(StorageError(format!("redo file {path:?} bad magic")).into());
        }
        let num = LittleEndian::read_u64(&buf[12..20]);
        if num != expect_num {
            return Err(StorageError(format!(
                "redo file {path:?} claims number {num}, expected {expect_num}"
            ))
            .into());
        }
        Ok(buf)
    }

    /// Next record, hopping across file boundaries. `None` at end of
    /// stream. A corrupt tail is truncated in place and ends the stream.
    pub fn next(&mut self) -> Result<Option<RedoRecord>> {
        loop {
            if self.pos >= self.buf.len() {
                return Ok(None);
            }
            let mut pos = self.pos;
            match RedoRecord::decode(&self.buf, &mut pos) {
                Ok(RedoRecord::EndFile) => {
                    let next_path = redo_file_path(&self.base, self.num + 1);
                    if !next_path.exists() {
                        return Ok(None);
                    }
                    self.num += 1;
                    self.buf = Self::load(&next_path, self.num)?;
                    self.pos = REDO_HEADER_SIZE as usize;
                    self.path = next_path;
                }
                Ok(rec) => {
                    self.pos = pos;
                    return Ok(Some(rec));
                }
                Err(e) => {
                    warn!(
                        "redo log {}: truncating corrupt tail at offset {} ({e})",
                        self.num, self.pos
                    );
                    let file = OpenOptions::new().write(true).open(&self.path)?;
                    file.set_len(self.pos as u64)?;
                    file.sync_all()?;
                    return Ok(None);
                }
            }
        }
    }

    /// Position after the last successfully decoded record.
    pub fn position(&self) -> RedoPosition {
        RedoPosition {
            num: self.num,
            offset: self.pos as u64,
        }
    }
}

/// Delete redo files older than `keep`.
pub fn delete_old_redo_files(base: &Path, keep: u64) -> Result<()> {
    let mut num = keep;
    while num > 0 {
        num -= 1;
        let path = redo_file_path(base, num);
        if !path.exists() {
            break;
        }
        std::fs::remove_file(&path)?;
        info!("deleted obsolete redo log {num}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn record_roundtrip() {
        let records = vec![
            RedoRecord::Store {
                index: 16,
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            },
            RedoRecord::TxnEnter { txn: 7 },
            RedoRecord::TxnStore {
                txn: 7,
                index: 16,
                key: b"k2".to_vec(),
                value: vec![0u8; 300],
            },
            RedoRecord::TxnCommitFinal { txn: 7 },
            RedoRecord::DeleteIndex { index: 17 },
        ];
        let mut buf = Vec::new();
        for r in &records {
            r.encode(&mut buf);
        }
        let mut pos = 0;
        for r in &records {
            assert_eq!(&RedoRecord::decode(&buf, &mut pos).unwrap(), r);
        }
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn writer_reader_roundtrip_with_rotation() {
        let tmp = tempdir().unwrap();
        let base = tmp.path().join("db");

        let mut w = FileRedoLog::create(&base, 1).unwrap();
        w.write(&RedoRecord::Store {
            index: 16,
            key: b"a".to_vec(),
            value: b"1".to_vec(),
        })
        .unwrap();
        w.rotate().unwrap();
        w.write(&RedoRecord::Store {
            index: 16,
            key: b"b".to_vec(),
            value: b"2".to_vec(),
        })
        .unwrap();
        w.flush(true).unwrap();

        let mut r = RedoReader::open(
            &base,
            RedoPosition {
                num: 1,
                offset: REDO_HEADER_SIZE,
            },
        )
        .unwrap()
        .unwrap();
        let first = r.next().unwrap().unwrap();
        assert!(matches!(first, RedoRecord::Store { ref key, .. } if key == b"a"));
        let second = r.next().unwrap().unwrap();
        assert!(matches!(second, RedoRecord::Store { ref key, .. } if key == b"b"));
        assert!(r.next().unwrap().is_none());
    }

    #[test]
    fn corrupt_tail_is_truncated() {
        let tmp = tempdir().unwrap();
        let base = tmp.path().join("db");

        let mut w = FileRedoLog::create(&base, 3).unwrap();
        w.write(&RedoRecord::Store {
            index: 16,
            key: b"good".to_vec(),
            value: b"1".to_vec(),
        })
        .unwrap();
        w.flush(true).unwrap();
        let good_len = REDO_HEADER_SIZE + w.flushed;

        // Append garbage simulating a torn write.
        let path = redo_file_path(&base, 3);
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[OP_STORE, 0xff, 0x03]).unwrap();
        }

        let mut r = RedoReader::open(
            &base,
            RedoPosition {
                num: 3,
                offset: REDO_HEADER_SIZE,
            },
        )
        .unwrap()
        .unwrap();
        assert!(r.next().unwrap().is_some());
        assert!(r.next().unwrap().is_none());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
    }
}

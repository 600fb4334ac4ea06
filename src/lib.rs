//! An embedded, transactional, ordered key/value storage engine.
//!
//! Variable-length byte keys and values live in on-disk B-trees over a
//! paged file. Durability comes from crash-consistent double-header
//! checkpoints plus an append-only redo log; transactions carry
//! per-transaction undo logs for rollback and recovery.
//!
//! ```no_run
//! use tupl::{Config, Database};
//!
//! let db = Database::open(Config::new().base_path("/tmp/example"))?;
//! let people = db.open_index(b"people")?;
//! people.store(b"alice", b"engineer")?;
//! assert_eq!(people.load(b"alice")?, Some(b"engineer".to_vec()));
//!
//! let mut txn = db.begin()?;
//! txn.store(&people, b"bob", b"analyst")?;
//! txn.commit()?;
//! # Ok::<(), tupl::TuplError>(())
//! ```

mod checkpoint;
mod config;
mod core;
mod db;
mod storage;
mod sync;
mod tree;
mod txn;

pub use crate::config::{Config, CustomHandler, DurabilityMode};
pub use crate::core::errors::{Result, StorageError, TuplError};
pub use crate::db::{Database, DbStats, Index};
pub use crate::storage::page_store::StoreStats;
pub use crate::storage::PageId;
pub use crate::tree::Cursor;
pub use crate::txn::transaction::{Transaction, TxnState};
pub use crate::txn::TxnId;

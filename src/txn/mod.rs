pub mod recovery;
pub mod redo_log;
pub mod transaction;
pub mod undo_log;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use undo_log::UndoLog;

pub type TxnId = u64;

/// Registry of in-flight transactions' undo logs, sharded by transaction
/// id so registration does not contend across threads. The checkpoint
/// walks every shard to compose the master undo log.
pub(crate) struct TxnContexts {
    shards: Box<[Mutex<HashMap<TxnId, Arc<Mutex<UndoLog>>>>]>,
}

impl std::fmt::Debug for TxnContexts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnContexts")
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl TxnContexts {
    pub fn new() -> TxnContexts {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let count = cpus.max(2).next_power_of_two();
        let shards = (0..count)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        TxnContexts { shards }
    }

    fn shard(&self, txn: TxnId) -> &Mutex<HashMap<TxnId, Arc<Mutex<UndoLog>>>> {
        let h = txn.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        &self.shards[(h >> 32) as usize & (self.shards.len() - 1)]
    }

    pub fn register(&self, txn: TxnId, undo: Arc<Mutex<UndoLog>>) {
        self.shard(txn).lock().insert(txn, undo);
    }

    pub fn unregister(&self, txn: TxnId) {
        self.shard(txn).lock().remove(&txn);
    }

    /// Snapshot of every registered undo log.
    pub fn collect(&self) -> Vec<Arc<Mutex<UndoLog>>> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            out.extend(shard.lock().values().cloned());
        }
        out
    }

    pub fn active_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

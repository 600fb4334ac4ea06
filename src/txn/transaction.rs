//! Transactions: an id, an undo log, and a stack of nested scopes.
//!
//! Mutations run under the shared commit lock: the tree change and the
//! matching undo entry land inside one shared-lock section, so a
//! checkpoint serializing undo logs always observes the two together.
//!
//! Commit writes the redo commit record (durability mode decides how hard
//! it is pushed to disk), then finalizes by draining the undo log:
//! ghosted entries are physically removed and replaced fragmented values
//! reclaimed. Rollback drains the same log applying inverses instead.

use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::core::errors::{Result, TuplError};
use crate::core::varint;
use crate::db::{DbCore, Index};
use crate::tree::page::VALUE_FRAGMENTED;
use crate::tree::Tree;
use crate::txn::redo_log::RedoRecord;
use crate::txn::undo_log::{
    parse_key_value, payload_key, payload_key_value, UndoLog, OP_ACTIVE_INDEX, OP_COMMIT_TRUNCATE,
    OP_CUSTOM, OP_SCOPE_COMMIT, OP_SCOPE_ENTER, OP_UNDELETE, OP_UNDELETE_FRAGMENTED,
    OP_UNDELETE_LK, OP_UNINSERT, OP_UNINSERT_LK, OP_UNUPDATE, OP_UNUPDATE_LK,
};
use crate::txn::TxnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    RolledBack,
}

pub struct Transaction {
    core: Arc<DbCore>,
    id: TxnId,
    undo: Arc<Mutex<UndoLog>>,
    scope_depth: usize,
    state: TxnState,
    /// Whether the txn-enter redo record has been written.
    entered: bool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("scope_depth", &self.scope_depth)
            .finish()
    }
}

impl Transaction {
    pub(crate) fn begin(core: Arc<DbCore>, id: TxnId) -> Transaction {
        let undo = Arc::new(Mutex::new(UndoLog::new(id)));
        core.contexts.register(id, undo.clone());
        Transaction {
            core,
            id,
            undo,
            scope_depth: 0,
            state: TxnState::Active,
            entered: false,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    fn check_active(&self) -> Result<()> {
        self.core.check_closed()?;
        match self.state {
            TxnState::Active => Ok(()),
            _ => Err(TuplError::Storage(crate::core::errors::StorageError(
                format!("transaction {} is no longer active", self.id),
            ))),
        }
    }

    fn ensure_enter(&mut self) -> Result<()> {
        if !self.entered {
            self.core.redo_write(&RedoRecord::TxnEnter { txn: self.id })?;
            self.entered = true;
        }
        Ok(())
    }

    /// Read through the transaction. Uncommitted changes of this
    /// transaction are visible (they live in the tree), ghosts are not.
    pub fn load(&self, index: &Index, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.core.check_closed()?;
        index.tree().load(key)
    }

    pub fn store(&mut self, index: &Index, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_active()?;
        let r = self.store_inner(index.tree(), key, value);
        self.core.fail_guard(r)
    }

    fn store_inner(&mut self, tree: &Arc<Tree>, key: &[u8], value: &[u8]) -> Result<()> {
        let core = self.core.clone();
        let _cl = core.store.commit_lock().acquire_shared();
        self.ensure_enter()?;

        let old = tree.store(key, value)?;
        {
            let mut undo = self.undo.lock();
            undo.ensure_active_index(&core, tree.id)?;
            let long_key = key.len() > crate::tree::max_inline_key(core.cache.page_size());
            match &old {
                None => {
                    let op = if long_key { OP_UNINSERT_LK } else { OP_UNINSERT };
                    undo.push(&core, op, &payload_key(key))?;
                }
                Some(raw) => {
                    let op = if long_key { OP_UNUPDATE_LK } else { OP_UNUPDATE };
                    undo.push(&core, op, &payload_key_value(key, raw.flags, &raw.bytes))?;
                }
            }
        }
        core.redo_write(&RedoRecord::TxnStore {
            txn: self.id,
            index: tree.id,
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        Ok(())
    }

    /// Transactional delete: the entry becomes a ghost until commit.
    pub fn delete(&mut self, index: &Index, key: &[u8]) -> Result<bool> {
        self.check_active()?;
        let r = self.delete_inner(index.tree(), key);
        self.core.fail_guard(r)
    }

    fn delete_inner(&mut self, tree: &Arc<Tree>, key: &[u8]) -> Result<bool> {
        let core = self.core.clone();
        let _cl = core.store.commit_lock().acquire_shared();
        self.ensure_enter()?;

        let Some(raw) = tree.mark_ghost(key)? else {
            return Ok(false);
        };
        {
            let mut undo = self.undo.lock();
            undo.ensure_active_index(&core, tree.id)?;
            if raw.is_fragmented() {
                undo.push(&core, OP_UNDELETE_FRAGMENTED, &payload_key(key))?;
            } else {
                let long_key = key.len() > crate::tree::max_inline_key(core.cache.page_size());
                let op = if long_key { OP_UNDELETE_LK } else { OP_UNDELETE };
                undo.push(&core, op, &payload_key_value(key, raw.flags, &raw.bytes))?;
            }
        }
        core.redo_write(&RedoRecord::TxnDelete {
            txn: self.id,
            index: tree.id,
            key: key.to_vec(),
        })?;
        Ok(true)
    }

    /// Record a custom operation; the registered handler replays and
    /// reverses it.
    pub fn custom(&mut self, payload: &[u8]) -> Result<()> {
        self.check_active()?;
        let core = self.core.clone();
        let _cl = core.store.commit_lock().acquire_shared();
        self.ensure_enter()?;
        self.undo.lock().push(&core, OP_CUSTOM, payload)?;
        core.redo_write(&RedoRecord::Custom {
            txn: self.id,
            payload: payload.to_vec(),
        })?;
        Ok(())
    }

    /// Open a nested scope. A later `rollback` unwinds only back to here;
    /// a later `commit` seals it into the parent scope.
    pub fn enter(&mut self) -> Result<()> {
        self.check_active()?;
        let core = self.core.clone();
        let _cl = core.store.commit_lock().acquire_shared();
        self.ensure_enter()?;
        self.undo.lock().push(&core, OP_SCOPE_ENTER, &[])?;
        self.scope_depth += 1;
        core.redo_write(&RedoRecord::TxnEnter { txn: self.id })?;
        Ok(())
    }

    /// Commit the innermost scope; the outermost commit makes the whole
    /// transaction durable per the configured durability mode.
    pub fn commit(&mut self) -> Result<()> {
        self.check_active()?;
        if self.scope_depth > 0 {
            let core = self.core.clone();
            let _cl = core.store.commit_lock().acquire_shared();
            self.undo.lock().push(&core, OP_SCOPE_COMMIT, &[])?;
            self.scope_depth -= 1;
            core.redo_write(&RedoRecord::TxnCommit { txn: self.id })?;
            return Ok(());
        }
        let r = self.commit_final();
        self.core.fail_guard(r)
    }

    fn commit_final(&mut self) -> Result<()> {
        let core = self.core.clone();
        if self.entered {
            core.redo_write(&RedoRecord::TxnCommitFinal { txn: self.id })?;
            // The commit point: once this reaches disk, the transaction
            // survives a crash.
            core.redo_commit_flush()?;
        }

        let _cl = core.store.commit_lock().acquire_shared();
        let mut undo = self.undo.lock();
        finalize_committed(&core, &mut undo)?;
        undo.commit_and_truncate(&core)?;
        drop(undo);
        drop(_cl);

        core.contexts.unregister(self.id);
        self.state = TxnState::Committed;
        Ok(())
    }

    /// Roll back the innermost scope, or the whole transaction when no
    /// nested scope is open.
    pub fn rollback(&mut self) -> Result<()> {
        self.check_active()?;
        let core = self.core.clone();
        if self.scope_depth > 0 {
            let _cl = core.store.commit_lock().acquire_shared();
            let mut undo = self.undo.lock();
            rollback_scope(&core, &mut undo)?;
            drop(undo);
            self.scope_depth -= 1;
            core.redo_write(&RedoRecord::TxnRollback { txn: self.id })?;
            return Ok(());
        }
        let r = self.rollback_final();
        self.core.fail_guard(r)
    }

    fn rollback_final(&mut self) -> Result<()> {
        let core = self.core.clone();
        {
            let _cl = core.store.commit_lock().acquire_shared();
            let mut undo = self.undo.lock();
            rollback_all(&core, &mut undo)?;
            undo.free_chain(&core)?;
        }
        if self.entered {
            core.redo_write(&RedoRecord::TxnRollbackFinal { txn: self.id })?;
        }
        core.contexts.unregister(self.id);
        self.state = TxnState::RolledBack;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            self.scope_depth = 0;
            if let Err(e) = self.rollback() {
                warn!("implicit rollback of transaction {} failed: {e}", self.id);
            }
        }
    }
}

/// Apply one popped undo entry. `current_index` tracks the active index as
/// `OP_ACTIVE_INDEX` boundaries are crossed.
pub(crate) fn apply_undo_op(
    core: &Arc<DbCore>,
    current_index: &mut u64,
    op: u8,
    payload: &[u8],
) -> Result<()> {
    match op {
        OP_SCOPE_ENTER | OP_SCOPE_COMMIT => Ok(()),
        OP_ACTIVE_INDEX => {
            let mut pos = 0;
            *current_index = varint::read_u64(payload, &mut pos)?;
            Ok(())
        }
        OP_UNINSERT | OP_UNINSERT_LK => {
            let tree = core.tree_by_id(*current_index)?;
            if let Some(raw) = tree.delete(payload)? {
                if raw.is_fragmented() {
                    core.fragmenter().delete(&raw.bytes)?;
                }
            }
            Ok(())
        }
        OP_UNUPDATE | OP_UNUPDATE_LK => {
            let (key, flags, stored) = parse_key_value(payload)?;
            let tree = core.tree_by_id(*current_index)?;
            if let Some(replaced) = tree.store_raw(&key, flags, &stored)? {
                // The value written inside the transaction is discarded;
                // reclaim its fragments.
                if replaced.is_fragmented() && !replaced.is_ghost() {
                    core.fragmenter().delete(&replaced.bytes)?;
                }
            }
            Ok(())
        }
        OP_UNDELETE | OP_UNDELETE_LK => {
            let (key, _, _) = parse_key_value(payload)?;
            let tree = core.tree_by_id(*current_index)?;
            tree.unmark_ghost(&key)?;
            Ok(())
        }
        OP_UNDELETE_FRAGMENTED => {
            let tree = core.tree_by_id(*current_index)?;
            tree.unmark_ghost(payload)?;
            Ok(())
        }
        OP_CUSTOM => core.custom_undo(payload),
        other => Err(TuplError::CorruptDatabase(format!(
            "unexpected undo opcode {other} during rollback"
        ))),
    }
}

/// Pop and apply entries until the matching scope-enter marker is
/// consumed.
pub(crate) fn rollback_scope(core: &Arc<DbCore>, undo: &mut UndoLog) -> Result<()> {
    let mut current_index = undo.active_index;
    loop {
        match undo.pop(core)? {
            None => return Ok(()),
            Some((OP_SCOPE_ENTER, _)) => {
                undo.active_index = current_index;
                return Ok(());
            }
            Some((op, payload)) => apply_undo_op(core, &mut current_index, op, &payload)?,
        }
    }
}

/// Pop and apply every entry.
pub(crate) fn rollback_all(core: &Arc<DbCore>, undo: &mut UndoLog) -> Result<()> {
    let mut current_index = undo.active_index;
    loop {
        match undo.pop(core)? {
            None => return Ok(()),
            Some((OP_COMMIT_TRUNCATE, _)) => return Ok(()),
            Some((op, payload)) => apply_undo_op(core, &mut current_index, op, &payload)?,
        }
    }
}

/// Drain a committed transaction's undo log, finishing the work its
/// entries describe: ghosted entries are removed for real and replaced
/// fragmented values reclaimed. Everything here is idempotent, so a crash
/// mid-drain is repaired by re-running from the recovered log.
pub(crate) fn finalize_committed(core: &Arc<DbCore>, undo: &mut UndoLog) -> Result<()> {
    let mut current_index = undo.active_index;
    loop {
        match undo.pop(core)? {
            None => return Ok(()),
            Some((OP_COMMIT_TRUNCATE, _)) => return Ok(()),
            Some((OP_ACTIVE_INDEX, payload)) => {
                let mut pos = 0;
                current_index = varint::read_u64(&payload, &mut pos)?;
            }
            Some((OP_UNDELETE | OP_UNDELETE_LK, payload)) => {
                let (key, _, _) = parse_key_value(&payload)?;
                remove_ghost_entry(core, current_index, &key)?;
            }
            Some((OP_UNDELETE_FRAGMENTED, payload)) => {
                remove_ghost_entry(core, current_index, &payload)?;
            }
            Some((OP_UNUPDATE | OP_UNUPDATE_LK, payload)) => {
                // The pre-image is discarded by the commit; a ghosted
                // pre-image is covered here too, since its entry was
                // overwritten and the ghost-removal below will find
                // nothing.
                let (_, flags, stored) = parse_key_value(&payload)?;
                if flags & VALUE_FRAGMENTED != 0 {
                    core.fragmenter().delete(&stored)?;
                }
            }
            Some(_) => {}
        }
    }
}

fn remove_ghost_entry(core: &Arc<DbCore>, index: u64, key: &[u8]) -> Result<()> {
    let tree = core.tree_by_id(index)?;
    if let Some(raw) = tree.remove_ghost(key)? {
        if raw.is_fragmented() {
            core.fragmenter().delete(&raw.bytes)?;
        }
    }
    Ok(())
}

//! Open-time recovery.
//!
//! Order matters: in-flight transactions are first rebuilt from the
//! committed master undo log, so redo replay finds them alive and can
//! continue them. Redo records are then reapplied through the normal
//! mutation paths with redo emission suppressed (the writer is not
//! installed yet). Whatever transaction is still open when the stream
//! ends was never committed and is rolled back.

use std::collections::HashMap;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};

use crate::core::errors::{Result, TuplError};
use crate::db::DbCore;
use crate::storage::header::CommitHeader;
use crate::storage::node_cache::LoadKind;
use crate::txn::redo_log::{RedoPosition, RedoReader, RedoRecord};
use crate::txn::undo_log::{UndoLog, OP_COMMIT_TRUNCATE, OP_LOG_COPY, OP_LOG_REF};
use crate::txn::TxnId;

#[derive(Debug, Default, Clone)]
pub struct RecoveryStats {
    pub rebuilt_txns: usize,
    pub replayed_ops: usize,
    pub committed: usize,
    pub rolled_back: usize,
    pub last_redo: u64,
}

struct ReplayTxn {
    undo: UndoLog,
    scope_depth: usize,
}

/// Run full recovery against the committed header. Returns the stats and
/// the highest transaction id observed.
pub(crate) fn recover(core: &Arc<DbCore>, header: &CommitHeader) -> Result<(RecoveryStats, TxnId)> {
    let mut stats = RecoveryStats {
        last_redo: header.redo_num,
        ..Default::default()
    };
    let mut max_txn = header.last_txn_id;

    let mut txns: HashMap<TxnId, ReplayTxn> = HashMap::new();
    rebuild_from_master(core, header, &mut txns, &mut stats)?;
    for id in txns.keys() {
        max_txn = max_txn.max(*id);
    }

    replay_redo(core, header, &mut txns, &mut stats, &mut max_txn)?;

    // Anything still open never committed; undo it.
    for (id, mut txn) in txns.drain() {
        let _cl = core.store.commit_lock().acquire_shared();
        crate::txn::transaction::rollback_all(core, &mut txn.undo)?;
        txn.undo.free_chain(core)?;
        stats.rolled_back += 1;
        info!("recovery rolled back in-flight transaction {id}");
    }

    info!(
        "recovery complete: {} txns rebuilt, {} ops replayed, {} committed, {} rolled back",
        stats.rebuilt_txns, stats.replayed_ops, stats.committed, stats.rolled_back
    );
    Ok((stats, max_txn))
}

fn rebuild_from_master(
    core: &Arc<DbCore>,
    header: &CommitHeader,
    txns: &mut HashMap<TxnId, ReplayTxn>,
    stats: &mut RecoveryStats,
) -> Result<()> {
    if header.master_undo_id == 0 {
        return Ok(());
    }
    // The master's own top position lives in its page header.
    let top_pos = {
        let node = core.cache.get_or_load(
            core.store.as_ref(),
            header.master_undo_id,
            LoadKind::UndoLog,
        )?;
        let guard = node.read();
        LittleEndian::read_u16(&guard.page[2..4]) as usize
    };
    let mut master = UndoLog::from_ref(0, 0, 0, header.master_undo_id, top_pos);

    loop {
        match master.pop(core)? {
            None => break,
            Some((op @ (OP_LOG_COPY | OP_LOG_REF), payload)) => {
                let undo = UndoLog::from_master_entry(op, &payload)?;
                let id = undo.txn_id;
                // A chain whose newest entry is the committed-and-truncated
                // marker belongs to a transaction that already committed;
                // skip it without decoding anything else.
                if undo.is_spilled() && undo.peek_op(core)? == Some(OP_COMMIT_TRUNCATE) {
                    let mut undo = undo;
                    undo.free_chain(core)?;
                    continue;
                }
                stats.rebuilt_txns += 1;
                txns.insert(
                    id,
                    ReplayTxn {
                        undo,
                        scope_depth: 0,
                    },
                );
            }
            Some((other, _)) => {
                return Err(TuplError::CorruptDatabase(format!(
                    "master undo log holds unexpected opcode {other}"
                )));
            }
        }
    }
    master.free_chain(core)?;
    Ok(())
}

fn replay_redo(
    core: &Arc<DbCore>,
    header: &CommitHeader,
    txns: &mut HashMap<TxnId, ReplayTxn>,
    stats: &mut RecoveryStats,
    max_txn: &mut TxnId,
) -> Result<()> {
    let Some(base) = core.base_path.clone() else {
        return Ok(());
    };
    let start = RedoPosition {
        num: header.redo_num,
        offset: header
            .redo_position
            .max(crate::txn::redo_log::REDO_HEADER_SIZE),
    };
    let Some(mut reader) = RedoReader::open(&base, start)? else {
        return Ok(());
    };

    while let Some(record) = reader.next()? {
        stats.replayed_ops += 1;
        match record {
            RedoRecord::Timestamp { .. }
            | RedoRecord::Shutdown
            | RedoRecord::Close
            | RedoRecord::EndFile => {}
            RedoRecord::Store { index, key, value } => {
                let tree = core.tree_by_id(index)?;
                let _cl = core.store.commit_lock().acquire_shared();
                if let Some(raw) = tree.store(&key, &value)? {
                    if raw.is_fragmented() && !raw.is_ghost() {
                        core.fragmenter().delete(&raw.bytes)?;
                    }
                }
            }
            RedoRecord::Delete { index, key } => {
                let tree = core.tree_by_id(index)?;
                let _cl = core.store.commit_lock().acquire_shared();
                if let Some(raw) = tree.delete(&key)? {
                    if raw.is_fragmented() && !raw.is_ghost() {
                        core.fragmenter().delete(&raw.bytes)?;
                    }
                }
            }
            RedoRecord::RenameIndex { index, new_name } => {
                core.apply_rename_index(index, &new_name)?;
            }
            RedoRecord::DeleteIndex { index } => {
                core.apply_delete_index(index)?;
            }
            RedoRecord::TxnEnter { txn } => {
                *max_txn = (*max_txn).max(txn);
                match txns.get_mut(&txn) {
                    None => {
                        txns.insert(
                            txn,
                            ReplayTxn {
                                undo: UndoLog::new(txn),
                                scope_depth: 0,
                            },
                        );
                    }
                    Some(t) => {
                        // A nested scope of a known transaction.
                        let _cl = core.store.commit_lock().acquire_shared();
                        t.undo
                            .push(core, crate::txn::undo_log::OP_SCOPE_ENTER, &[])?;
                        t.scope_depth += 1;
                    }
                }
            }
            RedoRecord::TxnStore {
                txn,
                index,
                key,
                value,
            } => {
                *max_txn = (*max_txn).max(txn);
                replay_txn_store(core, txns, txn, index, &key, &value)?;
            }
            RedoRecord::TxnDelete { txn, index, key } => {
                *max_txn = (*max_txn).max(txn);
                replay_txn_delete(core, txns, txn, index, &key)?;
            }
            RedoRecord::TxnStoreCommitFinal {
                txn,
                index,
                key,
                value,
            } => {
                *max_txn = (*max_txn).max(txn);
                replay_txn_store(core, txns, txn, index, &key, &value)?;
                finish_commit(core, txns, txn, stats)?;
            }
            RedoRecord::TxnCommit { txn } => {
                if let Some(t) = txns.get_mut(&txn) {
                    if t.scope_depth > 0 {
                        let _cl = core.store.commit_lock().acquire_shared();
                        t.undo
                            .push(core, crate::txn::undo_log::OP_SCOPE_COMMIT, &[])?;
                        t.scope_depth -= 1;
                    }
                }
            }
            RedoRecord::TxnCommitFinal { txn } => {
                finish_commit(core, txns, txn, stats)?;
            }
            RedoRecord::TxnRollback { txn } => {
                if let Some(t) = txns.get_mut(&txn) {
                    let _cl = core.store.commit_lock().acquire_shared();
                    crate::txn::transaction::rollback_scope(core, &mut t.undo)?;
                    t.scope_depth = t.scope_depth.saturating_sub(1);
                }
            }
            RedoRecord::TxnRollbackFinal { txn } => {
                if let Some(mut t) = txns.remove(&txn) {
                    let _cl = core.store.commit_lock().acquire_shared();
                    crate::txn::transaction::rollback_all(core, &mut t.undo)?;
                    t.undo.free_chain(core)?;
                    stats.rolled_back += 1;
                }
            }
            RedoRecord::Custom { txn, payload } => {
                *max_txn = (*max_txn).max(txn);
                let t = txns.entry(txn).or_insert_with(|| ReplayTxn {
                    undo: UndoLog::new(txn),
                    scope_depth: 0,
                });
                let _cl = core.store.commit_lock().acquire_shared();
                core.custom_redo(&payload)?;
                t.undo
                    .push(core, crate::txn::undo_log::OP_CUSTOM, &payload)?;
            }
        }
    }
    stats.last_redo = reader.position().num;
    Ok(())
}

fn replay_txn_store(
    core: &Arc<DbCore>,
    txns: &mut HashMap<TxnId, ReplayTxn>,
    txn: TxnId,
    index: u64,
    key: &[u8],
    value: &[u8],
) -> Result<()> {
    let t = txns.entry(txn).or_insert_with(|| ReplayTxn {
        undo: UndoLog::new(txn),
        scope_depth: 0,
    });
    let tree = core.tree_by_id(index)?;
    let _cl = core.store.commit_lock().acquire_shared();
    let old = tree.store(key, value)?;
    t.undo.ensure_active_index(core, index)?;
    use crate::txn::undo_log::{payload_key, payload_key_value, OP_UNINSERT, OP_UNUPDATE};
    match old {
        None => t.undo.push(core, OP_UNINSERT, &payload_key(key))?,
        Some(raw) => t.undo.push(
            core,
            OP_UNUPDATE,
            &payload_key_value(key, raw.flags, &raw.bytes),
        )?,
    }
    Ok(())
}

fn replay_txn_delete(
    core: &Arc<DbCore>,
    txns: &mut HashMap<TxnId, ReplayTxn>,
    txn: TxnId,
    index: u64,
    key: &[u8],
) -> Result<()> {
    let t = txns.entry(txn).or_insert_with(|| ReplayTxn {
        undo: UndoLog::new(txn),
        scope_depth: 0,
    });
    let tree = core.tree_by_id(index)?;
    let _cl = core.store.commit_lock().acquire_shared();
    let Some(raw) = tree.mark_ghost(key)? else {
        return Ok(());
    };
    t.undo.ensure_active_index(core, index)?;
    use crate::txn::undo_log::{
        payload_key, payload_key_value, OP_UNDELETE, OP_UNDELETE_FRAGMENTED,
    };
    if raw.is_fragmented() {
        t.undo
            .push(core, OP_UNDELETE_FRAGMENTED, &payload_key(key))?;
    } else {
        t.undo.push(
            core,
            OP_UNDELETE,
            &payload_key_value(key, raw.flags, &raw.bytes),
        )?;
    }
    Ok(())
}

fn finish_commit(
    core: &Arc<DbCore>,
    txns: &mut HashMap<TxnId, ReplayTxn>,
    txn: TxnId,
    stats: &mut RecoveryStats,
) -> Result<()> {
    let Some(mut t) = txns.remove(&txn) else {
        // Commit record for a transaction with no surviving work.
        return Ok(());
    };
    let _cl = core.store.commit_lock().acquire_shared();
    crate::txn::transaction::finalize_committed(core, &mut t.undo)?;
    t.undo.free_chain(core)?;
    stats.committed += 1;
    Ok(())
}

/// Best-effort sanity pass after recovery, logging anything suspicious.
pub(crate) fn post_recovery_audit(core: &Arc<DbCore>) {
    if core.contexts.active_count() != 0 {
        warn!("recovery left transactions registered; forcing cleanup");
    }
}

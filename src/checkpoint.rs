//! Checkpoints: publishing a new crash-recoverable point.
//!
//! The protocol, in order:
//!
//! 1. take the checkpoint mutex (one checkpoint at a time),
//! 2. pre-flight: nothing dirty and not forced means just sync the redo,
//! 3. under the exclusive commit lock, refresh the registry with current
//!    tree roots, latch the registry root shared (spinning by releasing
//!    the commit lock on failure), compose the next header, and serialize
//!    every live undo log into the master log,
//! 4. flip the commit state; the old tag becomes the flush tag,
//! 5. release the locks; new mutations proceed, tagged with the new state,
//! 6. flush every dirty node carrying the retiring tag and let the store
//!    durably commit the header,
//! 7. clean up: obsolete redo files deleted, the previous master undo
//!    chain freed, oversized redo rotated.
//!
//! A failed store commit stashes the composed header; the next attempt
//! re-commits the identical state instead of composing a new one.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};

use crate::core::errors::Result;
use crate::db::DbCore;
use crate::storage::header::CommitHeader;
use crate::storage::node::CachedState;
use crate::txn::redo_log::delete_old_redo_files;
use crate::txn::undo_log::UndoLog;

#[derive(Debug, Clone)]
pub(crate) struct CheckpointStash {
    pub header: CommitHeader,
    pub retiring: u8,
    pub master_top: u64,
}

/// Run one checkpoint. With `force` the pre-flight threshold checks are
/// skipped.
pub(crate) fn checkpoint(core: &Arc<DbCore>, force: bool) -> Result<()> {
    if !core.store.is_durable() {
        return Ok(());
    }
    let _serial = core.checkpoint_mutex.lock();
    core.check_closed()?;

    // A failed commit left a fully composed header behind; finishing it
    // re-publishes the identical state.
    let stash = core.ckpt_stash.lock().clone();
    if let Some(stash) = stash {
        info!("resuming interrupted checkpoint {}", stash.header.checkpoint_number);
        return commit_and_cleanup(core, stash, true);
    }

    if !force && core.cache.dirty_count() == 0 {
        let mut redo = core.redo.lock();
        redo.flush(true)?;
        return Ok(());
    }

    let stash = {
        let excl = core.store.commit_lock().acquire_exclusive();

        // Registry entries must carry the pre-flip state so this
        // checkpoint flushes them.
        core.sync_registry_roots()?;

        // Registry root latch, spinning by releasing the commit lock so a
        // stuck reader cannot deadlock the checkpoint.
        let registry = core.registry().clone();
        let mut excl = excl;
        let root_guard = loop {
            match registry.root().try_read() {
                Some(g) => break g,
                None => {
                    drop(excl);
                    std::thread::yield_now();
                    excl = core.store.commit_lock().acquire_exclusive();
                }
            }
        };

        let mut header = CommitHeader::new(core.cache.page_size() as u32);
        header.registry_root_id = registry.root_id();
        let pos = {
            let mut redo = core.redo.lock();
            redo.position()?
        };
        header.redo_num = pos.num;
        header.redo_position = pos.offset;
        let txn_id = core.txn_id_snapshot();
        header.last_txn_id = txn_id;
        header.redo_txn_id = txn_id;

        // Serialize every in-flight transaction's undo log into the
        // master log; recovery rebuilds them from here.
        let mut master = UndoLog::new(0);
        let mut master_top = 0;
        for undo in core.contexts.collect() {
            let undo = undo.lock();
            undo.push_master_entry(core, &mut master)?;
        }
        if !master.is_empty() {
            master.force_spill(core)?;
            master_top = master.top().0;
        }
        header.master_undo_id = master_top;

        let new_state = core.store.flip_commit_state();
        let retiring = new_state ^ 1;
        debug!(
            "checkpoint composed: registry root {}, redo {}:{}, retiring state {retiring}",
            header.registry_root_id, header.redo_num, header.redo_position
        );
        drop(root_guard);
        drop(excl);

        CheckpointStash {
            header,
            retiring,
            master_top,
        }
    };

    commit_and_cleanup(core, stash, false)
}

fn commit_and_cleanup(core: &Arc<DbCore>, stash: CheckpointStash, resume: bool) -> Result<()> {
    let mut header = stash.header.clone();
    let retiring = stash.retiring;
    let result = core.store.commit(resume, &mut header, &mut || {
        flush_dirty(core, retiring)
    });
    match result {
        Ok(()) => {}
        Err(e) => {
            // Keep everything needed to re-commit the identical state.
            error!("checkpoint commit failed, stashing for resume: {e}");
            *core.ckpt_stash.lock() = Some(CheckpointStash {
                header,
                retiring,
                master_top: stash.master_top,
            });
            return Err(e);
        }
    }
    *core.ckpt_stash.lock() = None;

    // The previous checkpoint's master undo chain is superseded.
    let prev_master = core
        .committed_master
        .swap(stash.master_top, Ordering::AcqRel);
    if prev_master != 0 {
        let mut stale = UndoLog::from_ref(0, 0, 0, prev_master, 0);
        if let Err(e) = stale.free_chain(core) {
            error!("failed to free superseded master undo chain: {e}");
        }
    }

    if let Some(base) = &core.base_path {
        delete_old_redo_files(base, header.redo_num)?;
    }
    {
        let mut redo = core.redo.lock();
        if redo.size() > core.config.checkpoint_size_threshold {
            let num = redo.rotate()?;
            debug!("redo log rotated to {num}");
        }
    }
    info!("checkpoint {} committed", header.checkpoint_number);
    Ok(())
}

/// Write out every dirty node whose tag is being retired. Nodes dirtied
/// under the new state go back on the list for the next checkpoint.
fn flush_dirty(core: &Arc<DbCore>, retiring: u8) -> Result<()> {
    let nodes = core.cache.take_dirty();
    let mut flushed = 0usize;
    for node in nodes {
        let mut guard = node.write();
        match guard.state {
            CachedState::Dirty(t) if t == retiring => {
                core.store.write_page(node.id(), &guard.page)?;
                guard.state = CachedState::Clean;
                flushed += 1;
            }
            CachedState::Dirty(_) => {
                drop(guard);
                core.cache.mark_in_dirty(&node);
            }
            CachedState::Clean => {}
        }
    }
    debug!("checkpoint flushed {flushed} pages");
    Ok(())
}

/// Background thread driving periodic checkpoints.
pub(crate) struct Checkpointer {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<Shutdown>,
}

struct Shutdown {
    flag: Mutex<bool>,
    cv: Condvar,
}

impl Checkpointer {
    pub fn spawn(core: Arc<DbCore>, interval: Duration) -> Checkpointer {
        let shutdown = Arc::new(Shutdown {
            flag: Mutex::new(false),
            cv: Condvar::new(),
        });
        let sd = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("tupl-checkpointer".into())
            .spawn(move || loop {
                {
                    let mut stop = sd.flag.lock();
                    if *stop {
                        return;
                    }
                    sd.cv.wait_for(&mut stop, interval);
                    if *stop {
                        return;
                    }
                }
                match checkpoint(&core, false) {
                    Ok(()) => {}
                    Err(e) if matches!(e, crate::TuplError::DatabaseClosed { .. }) => return,
                    Err(e) => error!("periodic checkpoint failed: {e}"),
                }
            })
            .expect("spawn checkpointer thread");
        Checkpointer {
            handle: Some(handle),
            shutdown,
        }
    }

    pub fn stop(&mut self) {
        *self.shutdown.flag.lock() = true;
        self.shutdown.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Store-wide commit lock: many cheap shared acquisitions, a rare exclusive
//! one (the checkpoint). Shared holders only touch striped counters; the
//! auxiliary `full` latch is taken on the shared path only while an
//! exclusive request is pending.
//!
//! Reentrant per thread: a thread already holding the lock (shared or
//! exclusive) skips the pending-exclusive check, so a checkpoint may run
//! tree mutations of its own without self-deadlock.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::sync::latch::RawLatch;

const FIRST_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(128);

thread_local! {
    /// Per-thread hold counts, keyed by lock instance id. An entry exists
    /// only while the thread holds that lock.
    static HOLDS: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());

    /// Stripe assignment for this thread, fixed at first use.
    static STRIPE: usize = {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        NEXT.fetch_add(1, Ordering::Relaxed)
    };
}

fn next_lock_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

struct Stripe {
    acquired: AtomicU64,
    released: AtomicU64,
    // Counters on their own cache lines.
    _pad: [u64; 6],
}

pub struct CommitLock {
    id: u64,
    stripes: Box<[Stripe]>,
    full: RawLatch,
    exclusive_pending: AtomicBool,
    exclusive_thread: Mutex<Option<Thread>>,
}

impl std::fmt::Debug for CommitLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLock")
            .field("outstanding", &self.outstanding())
            .field(
                "exclusive_pending",
                &self.exclusive_pending.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl Default for CommitLock {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitLock {
    pub fn new() -> Self {
        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let count = cpus.max(2).next_power_of_two();
        let stripes = (0..count)
            .map(|_| Stripe {
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
                _pad: [0; 6],
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        CommitLock {
            id: next_lock_id(),
            stripes,
            full: RawLatch::new(),
            exclusive_pending: AtomicBool::new(false),
            exclusive_thread: Mutex::new(None),
        }
    }

    fn stripe(&self) -> &Stripe {
        let idx = STRIPE.with(|s| *s) & (self.stripes.len() - 1);
        &self.stripes[idx]
    }

    /// Acquired minus released across all stripes; zero means no shared
    /// holder is outstanding.
    fn outstanding(&self) -> i64 {
        let mut acquired: u64 = 0;
        let mut released: u64 = 0;
        // Released before acquired: reading a release without its matching
        // acquire would undercount holders, the other way only overcounts.
        for s in self.stripes.iter() {
            released = released.wrapping_add(s.released.load(Ordering::SeqCst));
        }
        for s in self.stripes.iter() {
            acquired = acquired.wrapping_add(s.acquired.load(Ordering::SeqCst));
        }
        acquired.wrapping_sub(released) as i64
    }

    fn held_by_current(&self) -> usize {
        HOLDS.with(|h| h.borrow().get(&self.id).copied().unwrap_or(0))
    }

    fn adjust_held(&self, delta: isize) {
        HOLDS.with(|h| {
            let mut map = h.borrow_mut();
            let entry = map.entry(self.id).or_insert(0);
            let next = (*entry as isize + delta).max(0) as usize;
            if next == 0 {
                map.remove(&self.id);
            } else {
                *entry = next;
            }
        });
    }

    pub fn acquire_shared(&self) -> CommitSharedGuard<'_> {
        self.stripe().acquired.fetch_add(1, Ordering::SeqCst);
        if self.exclusive_pending.load(Ordering::SeqCst) && self.held_by_current() == 0 {
            // Back out via the release path, then wait behind the pending
            // exclusive on the full latch.
            self.count_release();
            self.full.acquire_shared();
            self.stripe().acquired.fetch_add(1, Ordering::SeqCst);
            self.full.release_shared();
        }
        self.adjust_held(1);
        CommitSharedGuard { lock: self }
    }

    fn count_release(&self) {
        self.stripe().released.fetch_add(1, Ordering::SeqCst);
        if self.exclusive_pending.load(Ordering::SeqCst) && self.outstanding() <= 0 {
            if let Some(t) = self.exclusive_thread.lock().as_ref() {
                t.unpark();
            }
        }
    }

    fn release_shared(&self) {
        self.adjust_held(-1);
        self.count_release();
    }

    pub fn acquire_exclusive(&self) -> CommitExclusiveGuard<'_> {
        let mut backoff = FIRST_BACKOFF;
        loop {
            self.full.acquire_exclusive();
            *self.exclusive_thread.lock() = Some(thread::current());
            self.exclusive_pending.store(true, Ordering::SeqCst);

            let deadline = Instant::now() + backoff;
            loop {
                if self.outstanding() <= 0 {
                    self.adjust_held(1);
                    return CommitExclusiveGuard { lock: self };
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                thread::park_timeout(deadline - now);
            }

            // Long-running shared holders are still in; step aside so new
            // shared acquisitions flow again, then retry with a doubled
            // timeout. This de-prioritizes the checkpoint without starving
            // it.
            self.exclusive_pending.store(false, Ordering::SeqCst);
            *self.exclusive_thread.lock() = None;
            self.full.release_exclusive();
            backoff = (backoff * 2).min(MAX_BACKOFF);
            thread::yield_now();
        }
    }

    fn release_exclusive(&self) {
        self.adjust_held(-1);
        self.exclusive_pending.store(false, Ordering::SeqCst);
        *self.exclusive_thread.lock() = None;
        self.full.release_exclusive();
    }
}

pub struct CommitSharedGuard<'a> {
    lock: &'a CommitLock,
}

impl Drop for CommitSharedGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_shared();
    }
}

pub struct CommitExclusiveGuard<'a> {
    lock: &'a CommitLock,
}

impl Drop for CommitExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_exclusive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn shared_is_reentrant() {
        let lock = CommitLock::new();
        let a = lock.acquire_shared();
        let b = lock.acquire_shared();
        drop(a);
        drop(b);
        assert_eq!(lock.outstanding(), 0);
    }

    #[test]
    fn exclusive_waits_for_shared_drain() {
        let lock = Arc::new(CommitLock::new());
        let entered = Arc::new(AtomicU32::new(0));

        let shared = lock.acquire_shared();
        let l2 = lock.clone();
        let e2 = entered.clone();
        let h = thread::spawn(move || {
            let g = l2.acquire_exclusive();
            e2.store(1, Ordering::SeqCst);
            drop(g);
        });

        thread::sleep(Duration::from_millis(20));
        assert_eq!(entered.load(Ordering::SeqCst), 0);
        drop(shared);
        h.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exclusive_holder_may_reacquire_shared() {
        let lock = CommitLock::new();
        let excl = lock.acquire_exclusive();
        let shared = lock.acquire_shared();
        drop(shared);
        drop(excl);
        assert_eq!(lock.outstanding(), 0);
    }

    #[test]
    fn counters_balance_under_contention() {
        let lock = Arc::new(CommitLock::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    let _g = lock.acquire_shared();
                }
            }));
        }
        for _ in 0..4 {
            let _g = lock.acquire_exclusive();
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(lock.outstanding(), 0);
    }
}

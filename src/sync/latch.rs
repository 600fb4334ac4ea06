//! Non-reentrant shared/exclusive latch.
//!
//! The whole latch state lives in one word:
//!
//! ```text
//! 0x00000000            unlatched
//! 0x80000000            held exclusively
//! 0x00000001..7fffffff  shared count
//! 0x80000001..ffffffff  shared held, exclusive requested (no new shared)
//! ```
//!
//! Acquisition is a CAS loop bounded by an adaptive spin budget; on
//! exhaustion the thread enqueues a wait node and parks. Barging is
//! permitted, but a waiter that loses a barge race marks itself `denied`,
//! which forces the next releaser into a fair handoff so nobody starves.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const EXCLUSIVE: u32 = 0x8000_0000;
const SHARED_MASK: u32 = 0x7fff_ffff;

/// Spins to burn before parking. Reset after a yield.
fn spin_budget() -> usize {
    static BUDGET: AtomicU32 = AtomicU32::new(0);
    let b = BUDGET.load(Ordering::Relaxed);
    if b != 0 {
        return b as usize;
    }
    let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as u32;
    BUDGET.store(cpus, Ordering::Relaxed);
    cpus as usize
}

struct Waiter {
    thread: Thread,
    shared: bool,
    /// Set by a releaser after popping this waiter, before unparking it.
    signaled: AtomicBool,
    /// Ownership was transferred; the waiter must not touch the state word.
    granted: AtomicBool,
    /// This waiter already lost a barge race; the next release hands off
    /// fairly instead of barging again.
    denied: AtomicBool,
}

impl Waiter {
    fn new(shared: bool) -> Arc<Self> {
        Arc::new(Waiter {
            thread: thread::current(),
            shared,
            signaled: AtomicBool::new(false),
            granted: AtomicBool::new(false),
            denied: AtomicBool::new(false),
        })
    }

    fn wake(&self, granted: bool) {
        if granted {
            self.granted.store(true, Ordering::Release);
        }
        self.signaled.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

/// The bare latch. Guards nothing by itself; see [`Latch`] for the RAII
/// wrapper around data.
pub struct RawLatch {
    state: AtomicU32,
    waiters: Mutex<VecDeque<Arc<Waiter>>>,
}

impl Default for RawLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl RawLatch {
    pub fn new() -> Self {
        RawLatch {
            state: AtomicU32::new(0),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    pub fn try_acquire_shared(&self) -> bool {
        let mut s = self.state.load(Ordering::Acquire);
        loop {
            if s & EXCLUSIVE != 0 {
                return false;
            }
            match self
                .state
                .compare_exchange_weak(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(cur) => s = cur,
            }
        }
    }

    pub fn try_acquire_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Succeeds only when the caller is the sole shared holder.
    pub fn try_upgrade(&self) -> bool {
        self.state
            .compare_exchange(1, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn acquire_shared(&self) {
        if self.spin_acquire(true) {
            return;
        }
        let w = Waiter::new(true);
        self.enqueue_back(&w);
        // One more attempt after enqueue so a release racing with the
        // enqueue cannot strand us parked.
        if self.try_acquire_shared() {
            self.cancel(&w);
            return;
        }
        loop {
            thread::park();
            if !w.signaled.swap(false, Ordering::AcqRel) {
                continue;
            }
            if w.granted.load(Ordering::Acquire) {
                return;
            }
            if self.try_acquire_shared() {
                return;
            }
            w.denied.store(true, Ordering::Release);
            self.enqueue_front(&w);
        }
    }

    pub fn acquire_exclusive(&self) {
        if self.spin_acquire(false) {
            return;
        }
        let w = Waiter::new(false);
        self.enqueue_back(&w);
        self.mark_exclusive_pending();
        if self.try_acquire_exclusive() {
            self.cancel(&w);
            return;
        }
        loop {
            thread::park();
            if !w.signaled.swap(false, Ordering::AcqRel) {
                continue;
            }
            if w.granted.load(Ordering::Acquire) {
                return;
            }
            if self.try_acquire_exclusive() {
                return;
            }
            w.denied.store(true, Ordering::Release);
            self.enqueue_front(&w);
            self.mark_exclusive_pending();
        }
    }

    /// Bounded exclusive acquire. Returns false when `timeout` elapses
    /// without ownership.
    pub fn acquire_exclusive_timeout(&self, timeout: Duration) -> bool {
        if self.spin_acquire(false) {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let w = Waiter::new(false);
        self.enqueue_back(&w);
        self.mark_exclusive_pending();
        if self.try_acquire_exclusive() {
            self.cancel(&w);
            return true;
        }
        loop {
            let now = Instant::now();
            if now >= deadline {
                return self.cancel_or_granted(&w);
            }
            thread::park_timeout(deadline - now);
            if !w.signaled.swap(false, Ordering::AcqRel) {
                continue;
            }
            if w.granted.load(Ordering::Acquire) {
                return true;
            }
            if self.try_acquire_exclusive() {
                return true;
            }
            w.denied.store(true, Ordering::Release);
            self.enqueue_front(&w);
            self.mark_exclusive_pending();
        }
    }

    pub fn release_shared(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert_ne!(prev & SHARED_MASK, 0, "release_shared while not held");
        if prev & SHARED_MASK != 1 {
            return;
        }
        if prev & EXCLUSIVE != 0 {
            // We were the last shared holder and an exclusive is pending:
            // the state word is now exactly EXCLUSIVE, so transfer it.
            let mut q = self.waiters.lock();
            if let Some(idx) = q.iter().position(|w| !w.shared) {
                let w = q.remove(idx).expect("indexed waiter");
                w.wake(true);
            } else {
                // The pending exclusive gave up; drop the request bit.
                let _ = self.state.compare_exchange(
                    EXCLUSIVE,
                    0,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                Self::wake_front(&mut q);
            }
        } else {
            let mut q = self.waiters.lock();
            Self::wake_front(&mut q);
        }
    }

    pub fn release_exclusive(&self) {
        let mut q = self.waiters.lock();
        match q.front() {
            None => self.state.store(0, Ordering::Release),
            Some(front) if front.shared => {
                // Grant the whole contiguous shared prefix, then re-arm the
                // deny-new-shared bit if an exclusive waiter remains.
                let mut n = 0u32;
                while let Some(w) = q.front() {
                    if !w.shared {
                        break;
                    }
                    let w = q.pop_front().expect("front waiter");
                    n += 1;
                    w.wake(true);
                }
                let pending = q.iter().any(|w| !w.shared);
                self.state
                    .store(n | if pending { EXCLUSIVE } else { 0 }, Ordering::Release);
            }
            Some(front) => {
                if front.denied.load(Ordering::Acquire) {
                    // Fair handoff: ownership moves without the state word
                    // ever reading unlatched.
                    let w = q.pop_front().expect("front waiter");
                    w.wake(true);
                } else {
                    let w = q.pop_front().expect("front waiter");
                    self.state.store(0, Ordering::Release);
                    w.wake(false);
                }
            }
        }
    }

    /// Convert an exclusive hold into a shared one, waking every shared
    /// waiter ahead of the first exclusive waiter.
    pub fn downgrade(&self) {
        let mut q = self.waiters.lock();
        let mut n = 1u32; // the caller keeps a shared hold
        while let Some(w) = q.front() {
            if !w.shared {
                break;
            }
            let w = q.pop_front().expect("front waiter");
            n += 1;
            w.wake(true);
        }
        let pending = q.iter().any(|w| !w.shared);
        self.state
            .store(n | if pending { EXCLUSIVE } else { 0 }, Ordering::Release);
    }

    fn spin_acquire(&self, shared: bool) -> bool {
        let budget = spin_budget();
        let mut spins = 0;
        loop {
            let ok = if shared {
                self.try_acquire_shared()
            } else {
                self.try_acquire_exclusive()
            };
            if ok {
                return true;
            }
            spins += 1;
            if spins < budget {
                std::hint::spin_loop();
                continue;
            }
            thread::yield_now();
            return if shared {
                self.try_acquire_shared()
            } else {
                self.try_acquire_exclusive()
            };
        }
    }

    /// While shared holders exist, raise the exclusive-requested bit so no
    /// new shared acquisitions are admitted.
    fn mark_exclusive_pending(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                if s != 0 && s & EXCLUSIVE == 0 {
                    Some(s | EXCLUSIVE)
                } else {
                    None
                }
            });
    }

    fn wake_front(q: &mut VecDeque<Arc<Waiter>>) {
        match q.front() {
            None => {}
            Some(front) if front.shared => {
                while let Some(w) = q.front() {
                    if !w.shared {
                        break;
                    }
                    let w = q.pop_front().expect("front waiter");
                    w.wake(false);
                }
            }
            Some(_) => {
                let w = q.pop_front().expect("front waiter");
                w.wake(false);
            }
        }
    }

    fn enqueue_back(&self, w: &Arc<Waiter>) {
        self.waiters.lock().push_back(w.clone());
    }

    fn enqueue_front(&self, w: &Arc<Waiter>) {
        self.waiters.lock().push_front(w.clone());
    }

    fn cancel(&self, w: &Arc<Waiter>) {
        let mut q = self.waiters.lock();
        if let Some(idx) = q.iter().position(|x| Arc::ptr_eq(x, w)) {
            q.remove(idx);
        }
        self.clear_stale_pending(&q);
    }

    /// Timed-out waiter removal. The releaser sets `granted` under the
    /// queue lock, so checking it here is race-free: either we own the
    /// latch after all, or we are cleanly gone from the queue.
    fn cancel_or_granted(&self, w: &Arc<Waiter>) -> bool {
        let mut q = self.waiters.lock();
        if w.granted.load(Ordering::Acquire) {
            return true;
        }
        if let Some(idx) = q.iter().position(|x| Arc::ptr_eq(x, w)) {
            q.remove(idx);
        } else if w.signaled.load(Ordering::Acquire) {
            // Popped for a barge we never ran: retry once, else give up for
            // real. The queue no longer references us either way.
            drop(q);
            return self.try_acquire_exclusive();
        }
        self.clear_stale_pending(&q);
        false
    }

    fn clear_stale_pending(&self, q: &VecDeque<Arc<Waiter>>) {
        if q.iter().any(|w| !w.shared) {
            return;
        }
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                if s & EXCLUSIVE != 0 && s & SHARED_MASK != 0 {
                    Some(s & SHARED_MASK)
                } else {
                    None
                }
            });
    }

    #[cfg(test)]
    fn raw_state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RawLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.load(Ordering::Relaxed);
        f.debug_struct("RawLatch")
            .field("exclusive", &(s & EXCLUSIVE != 0))
            .field("shared", &(s & SHARED_MASK))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn shared_excludes_exclusive() {
        let l = RawLatch::new();
        assert!(l.try_acquire_shared());
        assert!(l.try_acquire_shared());
        assert!(!l.try_acquire_exclusive());
        l.release_shared();
        assert!(!l.try_acquire_exclusive());
        l.release_shared();
        assert!(l.try_acquire_exclusive());
        assert!(!l.try_acquire_shared());
        l.release_exclusive();
        assert_eq!(l.raw_state(), 0);
    }

    #[test]
    fn upgrade_requires_sole_holder() {
        let l = RawLatch::new();
        l.acquire_shared();
        l.acquire_shared();
        assert!(!l.try_upgrade());
        l.release_shared();
        assert!(l.try_upgrade());
        l.release_exclusive();
    }

    #[test]
    fn downgrade_keeps_hold() {
        let l = RawLatch::new();
        l.acquire_exclusive();
        l.downgrade();
        assert!(l.try_acquire_shared());
        assert!(!l.try_acquire_exclusive());
        l.release_shared();
        l.release_shared();
        assert!(l.try_acquire_exclusive());
        l.release_exclusive();
    }

    #[test]
    fn exclusive_timeout_expires() {
        let l = RawLatch::new();
        l.acquire_shared();
        assert!(!l.acquire_exclusive_timeout(Duration::from_millis(20)));
        l.release_shared();
        assert!(l.acquire_exclusive_timeout(Duration::from_millis(20)));
        l.release_exclusive();
    }

    #[test]
    fn pending_exclusive_denies_new_shared() {
        let l = Arc::new(RawLatch::new());
        l.acquire_shared();
        let l2 = l.clone();
        let h = std::thread::spawn(move || {
            l2.acquire_exclusive();
            l2.release_exclusive();
        });
        // Wait for the writer to raise the request bit.
        for _ in 0..1000 {
            if l.raw_state() & super::EXCLUSIVE != 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!l.try_acquire_shared());
        l.release_shared();
        h.join().unwrap();
        assert!(l.try_acquire_shared());
        l.release_shared();
    }

    #[test]
    fn contended_acquires_never_overlap() {
        use std::sync::atomic::AtomicI32;

        let latch = Arc::new(RawLatch::new());
        let holders = Arc::new(AtomicI32::new(0));
        let mut handles = Vec::new();
        for worker in 0..8 {
            let latch = latch.clone();
            let holders = holders.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    if (worker + i) % 3 == 0 {
                        latch.acquire_exclusive();
                        // An exclusive holder must be alone.
                        assert_eq!(holders.fetch_add(100, Ordering::SeqCst), 0);
                        assert_eq!(holders.fetch_sub(100, Ordering::SeqCst), 100);
                        latch.release_exclusive();
                    } else {
                        latch.acquire_shared();
                        let n = holders.fetch_add(1, Ordering::SeqCst);
                        assert!(n >= 0, "shared overlapped an exclusive");
                        holders.fetch_sub(1, Ordering::SeqCst);
                        latch.release_shared();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(holders.load(Ordering::SeqCst), 0);
        assert_eq!(latch.raw_state(), 0);
    }
}

pub mod commit_lock;
pub mod latch;

pub use commit_lock::{CommitExclusiveGuard, CommitLock, CommitSharedGuard};
pub use latch::RawLatch;

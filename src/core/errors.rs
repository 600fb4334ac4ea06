use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TuplError>;

#[derive(Debug, Error)]
pub enum TuplError {
    /// A structural invariant was violated on disk. Fatal to the open
    /// database.
    #[error("corrupt database: {0}")]
    CorruptDatabase(String),

    /// No more page ids, or the configured limit was reached.
    #[error("database full")]
    DatabaseFull,

    /// Operation attempted against a closed instance. Carries the panic
    /// cause when the close itself was caused by a failure.
    #[error("database closed{}", .cause.as_deref().map(|c| format!(": {c}")).unwrap_or_default())]
    DatabaseClosed { cause: Option<String> },

    /// Could not evict enough nodes to satisfy an allocation.
    #[error("node cache exhausted")]
    CacheExhausted,

    /// A formerly-open index has been dropped or closed.
    #[error("index closed")]
    ClosedIndex,

    #[error("lock acquisition timed out")]
    LockTimeout,

    #[error("deadlock detected")]
    DeadlockDetected,

    /// Value exceeds the reconstructable limit for the configured page size.
    #[error("value too large: {0} bytes")]
    LargeValue(usize),

    /// Key exceeds the reconstructable limit for the configured page size.
    #[error("key too large: {0} bytes")]
    LargeKey(usize),

    /// Write attempted on a replica.
    #[error("replica is unmodifiable")]
    UnmodifiableReplica,

    /// A parked acquire was interrupted.
    #[error("interrupted while waiting")]
    Interrupted,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TuplError {
    /// Whether the error leaves the database usable. Non-recoverable errors
    /// panic-close the instance.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TuplError::LockTimeout
                | TuplError::DeadlockDetected
                | TuplError::ClosedIndex
                | TuplError::LargeValue(_)
                | TuplError::LargeKey(_)
                | TuplError::Interrupted
                | TuplError::CacheExhausted
        )
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct StorageError(pub String);

//! Database configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::core::errors::{Result, StorageError};

/// How hard a committed transaction is pushed toward the disk before the
/// commit call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Redo record written and fsynced.
    Sync,
    /// Redo record written to the OS, not fsynced.
    NoSync,
    /// Redo record buffered in process memory until a checkpoint or an
    /// explicit sync.
    NoFlush,
    /// No redo log at all; durability comes from checkpoints alone.
    NoRedo,
}

/// Hook for application-defined operations carried through the redo and
/// undo logs.
pub trait CustomHandler: Send + Sync {
    /// Reapply the operation during recovery.
    fn redo(&self, payload: &[u8]) -> Result<()>;
    /// Reverse the operation during rollback.
    fn undo(&self, payload: &[u8]) -> Result<()>;
}

#[derive(Clone)]
pub struct Config {
    pub(crate) base_path: Option<PathBuf>,
    pub(crate) data_path: Option<PathBuf>,
    pub(crate) page_size: usize,
    pub(crate) min_cache_bytes: usize,
    pub(crate) max_cache_bytes: usize,
    pub(crate) durability: DurabilityMode,
    pub(crate) lock_timeout: Duration,
    pub(crate) checkpoint_interval: Duration,
    pub(crate) checkpoint_size_threshold: u64,
    pub(crate) cache_priming: bool,
    pub(crate) read_only: bool,
    pub(crate) custom_handler: Option<Arc<dyn CustomHandler>>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("base_path", &self.base_path)
            .field("page_size", &self.page_size)
            .field("max_cache_bytes", &self.max_cache_bytes)
            .field("durability", &self.durability)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_path: None,
            data_path: None,
            page_size: 4096,
            min_cache_bytes: 1 << 20,
            max_cache_bytes: 64 << 20,
            durability: DurabilityMode::Sync,
            lock_timeout: Duration::from_secs(10),
            checkpoint_interval: Duration::from_secs(1),
            checkpoint_size_threshold: 64 << 20,
            cache_priming: false,
            read_only: false,
            custom_handler: None,
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    /// Base path for all files; without one the database is non-durable
    /// and lives entirely in the cache.
    pub fn base_path(mut self, path: impl Into<PathBuf>) -> Config {
        self.base_path = Some(path.into());
        self
    }

    /// Override for the data file location (defaults to `<base>.db`).
    pub fn data_path(mut self, path: impl Into<PathBuf>) -> Config {
        self.data_path = Some(path.into());
        self
    }

    /// Page size in bytes: a power of two between 512 and 65536.
    pub fn page_size(mut self, size: usize) -> Config {
        self.page_size = size;
        self
    }

    pub fn cache_size(mut self, min_bytes: usize, max_bytes: usize) -> Config {
        self.min_cache_bytes = min_bytes;
        self.max_cache_bytes = max_bytes;
        self
    }

    pub fn durability(mut self, mode: DurabilityMode) -> Config {
        self.durability = mode;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Config {
        self.lock_timeout = timeout;
        self
    }

    pub fn checkpoint_interval(mut self, interval: Duration) -> Config {
        self.checkpoint_interval = interval;
        self
    }

    /// Redo size that triggers rotation at the next checkpoint.
    pub fn checkpoint_size_threshold(mut self, bytes: u64) -> Config {
        self.checkpoint_size_threshold = bytes;
        self
    }

    pub fn cache_priming(mut self, enabled: bool) -> Config {
        self.cache_priming = enabled;
        self
    }

    pub fn read_only(mut self, enabled: bool) -> Config {
        self.read_only = enabled;
        self
    }

    pub fn custom_handler(mut self, handler: Arc<dyn CustomHandler>) -> Config {
        self.custom_handler = Some(handler);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(512..=65536).contains(&self.page_size) || !self.page_size.is_power_of_two() {
            return Err(StorageError(format!(
                "page size must be a power of two in 512..=65536, got {}",
                self.page_size
            ))
            .into());
        }
        if self.min_cache_bytes > self.max_cache_bytes {
            return Err(StorageError("min cache size exceeds max".into()).into());
        }
        if self.max_cache_bytes / self.page_size < 8 {
            return Err(StorageError("cache must hold at least 8 pages".into()).into());
        }
        if self.read_only && self.base_path.is_none() {
            return Err(StorageError("read-only requires a base path".into()).into());
        }
        Ok(())
    }

    pub(crate) fn resolved_data_path(&self) -> Option<PathBuf> {
        match (&self.data_path, &self.base_path) {
            (Some(data), _) => Some(data.clone()),
            (None, Some(base)) => {
                let mut name = base
                    .file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_default();
                name.push(".db");
                Some(base.with_file_name(name))
            }
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn bad_page_sizes_are_rejected()  {
        assert!(Config::default().page_size(1000).validate().is_err());
        assert!(Config::default().page_size(256).validate().is_err());
        assert!(Config::default().page_size(131072).validate().is_err());
        Config::default().page_size(512).validate().unwrap();
    }

    #[test]
    fn data_path_derives_from_base() {
        let c = Config::default().base_path("/tmp/foo/bar");
        assert_eq!(
            c.resolved_data_path().unwrap(),
            PathBuf::from("/tmp/foo/bar.db")
        );
    }
}

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{Result, TetherError};
use crate::store::TetherDb;

/// Configuration for a `TetherDb` store
#[derive(Debug, Clone)]
pub struct Config {
    /// Backing file path (file backing only)
    pub filename: Option<PathBuf>,

    /// Volatile memory arena (true) vs. persistent file backing (false)
    pub in_memory: bool,

    /// Initial arena size as a percentage of available memory (default: 25)
    pub ram_percentage: u8,

    /// Retry count for transient IO failures (default: 3)
    pub max_retries: u32,

    /// Backoff between retries (default: 100ms)
    pub retry_delay: Duration,

    /// Bound on waiting for the shared lease to drain (default: 5s)
    pub lock_timeout: Duration,

    /// Cadence of fallback full scans (default: 1h)
    pub cleanup_interval: Duration,

    /// Cadence of TTL heap sweeps (default: 10s)
    pub ttl_check_interval: Duration,

    /// Page cache capacity in pages (default: 32)
    pub btree_cachesize: usize,

    /// Page size in bytes (default: 512)
    pub btree_pagesize: usize,

    /// Scale the flush threshold with lifetime operation count (default: true)
    pub adaptive_threshold: bool,

    /// Optional queue deadline for each operation (default: none)
    pub op_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            filename: None,
            in_memory: true,
            ram_percentage: 25,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            lock_timeout: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(3600),
            ttl_check_interval: Duration::from_secs(10),
            btree_cachesize: 32,
            btree_pagesize: 512,
            adaptive_threshold: true,
            op_timeout: None,
        }
    }
}

impl Config {
    /// Validate configuration values
    pub(crate) fn validate(&self) -> Result<()> {
        if !self.in_memory && self.filename.is_none() {
            return Err(TetherError::Encoding(
                "filename is required for file-backed storage".into(),
            ));
        }

        if self.ram_percentage == 0 || self.ram_percentage > 100 {
            return Err(TetherError::Encoding("ram_percentage must be in 1..=100".into()));
        }

        if self.btree_pagesize < 256 || self.btree_pagesize > 65536 {
            return Err(TetherError::Encoding("btree_pagesize must be in 256..=65536".into()));
        }

        if self.btree_cachesize < 8 {
            return Err(TetherError::Encoding("btree_cachesize must be at least 8 pages".into()));
        }

        Ok(())
    }

    /// Memory arenas tolerate a laxer time-based flush cadence than files.
    pub(crate) fn auto_flush(&self) -> Duration {
        if self.in_memory { Duration::from_secs(10) } else { Duration::from_secs(5) }
    }
}

/// Builder for configuring and opening a `TetherDb` store
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    /// Use a persistent file backing at the given path
    ///
    /// Implies `in_memory = false`.
    pub fn filename(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.filename = Some(path.into());
        self.config.in_memory = false;
        self
    }

    /// Set the initial memory arena size as a percentage of available memory
    ///
    /// Only meaningful for the in-memory backing. The arena grows past its
    /// initial size if writes demand it.
    ///
    /// Default: 25
    pub fn ram_percentage(mut self, percentage: u8) -> Self {
        self.config.ram_percentage = percentage;
        self
    }

    /// Set the retry count for transient IO failures
    ///
    /// Default: 3
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set the backoff between IO retries
    ///
    /// Default: 100ms
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    /// Set how long a mutation may wait for in-flight reads to drain
    ///
    /// Default: 5s
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    /// Set the cadence of the fallback full scan that reconciles TTL side
    /// entries with live records
    ///
    /// Default: 1h
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    /// Set the cadence of incremental TTL heap sweeps
    ///
    /// Default: 10s
    pub fn ttl_check_interval(mut self, interval: Duration) -> Self {
        self.config.ttl_check_interval = interval;
        self
    }

    /// Set the page cache capacity in pages
    ///
    /// Default: 32 pages
    /// Minimum: 8 pages
    pub fn btree_cachesize(mut self, pages: usize) -> Self {
        self.config.btree_cachesize = pages;
        self
    }

    /// Set the page size in bytes
    ///
    /// Larger pages fit more entries inline but waste space for small
    /// documents.
    ///
    /// Default: 512
    pub fn btree_pagesize(mut self, bytes: usize) -> Self {
        self.config.btree_pagesize = bytes;
        self
    }

    /// Enable or disable the adaptive flush threshold ladder
    ///
    /// Default: true
    pub fn adaptive_threshold(mut self, enabled: bool) -> Self {
        self.config.adaptive_threshold = enabled;
        self
    }

    /// Set an optional deadline for queued operations
    ///
    /// Operations still waiting in the worker queue past their deadline
    /// resolve with `TetherError::Timeout` without touching storage.
    ///
    /// Default: none
    pub fn op_timeout(mut self, timeout: Duration) -> Self {
        self.config.op_timeout = Some(timeout);
        self
    }

    /// Open the store with the configured settings
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - The backing cannot be created or opened
    /// - The backing contains a structurally invalid tree
    pub async fn open(self) -> Result<TetherDb> {
        self.config.validate()?;
        TetherDb::open_with_config(self.config).await
    }
}

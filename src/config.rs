//! Configuration for eventlog
//!
//! Centralized configuration with sensible defaults. Collaborators that
//! would otherwise be process-wide (stream hashing, access policy) are
//! passed in here so every engine instance is self-contained.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::access::{AccessPolicy, AllowAll};
use crate::index::{StreamHasher, XxStreamHasher};

/// Main configuration for an eventlog instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── writer.chk / chaser.chk / epoch.chk
    ///     ├── chunks/          (chunk-NNNNNN.VVVVVV files)
    ///     └── index/           (indexmap manifest + *.ptable files)
    pub data_dir: PathBuf,

    // -------------------------------------------------------------------------
    // Log Configuration
    // -------------------------------------------------------------------------
    /// Logical data capacity of a single chunk (bytes)
    pub chunk_size: u32,

    /// How durable a log flush is
    pub sync_strategy: SyncStrategy,

    // -------------------------------------------------------------------------
    // Index Configuration
    // -------------------------------------------------------------------------
    /// Entries in the memtable before it is frozen and flushed to a PTable
    pub memtable_max_entries: usize,

    /// Tables per level before they are merged into the next level
    pub max_tables_per_level: usize,

    /// Every Nth PTable entry is cached as a midpoint
    pub midpoint_interval: usize,

    /// Verify PTable checksums when opening them
    pub verify_ptables: bool,

    /// Verify sealed chunk checksums on startup
    pub verify_chunks: bool,

    /// Pending flush tasks before the chaser blocks (backpressure)
    pub index_task_queue: usize,

    /// Hash used to key streams in the index
    pub hasher: Arc<dyn StreamHasher>,

    // -------------------------------------------------------------------------
    // Write Path Configuration
    // -------------------------------------------------------------------------
    /// How long a write waits for its commit to be indexed (milliseconds)
    pub commit_timeout_ms: u64,

    /// How long open() waits for the log replay (milliseconds)
    pub recovery_timeout_ms: u64,

    /// Access policy consulted before each operation
    pub access: Arc<dyn AccessPolicy>,

    // -------------------------------------------------------------------------
    // Bus Configuration
    // -------------------------------------------------------------------------
    /// Handlers slower than this are traced (milliseconds)
    pub slow_message_threshold_ms: u64,
}

/// Log sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// fsync the active chunk and checkpoint on every flush (safest)
    EveryWrite,

    /// Hand bytes to the OS without fsync (tests, benchmarks)
    OsBuffered,
}

impl SyncStrategy {
    pub fn is_durable(&self) -> bool {
        matches!(self, SyncStrategy::EveryWrite)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./eventlog_data"),
            chunk_size: 256 * 1024 * 1024, // 256 MB
            sync_strategy: SyncStrategy::EveryWrite,
            memtable_max_entries: 1_000_000,
            max_tables_per_level: 4,
            midpoint_interval: 64,
            verify_ptables: true,
            verify_chunks: true,
            index_task_queue: 8,
            hasher: Arc::new(XxStreamHasher),
            commit_timeout_ms: 5000,
            recovery_timeout_ms: 10 * 60 * 1000,
            access: Arc::new(AllowAll),
            slow_message_threshold_ms: 48,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn slow_message_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_message_threshold_ms)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.chunk_size < 4096 {
            return Err(crate::StoreError::Config(format!(
                "chunk_size must be at least 4096 bytes, got {}",
                self.chunk_size
            )));
        }
        if self.memtable_max_entries == 0 {
            return Err(crate::StoreError::Config(
                "memtable_max_entries must be positive".to_string(),
            ));
        }
        if self.max_tables_per_level < 2 {
            return Err(crate::StoreError::Config(format!(
                "max_tables_per_level must be at least 2, got {}",
                self.max_tables_per_level
            )));
        }
        if self.midpoint_interval == 0 {
            return Err(crate::StoreError::Config(
                "midpoint_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the chunk size (in bytes)
    pub fn chunk_size(mut self, size: u32) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set the log sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Set the memtable flush threshold (entries)
    pub fn memtable_max_entries(mut self, count: usize) -> Self {
        self.config.memtable_max_entries = count;
        self
    }

    /// Set the merge fan-in
    pub fn max_tables_per_level(mut self, count: usize) -> Self {
        self.config.max_tables_per_level = count;
        self
    }

    pub fn midpoint_interval(mut self, interval: usize) -> Self {
        self.config.midpoint_interval = interval;
        self
    }

    pub fn verify_ptables(mut self, verify: bool) -> Self {
        self.config.verify_ptables = verify;
        self
    }

    pub fn verify_chunks(mut self, verify: bool) -> Self {
        self.config.verify_chunks = verify;
        self
    }

    pub fn index_task_queue(mut self, capacity: usize) -> Self {
        self.config.index_task_queue = capacity;
        self
    }

    /// Set the stream hash function
    pub fn hasher(mut self, hasher: Arc<dyn StreamHasher>) -> Self {
        self.config.hasher = hasher;
        self
    }

    /// Set the commit timeout (in milliseconds)
    pub fn commit_timeout_ms(mut self, ms: u64) -> Self {
        self.config.commit_timeout_ms = ms;
        self
    }

    /// Set the recovery timeout (in milliseconds)
    pub fn recovery_timeout_ms(mut self, ms: u64) -> Self {
        self.config.recovery_timeout_ms = ms;
        self
    }

    /// Set the access policy
    pub fn access(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.config.access = policy;
        self
    }

    pub fn slow_message_threshold_ms(mut self, ms: u64) -> Self {
        self.config.slow_message_threshold_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

//! Engine Module
//!
//! Wires the log, the index and the storage services together and owns
//! their lifecycle.
//!
//! ## Responsibilities
//! - Recover the log and index on startup
//! - Replay committed transactions the index has not seen
//! - Check access before every operation
//! - Start subscriptions fed by the chaser
//! - Shut background workers down in order on close

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::access::Operation;
use crate::bus::Bus;
use crate::checkpoint::Checkpoints;
use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::index::{PositionOracle, TableIndex};
use crate::log::{ChunkedLog, RecoveryReport};
use crate::storage::{
    is_metastream, ChaserProgress, HaltFlag, ReadIndex, ScavengeReport, Scavenger,
    StorageChaser, StorageWriter, StreamMetadata,
};
use crate::subscription::{Subscription, SubscriptionKind, SubscriptionTarget};
use crate::types::{
    AllSlice, DeleteMode, ExpectedVersion, NewEvent, ReadEventResult, RecordedEvent, StreamHead,
    StreamSlice, WriteResult,
};

/// Pseudo stream name access to the whole log is checked against
pub const ALL_STREAM: &str = "$all";

/// Point-in-time engine counters
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub writer_position: i64,
    pub chaser_position: i64,
    pub chunk_count: usize,
    pub memtable_entries: usize,
    pub frozen_memtables: usize,
    pub tables_per_level: Vec<usize>,
    pub index_generation: u64,
    pub index_commit_checkpoint: i64,
}

/// The event store
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader
///
/// - **Writes** (append/delete/metadata): serialized inside `StorageWriter`
/// - **Indexing**: one chaser thread plus one index worker thread
/// - **Reads**: lock-free against an `Arc` index snapshot; only the chunk
///   file handle is locked per record read
pub struct Engine {
    config: Config,
    checkpoints: Checkpoints,
    bus: Arc<Bus>,
    log: Arc<ChunkedLog>,
    index: Arc<TableIndex>,
    chaser: Arc<StorageChaser>,
    read_index: Arc<ReadIndex>,
    writer: StorageWriter,
    recovery: RecoveryReport,
    closed: AtomicBool,
}

impl Engine {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const CHUNK_DIR: &'static str = "chunks";
    const INDEX_DIR: &'static str = "index";

    /// Open or create an engine with the given config
    ///
    /// On startup:
    /// 1. Open checkpoints
    /// 2. Recover the log (truncate torn tails to the writer checkpoint)
    /// 3. Load the index map (discard it if it is ahead of the log)
    /// 4. Replay the log from min(chaser checkpoint, index checkpoint)
    /// 5. Ready to serve requests
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let durable = config.sync_strategy.is_durable();

        // Step 1: Checkpoints live at the root of the data directory
        let checkpoints = Checkpoints::open(&config.data_dir, durable)?;
        let bus = Arc::new(Bus::new("engine", config.slow_message_threshold()));

        // Step 2: Log recovery
        let (log, recovery) = ChunkedLog::open(
            &config.data_dir.join(Self::CHUNK_DIR),
            config.chunk_size,
            durable,
            Arc::clone(&checkpoints.writer),
        )?;
        let log = Arc::new(log);
        if config.verify_chunks {
            let verified = log.verify_sealed()?;
            tracing::debug!(verified, "Sealed chunks verified");
        }
        tracing::info!(
            chunks = recovery.chunks,
            writer_position = recovery.writer_position,
            truncated_bytes = recovery.truncated_bytes,
            "Log recovered"
        );

        // Step 3: Index
        let oracle: Arc<dyn PositionOracle> = log.clone();
        let index = Arc::new(TableIndex::open(
            &config.data_dir.join(Self::INDEX_DIR),
            &config,
            oracle,
            Arc::clone(&bus),
            log.flushed_position(),
        )?);

        // Step 4: Replay
        let end = log.flushed_position();
        let replay_from = checkpoints
            .chaser
            .read()
            .min(index.commit_checkpoint())
            .clamp(0, end);
        tracing::info!(replay_from, end, "Replaying log into the index");

        let progress = Arc::new(ChaserProgress::new(replay_from));
        let chaser = Arc::new(StorageChaser::start(
            Arc::clone(&log),
            Arc::clone(&index),
            Arc::clone(&config.hasher),
            Arc::clone(&checkpoints.chaser),
            Arc::clone(&bus),
            Arc::clone(&progress),
            replay_from,
        )?);
        chaser.wake();
        progress.wait_for(end, config.recovery_timeout())?;

        let read_index = Arc::new(ReadIndex::new(
            Arc::clone(&log),
            Arc::clone(&index),
            Arc::clone(&config.hasher),
            Arc::clone(&progress),
        ));
        let writer = StorageWriter::new(
            Arc::clone(&log),
            Arc::clone(&read_index),
            Arc::clone(&chaser),
            Arc::clone(&bus),
            Arc::new(HaltFlag::new()),
            config.commit_timeout(),
        );

        tracing::info!(data_dir = %config.data_dir.display(), "Engine ready");
        Ok(Self {
            config,
            checkpoints,
            bus,
            log,
            index,
            chaser,
            read_index,
            writer,
            recovery,
            closed: AtomicBool::new(false),
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    /// Close the engine gracefully
    ///
    /// Indexes everything flushed, writes the memtable to a PTable and
    /// syncs the checkpoints
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.chaser.stop();
        let flushed = self.index.flush();
        self.index.shutdown();
        flushed?;
        self.checkpoints.flush_all()?;
        tracing::info!("Engine closed");
        Ok(())
    }

    fn authorize(&self, stream: &str, operation: Operation) -> Result<()> {
        if self.config.access.check(stream, operation) {
            Ok(())
        } else {
            tracing::debug!(stream, ?operation, "Access denied");
            Err(StoreError::AccessDenied(stream.to_string()))
        }
    }

    fn validate_stream(stream: &str) -> Result<()> {
        if stream.is_empty() {
            return Err(StoreError::InvalidArgument("stream name is empty".to_string()));
        }
        if is_metastream(stream) {
            return Err(StoreError::InvalidArgument(format!(
                "'{}' is a metadata stream; use set_stream_metadata",
                stream
            )));
        }
        Ok(())
    }

    fn read_operation(stream: &str) -> Operation {
        if is_metastream(stream) {
            Operation::MetadataRead
        } else {
            Operation::Read
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Append events to a stream as one transaction
    pub fn append(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: &[NewEvent],
    ) -> Result<WriteResult> {
        Self::validate_stream(stream)?;
        self.authorize(stream, Operation::Write)?;
        self.writer.append(stream, expected, events)
    }

    /// Delete a stream; returns the log position of the delete
    pub fn delete_stream(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        mode: DeleteMode,
    ) -> Result<i64> {
        Self::validate_stream(stream)?;
        self.authorize(stream, Operation::Delete)?;
        match mode {
            DeleteMode::Hard => self.writer.hard_delete(stream, expected),
            DeleteMode::Soft => self.writer.soft_delete(stream, expected),
        }
    }

    /// Replace a stream's retention settings
    pub fn set_stream_metadata(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        metadata: &StreamMetadata,
    ) -> Result<WriteResult> {
        Self::validate_stream(stream)?;
        self.authorize(stream, Operation::MetadataWrite)?;
        self.writer.set_metadata(stream, expected, metadata)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn stream_metadata(&self, stream: &str) -> Result<StreamMetadata> {
        self.authorize(stream, Operation::MetadataRead)?;
        self.read_index.stream_metadata(stream)
    }

    /// Read one event; -1 reads the last one
    pub fn read_event(&self, stream: &str, event_number: i64) -> Result<ReadEventResult> {
        self.authorize(stream, Self::read_operation(stream))?;
        self.read_index.read_event(stream, event_number)
    }

    pub fn read_stream_forward(
        &self,
        stream: &str,
        from: i64,
        max_count: usize,
    ) -> Result<StreamSlice> {
        self.authorize(stream, Self::read_operation(stream))?;
        self.read_index.read_stream_forward(stream, from, max_count)
    }

    /// Read backward from `from`; -1 starts at the last event
    pub fn read_stream_backward(
        &self,
        stream: &str,
        from: i64,
        max_count: usize,
    ) -> Result<StreamSlice> {
        self.authorize(stream, Self::read_operation(stream))?;
        self.read_index.read_stream_backward(stream, from, max_count)
    }

    pub fn last_event_number(&self, stream: &str) -> Result<StreamHead> {
        self.authorize(stream, Self::read_operation(stream))?;
        self.read_index.last_event_number(stream)
    }

    /// Committed events across all streams in commit order
    pub fn read_all_forward(&self, position: i64, max_count: usize) -> Result<AllSlice> {
        self.authorize(ALL_STREAM, Operation::Read)?;
        self.read_index.read_all_forward(position, max_count)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Deliver events of one stream to `handler` on a dedicated thread
    pub fn subscribe_to_stream<F>(
        &self,
        stream: &str,
        kind: SubscriptionKind,
        handler: F,
    ) -> Result<Subscription>
    where
        F: FnMut(&RecordedEvent) + Send + 'static,
    {
        if stream.is_empty() {
            return Err(StoreError::InvalidArgument("stream name is empty".to_string()));
        }
        self.authorize(stream, Self::read_operation(stream))?;
        Subscription::start(
            Arc::clone(&self.bus),
            Arc::clone(&self.read_index),
            SubscriptionTarget::Stream(stream.to_string()),
            kind,
            Box::new(handler),
        )
    }

    /// Deliver events of every stream, in commit order
    pub fn subscribe_to_all<F>(&self, kind: SubscriptionKind, handler: F) -> Result<Subscription>
    where
        F: FnMut(&RecordedEvent) + Send + 'static,
    {
        self.authorize(ALL_STREAM, Operation::Read)?;
        Subscription::start(
            Arc::clone(&self.bus),
            Arc::clone(&self.read_index),
            SubscriptionTarget::All,
            kind,
            Box::new(handler),
        )
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Compact sealed chunks. Writes wait while it runs.
    pub fn scavenge(&self) -> Result<ScavengeReport> {
        let _guard = self.writer.lock()?;
        tracing::info!("Scavenge started");
        Scavenger::new(&self.log, &self.read_index, &self.bus).run()
    }

    /// Index everything flushed, then write the memtable to a PTable
    pub fn flush_index(&self) -> Result<()> {
        self.chaser
            .progress()
            .wait_for(self.log.flushed_position(), self.config.commit_timeout())?;
        self.index.flush()
    }

    /// Wait until every flushed commit is indexed and background index
    /// work (flushes, merges) has drained
    pub fn wait_for_index(&self) -> Result<()> {
        self.chaser
            .progress()
            .wait_for(self.log.flushed_position(), self.config.commit_timeout())?;
        self.index.wait_for_idle()
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn stats(&self) -> EngineStats {
        let index = self.index.stats();
        EngineStats {
            writer_position: self.log.writer_position(),
            chaser_position: self.chaser.progress().position(),
            chunk_count: self.log.chunk_count(),
            memtable_entries: index.memtable_entries,
            frozen_memtables: index.frozen_memtables,
            tables_per_level: index.tables_per_level,
            index_generation: index.generation,
            index_commit_checkpoint: index.commit_checkpoint,
        }
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// Check every sealed chunk against its footer checksum
    pub fn verify_chunks(&self) -> Result<usize> {
        self.log.verify_sealed()
    }

    /// What recovery found when the engine was opened
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "Engine shutdown failed");
        }
    }
}

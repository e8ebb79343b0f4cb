//! Scavenger
//!
//! Rewrites sealed chunks without the records no read can return any more:
//!
//! - prepares whose transaction never committed
//! - events of hard-deleted streams (the tombstone stays)
//! - events hidden by `max_count`, `max_age` or `truncate_before`
//! - superseded metadata events
//!
//! The last event of every stream is always kept so its version survives.
//! Surviving records keep their logical positions through the chunk's
//! position map, so index entries stay valid; entries for removed records
//! stop resolving and are dropped by later merges.

use std::collections::HashMap;
use std::fs;
use std::time::{Duration, Instant};

use crate::bus::{Bus, Message};
use crate::error::Result;
use crate::log::{Chunk, ChunkedLog, LogRecord, PrepareRecord, ScavengedChunkBuilder};
use crate::types::{now_millis, StreamHead};

use super::metadata::{is_metastream, StreamMetadata};
use super::read_index::ReadIndex;

/// What a scavenge pass did
#[derive(Debug, Clone, Default)]
pub struct ScavengeReport {
    pub chunks_scavenged: usize,
    pub records_kept: u64,
    pub records_removed: u64,
    pub bytes_reclaimed: u64,
    pub elapsed: Duration,
}

struct StreamState {
    head: StreamHead,
    metadata: StreamMetadata,
}

pub(crate) struct Scavenger<'a> {
    log: &'a ChunkedLog,
    read_index: &'a ReadIndex,
    bus: &'a Bus,
    now_ms: u64,
    /// Transaction position to first event number of every commit
    committed: HashMap<i64, i64>,
    streams: HashMap<String, StreamState>,
}

impl<'a> Scavenger<'a> {
    pub(crate) fn new(log: &'a ChunkedLog, read_index: &'a ReadIndex, bus: &'a Bus) -> Self {
        Self {
            log,
            read_index,
            bus,
            now_ms: now_millis(),
            committed: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    /// Scavenge every sealed chunk. The caller must hold the write lock.
    pub(crate) fn run(mut self) -> Result<ScavengeReport> {
        let start = Instant::now();
        let mut report = ScavengeReport::default();

        let end = self.log.flushed_position();
        for record in self.log.reader(0, end) {
            if let LogRecord::Commit(commit) = record? {
                self.committed
                    .insert(commit.transaction_position, commit.first_event_number);
            }
        }

        for chunk in self.log.chunks() {
            if !chunk.is_sealed() {
                continue;
            }
            self.scavenge_chunk(&chunk, &mut report)?;
        }

        report.elapsed = start.elapsed();
        tracing::info!(
            chunks = report.chunks_scavenged,
            kept = report.records_kept,
            removed = report.records_removed,
            bytes_reclaimed = report.bytes_reclaimed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Scavenge completed"
        );
        self.bus.publish(&Message::ScavengeCompleted {
            chunks: report.chunks_scavenged,
            records_removed: report.records_removed,
            elapsed_ms: report.elapsed.as_millis() as u64,
        });
        Ok(report)
    }

    fn scavenge_chunk(&mut self, chunk: &Chunk, report: &mut ScavengeReport) -> Result<()> {
        let mut kept: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut removed = 0usize;

        let mut local = 0u64;
        while let Some((record, next)) = chunk.read_next(local)? {
            let logical = (record.log_position() - chunk.base_position()) as u64;
            if self.should_keep(&record)? {
                kept.push((logical, record.encode()?));
            } else {
                removed += 1;
            }
            local = next;
        }

        if removed == 0 {
            report.records_kept += kept.len() as u64;
            return Ok(());
        }

        let mut builder = ScavengedChunkBuilder::new(
            self.log.dir(),
            chunk.number(),
            chunk.version() + 1,
            self.log.chunk_size(),
        )?;
        for (logical, frame) in &kept {
            if let Err(e) = builder.add(*logical, frame) {
                builder.discard();
                return Err(e);
            }
        }
        let path = builder.finish(chunk.logical_data_len())?;

        let old_size = fs::metadata(chunk.path()).map(|m| m.len()).unwrap_or(0);
        let new_size = fs::metadata(&path)?.len();
        let replacement = Chunk::open(&path)?;
        let version = replacement.version();
        self.log.replace_chunk(replacement)?;

        report.chunks_scavenged += 1;
        report.records_kept += kept.len() as u64;
        report.records_removed += removed as u64;
        report.bytes_reclaimed += old_size.saturating_sub(new_size);

        tracing::info!(
            chunk = chunk.number(),
            version,
            kept = kept.len(),
            removed,
            "Scavenged chunk"
        );
        self.bus.publish(&Message::ChunkScavenged {
            chunk_number: chunk.number(),
            version,
            kept: kept.len(),
            removed,
        });
        Ok(())
    }

    fn should_keep(&mut self, record: &LogRecord) -> Result<bool> {
        let prepare = match record {
            LogRecord::Commit(_) => return Ok(true),
            LogRecord::Prepare(prepare) => prepare,
        };
        let Some(&first) = self.committed.get(&prepare.transaction_position) else {
            return Ok(false);
        };
        if prepare.is_tombstone() {
            return Ok(true);
        }
        let event_number = first + prepare.transaction_offset as i64;
        self.keep_event(prepare, event_number)
    }

    fn keep_event(&mut self, prepare: &PrepareRecord, event_number: i64) -> Result<bool> {
        let now_ms = self.now_ms;
        let state = self.stream_state(&prepare.stream)?;
        let last = match state.head {
            StreamHead::Deleted => return Ok(false),
            StreamHead::NoStream => return Ok(true),
            StreamHead::At(last) => last,
        };

        if event_number >= last {
            return Ok(true);
        }
        if is_metastream(&prepare.stream) {
            return Ok(false);
        }
        let visible = event_number >= state.metadata.min_visible(last)
            && !state.metadata.is_expired(prepare.timestamp, now_ms);
        Ok(visible)
    }

    fn stream_state(&mut self, stream: &str) -> Result<&StreamState> {
        if !self.streams.contains_key(stream) {
            let state = StreamState {
                head: self.read_index.last_event_number(stream)?,
                metadata: self.read_index.stream_metadata(stream)?,
            };
            self.streams.insert(stream.to_string(), state);
        }
        Ok(&self.streams[stream])
    }
}

//! Storage Writer
//!
//! The single writer of the log. Each write is one transaction:
//!
//! ```text
//!   Prepare(e0, BEGIN|DATA) Prepare(e1, DATA) ... Prepare(en, DATA|END) Commit(first)
//!   └─ transaction_position ─────────────────────────────────────────┘
//! ```
//!
//! Writes are decided and appended under one lock, then wait outside it
//! for the chaser so concurrent writers can overlap their index waits.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};

use crate::bus::{Bus, Message};
use crate::error::{Result, StoreError};
use crate::log::{ChunkedLog, CommitRecord, LogRecord, PrepareFlags, PrepareRecord};
use crate::types::{now_millis, ExpectedVersion, NewEvent, WriteResult, DELETED_STREAM_VERSION};

use super::chaser::{ChaserProgress, StorageChaser};
use super::metadata::{metastream_of, StreamMetadata, METADATA_EVENT_TYPE, TOMBSTONE_EVENT_TYPE};
use super::read_index::{CommitDecision, ReadIndex};
use super::HaltFlag;

pub struct StorageWriter {
    log: Arc<ChunkedLog>,
    read_index: Arc<ReadIndex>,
    chaser: Arc<StorageChaser>,
    bus: Arc<Bus>,
    halt: Arc<HaltFlag>,
    commit_timeout: Duration,
    write_lock: Mutex<()>,
}

impl StorageWriter {
    pub fn new(
        log: Arc<ChunkedLog>,
        read_index: Arc<ReadIndex>,
        chaser: Arc<StorageChaser>,
        bus: Arc<Bus>,
        halt: Arc<HaltFlag>,
        commit_timeout: Duration,
    ) -> Self {
        Self {
            log,
            read_index,
            chaser,
            bus,
            halt,
            commit_timeout,
            write_lock: Mutex::new(()),
        }
    }

    fn progress(&self) -> &Arc<ChaserProgress> {
        self.chaser.progress()
    }

    /// Take the write lock once every flushed commit is indexed, so the
    /// decision sees the latest stream state
    fn lock_caught_up(&self) -> Result<MutexGuard<'_, ()>> {
        self.halt.check()?;
        let guard = self.write_lock.lock();
        self.progress()
            .wait_for(self.log.flushed_position(), self.commit_timeout)?;
        Ok(guard)
    }

    /// Lock out writes (used by the scavenger)
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock_caught_up()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Append `events` to `stream` if `expected` holds
    pub fn append(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: &[NewEvent],
    ) -> Result<WriteResult> {
        if events.is_empty() {
            return Err(StoreError::InvalidArgument(
                "a write needs at least one event".to_string(),
            ));
        }

        let (result, end) = {
            let _guard = self.lock_caught_up()?;
            match self.read_index.check_append(stream, expected, events)? {
                CommitDecision::Proceed { first_event_number } => {
                    self.commit_locked(stream, expected, events, first_event_number, PrepareFlags::NONE)?
                }
                CommitDecision::Idempotent(result) => {
                    tracing::debug!(stream, position = result.log_position, "Idempotent write");
                    return Ok(result);
                }
                CommitDecision::WrongExpectedVersion(actual) => {
                    return Err(StoreError::WrongExpectedVersion {
                        stream: stream.to_string(),
                        expected,
                        actual,
                    })
                }
                CommitDecision::StreamDeleted => {
                    return Err(StoreError::StreamDeleted(stream.to_string()))
                }
            }
        };

        self.wait_indexed(end)?;
        self.bus.publish(&Message::WriteCompleted {
            stream: stream.to_string(),
            first_event_number: result.next_expected_version - events.len() as i64 + 1,
            last_event_number: result.next_expected_version,
            log_position: result.log_position,
        });
        Ok(result)
    }

    /// Write a tombstone; the stream can never be written again
    pub fn hard_delete(&self, stream: &str, expected: ExpectedVersion) -> Result<i64> {
        let (position, end) = {
            let _guard = self.lock_caught_up()?;
            self.read_index.check_delete(stream, expected)?;
            let tombstone = NewEvent::new(TOMBSTONE_EVENT_TYPE, Bytes::new());
            let (result, end) = self.commit_locked(
                stream,
                expected,
                std::slice::from_ref(&tombstone),
                DELETED_STREAM_VERSION,
                PrepareFlags::STREAM_DELETE,
            )?;
            (result.log_position, end)
        };

        self.wait_indexed(end)?;
        tracing::info!(stream, position, "Stream hard deleted");
        self.bus.publish(&Message::StreamDeleted {
            stream: stream.to_string(),
            hard: true,
            log_position: position,
        });
        Ok(position)
    }

    /// Hide every current event by truncating the stream; it can be
    /// written again afterwards
    pub fn soft_delete(&self, stream: &str, expected: ExpectedVersion) -> Result<i64> {
        let last = {
            let _guard = self.lock_caught_up()?;
            self.read_index.check_delete(stream, expected)?
        };
        let metadata = self
            .read_index
            .stream_metadata(stream)?
            .truncate_before(last + 1);
        let result = self.set_metadata(stream, ExpectedVersion::Any, &metadata)?;

        tracing::info!(stream, truncate_before = last + 1, "Stream soft deleted");
        self.bus.publish(&Message::StreamDeleted {
            stream: stream.to_string(),
            hard: false,
            log_position: result.log_position,
        });
        Ok(result.log_position)
    }

    /// Replace the stream's metadata
    pub fn set_metadata(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        metadata: &StreamMetadata,
    ) -> Result<WriteResult> {
        let event = NewEvent::new(METADATA_EVENT_TYPE, metadata.encode()?);
        self.append(&metastream_of(stream), expected, std::slice::from_ref(&event))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Append a transaction and its commit, then flush. Caller holds the
    /// write lock. Returns the result and the end position of the commit.
    fn commit_locked(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: &[NewEvent],
        first_event_number: i64,
        extra_flags: PrepareFlags,
    ) -> Result<(WriteResult, i64)> {
        let mut prepares = Self::build_prepares(stream, expected, events, extra_flags);
        for record in &prepares {
            let size = record.framed_size()?;
            if size > self.log.chunk_size() as usize {
                return Err(StoreError::InvalidArgument(format!(
                    "event of {} bytes does not fit in a {} byte chunk",
                    size,
                    self.log.chunk_size()
                )));
            }
        }

        match self.append_transaction(&mut prepares, first_event_number) {
            Ok(end) => {
                let next_expected_version = if extra_flags.contains(PrepareFlags::STREAM_DELETE) {
                    DELETED_STREAM_VERSION
                } else {
                    first_event_number + events.len() as i64 - 1
                };
                Ok((
                    WriteResult {
                        next_expected_version,
                        log_position: prepares[0].log_position(),
                    },
                    end,
                ))
            }
            Err(e) => {
                // The log may now hold a partial transaction; nothing more
                // can be appended safely
                let reason = format!("log append failed: {}", e);
                self.halt.halt(&reason);
                self.progress().halt(&reason);
                tracing::error!(stream, error = %e, "Writer halted");
                self.bus.publish(&Message::WriterHalted { reason });
                Err(e)
            }
        }
    }

    fn build_prepares(
        stream: &str,
        expected: ExpectedVersion,
        events: &[NewEvent],
        extra_flags: PrepareFlags,
    ) -> Vec<LogRecord> {
        let timestamp = now_millis();
        let last_offset = events.len() - 1;
        events
            .iter()
            .enumerate()
            .map(|(offset, event)| {
                let mut flags = PrepareFlags::DATA | extra_flags;
                if offset == 0 {
                    flags = flags | PrepareFlags::TRANSACTION_BEGIN;
                }
                if offset == last_offset {
                    flags = flags | PrepareFlags::TRANSACTION_END;
                }
                LogRecord::Prepare(PrepareRecord {
                    log_position: -1,
                    transaction_position: -1,
                    transaction_offset: offset as i32,
                    flags,
                    stream: stream.to_string(),
                    expected_version: expected.as_raw(),
                    event_id: event.event_id,
                    event_type: event.event_type.clone(),
                    data: event.data.clone(),
                    metadata: event.metadata.clone(),
                    timestamp,
                })
            })
            .collect()
    }

    /// Append prepares and their commit, flush, and return the end position
    fn append_transaction(&self, prepares: &mut [LogRecord], first_event_number: i64) -> Result<i64> {
        let mut transaction_position = -1;
        for record in prepares.iter_mut() {
            if let LogRecord::Prepare(prepare) = record {
                prepare.transaction_position = transaction_position;
            }
            let position = self.log.append(record)?;
            if transaction_position < 0 {
                transaction_position = position;
            }
        }

        let mut commit = LogRecord::Commit(CommitRecord {
            log_position: -1,
            transaction_position,
            first_event_number,
            timestamp: now_millis(),
        });
        self.log.append(&mut commit)?;
        let end = self.log.flush()?;
        self.chaser.wake();
        Ok(end)
    }

    fn wait_indexed(&self, end: i64) -> Result<()> {
        self.progress().wait_for(end, self.commit_timeout)
    }
}

impl std::fmt::Debug for StorageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWriter")
            .field("commit_timeout", &self.commit_timeout)
            .field("halted", &self.halt.is_halted())
            .finish()
    }
}

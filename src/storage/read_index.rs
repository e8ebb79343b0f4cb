//! Read Index
//!
//! Answers stream reads by resolving index candidates against the log.
//!
//! The index keys on stream hashes, so every candidate position is read
//! and its stream name compared before it is trusted. The newest source
//! that yields a matching record wins.

use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::index::{IndexSnapshot, StreamHasher, TableIndex};
use crate::log::{ChunkedLog, CommitRecord, LogRecord, PrepareRecord};
use crate::types::{
    now_millis, AllSlice, ExpectedVersion, NewEvent, ReadDirection, ReadEventResult,
    RecordedEvent, SliceStatus, StreamHead, StreamSlice, WriteResult, DELETED_STREAM_VERSION,
};

use super::chaser::ChaserProgress;
use super::metadata::{is_metastream, metastream_of, StreamMetadata};

/// Upper bound on the buffer reserved up front for a stream read
const MAX_PREALLOCATED_EVENTS: usize = 4096;

/// Outcome of checking a write against the current stream state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitDecision {
    /// Write the events starting at this event number
    Proceed { first_event_number: i64 },
    /// The same events are already committed
    Idempotent(WriteResult),
    WrongExpectedVersion(StreamHead),
    StreamDeleted,
}

pub struct ReadIndex {
    log: Arc<ChunkedLog>,
    index: Arc<TableIndex>,
    hasher: Arc<dyn StreamHasher>,
    progress: Arc<ChaserProgress>,
}

impl ReadIndex {
    pub fn new(
        log: Arc<ChunkedLog>,
        index: Arc<TableIndex>,
        hasher: Arc<dyn StreamHasher>,
        progress: Arc<ChaserProgress>,
    ) -> Self {
        Self {
            log,
            index,
            hasher,
            progress,
        }
    }

    /// Log position below which every commit is indexed and readable
    pub fn indexed_position(&self) -> i64 {
        self.progress.position()
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// The prepare at `position`, if it exists and belongs to `stream`
    fn prepare_at(&self, position: i64, stream: &str) -> Result<Option<PrepareRecord>> {
        match self.log.read(position) {
            Ok(LogRecord::Prepare(prepare)) if prepare.stream == stream => Ok(Some(prepare)),
            Ok(_) => Ok(None),
            // Scavenged away since it was indexed
            Err(StoreError::RecordNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// First candidate that resolves to `stream`
    fn resolve(&self, stream: &str, candidates: &[i64]) -> Result<Option<PrepareRecord>> {
        for &position in candidates {
            if let Some(prepare) = self.prepare_at(position, stream)? {
                return Ok(Some(prepare));
            }
        }
        Ok(None)
    }

    fn head_of(&self, snapshot: &IndexSnapshot, stream: &str) -> Result<(StreamHead, Option<PrepareRecord>)> {
        let hash = self.hasher.hash(stream);
        let Some(max) = snapshot.max_event_number(hash) else {
            return Ok((StreamHead::NoStream, None));
        };

        let to_head = |number: i64, prepare: PrepareRecord| {
            if prepare.is_tombstone() {
                (StreamHead::Deleted, Some(prepare))
            } else {
                (StreamHead::At(number), Some(prepare))
            }
        };

        if let Some(prepare) = self.resolve(stream, &snapshot.candidates(hash, max))? {
            return Ok(to_head(max, prepare));
        }

        // The highest number belongs to a colliding stream; walk down
        for (number, positions) in snapshot.range(hash, 0, max).iter().rev() {
            if let Some(prepare) = self.resolve(stream, positions)? {
                return Ok(to_head(*number, prepare));
            }
        }
        Ok((StreamHead::NoStream, None))
    }

    pub(crate) fn to_event(prepare: PrepareRecord, event_number: i64) -> RecordedEvent {
        RecordedEvent {
            stream: prepare.stream,
            event_number,
            event_id: prepare.event_id,
            event_type: prepare.event_type,
            data: prepare.data,
            metadata: prepare.metadata,
            log_position: prepare.log_position,
            timestamp: prepare.timestamp,
        }
    }

    // =========================================================================
    // Stream Reads
    // =========================================================================

    /// Last event number of a stream, confirmed against the log
    pub fn last_event_number(&self, stream: &str) -> Result<StreamHead> {
        let snapshot = self.index.snapshot();
        Ok(self.head_of(&snapshot, stream)?.0)
    }

    /// Current retention settings (defaults when none were written)
    pub fn stream_metadata(&self, stream: &str) -> Result<StreamMetadata> {
        if is_metastream(stream) {
            return Ok(StreamMetadata::default());
        }
        let snapshot = self.index.snapshot();
        match self.head_of(&snapshot, &metastream_of(stream))? {
            (StreamHead::At(_), Some(prepare)) => match StreamMetadata::decode(&prepare.data) {
                Ok(metadata) => Ok(metadata),
                Err(e) => {
                    tracing::warn!(stream, error = %e, "Ignoring unreadable stream metadata");
                    Ok(StreamMetadata::default())
                }
            },
            _ => Ok(StreamMetadata::default()),
        }
    }

    /// Read one event; -1 reads the last event
    pub fn read_event(&self, stream: &str, event_number: i64) -> Result<ReadEventResult> {
        if event_number < -1 {
            return Err(StoreError::InvalidArgument(format!(
                "Invalid event number {}",
                event_number
            )));
        }
        let snapshot = self.index.snapshot();
        let last = match self.head_of(&snapshot, stream)?.0 {
            StreamHead::NoStream => return Ok(ReadEventResult::NoStream),
            StreamHead::Deleted => return Ok(ReadEventResult::StreamDeleted),
            StreamHead::At(last) => last,
        };

        let number = if event_number == -1 { last } else { event_number };
        let metadata = self.stream_metadata(stream)?;
        if number > last || number < metadata.min_visible(last) {
            return Ok(ReadEventResult::NotFound);
        }

        let hash = self.hasher.hash(stream);
        match self.resolve(stream, &snapshot.candidates(hash, number))? {
            Some(prepare) if !metadata.is_expired(prepare.timestamp, now_millis()) => {
                Ok(ReadEventResult::Success(Self::to_event(prepare, number)))
            }
            _ => Ok(ReadEventResult::NotFound),
        }
    }

    /// Read up to `max_count` events starting at `from`
    pub fn read_stream_forward(&self, stream: &str, from: i64, max_count: usize) -> Result<StreamSlice> {
        if from < 0 || max_count == 0 {
            return Err(StoreError::InvalidArgument(format!(
                "Invalid forward read from {} count {}",
                from, max_count
            )));
        }
        let direction = ReadDirection::Forward;
        let snapshot = self.index.snapshot();
        let last = match self.head_of(&snapshot, stream)?.0 {
            StreamHead::NoStream => {
                return Ok(StreamSlice::empty(SliceStatus::NoStream, stream, direction, from, -1))
            }
            StreamHead::Deleted => {
                return Ok(StreamSlice::empty(
                    SliceStatus::StreamDeleted,
                    stream,
                    direction,
                    from,
                    DELETED_STREAM_VERSION,
                ))
            }
            StreamHead::At(last) => last,
        };

        let metadata = self.stream_metadata(stream)?;
        let start = from.max(metadata.min_visible(last));
        if start > last {
            let mut slice = StreamSlice::empty(SliceStatus::Success, stream, direction, from, last);
            slice.next_event_number = last + 1;
            return Ok(slice);
        }

        let end = start.saturating_add(Self::window(max_count)).min(last);
        let hash = self.hasher.hash(stream);
        let now = now_millis();
        let mut events = Vec::with_capacity(Self::capacity(start, end));
        for (number, positions) in snapshot.range(hash, start, end) {
            if let Some(prepare) = self.resolve(stream, &positions)? {
                if !metadata.is_expired(prepare.timestamp, now) {
                    events.push(Self::to_event(prepare, number));
                }
            }
        }

        Ok(StreamSlice {
            status: SliceStatus::Success,
            stream: stream.to_string(),
            direction,
            from_event_number: from,
            events,
            next_event_number: end + 1,
            last_event_number: last,
            is_end_of_stream: end >= last,
        })
    }

    /// Read up to `max_count` events going back from `from` (-1 = the end)
    pub fn read_stream_backward(&self, stream: &str, from: i64, max_count: usize) -> Result<StreamSlice> {
        if from < -1 || max_count == 0 {
            return Err(StoreError::InvalidArgument(format!(
                "Invalid backward read from {} count {}",
                from, max_count
            )));
        }
        let direction = ReadDirection::Backward;
        let snapshot = self.index.snapshot();
        let last = match self.head_of(&snapshot, stream)?.0 {
            StreamHead::NoStream => {
                return Ok(StreamSlice::empty(SliceStatus::NoStream, stream, direction, from, -1))
            }
            StreamHead::Deleted => {
                return Ok(StreamSlice::empty(
                    SliceStatus::StreamDeleted,
                    stream,
                    direction,
                    from,
                    DELETED_STREAM_VERSION,
                ))
            }
            StreamHead::At(last) => last,
        };

        let metadata = self.stream_metadata(stream)?;
        let min = metadata.min_visible(last);
        let top = if from == -1 || from > last { last } else { from };
        if top < min {
            return Ok(StreamSlice::empty(SliceStatus::Success, stream, direction, from, last));
        }

        let low = top.saturating_sub(Self::window(max_count)).max(min);
        let hash = self.hasher.hash(stream);
        let now = now_millis();
        let mut events = Vec::with_capacity(Self::capacity(low, top));
        for (number, positions) in snapshot.range(hash, low, top).into_iter().rev() {
            if let Some(prepare) = self.resolve(stream, &positions)? {
                if !metadata.is_expired(prepare.timestamp, now) {
                    events.push(Self::to_event(prepare, number));
                }
            }
        }

        let is_end = low <= min;
        Ok(StreamSlice {
            status: SliceStatus::Success,
            stream: stream.to_string(),
            direction,
            from_event_number: from,
            events,
            next_event_number: if is_end { -1 } else { low - 1 },
            last_event_number: last,
            is_end_of_stream: is_end,
        })
    }

    /// Event numbers past the first that a read of `max_count` may cover
    fn window(max_count: usize) -> i64 {
        i64::try_from(max_count).unwrap_or(i64::MAX).saturating_sub(1)
    }

    fn capacity(low: i64, high: i64) -> usize {
        let span = high.saturating_sub(low).saturating_add(1).max(0);
        usize::try_from(span).unwrap_or(usize::MAX).min(MAX_PREALLOCATED_EVENTS)
    }

    // =========================================================================
    // All Reads
    // =========================================================================

    /// Prepares of a committed transaction, in order
    pub fn transaction_prepares(&self, commit: &CommitRecord) -> Result<Vec<PrepareRecord>> {
        let mut prepares = Vec::new();
        for record in self.log.reader(commit.transaction_position, commit.log_position) {
            if let LogRecord::Prepare(prepare) = record? {
                if prepare.transaction_position == commit.transaction_position {
                    prepares.push(prepare);
                }
            }
        }
        Ok(prepares)
    }

    /// Committed events in commit order from `position`, up to what the
    /// chaser has indexed. `position` must be 0 or a `next_position` from a
    /// previous slice. Whole transactions are returned, so a slice may hold
    /// slightly more than `max_count` events.
    pub fn read_all_forward(&self, position: i64, max_count: usize) -> Result<AllSlice> {
        if position < 0 || max_count == 0 {
            return Err(StoreError::InvalidArgument(format!(
                "Invalid read-all from {} count {}",
                position, max_count
            )));
        }
        let limit = self.progress.position();
        let mut events = Vec::new();
        let mut next = position;
        let mut is_end = true;

        while next < limit {
            if events.len() >= max_count {
                is_end = false;
                break;
            }
            let Some((record, after)) = self.log.read_next(next)? else {
                break;
            };
            if record.log_position() >= limit {
                break;
            }
            if let LogRecord::Commit(commit) = &record {
                for prepare in self.transaction_prepares(commit)? {
                    if prepare.is_tombstone() {
                        continue;
                    }
                    let number = commit.first_event_number + prepare.transaction_offset as i64;
                    events.push(Self::to_event(prepare, number));
                }
            }
            next = after;
        }

        Ok(AllSlice {
            from_position: position,
            events,
            next_position: next,
            is_end,
        })
    }

    // =========================================================================
    // Write Checks
    // =========================================================================

    /// Check a write against the stream's current state
    pub fn check_append(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: &[NewEvent],
    ) -> Result<CommitDecision> {
        let head = self.last_event_number(stream)?;
        let last = match head {
            StreamHead::Deleted => return Ok(CommitDecision::StreamDeleted),
            StreamHead::NoStream => -1,
            StreamHead::At(last) => last,
        };
        let count = events.len() as i64;

        let decision = match expected {
            ExpectedVersion::Any => match self.already_committed(stream, last - count + 1, events)? {
                Some(result) => CommitDecision::Idempotent(result),
                None => CommitDecision::Proceed { first_event_number: last + 1 },
            },
            ExpectedVersion::NoStream | ExpectedVersion::EmptyStream => {
                if last == -1 {
                    CommitDecision::Proceed { first_event_number: 0 }
                } else if let Some(result) = self.already_committed(stream, 0, events)? {
                    CommitDecision::Idempotent(result)
                } else {
                    CommitDecision::WrongExpectedVersion(head)
                }
            }
            ExpectedVersion::StreamExists => {
                let exists = last >= 0
                    || self.last_event_number(&metastream_of(stream))?.exists();
                if !exists {
                    CommitDecision::WrongExpectedVersion(head)
                } else if let Some(result) =
                    self.already_committed(stream, last - count + 1, events)?
                {
                    CommitDecision::Idempotent(result)
                } else {
                    CommitDecision::Proceed { first_event_number: last + 1 }
                }
            }
            ExpectedVersion::Exact(version) => {
                if version == last {
                    CommitDecision::Proceed { first_event_number: last + 1 }
                } else if version < last {
                    match self.already_committed(stream, version + 1, events)? {
                        Some(result) => CommitDecision::Idempotent(result),
                        None => CommitDecision::WrongExpectedVersion(head),
                    }
                } else {
                    CommitDecision::WrongExpectedVersion(head)
                }
            }
        };
        Ok(decision)
    }

    /// Whether `events` are already committed at `first..first+len` with the
    /// same ids; returns the original write's result
    fn already_committed(
        &self,
        stream: &str,
        first: i64,
        events: &[NewEvent],
    ) -> Result<Option<WriteResult>> {
        if first < 0 || events.is_empty() {
            return Ok(None);
        }
        let last = first + events.len() as i64 - 1;
        let snapshot = self.index.snapshot();
        let hash = self.hasher.hash(stream);
        let candidates = snapshot.range(hash, first, last);

        let mut transaction_position = None;
        for (offset, event) in events.iter().enumerate() {
            let number = first + offset as i64;
            let Some(positions) = candidates.get(&number) else {
                return Ok(None);
            };
            match self.resolve(stream, positions)? {
                Some(prepare) if prepare.event_id == event.event_id => {
                    transaction_position.get_or_insert(prepare.transaction_position);
                }
                _ => return Ok(None),
            }
        }

        Ok(transaction_position.map(|position| WriteResult {
            next_expected_version: last,
            log_position: position,
        }))
    }

    /// Check the expected version for a delete; returns the stream's last
    /// event number
    pub fn check_delete(&self, stream: &str, expected: ExpectedVersion) -> Result<i64> {
        let head = self.last_event_number(stream)?;
        let last = match head {
            StreamHead::Deleted => return Err(StoreError::StreamDeleted(stream.to_string())),
            StreamHead::NoStream => -1,
            StreamHead::At(last) => last,
        };
        let ok = match expected {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream | ExpectedVersion::EmptyStream => last == -1,
            ExpectedVersion::StreamExists => last >= 0,
            ExpectedVersion::Exact(version) => version == last,
        };
        if ok {
            Ok(last)
        } else {
            Err(StoreError::WrongExpectedVersion {
                stream: stream.to_string(),
                expected,
                actual: head,
            })
        }
    }
}

//! Public data types shared by the read and write paths.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use uuid::Uuid;

/// Event number recorded for a hard-delete tombstone.
pub const DELETED_STREAM_VERSION: i64 = i64::MAX;

/// Current wall-clock time in unix millis.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Expected Version
// =============================================================================

/// Optimistic concurrency precondition supplied with a write.
///
/// Idempotency is guaranteed for `NoStream`, `EmptyStream` and `Exact`;
/// for `Any` and `StreamExists` it is best effort (the stream tail is
/// compared against the incoming event ids).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No check.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream must exist but hold no events. Shares `NoStream`'s raw value.
    EmptyStream,
    /// The stream (or its metadata stream) must exist.
    StreamExists,
    /// The last event in the stream must have exactly this number.
    Exact(i64),
}

impl ExpectedVersion {
    pub const ANY: i64 = -2;
    pub const NO_STREAM: i64 = -1;
    pub const STREAM_EXISTS: i64 = -4;

    /// Decode the wire representation used by clients.
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            Self::ANY => Some(ExpectedVersion::Any),
            Self::NO_STREAM => Some(ExpectedVersion::NoStream),
            Self::STREAM_EXISTS => Some(ExpectedVersion::StreamExists),
            n if n >= 0 => Some(ExpectedVersion::Exact(n)),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> i64 {
        match self {
            ExpectedVersion::Any => Self::ANY,
            ExpectedVersion::NoStream | ExpectedVersion::EmptyStream => Self::NO_STREAM,
            ExpectedVersion::StreamExists => Self::STREAM_EXISTS,
            ExpectedVersion::Exact(n) => *n,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => write!(f, "Any"),
            ExpectedVersion::NoStream => write!(f, "NoStream"),
            ExpectedVersion::EmptyStream => write!(f, "EmptyStream"),
            ExpectedVersion::StreamExists => write!(f, "StreamExists"),
            ExpectedVersion::Exact(n) => write!(f, "{}", n),
        }
    }
}

// =============================================================================
// Stream Head
// =============================================================================

/// What the index knows about the end of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamHead {
    NoStream,
    Deleted,
    At(i64),
}

impl StreamHead {
    /// Last event number, -1 when the stream has no events.
    pub fn last_event_number(&self) -> i64 {
        match self {
            StreamHead::NoStream => -1,
            StreamHead::Deleted => DELETED_STREAM_VERSION,
            StreamHead::At(n) => *n,
        }
    }

    pub fn exists(&self) -> bool {
        matches!(self, StreamHead::At(_))
    }
}

impl fmt::Display for StreamHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamHead::NoStream => write!(f, "NoStream"),
            StreamHead::Deleted => write!(f, "Deleted"),
            StreamHead::At(n) => write!(f, "{}", n),
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// An event proposed by a client. Payloads are opaque bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl NewEvent {
    /// Create an event with a freshly generated id
    pub fn new(event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::with_id(Uuid::new_v4(), event_type, data)
    }

    /// Create an event with a caller-chosen id (used for idempotent retries)
    pub fn with_id(event_id: Uuid, event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            event_id,
            event_type: event_type.into(),
            data: data.into(),
            metadata: Bytes::new(),
        }
    }

    pub fn metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = metadata.into();
        self
    }
}

/// An event as stored and indexed.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub stream: String,
    pub event_number: i64,
    pub event_id: Uuid,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
    /// Position of the event's prepare record in the log
    pub log_position: i64,
    /// Unix millis at write time
    pub timestamp: u64,
}

/// Outcome of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// Version the next write should expect
    pub next_expected_version: i64,
    /// Position of the first prepare of the write
    pub log_position: i64,
}

// =============================================================================
// Read Results
// =============================================================================

/// Result of reading a single event.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadEventResult {
    Success(RecordedEvent),
    NotFound,
    NoStream,
    StreamDeleted,
}

/// Status of a stream slice read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceStatus {
    Success,
    NoStream,
    StreamDeleted,
}

/// Direction of a stream read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    Forward,
    Backward,
}

/// A page of events read from one stream.
#[derive(Debug, Clone)]
pub struct StreamSlice {
    pub status: SliceStatus,
    pub stream: String,
    pub direction: ReadDirection,
    pub from_event_number: i64,
    pub events: Vec<RecordedEvent>,
    /// Where the next page starts (-1 when reading backward past the start)
    pub next_event_number: i64,
    pub last_event_number: i64,
    pub is_end_of_stream: bool,
}

impl StreamSlice {
    pub(crate) fn empty(
        status: SliceStatus,
        stream: &str,
        direction: ReadDirection,
        from: i64,
        last_event_number: i64,
    ) -> Self {
        Self {
            status,
            stream: stream.to_string(),
            direction,
            from_event_number: from,
            events: Vec::new(),
            next_event_number: -1,
            last_event_number,
            is_end_of_stream: true,
        }
    }
}

/// A page of committed events read across all streams in log order.
#[derive(Debug, Clone)]
pub struct AllSlice {
    pub from_position: i64,
    pub events: Vec<RecordedEvent>,
    pub next_position: i64,
    pub is_end: bool,
}

/// How a stream is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Truncate via metadata; the stream can be written again
    Soft,
    /// Tombstone; the stream can never be written again
    Hard,
}

//! Stream metadata
//!
//! Retention settings live as the latest event of the stream's metadata
//! stream `$$<stream>`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Prefix that marks a metadata stream
pub const METASTREAM_PREFIX: &str = "$$";

/// Event type of metadata events
pub const METADATA_EVENT_TYPE: &str = "$metadata";

/// Event type of hard-delete tombstones
pub const TOMBSTONE_EVENT_TYPE: &str = "$streamDeleted";

pub fn metastream_of(stream: &str) -> String {
    format!("{}{}", METASTREAM_PREFIX, stream)
}

pub fn is_metastream(stream: &str) -> bool {
    stream.starts_with(METASTREAM_PREFIX)
}

/// Retention policy of a stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Keep at most this many of the newest events
    pub max_count: Option<i64>,
    /// Hide events older than this
    pub max_age_secs: Option<u64>,
    /// Hide events numbered below this
    pub truncate_before: Option<i64>,
}

impl StreamMetadata {
    pub fn max_count(mut self, count: i64) -> Self {
        self.max_count = Some(count);
        self
    }

    pub fn max_age_secs(mut self, secs: u64) -> Self {
        self.max_age_secs = Some(secs);
        self
    }

    pub fn truncate_before(mut self, event_number: i64) -> Self {
        self.truncate_before = Some(event_number);
        self
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    /// Lowest visible event number for a stream whose last event is `last`
    pub fn min_visible(&self, last_event_number: i64) -> i64 {
        let mut min = self.truncate_before.unwrap_or(0);
        if let Some(count) = self.max_count {
            min = min.max(last_event_number.saturating_sub(count.max(0)) + 1);
        }
        min.max(0)
    }

    /// Whether an event written at `timestamp_ms` has aged out by `now_ms`
    pub fn is_expired(&self, timestamp_ms: u64, now_ms: u64) -> bool {
        match self.max_age_secs {
            Some(age) => timestamp_ms.saturating_add(age.saturating_mul(1000)) < now_ms,
            None => false,
        }
    }
}

//! Storage Services
//!
//! The services that sit between the engine API and the log and index.
//!
//! ## Write Path
//! ```text
//!   append ──► StorageWriter ──lock──► ReadIndex.check_append
//!                  │                        (expected version, idempotency)
//!                  ▼
//!             ChunkedLog: Prepare.. Commit ──flush──► writer checkpoint
//!                  │
//!                  ▼ wake
//!             StorageChaser ──► TableIndex.add ──► chaser checkpoint
//!                  │
//!                  ▼
//!             ChaserProgress ──► writer returns WriteResult
//! ```
//!
//! ## Read Path
//! Reads go through `ReadIndex`, which resolves index candidates against
//! the log so stream hash collisions never leak foreign events.

mod chaser;
mod metadata;
mod read_index;
mod scavenger;
mod writer;

use parking_lot::Mutex;

use crate::error::{Result, StoreError};

pub use chaser::{ChaserProgress, StorageChaser};
pub use metadata::{
    is_metastream, metastream_of, StreamMetadata, METADATA_EVENT_TYPE, METASTREAM_PREFIX,
    TOMBSTONE_EVENT_TYPE,
};
pub use read_index::{CommitDecision, ReadIndex};
pub use scavenger::ScavengeReport;
pub(crate) use scavenger::Scavenger;
pub use writer::StorageWriter;

/// Set once a write fails midway; every later write is refused
#[derive(Debug, Default)]
pub struct HaltFlag {
    reason: Mutex<Option<String>>,
}

impl HaltFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn halt(&self, reason: &str) {
        self.reason.lock().get_or_insert_with(|| reason.to_string());
    }

    pub fn is_halted(&self) -> bool {
        self.reason.lock().is_some()
    }

    pub fn check(&self) -> Result<()> {
        match self.reason.lock().as_ref() {
            Some(reason) => Err(StoreError::WriterHalted(reason.clone())),
            None => Ok(()),
        }
    }
}

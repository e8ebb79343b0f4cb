//! Index Module
//!
//! Secondary index from `(stream, event number)` to log position.
//!
//! ## Structure
//! ```text
//!   StorageChaser ──add──► MemTable (mutable, in memory)
//!                              │ full: freeze + flush
//!                              ▼
//!   level 0   [PTable] [PTable] [PTable]        newest
//!                              │ N tables: merge
//!                              ▼
//!   level 1   [PTable] [PTable]
//!                              ▼
//!   level 2   [PTable]                          oldest
//! ```
//!
//! Streams are keyed by a 64-bit hash of their name, so different streams
//! may share index keys. Lookups therefore return candidate positions and
//! the read path confirms the stream by reading the record.

mod map;
mod memtable;
mod merge;
mod ptable;
mod table_index;

use std::cmp::Ordering;
use std::fmt;

pub use map::{IndexMap, MergeResult, INDEXMAP_FILE_NAME};
pub use memtable::MemTable;
pub use merge::{merge_ptables, NoLog, PositionOracle};
pub use ptable::{PTable, PTableBuilder, PTableRange, PTABLE_EXTENSION};
pub use table_index::{IndexSnapshot, IndexStats, TableIndex};

// =============================================================================
// Index Entry
// =============================================================================

/// One index record: `(stream hash, event number) -> log position`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexEntry {
    pub stream_hash: u64,
    pub event_number: i64,
    pub position: i64,
}

impl IndexEntry {
    /// Encoded size: Hash (8) | Number (8) | Position (8)
    pub const SIZE: usize = 24;

    pub fn new(stream_hash: u64, event_number: i64, position: i64) -> Self {
        Self {
            stream_hash,
            event_number,
            position,
        }
    }

    /// Lookup key (position excluded)
    pub fn key(&self) -> (u64, i64) {
        (self.stream_hash, self.event_number)
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.stream_hash.to_le_bytes());
        buf[8..16].copy_from_slice(&self.event_number.to_le_bytes());
        buf[16..24].copy_from_slice(&self.position.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut word = [0u8; 8];
        word.copy_from_slice(&buf[0..8]);
        let stream_hash = u64::from_le_bytes(word);
        word.copy_from_slice(&buf[8..16]);
        let event_number = i64::from_le_bytes(word);
        word.copy_from_slice(&buf[16..24]);
        let position = i64::from_le_bytes(word);
        Self {
            stream_hash,
            event_number,
            position,
        }
    }
}

/// Hash ascending, event number ascending, then higher position first so
/// the most recent write for a key is met first
impl Ord for IndexEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.stream_hash
            .cmp(&other.stream_hash)
            .then(self.event_number.cmp(&other.event_number))
            .then(other.position.cmp(&self.position))
    }
}

impl PartialOrd for IndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// =============================================================================
// Stream Hashing
// =============================================================================

/// Maps a stream name to its 64-bit index key
pub trait StreamHasher: Send + Sync + fmt::Debug {
    fn hash(&self, stream: &str) -> u64;
}

/// Default hasher: high half from xxh64, low half from xxh3.
///
/// Two independent hashes make a full 64-bit collision much rarer than
/// either function alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct XxStreamHasher;

impl StreamHasher for XxStreamHasher {
    fn hash(&self, stream: &str) -> u64 {
        let bytes = stream.as_bytes();
        let high = xxhash_rust::xxh64::xxh64(bytes, 0) >> 32;
        let low = xxhash_rust::xxh3::xxh3_64(bytes) & 0xFFFF_FFFF;
        (high << 32) | low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_order_prefers_higher_position() {
        let older = IndexEntry::new(7, 3, 100);
        let newer = IndexEntry::new(7, 3, 900);
        let next = IndexEntry::new(7, 4, 50);

        let mut entries = vec![next, older, newer];
        entries.sort();
        assert_eq!(entries, vec![newer, older, next]);
    }

    #[test]
    fn test_entry_encoding() {
        let entry = IndexEntry::new(u64::MAX, i64::MAX, 42);
        let mut buf = [0u8; IndexEntry::SIZE];
        entry.encode_into(&mut buf);
        assert_eq!(IndexEntry::decode(&buf), entry);
    }

    #[test]
    fn test_hasher_is_stable_and_discriminating() {
        let hasher = XxStreamHasher;
        assert_eq!(hasher.hash("orders-42"), hasher.hash("orders-42"));
        assert_ne!(hasher.hash("orders-42"), hasher.hash("orders-43"));
    }
}

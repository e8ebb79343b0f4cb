//! MemTable
//!
//! In-memory sorted index entries awaiting flush to a PTable.
//!
//! Only the chaser adds entries; readers see the table through an index
//! snapshot. Once frozen it is never written again.

use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::RwLock;

use super::IndexEntry;

/// In-memory index table
#[derive(Debug)]
pub struct MemTable {
    entries: RwLock<BTreeSet<IndexEntry>>,
    /// Highest prepare position covered by this table
    prepare_checkpoint: AtomicI64,
    /// Log position up to which the table (and everything before it) is complete
    commit_checkpoint: AtomicI64,
    frozen: AtomicBool,
}

impl MemTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeSet::new()),
            prepare_checkpoint: AtomicI64::new(-1),
            commit_checkpoint: AtomicI64::new(-1),
            frozen: AtomicBool::new(false),
        }
    }

    /// Add the entries of one committed transaction
    pub fn add(&self, entries: &[IndexEntry], prepare_checkpoint: i64, commit_checkpoint: i64) {
        debug_assert!(!self.is_frozen(), "write to a frozen memtable");
        {
            let mut set = self.entries.write();
            set.extend(entries.iter().copied());
        }
        self.prepare_checkpoint
            .fetch_max(prepare_checkpoint, Ordering::AcqRel);
        self.commit_checkpoint
            .fetch_max(commit_checkpoint, Ordering::AcqRel);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn prepare_checkpoint(&self) -> i64 {
        self.prepare_checkpoint.load(Ordering::Acquire)
    }

    pub fn commit_checkpoint(&self) -> i64 {
        self.commit_checkpoint.load(Ordering::Acquire)
    }

    pub(crate) fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Most recent position for a key
    pub fn lookup(&self, stream_hash: u64, event_number: i64) -> Option<i64> {
        self.range(stream_hash, event_number, event_number)
            .first()
            .map(|e| e.position)
    }

    /// Entries for `stream_hash` with event numbers in `[from, to]`, in
    /// entry order
    pub fn range(&self, stream_hash: u64, from: i64, to: i64) -> Vec<IndexEntry> {
        if from > to {
            return Vec::new();
        }
        let lower = IndexEntry::new(stream_hash, from, i64::MAX);
        let upper = IndexEntry::new(stream_hash, to, i64::MIN);
        self.entries
            .read()
            .range((Bound::Included(lower), Bound::Included(upper)))
            .copied()
            .collect()
    }

    /// All entries in order (used when flushing to a PTable)
    pub fn sorted_entries(&self) -> Vec<IndexEntry> {
        self.entries.read().iter().copied().collect()
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

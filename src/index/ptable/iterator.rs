//! PTable Iterator
//!
//! Lazy iteration over a contiguous run of entries, from either end.

use crate::index::IndexEntry;

use super::reader::PTable;

/// Entries `[front, back)` of a PTable
pub struct PTableRange<'a> {
    table: &'a PTable,
    front: u64,
    back: u64,
}

impl<'a> PTableRange<'a> {
    pub(super) fn new(table: &'a PTable, front: u64, back: u64) -> Self {
        Self { table, front, back }
    }
}

impl<'a> Iterator for PTableRange<'a> {
    type Item = IndexEntry;

    fn next(&mut self) -> Option<IndexEntry> {
        if self.front >= self.back {
            return None;
        }
        let entry = self.table.entry(self.front);
        self.front += 1;
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = (self.back - self.front) as usize;
        (n, Some(n))
    }
}

impl<'a> DoubleEndedIterator for PTableRange<'a> {
    fn next_back(&mut self) -> Option<IndexEntry> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        Some(self.table.entry(self.back))
    }
}

impl<'a> ExactSizeIterator for PTableRange<'a> {}

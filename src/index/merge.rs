//! PTable Merge
//!
//! N-way merge of sorted tables into one.
//!
//! For each key the candidates arrive newest table first, then highest
//! position first. A candidate is dropped when:
//! - its position no longer exists in the log (scavenged)
//! - it repeats a position already kept (exact duplicate)
//! - a kept candidate belongs to the same stream (superseded)
//!
//! Candidates the log shows to belong to a different stream than every
//! kept one are hash collisions and are all retained.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;

use super::ptable::{PTable, PTableBuilder, PTableRange};
use super::IndexEntry;

/// What a merge may ask the log about a position
pub trait PositionOracle: Send + Sync {
    /// Whether a record still exists at `position`
    fn is_live(&self, position: i64) -> bool;

    /// Stream of the record at `position`, when it can be read
    fn stream_at(&self, position: i64) -> Option<String>;
}

/// Oracle for tables with no log behind them: every position is live and
/// no collision can be proven
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLog;

impl PositionOracle for NoLog {
    fn is_live(&self, _position: i64) -> bool {
        true
    }

    fn stream_at(&self, _position: i64) -> Option<String> {
        None
    }
}

struct HeapItem {
    entry: IndexEntry,
    /// Index of the source table; higher is newer
    source: usize,
}

impl Ord for HeapItem {
    // BinaryHeap pops the greatest item: smallest key, then newest table,
    // then highest position
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .entry
            .key()
            .cmp(&self.entry.key())
            .then(self.source.cmp(&other.source))
            .then(self.entry.position.cmp(&other.entry.position))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

/// Counts reported by a merge
#[derive(Debug, Default, Clone, Copy)]
struct MergeCounts {
    read: u64,
    dead: u64,
    duplicate: u64,
    superseded: u64,
}

/// Merge `tables` (ordered oldest first) into a new table in `dir`
pub fn merge_ptables(
    dir: &Path,
    tables: &[Arc<PTable>],
    midpoint_interval: usize,
    oracle: &dyn PositionOracle,
) -> Result<PTable> {
    let mut builder = PTableBuilder::new(dir, midpoint_interval)?;
    match write_merged(&mut builder, tables, oracle) {
        Ok(counts) => {
            tracing::debug!(
                inputs = tables.len(),
                read = counts.read,
                dead = counts.dead,
                duplicate = counts.duplicate,
                superseded = counts.superseded,
                "Merged PTables"
            );
            builder.finish()
        }
        Err(e) => {
            builder.discard();
            Err(e)
        }
    }
}

fn write_merged(
    builder: &mut PTableBuilder,
    tables: &[Arc<PTable>],
    oracle: &dyn PositionOracle,
) -> Result<MergeCounts> {
    let mut cursors: Vec<PTableRange<'_>> = tables.iter().map(|t| t.iter()).collect();
    let mut heap = BinaryHeap::with_capacity(cursors.len());
    for (source, cursor) in cursors.iter_mut().enumerate() {
        if let Some(entry) = cursor.next() {
            heap.push(HeapItem { entry, source });
        }
    }

    let mut counts = MergeCounts::default();
    let mut group: Vec<IndexEntry> = Vec::new();
    let mut group_key = None;

    while let Some(HeapItem { entry, source }) = heap.pop() {
        if let Some(next) = cursors[source].next() {
            heap.push(HeapItem { entry: next, source });
        }
        counts.read += 1;

        if group_key != Some(entry.key()) {
            emit_group(builder, &mut group, oracle, &mut counts)?;
            group_key = Some(entry.key());
        }
        group.push(entry);
    }
    emit_group(builder, &mut group, oracle, &mut counts)?;
    Ok(counts)
}

/// Resolve all candidates of one key (in authority order) and write the
/// survivors
fn emit_group(
    builder: &mut PTableBuilder,
    group: &mut Vec<IndexEntry>,
    oracle: &dyn PositionOracle,
    counts: &mut MergeCounts,
) -> Result<()> {
    if group.is_empty() {
        return Ok(());
    }

    let mut kept: Vec<IndexEntry> = Vec::with_capacity(1);
    let mut streams: HashMap<i64, Option<String>> = HashMap::new();

    for candidate in group.drain(..) {
        if !oracle.is_live(candidate.position) {
            counts.dead += 1;
            continue;
        }
        if kept.iter().any(|k| k.position == candidate.position) {
            counts.duplicate += 1;
            continue;
        }
        if kept.is_empty() {
            kept.push(candidate);
            continue;
        }

        let stream = streams
            .entry(candidate.position)
            .or_insert_with(|| oracle.stream_at(candidate.position))
            .clone();
        let collides = match stream {
            Some(stream) => kept.iter().all(|k| {
                let other = streams
                    .entry(k.position)
                    .or_insert_with(|| oracle.stream_at(k.position));
                other.as_deref() != Some(stream.as_str())
            }),
            None => false,
        };

        if collides {
            kept.push(candidate);
        } else {
            counts.superseded += 1;
        }
    }

    kept.sort();
    for entry in kept {
        builder.add(entry)?;
    }
    Ok(())
}

//! Table Index
//!
//! Combines the live MemTable, frozen MemTables awaiting flush and the
//! IndexMap into one snapshot readers can query without locks.
//!
//! ## Concurrency
//! ```text
//!   chaser ──add──► snapshot.memtable
//!      │ full
//!      └─freeze──► snapshot' { new memtable, frozen + [old] }
//!                      │
//!                      ▼  bounded queue (backpressure)
//!   worker ──flush──► PTable ──► map' = map + table ──► persist ──► snapshot''
//!      └──merge───► map'' = map' with level N merged ──► persist ──► snapshot'''
//! ```
//!
//! Readers clone the `Arc<IndexSnapshot>`; a swap is a pointer store. The
//! worker is the only writer of the IndexMap, so merges never race each
//! other.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::bus::{Bus, Message};
use crate::config::Config;
use crate::error::{Result, StoreError};

use super::map::{IndexMap, MergeResult, INDEXMAP_FILE_NAME};
use super::memtable::MemTable;
use super::merge::PositionOracle;
use super::ptable::{PTableBuilder, PTABLE_EXTENSION};
use super::IndexEntry;

const FLUSH_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);

// =============================================================================
// Snapshot
// =============================================================================

/// Point-in-time view of every index source
#[derive(Debug)]
pub struct IndexSnapshot {
    pub memtable: Arc<MemTable>,
    /// Frozen memtables not yet in the map, oldest first
    pub frozen: Vec<Arc<MemTable>>,
    pub map: Arc<IndexMap>,
}

impl IndexSnapshot {
    fn memtables(&self) -> impl Iterator<Item = &Arc<MemTable>> + '_ {
        std::iter::once(&self.memtable).chain(self.frozen.iter().rev())
    }

    /// Candidate positions for a key, newest source first, without repeats
    pub fn candidates(&self, stream_hash: u64, event_number: i64) -> Vec<i64> {
        self.range(stream_hash, event_number, event_number)
            .remove(&event_number)
            .unwrap_or_default()
    }

    /// Candidate positions per event number in `[from, to]`
    pub fn range(&self, stream_hash: u64, from: i64, to: i64) -> BTreeMap<i64, Vec<i64>> {
        let mut out: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        let mut push = |entry: IndexEntry| {
            let positions = out.entry(entry.event_number).or_default();
            if !positions.contains(&entry.position) {
                positions.push(entry.position);
            }
        };

        for memtable in self.memtables() {
            memtable.range(stream_hash, from, to).into_iter().for_each(&mut push);
        }
        for table in self.map.tables() {
            table.range(stream_hash, from, to).for_each(&mut push);
        }
        out
    }

    /// Highest event number any source holds for the hash
    pub fn max_event_number(&self, stream_hash: u64) -> Option<i64> {
        let from_memtables = self
            .memtables()
            .filter_map(|m| m.range(stream_hash, 0, i64::MAX).last().map(|e| e.event_number));
        let from_tables = self.map.tables().filter_map(|t| t.last_event_number(stream_hash));
        from_memtables.chain(from_tables).max()
    }

    pub fn memtable_entries(&self) -> usize {
        self.memtables().map(|m| m.len()).sum()
    }
}

/// Index sizes for introspection
#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub memtable_entries: usize,
    pub frozen_memtables: usize,
    pub tables_per_level: Vec<usize>,
    pub generation: u64,
    pub commit_checkpoint: i64,
}

// =============================================================================
// Table Index
// =============================================================================

enum IndexTask {
    Flush(Arc<MemTable>),
    Barrier(Sender<()>),
    Shutdown,
}

struct Shared {
    snapshot: RwLock<Arc<IndexSnapshot>>,
    /// Serializes snapshot replacement and memtable adds
    swap_lock: Mutex<()>,
    dir: PathBuf,
    midpoint_interval: usize,
    durable: bool,
    oracle: Arc<dyn PositionOracle>,
    bus: Arc<Bus>,
}

pub struct TableIndex {
    shared: Arc<Shared>,
    memtable_max_entries: usize,
    tasks: Sender<IndexTask>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TableIndex {
    /// Load the index in `dir` and start its worker.
    ///
    /// An index that cannot be loaded, or that covers positions past
    /// `log_end`, is discarded so it can be rebuilt from the log.
    pub fn open(
        dir: &Path,
        config: &Config,
        oracle: Arc<dyn PositionOracle>,
        bus: Arc<Bus>,
        log_end: i64,
    ) -> Result<Self> {
        let durable = config.sync_strategy.is_durable();
        let map = match IndexMap::load(dir, config.max_tables_per_level, config.verify_ptables) {
            Ok(map) if map.commit_checkpoint() > log_end => {
                tracing::warn!(
                    commit_checkpoint = map.commit_checkpoint(),
                    log_end,
                    "Index map is ahead of the log; rebuilding the index"
                );
                drop(map);
                Self::reset(dir, config.max_tables_per_level, durable)?
            }
            Ok(map) => map,
            Err(StoreError::Index(reason)) => {
                tracing::warn!(%reason, "Index map is unusable; rebuilding the index");
                Self::reset(dir, config.max_tables_per_level, durable)?
            }
            Err(e) => return Err(e),
        };

        let shared = Arc::new(Shared {
            snapshot: RwLock::new(Arc::new(IndexSnapshot {
                memtable: Arc::new(MemTable::new()),
                frozen: Vec::new(),
                map: Arc::new(map),
            })),
            swap_lock: Mutex::new(()),
            dir: dir.to_path_buf(),
            midpoint_interval: config.midpoint_interval,
            durable,
            oracle,
            bus,
        });

        let (tasks, queue) = channel::bounded(config.index_task_queue.max(1));
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("index-worker".to_string())
            .spawn(move || run_worker(worker_shared, queue))?;

        Ok(Self {
            shared,
            memtable_max_entries: config.memtable_max_entries,
            tasks,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Delete every table and the manifest, leaving an empty map
    fn reset(dir: &Path, max_tables_per_level: usize, durable: bool) -> Result<IndexMap> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_table = path.extension().and_then(|e| e.to_str()) == Some(PTABLE_EXTENSION);
            let is_manifest = path.file_name().and_then(|n| n.to_str()) == Some(INDEXMAP_FILE_NAME);
            if is_table || is_manifest {
                fs::remove_file(&path)?;
            }
        }
        let map = IndexMap::empty(dir, max_tables_per_level);
        map.persist(durable)?;
        Ok(map)
    }

    /// Current view for readers
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.shared.snapshot.read().clone()
    }

    /// Log position up to which the persisted tables are complete
    pub fn commit_checkpoint(&self) -> i64 {
        self.snapshot().map.commit_checkpoint()
    }

    /// Add one committed transaction's entries, freezing the memtable when
    /// it reaches its size limit
    pub fn add(&self, entries: &[IndexEntry], prepare_checkpoint: i64, commit_checkpoint: i64) -> Result<()> {
        let len = {
            let _swap = self.shared.swap_lock.lock();
            let memtable = Arc::clone(&self.shared.snapshot.read().memtable);
            memtable.add(entries, prepare_checkpoint, commit_checkpoint);
            memtable.len()
        };
        if len >= self.memtable_max_entries {
            self.freeze()?;
        }
        Ok(())
    }

    /// Swap in a fresh memtable and queue the old one for flushing.
    /// Blocks while the flush queue is full.
    pub fn freeze(&self) -> Result<()> {
        let next = {
            let _swap = self.shared.swap_lock.lock();
            let current = self.snapshot();
            if current.memtable.is_empty() {
                // Nothing new, but retry memtables left by a failed flush
                current.frozen.last().cloned()
            } else {
                current.memtable.freeze();
                let mut frozen = current.frozen.clone();
                frozen.push(Arc::clone(&current.memtable));
                *self.shared.snapshot.write() = Arc::new(IndexSnapshot {
                    memtable: Arc::new(MemTable::new()),
                    frozen,
                    map: Arc::clone(&current.map),
                });
                tracing::debug!(entries = current.memtable.len(), "Froze memtable");
                Some(Arc::clone(&current.memtable))
            }
        };

        match next {
            Some(memtable) => self.queue_flush(memtable),
            None => Ok(()),
        }
    }

    fn queue_flush(&self, memtable: Arc<MemTable>) -> Result<()> {
        self.tasks
            .send(IndexTask::Flush(memtable))
            .map_err(|_| StoreError::Index("index worker has stopped".to_string()))
    }

    /// Block until every queued task has run
    pub fn wait_for_idle(&self) -> Result<()> {
        let (done, wait) = channel::bounded(1);
        self.tasks
            .send(IndexTask::Barrier(done))
            .map_err(|_| StoreError::Index("index worker has stopped".to_string()))?;
        wait.recv()
            .map_err(|_| StoreError::Index("index worker has stopped".to_string()))
    }

    /// Freeze the memtable and wait until it and every earlier frozen
    /// memtable are in PTables
    pub fn flush(&self) -> Result<()> {
        self.freeze()?;
        self.wait_for_idle()?;
        let pending = self.snapshot().frozen.len();
        if pending > 0 {
            return Err(StoreError::Index(format!(
                "{} frozen memtable(s) could not be flushed",
                pending
            )));
        }
        Ok(())
    }

    pub fn stats(&self) -> IndexStats {
        let snapshot = self.snapshot();
        IndexStats {
            memtable_entries: snapshot.memtable_entries(),
            frozen_memtables: snapshot.frozen.len(),
            tables_per_level: snapshot.map.tables_per_level(),
            generation: snapshot.map.generation(),
            commit_checkpoint: snapshot.map.commit_checkpoint(),
        }
    }

    /// Stop the worker after the tasks already queued
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = self.tasks.send(IndexTask::Shutdown);
        if worker.join().is_err() {
            tracing::error!("Index worker panicked");
        }
    }
}

impl Drop for TableIndex {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Worker
// =============================================================================

fn run_worker(shared: Arc<Shared>, queue: Receiver<IndexTask>) {
    tracing::debug!("Index worker started");
    for task in queue.iter() {
        match task {
            IndexTask::Flush(memtable) => {
                if shared.flush_frozen(&memtable) {
                    shared.merge_levels();
                }
            }
            IndexTask::Barrier(done) => {
                let _ = done.send(());
            }
            IndexTask::Shutdown => break,
        }
    }
    tracing::debug!("Index worker stopped");
}

impl Shared {
    /// Flush frozen memtables oldest first, up to and including `target`.
    ///
    /// A memtable whose flush failed earlier is still frozen and is retried
    /// here before anything newer, so the persisted commit checkpoint never
    /// passes entries that only live in memory.
    fn flush_frozen(&self, target: &Arc<MemTable>) -> bool {
        let pending = self.snapshot.read().frozen.clone();
        for memtable in &pending {
            if !self.flush_with_retry(memtable) {
                return false;
            }
            if Arc::ptr_eq(memtable, target) {
                break;
            }
        }
        true
    }

    fn flush_with_retry(&self, memtable: &Arc<MemTable>) -> bool {
        for attempt in 1..=FLUSH_ATTEMPTS {
            match self.flush_memtable(memtable) {
                Ok(()) => return true,
                Err(e) if attempt < FLUSH_ATTEMPTS => {
                    tracing::warn!(attempt, error = %e, "Memtable flush failed; retrying");
                    thread::sleep(RETRY_DELAY * attempt);
                }
                Err(e) => {
                    // Stays frozen and readable until a later flush succeeds
                    tracing::error!(error = %e, "Memtable flush failed");
                    self.bus.publish(&Message::IndexTaskFailed {
                        reason: e.to_string(),
                    });
                }
            }
        }
        false
    }

    fn flush_memtable(&self, memtable: &Arc<MemTable>) -> Result<()> {
        let table = Arc::new(PTableBuilder::build(
            &self.dir,
            memtable.sorted_entries(),
            self.midpoint_interval,
        )?);

        // Only this worker replaces the map, so it can be built and persisted
        // without holding the lock the chaser adds under
        let base = Arc::clone(&self.snapshot.read().map);
        let map = Arc::new(base.add_ptable(
            Arc::clone(&table),
            memtable.prepare_checkpoint(),
            memtable.commit_checkpoint(),
        ));
        if let Err(e) = map.persist(self.durable) {
            table.mark_for_deletion();
            return Err(e);
        }
        let generation = map.generation();

        self.swap_map(&base, map, Some(memtable))?;

        tracing::info!(
            id = %table.id(),
            entries = table.entry_count(),
            generation,
            "Flushed memtable to PTable"
        );
        self.bus.publish(&Message::PTableFlushed {
            table_id: table.id(),
            entries: table.entry_count(),
            generation,
        });
        Ok(())
    }

    /// Publish a new map, dropping `flushed` from the frozen list. The swap
    /// lock is held only for the pointer store.
    fn swap_map(
        &self,
        base: &Arc<IndexMap>,
        map: Arc<IndexMap>,
        flushed: Option<&Arc<MemTable>>,
    ) -> Result<()> {
        let _swap = self.swap_lock.lock();
        let current = self.snapshot.read().clone();
        if !Arc::ptr_eq(&current.map, base) {
            return Err(StoreError::MergeConflict(
                "index map changed while a new one was being persisted".to_string(),
            ));
        }
        let frozen = current
            .frozen
            .iter()
            .filter(|m| flushed.map_or(true, |f| !Arc::ptr_eq(m, f)))
            .cloned()
            .collect();
        *self.snapshot.write() = Arc::new(IndexSnapshot {
            memtable: Arc::clone(&current.memtable),
            frozen,
            map,
        });
        Ok(())
    }

    /// Merge full levels until none is left. Failures are reported and the
    /// merge is attempted again after the next flush.
    fn merge_levels(&self) {
        loop {
            let map = Arc::clone(&self.snapshot.read().map);
            let result = match map.try_merge(self.midpoint_interval, self.oracle.as_ref()) {
                Ok(Some(result)) => result,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "PTable merge failed");
                    self.bus.publish(&Message::IndexTaskFailed {
                        reason: e.to_string(),
                    });
                    return;
                }
            };

            if let Err(e) = self.apply_merge(&result) {
                result.output.mark_for_deletion();
                tracing::warn!(error = %e, "Discarding merge output");
                self.bus.publish(&Message::IndexTaskFailed {
                    reason: e.to_string(),
                });
                return;
            }
        }
    }

    fn apply_merge(&self, result: &MergeResult) -> Result<()> {
        let base = Arc::clone(&self.snapshot.read().map);
        let map = Arc::new(base.replace_merged(result)?);
        map.persist(self.durable)?;
        let generation = map.generation();

        self.swap_map(&base, map, None)?;

        for table in &result.superseded {
            table.mark_for_deletion();
        }
        tracing::info!(
            level = result.level,
            inputs = result.superseded.len(),
            output = %result.output.id(),
            entries = result.output.entry_count(),
            "Merged PTables"
        );
        self.bus.publish(&Message::MergeCompleted {
            level: result.level,
            inputs: result.superseded.len(),
            output_id: result.output.id(),
            entries: result.output.entry_count(),
            generation,
        });
        Ok(())
    }
}

//! Storage Chaser
//!
//! Follows the flushed end of the log and feeds committed transactions
//! into the index.
//!
//! ```text
//!   log:  P(a,0) P(b,0) C(a) P(b,1) C(b) ...
//!           │      │     │            │
//!           └──────┼─► pending[a] ──► index.add(a entries)
//!                  └─► pending[b] ───────────► index.add(b entries)
//! ```
//!
//! The chaser checkpoint never passes the start of a transaction whose
//! commit has not been seen, so a restart replays every uncommitted
//! prepare again.
//!
//! Committed events go out on the bus as `EventCommitted` only after the
//! progress they belong to is published, so a reader that subscribes and
//! then reads up to the current progress sees every event exactly once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};

use crate::bus::{Bus, Message, MessageKind};
use crate::checkpoint::Checkpoint;
use crate::error::{Result, StoreError};
use crate::index::{IndexEntry, StreamHasher, TableIndex};
use crate::log::{ChunkedLog, CommitRecord, LogRecord, PrepareRecord};
use crate::types::DELETED_STREAM_VERSION;

use super::read_index::ReadIndex;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Committed events held back before progress is published mid-pass
const PUBLISH_BATCH: usize = 1024;

// =============================================================================
// Progress
// =============================================================================

#[derive(Debug)]
struct ProgressState {
    position: i64,
    halted: Option<String>,
}

/// How far the chaser has indexed, with a way to wait for it
#[derive(Debug)]
pub struct ChaserProgress {
    state: Mutex<ProgressState>,
    changed: Condvar,
}

impl ChaserProgress {
    pub fn new(position: i64) -> Self {
        Self {
            state: Mutex::new(ProgressState {
                position,
                halted: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// Every commit below this position is indexed
    pub fn position(&self) -> i64 {
        self.state.lock().position
    }

    pub fn halted(&self) -> Option<String> {
        self.state.lock().halted.clone()
    }

    pub(crate) fn advance(&self, position: i64) {
        let mut state = self.state.lock();
        if position > state.position {
            state.position = position;
            self.changed.notify_all();
        }
    }

    pub(crate) fn halt(&self, reason: &str) {
        let mut state = self.state.lock();
        state.halted.get_or_insert_with(|| reason.to_string());
        self.changed.notify_all();
    }

    /// Block until the chaser reaches `target`
    pub fn wait_for(&self, target: i64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.position >= target {
                return Ok(());
            }
            if let Some(reason) = &state.halted {
                return Err(StoreError::WriterHalted(reason.clone()));
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                if state.position >= target {
                    return Ok(());
                }
                return Err(StoreError::Timeout(format!(
                    "index reached {} of {} within {:?}",
                    state.position, target, timeout
                )));
            }
        }
    }
}

// =============================================================================
// Chaser
// =============================================================================

enum ChaserSignal {
    Wake,
    Stop,
}

/// Background thread that indexes committed transactions
pub struct StorageChaser {
    signals: Sender<ChaserSignal>,
    worker: Mutex<Option<JoinHandle<()>>>,
    progress: Arc<ChaserProgress>,
}

impl StorageChaser {
    /// Start indexing from `from`, which must be a transaction boundary
    pub fn start(
        log: Arc<ChunkedLog>,
        index: Arc<TableIndex>,
        hasher: Arc<dyn StreamHasher>,
        checkpoint: Arc<Checkpoint>,
        bus: Arc<Bus>,
        progress: Arc<ChaserProgress>,
        from: i64,
    ) -> Result<Self> {
        let (signals, receiver) = channel::bounded(1);
        let mut chaser = Chaser {
            log,
            index,
            hasher,
            checkpoint,
            bus,
            progress: Arc::clone(&progress),
            position: from,
            pending: BTreeMap::new(),
            committed: Vec::new(),
        };

        tracing::info!(from, "Starting storage chaser");
        let worker = thread::Builder::new()
            .name("storage-chaser".to_string())
            .spawn(move || chaser.run(receiver))?;

        Ok(Self {
            signals,
            worker: Mutex::new(Some(worker)),
            progress,
        })
    }

    pub fn progress(&self) -> &Arc<ChaserProgress> {
        &self.progress
    }

    /// Tell the chaser new records were flushed
    pub fn wake(&self) {
        // A full channel already holds a wake-up
        if let Err(TrySendError::Disconnected(_)) = self.signals.try_send(ChaserSignal::Wake) {
            tracing::debug!("Chaser is not running");
        }
    }

    /// Index what is flushed, then stop the thread
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = self.signals.send(ChaserSignal::Stop);
        if worker.join().is_err() {
            tracing::error!("Storage chaser panicked");
        }
    }
}

impl Drop for StorageChaser {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Chaser {
    log: Arc<ChunkedLog>,
    index: Arc<TableIndex>,
    hasher: Arc<dyn StreamHasher>,
    checkpoint: Arc<Checkpoint>,
    bus: Arc<Bus>,
    progress: Arc<ChaserProgress>,
    position: i64,
    /// Prepares of transactions whose commit is not yet seen
    pending: BTreeMap<i64, Vec<PrepareRecord>>,
    /// Events indexed in this pass, published once progress moves
    committed: Vec<Message>,
}

impl Chaser {
    fn run(&mut self, signals: Receiver<ChaserSignal>) {
        loop {
            if let Err(e) = self.catch_up() {
                let reason = e.to_string();
                tracing::error!(position = self.position, error = %reason, "Storage chaser halted");
                self.progress.halt(&reason);
                self.bus.publish(&Message::WriterHalted { reason });
                return;
            }

            match signals.recv_timeout(POLL_INTERVAL) {
                Ok(ChaserSignal::Wake) | Err(RecvTimeoutError::Timeout) => {}
                Ok(ChaserSignal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if let Err(e) = self.catch_up() {
            tracing::warn!(error = %e, "Final chaser pass failed");
        }
        tracing::debug!(position = self.position, "Storage chaser stopped");
    }

    /// Index every commit below the flushed position
    fn catch_up(&mut self) -> Result<()> {
        let limit = self.log.flushed_position();
        while self.position < limit {
            let Some((record, next)) = self.log.read_next(self.position)? else {
                self.position = limit;
                break;
            };
            if record.log_position() >= limit {
                // Only chunk padding lies before the limit
                self.position = limit;
                break;
            }

            match record {
                LogRecord::Prepare(prepare) => {
                    self.pending
                        .entry(prepare.transaction_position)
                        .or_default()
                        .push(prepare);
                }
                LogRecord::Commit(commit) => self.index_commit(&commit, next)?,
            }
            self.position = next;
            if self.committed.len() >= PUBLISH_BATCH {
                self.publish_committed();
            }
        }

        let checkpoint = self.replay_point(self.position);
        if checkpoint != self.checkpoint.read() {
            self.checkpoint.write_and_flush(checkpoint)?;
        }
        self.publish_committed();
        Ok(())
    }

    /// Move progress to the current position, then announce the events
    /// indexed so far. Subscribers registered after the handler check read
    /// these events back through the advanced progress instead.
    fn publish_committed(&mut self) {
        self.progress.advance(self.position);
        if self.bus.handler_count(MessageKind::EventCommitted) == 0 {
            self.committed.clear();
            return;
        }
        for message in self.committed.drain(..) {
            self.bus.publish(&message);
        }
    }

    /// Where a restart has to resume to see every pending prepare again
    fn replay_point(&self, position: i64) -> i64 {
        self.pending
            .keys()
            .next()
            .map_or(position, |&first| first.min(position))
    }

    fn index_commit(&mut self, commit: &CommitRecord, next: i64) -> Result<()> {
        let prepares = match self.pending.remove(&commit.transaction_position) {
            Some(prepares) => prepares,
            None => self.read_transaction(commit)?,
        };
        if prepares.is_empty() {
            return Err(StoreError::CorruptRecord {
                position: commit.log_position,
                reason: format!(
                    "commit of transaction {} has no prepares",
                    commit.transaction_position
                ),
            });
        }

        let entries: Vec<IndexEntry> = prepares
            .iter()
            .map(|prepare| {
                let number = if prepare.is_tombstone() {
                    DELETED_STREAM_VERSION
                } else {
                    commit.first_event_number + prepare.transaction_offset as i64
                };
                IndexEntry::new(self.hasher.hash(&prepare.stream), number, prepare.log_position)
            })
            .collect();
        let prepare_checkpoint = prepares
            .iter()
            .map(|p| p.log_position)
            .max()
            .unwrap_or(commit.transaction_position);

        self.index
            .add(&entries, prepare_checkpoint, self.replay_point(next))?;

        for prepare in prepares {
            if prepare.is_tombstone() {
                continue;
            }
            let number = commit.first_event_number + prepare.transaction_offset as i64;
            self.committed.push(Message::EventCommitted {
                event: ReadIndex::to_event(prepare, number),
                commit_position: commit.log_position,
            });
        }
        Ok(())
    }

    /// Prepares of a transaction that began before the replay point
    fn read_transaction(&self, commit: &CommitRecord) -> Result<Vec<PrepareRecord>> {
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
}

//! Subscriptions
//!
//! Push committed events to a callback as the chaser indexes them. A
//! catch-up subscription first reads what is already stored, then switches
//! to live delivery.
//!
//! ```text
//!   chaser ──EventCommitted──► bus handler ──► channel ──┐
//!                                                       ▼
//!   ReadIndex ──catch-up pages─────────────────► delivery thread ──► callback
//! ```
//!
//! The bus handler is registered before the first catch-up read, so every
//! event is either in the read or arrives live. Live events behind the
//! delivery cursor were already part of the read and are skipped. A
//! volatile subscription places its cursor at the current end instead of
//! reading.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use parking_lot::Mutex;

use crate::bus::{Bus, Message, MessageKind, SubscriptionId, Topic};
use crate::error::{Result, StoreError};
use crate::storage::ReadIndex;
use crate::types::{RecordedEvent, SliceStatus, StreamHead};

const CATCH_UP_PAGE: usize = 500;
const STOP_POLL: Duration = Duration::from_millis(100);

/// What a subscription follows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionTarget {
    Stream(String),
    /// Every stream, in commit order
    All,
}

impl SubscriptionTarget {
    fn matches(&self, stream: &str) -> bool {
        match self {
            SubscriptionTarget::Stream(name) => name == stream,
            SubscriptionTarget::All => true,
        }
    }
}

/// Where delivery starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Only events committed after subscribing
    Volatile,
    /// Stored events from `from` on, then live ones. `from` is an event
    /// number for a stream, and 0 or a previous `next_position` for all
    /// streams.
    CatchUp { from: i64 },
}

/// The next event a subscription may deliver
#[derive(Debug, Clone, Copy)]
enum Cursor {
    EventNumber(i64),
    CommitPosition(i64),
}

impl Cursor {
    /// Whether a live event is new, advancing past it when it is
    fn admit(&mut self, event: &RecordedEvent, commit_position: i64) -> bool {
        match self {
            Cursor::EventNumber(next) => {
                if event.event_number < *next {
                    return false;
                }
                *next = event.event_number + 1;
                true
            }
            // Events of one commit share its position
            Cursor::CommitPosition(next) => {
                if commit_position < *next {
                    return false;
                }
                *next = commit_position;
                true
            }
        }
    }
}

/// Volatile subscriptions start at a known cursor, catch-up ones read first
#[derive(Debug, Clone, Copy)]
enum Start {
    At(Cursor),
    CatchUp(i64),
}

type Handler = Box<dyn FnMut(&RecordedEvent) + Send>;

#[derive(Debug, Default)]
struct Status {
    stopped: AtomicBool,
    caught_up: AtomicBool,
    dropped: Mutex<Option<String>>,
}

/// A running subscription; dropping it stops delivery
pub struct Subscription {
    id: SubscriptionId,
    target: SubscriptionTarget,
    bus: Arc<Bus>,
    status: Arc<Status>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    pub(crate) fn start(
        bus: Arc<Bus>,
        read_index: Arc<ReadIndex>,
        target: SubscriptionTarget,
        kind: SubscriptionKind,
        handler: Handler,
    ) -> Result<Self> {
        if let SubscriptionKind::CatchUp { from } = kind {
            if from < 0 {
                return Err(StoreError::InvalidArgument(format!(
                    "catch-up subscription cannot start at {}",
                    from
                )));
            }
        }

        let (sender, live) = channel::unbounded();
        let filter = target.clone();
        let id = bus.subscribe(Topic::Kind(MessageKind::EventCommitted), move |message| {
            if let Message::EventCommitted { event, commit_position } = message {
                if filter.matches(&event.stream) {
                    let _ = sender.send((event.clone(), *commit_position));
                }
            }
        });

        // A volatile cursor is taken before returning, so every commit made
        // after subscribing is delivered
        let start = match kind {
            SubscriptionKind::Volatile => match Self::current_end(&read_index, &target) {
                Ok(cursor) => Start::At(cursor),
                Err(e) => {
                    bus.unsubscribe(id);
                    return Err(e);
                }
            },
            SubscriptionKind::CatchUp { from } => Start::CatchUp(from),
        };

        let status = Arc::new(Status::default());
        let delivery = Delivery {
            read_index,
            target: target.clone(),
            start,
            live,
            handler,
            status: Arc::clone(&status),
        };
        let worker = match thread::Builder::new()
            .name("subscription".to_string())
            .spawn(move || delivery.run())
        {
            Ok(worker) => worker,
            Err(e) => {
                bus.unsubscribe(id);
                return Err(e.into());
            }
        };

        tracing::debug!(?target, ?kind, "Subscription started");
        Ok(Self {
            id,
            target,
            bus,
            status,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn current_end(read_index: &ReadIndex, target: &SubscriptionTarget) -> Result<Cursor> {
        match target {
            SubscriptionTarget::Stream(stream) => match read_index.last_event_number(stream)? {
                StreamHead::NoStream => Ok(Cursor::EventNumber(0)),
                StreamHead::At(last) => Ok(Cursor::EventNumber(last + 1)),
                StreamHead::Deleted => Err(StoreError::StreamDeleted(stream.clone())),
            },
            // Commits below the indexed position are already published or
            // about to be
            SubscriptionTarget::All => Ok(Cursor::CommitPosition(read_index.indexed_position())),
        }
    }

    pub fn target(&self) -> &SubscriptionTarget {
        &self.target
    }

    /// Stored events have been delivered and delivery is now live
    pub fn is_caught_up(&self) -> bool {
        self.status.caught_up.load(Ordering::Acquire)
    }

    /// Why delivery stopped on its own, if it did
    pub fn drop_reason(&self) -> Option<String> {
        self.status.dropped.lock().clone()
    }

    /// Stop delivery and wait for the callback to return
    pub fn unsubscribe(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        self.status.stopped.store(true, Ordering::Release);
        self.bus.unsubscribe(self.id);
        if worker.join().is_err() {
            tracing::error!(target = ?self.target, "Subscription callback panicked");
        }
        tracing::debug!(target = ?self.target, "Subscription stopped");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("target", &self.target)
            .field("caught_up", &self.is_caught_up())
            .finish()
    }
}

// =============================================================================
// Delivery
// =============================================================================

struct Delivery {
    read_index: Arc<ReadIndex>,
    target: SubscriptionTarget,
    start: Start,
    live: Receiver<(RecordedEvent, i64)>,
    handler: Handler,
    status: Arc<Status>,
}

impl Delivery {
    fn run(mut self) {
        let mut cursor = match self.catch_up() {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::warn!(target = ?self.target, error = %e, "Subscription dropped");
                *self.status.dropped.lock() = Some(e.to_string());
                return;
            }
        };
        self.status.caught_up.store(true, Ordering::Release);

        loop {
            match self.live.recv_timeout(STOP_POLL) {
                Ok((event, commit_position)) => {
                    if self.stopped() {
                        break;
                    }
                    if cursor.admit(&event, commit_position) {
                        (self.handler)(&event);
                    }
                }
                Err(RecvTimeoutError::Timeout) if !self.stopped() => {}
                Err(_) => break,
            }
        }
    }

    fn stopped(&self) -> bool {
        self.status.stopped.load(Ordering::Acquire)
    }

    fn catch_up(&mut self) -> Result<Cursor> {
        let from = match self.start {
            Start::At(cursor) => return Ok(cursor),
            Start::CatchUp(from) => from,
        };
        match self.target.clone() {
            SubscriptionTarget::Stream(stream) => self.catch_up_stream(&stream, from),
            SubscriptionTarget::All => self.catch_up_all(from),
        }
    }

    fn catch_up_stream(&mut self, stream: &str, from: i64) -> Result<Cursor> {
        let mut next = from;
        while !self.stopped() {
            let slice = self.read_index.read_stream_forward(stream, next, CATCH_UP_PAGE)?;
            match slice.status {
                SliceStatus::Success => {}
                SliceStatus::NoStream => break,
                SliceStatus::StreamDeleted => {
                    return Err(StoreError::StreamDeleted(stream.to_string()))
                }
            }
            for event in &slice.events {
                (self.handler)(event);
            }
            next = next.max(slice.next_event_number);
            if slice.is_end_of_stream {
                break;
            }
        }
        Ok(Cursor::EventNumber(next))
    }

    fn catch_up_all(&mut self, from: i64) -> Result<Cursor> {
        let mut position = from;
        while !self.stopped() {
            let slice = self.read_index.read_all_forward(position, CATCH_UP_PAGE)?;
            for event in &slice.events {
                (self.handler)(event);
            }
            position = slice.next_position;
            if slice.is_end {
                break;
            }
        }
        Ok(Cursor::CommitPosition(position))
    }
}

//! Message Bus
//!
//! In-process publish/subscribe used by the writer, chaser, index worker
//! and scavenger to report completion and failure.
//!
//! ## Dispatch
//! ```text
//!   subscribe(Topic::Index, h)
//!        │  Topic::Index.kinds() = [PTableFlushed, MergeCompleted, IndexTaskFailed]
//!        ▼
//!   handlers[PTableFlushed]   = [.., h]
//!   handlers[MergeCompleted]  = [.., h]
//!   handlers[IndexTaskFailed] = [.., h]
//!
//!   publish(PTableFlushed) ──► handlers[PTableFlushed] in registration order
//! ```
//!
//! Topics resolve to their leaf kinds when subscribing, so publishing is a
//! single table lookup. Handlers run synchronously on the publishing thread.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::types::RecordedEvent;

// =============================================================================
// Message Kinds and Topics
// =============================================================================

/// Leaf message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    WriteCompleted,
    EventCommitted,
    StreamDeleted,
    PTableFlushed,
    MergeCompleted,
    IndexTaskFailed,
    ChunkScavenged,
    ScavengeCompleted,
    WriterHalted,
}

impl MessageKind {
    pub const COUNT: usize = 9;

    pub const ALL: [MessageKind; Self::COUNT] = [
        MessageKind::WriteCompleted,
        MessageKind::EventCommitted,
        MessageKind::StreamDeleted,
        MessageKind::PTableFlushed,
        MessageKind::MergeCompleted,
        MessageKind::IndexTaskFailed,
        MessageKind::ChunkScavenged,
        MessageKind::ScavengeCompleted,
        MessageKind::WriterHalted,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// A named group of message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    All,
    Writes,
    Index,
    Log,
    Failures,
    Kind(MessageKind),
}

const WRITES: &[MessageKind] = &[MessageKind::WriteCompleted, MessageKind::StreamDeleted];
const INDEX: &[MessageKind] = &[
    MessageKind::PTableFlushed,
    MessageKind::MergeCompleted,
    MessageKind::IndexTaskFailed,
];
const LOG: &[MessageKind] = &[
    MessageKind::ChunkScavenged,
    MessageKind::ScavengeCompleted,
    MessageKind::WriterHalted,
];
const FAILURES: &[MessageKind] = &[MessageKind::IndexTaskFailed, MessageKind::WriterHalted];

impl Topic {
    /// Leaf kinds covered by this topic
    pub fn kinds(&self) -> &[MessageKind] {
        match self {
            Topic::All => &MessageKind::ALL,
            Topic::Writes => WRITES,
            Topic::Index => INDEX,
            Topic::Log => LOG,
            Topic::Failures => FAILURES,
            Topic::Kind(kind) => std::slice::from_ref(kind),
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    WriteCompleted {
        stream: String,
        first_event_number: i64,
        last_event_number: i64,
        log_position: i64,
    },
    /// One event became readable; published by the chaser in log order
    EventCommitted {
        event: RecordedEvent,
        /// Position of the transaction's commit record
        commit_position: i64,
    },
    StreamDeleted {
        stream: String,
        hard: bool,
        log_position: i64,
    },
    PTableFlushed {
        table_id: Uuid,
        entries: u64,
        generation: u64,
    },
    MergeCompleted {
        level: usize,
        inputs: usize,
        output_id: Uuid,
        entries: u64,
        generation: u64,
    },
    IndexTaskFailed {
        reason: String,
    },
    ChunkScavenged {
        chunk_number: u32,
        version: u32,
        kept: usize,
        removed: usize,
    },
    ScavengeCompleted {
        chunks: usize,
        records_removed: u64,
        elapsed_ms: u64,
    },
    WriterHalted {
        reason: String,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::WriteCompleted { .. } => MessageKind::WriteCompleted,
            Message::EventCommitted { .. } => MessageKind::EventCommitted,
            Message::StreamDeleted { .. } => MessageKind::StreamDeleted,
            Message::PTableFlushed { .. } => MessageKind::PTableFlushed,
            Message::MergeCompleted { .. } => MessageKind::MergeCompleted,
            Message::IndexTaskFailed { .. } => MessageKind::IndexTaskFailed,
            Message::ChunkScavenged { .. } => MessageKind::ChunkScavenged,
            Message::ScavengeCompleted { .. } => MessageKind::ScavengeCompleted,
            Message::WriterHalted { .. } => MessageKind::WriterHalted,
        }
    }
}

// =============================================================================
// Bus
// =============================================================================

type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct Bus {
    name: String,
    /// Handlers per kind, in registration order
    handlers: RwLock<Vec<Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
    slow_threshold: Duration,
}

impl Bus {
    pub fn new(name: impl Into<String>, slow_threshold: Duration) -> Self {
        Self {
            name: name.into(),
            handlers: RwLock::new(vec![Vec::new(); MessageKind::COUNT]),
            next_id: AtomicU64::new(1),
            slow_threshold,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a handler for every kind in `topic`
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(handler);
        let mut handlers = self.handlers.write();
        for kind in topic.kinds() {
            handlers[kind.index()].push((id, Arc::clone(&handler)));
        }
        id
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut found = false;
        for list in self.handlers.write().iter_mut() {
            let before = list.len();
            list.retain(|(sub, _)| *sub != id);
            found |= list.len() != before;
        }
        found
    }

    pub fn handler_count(&self, kind: MessageKind) -> usize {
        self.handlers.read()[kind.index()].len()
    }

    /// Deliver a message to its handlers on the calling thread
    pub fn publish(&self, message: &Message) {
        let kind = message.kind();
        // Handlers may subscribe or publish themselves; never call them
        // under the lock
        let handlers: Vec<Handler> = self.handlers.read()[kind.index()]
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        for handler in handlers {
            let start = Instant::now();
            handler(message);
            let elapsed = start.elapsed();
            if elapsed > self.slow_threshold {
                tracing::warn!(
                    bus = %self.name,
                    ?kind,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Slow bus handler"
                );
            }
        }
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("name", &self.name)
            .field("slow_threshold", &self.slow_threshold)
            .finish()
    }
}

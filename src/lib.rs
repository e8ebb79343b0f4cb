//! # eventlog
//!
//! An append-only event store with:
//! - A chunked transaction log with CRC-framed Prepare/Commit records
//! - Crash recovery driven by atomically written checkpoints
//! - A multi-level PTable index merged in the background
//! - Optimistic concurrency (`ExpectedVersion`) and idempotent appends
//! - Volatile and catch-up subscriptions to a stream or to every stream
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! │          (access checks, lifecycle, recovery)               │
//! └──────────┬──────────────────────────────────┬───────────────┘
//!            │ writes                           │ reads
//!            ▼                                  ▼
//!   ┌─────────────────┐                 ┌─────────────────┐
//!   │  StorageWriter  │────checks──────►│    ReadIndex    │
//!   └────────┬────────┘                 └───┬─────────┬───┘
//!            │ Prepare.. Commit             │         │
//!            ▼                              │         │
//!   ┌─────────────────┐   tails   ┌─────────▼───┐     │
//!   │   ChunkedLog    │◄──────────│StorageChaser│     │
//!   │ (chunk files)   │           └──────┬──────┘     │
//!   └─────────────────┘                  │ add        │
//!            ▲                           ▼            ▼
//!            │ is_live          ┌──────────────────────────┐
//!            └──────────────────│       TableIndex         │
//!                               │ MemTable → PTables/levels│
//!                               └──────────────────────────┘
//! ```
//!
//! Components report completion and failures on the in-process [`bus::Bus`].

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod types;
pub mod access;

pub mod bus;
pub mod checkpoint;
pub mod log;
pub mod index;
pub mod storage;
pub mod subscription;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, StoreError};
pub use config::{Config, SyncStrategy};
pub use engine::{Engine, EngineStats};
pub use storage::{ScavengeReport, StreamMetadata};
pub use subscription::{Subscription, SubscriptionKind, SubscriptionTarget};
pub use types::{
    AllSlice, DeleteMode, ExpectedVersion, NewEvent, ReadDirection, ReadEventResult,
    RecordedEvent, SliceStatus, StreamHead, StreamSlice, WriteResult, DELETED_STREAM_VERSION,
};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of eventlog
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

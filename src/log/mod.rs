//! Chunked Log Module
//!
//! The append-only transaction log: the single source of truth every
//! index is rebuilt from.
//!
//! ## Responsibilities
//! - Append Prepare/Commit records sequentially
//! - CRC32 framing to detect torn and corrupt records
//! - Fixed-capacity chunk files, sealed when full
//! - Crash recovery driven by the writer checkpoint
//! - Swapping in scavenged chunks without moving positions
//!
//! ## Chunk File Format
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ Header (32)                                 │
//! │ ┌───────────┬────────┬────────┬───────────┐ │
//! │ │ Magic (4) │ Number │Version │ ChunkSize │ │
//! │ └───────────┴────────┴────────┴───────────┘ │
//! ├─────────────────────────────────────────────┤
//! │ Records                                     │
//! │ ┌─────────┬─────────┬─────────────────────┐ │
//! │ │ Len (4) │ CRC (4) │ bincode(LogRecord)  │ │
//! │ └─────────┴─────────┴─────────────────────┘ │
//! │ ... (repeated)                              │
//! ├─────────────────────────────────────────────┤
//! │ PosMap (scavenged chunks only)              │
//! │ ┌──────────────┬───────────────┐            │
//! │ │ Logical (4)  │ Physical (4)  │ ...        │
//! │ └──────────────┴───────────────┘            │
//! ├─────────────────────────────────────────────┤
//! │ Footer (40, sealed chunks only)             │
//! │ ┌───────┬───────┬──────────┬─────────┬────┐ │
//! │ │ Magic │ Flags │ Physical │ Logical │CRC │ │
//! │ └───────┴───────┴──────────┴─────────┴────┘ │
//! └─────────────────────────────────────────────┘
//! ```

mod chunk;
mod manager;
mod reader;
mod record;
mod recovery;

pub use chunk::{
    Chunk, ChunkFooter, ChunkHeader, ChunkWriter, PosMapEntry, ScavengedChunkBuilder,
    CHUNK_FOOTER_SIZE, CHUNK_HEADER_SIZE,
};
pub use manager::ChunkedLog;
pub use reader::LogReader;
pub use record::{
    decode_frame, CommitRecord, FrameDecode, LogRecord, PrepareFlags, PrepareRecord,
    MAX_RECORD_SIZE, RECORD_HEADER_SIZE,
};
pub use recovery::RecoveryReport;

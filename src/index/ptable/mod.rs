//! PTable Module
//!
//! Immutable, sorted, memory-mapped tables of index entries.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (16 bytes)                                       │
//! │   Magic: "EVPT" (4) | Format: u8 (1) | Pad (3)          │
//! │   EntryCount: u64 (8)                                   │
//! ├─────────────────────────────────────────────────────────┤
//! │ Entries (24 bytes each, sorted)                         │
//! │   [StreamHash: u64][EventNumber: i64][Position: i64]    │
//! ├─────────────────────────────────────────────────────────┤
//! │ Midpoints (24 bytes each)                               │
//! │   [StreamHash: u64][EventNumber: i64][EntryIndex: u64]  │
//! │   every Kth entry, plus the last                        │
//! ├─────────────────────────────────────────────────────────┤
//! │ Footer (16 bytes)                                       │
//! │   MidpointCount: u64 (8) | EntriesCRC: u32 (4)          │
//! │   Magic: "EVPF" (4)                                     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Files are named `{uuid}.ptable` and written under a `.tmp` name first,
//! so a crash never leaves a half-written table under its real name.

mod builder;
mod iterator;
mod reader;

pub use builder::PTableBuilder;
pub use iterator::PTableRange;
pub use reader::PTable;

// =============================================================================
// Shared Constants (used by builder, reader, iterator)
// =============================================================================

/// Magic bytes identifying a PTable file
pub(crate) const MAGIC: &[u8; 4] = b"EVPT";

/// Magic bytes closing a PTable footer
pub(crate) const FOOTER_MAGIC: &[u8; 4] = b"EVPF";

/// Current PTable format version
pub(crate) const FORMAT: u8 = 1;

/// Header size: Magic (4) + Format (1) + Pad (3) + EntryCount (8)
pub(crate) const HEADER_SIZE: u64 = 16;

/// Footer size: MidpointCount (8) + CRC (4) + Magic (4)
pub(crate) const FOOTER_SIZE: u64 = 16;

/// Midpoint size: StreamHash (8) + EventNumber (8) + EntryIndex (8)
pub(crate) const MIDPOINT_SIZE: u64 = 24;

/// File extension of PTable files
pub const PTABLE_EXTENSION: &str = "ptable";

/// Cached key of every Kth entry, used to narrow binary searches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Midpoint {
    pub key: (u64, i64),
    pub index: u64,
}

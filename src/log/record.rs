//! Log record definitions
//!
//! Defines the Prepare/Commit records stored in the log and their framing.

use std::ops::BitOr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// Frame header: Len (4) + CRC (4)
pub const RECORD_HEADER_SIZE: usize = 8;

/// Upper bound on a single encoded record
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

// =============================================================================
// Prepare Flags
// =============================================================================

/// Bit flags carried by a prepare record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PrepareFlags(u16);

impl PrepareFlags {
    pub const NONE: PrepareFlags = PrepareFlags(0);
    /// Carries an event
    pub const DATA: PrepareFlags = PrepareFlags(0x01);
    /// First prepare of a transaction
    pub const TRANSACTION_BEGIN: PrepareFlags = PrepareFlags(0x02);
    /// Last prepare of a transaction
    pub const TRANSACTION_END: PrepareFlags = PrepareFlags(0x04);
    /// Hard-delete tombstone
    pub const STREAM_DELETE: PrepareFlags = PrepareFlags(0x08);

    pub fn contains(self, other: PrepareFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u16 {
        self.0
    }
}

impl BitOr for PrepareFlags {
    type Output = PrepareFlags;

    fn bitor(self, rhs: PrepareFlags) -> PrepareFlags {
        PrepareFlags(self.0 | rhs.0)
    }
}

// =============================================================================
// Records
// =============================================================================

/// "Data written": one event of a transaction, invisible until committed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareRecord {
    pub log_position: i64,
    /// Position of the first prepare of the transaction
    pub transaction_position: i64,
    /// Index of this prepare within its transaction
    pub transaction_offset: i32,
    pub flags: PrepareFlags,
    pub stream: String,
    pub expected_version: i64,
    pub event_id: Uuid,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
    /// Unix millis
    pub timestamp: u64,
}

impl PrepareRecord {
    pub fn is_tombstone(&self) -> bool {
        self.flags.contains(PrepareFlags::STREAM_DELETE)
    }
}

/// "Officially visible": assigns event numbers to a transaction's prepares
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub log_position: i64,
    pub transaction_position: i64,
    pub first_event_number: i64,
    /// Unix millis
    pub timestamp: u64,
}

/// A record stored in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    Prepare(PrepareRecord),
    Commit(CommitRecord),
}

impl LogRecord {
    pub fn log_position(&self) -> i64 {
        match self {
            LogRecord::Prepare(p) => p.log_position,
            LogRecord::Commit(c) => c.log_position,
        }
    }

    /// Assign the record's position. A prepare at transaction offset 0
    /// opens its transaction, so its transaction position is its own.
    pub fn set_log_position(&mut self, position: i64) {
        match self {
            LogRecord::Prepare(p) => {
                p.log_position = position;
                if p.transaction_offset == 0 {
                    p.transaction_position = position;
                }
            }
            LogRecord::Commit(c) => c.log_position = position,
        }
    }

    /// Size of the framed record on disk. Independent of field values
    /// that are fixed-width, so it can be computed before positioning.
    pub fn framed_size(&self) -> Result<usize> {
        Ok(RECORD_HEADER_SIZE + bincode::serialized_size(self)? as usize)
    }

    /// Encode as `[len][crc][payload]`
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        if payload.len() > MAX_RECORD_SIZE {
            return Err(StoreError::InvalidArgument(format!(
                "Record of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_RECORD_SIZE
            )));
        }
        let crc = crc32fast::hash(&payload);

        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode a payload whose frame header has already been read
    pub fn decode_payload(payload: &[u8], expected_crc: u32, position: i64) -> Result<Self> {
        let actual = crc32fast::hash(payload);
        if actual != expected_crc {
            return Err(StoreError::ChecksumMismatch {
                position,
                expected: expected_crc,
                actual,
            });
        }
        bincode::deserialize(payload).map_err(|e| StoreError::CorruptRecord {
            position,
            reason: e.to_string(),
        })
    }
}

/// Parse a frame header: (payload length, crc)
pub(crate) fn parse_header(header: &[u8]) -> (usize, u32) {
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    (len, crc)
}

// =============================================================================
// Frame scanning (recovery)
// =============================================================================

/// Outcome of decoding the frame at the start of a buffer
#[derive(Debug)]
pub enum FrameDecode {
    /// A valid record occupying `frame_len` bytes
    Complete { record: LogRecord, frame_len: usize },
    /// Nothing left to read
    End,
    /// The frame runs past the end of the buffer (torn write)
    Torn,
    /// The frame is fully present but fails validation
    Corrupt { frame_len: usize, reason: String },
}

/// Decode the frame at the start of `buf`
pub fn decode_frame(buf: &[u8], position: i64) -> FrameDecode {
    if buf.is_empty() {
        return FrameDecode::End;
    }
    if buf.len() < RECORD_HEADER_SIZE {
        return FrameDecode::Torn;
    }

    let (len, crc) = parse_header(&buf[..RECORD_HEADER_SIZE]);
    if len == 0 || len > MAX_RECORD_SIZE {
        // A zeroed or garbage length only happens at a torn tail
        return FrameDecode::Torn;
    }
    let frame_len = RECORD_HEADER_SIZE + len;
    if frame_len > buf.len() {
        return FrameDecode::Torn;
    }

    match LogRecord::decode_payload(&buf[RECORD_HEADER_SIZE..frame_len], crc, position) {
        Ok(record) => FrameDecode::Complete { record, frame_len },
        Err(e) => FrameDecode::Corrupt {
            frame_len,
            reason: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepare(offset: i32) -> LogRecord {
        LogRecord::Prepare(PrepareRecord {
            log_position: -1,
            transaction_position: -1,
            transaction_offset: offset,
            flags: PrepareFlags::DATA,
            stream: "orders-42".to_string(),
            expected_version: -1,
            event_id: Uuid::new_v4(),
            event_type: "OrderPlaced".to_string(),
            data: Bytes::from_static(b"{\"qty\":1}"),
            metadata: Bytes::new(),
            timestamp: 1,
        })
    }

    #[test]
    fn test_framed_size_matches_encoding() {
        let record = prepare(0);
        assert_eq!(record.framed_size().unwrap(), record.encode().unwrap().len());
    }

    #[test]
    fn test_framed_size_does_not_depend_on_position() {
        let mut record = prepare(0);
        let before = record.framed_size().unwrap();
        record.set_log_position(i64::MAX / 2);
        assert_eq!(record.framed_size().unwrap(), before);
    }

    #[test]
    fn test_first_prepare_opens_transaction() {
        let mut first = prepare(0);
        first.set_log_position(100);
        let mut second = prepare(1);
        second.set_log_position(200);

        match (first, second) {
            (LogRecord::Prepare(a), LogRecord::Prepare(b)) => {
                assert_eq!(a.transaction_position, 100);
                assert_eq!(b.transaction_position, -1);
                assert_eq!(b.log_position, 200);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_decode_frame_detects_torn_and_corrupt() {
        let bytes = prepare(0).encode().unwrap();

        assert!(matches!(decode_frame(&bytes, 0), FrameDecode::Complete { .. }));
        assert!(matches!(decode_frame(&bytes[..bytes.len() - 3], 0), FrameDecode::Torn));
        assert!(matches!(decode_frame(&bytes[..4], 0), FrameDecode::Torn));
        assert!(matches!(decode_frame(&[], 0), FrameDecode::End));

        let mut flipped = bytes.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0xFF;
        assert!(matches!(decode_frame(&flipped, 0), FrameDecode::Corrupt { .. }));
    }

    #[test]
    fn test_flags() {
        let flags = PrepareFlags::DATA | PrepareFlags::TRANSACTION_BEGIN;
        assert!(flags.contains(PrepareFlags::DATA));
        assert!(flags.contains(PrepareFlags::TRANSACTION_BEGIN));
        assert!(!flags.contains(PrepareFlags::STREAM_DELETE));
    }
}

//! Log Recovery
//!
//! Brings the chunk directory back to a consistent state on startup:
//!
//! 1. Remove leftover `.tmp` files and superseded chunk versions
//! 2. Check that chunk numbers form a contiguous run from 0
//! 3. Seal any interior chunk that was left unsealed
//! 4. Scan the active chunk, cutting a torn tail and anything past the
//!    writer checkpoint (a missing checkpoint keeps every valid record)
//! 5. Reset the writer checkpoint to the recovered end of the log

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::checkpoint::Checkpoint;
use crate::error::{Result, StoreError};

use super::chunk::{Chunk, ChunkWriter};
use super::record::{decode_frame, FrameDecode};

/// Summary of what recovery found and fixed
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Chunks in the log after recovery
    pub chunks: usize,
    /// Records found in the active chunk
    pub records_scanned: u64,
    /// Bytes cut from the end of the log
    pub truncated_bytes: u64,
    /// Whether a torn (partially written) record was found
    pub torn_tail: bool,
    /// Writer checkpoint before recovery
    pub checkpoint_before: i64,
    /// The writer checkpoint file did not exist
    pub checkpoint_missing: bool,
    /// End of the log after recovery
    pub writer_position: i64,
    /// Temporary and superseded files that were deleted
    pub removed_files: Vec<PathBuf>,
}

pub(super) struct RecoveredLog {
    pub chunks: Vec<Arc<Chunk>>,
    pub writer: ChunkWriter,
    pub report: RecoveryReport,
}

/// Result of scanning the data region of an unsealed chunk
struct ScanResult {
    valid_len: u64,
    record_count: u64,
    hasher: crc32fast::Hasher,
    data_len: u64,
    torn: bool,
}

pub(super) fn recover(
    dir: &Path,
    chunk_size: u32,
    checkpoint: &Checkpoint,
) -> Result<RecoveredLog> {
    fs::create_dir_all(dir)?;
    let mut report = RecoveryReport {
        checkpoint_before: checkpoint.read(),
        ..Default::default()
    };

    let numbers = discover_chunks(dir, &mut report)?;

    if numbers.is_empty() {
        if report.checkpoint_before > 0 {
            return Err(StoreError::CorruptRecord {
                position: report.checkpoint_before,
                reason: "writer checkpoint is past the start but no chunks exist".to_string(),
            });
        }
        let (chunk, writer) = Chunk::create(dir, 0, 0, chunk_size)?;
        checkpoint.write_and_flush(0)?;
        report.chunks = 1;
        tracing::info!("Initialized empty log in {}", dir.display());
        return Ok(RecoveredLog {
            chunks: vec![chunk],
            writer,
            report,
        });
    }

    // Contiguity: a missing chunk means lost data
    for (expected, (&number, _)) in numbers.iter().enumerate() {
        if number != expected as u32 {
            return Err(StoreError::CorruptRecord {
                position: expected as i64 * chunk_size as i64,
                reason: format!("chunk {} is missing", expected),
            });
        }
    }

    let mut chunks = Vec::with_capacity(numbers.len());
    for (&number, &version) in &numbers {
        let path = dir.join(Chunk::file_name(number, version));
        let chunk = Chunk::open(&path)?;
        let header = chunk.header();
        if header.chunk_size != chunk_size {
            return Err(StoreError::Config(format!(
                "chunk {} was written with chunk_size {}, configured {}",
                number, header.chunk_size, chunk_size
            )));
        }
        if header.chunk_number != number {
            return Err(StoreError::Storage(format!(
                "chunk file {} claims chunk number {}",
                path.display(),
                header.chunk_number
            )));
        }
        chunks.push(Arc::new(chunk));
    }

    // Without a checkpoint file nothing is known to be acknowledged: keep
    // every valid record and cut only at the first bad frame
    let checkpoint_pos = if checkpoint.was_loaded() {
        report.checkpoint_before
    } else {
        tracing::warn!("Writer checkpoint missing; recovering to the last valid record");
        report.checkpoint_missing = true;
        -1
    };
    let last = chunks.len() - 1;

    // Interior chunks must be sealed; a crash between opening the next chunk
    // and writing the footer leaves one unsealed
    for chunk in &chunks[..last] {
        if chunk.is_sealed() {
            continue;
        }
        tracing::warn!(chunk = chunk.number(), "Sealing interior chunk left unsealed");
        let scan = scan_chunk(chunk, checkpoint_pos)?;
        report.truncated_bytes += scan.data_len - scan.valid_len;
        let writer = ChunkWriter::resume(
            Arc::clone(chunk),
            scan.valid_len,
            scan.record_count,
            scan.hasher,
        )?;
        writer.seal()?;
    }

    let active = Arc::clone(&chunks[last]);
    let writer = if active.is_sealed() {
        // Sealed but its successor never got created
        let (next, writer) = Chunk::create(dir, active.number() + 1, 0, chunk_size)?;
        chunks.push(next);
        writer
    } else {
        let mut scan = scan_chunk(&active, checkpoint_pos)?;
        report.torn_tail = scan.torn;
        report.records_scanned = scan.record_count;

        let base = active.base_position();
        let checkpoint_local = checkpoint_pos - base;
        if checkpoint_local >= 0 && (checkpoint_local as u64) < scan.valid_len {
            // Bytes past the checkpoint were never acknowledged
            if let Some(cut) = rescan_to(&active, checkpoint_local as u64)? {
                tracing::warn!(
                    chunk = active.number(),
                    from = scan.valid_len,
                    to = checkpoint_local,
                    "Truncating unacknowledged records past the writer checkpoint"
                );
                scan = cut;
            }
        }

        let truncated = scan.data_len - scan.valid_len;
        if truncated > 0 {
            tracing::warn!(
                chunk = active.number(),
                bytes = truncated,
                torn = scan.torn,
                "Truncating log tail"
            );
        }
        report.truncated_bytes += truncated;
        ChunkWriter::resume(active, scan.valid_len, scan.record_count, scan.hasher)?
    };

    report.writer_position = writer.position();
    report.chunks = chunks.len();
    checkpoint.write_and_flush(report.writer_position)?;

    tracing::info!(
        chunks = report.chunks,
        writer_position = report.writer_position,
        truncated_bytes = report.truncated_bytes,
        "Log recovered"
    );

    Ok(RecoveredLog {
        chunks,
        writer,
        report,
    })
}

/// Map of chunk number to its newest version, deleting everything stale
fn discover_chunks(dir: &Path, report: &mut RecoveryReport) -> Result<BTreeMap<u32, u32>> {
    let mut newest: BTreeMap<u32, u32> = BTreeMap::new();
    let mut stale = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if name.ends_with(".tmp") {
            stale.push(path.clone());
            continue;
        }
        let Some((number, version)) = Chunk::parse_file_name(name) else {
            continue;
        };
        match newest.get(&number) {
            Some(&current) if current >= version => {
                stale.push(dir.join(Chunk::file_name(number, version)));
            }
            Some(&current) => {
                stale.push(dir.join(Chunk::file_name(number, current)));
                newest.insert(number, version);
            }
            None => {
                newest.insert(number, version);
            }
        }
    }

    for path in stale {
        tracing::warn!("Removing stale log file {}", path.display());
        fs::remove_file(&path)?;
        report.removed_files.push(path);
    }
    Ok(newest)
}

/// Walk the frames of an unsealed chunk up to the first torn or corrupt one.
///
/// A corrupt frame that ends at or before the writer checkpoint was
/// acknowledged as durable, so it is fatal rather than a truncation point.
fn scan_chunk(chunk: &Chunk, checkpoint: i64) -> Result<ScanResult> {
    let data_len = chunk.physical_data_len();
    let data = chunk.read_data(data_len)?;
    let base = chunk.base_position();

    let mut offset = 0usize;
    let mut record_count = 0u64;
    let mut hasher = crc32fast::Hasher::new();
    let mut torn = false;

    loop {
        let position = base + offset as i64;
        match decode_frame(&data[offset..], position) {
            FrameDecode::Complete { frame_len, .. } => {
                hasher.update(&data[offset..offset + frame_len]);
                offset += frame_len;
                record_count += 1;
            }
            FrameDecode::End => break,
            FrameDecode::Torn => {
                torn = true;
                break;
            }
            FrameDecode::Corrupt { frame_len, reason } => {
                if position + frame_len as i64 <= checkpoint {
                    tracing::error!(position, %reason, "Corrupt record inside the durable log");
                    return Err(StoreError::CorruptRecord { position, reason });
                }
                torn = true;
                break;
            }
        }
    }

    Ok(ScanResult {
        valid_len: offset as u64,
        record_count,
        hasher,
        data_len,
        torn,
    })
}

/// Rescan up to `limit`, returning the cut only if `limit` is a record
/// boundary
fn rescan_to(chunk: &Chunk, limit: u64) -> Result<Option<ScanResult>> {
    let data_len = chunk.physical_data_len();
    let data = chunk.read_data(limit)?;
    let base = chunk.base_position();

    let mut offset = 0usize;
    let mut record_count = 0u64;
    let mut hasher = crc32fast::Hasher::new();
    while (offset as u64) < limit {
        match decode_frame(&data[offset..], base + offset as i64) {
            FrameDecode::Complete { frame_len, .. } => {
                hasher.update(&data[offset..offset + frame_len]);
                offset += frame_len;
                record_count += 1;
            }
            _ => return Ok(None),
        }
    }

    Ok(Some(ScanResult {
        valid_len: offset as u64,
        record_count,
        hasher,
        data_len,
        torn: false,
    }))
}

//! Chunked Log Manager
//!
//! Owns the chunk list and the single writer. Positions are global:
//! `chunk_number * chunk_size + offset`, so a position alone locates its
//! chunk without any lookup table.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::checkpoint::Checkpoint;
use crate::error::{Result, StoreError};
use crate::index::PositionOracle;

use super::chunk::{Chunk, ChunkWriter};
use super::reader::LogReader;
use super::record::LogRecord;
use super::recovery::{self, RecoveryReport};

/// Append-only log split into fixed-capacity chunk files
pub struct ChunkedLog {
    dir: PathBuf,
    chunk_size: u32,
    durable: bool,
    /// Indexed by chunk number
    chunks: RwLock<Vec<Arc<Chunk>>>,
    writer: Mutex<ChunkWriter>,
    writer_checkpoint: Arc<Checkpoint>,
}

impl ChunkedLog {
    /// Open (recovering if needed) the log stored in `dir`
    pub fn open(
        dir: &Path,
        chunk_size: u32,
        durable: bool,
        writer_checkpoint: Arc<Checkpoint>,
    ) -> Result<(Self, RecoveryReport)> {
        let recovered = recovery::recover(dir, chunk_size, &writer_checkpoint)?;
        let log = Self {
            dir: dir.to_path_buf(),
            chunk_size,
            durable,
            chunks: RwLock::new(recovered.chunks),
            writer: Mutex::new(recovered.writer),
            writer_checkpoint,
        };
        Ok((log, recovered.report))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    /// Snapshot of the current chunk list
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        self.chunks.read().clone()
    }

    /// Verify every sealed chunk against its footer
    pub fn verify_sealed(&self) -> Result<usize> {
        let mut verified = 0;
        for chunk in self.chunks() {
            if chunk.is_sealed() {
                chunk.verify()?;
                verified += 1;
            }
        }
        Ok(verified)
    }

    /// Position of the next append (including unflushed records)
    pub fn writer_position(&self) -> i64 {
        self.writer.lock().position()
    }

    /// Position up to which records are flushed
    pub fn flushed_position(&self) -> i64 {
        self.writer_checkpoint.read()
    }

    pub fn chunk_file_name(number: u32, version: u32) -> String {
        Chunk::file_name(number, version)
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Append a record, assigning its position. The record is not visible
    /// to readers until `flush()`.
    pub fn append(&self, record: &mut LogRecord) -> Result<i64> {
        let size = record.framed_size()? as u64;
        if size > self.chunk_size as u64 {
            return Err(StoreError::InvalidArgument(format!(
                "Record of {} bytes does not fit in a {} byte chunk",
                size, self.chunk_size
            )));
        }

        let mut writer = self.writer.lock();
        if size > writer.remaining() {
            self.roll_chunk(&mut writer)?;
        }

        let position = writer.position();
        record.set_log_position(position);
        let frame = record.encode()?;
        writer.append(&frame)?;
        Ok(position)
    }

    /// Make appended records durable and visible, then advance the writer
    /// checkpoint. Returns the flushed position.
    pub fn flush(&self) -> Result<i64> {
        let mut writer = self.writer.lock();
        writer.flush(self.durable)?;
        let position = writer.position();
        self.writer_checkpoint.write_and_flush(position)?;
        Ok(position)
    }

    /// Seal the active chunk if it is `chunk_number` and open the next one
    pub fn seal(&self, chunk_number: u32) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.chunk().number() != chunk_number {
            return Err(StoreError::InvalidArgument(format!(
                "Chunk {} is not the active chunk",
                chunk_number
            )));
        }
        self.roll_chunk(&mut writer)?;
        drop(writer);
        self.flush().map(|_| ())
    }

    fn roll_chunk(&self, writer: &mut ChunkWriter) -> Result<()> {
        let next_number = writer.chunk().number() + 1;
        let (chunk, next) = Chunk::create(&self.dir, next_number, 0, self.chunk_size)?;
        let full = std::mem::replace(writer, next);
        full.seal()?;
        self.chunks.write().push(chunk);
        Ok(())
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    fn chunk_for(&self, position: i64) -> Option<(Arc<Chunk>, u64)> {
        if position < 0 {
            return None;
        }
        let number = (position / self.chunk_size as i64) as usize;
        let chunk = self.chunks.read().get(number).cloned()?;
        let local = (position - chunk.base_position()) as u64;
        Some((chunk, local))
    }

    /// Read the record starting exactly at `position`
    pub fn read(&self, position: i64) -> Result<LogRecord> {
        let (chunk, local) = self
            .chunk_for(position)
            .ok_or(StoreError::RecordNotFound(position))?;
        chunk
            .read_at(local)?
            .ok_or(StoreError::RecordNotFound(position))
    }

    /// First record at or after `position`, with the position following it
    pub fn read_next(&self, position: i64) -> Result<Option<(LogRecord, i64)>> {
        let mut position = position.max(0);
        loop {
            let Some((chunk, local)) = self.chunk_for(position) else {
                return Ok(None);
            };
            let base = chunk.base_position();
            match chunk.read_next(local)? {
                Some((record, next_local)) => return Ok(Some((record, base + next_local as i64))),
                None if chunk.is_sealed() => position = base + self.chunk_size as i64,
                None => return Ok(None),
            }
        }
    }

    /// Iterate records in `[from, limit)`
    pub fn reader(&self, from: i64, limit: i64) -> LogReader<'_> {
        LogReader::new(self, from, limit)
    }

    /// Whether a record still exists at `position` (false once scavenged away)
    pub fn is_position_live(&self, position: i64) -> bool {
        match self.chunk_for(position) {
            Some((chunk, local)) => chunk.contains(local),
            None => false,
        }
    }

    // =========================================================================
    // Scavenge Support
    // =========================================================================

    /// Swap a scavenged chunk in for the version it replaces. The old file
    /// is deleted once the last reader releases it.
    pub fn replace_chunk(&self, replacement: Chunk) -> Result<()> {
        let number = replacement.number() as usize;
        let mut chunks = self.chunks.write();
        let current = chunks.get(number).ok_or_else(|| {
            StoreError::Storage(format!("No chunk {} to replace", number))
        })?;
        if !current.is_sealed() {
            return Err(StoreError::Storage(format!(
                "Chunk {} is still active",
                number
            )));
        }
        if replacement.version() <= current.version() {
            return Err(StoreError::Storage(format!(
                "Chunk {} version {} does not supersede version {}",
                number,
                replacement.version(),
                current.version()
            )));
        }

        current.mark_for_deletion();
        tracing::info!(
            chunk = number,
            version = replacement.version(),
            "Swapped in scavenged chunk"
        );
        chunks[number] = Arc::new(replacement);
        Ok(())
    }
}

impl PositionOracle for ChunkedLog {
    fn is_live(&self, position: i64) -> bool {
        self.is_position_live(position)
    }

    fn stream_at(&self, position: i64) -> Option<String> {
        match self.read(position) {
            Ok(LogRecord::Prepare(prepare)) => Some(prepare.stream),
            _ => None,
        }
    }
}

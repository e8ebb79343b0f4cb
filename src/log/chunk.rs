//! Chunk files
//!
//! A chunk holds a contiguous run of framed records plus, once sealed, a
//! footer. Exactly one chunk (the last) is writable at a time.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::checkpoint::{sync_dir, tmp_path_for};
use crate::error::{Result, StoreError};

use super::record::{decode_frame, parse_header, FrameDecode, LogRecord, RECORD_HEADER_SIZE};

// =============================================================================
// Constants
// =============================================================================

/// Magic bytes identifying a chunk file
const CHUNK_MAGIC: &[u8; 4] = b"EVCK";

/// Magic bytes identifying a chunk footer
const FOOTER_MAGIC: &[u8; 4] = b"EVCF";

/// Current chunk format version
const CHUNK_FORMAT: u8 = 1;

/// Header: Magic (4) | Format (1) | Pad (3) | Number (4) | Version (4) | Size (4) | Reserved (12)
pub const CHUNK_HEADER_SIZE: u64 = 32;

/// Footer: Magic (4) | Flags (1) | Pad (3) | Physical (8) | Logical (8) | Count (8) | PosMap (4) | CRC (4)
pub const CHUNK_FOOTER_SIZE: u64 = 40;

/// Position map entry: Logical (4) | Physical (4)
const POSMAP_ENTRY_SIZE: u64 = 8;

const FLAG_COMPLETED: u8 = 0x01;
const FLAG_SCAVENGED: u8 = 0x02;

// =============================================================================
// Header / Footer
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_number: u32,
    pub chunk_version: u32,
    pub chunk_size: u32,
}

impl ChunkHeader {
    fn encode(&self) -> [u8; CHUNK_HEADER_SIZE as usize] {
        let mut buf = [0u8; CHUNK_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(CHUNK_MAGIC);
        buf[4] = CHUNK_FORMAT;
        buf[8..12].copy_from_slice(&self.chunk_number.to_le_bytes());
        buf[12..16].copy_from_slice(&self.chunk_version.to_le_bytes());
        buf[16..20].copy_from_slice(&self.chunk_size.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8], path: &Path) -> Result<Self> {
        if &buf[0..4] != CHUNK_MAGIC {
            return Err(StoreError::Storage(format!(
                "Invalid chunk magic in {}: {:?}",
                path.display(),
                &buf[0..4]
            )));
        }
        if buf[4] != CHUNK_FORMAT {
            return Err(StoreError::Storage(format!(
                "Unsupported chunk format {} in {}",
                buf[4],
                path.display()
            )));
        }
        Ok(Self {
            chunk_number: read_u32(&buf[8..12]),
            chunk_version: read_u32(&buf[12..16]),
            chunk_size: read_u32(&buf[16..20]),
        })
    }
}

/// Written when a chunk is sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFooter {
    pub scavenged: bool,
    /// Bytes of record data actually stored
    pub physical_data_len: u64,
    /// Bytes of logical position space the chunk covers
    pub logical_data_len: u64,
    pub record_count: u64,
    pub posmap_count: u32,
    pub data_crc: u32,
}

impl ChunkFooter {
    fn encode(&self) -> [u8; CHUNK_FOOTER_SIZE as usize] {
        let mut buf = [0u8; CHUNK_FOOTER_SIZE as usize];
        buf[0..4].copy_from_slice(FOOTER_MAGIC);
        buf[4] = FLAG_COMPLETED | if self.scavenged { FLAG_SCAVENGED } else { 0 };
        buf[8..16].copy_from_slice(&self.physical_data_len.to_le_bytes());
        buf[16..24].copy_from_slice(&self.logical_data_len.to_le_bytes());
        buf[24..32].copy_from_slice(&self.record_count.to_le_bytes());
        buf[32..36].copy_from_slice(&self.posmap_count.to_le_bytes());
        buf[36..40].copy_from_slice(&self.data_crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if &buf[0..4] != FOOTER_MAGIC || buf[4] & FLAG_COMPLETED == 0 {
            return None;
        }
        Some(Self {
            scavenged: buf[4] & FLAG_SCAVENGED != 0,
            physical_data_len: read_u64(&buf[8..16]),
            logical_data_len: read_u64(&buf[16..24]),
            record_count: read_u64(&buf[24..32]),
            posmap_count: read_u32(&buf[32..36]),
            data_crc: read_u32(&buf[36..40]),
        })
    }
}

/// Maps a logical offset to where a scavenged chunk actually stores it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosMapEntry {
    pub logical: u32,
    pub physical: u32,
}

// =============================================================================
// Chunk (read side)
// =============================================================================

/// A chunk file shared between the writer and any number of readers.
///
/// Readers hold `Arc<Chunk>`; when a scavenge replaces the chunk the old
/// file is deleted once the last reference drops.
#[derive(Debug)]
pub struct Chunk {
    header: ChunkHeader,
    path: PathBuf,
    /// Read handle (seek + read under lock)
    file: Mutex<File>,
    /// Physical bytes of record data visible to readers
    written: AtomicU64,
    footer: RwLock<Option<ChunkFooter>>,
    /// Present only for scavenged chunks; sorted by logical offset
    posmap: Vec<PosMapEntry>,
    delete_on_drop: AtomicBool,
}

impl Chunk {
    /// "chunk-000012.000001" for chunk 12, version 1
    pub fn file_name(number: u32, version: u32) -> String {
        format!("chunk-{:06}.{:06}", number, version)
    }

    /// Parse (number, version) from a chunk file name
    pub fn parse_file_name(name: &str) -> Option<(u32, u32)> {
        let rest = name.strip_prefix("chunk-")?;
        let (number, version) = rest.split_once('.')?;
        if number.len() != 6 || version.len() != 6 {
            return None;
        }
        Some((number.parse().ok()?, version.parse().ok()?))
    }

    /// Create a fresh, empty, writable chunk
    pub fn create(
        dir: &Path,
        number: u32,
        version: u32,
        chunk_size: u32,
    ) -> Result<(Arc<Chunk>, ChunkWriter)> {
        let header = ChunkHeader {
            chunk_number: number,
            chunk_version: version,
            chunk_size,
        };
        let path = dir.join(Self::file_name(number, version));

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&header.encode())?;
        file.sync_all()?;
        sync_dir(dir);

        let chunk = Arc::new(Chunk {
            header,
            path: path.clone(),
            file: Mutex::new(File::open(&path)?),
            written: AtomicU64::new(0),
            footer: RwLock::new(None),
            posmap: Vec::new(),
            delete_on_drop: AtomicBool::new(false),
        });

        let writer = ChunkWriter {
            chunk: Arc::clone(&chunk),
            file: BufWriter::new(file),
            offset: 0,
            record_count: 0,
            hasher: crc32fast::Hasher::new(),
        };

        tracing::debug!(chunk = number, version, "Created chunk {}", path.display());
        Ok((chunk, writer))
    }

    /// Open an existing chunk file
    pub fn open(path: &Path) -> Result<Chunk> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < CHUNK_HEADER_SIZE {
            return Err(StoreError::Storage(format!(
                "Chunk {} is shorter than its header",
                path.display()
            )));
        }

        let mut header_buf = [0u8; CHUNK_HEADER_SIZE as usize];
        file.read_exact(&mut header_buf)?;
        let header = ChunkHeader::decode(&header_buf, path)?;

        let mut footer = None;
        let mut posmap = Vec::new();
        if file_len >= CHUNK_HEADER_SIZE + CHUNK_FOOTER_SIZE {
            file.seek(SeekFrom::End(-(CHUNK_FOOTER_SIZE as i64)))?;
            let mut footer_buf = [0u8; CHUNK_FOOTER_SIZE as usize];
            file.read_exact(&mut footer_buf)?;

            if let Some(candidate) = ChunkFooter::decode(&footer_buf) {
                let expected_len = CHUNK_HEADER_SIZE
                    + candidate.physical_data_len
                    + candidate.posmap_count as u64 * POSMAP_ENTRY_SIZE
                    + CHUNK_FOOTER_SIZE;
                // Record bytes can end in the footer magic by accident; the
                // lengths must line up too
                if expected_len == file_len {
                    if candidate.scavenged {
                        posmap = Self::read_posmap(&mut file, &candidate)?;
                    }
                    footer = Some(candidate);
                }
            }
        }

        let written = match &footer {
            Some(f) => f.physical_data_len,
            None => file_len - CHUNK_HEADER_SIZE,
        };

        Ok(Chunk {
            header,
            path: path.to_path_buf(),
            file: Mutex::new(file),
            written: AtomicU64::new(written),
            footer: RwLock::new(footer),
            posmap,
            delete_on_drop: AtomicBool::new(false),
        })
    }

    fn read_posmap(file: &mut File, footer: &ChunkFooter) -> Result<Vec<PosMapEntry>> {
        file.seek(SeekFrom::Start(CHUNK_HEADER_SIZE + footer.physical_data_len))?;
        let mut buf = vec![0u8; (footer.posmap_count as u64 * POSMAP_ENTRY_SIZE) as usize];
        file.read_exact(&mut buf)?;
        Ok(buf
            .chunks_exact(POSMAP_ENTRY_SIZE as usize)
            .map(|e| PosMapEntry {
                logical: read_u32(&e[0..4]),
                physical: read_u32(&e[4..8]),
            })
            .collect())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn header(&self) -> ChunkHeader {
        self.header
    }

    pub fn number(&self) -> u32 {
        self.header.chunk_number
    }

    pub fn version(&self) -> u32 {
        self.header.chunk_version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn footer(&self) -> Option<ChunkFooter> {
        *self.footer.read()
    }

    pub fn is_sealed(&self) -> bool {
        self.footer.read().is_some()
    }

    pub fn is_scavenged(&self) -> bool {
        self.footer().map(|f| f.scavenged).unwrap_or(false)
    }

    /// First global position covered by this chunk
    pub fn base_position(&self) -> i64 {
        self.header.chunk_number as i64 * self.header.chunk_size as i64
    }

    /// Bytes of record data stored in the file
    pub fn physical_data_len(&self) -> u64 {
        match self.footer() {
            Some(f) => f.physical_data_len,
            None => self.written.load(Ordering::Acquire),
        }
    }

    /// Bytes of logical position space covered so far
    pub fn logical_data_len(&self) -> u64 {
        match self.footer() {
            Some(f) => f.logical_data_len,
            None => self.written.load(Ordering::Acquire),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Whether a record starting at this logical offset is still stored
    pub fn contains(&self, local: u64) -> bool {
        if self.is_scavenged() {
            self.posmap
                .binary_search_by_key(&local, |e| e.logical as u64)
                .is_ok()
        } else {
            local < self.logical_data_len()
        }
    }

    /// Read the record starting exactly at a logical offset
    pub fn read_at(&self, local: u64) -> Result<Option<LogRecord>> {
        let physical = if self.is_scavenged() {
            match self.posmap.binary_search_by_key(&local, |e| e.logical as u64) {
                Ok(i) => self.posmap[i].physical as u64,
                Err(_) => return Ok(None),
            }
        } else {
            if local >= self.physical_data_len() {
                return Ok(None);
            }
            local
        };
        let (record, _) = self.read_frame(physical, self.base_position() + local as i64)?;
        Ok(Some(record))
    }

    /// Read the first record at or after a logical offset, returning it
    /// with the logical offset of the following record
    pub fn read_next(&self, local: u64) -> Result<Option<(LogRecord, u64)>> {
        if self.is_scavenged() {
            let idx = self.posmap.partition_point(|e| (e.logical as u64) < local);
            let Some(entry) = self.posmap.get(idx) else {
                return Ok(None);
            };
            let position = self.base_position() + entry.logical as i64;
            let (record, _) = self.read_frame(entry.physical as u64, position)?;
            let next = match self.posmap.get(idx + 1) {
                Some(e) => e.logical as u64,
                None => self.logical_data_len(),
            };
            return Ok(Some((record, next)));
        }

        if local >= self.physical_data_len() {
            return Ok(None);
        }
        let (record, frame_len) = self.read_frame(local, self.base_position() + local as i64)?;
        Ok(Some((record, local + frame_len as u64)))
    }

    fn read_frame(&self, physical: u64, position: i64) -> Result<(LogRecord, usize)> {
        let limit = self.physical_data_len();
        if physical + RECORD_HEADER_SIZE as u64 > limit {
            return Err(StoreError::RecordNotFound(position));
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(CHUNK_HEADER_SIZE + physical))?;

        let mut header = [0u8; RECORD_HEADER_SIZE];
        file.read_exact(&mut header)?;
        let (len, crc) = parse_header(&header);

        let frame_len = RECORD_HEADER_SIZE + len;
        if physical + frame_len as u64 > limit {
            return Err(StoreError::CorruptRecord {
                position,
                reason: format!("record length {} runs past the end of chunk data", len),
            });
        }

        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;
        drop(file);

        let record = LogRecord::decode_payload(&payload, crc, position)?;
        Ok((record, frame_len))
    }

    /// Raw record data region (used by recovery scans)
    pub(crate) fn read_data(&self, len: u64) -> Result<Vec<u8>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(CHUNK_HEADER_SIZE))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Check a sealed chunk's data against the checksum and record count in
    /// its footer. Unsealed chunks are checked frame by frame in recovery.
    pub fn verify(&self) -> Result<()> {
        let Some(footer) = self.footer() else {
            return Ok(());
        };
        let data = self.read_data(footer.physical_data_len)?;
        let actual = crc32fast::hash(&data);
        if actual != footer.data_crc {
            return Err(StoreError::ChecksumMismatch {
                position: self.base_position(),
                expected: footer.data_crc,
                actual,
            });
        }

        let mut offset = 0usize;
        let mut frames = 0u64;
        while offset < data.len() {
            let position = self.base_position() + offset as i64;
            match decode_frame(&data[offset..], position) {
                FrameDecode::Complete { frame_len, .. } => {
                    offset += frame_len;
                    frames += 1;
                }
                _ => {
                    return Err(StoreError::CorruptRecord {
                        position,
                        reason: format!("undecodable frame in sealed chunk {}", self.number()),
                    })
                }
            }
        }
        if frames != footer.record_count {
            return Err(StoreError::CorruptRecord {
                position: self.base_position(),
                reason: format!(
                    "sealed chunk {} holds {} records, footer says {}",
                    self.number(),
                    frames,
                    footer.record_count
                ),
            });
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    fn set_written(&self, len: u64) {
        self.written.store(len, Ordering::Release);
    }

    fn set_sealed(&self, footer: ChunkFooter) {
        *self.footer.write() = Some(footer);
    }

    /// Delete the file once the last reader lets go of this chunk
    pub(crate) fn mark_for_deletion(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::Acquire) {
            match fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!("Deleted superseded chunk {}", self.path.display()),
                Err(e) => tracing::warn!(
                    "Failed to delete superseded chunk {}: {}",
                    self.path.display(),
                    e
                ),
            }
        }
    }
}

// =============================================================================
// ChunkWriter (active chunk)
// =============================================================================

/// Appends frames to the single writable chunk
pub struct ChunkWriter {
    chunk: Arc<Chunk>,
    file: BufWriter<File>,
    /// Physical (= logical) offset of the next frame
    offset: u64,
    record_count: u64,
    /// Running CRC over all record data
    hasher: crc32fast::Hasher,
}

impl ChunkWriter {
    /// Reopen an unsealed chunk for appending after `valid_len` bytes,
    /// cutting away anything beyond
    pub(crate) fn resume(
        chunk: Arc<Chunk>,
        valid_len: u64,
        record_count: u64,
        hasher: crc32fast::Hasher,
    ) -> Result<Self> {
        let mut file = OpenOptions::new().write(true).open(chunk.path())?;
        file.set_len(CHUNK_HEADER_SIZE + valid_len)?;
        file.sync_all()?;
        file.seek(SeekFrom::Start(CHUNK_HEADER_SIZE + valid_len))?;
        chunk.set_written(valid_len);

        Ok(Self {
            chunk,
            file: BufWriter::new(file),
            offset: valid_len,
            record_count,
            hasher,
        })
    }

    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn remaining(&self) -> u64 {
        (self.chunk.header.chunk_size as u64).saturating_sub(self.offset)
    }

    /// Global position of the next append
    pub fn position(&self) -> i64 {
        self.chunk.base_position() + self.offset as i64
    }

    /// Buffer a frame; returns the offset it was written at
    pub fn append(&mut self, frame: &[u8]) -> Result<u64> {
        let at = self.offset;
        self.file.write_all(frame)?;
        self.hasher.update(frame);
        self.offset += frame.len() as u64;
        self.record_count += 1;
        Ok(at)
    }

    /// Hand buffered bytes to the OS (and fsync when durable), then make
    /// them visible to readers
    pub fn flush(&mut self, durable: bool) -> Result<()> {
        self.file.flush()?;
        if durable {
            self.file.get_ref().sync_data()?;
        }
        self.chunk.set_written(self.offset);
        Ok(())
    }

    /// Write the footer and make the chunk read-only
    pub fn seal(mut self) -> Result<ChunkFooter> {
        self.flush(false)?;

        let footer = ChunkFooter {
            scavenged: false,
            physical_data_len: self.offset,
            logical_data_len: self.offset,
            record_count: self.record_count,
            posmap_count: 0,
            data_crc: self.hasher.clone().finalize(),
        };
        self.file.write_all(&footer.encode())?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        self.chunk.set_sealed(footer);
        tracing::info!(
            chunk = self.chunk.number(),
            records = self.record_count,
            bytes = self.offset,
            "Sealed chunk"
        );
        Ok(footer)
    }
}

// =============================================================================
// Scavenged chunk builder
// =============================================================================

/// Writes a compacted replacement for a sealed chunk.
///
/// Frames keep their logical offsets through the position map; the file
/// only becomes visible under its final name once complete.
pub struct ScavengedChunkBuilder {
    header: ChunkHeader,
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: BufWriter<File>,
    physical: u64,
    posmap: Vec<PosMapEntry>,
    hasher: crc32fast::Hasher,
}

impl ScavengedChunkBuilder {
    pub fn new(dir: &Path, number: u32, version: u32, chunk_size: u32) -> Result<Self> {
        let header = ChunkHeader {
            chunk_number: number,
            chunk_version: version,
            chunk_size,
        };
        let final_path = dir.join(Chunk::file_name(number, version));
        let tmp_path = tmp_path_for(&final_path);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut file = BufWriter::new(file);
        file.write_all(&header.encode())?;

        Ok(Self {
            header,
            tmp_path,
            final_path,
            file,
            physical: 0,
            posmap: Vec::new(),
            hasher: crc32fast::Hasher::new(),
        })
    }

    /// Copy a frame that lived at `logical` in the original chunk
    pub fn add(&mut self, logical: u64, frame: &[u8]) -> Result<()> {
        self.posmap.push(PosMapEntry {
            logical: logical as u32,
            physical: self.physical as u32,
        });
        self.file.write_all(frame)?;
        self.hasher.update(frame);
        self.physical += frame.len() as u64;
        Ok(())
    }

    pub fn record_count(&self) -> usize {
        self.posmap.len()
    }

    /// Write the position map and footer, then publish the file
    pub fn finish(mut self, logical_data_len: u64) -> Result<PathBuf> {
        for entry in &self.posmap {
            self.file.write_all(&entry.logical.to_le_bytes())?;
            self.file.write_all(&entry.physical.to_le_bytes())?;
        }
        let footer = ChunkFooter {
            scavenged: true,
            physical_data_len: self.physical,
            logical_data_len,
            record_count: self.posmap.len() as u64,
            posmap_count: self.posmap.len() as u32,
            data_crc: self.hasher.clone().finalize(),
        };
        self.file.write_all(&footer.encode())?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        fs::rename(&self.tmp_path, &self.final_path)?;
        if let Some(dir) = self.final_path.parent() {
            sync_dir(dir);
        }
        tracing::debug!(
            chunk = self.header.chunk_number,
            version = self.header.chunk_version,
            "Wrote scavenged chunk"
        );
        Ok(self.final_path)
    }

    /// Throw the partial file away
    pub fn discard(self) {
        let _ = fs::remove_file(&self.tmp_path);
    }
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn read_u64(buf: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_round_trip() {
        let name = Chunk::file_name(12, 3);
        assert_eq!(name, "chunk-000012.000003");
        assert_eq!(Chunk::parse_file_name(&name), Some((12, 3)));
        assert_eq!(Chunk::parse_file_name("chunk-12.3"), None);
        assert_eq!(Chunk::parse_file_name("indexmap"), None);
        assert_eq!(Chunk::parse_file_name("chunk-000012.000003.tmp"), None);
    }

    #[test]
    fn test_footer_encoding() {
        let footer = ChunkFooter {
            scavenged: true,
            physical_data_len: 10,
            logical_data_len: 99,
            record_count: 2,
            posmap_count: 2,
            data_crc: 0xDEADBEEF,
        };
        assert_eq!(ChunkFooter::decode(&footer.encode()), Some(footer));
        assert_eq!(ChunkFooter::decode(&[0u8; CHUNK_FOOTER_SIZE as usize]), None);
    }
}

//! PTable Reader
//!
//! Maps a PTable file and answers lookups with a midpoint-narrowed binary
//! search.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::Mmap;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::index::IndexEntry;

use super::iterator::PTableRange;
use super::{
    Midpoint, FOOTER_MAGIC, FOOTER_SIZE, FORMAT, HEADER_SIZE, MAGIC, MIDPOINT_SIZE,
};

/// An open, immutable PTable.
///
/// Shared as `Arc<PTable>`. A table superseded by a merge is marked and its
/// file is deleted when the last holder drops it.
#[derive(Debug)]
pub struct PTable {
    id: Uuid,
    path: PathBuf,
    mmap: Mmap,
    entry_count: u64,
    midpoints: Vec<Midpoint>,
    delete_on_drop: AtomicBool,
}

impl PTable {
    /// Open a PTable file
    ///
    /// # Safety
    ///
    /// The mapping is sound because PTable files are never modified once
    /// renamed into place, and every slice taken from it is bounds-checked
    /// against the lengths validated here.
    pub fn open(path: &Path, verify: bool) -> Result<Self> {
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                StoreError::Index(format!("Invalid PTable file name {}", path.display()))
            })?;

        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let file_len = mmap.len() as u64;

        if file_len < HEADER_SIZE + FOOTER_SIZE {
            return Err(StoreError::Index(format!(
                "PTable {} is too small ({} bytes)",
                path.display(),
                file_len
            )));
        }
        if &mmap[0..4] != MAGIC {
            return Err(StoreError::Index(format!(
                "Invalid PTable magic in {}: {:?}",
                path.display(),
                &mmap[0..4]
            )));
        }
        if mmap[4] != FORMAT {
            return Err(StoreError::Index(format!(
                "Unsupported PTable format {} in {}",
                mmap[4],
                path.display()
            )));
        }

        let entry_count = read_u64(&mmap[8..16]);
        let footer = &mmap[(file_len - FOOTER_SIZE) as usize..];
        if &footer[12..16] != FOOTER_MAGIC {
            return Err(StoreError::Index(format!(
                "PTable {} has no valid footer",
                path.display()
            )));
        }
        let midpoint_count = read_u64(&footer[0..8]);
        let stored_crc = u32::from_le_bytes([footer[8], footer[9], footer[10], footer[11]]);

        let expected_len = HEADER_SIZE
            + entry_count * IndexEntry::SIZE as u64
            + midpoint_count * MIDPOINT_SIZE
            + FOOTER_SIZE;
        if expected_len != file_len {
            return Err(StoreError::Index(format!(
                "PTable {} has length {}, expected {}",
                path.display(),
                file_len,
                expected_len
            )));
        }

        let entries_end = (HEADER_SIZE + entry_count * IndexEntry::SIZE as u64) as usize;
        if verify {
            let actual = crc32fast::hash(&mmap[HEADER_SIZE as usize..entries_end]);
            if actual != stored_crc {
                return Err(StoreError::Index(format!(
                    "PTable {} checksum mismatch: expected {:#010x}, got {:#010x}",
                    path.display(),
                    stored_crc,
                    actual
                )));
            }
        }

        let midpoints = mmap[entries_end..entries_end + (midpoint_count * MIDPOINT_SIZE) as usize]
            .chunks_exact(MIDPOINT_SIZE as usize)
            .map(|m| Midpoint {
                key: (read_u64(&m[0..8]), read_u64(&m[8..16]) as i64),
                index: read_u64(&m[16..24]),
            })
            .collect();

        Ok(Self {
            id,
            path: path.to_path_buf(),
            mmap,
            entry_count,
            midpoints,
            delete_on_drop: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Entry at index `i` (caller keeps `i < entry_count`)
    pub(crate) fn entry(&self, i: u64) -> IndexEntry {
        let start = (HEADER_SIZE + i * IndexEntry::SIZE as u64) as usize;
        IndexEntry::decode(&self.mmap[start..start + IndexEntry::SIZE])
    }

    // =========================================================================
    // Searches
    // =========================================================================

    /// Candidate index window `[lo, hi]` for entries related to `key`,
    /// narrowed by the cached midpoints. `strict` selects the window for
    /// the first entry greater than the key instead of not-less-than.
    fn window(&self, key: (u64, i64), strict: bool) -> (u64, u64) {
        let before = |m: &Midpoint| if strict { m.key <= key } else { m.key < key };
        let j = self.midpoints.partition_point(before);
        let lo = if j == 0 { 0 } else { self.midpoints[j - 1].index + 1 };
        let hi = match self.midpoints.get(j) {
            Some(m) => m.index,
            None => self.entry_count,
        };
        (lo.min(hi), hi)
    }

    /// Index of the first entry whose key is `>= key` (`> key` when strict)
    fn bound(&self, key: (u64, i64), strict: bool) -> u64 {
        let (mut lo, mut hi) = self.window(key, strict);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let k = self.entry(mid).key();
            let go_right = if strict { k <= key } else { k < key };
            if go_right {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Most recent position recorded for a key
    pub fn lookup(&self, stream_hash: u64, event_number: i64) -> Option<i64> {
        let i = self.bound((stream_hash, event_number), false);
        if i >= self.entry_count {
            return None;
        }
        let entry = self.entry(i);
        (entry.key() == (stream_hash, event_number)).then_some(entry.position)
    }

    /// Entries of `stream_hash` with event numbers in `[from, to]`
    pub fn range(&self, stream_hash: u64, from: i64, to: i64) -> PTableRange<'_> {
        if from > to {
            return PTableRange::new(self, 0, 0);
        }
        let start = self.bound((stream_hash, from), false);
        let end = self.bound((stream_hash, to), true);
        PTableRange::new(self, start, end.max(start))
    }

    /// Highest event number stored for a stream hash
    pub fn last_event_number(&self, stream_hash: u64) -> Option<i64> {
        let end = self.bound((stream_hash, i64::MAX), true);
        if end == 0 {
            return None;
        }
        let entry = self.entry(end - 1);
        (entry.stream_hash == stream_hash).then_some(entry.event_number)
    }

    /// All entries in order; each call starts from the beginning
    pub fn iter(&self) -> PTableRange<'_> {
        PTableRange::new(self, 0, self.entry_count)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Delete the file once no reader holds this table
    pub(crate) fn mark_for_deletion(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }
}

impl Drop for PTable {
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::Acquire) {
            match fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!(id = %self.id, "Deleted superseded PTable"),
                Err(e) => tracing::warn!(id = %self.id, "Failed to delete PTable: {}", e),
            }
        }
    }
}

fn read_u64(buf: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(bytes)
}

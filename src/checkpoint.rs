//! Checkpoints
//!
//! Durable position markers used for crash recovery.
//!
//! ## File Format
//! ```text
//! ┌──────────────┬──────────────┐
//! │ Value: i64   │ CRC32: u32   │
//! └──────────────┴──────────────┘
//! ```
//!
//! A checkpoint is persisted by writing `{name}.chk.tmp`, syncing it and
//! renaming it over `{name}.chk`, so a crash leaves either the old or the
//! new value on disk and never a torn one.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, StoreError};

const CHECKPOINT_FILE_SIZE: usize = 12;

/// A single named checkpoint
#[derive(Debug)]
pub struct Checkpoint {
    name: String,
    path: PathBuf,
    /// Latest value written (possibly not yet persisted)
    value: AtomicI64,
    /// Latest value known to be on disk
    flushed: AtomicI64,
    durable: bool,
    /// Whether a checkpoint file was found on open
    loaded: bool,
    /// Serializes persist operations
    flush_lock: Mutex<()>,
}

impl Checkpoint {
    /// Open a checkpoint, starting at `initial` when no file exists yet
    pub fn open(dir: &Path, name: &str, initial: i64, durable: bool) -> Result<Self> {
        let path = dir.join(format!("{}.chk", name));
        let _ = fs::remove_file(dir.join(format!("{}.chk.tmp", name)));

        let loaded = path.exists();
        let value = if loaded {
            Self::read_file(&path)?
        } else {
            initial
        };

        Ok(Self {
            name: name.to_string(),
            path,
            value: AtomicI64::new(value),
            flushed: AtomicI64::new(value),
            durable,
            loaded,
            flush_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False when the file was absent on open and the value is the default
    pub fn was_loaded(&self) -> bool {
        self.loaded
    }

    /// Current in-memory value
    pub fn read(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Last value persisted to disk
    pub fn read_flushed(&self) -> i64 {
        self.flushed.load(Ordering::Acquire)
    }

    /// Update the in-memory value; call `flush()` to persist it
    pub fn write(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Persist the current value atomically
    pub fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock();
        let value = self.read();
        if value == self.read_flushed() && self.path.exists() {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(CHECKPOINT_FILE_SIZE);
        buf.extend_from_slice(&value.to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&value.to_le_bytes()).to_le_bytes());
        write_atomically(&self.path, &buf, self.durable)?;

        self.flushed.store(value, Ordering::Release);
        Ok(())
    }

    /// Write and persist in one step
    pub fn write_and_flush(&self, value: i64) -> Result<()> {
        self.write(value);
        self.flush()
    }

    fn read_file(path: &Path) -> Result<i64> {
        let bytes = fs::read(path)?;
        if bytes.len() != CHECKPOINT_FILE_SIZE {
            return Err(StoreError::Storage(format!(
                "Checkpoint {} has invalid size {}",
                path.display(),
                bytes.len()
            )));
        }
        let value_bytes: [u8; 8] = bytes[0..8].try_into().unwrap_or([0; 8]);
        let stored_crc = u32::from_le_bytes(bytes[8..12].try_into().unwrap_or([0; 4]));
        let actual_crc = crc32fast::hash(&value_bytes);
        if stored_crc != actual_crc {
            return Err(StoreError::ChecksumMismatch {
                position: -1,
                expected: stored_crc,
                actual: actual_crc,
            });
        }
        Ok(i64::from_le_bytes(value_bytes))
    }
}

/// The checkpoints the engine keeps
#[derive(Debug, Clone)]
pub struct Checkpoints {
    /// End of the last flushed record in the log
    pub writer: Arc<Checkpoint>,
    /// Position up to which every committed record has been indexed
    pub chaser: Arc<Checkpoint>,
    /// Start of the current epoch; preserved but never advanced by a single node
    pub epoch: Arc<Checkpoint>,
}

impl Checkpoints {
    pub const WRITER: &'static str = "writer";
    pub const CHASER: &'static str = "chaser";
    pub const EPOCH: &'static str = "epoch";

    pub fn open(dir: &Path, durable: bool) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            writer: Arc::new(Checkpoint::open(dir, Self::WRITER, 0, durable)?),
            chaser: Arc::new(Checkpoint::open(dir, Self::CHASER, 0, durable)?),
            epoch: Arc::new(Checkpoint::open(dir, Self::EPOCH, -1, durable)?),
        })
    }

    pub fn flush_all(&self) -> Result<()> {
        self.writer.flush()?;
        self.chaser.flush()?;
        self.epoch.flush()
    }
}

// =============================================================================
// Atomic file replacement
// =============================================================================

/// Replace `path` with `bytes` via write-temp-then-rename
pub(crate) fn write_atomically(path: &Path, bytes: &[u8], durable: bool) -> Result<()> {
    let tmp_path = tmp_path_for(path);
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(bytes)?;
        if durable {
            file.sync_all()?;
        }
    }
    fs::rename(&tmp_path, path)?;
    if durable {
        if let Some(parent) = path.parent() {
            sync_dir(parent);
        }
    }
    Ok(())
}

pub(crate) fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Best effort: not every platform can fsync a directory handle
pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

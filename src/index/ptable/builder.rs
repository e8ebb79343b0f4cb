//! PTable Builder
//!
//! Streams sorted index entries into a new PTable file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::checkpoint::{sync_dir, tmp_path_for};
use crate::error::{Result, StoreError};
use crate::index::IndexEntry;

use super::reader::PTable;
use super::{Midpoint, FORMAT, FOOTER_MAGIC, MAGIC, PTABLE_EXTENSION};

/// Builder for creating a PTable from entries in sorted order
pub struct PTableBuilder {
    id: Uuid,
    tmp_path: PathBuf,
    final_path: PathBuf,
    writer: BufWriter<File>,
    entry_count: u64,
    midpoint_interval: u64,
    midpoints: Vec<Midpoint>,
    last: Option<IndexEntry>,
    /// Running CRC over the entry block
    hasher: crc32fast::Hasher,
}

impl PTableBuilder {
    /// Start a new table in `dir`
    ///
    /// Writes the header immediately; call `add()` in entry order, then
    /// `finish()` to write midpoints and footer.
    pub fn new(dir: &Path, midpoint_interval: usize) -> Result<Self> {
        let id = Uuid::new_v4();
        let final_path = dir.join(format!("{}.{}", id, PTABLE_EXTENSION));
        let tmp_path = tmp_path_for(&final_path);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(MAGIC)?;
        writer.write_all(&[FORMAT, 0, 0, 0])?;
        writer.write_all(&0u64.to_le_bytes())?; // entry count, patched in finish

        Ok(Self {
            id,
            tmp_path,
            final_path,
            writer,
            entry_count: 0,
            midpoint_interval: midpoint_interval.max(1) as u64,
            midpoints: Vec::new(),
            last: None,
            hasher: crc32fast::Hasher::new(),
        })
    }

    /// Write a whole sorted sequence and open the result
    pub fn build(
        dir: &Path,
        entries: impl IntoIterator<Item = IndexEntry>,
        midpoint_interval: usize,
    ) -> Result<PTable> {
        let mut builder = Self::new(dir, midpoint_interval)?;
        for entry in entries {
            if let Err(e) = builder.add(entry) {
                builder.discard();
                return Err(e);
            }
        }
        builder.finish()
    }

    /// Append an entry (must not sort before the previous one)
    pub fn add(&mut self, entry: IndexEntry) -> Result<()> {
        if let Some(last) = self.last {
            if entry < last {
                return Err(StoreError::Index(format!(
                    "PTable entries out of order: {:?} after {:?}",
                    entry, last
                )));
            }
        }

        if self.entry_count % self.midpoint_interval == 0 {
            self.midpoints.push(Midpoint {
                key: entry.key(),
                index: self.entry_count,
            });
        }

        let mut buf = [0u8; IndexEntry::SIZE];
        entry.encode_into(&mut buf);
        self.writer.write_all(&buf)?;
        self.hasher.update(&buf);

        self.entry_count += 1;
        self.last = Some(entry);
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Write midpoints and footer, publish the file and open it
    pub fn finish(mut self) -> Result<PTable> {
        if let Some(last) = self.last {
            let last_index = self.entry_count - 1;
            if self.midpoints.last().map(|m| m.index) != Some(last_index) {
                self.midpoints.push(Midpoint {
                    key: last.key(),
                    index: last_index,
                });
            }
        }

        for midpoint in &self.midpoints {
            self.writer.write_all(&midpoint.key.0.to_le_bytes())?;
            self.writer.write_all(&midpoint.key.1.to_le_bytes())?;
            self.writer.write_all(&midpoint.index.to_le_bytes())?;
        }

        let crc = self.hasher.clone().finalize();
        self.writer.write_all(&(self.midpoints.len() as u64).to_le_bytes())?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(FOOTER_MAGIC)?;
        self.writer.flush()?;

        let mut file = self.writer.into_inner().map_err(|e| {
            StoreError::Index(format!("Failed to flush PTable: {}", e))
        })?;
        file.seek(SeekFrom::Start(8))?; // after magic + format
        file.write_all(&self.entry_count.to_le_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.final_path)?;
        if let Some(dir) = self.final_path.parent() {
            sync_dir(dir);
        }

        tracing::debug!(
            id = %self.id,
            entries = self.entry_count,
            midpoints = self.midpoints.len(),
            "Wrote PTable"
        );
        PTable::open(&self.final_path, false)
    }

    /// Abandon the table, removing the partial file
    pub fn discard(self) {
        let tmp_path = self.tmp_path.clone();
        drop(self.writer);
        let _ = fs::remove_file(tmp_path);
    }
}

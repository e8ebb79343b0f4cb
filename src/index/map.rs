//! IndexMap
//!
//! The authoritative list of PTables per level plus the log positions the
//! tables cover. Every change produces a new map; the persisted manifest
//! is replaced atomically.
//!
//! ## Manifest Format
//! ```text
//! ┌──────────────────────────────┬──────────────┐
//! │ bincode(Manifest)            │ CRC32: u32   │
//! └──────────────────────────────┴──────────────┘
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkpoint::write_atomically;
use crate::error::{Result, StoreError};

use super::merge::{merge_ptables, PositionOracle};
use super::ptable::{PTable, PTABLE_EXTENSION};

/// Name of the manifest file inside the index directory
pub const INDEXMAP_FILE_NAME: &str = "indexmap";

const MANIFEST_FORMAT: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    format: u8,
    generation: u64,
    prepare_checkpoint: i64,
    commit_checkpoint: i64,
    /// Table ids per level, oldest first within a level
    levels: Vec<Vec<Uuid>>,
}

/// Output of a merge, not yet applied to the map
#[derive(Debug)]
pub struct MergeResult {
    pub level: usize,
    pub superseded: Vec<Arc<PTable>>,
    pub output: Arc<PTable>,
}

/// Immutable snapshot of the on-disk index.
///
/// Level 0 holds the newest tables; within a level, later tables are newer.
#[derive(Debug, Clone)]
pub struct IndexMap {
    dir: PathBuf,
    generation: u64,
    prepare_checkpoint: i64,
    commit_checkpoint: i64,
    levels: Vec<Vec<Arc<PTable>>>,
    max_tables_per_level: usize,
}

impl IndexMap {
    /// A map with no tables
    pub fn empty(dir: &Path, max_tables_per_level: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            generation: 0,
            prepare_checkpoint: -1,
            commit_checkpoint: -1,
            levels: Vec::new(),
            max_tables_per_level,
        }
    }

    /// Load the manifest in `dir`, opening every listed table and deleting
    /// files the manifest does not reference
    pub fn load(dir: &Path, max_tables_per_level: usize, verify: bool) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let manifest_path = dir.join(INDEXMAP_FILE_NAME);

        let mut map = Self::empty(dir, max_tables_per_level);
        if manifest_path.exists() {
            let manifest = Self::read_manifest(&manifest_path)?;
            map.generation = manifest.generation;
            map.prepare_checkpoint = manifest.prepare_checkpoint;
            map.commit_checkpoint = manifest.commit_checkpoint;

            for ids in &manifest.levels {
                let mut level = Vec::with_capacity(ids.len());
                for id in ids {
                    let path = dir.join(format!("{}.{}", id, PTABLE_EXTENSION));
                    if !path.exists() {
                        return Err(StoreError::Index(format!(
                            "PTable {} listed in the index map is missing",
                            id
                        )));
                    }
                    level.push(Arc::new(PTable::open(&path, verify)?));
                }
                map.levels.push(level);
            }
        }

        map.collect_garbage()?;

        tracing::info!(
            generation = map.generation,
            tables = map.table_count(),
            commit_checkpoint = map.commit_checkpoint,
            "Loaded index map"
        );
        Ok(map)
    }

    fn read_manifest(path: &Path) -> Result<Manifest> {
        let bytes = fs::read(path)?;
        if bytes.len() < 4 {
            return Err(StoreError::Index("Index map manifest is truncated".to_string()));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = crc32fast::hash(body);
        if stored != actual {
            return Err(StoreError::Index(format!(
                "Index map manifest checksum mismatch: expected {:#010x}, got {:#010x}",
                stored, actual
            )));
        }

        let manifest: Manifest = bincode::deserialize(body)?;
        if manifest.format != MANIFEST_FORMAT {
            return Err(StoreError::Index(format!(
                "Unsupported index map format {}",
                manifest.format
            )));
        }
        Ok(manifest)
    }

    /// Remove temp files and tables no level references
    fn collect_garbage(&self) -> Result<()> {
        let live: HashSet<Uuid> = self.tables().map(|t| t.id()).collect();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let orphan = if name.ends_with(".tmp") {
                true
            } else if path.extension().and_then(|e| e.to_str()) == Some(PTABLE_EXTENSION) {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .map(|id| !live.contains(&id))
                    .unwrap_or(false)
            } else {
                false
            };

            if orphan {
                tracing::warn!("Removing orphaned index file {}", path.display());
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Write the manifest (temp file + rename)
    pub fn persist(&self, durable: bool) -> Result<()> {
        let manifest = Manifest {
            format: MANIFEST_FORMAT,
            generation: self.generation,
            prepare_checkpoint: self.prepare_checkpoint,
            commit_checkpoint: self.commit_checkpoint,
            levels: self
                .levels
                .iter()
                .map(|level| level.iter().map(|t| t.id()).collect())
                .collect(),
        };
        let mut bytes = bincode::serialize(&manifest)?;
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        write_atomically(&self.dir.join(INDEXMAP_FILE_NAME), &bytes, durable)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Increases with every flush or merge
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn prepare_checkpoint(&self) -> i64 {
        self.prepare_checkpoint
    }

    /// Log position up to which the tables are complete
    pub fn commit_checkpoint(&self) -> i64 {
        self.commit_checkpoint
    }

    pub fn levels(&self) -> &[Vec<Arc<PTable>>] {
        &self.levels
    }

    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn tables_per_level(&self) -> Vec<usize> {
        self.levels.iter().map(Vec::len).collect()
    }

    /// Every table, newest first: level 0 upward, each level newest first
    pub fn tables(&self) -> impl Iterator<Item = &Arc<PTable>> + '_ {
        self.levels.iter().flat_map(|level| level.iter().rev())
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// New map with `table` added as the newest level 0 table
    pub fn add_ptable(&self, table: Arc<PTable>, prepare_checkpoint: i64, commit_checkpoint: i64) -> Self {
        let mut next = self.clone();
        if next.levels.is_empty() {
            next.levels.push(Vec::new());
        }
        next.levels[0].push(table);
        next.generation += 1;
        next.prepare_checkpoint = next.prepare_checkpoint.max(prepare_checkpoint);
        next.commit_checkpoint = next.commit_checkpoint.max(commit_checkpoint);
        next
    }

    /// Merge the lowest full level, if any. The map itself is unchanged;
    /// apply the result with `replace_merged`.
    pub fn try_merge(
        &self,
        midpoint_interval: usize,
        oracle: &dyn PositionOracle,
    ) -> Result<Option<MergeResult>> {
        let Some(level) = self
            .levels
            .iter()
            .position(|tables| tables.len() >= self.max_tables_per_level)
        else {
            return Ok(None);
        };

        let inputs = &self.levels[level];
        tracing::info!(level, inputs = inputs.len(), "Merging PTables");
        let output = merge_ptables(&self.dir, inputs, midpoint_interval, oracle)?;

        Ok(Some(MergeResult {
            level,
            superseded: inputs.clone(),
            output: Arc::new(output),
        }))
    }

    /// New map with the merge inputs replaced by its output one level up
    pub fn replace_merged(&self, result: &MergeResult) -> Result<Self> {
        let current = self.levels.get(result.level).ok_or_else(|| {
            StoreError::MergeConflict(format!("level {} no longer exists", result.level))
        })?;
        for table in &result.superseded {
            if !current.iter().any(|t| t.id() == table.id()) {
                return Err(StoreError::MergeConflict(format!(
                    "merge input {} is no longer at level {}",
                    table.id(),
                    result.level
                )));
            }
        }

        let superseded: HashSet<Uuid> = result.superseded.iter().map(|t| t.id()).collect();
        let mut next = self.clone();
        next.levels[result.level].retain(|t| !superseded.contains(&t.id()));
        if next.levels.len() <= result.level + 1 {
            next.levels.push(Vec::new());
        }
        next.levels[result.level + 1].push(Arc::clone(&result.output));
        next.generation += 1;
        Ok(next)
    }
}

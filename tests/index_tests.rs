//! Tests for the stream index: PTables, merges, the IndexMap and the
//! TableIndex worker
//!
//! These tests verify:
//! - PTable lookups and ranges (with and without midpoints)
//! - Checksum verification on open
//! - Merge resolution: newest wins, dead positions dropped, collisions kept
//! - IndexMap persistence, garbage collection and merge conflicts
//! - TableIndex flush and level merge in the background worker

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eventlog::bus::{Bus, Message, Topic};
use eventlog::index::{
    merge_ptables, IndexEntry, IndexMap, NoLog, PTable, PTableBuilder, PositionOracle, TableIndex,
    PTABLE_EXTENSION,
};
use eventlog::{Config, StoreError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn table(dir: &Path, entries: &[(u64, i64, i64)]) -> Arc<PTable> {
    let mut entries: Vec<IndexEntry> = entries
        .iter()
        .map(|&(h, n, p)| IndexEntry::new(h, n, p))
        .collect();
    entries.sort();
    Arc::new(PTableBuilder::build(dir, entries, 4).unwrap())
}

fn contents(table: &PTable) -> Vec<(u64, i64, i64)> {
    table
        .iter()
        .map(|e| (e.stream_hash, e.event_number, e.position))
        .collect()
}

fn ptable_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter(|e| {
            e.as_ref().unwrap().path().extension().and_then(|x| x.to_str()) == Some(PTABLE_EXTENSION)
        })
        .count()
}

/// Oracle backed by a fixed position -> stream map; unknown positions are dead
#[derive(Default)]
struct MapOracle {
    streams: HashMap<i64, String>,
}

impl MapOracle {
    fn with(mut self, position: i64, stream: &str) -> Self {
        self.streams.insert(position, stream.to_string());
        self
    }
}

impl PositionOracle for MapOracle {
    fn is_live(&self, position: i64) -> bool {
        self.streams.contains_key(&position)
    }

    fn stream_at(&self, position: i64) -> Option<String> {
        self.streams.get(&position).cloned()
    }
}

fn index_config(dir: &Path, max_tables_per_level: usize) -> Config {
    Config::builder()
        .data_dir(dir)
        .memtable_max_entries(1_000)
        .max_tables_per_level(max_tables_per_level)
        .midpoint_interval(8)
        .build()
}

fn open_index(dir: &Path, config: &Config, bus: Arc<Bus>, log_end: i64) -> TableIndex {
    fs::create_dir_all(dir).unwrap();
    TableIndex::open(dir, config, Arc::new(NoLog), bus, log_end).unwrap()
}

fn test_bus() -> Arc<Bus> {
    Arc::new(Bus::new("test", Duration::from_millis(48)))
}

// =============================================================================
// PTable Tests
// =============================================================================

#[test]
fn test_ptable_lookup_every_entry() {
    let temp = TempDir::new().unwrap();
    let entries: Vec<(u64, i64, i64)> = (0..200)
        .map(|i| ((i % 7) as u64, i / 7, i * 100))
        .collect();
    let t = table(temp.path(), &entries);

    assert_eq!(t.entry_count(), 200);
    for &(h, n, p) in &entries {
        assert_eq!(t.lookup(h, n), Some(p), "key ({}, {})", h, n);
    }
    assert_eq!(t.lookup(3, 10_000), None);
    assert_eq!(t.lookup(99, 0), None);
}

#[test]
fn test_ptable_lookup_prefers_highest_position() {
    let temp = TempDir::new().unwrap();
    let t = table(temp.path(), &[(5, 0, 10), (5, 0, 900), (5, 0, 400), (5, 1, 20)]);

    assert_eq!(t.lookup(5, 0), Some(900));
    let positions: Vec<i64> = t.range(5, 0, 0).map(|e| e.position).collect();
    assert_eq!(positions, vec![900, 400, 10]);
}

#[test]
fn test_ptable_range_stays_within_stream() {
    let temp = TempDir::new().unwrap();
    let mut entries = Vec::new();
    for n in 0..50 {
        entries.push((1, n, n * 10));
        entries.push((2, n, 10_000 + n));
        entries.push((3, n, 20_000 + n));
    }
    let t = table(temp.path(), &entries);

    let numbers: Vec<i64> = t.range(2, 10, 19).map(|e| e.event_number).collect();
    assert_eq!(numbers, (10..=19).collect::<Vec<_>>());
    assert!(t.range(2, 19, 10).next().is_none());
    assert!(t.range(4, 0, i64::MAX).next().is_none());

    assert_eq!(t.last_event_number(1), Some(49));
    assert_eq!(t.last_event_number(3), Some(49));
    assert_eq!(t.last_event_number(0), None);
    assert_eq!(t.last_event_number(4), None);
}

#[test]
fn test_ptable_keeps_max_event_number() {
    let temp = TempDir::new().unwrap();
    let t = table(temp.path(), &[(8, 0, 1), (8, 1, 2), (8, i64::MAX, 3)]);

    assert_eq!(t.last_event_number(8), Some(i64::MAX));
    assert_eq!(t.lookup(8, i64::MAX), Some(3));
}

#[test]
fn test_empty_ptable() {
    let temp = TempDir::new().unwrap();
    let t = table(temp.path(), &[]);

    assert!(t.is_empty());
    assert_eq!(t.lookup(0, 0), None);
    assert_eq!(t.iter().count(), 0);
    assert!(PTable::open(t.path(), true).is_ok());
}

#[test]
fn test_ptable_builder_rejects_unsorted_entries() {
    let temp = TempDir::new().unwrap();
    let mut builder = PTableBuilder::new(temp.path(), 4).unwrap();
    builder.add(IndexEntry::new(2, 0, 0)).unwrap();

    let result = builder.add(IndexEntry::new(1, 0, 0));
    assert!(matches!(result, Err(StoreError::Index(_))));
    builder.discard();
    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
}

#[test]
fn test_ptable_checksum_is_verified_on_open() {
    let temp = TempDir::new().unwrap();
    let entries: Vec<(u64, i64, i64)> = (0..20).map(|i| (1, i, i)).collect();
    let path = table(temp.path(), &entries).path().to_path_buf();

    // Flip a byte inside the entry block (header is 16 bytes)
    let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(16 + 5)).unwrap();
    file.write_all(&[0xFF]).unwrap();
    drop(file);

    assert!(matches!(PTable::open(&path, true), Err(StoreError::Index(_))));
    assert!(PTable::open(&path, false).is_ok());
}

#[test]
fn test_ptable_rejects_bad_magic() {
    let temp = TempDir::new().unwrap();
    let path = table(temp.path(), &[(1, 0, 0)]).path().to_path_buf();

    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.write_all(b"NOPE").unwrap();
    drop(file);

    assert!(matches!(PTable::open(&path, false), Err(StoreError::Index(_))));
}

// =============================================================================
// Merge Tests
// =============================================================================

#[test]
fn test_merge_newest_table_wins() {
    let temp = TempDir::new().unwrap();
    let older = table(temp.path(), &[(1, 0, 100), (1, 1, 110), (2, 0, 120)]);
    let newer = table(temp.path(), &[(1, 0, 500), (3, 0, 510)]);

    let merged = merge_ptables(temp.path(), &[older, newer], 4, &NoLog).unwrap();
    assert_eq!(
        contents(&merged),
        vec![(1, 0, 500), (1, 1, 110), (2, 0, 120), (3, 0, 510)]
    );
}

#[test]
fn test_merge_is_associative() {
    let temp = TempDir::new().unwrap();
    let a = table(temp.path(), &[(1, 0, 1), (1, 1, 2), (2, 0, 3)]);
    let b = table(temp.path(), &[(1, 1, 20), (2, 1, 21), (3, 0, 22)]);
    let c = table(temp.path(), &[(1, 0, 30), (3, 0, 31), (4, 0, 32)]);

    let (a2, b2, c2) = (a.clone(), b.clone(), c.clone());

    let ab = Arc::new(merge_ptables(temp.path(), &[a.clone(), b.clone()], 4, &NoLog).unwrap());
    let left = merge_ptables(temp.path(), &[ab, c.clone()], 4, &NoLog).unwrap();

    let bc = Arc::new(merge_ptables(temp.path(), &[b, c], 4, &NoLog).unwrap());
    let right = merge_ptables(temp.path(), &[a, bc], 4, &NoLog).unwrap();

    let direct = merge_ptables(temp.path(), &[a2, b2, c2], 4, &NoLog).unwrap();

    assert_eq!(contents(&left), contents(&right));
    assert_eq!(contents(&left), contents(&direct));
    assert_eq!(
        contents(&left),
        vec![(1, 0, 30), (1, 1, 20), (2, 0, 3), (2, 1, 21), (3, 0, 31), (4, 0, 32)]
    );
}

#[test]
fn test_merge_drops_scavenged_positions() {
    let temp = TempDir::new().unwrap();
    let older = table(temp.path(), &[(1, 0, 100), (1, 1, 200)]);
    let newer = table(temp.path(), &[(1, 2, 300)]);

    // Position 200 no longer exists in the log
    let oracle = MapOracle::default().with(100, "a").with(300, "a");
    let merged = merge_ptables(temp.path(), &[older, newer], 4, &oracle).unwrap();
    assert_eq!(contents(&merged), vec![(1, 0, 100), (1, 2, 300)]);
}

#[test]
fn test_merge_keeps_hash_collisions() {
    let temp = TempDir::new().unwrap();
    // Streams "a" and "b" share hash 9
    let older = table(temp.path(), &[(9, 0, 100)]);
    let newer = table(temp.path(), &[(9, 0, 200)]);

    let oracle = MapOracle::default().with(100, "a").with(200, "b");
    let merged = merge_ptables(temp.path(), &[older, newer], 4, &oracle).unwrap();
    assert_eq!(contents(&merged), vec![(9, 0, 200), (9, 0, 100)]);
}

#[test]
fn test_merge_drops_exact_duplicates() {
    let temp = TempDir::new().unwrap();
    let older = table(temp.path(), &[(1, 0, 100), (1, 1, 150)]);
    let newer = table(temp.path(), &[(1, 0, 100)]);

    let merged = merge_ptables(temp.path(), &[older, newer], 4, &NoLog).unwrap();
    assert_eq!(contents(&merged), vec![(1, 0, 100), (1, 1, 150)]);
}

// =============================================================================
// IndexMap Tests
// =============================================================================

#[test]
fn test_index_map_persist_and_load() {
    let temp = TempDir::new().unwrap();
    let t1 = table(temp.path(), &[(1, 0, 0)]);
    let t2 = table(temp.path(), &[(1, 1, 50)]);

    let map = IndexMap::empty(temp.path(), 4)
        .add_ptable(t1.clone(), 10, 40)
        .add_ptable(t2.clone(), 60, 90);
    map.persist(false).unwrap();

    let loaded = IndexMap::load(temp.path(), 4, true).unwrap();
    assert_eq!(loaded.generation(), 2);
    assert_eq!(loaded.prepare_checkpoint(), 60);
    assert_eq!(loaded.commit_checkpoint(), 90);
    assert_eq!(loaded.tables_per_level(), vec![2]);

    // Newest first
    let ids: Vec<_> = loaded.tables().map(|t| t.id()).collect();
    assert_eq!(ids, vec![t2.id(), t1.id()]);
}

#[test]
fn test_index_map_load_removes_orphans() {
    let temp = TempDir::new().unwrap();
    let kept = table(temp.path(), &[(1, 0, 0)]);
    let orphan = table(temp.path(), &[(2, 0, 0)]);
    let orphan_path = orphan.path().to_path_buf();
    fs::write(temp.path().join("leftover.ptable.tmp"), b"partial").unwrap();

    IndexMap::empty(temp.path(), 4)
        .add_ptable(kept.clone(), 0, 10)
        .persist(false)
        .unwrap();

    let loaded = IndexMap::load(temp.path(), 4, false).unwrap();
    assert_eq!(loaded.table_count(), 1);
    assert!(kept.path().exists());
    assert!(!orphan_path.exists());
    assert!(!temp.path().join("leftover.ptable.tmp").exists());
}

#[test]
fn test_index_map_missing_table_is_an_error() {
    let temp = TempDir::new().unwrap();
    let t = table(temp.path(), &[(1, 0, 0)]);
    IndexMap::empty(temp.path(), 4)
        .add_ptable(t.clone(), 0, 10)
        .persist(false)
        .unwrap();
    fs::remove_file(t.path()).unwrap();

    assert!(matches!(
        IndexMap::load(temp.path(), 4, false),
        Err(StoreError::Index(_))
    ));
}

#[test]
fn test_index_map_corrupt_manifest_is_an_error() {
    let temp = TempDir::new().unwrap();
    IndexMap::empty(temp.path(), 4).persist(false).unwrap();
    let path = temp.path().join(eventlog::index::INDEXMAP_FILE_NAME);
    let mut bytes = fs::read(&path).unwrap();
    bytes[0] ^= 0xFF;
    fs::write(&path, bytes).unwrap();

    assert!(matches!(
        IndexMap::load(temp.path(), 4, false),
        Err(StoreError::Index(_))
    ));
}

#[test]
fn test_index_map_merge_moves_level_up() {
    let temp = TempDir::new().unwrap();
    let map = IndexMap::empty(temp.path(), 2)
        .add_ptable(table(temp.path(), &[(1, 0, 0), (1, 1, 10)]), 0, 20)
        .add_ptable(table(temp.path(), &[(1, 1, 30)]), 30, 40);

    let result = map.try_merge(4, &NoLog).unwrap().expect("level 0 is full");
    assert_eq!(result.level, 0);
    assert_eq!(result.superseded.len(), 2);
    assert_eq!(contents(&result.output), vec![(1, 0, 0), (1, 1, 30)]);

    let merged = map.replace_merged(&result).unwrap();
    assert_eq!(merged.tables_per_level(), vec![0, 1]);
    assert_eq!(merged.generation(), map.generation() + 1);
    assert_eq!(merged.commit_checkpoint(), 40);
    assert!(merged.try_merge(4, &NoLog).unwrap().is_none());

    // The inputs are gone from the merged map
    assert!(matches!(
        merged.replace_merged(&result),
        Err(StoreError::MergeConflict(_))
    ));
}

// =============================================================================
// TableIndex Tests
// =============================================================================

#[test]
fn test_table_index_reads_memtable_and_tables() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("index");
    let config = index_config(temp.path(), 4);
    let index = open_index(&dir, &config, test_bus(), i64::MAX);

    index.add(&[IndexEntry::new(1, 0, 0), IndexEntry::new(1, 1, 50)], 50, 80).unwrap();
    index.flush().unwrap();
    index.add(&[IndexEntry::new(1, 2, 100)], 100, 120).unwrap();

    let snapshot = index.snapshot();
    assert_eq!(snapshot.candidates(1, 0), vec![0]);
    assert_eq!(snapshot.candidates(1, 2), vec![100]);
    assert_eq!(snapshot.max_event_number(1), Some(2));
    assert_eq!(snapshot.range(1, 0, 10).keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(snapshot.max_event_number(2), None);

    let stats = index.stats();
    assert_eq!(stats.memtable_entries, 1);
    assert_eq!(stats.tables_per_level, vec![1]);
    assert_eq!(stats.commit_checkpoint, 80);
    assert_eq!(index.commit_checkpoint(), 80);
}

#[test]
fn test_table_index_merges_full_levels() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("index");
    let config = index_config(temp.path(), 2);
    let bus = test_bus();

    let flushed = Arc::new(AtomicUsize::new(0));
    let merged = Arc::new(AtomicUsize::new(0));
    {
        let flushed = Arc::clone(&flushed);
        let merged = Arc::clone(&merged);
        bus.subscribe(Topic::Index, move |message| match message {
            Message::PTableFlushed { .. } => {
                flushed.fetch_add(1, Ordering::SeqCst);
            }
            Message::MergeCompleted { .. } => {
                merged.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        });
    }

    let index = open_index(&dir, &config, bus, i64::MAX);
    for i in 0..2 {
        index.add(&[IndexEntry::new(7, i, i * 10)], i * 10, i * 10 + 5).unwrap();
        index.flush().unwrap();
    }

    assert_eq!(flushed.load(Ordering::SeqCst), 2);
    assert_eq!(merged.load(Ordering::SeqCst), 1);
    assert_eq!(index.stats().tables_per_level, vec![0, 1]);
    assert_eq!(index.snapshot().candidates(7, 1), vec![10]);

    index.shutdown();
    drop(index);
    // Merge inputs are deleted once no snapshot holds them
    assert_eq!(ptable_files(&dir), 1);
}

#[test]
fn test_table_index_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("index");
    let config = index_config(temp.path(), 4);
    {
        let index = open_index(&dir, &config, test_bus(), i64::MAX);
        index.add(&[IndexEntry::new(3, 0, 40)], 40, 60).unwrap();
        index.flush().unwrap();
    }

    let index = open_index(&dir, &config, test_bus(), 1_000);
    assert_eq!(index.commit_checkpoint(), 60);
    assert_eq!(index.snapshot().candidates(3, 0), vec![40]);
}

#[test]
fn test_table_index_ahead_of_log_is_rebuilt() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("index");
    let config = index_config(temp.path(), 4);
    {
        let index = open_index(&dir, &config, test_bus(), i64::MAX);
        index.add(&[IndexEntry::new(3, 0, 400)], 400, 600).unwrap();
        index.flush().unwrap();
    }

    // The log only reaches position 100 now
    let index = open_index(&dir, &config, test_bus(), 100);
    assert_eq!(index.commit_checkpoint(), -1);
    assert!(index.snapshot().candidates(3, 0).is_empty());
    assert_eq!(ptable_files(&dir), 0);
}

#[test]
fn test_table_index_memtable_freezes_at_limit() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("index");
    let config = Config::builder()
        .data_dir(temp.path())
        .memtable_max_entries(10)
        .max_tables_per_level(100)
        .build();
    let index = open_index(&dir, &config, test_bus(), i64::MAX);

    for i in 0..25 {
        index.add(&[IndexEntry::new(1, i, i)], i, i).unwrap();
    }
    index.wait_for_idle().unwrap();

    let stats = index.stats();
    assert_eq!(stats.tables_per_level, vec![2]);
    assert_eq!(stats.memtable_entries, 5);
    assert_eq!(stats.frozen_memtables, 0);

    let positions: HashSet<i64> = index
        .snapshot()
        .range(1, 0, 24)
        .into_values()
        .flatten()
        .collect();
    assert_eq!(positions.len(), 25);
}

#[test]
fn test_table_index_adds_during_flush_and_merge_keep_every_entry() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("index");
    let config = Config::builder()
        .data_dir(temp.path())
        .memtable_max_entries(16)
        .max_tables_per_level(2)
        .midpoint_interval(8)
        .build();
    let index = Arc::new(open_index(&dir, &config, test_bus(), i64::MAX));

    // Every add can freeze the memtable while the worker is persisting and
    // swapping in earlier ones
    let writers: Vec<_> = (0..4u64)
        .map(|stream| {
            let index = Arc::clone(&index);
            std::thread::spawn(move || {
                for i in 0..200i64 {
                    let position = i * 4 + stream as i64;
                    index
                        .add(&[IndexEntry::new(stream, i, position)], position, position)
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    index.flush().unwrap();

    let stats = index.stats();
    assert_eq!(stats.memtable_entries, 0);
    assert_eq!(stats.frozen_memtables, 0);

    let snapshot = index.snapshot();
    for stream in 0..4u64 {
        assert_eq!(snapshot.max_event_number(stream), Some(199));
        for i in 0..200i64 {
            assert_eq!(
                snapshot.candidates(stream, i),
                vec![i * 4 + stream as i64],
                "stream {} event {}",
                stream,
                i
            );
        }
    }
}

//! Crash recovery tests
//!
//! These tests verify:
//! - A torn commit at the tail of the log is cut off on reopen
//! - The prepare left without its commit is never visible
//! - Event numbering continues from the last committed event
//! - An index ahead of the truncated log is rebuilt from the log
//! - A lost writer checkpoint does not lose acknowledged events
//! - Corruption inside acknowledged data stops the engine from opening

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use eventlog::{
    Config, Engine, ExpectedVersion, NewEvent, ReadEventResult, StoreError, StreamHead,
    SyncStrategy,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config(dir: &Path) -> Config {
    Config::builder()
        .data_dir(dir)
        .chunk_size(1024 * 1024)
        .sync_strategy(SyncStrategy::OsBuffered)
        .build()
}

fn event(i: usize) -> NewEvent {
    NewEvent::new("counter-incremented", format!("{{\"i\":{}}}", i).into_bytes())
}

/// Newest chunk file (highest chunk number, then version)
fn last_chunk_file(dir: &Path) -> PathBuf {
    let mut files: Vec<PathBuf> = fs::read_dir(dir.join("chunks"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("chunk-") && !n.ends_with(".tmp"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files.pop().expect("no chunk files")
}

fn chop(path: &Path, bytes: u64) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    let len = file.metadata().unwrap().len();
    file.set_len(len - bytes).unwrap();
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_torn_commit_is_discarded_and_numbering_continues() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(config(temp.path())).unwrap();
        for i in 0..1000 {
            engine.append("counter", ExpectedVersion::Any, &[event(i)]).unwrap();
        }
        engine.close().unwrap();
    }

    // Cut into the last commit record
    chop(&last_chunk_file(temp.path()), 3);

    let engine = Engine::open(config(temp.path())).unwrap();
    assert!(engine.recovery_report().torn_tail);
    assert!(engine.recovery_report().truncated_bytes > 0);
    assert_eq!(
        engine.last_event_number("counter").unwrap(),
        StreamHead::At(998)
    );
    assert_eq!(
        engine.read_event("counter", 999).unwrap(),
        ReadEventResult::NotFound
    );

    for i in 0..1000 {
        let result = engine.append("counter", ExpectedVersion::Any, &[event(i)]).unwrap();
        assert_eq!(result.next_expected_version, 999 + i as i64);
    }

    let mut numbers = Vec::new();
    let mut from = 0;
    loop {
        let slice = engine.read_stream_forward("counter", from, 500).unwrap();
        numbers.extend(slice.events.iter().map(|e| e.event_number));
        from = slice.next_event_number;
        if slice.is_end_of_stream {
            break;
        }
    }
    assert_eq!(numbers, (0..1999).collect::<Vec<_>>());

    // The orphaned prepare never shows up in the global order either
    let mut position = 0;
    let mut total = 0;
    loop {
        let slice = engine.read_all_forward(position, 1000).unwrap();
        total += slice.events.len();
        position = slice.next_position;
        if slice.is_end {
            break;
        }
    }
    assert_eq!(total, 1999);
}

#[test]
fn test_recovered_state_survives_another_restart() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(config(temp.path())).unwrap();
        for i in 0..50 {
            engine.append("s", ExpectedVersion::Any, &[event(i)]).unwrap();
        }
    }
    chop(&last_chunk_file(temp.path()), 3);
    {
        let engine = Engine::open(config(temp.path())).unwrap();
        let result = engine.append("s", ExpectedVersion::Exact(48), &[event(0)]).unwrap();
        assert_eq!(result.next_expected_version, 49);
        engine.close().unwrap();
    }

    let engine = Engine::open(config(temp.path())).unwrap();
    assert!(!engine.recovery_report().torn_tail);
    assert_eq!(engine.last_event_number("s").unwrap(), StreamHead::At(49));
    let slice = engine.read_stream_forward("s", 0, 100).unwrap();
    assert_eq!(slice.events.len(), 50);
}

#[test]
fn test_clean_restart_needs_no_truncation() {
    let temp = TempDir::new().unwrap();
    let end;
    {
        let engine = Engine::open(config(temp.path())).unwrap();
        engine.append("s", ExpectedVersion::Any, &[event(0), event(1)]).unwrap();
        end = engine.stats().writer_position;
        engine.close().unwrap();
    }

    let engine = Engine::open(config(temp.path())).unwrap();
    let report = engine.recovery_report();
    assert!(!report.torn_tail);
    assert_eq!(report.truncated_bytes, 0);
    assert_eq!(report.writer_position, end);
    assert_eq!(engine.stats().index_commit_checkpoint, end);
}

#[test]
fn test_missing_writer_checkpoint_keeps_the_log() {
    let temp = TempDir::new().unwrap();
    let end;
    {
        let engine = Engine::open(config(temp.path())).unwrap();
        for i in 0..10 {
            engine.append("s", ExpectedVersion::Any, &[event(i)]).unwrap();
        }
        end = engine.stats().writer_position;
        engine.close().unwrap();
    }
    fs::remove_file(temp.path().join("writer.chk")).unwrap();

    let engine = Engine::open(config(temp.path())).unwrap();
    let report = engine.recovery_report();
    assert!(report.checkpoint_missing);
    assert_eq!(report.truncated_bytes, 0);
    assert_eq!(report.writer_position, end);
    assert_eq!(engine.last_event_number("s").unwrap(), StreamHead::At(9));

    let result = engine.append("s", ExpectedVersion::Exact(9), &[event(10)]).unwrap();
    assert_eq!(result.next_expected_version, 10);
}

#[test]
fn test_corrupt_acknowledged_record_fails_open() {
    let temp = TempDir::new().unwrap();
    {
        let engine = Engine::open(config(temp.path())).unwrap();
        for i in 0..10 {
            engine.append("s", ExpectedVersion::Any, &[event(i)]).unwrap();
        }
        engine.close().unwrap();
    }

    // A byte inside the payload of the first prepare
    let path = last_chunk_file(temp.path());
    let mut bytes = fs::read(&path).unwrap();
    bytes[32 + 8 + 4] ^= 0xFF;
    fs::write(&path, bytes).unwrap();

    let result = Engine::open(config(temp.path()));
    match result {
        Err(e @ StoreError::CorruptRecord { .. }) => assert!(e.is_fatal()),
        other => panic!("expected CorruptRecord, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_corrupt_sealed_chunk_fails_open() {
    let temp = TempDir::new().unwrap();
    let small = |dir: &Path, verify: bool| {
        Config::builder()
            .data_dir(dir)
            .chunk_size(4096)
            .sync_strategy(SyncStrategy::OsBuffered)
            .verify_chunks(verify)
            .build()
    };
    {
        let engine = Engine::open(small(temp.path(), true)).unwrap();
        for i in 0..40 {
            engine.append("s", ExpectedVersion::Any, &[event(i)]).unwrap();
        }
        assert!(engine.stats().chunk_count > 1);
        engine.close().unwrap();
    }

    let first = temp.path().join("chunks").join(eventlog::log::Chunk::file_name(0, 0));
    let mut bytes = fs::read(&first).unwrap();
    bytes[32 + 8 + 4] ^= 0xFF;
    fs::write(&first, bytes).unwrap();

    let result = Engine::open(small(temp.path(), true));
    assert!(matches!(result, Err(StoreError::ChecksumMismatch { .. })));

    // Opening without the check still serves the intact chunks
    let engine = Engine::open(small(temp.path(), false)).unwrap();
    assert!(engine.stats().chunk_count > 1);
}

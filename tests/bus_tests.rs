//! Tests for the in-process message bus
//!
//! These tests verify:
//! - Topics deliver exactly their message kinds
//! - Handlers run in registration order
//! - Unsubscribing removes a handler from every kind it covered
//! - Handlers may publish without deadlocking

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eventlog::bus::{Bus, Message, MessageKind, Topic};
use parking_lot::Mutex;

// =============================================================================
// Helper Functions
// =============================================================================

fn bus() -> Bus {
    Bus::new("test", Duration::from_millis(48))
}

fn write_completed() -> Message {
    Message::WriteCompleted {
        stream: "s".to_string(),
        first_event_number: 0,
        last_event_number: 0,
        log_position: 0,
    }
}

fn halted() -> Message {
    Message::WriterHalted {
        reason: "disk full".to_string(),
    }
}

fn counter(bus: &Bus, topic: Topic) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let handle = Arc::clone(&count);
    bus.subscribe(topic, move |_| {
        handle.fetch_add(1, Ordering::SeqCst);
    });
    count
}

// =============================================================================
// Dispatch Tests
// =============================================================================

#[test]
fn test_topics_filter_by_kind() {
    let bus = bus();
    let all = counter(&bus, Topic::All);
    let writes = counter(&bus, Topic::Writes);
    let failures = counter(&bus, Topic::Failures);
    let exact = counter(&bus, Topic::Kind(MessageKind::WriterHalted));

    bus.publish(&write_completed());
    bus.publish(&halted());
    bus.publish(&Message::IndexTaskFailed {
        reason: "merge".to_string(),
    });

    assert_eq!(all.load(Ordering::SeqCst), 3);
    assert_eq!(writes.load(Ordering::SeqCst), 1);
    assert_eq!(failures.load(Ordering::SeqCst), 2);
    assert_eq!(exact.load(Ordering::SeqCst), 1);
}

#[test]
fn test_handlers_run_in_registration_order() {
    let bus = bus();
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..5 {
        let order = Arc::clone(&order);
        bus.subscribe(Topic::Writes, move |_| order.lock().push(i));
    }

    bus.publish(&write_completed());
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_unsubscribe_removes_every_kind() {
    let bus = bus();
    let count = Arc::new(AtomicUsize::new(0));
    let handle = Arc::clone(&count);
    let id = bus.subscribe(Topic::Log, move |_| {
        handle.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(bus.handler_count(MessageKind::ChunkScavenged), 1);
    assert_eq!(bus.handler_count(MessageKind::WriterHalted), 1);

    assert!(bus.unsubscribe(id));
    assert!(!bus.unsubscribe(id));
    assert_eq!(bus.handler_count(MessageKind::ChunkScavenged), 0);
    assert_eq!(bus.handler_count(MessageKind::WriterHalted), 0);

    bus.publish(&halted());
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_message_without_handlers_is_dropped() {
    let bus = bus();
    let writes = counter(&bus, Topic::Writes);
    bus.publish(&Message::ScavengeCompleted {
        chunks: 0,
        records_removed: 0,
        elapsed_ms: 0,
    });
    assert_eq!(writes.load(Ordering::SeqCst), 0);
}

#[test]
fn test_handler_may_publish() {
    let bus = Arc::new(bus());
    let failures = counter(&bus, Topic::Failures);
    {
        let inner = Arc::clone(&bus);
        bus.subscribe(Topic::Writes, move |_| inner.publish(&halted()));
    }

    bus.publish(&write_completed());
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

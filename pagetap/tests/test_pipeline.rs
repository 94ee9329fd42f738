//! User-space pipeline without a kernel: records go through a lossy ring,
//! the stream consumer, the event processor and the JSON-lines writer.

use std::io::{BufRead, BufReader};
use std::time::Duration;

use pagetap::channel::lossy_ring;
use pagetap::consumer::{EventProcessor, StreamConsumer};
use pagetap::domain::{Event, EventKind, Status};
use pagetap::export::JsonLinesWriter;
use pagetap_common::{ThreadKey, PAGE_SIZE};

fn event(kind: EventKind, status: Status, tid: u32, ts: u64, payload: Vec<u8>) -> Event {
    Event {
        kind,
        key: ThreadKey { pid: 500, tid },
        address: 0x5555_0000_2010,
        status,
        aux: 0,
        timestamp_ns: ts,
        payload,
    }
}

#[test]
fn test_fault_sequence_is_exported_as_json_lines() {
    let out = tempfile::NamedTempFile::new().expect("temp file");

    let (kernel_tx, kernel_rx) = lossy_ring(64);
    let (export_tx, export_rx) = lossy_ring(64);

    let processor = EventProcessor::new(true, false, Some(export_tx));
    let events = StreamConsumer::new(kernel_rx, processor, Duration::from_millis(20));
    let writer = JsonLinesWriter::new(out.reopen().expect("reopen"), "test");
    let export = StreamConsumer::new(export_rx, writer, Duration::from_millis(20));

    let events_ctl = events.control();
    let events = events.spawn().expect("spawn");
    let export = export.spawn().expect("spawn");

    let page = vec![b'a'; PAGE_SIZE];
    for record in [
        event(EventKind::FaultEntry, Status::Success, 1, 100, b"data.txt".to_vec()),
        event(EventKind::FaultExit, Status::Success, 1, 200, Vec::new()),
        event(EventKind::ReadResult, Status::Success, 1, 300, page),
        event(EventKind::WriteResult, Status::Success, 1, 400, Vec::new()),
    ] {
        assert!(kernel_tx.submit(record.encode()));
    }
    // malformed record: counted, not exported
    kernel_tx.submit(vec![0u8; 3]);

    events_ctl.drain(Duration::from_secs(2));
    let report = events.join();
    assert_eq!(report.dispatched, 5);
    assert!(report.error.is_none());
    let summary = report.summary.expect("processor summary");
    assert!(summary.contains("1 completed"), "{summary}");
    assert!(summary.contains("1 malformed"), "{summary}");

    // the processor dropped its export producer when its thread ended
    let export_report = export.join();
    assert_eq!(export_report.dispatched, 4);
    drop(kernel_tx);

    let lines: Vec<serde_json::Value> = BufReader::new(out.reopen().expect("reopen"))
        .lines()
        .map(|l| serde_json::from_str(&l.expect("line")).expect("json"))
        .collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0]["kind"], "fault_entry");
    assert_eq!(lines[0]["object"], "data.txt");
    assert_eq!(lines[2]["payload_len"], PAGE_SIZE);
    assert_eq!(lines[3]["kind"], "write_result");
    assert_eq!(lines[3]["page"], 0x5555_0000_2000u64);
}

#[test]
fn test_idle_consumer_returns_cleanly() {
    let (_tx, rx) = lossy_ring(1024);
    let processor = EventProcessor::new(true, false, None);
    let consumer = StreamConsumer::new(rx, processor, Duration::from_millis(100));
    let handle = consumer.spawn().expect("spawn");

    std::thread::sleep(Duration::from_millis(500));
    handle.stop();
    let report = handle.join();

    assert_eq!(report.dispatched, 0);
    assert!(report.error.is_none());
}

#[test]
fn test_saturated_ring_keeps_capacity_and_drops_rest() {
    let (tx, rx) = lossy_ring(1024);
    let record = event(EventKind::FaultExit, Status::Success, 1, 0, Vec::new()).encode();

    let kept = (0..9000).filter(|_| tx.submit(record.clone())).count();

    assert_eq!(kept, 1024);
    assert_eq!(rx.len(), 1024);
    assert_eq!(rx.dropped(), 9000 - 1024);
}

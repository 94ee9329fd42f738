//! # Event Processing
//!
//! Decodes ring buffer records and routes them:
//!
//! - every event → stats, and stdout unless quiet
//! - `FaultEntry` → pending table, keyed by thread
//! - `WriteResult` / failed `ReadResult` → closes the pending entry and records
//!   entry-to-completion latency
//! - successful `ReadResult` → optional hex dump of the captured page
//! - raw record → export ring, if export is enabled
//!
//! The pending table is the same fixed-capacity correlator the kernel uses, so
//! a flood of unfinished entries degrades to dropped pairings, never to
//! unbounded memory.

use log::{debug, warn};
use pagetap_common::correlate::{on_entry, on_exit, EntryOutcome, ExitOutcome};
use pagetap_common::table::FixedTable;
use pagetap_common::{PendingFault, CORRELATOR_CAPACITY};

use super::event_display::{hex_dump, render_event, FaultStats};
use super::stream::RecordHandler;
use crate::channel::LossyProducer;
use crate::domain::{Event, EventKind, Status};

const PAIR_CAPACITY: usize = CORRELATOR_CAPACITY as usize;

pub struct EventProcessor {
    quiet: bool,
    dump_pages: bool,

    pub stats: FaultStats,
    /// Entries that found the pairing table full
    pub unpaired: u64,
    pending: Box<FixedTable<PAIR_CAPACITY>>,

    export: Option<LossyProducer>,
}

impl EventProcessor {
    #[must_use]
    pub fn new(quiet: bool, dump_pages: bool, export: Option<LossyProducer>) -> Self {
        Self {
            quiet,
            dump_pages,
            stats: FaultStats::default(),
            unpaired: 0,
            pending: Box::new(FixedTable::new()),
            export,
        }
    }

    /// Entries still waiting for completion.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Account for one decoded event. Returns the entry-to-completion latency
    /// when the event closes a pending fault.
    pub fn process_event(&mut self, event: &Event) -> Option<u64> {
        let latency = match (event.kind, event.status) {
            (EventKind::FaultEntry, _) => {
                self.stats.entries += 1;
                self.open(event);
                None
            }
            (EventKind::FaultExit, _) => {
                self.stats.exits += 1;
                None
            }
            (EventKind::ReadResult, Status::Success) => {
                self.stats.reads_ok += 1;
                None
            }
            (EventKind::ReadResult, Status::Failure) => {
                self.stats.reads_failed += 1;
                self.close(event)
            }
            (EventKind::WriteResult, status) => {
                if status == Status::Success {
                    self.stats.writes_ok += 1;
                } else {
                    self.stats.writes_failed += 1;
                }
                self.close(event)
            }
            (EventKind::Diagnostic, _) => {
                self.stats.diagnostics += 1;
                warn!("kernel diagnostic: {}", render_event(event));
                None
            }
        };

        if !self.quiet {
            match latency {
                Some(ns) => println!("{} latency={}us", render_event(event), ns / 1_000),
                None => println!("{}", render_event(event)),
            }
            if self.dump_pages
                && event.kind == EventKind::ReadResult
                && event.status == Status::Success
            {
                print!("{}", hex_dump(&event.payload));
            }
        }

        latency
    }

    fn open(&mut self, event: &Event) {
        let pending = PendingFault { address: event.address, captured_at_ns: event.timestamp_ns };
        if on_entry(&mut *self.pending, &event.key, &pending, false) == EntryOutcome::Dropped {
            self.unpaired += 1;
        }
    }

    fn close(&mut self, event: &Event) -> Option<u64> {
        match on_exit(&mut *self.pending, &event.key, false) {
            ExitOutcome::Matched { pending, .. } => {
                let ns = event.timestamp_ns.saturating_sub(pending.captured_at_ns);
                self.stats.completed += 1;
                self.stats.latency_total_ns += ns;
                self.stats.latency_max_ns = self.stats.latency_max_ns.max(ns);
                Some(ns)
            }
            ExitOutcome::Retry | ExitOutcome::Unmatched => None,
        }
    }
}

impl RecordHandler for EventProcessor {
    fn handle(&mut self, record: &[u8]) {
        match Event::decode(record) {
            Ok(event) => {
                self.process_event(&event);
                if let Some(export) = &self.export {
                    export.submit(record.to_vec());
                }
            }
            Err(e) => {
                self.stats.malformed += 1;
                debug!("skipping record: {e}");
            }
        }
    }

    fn finish(&mut self) -> Option<String> {
        let mut line = self.stats.summary_line();
        if self.unpaired > 0 {
            line.push_str(&format!(", {} unpaired", self.unpaired));
        }
        if let Some(export) = self.export.take() {
            let dropped = export.dropped();
            if dropped > 0 {
                line.push_str(&format!(", {dropped} export records dropped"));
            }
        }
        Some(line)
    }
}

/// Prints trace pipe lines as they arrive.
#[derive(Debug, Default)]
pub struct TraceLinePrinter {
    quiet: bool,
    pub lines: u64,
}

impl TraceLinePrinter {
    #[must_use]
    pub fn new(quiet: bool) -> Self {
        Self { quiet, lines: 0 }
    }
}

impl RecordHandler for TraceLinePrinter {
    fn handle(&mut self, record: &[u8]) {
        self.lines += 1;
        if !self.quiet {
            println!("[TRACE] {}", String::from_utf8_lossy(record).trim());
        }
    }

    fn finish(&mut self) -> Option<String> {
        Some(format!("trace: {} lines", self.lines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::lossy_ring;
    use pagetap_common::ThreadKey;

    fn event(kind: EventKind, status: Status, tid: u32, ts: u64) -> Event {
        Event {
            kind,
            key: ThreadKey { pid: 1, tid },
            address: 0x1000,
            status,
            aux: 0,
            timestamp_ns: ts,
            payload: Vec::new(),
        }
    }

    #[test]
    fn entry_then_write_reports_latency() {
        let mut p = EventProcessor::new(true, false, None);
        assert_eq!(p.process_event(&event(EventKind::FaultEntry, Status::Success, 42, 1_000)), None);
        assert_eq!(p.in_flight(), 1);
        p.process_event(&event(EventKind::FaultExit, Status::Success, 42, 2_000));
        p.process_event(&event(EventKind::ReadResult, Status::Success, 42, 3_000));
        let latency = p.process_event(&event(EventKind::WriteResult, Status::Success, 42, 6_000));

        assert_eq!(latency, Some(5_000));
        assert_eq!(p.in_flight(), 0);
        assert_eq!(p.stats.completed, 1);
        assert_eq!(p.stats.latency_max_ns, 5_000);
    }

    #[test]
    fn failed_read_closes_pairing() {
        let mut p = EventProcessor::new(true, false, None);
        p.process_event(&event(EventKind::FaultEntry, Status::Success, 7, 10));
        assert_eq!(p.process_event(&event(EventKind::ReadResult, Status::Failure, 7, 30)), Some(20));
        assert_eq!(p.stats.reads_failed, 1);
    }

    #[test]
    fn completion_without_entry_is_unmatched() {
        let mut p = EventProcessor::new(true, false, None);
        assert_eq!(p.process_event(&event(EventKind::WriteResult, Status::Failure, 9, 5)), None);
        assert_eq!(p.stats.writes_failed, 1);
        assert_eq!(p.stats.completed, 0);
    }

    #[test]
    fn malformed_records_are_counted_not_fatal() {
        let mut p = EventProcessor::new(true, false, None);
        p.handle(&[1, 2, 3]);
        assert_eq!(p.stats.malformed, 1);
        assert_eq!(p.stats.entries, 0);
    }

    #[test]
    fn decoded_records_are_forwarded_to_export() {
        let (producer, ring) = lossy_ring(8);
        let mut p = EventProcessor::new(true, false, Some(producer));
        p.handle(&event(EventKind::FaultEntry, Status::Success, 3, 1).encode());
        p.handle(&[0u8; 4]);
        assert_eq!(ring.len(), 1);

        let summary = p.finish().unwrap();
        assert!(summary.starts_with("faults: 1 entries"));
    }
}

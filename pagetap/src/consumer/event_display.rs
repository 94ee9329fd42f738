// Time conversions intentionally lose precision for display purposes
#![allow(clippy::cast_precision_loss)]

use std::fmt::Write as _;

use pagetap_common::{fault_flags, vm_fault};

use crate::domain::event::{Event, EventKind, Status};
use crate::domain::types::split_key;

const DUMP_LINE: usize = 32;
const DUMP_GROUP: usize = 4;

/// Render set bits as `NAME|NAME`, with any unnamed remainder in hex.
#[must_use]
pub fn flag_names(bits: u32, names: &[(u32, &str)]) -> String {
    if bits == 0 {
        return "0".to_string();
    }
    let mut out = String::new();
    let mut rest = bits;
    for &(bit, name) in names {
        if bits & bit != 0 {
            if !out.is_empty() {
                out.push('|');
            }
            out.push_str(name);
            rest &= !bit;
        }
    }
    if rest != 0 {
        if !out.is_empty() {
            out.push('|');
        }
        let _ = write!(out, "{rest:#x}");
    }
    out
}

/// Offset-prefixed hex dump, 32 bytes per line in groups of 4.
#[must_use]
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (line_no, line) in bytes.chunks(DUMP_LINE).enumerate() {
        let _ = write!(out, "{:04x}:", line_no * DUMP_LINE);
        for group in line.chunks(DUMP_GROUP) {
            out.push(' ');
            for b in group {
                let _ = write!(out, "{b:02x}");
            }
        }
        out.push('\n');
    }
    out
}

/// One-line summary of an event.
#[must_use]
pub fn render_event(event: &Event) -> String {
    let (pid, tid) = split_key(event.key);
    let tag = event.kind;
    match (event.kind, event.status) {
        (EventKind::FaultEntry, _) => {
            let object = event.payload_text();
            let object = if object.is_empty() { "-" } else { object.as_str() };
            format!(
                "[{tag}] {pid} {tid} addr={:#x} flags={} object={object}",
                event.address,
                flag_names(event.aux, &fault_flags::NAMES)
            )
        }
        (EventKind::FaultExit, _) => format!(
            "[{tag}] {pid} {tid} page={:#x} ret={}",
            event.address,
            flag_names(event.aux, &vm_fault::NAMES)
        ),
        (EventKind::ReadResult | EventKind::WriteResult, Status::Success) => {
            format!("[{tag}] {pid} {tid} page={:#x} ok", event.address)
        }
        (EventKind::ReadResult | EventKind::WriteResult, Status::Failure) => {
            format!("[{tag}] {pid} {tid} page={:#x} failed errno={}", event.address, event.errno())
        }
        (EventKind::Diagnostic, _) => {
            format!("[{tag}] {pid} {tid} {} ({})", event.payload_text(), event.errno())
        }
    }
}

/// Per-run counters kept by the event processor.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FaultStats {
    pub entries: u64,
    pub exits: u64,
    pub reads_ok: u64,
    pub reads_failed: u64,
    pub writes_ok: u64,
    pub writes_failed: u64,
    pub diagnostics: u64,
    pub malformed: u64,
    pub completed: u64,
    pub latency_total_ns: u64,
    pub latency_max_ns: u64,
}

impl FaultStats {
    /// Mean entry-to-completion latency.
    #[must_use]
    pub fn mean_latency_us(&self) -> f64 {
        if self.completed == 0 {
            return 0.0;
        }
        self.latency_total_ns as f64 / self.completed as f64 / 1_000.0
    }

    #[must_use]
    pub fn summary_line(&self) -> String {
        format!(
            "faults: {} entries, {} exits, read {}/{} failed, write {}/{} failed, {} diag, {} malformed, {} completed (mean {:.1}us, max {:.1}us)",
            self.entries,
            self.exits,
            self.reads_ok + self.reads_failed,
            self.reads_failed,
            self.writes_ok + self.writes_failed,
            self.writes_failed,
            self.diagnostics,
            self.malformed,
            self.completed,
            self.mean_latency_us(),
            self.latency_max_ns as f64 / 1_000.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagetap_common::ThreadKey;

    fn event(kind: EventKind, status: Status, aux: u32, payload: &[u8]) -> Event {
        Event {
            kind,
            key: ThreadKey { pid: 7, tid: 9 },
            address: 0x1000,
            status,
            aux,
            timestamp_ns: 0,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn flags_render_by_name() {
        let bits = fault_flags::WRITE | fault_flags::USER;
        assert_eq!(flag_names(bits, &fault_flags::NAMES), "WRITE|USER");
        assert_eq!(flag_names(0, &fault_flags::NAMES), "0");
        assert_eq!(flag_names(vm_fault::RETRY | 0x8000_0000, &vm_fault::NAMES), "RETRY|0x80000000");
    }

    #[test]
    fn hex_dump_layout() {
        let bytes: Vec<u8> = (0..40).collect();
        let dump = hex_dump(&bytes);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000: 00010203 04050607"));
        assert_eq!(lines[1], "0020: 20212223 24252627");
    }

    #[test]
    fn renders_fault_entry_with_object() {
        let line = render_event(&event(EventKind::FaultEntry, Status::Success, 1, b"data.txt\0"));
        assert_eq!(line, "[FAULT] PID:7 TID:9 addr=0x1000 flags=WRITE object=data.txt");
    }

    #[test]
    fn renders_failed_read_with_errno() {
        let line = render_event(&event(EventKind::ReadResult, Status::Failure, (-14i32) as u32, b""));
        assert!(line.ends_with("failed errno=-14"));
    }

    #[test]
    fn mean_latency_handles_zero() {
        assert!(FaultStats::default().mean_latency_us().abs() < f64::EPSILON);
    }
}

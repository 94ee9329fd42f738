use std::io::{BufWriter, Write};

use log::warn;
use pagetap_common::PAGE_MASK;
use serde::Serialize;

use crate::consumer::RecordHandler;
use crate::domain::{Event, EventKind, ExportError, Status};

/// JSON shape of one exported event.
#[derive(Debug, Serialize)]
pub struct ExportRecord {
    pub kind: EventKind,
    pub pid: u32,
    pub tid: u32,
    pub address: u64,
    pub page: u64,
    pub status: Status,
    pub aux: u32,
    pub timestamp_ns: u64,
    pub payload_len: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
}

impl From<&Event> for ExportRecord {
    fn from(event: &Event) -> Self {
        let text = || Some(event.payload_text()).filter(|t| !t.is_empty());
        Self {
            kind: event.kind,
            pid: event.key.pid,
            tid: event.key.tid,
            address: event.address,
            page: event.address & PAGE_MASK,
            status: event.status,
            aux: event.aux,
            timestamp_ns: event.timestamp_ns,
            payload_len: event.payload.len(),
            object: if event.kind == EventKind::FaultEntry { text() } else { None },
            message: if event.kind == EventKind::Diagnostic { text() } else { None },
            errno: match event.kind {
                EventKind::Diagnostic => Some(event.errno()),
                EventKind::ReadResult | EventKind::WriteResult
                    if event.status == Status::Failure =>
                {
                    Some(event.errno())
                }
                _ => None,
            },
        }
    }
}

/// JSON-lines sink. Also usable directly as a [`RecordHandler`].
pub struct JsonLinesWriter<W: Write> {
    out: BufWriter<W>,
    label: String,
    pub written: u64,
    pub failed: u64,
}

impl<W: Write> JsonLinesWriter<W> {
    pub fn new(out: W, label: impl Into<String>) -> Self {
        Self { out: BufWriter::new(out), label: label.into(), written: 0, failed: 0 }
    }

    /// # Errors
    /// [`ExportError`] if serialization or the write fails.
    pub fn write_event(&mut self, event: &Event) -> Result<(), ExportError> {
        serde_json::to_writer(&mut self.out, &ExportRecord::from(event))?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    /// # Errors
    /// [`ExportError::Io`] if the flush fails.
    pub fn flush(&mut self) -> Result<(), ExportError> {
        self.out.flush()?;
        Ok(())
    }

    /// Flush and return the underlying writer.
    ///
    /// # Errors
    /// [`ExportError::Io`] if the final flush fails.
    pub fn into_inner(self) -> Result<W, ExportError> {
        self.out.into_inner().map_err(|e| ExportError::Io(e.into_error()))
    }
}

impl<W: Write + Send> RecordHandler for JsonLinesWriter<W> {
    fn handle(&mut self, record: &[u8]) {
        let result = Event::decode(record)
            .map_err(|e| warn!("export: {e}"))
            .and_then(|event| self.write_event(&event).map_err(|e| warn!("export: {e}")));
        if result.is_err() {
            self.failed += 1;
        }
    }

    fn finish(&mut self) -> Option<String> {
        if let Err(e) = self.flush() {
            warn!("export flush: {e}");
        }
        let mut line = format!("export: {} events to {}", self.written, self.label);
        if self.failed > 0 {
            line.push_str(&format!(" ({} failed)", self.failed));
        }
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagetap_common::ThreadKey;

    fn event(kind: EventKind, status: Status, aux: u32, payload: &[u8]) -> Event {
        Event {
            kind,
            key: ThreadKey { pid: 10, tid: 11 },
            address: 0x7000_1234,
            status,
            aux,
            timestamp_ns: 99,
            payload: payload.to_vec(),
        }
    }

    fn lines(writer: JsonLinesWriter<Vec<u8>>) -> Vec<serde_json::Value> {
        let bytes = writer.into_inner().unwrap();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn one_object_per_line() {
        let mut w = JsonLinesWriter::new(Vec::new(), "memory");
        w.write_event(&event(EventKind::FaultEntry, Status::Success, 0x40, b"lib.so\0")).unwrap();
        w.write_event(&event(EventKind::WriteResult, Status::Failure, (-14i32) as u32, b""))
            .unwrap();

        let parsed = lines(w);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["kind"], "fault_entry");
        assert_eq!(parsed[0]["object"], "lib.so");
        assert_eq!(parsed[0]["page"], 0x7000_1000u64);
        assert!(parsed[0].get("errno").is_none());
        assert_eq!(parsed[1]["status"], "failure");
        assert_eq!(parsed[1]["errno"], -14);
    }

    #[test]
    fn handler_skips_malformed_records() {
        let mut w = JsonLinesWriter::new(Vec::new(), "memory");
        w.handle(&event(EventKind::FaultExit, Status::Success, 0, b"").encode());
        w.handle(b"short");
        assert_eq!(w.written, 1);
        assert_eq!(w.failed, 1);
        assert_eq!(w.finish().unwrap(), "export: 1 events to memory (1 failed)");
    }
}

//! Text log channel over the kernel trace pipe.
//!
//! `bpf_printk` output arrives as an unframed byte stream. A read may end in
//! the middle of a line, so [`LineBuffer`] keeps the unterminated tail until
//! the next read completes it. A line that grows past [`MAX_LINE_LEN`] without
//! a terminator is emitted in pieces of that size.
//!
//! End of file (the writer closed, or a regular file was given) ends the
//! channel: the remaining partial line is emitted, then the next poll reports
//! [`ChannelError::Disconnected`].

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::AsFd;
use std::path::Path;
use std::time::Duration;

use super::{wait_readable, RecordSource};
use crate::domain::ChannelError;

pub const DEFAULT_TRACE_PIPE: &str = "/sys/kernel/debug/tracing/trace_pipe";

const READ_CHUNK: usize = 8192;

/// Longest line carried between reads; longer input is split.
pub const MAX_LINE_LEN: usize = 4 * READ_CHUNK;

/// Splits a byte stream into `\n`-terminated lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and emit every line they complete, without the `\n`.
    pub fn push(&mut self, bytes: &[u8], sink: &mut dyn FnMut(&[u8])) -> usize {
        self.pending.extend_from_slice(bytes);

        let mut emitted = 0;
        let mut start = 0;
        while let Some(pos) = self.pending[start..].iter().position(|&b| b == b'\n') {
            sink(&self.pending[start..start + pos]);
            emitted += 1;
            start += pos + 1;
        }
        self.pending.drain(..start);

        while self.pending.len() >= MAX_LINE_LEN {
            sink(&self.pending[..MAX_LINE_LEN]);
            emitted += 1;
            self.pending.drain(..MAX_LINE_LEN);
        }
        emitted
    }

    /// Emit the unterminated tail, if any, as a final line.
    pub fn flush(&mut self, sink: &mut dyn FnMut(&[u8])) -> usize {
        if self.pending.is_empty() {
            return 0;
        }
        sink(&self.pending);
        self.pending.clear();
        1
    }

    /// Unterminated bytes carried to the next push.
    #[must_use]
    pub fn partial(&self) -> &[u8] {
        &self.pending
    }
}

pub struct TraceLog<R> {
    reader: R,
    lines: LineBuffer,
    chunk: Box<[u8]>,
    eof: bool,
}

impl TraceLog<File> {
    /// Open a trace pipe for reading.
    ///
    /// # Errors
    /// [`ChannelError::Open`] if the file cannot be opened (tracefs not
    /// mounted, insufficient privilege).
    pub fn open(path: &Path) -> Result<Self, ChannelError> {
        let file = File::open(path)
            .map_err(|source| ChannelError::Open { path: path.to_path_buf(), source })?;
        Ok(Self::new(file))
    }
}

impl<R: Read + AsFd> TraceLog<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            lines: LineBuffer::new(),
            chunk: vec![0u8; READ_CHUNK].into_boxed_slice(),
            eof: false,
        }
    }
}

impl<R: Read + AsFd + Send> RecordSource for TraceLog<R> {
    fn name(&self) -> &'static str {
        "trace_pipe"
    }

    fn poll(
        &mut self,
        timeout: Duration,
        sink: &mut dyn FnMut(&[u8]),
    ) -> Result<usize, ChannelError> {
        if self.eof {
            return Err(ChannelError::Disconnected);
        }
        if !wait_readable(self.reader.as_fd(), timeout)? {
            return Ok(0);
        }

        match self.reader.read(&mut self.chunk) {
            // EOF: the fd stays readable from here on
            Ok(0) => {
                self.eof = true;
                match self.lines.flush(sink) {
                    0 => Err(ChannelError::Disconnected),
                    n => Ok(n),
                }
            }
            Ok(n) => Ok(self.lines.push(&self.chunk[..n], sink)),
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => Ok(0),
            Err(e) => Err(ChannelError::Read(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::StreamConsumer;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::sync::{Arc, Mutex};

    fn collect(buf: &mut LineBuffer, bytes: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        buf.push(bytes, &mut |l| out.push(String::from_utf8_lossy(l).into_owned()));
        out
    }

    #[test]
    fn splits_complete_lines() {
        let mut buf = LineBuffer::new();
        assert_eq!(collect(&mut buf, b"one\ntwo\n"), vec!["one", "two"]);
        assert!(buf.partial().is_empty());
    }

    #[test]
    fn carries_partial_line_across_pushes() {
        let mut buf = LineBuffer::new();
        assert_eq!(collect(&mut buf, b"fault pid=4"), Vec::<String>::new());
        assert_eq!(buf.partial(), b"fault pid=4");
        assert_eq!(collect(&mut buf, b"2 addr=0x1000\nnext"), vec!["fault pid=42 addr=0x1000"]);
        assert_eq!(buf.partial(), b"next");
    }

    #[test]
    fn empty_lines_are_records() {
        let mut buf = LineBuffer::new();
        assert_eq!(collect(&mut buf, b"\n\n"), vec!["", ""]);
    }

    #[test]
    fn trace_log_reads_lines_from_stream() {
        let (reader, mut writer) = UnixStream::pair().unwrap();
        let mut log = TraceLog::new(reader);

        writer.write_all(b"  cat-1234 [001] bpf_trace_printk: fault 0x1000\npart").unwrap();

        let mut lines = Vec::new();
        let n = log
            .poll(Duration::from_millis(100), &mut |l| lines.push(l.to_vec()))
            .unwrap();
        assert_eq!(n, 1);
        assert!(lines[0].ends_with(b"fault 0x1000"));

        writer.write_all(b"ial\n").unwrap();
        lines.clear();
        log.poll(Duration::from_millis(100), &mut |l| lines.push(l.to_vec())).unwrap();
        assert_eq!(lines, vec![b"partial".to_vec()]);
    }

    #[test]
    fn quiet_stream_times_out() {
        let (reader, _writer) = UnixStream::pair().unwrap();
        let mut log = TraceLog::new(reader);
        assert_eq!(log.poll(Duration::from_millis(20), &mut |_| {}).unwrap(), 0);
    }

    #[test]
    fn overlong_line_is_split_at_limit() {
        let mut buf = LineBuffer::new();
        let long = vec![b'x'; MAX_LINE_LEN + 10];

        let mut lens = Vec::new();
        assert_eq!(buf.push(&long, &mut |l| lens.push(l.len())), 1);
        assert_eq!(lens, vec![MAX_LINE_LEN]);
        assert_eq!(buf.partial().len(), 10);

        lens.clear();
        buf.push(b"yy\n", &mut |l| lens.push(l.len()));
        assert_eq!(lens, vec![12]);
        assert!(buf.partial().is_empty());
    }

    #[test]
    fn pending_stays_bounded_without_newlines() {
        let mut buf = LineBuffer::new();
        let chunk = [b'z'; READ_CHUNK];
        for _ in 0..32 {
            buf.push(&chunk, &mut |_| {});
            assert!(buf.partial().len() < MAX_LINE_LEN);
        }
    }

    #[test]
    fn closed_writer_flushes_partial_then_disconnects() {
        let (reader, mut writer) = UnixStream::pair().unwrap();
        let mut log = TraceLog::new(reader);
        writer.write_all(b"done\ntail").unwrap();
        drop(writer);

        let mut lines = Vec::new();
        let mut sink = |l: &[u8]| lines.push(l.to_vec());
        assert_eq!(log.poll(Duration::from_millis(100), &mut sink).unwrap(), 1);
        assert_eq!(log.poll(Duration::from_millis(100), &mut sink).unwrap(), 1);
        assert!(matches!(
            log.poll(Duration::from_millis(100), &mut sink),
            Err(ChannelError::Disconnected)
        ));
        assert_eq!(lines, vec![b"done".to_vec(), b"tail".to_vec()]);
    }

    #[test]
    fn consumer_on_closed_stream_finishes_instead_of_spinning() {
        let (reader, writer) = UnixStream::pair().unwrap();
        drop(writer);

        let start = std::time::Instant::now();
        let report =
            StreamConsumer::new(TraceLog::new(reader), |_: &[u8]| {}, Duration::from_millis(100))
                .run();

        assert!(report.error.is_none());
        assert!(report.polls <= 2, "polled {} times", report.polls);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn regular_file_is_read_to_end_then_finishes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"a\nb\n").unwrap();
        let log = TraceLog::open(file.path()).unwrap();

        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let report = StreamConsumer::new(
            log,
            move |l: &[u8]| sink.lock().unwrap().push(l.to_vec()),
            Duration::from_millis(100),
        )
        .run();

        assert!(report.error.is_none());
        assert_eq!(report.dispatched, 2);
        assert_eq!(*lines.lock().unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn missing_pipe_is_an_open_error() {
        let err = TraceLog::open(Path::new("/nonexistent/trace_pipe")).err().unwrap();
        assert!(matches!(err, ChannelError::Open { .. }));
    }
}

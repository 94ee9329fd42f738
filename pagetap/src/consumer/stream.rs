//! # Stream Consumer
//!
//! Drives one [`RecordSource`] on a dedicated thread:
//!
//! ```text
//! loop {
//!     check control (run / stop / drain until deadline)
//!     source.poll(timeout) ──▶ handler.handle(record) for each record
//! }
//! ```
//!
//! A poll that times out is not an error. A poll error ends this consumer
//! only and is reported through [`ConsumerReport::error`].

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::channel::RecordSource;
use crate::domain::ChannelError;

/// Receives every record a consumer polls.
pub trait RecordHandler: Send {
    fn handle(&mut self, record: &[u8]);

    /// Called once when the consumer loop ends. The returned line is carried
    /// in the report.
    fn finish(&mut self) -> Option<String> {
        None
    }
}

impl<F: FnMut(&[u8]) + Send> RecordHandler for F {
    fn handle(&mut self, record: &[u8]) {
        self(record);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Run,
    Stop,
    Drain { deadline: Instant },
}

/// Shared cancellation flag between the owner and a consumer thread.
#[derive(Debug)]
pub struct ConsumerControl {
    mode: Mutex<Mode>,
}

impl Default for ConsumerControl {
    fn default() -> Self {
        Self { mode: Mutex::new(Mode::Run) }
    }
}

impl ConsumerControl {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Exit at the next loop iteration, discarding anything still queued.
    pub fn stop(&self) {
        self.set(Mode::Stop);
    }

    /// Keep polling until a poll comes back empty or `grace` elapses.
    pub fn drain(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        let mut mode = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
        // a stop request is never weakened into a drain
        if *mode == Mode::Run {
            *mode = Mode::Drain { deadline };
        }
    }

    fn set(&self, next: Mode) {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn mode(&self) -> Mode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outcome of one consumer thread.
#[derive(Debug, Default, Clone)]
pub struct ConsumerReport {
    pub source: &'static str,
    pub polls: u64,
    pub dispatched: u64,
    pub error: Option<String>,
    pub summary: Option<String>,
}

pub struct StreamConsumer<S, H> {
    source: S,
    handler: H,
    timeout: Duration,
    control: Arc<ConsumerControl>,
}

impl<S: RecordSource, H: RecordHandler> StreamConsumer<S, H> {
    pub fn new(source: S, handler: H, timeout: Duration) -> Self {
        Self { source, handler, timeout, control: ConsumerControl::new() }
    }

    #[must_use]
    pub fn control(&self) -> Arc<ConsumerControl> {
        Arc::clone(&self.control)
    }

    /// Run the loop on the calling thread until stopped, drained, or failed.
    pub fn run(mut self) -> ConsumerReport {
        let mut report = ConsumerReport { source: self.source.name(), ..ConsumerReport::default() };

        loop {
            let timeout = match self.control.mode() {
                Mode::Run => self.timeout,
                Mode::Stop => break,
                Mode::Drain { deadline } => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    self.timeout.min(deadline - now)
                }
            };

            report.polls += 1;
            let handler = &mut self.handler;
            match self.source.poll(timeout, &mut |record| handler.handle(record)) {
                Ok(0) => {
                    if matches!(self.control.mode(), Mode::Drain { .. }) {
                        break;
                    }
                }
                Ok(n) => report.dispatched += n as u64,
                Err(ChannelError::Disconnected) => {
                    debug!("{}: producer gone, consumer done", report.source);
                    break;
                }
                Err(e) => {
                    error!("{}: {e}", report.source);
                    report.error = Some(e.to_string());
                    break;
                }
            }
        }

        report.summary = self.handler.finish();
        debug!("{}: {} polls, {} records", report.source, report.polls, report.dispatched);
        report
    }
}

impl<S, H> StreamConsumer<S, H>
where
    S: RecordSource + 'static,
    H: RecordHandler + 'static,
{
    /// Move the consumer onto its own named thread.
    ///
    /// # Errors
    /// Returns the OS error if the thread cannot be spawned.
    pub fn spawn(self) -> std::io::Result<ConsumerHandle> {
        let control = self.control();
        let name = format!("pagetap-{}", self.source.name());
        let join = std::thread::Builder::new().name(name).spawn(move || self.run())?;
        Ok(ConsumerHandle { control, join })
    }
}

/// Owner side of a spawned consumer.
pub struct ConsumerHandle {
    control: Arc<ConsumerControl>,
    join: JoinHandle<ConsumerReport>,
}

impl ConsumerHandle {
    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn drain(&self, grace: Duration) {
        self.control.drain(grace);
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the thread. A panicked consumer yields a report carrying the error.
    pub fn join(self) -> ConsumerReport {
        self.join.join().unwrap_or_else(|_| ConsumerReport {
            error: Some("consumer thread panicked".to_string()),
            ..ConsumerReport::default()
        })
    }
}

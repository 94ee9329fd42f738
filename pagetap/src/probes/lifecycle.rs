//! # Probe Lifecycle
//!
//! ```text
//! Unloaded ──open──▶ Opened ──load──▶ Loaded ──attach──▶ Attached
//!     ▲                 │                │                   │
//!     └──── failure ────┴────────────────┘                   │
//!                                                            ▼
//!        destroy (any state, idempotent) ──────────────▶ Destroyed
//! ```
//!
//! A failed stage unwinds everything before it in reverse order: detach the
//! probes already attached, unload the ones already loaded, close the object.
//! Nothing observable happens before Attach, so a startup failure leaves the
//! system as it was.
//!
//! Destroy detaches first so no new records are produced, then drains each
//! consumer for at most the grace period, joins it, and only then unloads and
//! closes. Records still queued when the grace period ends are lost.

use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};

use super::{ProbeBackend, ProbeSpec};
use crate::consumer::{ConsumerHandle, ConsumerReport, RecordHandler, StreamConsumer};
use crate::domain::AttachmentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unloaded,
    Opened,
    Loaded,
    Attached,
    Destroyed,
}

impl State {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            State::Unloaded => "unloaded",
            State::Opened => "opened",
            State::Loaded => "loaded",
            State::Attached => "attached",
            State::Destroyed => "destroyed",
        }
    }
}

pub struct Orchestrator<B: ProbeBackend> {
    backend: B,
    probes: Vec<ProbeSpec>,
    state: State,

    // prefix lengths of `probes` that are loaded / attached
    loaded: usize,
    attached: usize,

    consumers: Vec<ConsumerHandle>,
    poll_timeout: Duration,
    grace: Duration,
}

impl<B: ProbeBackend> Orchestrator<B> {
    pub fn new(backend: B, probes: Vec<ProbeSpec>, poll_timeout: Duration, grace: Duration) -> Self {
        Self {
            backend,
            probes,
            state: State::Unloaded,
            loaded: 0,
            attached: 0,
            consumers: Vec::new(),
            poll_timeout,
            grace,
        }
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    #[must_use]
    pub fn probes(&self) -> &[ProbeSpec] {
        &self.probes
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// # Errors
    /// [`AttachmentError`] from the backend, or an invalid transition.
    pub fn open(&mut self) -> Result<(), AttachmentError> {
        self.expect_state(State::Unloaded, "open")?;
        if let Err(e) = self.backend.open(&self.probes) {
            self.backend.close();
            return Err(e);
        }
        self.state = State::Opened;
        debug!("opened {} probes", self.probes.len());
        Ok(())
    }

    /// # Errors
    /// [`AttachmentError`] from the backend, or an invalid transition.
    pub fn load(&mut self) -> Result<(), AttachmentError> {
        self.expect_state(State::Opened, "load")?;
        for i in 0..self.probes.len() {
            if let Err(e) = self.backend.load(&self.probes[i]) {
                self.unwind();
                return Err(e);
            }
            self.loaded = i + 1;
        }
        self.state = State::Loaded;
        Ok(())
    }

    /// # Errors
    /// [`AttachmentError`] from the backend, or an invalid transition.
    pub fn attach(&mut self) -> Result<(), AttachmentError> {
        self.expect_state(State::Loaded, "attach")?;
        for i in 0..self.probes.len() {
            if let Err(e) = self.backend.attach(&self.probes[i]) {
                self.unwind();
                return Err(e);
            }
            self.attached = i + 1;
            info!("attached {} to {}", self.probes[i].program, self.probes[i].target);
        }
        self.state = State::Attached;
        Ok(())
    }

    /// Open, load and attach in one go.
    ///
    /// # Errors
    /// The first failing stage's [`AttachmentError`]; the state is `Unloaded`.
    pub fn start(&mut self) -> Result<(), AttachmentError> {
        self.open()?;
        self.load()?;
        self.attach()
    }

    /// Take the event channel and run `handler` over it on its own thread.
    ///
    /// # Errors
    /// Fails if the probes are not attached, the channel cannot be taken, or
    /// the thread cannot be spawned.
    pub fn spawn_event_consumer<H: RecordHandler + 'static>(&mut self, handler: H) -> Result<()> {
        self.expect_state(State::Attached, "start consumers")?;
        let source = self.backend.event_channel().context("event channel")?;
        let handle = StreamConsumer::new(source, handler, self.poll_timeout)
            .spawn()
            .context("spawn event consumer")?;
        self.consumers.push(handle);
        Ok(())
    }

    /// Hand an already running consumer to the orchestrator so that destroy
    /// drains and joins it in order.
    ///
    /// # Errors
    /// Fails unless the probes are attached; the consumer is stopped in that case.
    pub fn adopt(&mut self, handle: ConsumerHandle) -> Result<(), AttachmentError> {
        if let Err(e) = self.expect_state(State::Attached, "start consumers") {
            handle.stop();
            handle.join();
            return Err(e);
        }
        self.consumers.push(handle);
        Ok(())
    }

    /// Tear everything down. Valid from every state; repeated calls are no-ops.
    ///
    /// Consumers are drained and joined in the order they were started.
    pub fn destroy(&mut self) -> Vec<ConsumerReport> {
        if self.state == State::Destroyed {
            return Vec::new();
        }

        self.detach_all();

        let reports = self
            .consumers
            .drain(..)
            .map(|handle| {
                handle.drain(self.grace);
                handle.join()
            })
            .collect();

        self.unwind();
        self.state = State::Destroyed;
        debug!("destroyed");
        reports
    }

    fn detach_all(&mut self) {
        while self.attached > 0 {
            self.attached -= 1;
            self.backend.detach(&self.probes[self.attached]);
        }
    }

    // Reverse-order teardown back to Unloaded.
    fn unwind(&mut self) {
        self.detach_all();
        while self.loaded > 0 {
            self.loaded -= 1;
            self.backend.unload(&self.probes[self.loaded]);
        }
        if self.state != State::Unloaded {
            self.backend.close();
        }
        self.state = State::Unloaded;
    }

    fn expect_state(&self, want: State, action: &'static str) -> Result<(), AttachmentError> {
        if self.state == want {
            Ok(())
        } else {
            Err(AttachmentError::InvalidTransition { action, state: self.state.name() })
        }
    }
}

impl<B: ProbeBackend> Drop for Orchestrator<B> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{lossy_ring, LossyProducer, RecordSource};
    use crate::domain::ChannelError;
    use crate::probes::fault_probes;
    use std::sync::{Arc, Mutex};

    /// Scripted backend: records every call, fails where told to.
    #[derive(Default)]
    struct Mock {
        calls: Arc<Mutex<Vec<String>>>,
        fail_open: bool,
        fail_load: Option<&'static str>,
        fail_attach: Option<&'static str>,
        producer: Option<LossyProducer>,
    }

    impl Mock {
        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl ProbeBackend for Mock {
        fn open(&mut self, _: &[ProbeSpec]) -> Result<(), AttachmentError> {
            self.log("open".into());
            if self.fail_open {
                return Err(AttachmentError::OpenFailed("bad object".into()));
            }
            Ok(())
        }

        fn load(&mut self, probe: &ProbeSpec) -> Result<(), AttachmentError> {
            self.log(format!("load {}", probe.program));
            if self.fail_load == Some(probe.program) {
                return Err(AttachmentError::LoadFailed {
                    probe: probe.program.into(),
                    error: "verifier".into(),
                });
            }
            Ok(())
        }

        fn attach(&mut self, probe: &ProbeSpec) -> Result<(), AttachmentError> {
            self.log(format!("attach {}", probe.program));
            if self.fail_attach == Some(probe.program) {
                return Err(AttachmentError::AttachFailed {
                    probe: probe.program.into(),
                    target: probe.target.to_string(),
                    error: "no such symbol".into(),
                });
            }
            Ok(())
        }

        fn detach(&mut self, probe: &ProbeSpec) {
            self.log(format!("detach {}", probe.program));
        }

        fn unload(&mut self, probe: &ProbeSpec) {
            self.log(format!("unload {}", probe.program));
        }

        fn close(&mut self) {
            self.log("close".into());
        }

        fn event_channel(&mut self) -> Result<Box<dyn RecordSource>, ChannelError> {
            self.log("channel".into());
            let (producer, ring) = lossy_ring(16);
            self.producer = Some(producer);
            Ok(Box::new(ring))
        }
    }

    fn orchestrator(mock: Mock) -> (Orchestrator<Mock>, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::clone(&mock.calls);
        let o = Orchestrator::new(
            mock,
            fault_probes(),
            Duration::from_millis(20),
            Duration::from_millis(100),
        );
        (o, calls)
    }

    fn take(calls: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        std::mem::take(&mut *calls.lock().unwrap())
    }

    #[test]
    fn full_lifecycle_in_order() {
        let (mut o, calls) = orchestrator(Mock::default());
        o.start().unwrap();
        assert_eq!(o.state(), State::Attached);
        o.spawn_event_consumer(|_: &[u8]| {}).unwrap();

        let reports = o.destroy();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].error.is_none());
        assert_eq!(o.state(), State::Destroyed);
        assert_eq!(
            take(&calls),
            vec![
                "open",
                "load fault_exit",
                "load fault_entry",
                "attach fault_exit",
                "attach fault_entry",
                "channel",
                "detach fault_entry",
                "detach fault_exit",
                "unload fault_entry",
                "unload fault_exit",
                "close",
            ]
        );
    }

    #[test]
    fn attach_failure_after_load_unwinds_to_unloaded() {
        let (mut o, calls) =
            orchestrator(Mock { fail_attach: Some("fault_entry"), ..Mock::default() });

        let err = o.start().unwrap_err();
        assert_eq!(err.stage(), crate::domain::Stage::Attach);
        assert_eq!(o.state(), State::Unloaded);
        assert_eq!(o.consumer_count(), 0);

        let log = take(&calls);
        assert!(!log.contains(&"channel".to_string()));
        assert_eq!(
            log[4..],
            ["attach fault_entry", "detach fault_exit", "unload fault_entry", "unload fault_exit", "close"]
        );
    }

    #[test]
    fn failed_start_never_takes_the_event_channel() {
        let (mut o, calls) =
            orchestrator(Mock { fail_attach: Some("fault_exit"), ..Mock::default() });
        assert!(o.start().is_err());
        assert!(o.spawn_event_consumer(|_: &[u8]| {}).is_err());
        assert_eq!(o.consumer_count(), 0);
        assert!(!take(&calls).iter().any(|c| c == "channel"));
    }

    #[test]
    fn load_failure_unloads_only_what_loaded() {
        let (mut o, calls) = orchestrator(Mock { fail_load: Some("fault_entry"), ..Mock::default() });
        assert!(o.start().is_err());
        assert_eq!(o.state(), State::Unloaded);
        assert_eq!(
            take(&calls),
            vec!["open", "load fault_exit", "load fault_entry", "unload fault_exit", "close"]
        );
    }

    #[test]
    fn open_failure_is_side_effect_free() {
        let (mut o, calls) = orchestrator(Mock { fail_open: true, ..Mock::default() });
        let err = o.start().unwrap_err();
        assert_eq!(err.stage(), crate::domain::Stage::Open);
        assert_eq!(o.state(), State::Unloaded);
        assert_eq!(take(&calls), vec!["open", "close"]);
    }

    #[test]
    fn destroy_is_idempotent_from_every_state() {
        for stop_after in 0..4 {
            let (mut o, calls) = orchestrator(Mock::default());
            if stop_after >= 1 {
                o.open().unwrap();
            }
            if stop_after >= 2 {
                o.load().unwrap();
            }
            if stop_after >= 3 {
                o.attach().unwrap();
            }
            o.destroy();
            let first = take(&calls);
            o.destroy();
            assert!(take(&calls).is_empty(), "second destroy after {first:?}");
            assert_eq!(o.state(), State::Destroyed);
        }
    }

    #[test]
    fn destroy_after_failed_start_only_marks_destroyed() {
        let (mut o, calls) = orchestrator(Mock { fail_attach: Some("fault_exit"), ..Mock::default() });
        assert!(o.start().is_err());
        take(&calls);
        o.destroy();
        assert!(take(&calls).is_empty());
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let (mut o, _calls) = orchestrator(Mock::default());
        assert!(matches!(o.attach(), Err(AttachmentError::InvalidTransition { .. })));
        assert!(o.spawn_event_consumer(|_: &[u8]| {}).is_err());
        o.destroy();
        assert!(o.open().is_err());
    }

    #[test]
    fn destroy_drains_queued_records() {
        let (mut o, _calls) = orchestrator(Mock::default());
        o.start().unwrap();

        let seen = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&seen);
        o.spawn_event_consumer(move |_: &[u8]| *counter.lock().unwrap() += 1).unwrap();
        let producer = o.backend().producer.clone().unwrap();
        for i in 0..8u8 {
            producer.submit(vec![i]);
        }

        let reports = o.destroy();
        assert_eq!(reports[0].dispatched, 8);
        assert_eq!(*seen.lock().unwrap(), 8);
    }
}

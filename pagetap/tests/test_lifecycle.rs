//! Startup failure handling through the public orchestrator API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pagetap::channel::{lossy_ring, RecordSource};
use pagetap::domain::{AttachmentError, ChannelError, Stage};
use pagetap::probes::{
    call_site_probes, fault_probes, CallSite, Orchestrator, ProbeBackend, ProbeSpec, State,
};

/// Backend whose attach fails for one named program.
struct FailingAttach {
    fail: &'static str,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FailingAttach {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

impl ProbeBackend for FailingAttach {
    fn open(&mut self, _: &[ProbeSpec]) -> Result<(), AttachmentError> {
        self.record("open");
        Ok(())
    }

    fn load(&mut self, probe: &ProbeSpec) -> Result<(), AttachmentError> {
        self.record(format!("load {}", probe.program));
        Ok(())
    }

    fn attach(&mut self, probe: &ProbeSpec) -> Result<(), AttachmentError> {
        self.record(format!("attach {}", probe.program));
        if probe.program == self.fail {
            return Err(AttachmentError::AttachFailed {
                probe: probe.program.to_string(),
                target: probe.target.to_string(),
                error: "No such file or directory".to_string(),
            });
        }
        Ok(())
    }

    fn detach(&mut self, probe: &ProbeSpec) {
        self.record(format!("detach {}", probe.program));
    }

    fn unload(&mut self, probe: &ProbeSpec) {
        self.record(format!("unload {}", probe.program));
    }

    fn close(&mut self) {
        self.record("close");
    }

    fn event_channel(&mut self) -> Result<Box<dyn RecordSource>, ChannelError> {
        self.record("channel");
        Ok(Box::new(lossy_ring(1).1))
    }
}

#[test]
fn test_attach_failure_after_load_leaves_nothing_behind() {
    let site: CallSite = "/bin/true:main".parse().unwrap();
    let mut probes = fault_probes();
    probes.extend(call_site_probes(&site, None));

    let calls = Arc::new(Mutex::new(Vec::new()));
    let backend = FailingAttach { fail: "call_site_entry", calls: Arc::clone(&calls) };
    let mut orchestrator =
        Orchestrator::new(backend, probes, Duration::from_millis(10), Duration::from_millis(10));

    let err = orchestrator.start().unwrap_err();
    assert_eq!(err.stage(), Stage::Attach);
    assert!(err.to_string().contains("call_site_entry"));
    assert_eq!(orchestrator.state(), State::Unloaded);
    assert_eq!(orchestrator.consumer_count(), 0);

    let log = calls.lock().unwrap().clone();
    assert!(!log.iter().any(|c| c == "channel"));

    // everything attached before the failure is detached in reverse, then
    // everything loaded is unloaded in reverse
    let tail: Vec<&str> = log
        .iter()
        .map(String::as_str)
        .skip_while(|c| *c != "attach call_site_entry")
        .collect();
    assert_eq!(
        tail,
        [
            "attach call_site_entry",
            "detach call_site_exit",
            "detach fault_entry",
            "detach fault_exit",
            "unload call_site_entry",
            "unload call_site_exit",
            "unload fault_entry",
            "unload fault_exit",
            "close",
        ]
    );

    // consumers cannot be started on a failed orchestrator
    assert!(orchestrator.spawn_event_consumer(|_: &[u8]| {}).is_err());
    orchestrator.destroy();
    assert_eq!(orchestrator.state(), State::Destroyed);
}

//! Probe declarations, the aya backend and the lifecycle that drives it.

pub mod backend;
pub mod definition;
pub mod diagnostics;
pub mod ebpf_setup;
pub mod lifecycle;

pub use backend::ProbeBackend;
pub use definition::{
    call_site_probes, fault_probes, AttachTarget, CallSite, ProbeKind, ProbeSpec, FAULT_SYMBOL,
};
pub use diagnostics::{read_probe_stats, ProbeStats};
pub use ebpf_setup::{
    configure_filter, default_ebpf_object, find_ebpf_object, init_ebpf_logger, AyaBackend,
    BackendConfig, EBPF_OBJECT_SUBPATH,
};
pub use lifecycle::{Orchestrator, State};

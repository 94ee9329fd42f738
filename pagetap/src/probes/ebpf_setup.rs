//! # eBPF Object Loading and Attachment
//!
//! [`AyaBackend`] implements [`ProbeBackend`] on top of aya:
//!
//! - **open**: parse the object file, verify the declared programs, write
//!   `TARGET` and `OFFSETS`
//! - **load**: `program.load()` per probe
//! - **attach**: routed through [`BINDINGS`], keyed by [`ProbeKind`]
//! - **event_channel**: start the `aya-log` bridge and take the `EVENTS` ring;
//!   only reached once every probe is attached
//! - **detach / unload / close**: the reverse, logging instead of failing
//!
//! The object is read from disk at open time so the user-space crate builds
//! without a BPF toolchain; `cargo xtask build-ebpf` produces it.

use std::collections::HashMap as StdHashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use aya::maps::HashMap;
use aya::programs::{
    kprobe::KProbeLinkId, uprobe::UProbeLinkId, xdp::XdpLinkId, KProbe, Program, ProgramError,
    UProbe, Xdp, XdpFlags,
};
use aya::Ebpf;
use aya_log::EbpfLogger;
use log::{debug, info, warn};
use pagetap_common::{KernelOffsets, TargetSpec, CONFIG_KEY};

use super::diagnostics::{read_probe_stats, ProbeStats};
use super::{ProbeBackend, ProbeKind, ProbeSpec};
use crate::channel::kernel_ring::EVENTS_MAP;
use crate::channel::{KernelRing, RecordSource};
use crate::domain::{AttachmentError, ChannelError};

/// Object path below a cargo target directory, as `cargo xtask build-ebpf` writes it.
pub const EBPF_OBJECT_SUBPATH: &str = "bpfel-unknown-none/release/pagetap";

/// Object next to the running binary, else `target/` under the working directory.
#[must_use]
pub fn default_ebpf_object() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| find_ebpf_object(&exe))
        .unwrap_or_else(|| Path::new("target").join(EBPF_OBJECT_SUBPATH))
}

/// Walk up from `exe` (e.g. `<target>/release/pagetap`) to the first
/// directory holding [`EBPF_OBJECT_SUBPATH`].
#[must_use]
pub fn find_ebpf_object(exe: &Path) -> Option<PathBuf> {
    exe.ancestors().skip(1).map(|dir| dir.join(EBPF_OBJECT_SUBPATH)).find(|p| p.is_file())
}

/// aya program type a kind binds through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramClass {
    KProbe,
    UProbe,
    Xdp,
}

type AttachFn = fn(&mut Ebpf, &ProbeSpec) -> Result<Link, String>;

/// One row of the attach dispatch table.
pub struct Binding {
    pub kind: ProbeKind,
    pub class: ProgramClass,
    attach: AttachFn,
}

/// Attach dispatch table.
pub static BINDINGS: [Binding; 4] = [
    Binding {
        kind: ProbeKind::FunctionEntry,
        class: ProgramClass::KProbe,
        attach: attach_kprobe,
    },
    Binding {
        kind: ProbeKind::FunctionReturn,
        class: ProgramClass::KProbe,
        attach: attach_kprobe,
    },
    Binding {
        kind: ProbeKind::CallSite,
        class: ProgramClass::UProbe,
        attach: attach_uprobe,
    },
    Binding {
        kind: ProbeKind::NetworkHook,
        class: ProgramClass::Xdp,
        attach: attach_xdp,
    },
];

/// Look up the binding for a probe kind.
#[must_use]
pub fn binding(kind: ProbeKind) -> Option<&'static Binding> {
    BINDINGS.iter().find(|b| b.kind == kind)
}

enum Link {
    KProbe(KProbeLinkId),
    UProbe(UProbeLinkId),
    Xdp(XdpLinkId),
}

/// What to open and how to configure it.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub object: PathBuf,
    pub target: TargetSpec,
    pub offsets: Option<KernelOffsets>,
    /// Bridge kernel `aya-log` records into the user-space logger
    pub kernel_log: bool,
}

pub struct AyaBackend {
    config: BackendConfig,
    bpf: Option<Ebpf>,
    links: StdHashMap<&'static str, Link>,
    final_stats: Option<ProbeStats>,
}

impl AyaBackend {
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        Self { config, bpf: None, links: StdHashMap::new(), final_stats: None }
    }

    /// Live counters while open; the snapshot taken at close afterwards.
    #[must_use]
    pub fn stats(&self) -> Option<ProbeStats> {
        match &self.bpf {
            Some(bpf) => read_probe_stats(bpf).map_err(|e| debug!("stats: {e:#}")).ok(),
            None => self.final_stats,
        }
    }

    fn bpf_mut(&mut self, probe: &ProbeSpec) -> Result<&mut Ebpf, String> {
        self.bpf.as_mut().ok_or_else(|| format!("{}: object not open", probe.program))
    }
}

impl ProbeBackend for AyaBackend {
    fn open(&mut self, probes: &[ProbeSpec]) -> Result<(), AttachmentError> {
        let path = &self.config.object;
        let mut bpf = Ebpf::load_file(path)
            .map_err(|e| AttachmentError::OpenFailed(format!("{}: {e}", path.display())))?;

        for probe in probes {
            if bpf.program(probe.program).is_none() {
                return Err(AttachmentError::OpenFailed(format!(
                    "program {} not found in {}",
                    probe.program,
                    path.display()
                )));
            }
        }

        configure_filter(&mut bpf, &self.config.target, self.config.offsets)
            .map_err(|e| AttachmentError::OpenFailed(format!("{e:#}")))?;

        info!("opened {}", path.display());
        self.bpf = Some(bpf);
        Ok(())
    }

    fn load(&mut self, probe: &ProbeSpec) -> Result<(), AttachmentError> {
        let class = class_of(probe.target.kind);
        let name = probe.program;
        let result = self.bpf_mut(probe).and_then(|bpf| match class {
            ProgramClass::KProbe => typed::<KProbe>(bpf, name)?.load().map_err(|e| e.to_string()),
            ProgramClass::UProbe => typed::<UProbe>(bpf, name)?.load().map_err(|e| e.to_string()),
            ProgramClass::Xdp => typed::<Xdp>(bpf, name)?.load().map_err(|e| e.to_string()),
        });
        result.map_err(|error| AttachmentError::LoadFailed { probe: name.to_string(), error })?;
        debug!("loaded {name}");
        Ok(())
    }

    fn attach(&mut self, probe: &ProbeSpec) -> Result<(), AttachmentError> {
        let fail = |error: String| AttachmentError::AttachFailed {
            probe: probe.program.to_string(),
            target: probe.target.to_string(),
            error,
        };
        let binding = binding(probe.target.kind)
            .ok_or_else(|| fail(format!("no binding for {}", probe.target.kind)))?;
        let bpf = self.bpf_mut(probe).map_err(fail)?;
        let link = (binding.attach)(bpf, probe).map_err(fail)?;
        self.links.insert(probe.program, link);
        Ok(())
    }

    fn detach(&mut self, probe: &ProbeSpec) {
        let (Some(link), Some(bpf)) = (self.links.remove(probe.program), self.bpf.as_mut()) else {
            return;
        };
        let name = probe.program;
        let result = match link {
            Link::KProbe(id) => typed::<KProbe>(bpf, name)
                .and_then(|p| p.detach(id).map_err(|e| e.to_string())),
            Link::UProbe(id) => typed::<UProbe>(bpf, name)
                .and_then(|p| p.detach(id).map_err(|e| e.to_string())),
            Link::Xdp(id) => {
                typed::<Xdp>(bpf, name).and_then(|p| p.detach(id).map_err(|e| e.to_string()))
            }
        };
        match result {
            Ok(()) => debug!("detached {name}"),
            Err(e) => warn!("detach {name}: {e}"),
        }
    }

    fn unload(&mut self, probe: &ProbeSpec) {
        let class = class_of(probe.target.kind);
        let name = probe.program;
        let Some(bpf) = self.bpf.as_mut() else {
            return;
        };
        let result = match class {
            ProgramClass::KProbe => {
                typed::<KProbe>(bpf, name).and_then(|p| p.unload().map_err(|e| e.to_string()))
            }
            ProgramClass::UProbe => {
                typed::<UProbe>(bpf, name).and_then(|p| p.unload().map_err(|e| e.to_string()))
            }
            ProgramClass::Xdp => {
                typed::<Xdp>(bpf, name).and_then(|p| p.unload().map_err(|e| e.to_string()))
            }
        };
        if let Err(e) = result {
            warn!("unload {name}: {e}");
        }
    }

    fn close(&mut self) {
        self.links.clear();
        if let Some(bpf) = self.bpf.take() {
            self.final_stats = read_probe_stats(&bpf).map_err(|e| debug!("stats: {e:#}")).ok();
            debug!("closed {}", self.config.object.display());
        }
    }

    fn event_channel(&mut self) -> Result<Box<dyn RecordSource>, ChannelError> {
        let bpf = self.bpf.as_mut().ok_or(ChannelError::MapNotFound(EVENTS_MAP))?;
        let ring = KernelRing::take(bpf)?;
        if self.config.kernel_log {
            init_ebpf_logger(bpf);
        }
        Ok(Box::new(ring))
    }
}

/// Initialize eBPF logger
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Write the filter and struct offsets at [`CONFIG_KEY`]. An empty filter
/// leaves `TARGET` empty, which the handlers read as "match all".
///
/// # Errors
/// Returns an error if either map is missing or the insert fails
pub fn configure_filter(
    bpf: &mut Ebpf,
    target: &TargetSpec,
    offsets: Option<KernelOffsets>,
) -> Result<()> {
    if !target.is_empty() {
        let mut map: HashMap<_, u32, TargetSpec> =
            HashMap::try_from(bpf.map_mut("TARGET").context("TARGET map not found")?)?;
        map.insert(CONFIG_KEY, *target, 0)?;
        info!(
            "filter: pid={:?} comm={} object={}",
            target.pid_filter(),
            target.has_comm(),
            target.has_object()
        );
    }

    if let Some(offsets) = offsets {
        let mut map: HashMap<_, u32, KernelOffsets> =
            HashMap::try_from(bpf.map_mut("OFFSETS").context("OFFSETS map not found")?)?;
        map.insert(CONFIG_KEY, offsets, 0)?;
        debug!("offsets: {offsets:?}");
    }
    Ok(())
}

fn class_of(kind: ProbeKind) -> ProgramClass {
    binding(kind).map_or(ProgramClass::KProbe, |b| b.class)
}

fn typed<'a, T>(bpf: &'a mut Ebpf, name: &str) -> Result<&'a mut T, String>
where
    &'a mut T: TryFrom<&'a mut Program, Error = ProgramError>,
{
    let program = bpf.program_mut(name).ok_or_else(|| format!("program {name} not found"))?;
    program.try_into().map_err(|e: ProgramError| e.to_string())
}

fn attach_kprobe(bpf: &mut Ebpf, probe: &ProbeSpec) -> Result<Link, String> {
    let program = typed::<KProbe>(bpf, probe.program)?;
    program
        .attach(probe.target.reference.as_str(), probe.target.offset)
        .map(Link::KProbe)
        .map_err(|e| e.to_string())
}

#[allow(clippy::cast_possible_wrap)]
fn attach_uprobe(bpf: &mut Ebpf, probe: &ProbeSpec) -> Result<Link, String> {
    let (binary, symbol) = probe
        .target
        .call_site_parts()
        .ok_or_else(|| format!("bad call site reference {}", probe.target.reference))?;
    let program = typed::<UProbe>(bpf, probe.program)?;
    program
        .attach(Some(symbol), probe.target.offset, binary, probe.pid.map(|p| p as i32))
        .map(Link::UProbe)
        .map_err(|e| e.to_string())
}

fn attach_xdp(bpf: &mut Ebpf, probe: &ProbeSpec) -> Result<Link, String> {
    let program = typed::<Xdp>(bpf, probe.program)?;
    program
        .attach(&probe.target.reference, XdpFlags::default())
        .map(Link::Xdp)
        .map_err(|e| e.to_string())
}

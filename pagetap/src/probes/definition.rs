//! Probe declarations: which program binds to which event source.
//!
//! A probe is a tagged pair {kind, reference}. The kind alone selects the
//! binding call at attach time; see [`ebpf_setup`](super::ebpf_setup).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Kernel function whose entry and return bracket a page fault.
pub const FAULT_SYMBOL: &str = "handle_mm_fault";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    FunctionEntry,
    FunctionReturn,
    CallSite,
    NetworkHook,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProbeKind::FunctionEntry => "kprobe",
            ProbeKind::FunctionReturn => "kretprobe",
            ProbeKind::CallSite => "uprobe",
            ProbeKind::NetworkHook => "xdp",
        })
    }
}

/// Event source descriptor: kind, symbol-or-path reference, offset.
///
/// For [`ProbeKind::CallSite`] the reference is `BINARY:SYMBOL`; for
/// [`ProbeKind::NetworkHook`] it is an interface name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachTarget {
    pub kind: ProbeKind,
    pub reference: String,
    pub offset: u64,
}

impl AttachTarget {
    #[must_use]
    pub fn function_entry(symbol: &str) -> Self {
        Self { kind: ProbeKind::FunctionEntry, reference: symbol.to_string(), offset: 0 }
    }

    #[must_use]
    pub fn function_return(symbol: &str) -> Self {
        Self { kind: ProbeKind::FunctionReturn, reference: symbol.to_string(), offset: 0 }
    }

    #[must_use]
    pub fn call_site(site: &CallSite) -> Self {
        Self {
            kind: ProbeKind::CallSite,
            reference: format!("{}:{}", site.binary.display(), site.symbol),
            offset: site.offset,
        }
    }

    #[must_use]
    pub fn network_hook(interface: &str) -> Self {
        Self { kind: ProbeKind::NetworkHook, reference: interface.to_string(), offset: 0 }
    }

    /// `(binary, symbol)` of a call-site reference.
    #[must_use]
    pub fn call_site_parts(&self) -> Option<(&str, &str)> {
        match self.kind {
            ProbeKind::CallSite => self.reference.split_once(':'),
            _ => None,
        }
    }
}

impl fmt::Display for AttachTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.reference)?;
        if self.offset != 0 {
            write!(f, "+{:#x}", self.offset)?;
        }
        Ok(())
    }
}

/// One program in the eBPF object and where it attaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    /// Program name in the object file
    pub program: &'static str,
    pub target: AttachTarget,
    /// Restrict a call-site probe to one process
    pub pid: Option<u32>,
}

/// The page fault pair. The return probe comes first so that no entry is
/// recorded before its exit can fire.
#[must_use]
pub fn fault_probes() -> Vec<ProbeSpec> {
    vec![
        ProbeSpec {
            program: "fault_exit",
            target: AttachTarget::function_return(FAULT_SYMBOL),
            pid: None,
        },
        ProbeSpec {
            program: "fault_entry",
            target: AttachTarget::function_entry(FAULT_SYMBOL),
            pid: None,
        },
    ]
}

/// Entry/return pair on a user-space function, return first.
#[must_use]
pub fn call_site_probes(site: &CallSite, pid: Option<u32>) -> Vec<ProbeSpec> {
    let target = AttachTarget::call_site(site);
    vec![
        ProbeSpec { program: "call_site_exit", target: target.clone(), pid },
        ProbeSpec { program: "call_site_entry", target, pid },
    ]
}

/// `BINARY:SYMBOL[+OFFSET]` as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    pub binary: PathBuf,
    pub symbol: String,
    pub offset: u64,
}

impl FromStr for CallSite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (binary, rest) =
            s.split_once(':').ok_or_else(|| format!("expected BINARY:SYMBOL, got {s:?}"))?;
        let (symbol, offset) = match rest.rsplit_once('+') {
            Some((symbol, off)) => (symbol, parse_offset(off)?),
            None => (rest, 0),
        };
        if binary.is_empty() || symbol.is_empty() {
            return Err(format!("expected BINARY:SYMBOL, got {s:?}"));
        }
        Ok(Self { binary: PathBuf::from(binary), symbol: symbol.to_string(), offset })
    }
}

fn parse_offset(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("bad offset {s:?}: {e}"))
}

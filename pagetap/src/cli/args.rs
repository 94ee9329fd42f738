//! CLI argument definitions

use std::path::PathBuf;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use pagetap_common::{KernelOffsets, TargetSpec, COMM_LEN, NAME_LEN};

use crate::channel::DEFAULT_TRACE_PIPE;
use crate::probes::{default_ebpf_object, CallSite};

#[derive(Parser, Debug)]
#[command(
    name = "pagetap",
    version,
    about = "Intercept page faults of selected processes and rewrite the faulting page",
    after_help = "\
EXAMPLES:
    sudo pagetap --pid 1234                          Every fault of one process
    sudo pagetap --comm reader --dump-pages          By process name, with page dumps
    sudo pagetap --comm reader --object data.txt \\
        --vm-file-offset 160 --f-path-dentry-offset 24 --d-iname-offset 56
                                                     Only faults on pages of data.txt
    sudo pagetap --pid 1234 --call-site ./app:fill_buffer --trace-pipe"
)]
pub struct Args {
    /// Only threads of this process
    #[arg(short, long)]
    pub pid: Option<u32>,

    /// Only threads whose command name is exactly NAME
    #[arg(short, long, value_name = "NAME")]
    pub comm: Option<String>,

    /// Only faults on mappings backed by a file named NAME (needs the three offsets)
    #[arg(long, value_name = "NAME")]
    pub object: Option<String>,

    /// offsetof(struct vm_area_struct, vm_file)
    #[arg(long, value_parser = parse_number)]
    pub vm_file_offset: Option<u32>,

    /// offsetof(struct file, f_path) + offsetof(struct path, dentry)
    #[arg(long, value_parser = parse_number)]
    pub f_path_dentry_offset: Option<u32>,

    /// offsetof(struct dentry, d_iname)
    #[arg(long, value_parser = parse_number)]
    pub d_iname_offset: Option<u32>,

    /// Also interpose on a user-space function; its first argument is the address
    #[arg(long, value_name = "BINARY:SYMBOL[+OFFSET]")]
    pub call_site: Option<CallSite>,

    /// Compiled eBPF object [default: found from the pagetap binary's target directory]
    #[arg(long, value_name = "FILE")]
    pub ebpf_object: Option<PathBuf>,

    /// Also follow the kernel trace pipe
    #[arg(long, value_name = "PATH", num_args = 0..=1, default_missing_value = DEFAULT_TRACE_PIPE)]
    pub trace_pipe: Option<PathBuf>,

    /// Write every event as a JSON line to FILE
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Records buffered between the consumer and the export writer
    #[arg(long, default_value_t = 4096, requires = "export")]
    pub export_buffer: usize,

    /// Hex dump every captured page
    #[arg(long)]
    pub dump_pages: bool,

    /// Consumer poll timeout in milliseconds
    #[arg(long, default_value_t = 100)]
    pub poll_ms: u64,

    /// How long shutdown keeps draining channels, in milliseconds
    #[arg(long, default_value_t = 500)]
    pub grace_ms: u64,

    /// Suppress per-event output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Cross-argument checks clap cannot express.
    ///
    /// # Errors
    /// A usage error describing the first violated constraint.
    pub fn validate(&self) -> Result<(), clap::Error> {
        let mut cmd = Self::command();
        if self.object.is_some() && self.kernel_offsets().is_none() {
            return Err(cmd.error(
                ErrorKind::MissingRequiredArgument,
                "--object requires --vm-file-offset, --f-path-dentry-offset and --d-iname-offset",
            ));
        }
        if let Some(object) = &self.object {
            if object.is_empty() || object.len() >= NAME_LEN {
                return Err(cmd.error(
                    ErrorKind::InvalidValue,
                    format!("--object must be 1..{} bytes (inline dentry name)", NAME_LEN - 1),
                ));
            }
        }
        if self.comm.as_deref() == Some("") {
            return Err(cmd.error(ErrorKind::InvalidValue, "--comm must not be empty"));
        }
        if self.poll_ms == 0 {
            return Err(cmd.error(ErrorKind::InvalidValue, "--poll-ms must be positive"));
        }
        Ok(())
    }

    /// `--ebpf-object`, or the object built next to this binary.
    #[must_use]
    pub fn ebpf_object_path(&self) -> PathBuf {
        self.ebpf_object.clone().unwrap_or_else(default_ebpf_object)
    }

    /// Filter for the kernel side.
    ///
    /// Command names longer than the kernel keeps (15 bytes) are cut to match
    /// what the kernel reports.
    #[must_use]
    pub fn target_spec(&self) -> TargetSpec {
        let mut spec = TargetSpec::match_all();
        if let Some(pid) = self.pid {
            spec = spec.with_pid(pid);
        }
        if let Some(comm) = &self.comm {
            let bytes = comm.as_bytes();
            spec = spec.with_comm(&bytes[..bytes.len().min(COMM_LEN - 1)]);
        }
        if let Some(object) = &self.object {
            spec = spec.with_object(object.as_bytes());
        }
        spec
    }

    /// All three offsets, or none.
    #[must_use]
    pub fn kernel_offsets(&self) -> Option<KernelOffsets> {
        Some(KernelOffsets {
            vm_file: self.vm_file_offset?,
            f_path_dentry: self.f_path_dentry_offset?,
            d_iname: self.d_iname_offset?,
            _padding: 0,
        })
    }

    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    #[must_use]
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// Decimal or `0x`-prefixed hex.
fn parse_number(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{s:?}: {e}"))
}

//! Pre-flight checks for pagetap
//!
//! Validates system requirements before attempting to load eBPF programs.
//! Provides clear, actionable error messages when requirements aren't met.

use std::path::{Path, PathBuf};

use log::debug;
use object::{Object, ObjectSymbol};
use thiserror::Error;

use crate::probes::CallSite;

/// Minimum kernel version: BPF ring buffer
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

#[derive(Error, Debug)]
pub enum PreflightError {
    #[error(
        "permission denied: pagetap requires root privileges to load eBPF programs\n\n\
         Run with: sudo pagetap ..."
    )]
    NotRoot,

    #[error(
        "kernel {release} is too old: pagetap requires Linux {}.{} or newer for the BPF ring buffer",
        MIN_KERNEL_VERSION.0,
        MIN_KERNEL_VERSION.1
    )]
    KernelTooOld { release: String },

    #[error("process {0} not found\n\nIs the process still running? Check with: ps -p {0}")]
    ProcessNotFound(u32),

    #[error("binary not found: {}", .0.display())]
    BinaryNotFound(PathBuf),

    #[error("cannot read {}: {source}", path.display())]
    Unreadable { path: PathBuf, source: std::io::Error },

    #[error("{} is not a parseable object file: {reason}", path.display())]
    NotAnObject { path: PathBuf, reason: String },

    #[error("symbol {symbol} not found in {}", binary.display())]
    SymbolNotFound { symbol: String, binary: PathBuf },
}

impl PreflightError {
    /// Whether this failure is about privilege rather than configuration.
    #[must_use]
    pub fn is_privilege(&self) -> bool {
        matches!(self, PreflightError::NotRoot)
    }
}

/// Run all pre-flight checks before eBPF loading
///
/// # Errors
/// The first failing check.
pub fn run_preflight_checks(
    pid: Option<u32>,
    call_site: Option<&CallSite>,
) -> Result<(), PreflightError> {
    check_privileges()?;
    check_kernel_version()?;
    if let Some(pid) = pid {
        check_process_exists(pid)?;
    }
    if let Some(site) = call_site {
        check_call_site(site)?;
    }
    Ok(())
}

/// Check if running with sufficient privileges for eBPF
fn check_privileges() -> Result<(), PreflightError> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    #[allow(unsafe_code)]
    let euid = unsafe { libc::geteuid() };
    // bpf_probe_write_user needs CAP_SYS_ADMIN in practice; require root
    if euid == 0 {
        Ok(())
    } else {
        Err(PreflightError::NotRoot)
    }
}

/// Check if the kernel version is sufficient for eBPF features
fn check_kernel_version() -> Result<(), PreflightError> {
    let Ok(version_str) = std::fs::read_to_string("/proc/version") else {
        debug!("cannot read /proc/version, skipping kernel check");
        return Ok(());
    };

    // "Linux version 6.1.0-arch1-1 ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");
    match parse_release(release) {
        Some(version) if version < MIN_KERNEL_VERSION => {
            Err(PreflightError::KernelTooOld { release: release.to_string() })
        }
        // unparseable: let the load stage report the real problem
        _ => Ok(()),
    }
}

/// `(major, minor)` of a kernel release string such as `5.15.0-generic`.
fn parse_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor_digits: String =
        parts.next()?.chars().take_while(char::is_ascii_digit).collect();
    Some((major, minor_digits.parse().ok()?))
}

/// Check if the target process exists
///
/// # Errors
/// [`PreflightError::ProcessNotFound`]
pub fn check_process_exists(pid: u32) -> Result<(), PreflightError> {
    if Path::new(&format!("/proc/{pid}")).exists() {
        Ok(())
    } else {
        Err(PreflightError::ProcessNotFound(pid))
    }
}

/// Check that the call-site binary exists and exports the symbol.
///
/// # Errors
/// Missing binary, unreadable or unparseable file, or missing symbol.
pub fn check_call_site(site: &CallSite) -> Result<(), PreflightError> {
    let path = &site.binary;
    if !path.is_file() {
        return Err(PreflightError::BinaryNotFound(path.clone()));
    }
    let data = std::fs::read(path)
        .map_err(|source| PreflightError::Unreadable { path: path.clone(), source })?;
    let obj = object::File::parse(&*data).map_err(|e| PreflightError::NotAnObject {
        path: path.clone(),
        reason: e.to_string(),
    })?;

    let found = obj
        .symbols()
        .chain(obj.dynamic_symbols())
        .any(|sym| sym.is_definition() && sym.name().is_ok_and(|n| n == site.symbol));
    if found {
        Ok(())
    } else {
        Err(PreflightError::SymbolNotFound { symbol: site.symbol.clone(), binary: path.clone() })
    }
}

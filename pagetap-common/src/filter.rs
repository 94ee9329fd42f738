//! Target filter.
//!
//! Decides whether the current thread (and, for page faults, the object backing
//! the faulting mapping) is in scope. Names are compared as fixed-length,
//! NUL-padded byte arrays: exact equality, no prefix or wildcard semantics.
//! Every loop runs a constant number of iterations.

use crate::{TargetSpec, COMM_LEN, NAME_LEN};

/// Identity of the thread a handler is running on.
#[derive(Clone, Copy, Debug)]
pub struct ThreadIdentity<'a> {
    pub pid: u32,
    pub comm: &'a [u8; COMM_LEN],
    /// Object name of the faulting mapping; `None` for anonymous mappings or
    /// when the name could not be read.
    pub object: Option<&'a [u8; NAME_LEN]>,
}

/// Full filter: process dimensions and object name.
///
/// An empty spec matches unconditionally.
#[must_use]
pub fn matches(identity: &ThreadIdentity<'_>, spec: &TargetSpec) -> bool {
    matches_process(identity.pid, identity.comm, spec) && matches_object(identity.object, spec)
}

/// Process dimensions only (pid and comm). Used where no mapping exists.
#[must_use]
pub fn matches_process(pid: u32, comm: &[u8; COMM_LEN], spec: &TargetSpec) -> bool {
    if let Some(target) = spec.pid_filter() {
        if target != pid {
            return false;
        }
    }
    !spec.has_comm() || fixed_eq(comm, &spec.comm)
}

/// Object name dimension. A set filter never matches a missing name.
#[must_use]
pub fn matches_object(object: Option<&[u8; NAME_LEN]>, spec: &TargetSpec) -> bool {
    if !spec.has_object() {
        return true;
    }
    match object {
        Some(name) => fixed_eq(name, &spec.object),
        None => false,
    }
}

/// NUL-padded equality over exactly `N` bytes.
///
/// Bytes after the first NUL are treated as padding on both sides, so stale
/// bytes behind a kernel string terminator do not break equality.
#[must_use]
pub fn fixed_eq<const N: usize>(a: &[u8; N], b: &[u8; N]) -> bool {
    let mut a_done = false;
    let mut b_done = false;
    let mut i = 0;
    while i < N {
        let x = if a_done { 0 } else { a[i] };
        let y = if b_done { 0 } else { b[i] };
        if x != y {
            return false;
        }
        a_done |= x == 0;
        b_done |= y == 0;
        i += 1;
    }
    true
}

/// Copy `name` into a NUL-padded fixed array, truncating at `N` bytes.
#[must_use]
pub fn pad_name<const N: usize>(name: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let len = if name.len() < N { name.len() } else { N };
    out[..len].copy_from_slice(&name[..len]);
    out
}

/// Length of a NUL-padded name (index of the first NUL, or `N`).
#[must_use]
pub fn name_len<const N: usize>(name: &[u8; N]) -> usize {
    let mut i = 0;
    while i < N {
        if name[i] == 0 {
            return i;
        }
        i += 1;
    }
    N
}

//! Domain types providing compile-time safety and self-documentation

use std::fmt;

use pagetap_common::ThreadKey;

/// Process ID (TGID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Thread ID
///
/// Kernel-assigned id of a single thread; equal to the [`Pid`] for the main thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// Split a correlation key into its typed halves.
#[must_use]
pub fn split_key(key: ThreadKey) -> (Pid, Tid) {
    (Pid(key.pid), Tid(key.tid))
}

//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Defines the data model shared between the kernel-side fault handlers and the
//! userspace orchestrator. Every type that crosses the boundary is `#[repr(C)]`
//! so the layout is identical on both sides.
//!
//! ## Pipeline
//!
//! 1. **Target filter** ([`filter`]) - gates every handler on pid / comm / object name
//! 2. **Correlator** ([`correlate`]) - links a fault entry to its exit per thread
//! 3. **Page transform** ([`transform`]) - bounded read-modify-write of the faulting page
//! 4. **Events** ([`EventHeader`]) - records streamed through the `EVENTS` ring buffer
//!
//! Everything in this crate is `no_std`, allocation-free and uses loops with a
//! fixed trip count, so it can be compiled into the eBPF object unchanged.
//! [`table::FixedTable`] is the host-side counterpart of the kernel hash map.

#![cfg_attr(not(test), no_std)]

pub mod correlate;
pub mod filter;
pub mod table;
pub mod transform;

// ============================================================================
// Sizes and capacities
// ============================================================================

/// Page granularity used by the transform engine.
pub const PAGE_SIZE: usize = 4096;

/// Mask that rounds an address down to its containing page.
pub const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

/// Upper bound of an event payload. Larger content is truncated.
pub const MAX_PAYLOAD: usize = PAGE_SIZE;

/// Length of a task command name (`TASK_COMM_LEN`).
pub const COMM_LEN: usize = 16;

/// Length of a dentry inline name (`DNAME_INLINE_LEN` on 64-bit kernels).
pub const NAME_LEN: usize = 32;

/// Maximum number of in-flight faults tracked by each correlator table.
///
/// Inserting beyond this bound fails; the handler drops the record silently.
pub const CORRELATOR_CAPACITY: u32 = 8192;

/// Size of the `EVENTS` ring buffer in bytes (must be a power of two multiple of the page size).
pub const EVENT_RING_BYTES: u32 = 4 * 1024 * 1024;

/// Key of the single entry in the `TARGET` and `OFFSETS` configuration maps.
pub const CONFIG_KEY: u32 = 0;

// ============================================================================
// Event kinds and status codes
// ============================================================================

/// `handle_mm_fault` (or call-site) entry accepted by the filter.
pub const EVENT_FAULT_ENTRY: u8 = 1;

/// Non-retry exit matched a pending entry. `address` is page aligned.
pub const EVENT_FAULT_EXIT: u8 = 2;

/// Outcome of reading the faulting page. On success the payload holds the page as read.
pub const EVENT_READ_RESULT: u8 = 3;

/// Outcome of writing the transformed page back.
pub const EVENT_WRITE_RESULT: u8 = 4;

/// Free-form diagnostic. The payload is UTF-8 text.
pub const EVENT_DIAGNOSTIC: u8 = 5;

pub const STATUS_SUCCESS: u8 = 0;
pub const STATUS_FAILURE: u8 = 1;

/// `fault_flag` bits passed to `handle_mm_fault` (include/linux/mm_types.h).
pub mod fault_flags {
    pub const WRITE: u32 = 1 << 0;
    pub const MKWRITE: u32 = 1 << 1;
    pub const ALLOW_RETRY: u32 = 1 << 2;
    pub const RETRY_NOWAIT: u32 = 1 << 3;
    pub const KILLABLE: u32 = 1 << 4;
    /// Set when the fault is being retried; only the first attempt is recorded.
    pub const TRIED: u32 = 1 << 5;
    pub const USER: u32 = 1 << 6;
    pub const REMOTE: u32 = 1 << 7;
    pub const INSTRUCTION: u32 = 1 << 8;
    pub const INTERRUPTIBLE: u32 = 1 << 9;

    /// Flag names in bit order, for rendering.
    pub const NAMES: [(u32, &str); 10] = [
        (WRITE, "WRITE"),
        (MKWRITE, "MKWRITE"),
        (ALLOW_RETRY, "ALLOW_RETRY"),
        (RETRY_NOWAIT, "RETRY_NOWAIT"),
        (KILLABLE, "KILLABLE"),
        (TRIED, "TRIED"),
        (USER, "USER"),
        (REMOTE, "REMOTE"),
        (INSTRUCTION, "INSTRUCTION"),
        (INTERRUPTIBLE, "INTERRUPTIBLE"),
    ];

    #[must_use]
    pub const fn is_retry(flags: u32) -> bool {
        flags & TRIED != 0
    }
}

/// `vm_fault_t` bits returned by `handle_mm_fault` (include/linux/mm_types.h).
pub mod vm_fault {
    pub const OOM: u32 = 0x0001;
    pub const SIGBUS: u32 = 0x0002;
    pub const MAJOR: u32 = 0x0004;
    pub const HWPOISON: u32 = 0x0010;
    pub const HWPOISON_LARGE: u32 = 0x0020;
    pub const SIGSEGV: u32 = 0x0040;
    pub const NOPAGE: u32 = 0x0100;
    pub const LOCKED: u32 = 0x0200;
    /// The fault will be retried; the exit is not final.
    pub const RETRY: u32 = 0x0400;
    pub const FALLBACK: u32 = 0x0800;
    pub const DONE_COW: u32 = 0x1000;
    pub const NEEDDSYNC: u32 = 0x2000;
    pub const COMPLETED: u32 = 0x4000;

    pub const NAMES: [(u32, &str); 13] = [
        (OOM, "OOM"),
        (SIGBUS, "SIGBUS"),
        (MAJOR, "MAJOR"),
        (HWPOISON, "HWPOISON"),
        (HWPOISON_LARGE, "HWPOISON_LARGE"),
        (SIGSEGV, "SIGSEGV"),
        (NOPAGE, "NOPAGE"),
        (LOCKED, "LOCKED"),
        (RETRY, "RETRY"),
        (FALLBACK, "FALLBACK"),
        (DONE_COW, "DONE_COW"),
        (NEEDDSYNC, "NEEDDSYNC"),
        (COMPLETED, "COMPLETED"),
    ];

    #[must_use]
    pub const fn is_retry(ret: u32) -> bool {
        ret & RETRY != 0
    }
}

// ============================================================================
// Probe statistics
// ============================================================================

/// Index into the per-CPU `STATS` array.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatIndex {
    EntrySeen = 0,
    EntryFiltered = 1,
    EntryRetry = 2,
    CapacityDropped = 3,
    ExitMatched = 4,
    ExitRetry = 5,
    ExitUnmatched = 6,
    RingDropped = 7,
}

impl StatIndex {
    pub const COUNT: u32 = 8;

    pub const ALL: [StatIndex; 8] = [
        StatIndex::EntrySeen,
        StatIndex::EntryFiltered,
        StatIndex::EntryRetry,
        StatIndex::CapacityDropped,
        StatIndex::ExitMatched,
        StatIndex::ExitRetry,
        StatIndex::ExitUnmatched,
        StatIndex::RingDropped,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            StatIndex::EntrySeen => "entry_seen",
            StatIndex::EntryFiltered => "entry_filtered",
            StatIndex::EntryRetry => "entry_retry",
            StatIndex::CapacityDropped => "capacity_dropped",
            StatIndex::ExitMatched => "exit_matched",
            StatIndex::ExitRetry => "exit_retry",
            StatIndex::ExitUnmatched => "exit_unmatched",
            StatIndex::RingDropped => "ring_dropped",
        }
    }
}

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Correlation key: one live thread.
///
/// Built from `bpf_get_current_pid_tgid()`: the upper half is the process id
/// (TGID), the lower half the thread id.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ThreadKey {
    pub pid: u32,
    pub tid: u32,
}

impl ThreadKey {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_pid_tgid(pid_tgid: u64) -> Self {
        Self { pid: (pid_tgid >> 32) as u32, tid: pid_tgid as u32 }
    }
}

/// Fault recorded at entry, waiting for its matching exit.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingFault {
    /// Faulting address as passed to the handler (not yet page aligned).
    pub address: u64,

    /// `bpf_ktime_get_ns()` at entry.
    pub captured_at_ns: u64,
}

/// Fixed header of every record in the `EVENTS` ring buffer.
///
/// Followed by `payload_len` payload bytes when the record was emitted as a
/// [`PageEvent`]; header-only records carry `payload_len == 0`.
///
/// **Size**: 32 bytes, no implicit padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventHeader {
    /// One of the `EVENT_*` constants.
    pub kind: u8,

    /// [`STATUS_SUCCESS`] or [`STATUS_FAILURE`].
    pub status: u8,

    /// Number of valid payload bytes, never above [`MAX_PAYLOAD`].
    pub payload_len: u16,

    /// Process id (TGID).
    pub pid: u32,

    /// Thread id.
    pub tid: u32,

    /// Kind-specific auxiliary value:
    /// - `FaultEntry`: `fault_flags` argument
    /// - `FaultExit`: `vm_fault_t` return value
    /// - `ReadResult` / `WriteResult` failure: negative helper errno
    pub aux: u32,

    /// Fault address (page aligned from `FaultExit` on).
    pub address: u64,

    /// `bpf_ktime_get_ns()` when the record was produced.
    pub timestamp_ns: u64,
}

impl EventHeader {
    #[must_use]
    pub const fn new(kind: u8, key: ThreadKey, address: u64, timestamp_ns: u64) -> Self {
        Self {
            kind,
            status: STATUS_SUCCESS,
            payload_len: 0,
            pid: key.pid,
            tid: key.tid,
            aux: 0,
            address,
            timestamp_ns,
        }
    }

    #[must_use]
    pub const fn thread_key(&self) -> ThreadKey {
        ThreadKey { pid: self.pid, tid: self.tid }
    }
}

/// Length of [`EventHeader`] on the wire.
pub const EVENT_HEADER_LEN: usize = core::mem::size_of::<EventHeader>();

/// Header plus a full page of payload. Reserved directly in the ring buffer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PageEvent {
    pub header: EventHeader,
    pub payload: [u8; MAX_PAYLOAD],
}

/// Header plus a short NUL-padded name (object name or diagnostic text).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NameEvent {
    pub header: EventHeader,
    pub name: [u8; NAME_LEN],
}

/// Per-CPU scratch page used by the transform engine (too large for the BPF stack).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PageBuf {
    pub bytes: [u8; PAGE_SIZE],
}

/// Target filter configuration, written by userspace at key [`CONFIG_KEY`] of `TARGET`.
///
/// An unset dimension matches everything. Names are fixed-length and
/// NUL-padded; an all-zero name is unset.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetSpec {
    /// Process id to match (valid only when `has_pid != 0`).
    pub pid: u32,

    pub has_pid: u8,

    /// Padding for 4-byte alignment
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 3],

    /// Task command name (`comm`).
    pub comm: [u8; COMM_LEN],

    /// Inline name of the file backing the faulting mapping.
    pub object: [u8; NAME_LEN],
}

impl Default for TargetSpec {
    fn default() -> Self {
        Self::match_all()
    }
}

impl TargetSpec {
    #[must_use]
    pub const fn match_all() -> Self {
        Self { pid: 0, has_pid: 0, _padding: [0; 3], comm: [0; COMM_LEN], object: [0; NAME_LEN] }
    }

    #[must_use]
    pub const fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self.has_pid = 1;
        self
    }

    /// Set the process name. Input longer than [`COMM_LEN`] is truncated.
    #[must_use]
    pub fn with_comm(mut self, name: &[u8]) -> Self {
        self.comm = filter::pad_name(name);
        self
    }

    /// Set the object name. Input longer than [`NAME_LEN`] is truncated.
    #[must_use]
    pub fn with_object(mut self, name: &[u8]) -> Self {
        self.object = filter::pad_name(name);
        self
    }

    #[must_use]
    pub const fn pid_filter(&self) -> Option<u32> {
        if self.has_pid != 0 {
            Some(self.pid)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn has_comm(&self) -> bool {
        self.comm[0] != 0
    }

    #[must_use]
    pub const fn has_object(&self) -> bool {
        self.object[0] != 0
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.has_pid == 0 && !self.has_comm() && !self.has_object()
    }
}

/// Byte offsets used to walk `vma->vm_file->f_path.dentry->d_iname`.
///
/// These depend on the running kernel build (`pahole` prints them). All-zero
/// means the object name cannot be resolved.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelOffsets {
    /// `offsetof(struct vm_area_struct, vm_file)`
    pub vm_file: u32,

    /// `offsetof(struct file, f_path) + offsetof(struct path, dentry)`
    pub f_path_dentry: u32,

    /// `offsetof(struct dentry, d_iname)`
    pub d_iname: u32,

    /// Padding for 8-byte alignment
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: u32,
}

impl KernelOffsets {
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.vm_file != 0 && self.d_iname != 0
    }
}

#[cfg(feature = "user")]
use aya::Pod;

// These unsafe impls are required for eBPF <-> userspace communication
// Pod trait ensures types can be safely transmitted as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for ThreadKey {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for PendingFault {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for EventHeader {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for TargetSpec {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for KernelOffsets {}

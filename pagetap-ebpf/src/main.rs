//! # eBPF Kernel-Side Fault Interception
//!
//! eBPF programs that intercept page faults of a selected process and rewrite
//! the faulting page once the fault has been resolved.
//!
//! ## Programs
//!
//! - **Kprobe**: `fault_entry` on `handle_mm_fault` - filter + record the fault address per thread
//! - **Kretprobe**: `fault_exit` on `handle_mm_fault` - correlate, then read/transform/write the page
//! - **Uprobe / Uretprobe**: `call_site_entry` / `call_site_exit` - same pipeline for a
//!   user-space function whose first argument is an address
//!
//! ## Maps (Shared with Userspace)
//!
//! - `EVENTS` - Ring buffer (4MB) for the event stream
//! - `FAULT_PENDING` / `CALL_PENDING` - Correlator tables (ThreadKey → PendingFault)
//! - `TARGET` - Target filter
//! - `OFFSETS` - Kernel struct offsets for object name resolution
//! - `PAGE_SCRATCH` - Per-CPU page buffer
//! - `STATS` - Per-CPU counters
//!
//! ## Build
//!
//! ```bash
//! cargo xtask build-ebpf --release
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    bpf_printk,
    cty::c_void,
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read_kernel,
        bpf_probe_read_kernel_buf, bpf_probe_read_user_buf, gen,
    },
    macros::{kprobe, kretprobe, map, uprobe, uretprobe},
    maps::{HashMap, PerCpuArray, RingBuf},
    programs::{ProbeContext, RetProbeContext},
    EbpfContext,
};
use aya_log_ebpf::{debug, warn};
use pagetap_common::{
    correlate::{on_entry, on_exit, EntryOutcome, ExitOutcome, PendingStore, StoreFull},
    fault_flags,
    filter::{matches_object, matches_process, name_len, pad_name},
    transform::{interpose, PageAccess, StepRecord},
    vm_fault, EventHeader, KernelOffsets, NameEvent, PageBuf, PageEvent, PendingFault, StatIndex,
    TargetSpec, ThreadKey, COMM_LEN, CONFIG_KEY, CORRELATOR_CAPACITY, EVENT_DIAGNOSTIC,
    EVENT_FAULT_ENTRY, EVENT_FAULT_EXIT, EVENT_READ_RESULT, EVENT_RING_BYTES, EVENT_WRITE_RESULT,
    NAME_LEN, PAGE_SIZE, STATUS_FAILURE, STATUS_SUCCESS,
};

// bpf_probe_write_user and bpf_trace_printk are GPL-only helpers.
#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";

// ============================================================================
// eBPF Maps - Shared data structures between kernel and userspace
// ============================================================================

/// Ring buffer for sending events to userspace
///
/// - **Size**: 4MB
/// - **On full**: the producer drops the record and bumps `RingDropped`
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(EVENT_RING_BYTES, 0);

/// Map: ThreadKey → fault recorded by `fault_entry`
///
/// At most one pending fault per thread; a new entry overwrites the old one.
/// Inserts of new keys fail once `CORRELATOR_CAPACITY` threads are pending.
#[map]
static FAULT_PENDING: HashMap<ThreadKey, PendingFault> =
    HashMap::with_max_entries(CORRELATOR_CAPACITY, 0);

/// Map: ThreadKey → address recorded by `call_site_entry`
#[map]
static CALL_PENDING: HashMap<ThreadKey, PendingFault> =
    HashMap::with_max_entries(CORRELATOR_CAPACITY, 0);

/// Target filter, written by userspace before the programs are loaded.
/// A missing entry matches every thread.
#[map]
static TARGET: HashMap<u32, TargetSpec> = HashMap::with_max_entries(1, 0);

/// Struct offsets for `vma->vm_file->f_path.dentry->d_iname`.
#[map]
static OFFSETS: HashMap<u32, KernelOffsets> = HashMap::with_max_entries(1, 0);

/// Page buffer; 4KB does not fit on the 512-byte BPF stack.
#[map]
static PAGE_SCRATCH: PerCpuArray<PageBuf> = PerCpuArray::with_max_entries(1, 0);

/// Counters indexed by `StatIndex`. Per-CPU, so increments need no atomics.
#[map]
static STATS: PerCpuArray<u64> = PerCpuArray::with_max_entries(StatIndex::COUNT, 0);

// ============================================================================
// Correlator store
// ============================================================================

/// Kernel hash map as a correlator table. The map operations are atomic; the
/// get+delete pair in `take` only races with the owning thread itself, which
/// cannot run two faults at once.
struct MapStore(&'static HashMap<ThreadKey, PendingFault>);

impl PendingStore for MapStore {
    fn put(&mut self, key: &ThreadKey, pending: &PendingFault) -> Result<(), StoreFull> {
        // BPF_ANY: create or overwrite. Fails with -E2BIG once the map is full.
        self.0.insert(key, pending, 0).map_err(|_| StoreFull)
    }

    fn take(&mut self, key: &ThreadKey) -> Option<PendingFault> {
        let pending = unsafe { self.0.get(key).copied() }?;
        let _ = self.0.remove(key);
        Some(pending)
    }
}

// ============================================================================
// eBPF Program Hooks
// ============================================================================

/// Hook: `handle_mm_fault(vma, address, flags, regs)` entry
#[kprobe]
pub fn fault_entry(ctx: ProbeContext) -> u32 {
    // Handlers cannot report failure upward.
    let _ = try_fault_entry(&ctx);
    0
}

fn try_fault_entry(ctx: &ProbeContext) -> Result<(), i64> {
    bump(StatIndex::EntrySeen);

    let vma: *const u8 = ctx.arg(0).ok_or(1i64)?;
    let address: u64 = ctx.arg(1).ok_or(1i64)?;
    let flags: u32 = ctx.arg(2).ok_or(1i64)?;

    let key = current_key();
    let spec = target_spec();
    if !matches_process(key.pid, &current_comm(), &spec) {
        bump(StatIndex::EntryFiltered);
        return Ok(());
    }

    let mut object = [0u8; NAME_LEN];
    let resolved = match read_object_name(vma, &mut object) {
        Ok(found) => found,
        Err(errno) => {
            if spec.has_object() {
                emit_named(EVENT_DIAGNOSTIC, key, address, errno, b"object name read failed");
            }
            false
        }
    };
    if !matches_object(resolved.then_some(&object), &spec) {
        bump(StatIndex::EntryFiltered);
        return Ok(());
    }

    let pending = PendingFault { address, captured_at_ns: unsafe { bpf_ktime_get_ns() } };
    match on_entry(
        &mut MapStore(&FAULT_PENDING),
        &key,
        &pending,
        fault_flags::is_retry(flags),
    ) {
        EntryOutcome::Recorded => {}
        EntryOutcome::Retry => {
            bump(StatIndex::EntryRetry);
            return Ok(());
        }
        EntryOutcome::Dropped => {
            bump(StatIndex::CapacityDropped);
            return Ok(());
        }
    }

    debug!(ctx, "fault entry tid={} address={:x} flags={:x}", key.tid, address, flags);
    unsafe {
        bpf_printk!(b"handle_mm_fault: tid %d, address %lx, flags %x", key.tid, address, flags);
    }

    let mut header = EventHeader::new(EVENT_FAULT_ENTRY, key, address, pending.captured_at_ns);
    header.aux = flags;
    emit_name_event(header, &object);
    Ok(())
}

/// Hook: `handle_mm_fault` return
#[kretprobe]
pub fn fault_exit(ctx: RetProbeContext) -> u32 {
    let _ = try_fault_exit(&ctx);
    0
}

fn try_fault_exit(ctx: &RetProbeContext) -> Result<(), i64> {
    let ret: u32 = ctx.ret().ok_or(1i64)?;

    let key = current_key();
    if !matches_process(key.pid, &current_comm(), &target_spec()) {
        return Ok(());
    }

    match on_exit(&mut MapStore(&FAULT_PENDING), &key, vm_fault::is_retry(ret)) {
        ExitOutcome::Matched { page, .. } => {
            bump(StatIndex::ExitMatched);
            debug!(ctx, "fault exit tid={} page={:x} ret={:x}", key.tid, page, ret);
            unsafe {
                bpf_printk!(b"handle_mm_fault_ret: tid %d, address %lx, ret %x", key.tid, page, ret);
            }
            let mut header =
                EventHeader::new(EVENT_FAULT_EXIT, key, page, unsafe { bpf_ktime_get_ns() });
            header.aux = ret;
            emit_header(&header);
            interpose_page(ctx, key, page);
        }
        ExitOutcome::Retry => bump(StatIndex::ExitRetry),
        ExitOutcome::Unmatched => bump(StatIndex::ExitUnmatched),
    }
    Ok(())
}

/// Hook: user-space call site entry; the first argument is the address of interest
#[uprobe]
pub fn call_site_entry(ctx: ProbeContext) -> u32 {
    let _ = try_call_site_entry(&ctx);
    0
}

fn try_call_site_entry(ctx: &ProbeContext) -> Result<(), i64> {
    let address: u64 = ctx.arg(0).ok_or(1i64)?;

    let key = current_key();
    if !matches_process(key.pid, &current_comm(), &target_spec()) {
        return Ok(());
    }

    let pending = PendingFault { address, captured_at_ns: unsafe { bpf_ktime_get_ns() } };
    match on_entry(&mut MapStore(&CALL_PENDING), &key, &pending, false) {
        EntryOutcome::Recorded => {
            emit_header(&EventHeader::new(EVENT_FAULT_ENTRY, key, address, pending.captured_at_ns));
        }
        EntryOutcome::Dropped => bump(StatIndex::CapacityDropped),
        EntryOutcome::Retry => {}
    }
    Ok(())
}

/// Hook: user-space call site return
#[uretprobe]
pub fn call_site_exit(ctx: RetProbeContext) -> u32 {
    let _ = try_call_site_exit(&ctx);
    0
}

fn try_call_site_exit(ctx: &RetProbeContext) -> Result<(), i64> {
    let ret: u64 = ctx.ret().ok_or(1i64)?;

    let key = current_key();
    if let ExitOutcome::Matched { page, .. } = on_exit(&mut MapStore(&CALL_PENDING), &key, false) {
        let mut header =
            EventHeader::new(EVENT_FAULT_EXIT, key, page, unsafe { bpf_ktime_get_ns() });
        #[allow(clippy::cast_possible_truncation)]
        {
            header.aux = ret as u32;
        }
        emit_header(&header);
        interpose_page(ctx, key, page);
    }
    Ok(())
}

// ============================================================================
// Page transform
// ============================================================================

/// User-memory helpers plus the ring buffer, for one thread's cycle.
struct HelperAccess<'a, C> {
    ctx: &'a C,
    key: ThreadKey,
}

impl<C: EbpfContext> PageAccess for HelperAccess<'_, C> {
    fn read_user(&mut self, page: u64, buf: &mut [u8; PAGE_SIZE]) -> Result<(), i64> {
        unsafe { bpf_probe_read_user_buf(page as *const u8, buf) }
    }

    fn write_user(&mut self, page: u64, buf: &[u8; PAGE_SIZE]) -> Result<(), i64> {
        let ret = unsafe {
            gen::bpf_probe_write_user(
                page as *mut c_void,
                buf.as_ptr().cast::<c_void>(),
                PAGE_SIZE as u32,
            )
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(ret)
        }
    }

    fn emit(&mut self, page: u64, record: StepRecord<'_>) {
        let key = self.key;
        match record {
            StepRecord::ReadOk(buf) => emit_page(key, page, buf),
            StepRecord::ReadFailed(errno) => {
                warn!(self.ctx, "read_user({:x}) failed: {}", page, errno);
                unsafe {
                    bpf_printk!(b"read_user(%lx) failed: %ld", page, errno);
                }
                emit_status(EVENT_READ_RESULT, key, page, STATUS_FAILURE, errno);
            }
            StepRecord::Written => {
                unsafe {
                    bpf_printk!(b"write_user(%lx) succeeded", page);
                }
                emit_status(EVENT_WRITE_RESULT, key, page, STATUS_SUCCESS, 0);
            }
            StepRecord::WriteFailed(errno) => {
                warn!(self.ctx, "write_user({:x}) failed: {}", page, errno);
                unsafe {
                    bpf_printk!(b"write_user(%lx) failed: %ld", page, errno);
                }
                emit_status(EVENT_WRITE_RESULT, key, page, STATUS_FAILURE, errno);
            }
        }
    }
}

/// Read → transform → write the page at `page` through the per-CPU scratch buffer.
fn interpose_page<C: EbpfContext>(ctx: &C, key: ThreadKey, page: u64) {
    let Some(scratch) = PAGE_SCRATCH.get_ptr_mut(0) else {
        return;
    };
    let buf = unsafe { &mut (*scratch).bytes };
    interpose(&mut HelperAccess { ctx, key }, page, buf);
}

// ============================================================================
// Event emission - every failure here is a dropped record, never an error
// ============================================================================

fn emit_header(header: &EventHeader) {
    if EVENTS.output(header, 0).is_err() {
        bump(StatIndex::RingDropped);
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn emit_status(kind: u8, key: ThreadKey, page: u64, status: u8, errno: i64) {
    let mut header = EventHeader::new(kind, key, page, unsafe { bpf_ktime_get_ns() });
    header.status = status;
    header.aux = errno as u32;
    emit_header(&header);
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn emit_named(kind: u8, key: ThreadKey, address: u64, aux: i64, text: &[u8]) {
    let mut header = EventHeader::new(kind, key, address, unsafe { bpf_ktime_get_ns() });
    header.status = STATUS_FAILURE;
    header.aux = aux as u32;
    emit_name_event(header, &pad_name(text));
}

#[allow(clippy::cast_possible_truncation)]
fn emit_name_event(mut header: EventHeader, name: &[u8; NAME_LEN]) {
    header.payload_len = name_len(name) as u16;
    let event = NameEvent { header, name: *name };
    if EVENTS.output(&event, 0).is_err() {
        bump(StatIndex::RingDropped);
    }
}

/// ReadResult{Success} carrying the page as read. Reserved in place: the
/// record is too large for the stack.
#[allow(clippy::cast_possible_truncation)]
fn emit_page(key: ThreadKey, page: u64, buf: &[u8; PAGE_SIZE]) {
    let Some(mut entry) = EVENTS.reserve::<PageEvent>(0) else {
        bump(StatIndex::RingDropped);
        return;
    };
    let event = entry.as_mut_ptr();
    unsafe {
        let mut header =
            EventHeader::new(EVENT_READ_RESULT, key, page, bpf_ktime_get_ns());
        header.payload_len = PAGE_SIZE as u16;
        (*event).header = header;
        if bpf_probe_read_kernel_buf(buf.as_ptr(), &mut (*event).payload).is_err() {
            entry.discard(0);
            bump(StatIndex::RingDropped);
            return;
        }
    }
    entry.submit(0);
}

// ============================================================================
// Helpers
// ============================================================================

fn current_key() -> ThreadKey {
    ThreadKey::from_pid_tgid(unsafe { bpf_get_current_pid_tgid() })
}

fn current_comm() -> [u8; COMM_LEN] {
    unsafe { bpf_get_current_comm().unwrap_or([0u8; COMM_LEN]) }
}

fn target_spec() -> TargetSpec {
    unsafe { TARGET.get(&CONFIG_KEY).copied().unwrap_or_else(TargetSpec::match_all) }
}

fn bump(stat: StatIndex) {
    if let Some(counter) = STATS.get_ptr_mut(stat as u32) {
        unsafe { *counter += 1 };
    }
}

/// Resolve the inline dentry name of the file backing `vma`.
///
/// Returns `Ok(false)` for anonymous mappings or when no offsets are configured.
fn read_object_name(vma: *const u8, out: &mut [u8; NAME_LEN]) -> Result<bool, i64> {
    let Some(offsets) = (unsafe { OFFSETS.get(&CONFIG_KEY).copied() }) else {
        return Ok(false);
    };
    if !offsets.is_resolved() || vma.is_null() {
        return Ok(false);
    }

    let file: *const u8 = unsafe {
        bpf_probe_read_kernel(vma.add(offsets.vm_file as usize).cast::<*const u8>())?
    };
    if file.is_null() {
        return Ok(false);
    }

    let dentry: *const u8 = unsafe {
        bpf_probe_read_kernel(file.add(offsets.f_path_dentry as usize).cast::<*const u8>())?
    };
    if dentry.is_null() {
        return Ok(false);
    }

    unsafe { bpf_probe_read_kernel_buf(dentry.add(offsets.d_iname as usize), out)? };
    Ok(true)
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
